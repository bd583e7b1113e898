//! `accel` — bring-up probe for the vertex NPU/DSP driver.
//!
//! ```text
//! USAGE:
//!   accel probe                         Open and close the device node
//!   accel boot --target npu|dsp         Issue BOOTUP on a fresh session
//!   accel presets [--file <path>]       List the preset scenarios
//!   accel formats --n --c --h --w       Print the aligned S_FORMAT values
//! ```
//!
//! `ACCEL_DEVICE` and the other `LinkConfig` variables apply; `--software`
//! runs against the in-process device instead of the kernel.

use accel_driver::backend::DriverFault;
use accel_driver::session::{input_formats, output_formats, FeatureMap, ModelInfo};
use accel_driver::userdriver::CELL_ALIGN;
use accel_driver::{
    Accelerator, KernelDevice, LinkConfig, PresetTable, Shape, SoftwareDevice, Vs4lDevice,
    Vs4lRequest,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use vs4l_abi::wire::vs4l_ctrl;

#[derive(Parser)]
#[command(name = "accel", about = "Vertex NPU/DSP bring-up CLI", version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use the in-process software device.
    #[arg(long, global = true)]
    software: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Npu,
    Dsp,
}

impl From<Target> for Accelerator {
    fn from(t: Target) -> Self {
        match t {
            Target::Npu => Accelerator::Npu,
            Target::Dsp => Accelerator::Dsp,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Open and close one session on the device node.
    Probe,
    /// Boot an accelerator on a fresh session.
    Boot {
        /// Accelerator to boot.
        #[arg(long, value_enum)]
        target: Target,
    },
    /// List the preset scenarios.
    Presets {
        /// Preset file (defaults to the configured one).
        #[arg(long)]
        file: Option<std::path::PathBuf>,
    },
    /// Print the S_FORMAT values for one input and one output feature map.
    Formats {
        /// Batch.
        #[arg(long, default_value_t = 1)]
        n: u32,
        /// Channels.
        #[arg(long)]
        c: u32,
        /// Height.
        #[arg(long)]
        h: u32,
        /// Width.
        #[arg(long)]
        w: u32,
        /// Accelerator whose data format to use.
        #[arg(long, value_enum, default_value = "npu")]
        target: Target,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let config = LinkConfig::from_env();
    let device: Box<dyn Vs4lDevice> = if cli.software {
        Box::new(SoftwareDevice::new())
    } else {
        Box::new(KernelDevice::new(&config.device_path))
    };
    debug!("device {} at {}", device.device_type(), config.device_path.display());

    match cli.command {
        Cmd::Probe => cmd_probe(device.as_ref(), &config)?,
        Cmd::Boot { target } => cmd_boot(device.as_ref(), target.into())?,
        Cmd::Presets { file } => cmd_presets(&file.unwrap_or(config.preset_file))?,
        Cmd::Formats { n, c, h, w, target } => cmd_formats(Shape::new(n, c, h, w, 1), target.into()),
    }

    Ok(())
}

fn fault(what: &str, f: DriverFault) -> anyhow::Error {
    anyhow!("{what} failed: ret {}, errno {}", f.ret, f.errno)
}

fn cmd_probe(device: &dyn Vs4lDevice, config: &LinkConfig) -> Result<()> {
    let fd = device
        .open()
        .map_err(|f| fault("open", f))
        .with_context(|| format!("probing {}", config.device_path.display()))?;
    println!("Opened {} as fd {fd}", config.device_path.display());
    device.close(fd).map_err(|f| fault("close", f))?;
    println!("Closed fd {fd}");
    Ok(())
}

fn cmd_boot(device: &dyn Vs4lDevice, accel: Accelerator) -> Result<()> {
    let fd = device.open().map_err(|f| fault("open", f))?;
    let mut request = Vs4lRequest::Bootup(vs4l_ctrl {
        ctrl: 0,
        value: accel.hwdev(),
    });
    let booted = device
        .ioctl(fd, &mut request)
        .map_err(|f| fault("BOOTUP", f))
        .with_context(|| format!("booting the {accel}"));
    device.close(fd).map_err(|f| fault("close", f))?;
    booted?;
    info!("{accel} booted on fd {fd}");
    println!("{accel} booted");
    Ok(())
}

fn cmd_presets(path: &std::path::Path) -> Result<()> {
    let table = PresetTable::load(path)
        .with_context(|| format!("loading presets from {}", path.display()))?;

    println!("Presets: {} ({})", table.len(), path.display());
    for p in table.iter() {
        println!("[{:#x}] {}  priority {}  type {}", p.id, p.name, p.priority, p.preset_type);
        println!(
            "     NPU {}  DNC {}  DSP {}  MIF {}  INT {}",
            p.npu_freq, p.dnc_freq, p.dsp_freq, p.mif_freq, p.int_freq
        );
        println!(
            "     CPU {}/{}/{}  MO {}  affinity {}  kpi {}",
            p.cpu_lit_freq, p.cpu_mid_freq, p.cpu_big_freq, p.mo_scenario, p.cpu_affinity, p.dd_kpi_mode
        );
    }
    Ok(())
}

fn cmd_formats(shape: Shape, accel: Accelerator) {
    let fm = FeatureMap {
        shape,
        buffer_index: 0,
        bpp: 8 * shape.type_size,
    };
    let mut info = ModelInfo::new(1, 1, Vec::<u8>::new());
    info.inputs.push(fm);
    info.outputs.push(fm);
    info.cell_align = CELL_ALIGN;

    for (direction, formats) in [
        ("in ", input_formats(&info, accel)),
        ("out", output_formats(&info, accel)),
    ] {
        for f in formats {
            println!(
                "{direction} target {}  format {:#010x}  {}x{}  channels {}  bpp {}",
                f.target, f.format, f.width, f.height, f.channels, f.pixel_format
            );
        }
    }
}
