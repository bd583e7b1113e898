//! Device abstraction for the vertex driver
//!
//! Every syscall the runtime makes against `/dev/vertex*` goes through
//! [`Vs4lDevice`]. Requests are owned values so a call can be handed to a
//! watchdog thread and outlive a caller that gave up waiting on it.

use std::fmt::Debug;
use std::os::unix::io::RawFd;

use libc::c_ulong;
use vs4l_abi::ioctl;
use vs4l_abi::param::{ERR_LOAD_CANT_ALLOC_CMD_LENGTH, ERR_LOAD_SEQ_ALLOC, EMERGENCY_RECOVERY};
use vs4l_abi::wire::{
    drv_usr_share, hwdev, vs4l_ctrl, vs4l_format, vs4l_param, vs4l_roi, vs4l_sched_param,
    VS4L_DF_IMAGE_DSP, VS4L_DF_IMAGE_NPU,
};

/// Raw outcome of a failed device call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverFault {
    /// Return value of the syscall
    pub ret: i32,
    /// errno after the syscall
    pub errno: i32,
}

impl DriverFault {
    /// Create a fault from a return value and errno
    pub const fn new(ret: i32, errno: i32) -> Self {
        Self { ret, errno }
    }

    /// The driver asks the caller to keep its previous setting
    #[allow(clippy::cast_sign_loss)]
    pub const fn is_emergency_recovery(&self) -> bool {
        self.ret as u32 == EMERGENCY_RECOVERY
    }

    /// Firmware could not allocate SRAM for the graph
    pub const fn is_sram_full(&self) -> bool {
        self.errno == ERR_LOAD_CANT_ALLOC_CMD_LENGTH || self.errno == ERR_LOAD_SEQ_ALLOC
    }

    /// Nothing to dequeue yet
    pub const fn would_block(&self) -> bool {
        self.errno == libc::EWOULDBLOCK
    }
}

/// Result of one device call
pub type DeviceResult<T> = std::result::Result<T, DriverFault>;

/// Accelerator behind a vertex device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accelerator {
    /// Neural processing unit
    Npu,
    /// Digital signal processor
    Dsp,
}

impl Accelerator {
    /// BOOTUP selector
    pub const fn hwdev(self) -> u32 {
        match self {
            Self::Npu => hwdev::NPU,
            Self::Dsp => hwdev::DSP,
        }
    }

    /// S_FORMAT data format for feature maps
    pub const fn data_format(self) -> u32 {
        match self {
            Self::Npu => VS4L_DF_IMAGE_NPU,
            Self::Dsp => VS4L_DF_IMAGE_DSP,
        }
    }
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Npu => write!(f, "NPU"),
            Self::Dsp => write!(f, "DSP"),
        }
    }
}

// ── Owned request payloads ───────────────────────────────────────────────────

/// S_GRAPH payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphFrame {
    /// Graph priority
    pub priority: u32,
    /// Share block; the driver writes `id`
    pub share: drv_usr_share,
}

/// S_FORMAT payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatList {
    /// Direction
    pub direction: u32,
    /// One entry per feature map
    pub formats: Vec<vs4l_format>,
}

/// DSP kernel name table for S_PARAM `DSP_KERNEL`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelNames {
    /// `[u32 len; count]` followed by NUL-terminated names
    pub table: Vec<u8>,
    /// Number of names
    pub count: u32,
}

/// One buffer (tile) of a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFrame {
    /// Tile window
    pub roi: vs4l_roi,
    /// dma-buf fd
    pub fd: RawFd,
    /// Mapped address of the buffer
    pub addr: u64,
}

/// One feature map of a container list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFrame {
    /// `VS4L_BUFFER_LIST` or `VS4L_BUFFER_ROI`
    pub buffer_type: u32,
    /// Feature-map index
    pub target: u32,
    /// Memory kind
    pub memory: u32,
    /// Tiles
    pub buffers: Vec<BufferFrame>,
}

/// QBUF / DQBUF / PREPARE payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerListFrame {
    /// Direction
    pub direction: u32,
    /// Frame id
    pub id: u32,
    /// Slot index
    pub index: u32,
    /// `cl_flag` bits
    pub flags: u32,
    /// Feature maps
    pub containers: Vec<ContainerFrame>,
}

impl ContainerListFrame {
    /// Empty frame for a DQBUF in `direction`
    pub fn dequeue(direction: u32) -> Self {
        Self {
            direction,
            ..Self::default()
        }
    }
}

/// One VS4L command with its argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vs4lRequest {
    /// Boot the hardware block
    Bootup(vs4l_ctrl),
    /// Load a graph
    SetGraph(GraphFrame),
    /// Describe feature maps
    SetFormat(FormatList),
    /// Performance parameters
    SetParam(Vec<vs4l_param>),
    /// DSP kernel names
    SetKernel(KernelNames),
    /// Priority and boundness
    SchedParam(vs4l_sched_param),
    /// Start streaming
    StreamOn,
    /// Stop streaming
    StreamOff,
    /// Pre-bind a container list
    Prepare(ContainerListFrame),
    /// Queue a container list
    Qbuf(ContainerListFrame),
    /// Dequeue; the driver fills index, id and flags
    Dqbuf(ContainerListFrame),
}

impl Vs4lRequest {
    /// Short request name for logs and errors
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bootup(_) => "BOOTUP",
            Self::SetGraph(_) => "S_GRAPH",
            Self::SetFormat(_) => "S_FORMAT",
            Self::SetParam(_) | Self::SetKernel(_) => "S_PARAM",
            Self::SchedParam(_) => "SCHED_PARAM",
            Self::StreamOn => "STREAM_ON",
            Self::StreamOff => "STREAM_OFF",
            Self::Prepare(_) => "PREPARE",
            Self::Qbuf(_) => "QBUF",
            Self::Dqbuf(_) => "DQBUF",
        }
    }

    /// ioctl request number
    pub const fn command(&self) -> c_ulong {
        match self {
            Self::Bootup(_) => ioctl::VS4L_VERTEXIOC_BOOTUP,
            Self::SetGraph(_) => ioctl::VS4L_VERTEXIOC_S_GRAPH,
            Self::SetFormat(_) => ioctl::VS4L_VERTEXIOC_S_FORMAT,
            Self::SetParam(_) | Self::SetKernel(_) => ioctl::VS4L_VERTEXIOC_S_PARAM,
            Self::SchedParam(_) => ioctl::VS4L_VERTEXIOC_SCHED_PARAM,
            Self::StreamOn => ioctl::VS4L_VERTEXIOC_STREAM_ON,
            Self::StreamOff => ioctl::VS4L_VERTEXIOC_STREAM_OFF,
            Self::Prepare(_) => ioctl::VS4L_VERTEXIOC_PREPARE,
            Self::Qbuf(_) => ioctl::VS4L_VERTEXIOC_QBUF,
            Self::Dqbuf(_) => ioctl::VS4L_VERTEXIOC_DQBUF,
        }
    }
}

/// Vertex device: open, close and ioctl
///
/// Implementations must be callable from any thread; the watchdog runs each
/// call on its own thread.
pub trait Vs4lDevice: Debug + Send + Sync {
    /// Open a new session on the device node
    ///
    /// # Errors
    ///
    /// Returns the raw fault if the node cannot be opened.
    fn open(&self) -> DeviceResult<RawFd>;

    /// Close a session fd
    ///
    /// # Errors
    ///
    /// Returns the raw fault if close(2) fails.
    fn close(&self, fd: RawFd) -> DeviceResult<()>;

    /// Issue one VS4L request; results written by the driver are copied back
    /// into `request`
    ///
    /// # Errors
    ///
    /// Returns the raw fault for a nonzero ioctl return.
    fn ioctl(&self, fd: RawFd, request: &mut Vs4lRequest) -> DeviceResult<()>;

    /// Backend type for debugging
    fn device_type(&self) -> DeviceType;
}

/// Device implementation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Kernel vertex driver
    Kernel,
    /// In-process VS4L model, no hardware required
    Software,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kernel => write!(f, "Kernel"),
            Self::Software => write!(f, "Software (virtual vertex)"),
        }
    }
}
