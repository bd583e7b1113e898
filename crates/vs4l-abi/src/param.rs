//! S_PARAM target space, performance modes and driver status codes.

// ── Prefer targets ───────────────────────────────────────────────────────────

/// `vs4l_param::target` values understood by the vertex driver.
///
/// QoS targets take the requested frequency (kHz) in `offset`.
pub mod target {
    /// Firmware unit-test load.
    pub const FW_UTC_LOAD: u32 = 0x78_0000;
    /// Firmware unit-test execute.
    pub const FW_UTC_EXECUTE: u32 = 0x78_0001;

    /// NPU minimum frequency.
    pub const QOS_NPU: u32 = 0x88_0000;
    /// DSP minimum frequency.
    pub const QOS_DSP: u32 = 0x88_0001;
    /// Memory interface minimum frequency.
    pub const QOS_MIF: u32 = 0x88_0002;
    /// Internal bus minimum frequency.
    pub const QOS_INT: u32 = 0x88_0003;
    /// DNC minimum frequency.
    pub const QOS_DNC: u32 = 0x88_0004;
    /// NPU maximum frequency.
    pub const QOS_NPU_MAX: u32 = 0x88_0005;
    /// DSP maximum frequency.
    pub const QOS_DSP_MAX: u32 = 0x88_0006;
    /// Memory interface maximum frequency.
    pub const QOS_MIF_MAX: u32 = 0x88_0007;
    /// Internal bus maximum frequency.
    pub const QOS_INT_MAX: u32 = 0x88_0008;
    /// DNC maximum frequency.
    pub const QOS_DNC_MAX: u32 = 0x88_0009;

    /// Little CPU cluster minimum frequency.
    pub const QOS_CL0: u32 = 0x89_0000;
    /// Mid CPU cluster minimum frequency.
    pub const QOS_CL1: u32 = 0x89_0001;
    /// Big CPU cluster minimum frequency.
    pub const QOS_CL2: u32 = 0x89_0002;
    /// Little CPU cluster maximum frequency.
    pub const QOS_CL0_MAX: u32 = 0x89_0003;
    /// Mid CPU cluster maximum frequency.
    pub const QOS_CL1_MAX: u32 = 0x89_0004;
    /// Big CPU cluster maximum frequency.
    pub const QOS_CL2_MAX: u32 = 0x89_0005;
    /// CPU affinity mask.
    pub const CPU_AFF: u32 = 0x89_0006;

    /// Preset scenario marker. The preset targets follow in order.
    pub const IS_PRESET: u32 = 0x89_1000;
    /// NPU preset frequency.
    pub const QOS_NPU_PRESET: u32 = IS_PRESET + 1;
    /// DSP preset frequency.
    pub const QOS_DSP_PRESET: u32 = IS_PRESET + 2;
    /// MIF preset frequency.
    pub const QOS_MIF_PRESET: u32 = IS_PRESET + 3;
    /// INT preset frequency.
    pub const QOS_INT_PRESET: u32 = IS_PRESET + 4;
    /// Little cluster preset frequency.
    pub const QOS_CL0_PRESET: u32 = IS_PRESET + 5;
    /// Mid cluster preset frequency.
    pub const QOS_CL1_PRESET: u32 = IS_PRESET + 6;
    /// Big cluster preset frequency.
    pub const QOS_CL2_PRESET: u32 = IS_PRESET + 7;
    /// Memory-ordering scenario.
    pub const QOS_MO_SCEN_PRESET: u32 = IS_PRESET + 8;
    /// CPU affinity preset.
    pub const QOS_CPU_AFF_PRESET: u32 = IS_PRESET + 9;
    /// Application id.
    pub const QOS_APP_ID: u32 = IS_PRESET + 10;
    /// Model id.
    pub const QOS_MODEL_ID: u32 = IS_PRESET + 11;
    /// Subgraph id.
    pub const QOS_SUBGRAPH_ID: u32 = IS_PRESET + 12;
    /// Model name.
    pub const QOS_MODEL_NAME: u32 = IS_PRESET + 13;
    /// GPU preset frequency.
    pub const QOS_GPU_PRESET: u32 = IS_PRESET + 14;
    /// Little cluster idle hint, 0 or 1.
    pub const QOS_CL0_IDLE_PRESET: u32 = IS_PRESET + 15;
    /// Mid cluster idle hint, 0 or 1.
    pub const QOS_CL1_IDLE_PRESET: u32 = IS_PRESET + 16;
    /// Big cluster idle hint, 0 or 1.
    pub const QOS_CL2_IDLE_PRESET: u32 = IS_PRESET + 17;
    /// Firmware hint, 0 or 1.
    pub const QOS_FW_HINT_PRESET: u32 = IS_PRESET + 18;
    /// LLC region sizes.
    pub const QOS_LLC_PRESET: u32 = IS_PRESET + 19;
    /// LLC scenario id.
    pub const QOS_LLC_SCEN_PRESET: u32 = IS_PRESET + 20;
    /// Reset every QoS request.
    pub const QOS_RST: u32 = IS_PRESET + 21;

    /// Performance mode, value is a [`super::perf_mode`] constant.
    pub const PERF_MODE: u32 = 0x90_0000;
    /// Request priority.
    pub const PRIORITY: u32 = 0x90_0001;
    /// Target time per frame in microseconds.
    pub const TPF: u32 = 0x90_0002;

    /// DSP kernel name table.
    pub const DSP_KERNEL: u32 = 0xA0_0000;
}

/// Offset that undoes a preset scenario (`INT32_MAX`).
pub const PRESET_SCENARIO_UNDO: u32 = 0x7fff_ffff;

// ── Performance modes ────────────────────────────────────────────────────────

/// Values carried by [`target::PERF_MODE`].
pub mod perf_mode {
    /// Baseline clocks.
    pub const NONE: u32 = 0;
    /// Boost only while a request executes.
    pub const NPU_BOOST_ON_EXECUTE: u32 = 1;
    /// Boost while the model is open.
    pub const NPU_BOOST: u32 = 2;
    /// CPU boost.
    pub const CPU_BOOST: u32 = 3;
    /// NPU down-clock.
    pub const NPU_DN: u32 = 4;
    /// Memory-ordering boost on execute.
    pub const MO_BOOST_ON_EXECUTE: u32 = 5;
    /// DLV3 scenario.
    pub const DLV3: u32 = 6;
    /// Boost with blocking DVFS.
    pub const NPU_BOOST_BLOCKING: u32 = 7;
}

// ── Status codes ─────────────────────────────────────────────────────────────

/// ioctl return value that asks the caller to keep its previous setting.
pub const EMERGENCY_RECOVERY: u32 = 0xDC00_0003;
/// errno reported when firmware cannot allocate command SRAM.
pub const ERR_LOAD_CANT_ALLOC_CMD_LENGTH: i32 = 0x10C;
/// errno reported when firmware cannot allocate sequence SRAM.
pub const ERR_LOAD_SEQ_ALLOC: i32 = 0x112;

/// Last-input marker meaning "no shared buffer".
pub const NO_SHARED_BUFFER: i32 = -1;
/// Boundness "not applicable".
pub const BOUND_NA: u32 = 0xFFFF_FFFF;
/// Invalid link id.
pub const LINK_ID_INVALID: i32 = -1;
/// Preset id below which presets are disabled.
pub const PRESET_DISABLE_UPPER_BOUND: i32 = 0;

/// Default request priority.
pub const REQ_PRIORITY_DEFAULT: u32 = 0;
/// Exclusive upper bound on request priority.
pub const REQ_PRIORITY_MAX: u32 = 256;

/// Watchdog deadline for one VS4L call, in seconds.
pub const VS4L_TIMER_TIMEOUT_SEC: u64 = 20;
/// Watchdog warning interval, in seconds.
pub const VS4L_TIMER_INTERVAL_SEC: u64 = 1;

/// Default vertex device node.
pub const VERTEX_DEVICE_PATH: &str = "/dev/vertex10";
/// Default number of in-flight requests per session.
pub const MAX_REQUEST_SIZE: usize = 16;

// ── Frequency tables ─────────────────────────────────────────────────────────

/// Per-SoC frequency ceilings in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocFrequencies {
    /// SoC number.
    pub soc: u32,
    /// NPU maximum.
    pub npu_max: u32,
    /// Memory interface maximum.
    pub mif_max: u32,
    /// Internal bus maximum.
    pub int_max: u32,
    /// Little cluster maximum.
    pub cl0_max: u32,
    /// Mid cluster maximum.
    pub cl1_max: u32,
    /// Big cluster maximum.
    pub cl2_max: u32,
}

/// Exynos 9925.
pub const EXYNOS9925: SocFrequencies = SocFrequencies {
    soc: 9925,
    npu_max: 935_000,
    mif_max: 3_172_000,
    int_max: 800_000,
    cl0_max: 2_112_000,
    cl1_max: 2_304_000,
    cl2_max: 2_304_000,
};

/// Ceilings used when a model is opened in boost mode.
pub const TARGET_MAX_FREQ: &[SocFrequencies] = &[EXYNOS9925];
/// Frequencies requested while a boost-on-execute request runs.
pub const TARGET_TUNED_FREQ: &[SocFrequencies] = &[EXYNOS9925];

/// DSP frequency requested by boost without a preset.
pub const DSP_BOOST_FREQ: u32 = 1_066_000;

/// Looks up a SoC row by number.
pub fn soc_frequencies(table: &[SocFrequencies], soc: u32) -> Option<&SocFrequencies> {
    table.iter().find(|row| row.soc == soc)
}
