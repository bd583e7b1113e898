//! User driver for the NPU and DSP behind the vertex device.
//!
//! Compiled operator lists are loaded, fed and torn down through the VS4L
//! ioctl protocol. Every device call is bounded by a watchdog thread; no
//! signal handlers, no non-local jumps.
//!
//! # Layering
//!
//! ```text
//! UnifiedUserDriver ──┬──▶ NpuUserDriver ──▶ DeviceLink(NPU) ─┐
//!                     └──▶ DspUserDriver ──▶ DeviceLink(DSP) ─┤
//!                            │                                ├──▶ Vs4lDevice
//!                            └─ AsyncExecutionWorker ─────────┘    ├ KernelDevice   /dev/vertex10
//!                                                                  └ SoftwareDevice in-process
//! ```
//!
//! Each [`DeviceLink`] keeps one [`BinSession`](session::BinSession) per
//! loaded operator, with a [`RequestSlotRing`] of in-flight requests.
//!
//! # Quick start
//!
//! ```no_run
//! use accel_driver::{
//!     Accelerator, DeviceLink, LinkConfig, NpuUserDriver, OperatorList, UserDriver,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> accel_driver::Result<()> {
//! let link = Arc::new(DeviceLink::kernel(Accelerator::Npu, LinkConfig::from_env())?);
//! let npu = NpuUserDriver::new(link)?;
//! npu.initialize()?;
//!
//! let list = OperatorList::new(0x0001_0000);
//! // ... operators and tensors from the model loader ...
//! npu.open_subgraph(&list, list.id, 0)?;
//! npu.close_subgraph(list.id)?;
//! npu.deinitialize()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backend;
pub mod backends;
mod config;
pub mod dsp_bin;
mod error;
pub mod link;
pub mod memory;
pub mod model;
pub mod perf;
pub mod preset;
pub mod session;
pub mod slot_ring;
pub mod userdriver;
pub mod watchdog;
pub mod worker;

pub use backend::{Accelerator, DeviceType, DriverFault, KernelNames, Vs4lDevice, Vs4lRequest};
pub use backends::{KernelDevice, RecordedCall, SoftwareDevice};
pub use config::{LinkConfig, DEFAULT_PRESET_FILE};
pub use error::{AccelError, Result};
pub use link::{Completion, DeviceLink, LinkState};
pub use memory::{IonBuffer, Memory};
pub use model::{
    generate_op_id, Binary, BufferRef, BufferTable, ExecutableOperatorList, ExecuteRequest,
    Operator, OperatorList, Shape, Tensor, TensorIndex, UnifiedBinaryOption, VecBufferTable,
};
pub use perf::ModePreference;
pub use preset::{PresetScenario, PresetSource, PresetTable};
pub use session::{ExecutionBuffers, FeatureMap, ModelInfo, SessionOptions};
pub use slot_ring::RequestSlotRing;
pub use userdriver::{
    DriverStatus, DspUserDriver, NpuUserDriver, UnifiedUserDriver, UserDriver,
};
pub use watchdog::Watchdog;
pub use worker::{AsyncExecutionWorker, WorkerState};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AccelError, Accelerator, DeviceLink, DspUserDriver, ExecutableOperatorList,
        ExecuteRequest, LinkConfig, NpuUserDriver, OperatorList, Result, UnifiedUserDriver,
        UserDriver,
    };
}
