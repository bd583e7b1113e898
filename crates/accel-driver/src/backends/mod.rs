//! Vertex device implementations
//!
//! Two backends available:
//! - **Kernel**: `/dev/vertex*` through the VS4L ioctls (production)
//! - **Software**: in-process model of the driver (CI, fault injection)

pub mod kernel;
pub mod software;

pub use kernel::KernelDevice;
pub use software::{RecordedCall, SoftwareDevice};
