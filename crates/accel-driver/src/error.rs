//! Error types for accelerator driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for accelerator operations
pub type Result<T> = std::result::Result<T, AccelError>;

/// Errors that can occur while driving the NPU/DSP
#[derive(Debug, Error)]
pub enum AccelError {
    /// The vertex device node could not be opened
    #[error("Cannot open device {path}: errno {errno}")]
    DeviceOpen {
        /// Device node
        path: PathBuf,
        /// errno from open(2)
        errno: i32,
    },

    /// A VS4L ioctl failed
    #[error("VS4L {request} failed: ret {ret:#x}, errno {errno}")]
    Ioctl {
        /// Request name (e.g. `S_GRAPH`)
        request: &'static str,
        /// Raw ioctl return value
        ret: i32,
        /// errno after the call
        errno: i32,
    },

    /// The driver asked for emergency recovery where it cannot be skipped
    #[error("Emergency recovery requested during {request}")]
    EmergencyRecovery {
        /// Request name
        request: &'static str,
    },

    /// Firmware SRAM is exhausted; no further models can be opened
    #[error("Accelerator SRAM is full")]
    SramFull,

    /// No free request slot
    #[error("VS4L buffer full (capacity {capacity})")]
    BufferFull {
        /// Ring capacity
        capacity: usize,
    },

    /// A memory handle failed validation
    #[error("Invalid memory: {reason}")]
    InvalidMemory {
        /// Reason for failure
        reason: String,
    },

    /// A caller-supplied argument is out of range or inconsistent
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for failure
        reason: String,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Lookup by id failed
    #[error("{what} {id:#x} not found")]
    NotFound {
        /// Kind of object
        what: &'static str,
        /// Id that was looked up
        id: u64,
    },

    /// Insert would overwrite an existing entry
    #[error("{what} {id:#x} already exists")]
    Duplicate {
        /// Kind of object
        what: &'static str,
        /// Conflicting id
        id: u64,
    },

    /// Watchdog deadline reached
    #[error("VS4L {request} timeout after {duration_ms}ms")]
    Timeout {
        /// Request name
        request: &'static str,
        /// Deadline in milliseconds
        duration_ms: u64,
    },

    /// DSP binary metadata could not be parsed
    #[error("Malformed DSP binary: {reason}")]
    MalformedBinary {
        /// Reason for failure
        reason: String,
    },

    /// Preset configuration error
    #[error("Preset error: {reason}")]
    Preset {
        /// Reason for failure
        reason: String,
    },

    /// The hardware completed a request with an error flag
    #[error("Request {frame_id} failed on the accelerator")]
    RequestFailed {
        /// Frame id of the failed request
        frame_id: u32,
    },

    /// I/O error during buffer management
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Preset JSON could not be decoded
    #[error("JSON error: {source}")]
    Json {
        /// Underlying decode error
        #[from]
        source: serde_json::Error,
    },
}

impl AccelError {
    /// Create an ioctl failure
    pub fn ioctl(request: &'static str, fault: crate::backend::DriverFault) -> Self {
        Self::Ioctl {
            request,
            ret: fault.ret,
            errno: fault.errno,
        }
    }

    /// Create an invalid memory error
    pub fn invalid_memory(reason: impl Into<String>) -> Self {
        Self::InvalidMemory {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: &'static str, id: u64) -> Self {
        Self::NotFound { what, id }
    }

    /// Create a duplicate key error
    pub fn duplicate(what: &'static str, id: u64) -> Self {
        Self::Duplicate { what, id }
    }

    /// Create a malformed binary error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedBinary {
            reason: reason.into(),
        }
    }

    /// Create a preset error
    pub fn preset(reason: impl Into<String>) -> Self {
        Self::Preset {
            reason: reason.into(),
        }
    }

    /// True for conditions the caller may retry after draining requests
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::BufferFull { .. } | Self::Timeout { .. })
    }
}
