//! Error types for the offload pipeline
//!
//! Every device-interacting operation returns [`Result`]. Whether a fatal
//! device error ends the process is decided by the embedding caller through
//! [`FailurePolicy`](crate::FailurePolicy), never by the core itself.

use std::fmt;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Device operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    /// Shared region allocation
    Allocate,
    /// Mapping a region for host access
    Map,
    /// Unmapping a region from host access
    Unmap,
    /// Task submission
    Submit,
    /// Blocking wait for task completion
    Wait,
    /// Releasing a shared region
    Release,
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOp::Allocate => write!(f, "allocate"),
            DeviceOp::Map => write!(f, "map"),
            DeviceOp::Unmap => write!(f, "unmap"),
            DeviceOp::Submit => write!(f, "submit"),
            DeviceOp::Wait => write!(f, "wait"),
            DeviceOp::Release => write!(f, "release"),
        }
    }
}

/// Pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device-shared memory could not be allocated
    #[error("Failed to allocate {requested_bytes} bytes of shared memory: {reason}")]
    Allocation {
        /// Bytes requested
        requested_bytes: usize,
        /// Failure reason
        reason: String,
    },

    /// A device command failed mid-pipeline
    #[error("Device {op} failed: {message}")]
    Device {
        /// Operation that failed
        op: DeviceOp,
        /// Error message
        message: String,
    },

    /// `run` was called with no units to submit
    #[error("Cannot submit an empty batch (unit_count = 0)")]
    EmptySubmission,

    /// More units submitted than a buffer can hold
    #[error("Unit count {requested} exceeds buffer capacity of {capacity} units")]
    CapacityExceeded {
        /// Units requested
        requested: usize,
        /// Units that fit in one buffer
        capacity: usize,
    },

    /// A unit payload does not fit in its slot
    #[error("Unit payload of {len} bytes exceeds slot payload of {max} bytes")]
    UnitTooLarge {
        /// Payload length
        len: usize,
        /// Slot payload capacity
        max: usize,
    },

    /// Slot index outside the region
    #[error("Unit index {index} out of range for region holding {capacity} units")]
    UnitOutOfRange {
        /// Requested slot
        index: usize,
        /// Slots in the region
        capacity: usize,
    },

    /// Operation not valid in the controller's current phase
    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Shared memory could not be allocated at construction
    FatalAllocation,
    /// A device command failed; the pipeline is compromised
    FatalDevice,
    /// The caller broke the pipeline contract
    CallerContract,
    /// Bad configuration input
    Config,
}

impl Error {
    /// Create an allocation error
    #[must_use]
    pub fn alloc_failed(requested_bytes: usize, reason: impl Into<String>) -> Self {
        Error::Allocation {
            requested_bytes,
            reason: reason.into(),
        }
    }

    /// Create a device error for the given operation
    #[must_use]
    pub fn device(op: DeviceOp, message: impl Into<String>) -> Self {
        Error::Device {
            op,
            message: message.into(),
        }
    }

    /// Create an invalid state error
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Allocation { .. } => ErrorKind::FatalAllocation,
            Error::Device { .. } => ErrorKind::FatalDevice,
            Error::EmptySubmission
            | Error::CapacityExceeded { .. }
            | Error::UnitTooLarge { .. }
            | Error::UnitOutOfRange { .. }
            | Error::InvalidState(_) => ErrorKind::CallerContract,
            Error::InvalidConfig(_) | Error::ConfigParse(_) | Error::Io(_) => ErrorKind::Config,
        }
    }

    /// Whether this error leaves the pipeline unusable
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::FatalAllocation | ErrorKind::FatalDevice
        )
    }
}

/// An [`Error`] that hands the device session back to the caller
///
/// Returned where the controller would otherwise drop the device: failed
/// construction and failed teardown.
pub struct WithDevice<D> {
    /// What went wrong
    pub error: Error,
    /// The session, with whatever regions could not be released
    pub device: D,
}

impl<D> WithDevice<D> {
    /// Discard the device, keeping the error
    pub fn into_error(self) -> Error {
        self.error
    }

    /// Recover the device, discarding the error
    pub fn into_device(self) -> D {
        self.device
    }
}

impl<D> From<WithDevice<D>> for Error {
    fn from(err: WithDevice<D>) -> Self {
        err.error
    }
}

impl<D> fmt::Debug for WithDevice<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WithDevice")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<D> fmt::Display for WithDevice<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::device(DeviceOp::Map, "bank offline");
        assert_eq!(err.to_string(), "Device map failed: bank offline");

        let err = Error::alloc_failed(4096, "out of device memory");
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            Error::alloc_failed(1, "x").kind(),
            ErrorKind::FatalAllocation
        );
        assert_eq!(
            Error::device(DeviceOp::Submit, "x").kind(),
            ErrorKind::FatalDevice
        );
        assert_eq!(Error::EmptySubmission.kind(), ErrorKind::CallerContract);
        assert_eq!(
            Error::InvalidConfig("x".into()).kind(),
            ErrorKind::Config
        );
    }

    #[test]
    fn test_is_fatal() {
        assert!(Error::device(DeviceOp::Wait, "x").is_fatal());
        assert!(Error::alloc_failed(1, "x").is_fatal());
        assert!(!Error::CapacityExceeded {
            requested: 10,
            capacity: 4
        }
        .is_fatal());
        assert!(!Error::invalid_state("drained").is_fatal());
    }

    #[test]
    fn test_with_device_keeps_both() {
        let err = WithDevice {
            error: Error::device(DeviceOp::Release, "busy"),
            device: 42u32,
        };
        assert_eq!(err.to_string(), "Device release failed: busy");
        assert_eq!(err.error.kind(), ErrorKind::FatalDevice);
        assert_eq!(err.into_device(), 42);
    }
}
