//! DDDK Runtime - Runtime support for device driver development
//!
//! This crate provides the types drivers are written against: the driver
//! error taxonomy, the driver lifecycle traits, scoped resource guards and
//! the module loader that hosts one driver instance.

use std::sync::Arc;

use thiserror::Error;

mod guard;
mod loader;

pub use cap_broker::{CapabilityBroker, CapabilityError, Resource};
pub use guard::{Acquired, Release};
pub use loader::{ModuleLoader, ModuleState};

const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;

/// Driver error types
#[derive(Debug, Error)]
pub enum DriverError {
    /// A device number region, class, cdev, node or memory allocation failed
    #[error("{resource} allocation failed: {source}")]
    ResourceExhausted {
        resource: Resource,
        #[source]
        source: CapabilityError,
    },

    /// The IRQ subsystem refused the line
    #[error("IRQ {irq} registration refused: {source}")]
    RegistrationConflict {
        irq: u32,
        #[source]
        source: CapabilityError,
    },

    /// A read could not deliver bytes to the caller's buffer
    #[error("Copy to user buffer failed")]
    TransferFailed,

    /// Deferred-context handling of one event failed
    #[error("Deferred processing failed: {0}")]
    ProcessingError(String),

    /// Loader called out of order
    #[error("Cannot {op} while module is {state}")]
    InvalidState { op: &'static str, state: ModuleState },
}

impl DriverError {
    /// Wrap a failed acquisition of a non-IRQ resource
    pub fn exhausted(resource: Resource, source: CapabilityError) -> Self {
        Self::ResourceExhausted { resource, source }
    }

    /// Negative errno reported as the load status
    pub fn errno(&self) -> i32 {
        -match self {
            Self::ResourceExhausted { .. } => ENOMEM,
            Self::RegistrationConflict { .. } => EBUSY,
            Self::TransferFailed => EFAULT,
            Self::ProcessingError(_) => EIO,
            Self::InvalidState { .. } => EINVAL,
        }
    }
}

impl From<DriverError> for CapabilityError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::TransferFailed => CapabilityError::BadAddress,
            DriverError::ResourceExhausted { source, .. } => source,
            DriverError::RegistrationConflict { source, .. } => source,
            other => CapabilityError::IoError(other.to_string()),
        }
    }
}

pub type Result<T> = core::result::Result<T, DriverError>;

/// Trait for driver metadata
pub trait DriverMetadata {
    /// Get the driver name
    fn driver_name() -> &'static str;

    /// Get driver version (default: "0.1.0")
    fn driver_version() -> &'static str {
        "0.1.0"
    }
}

/// Trait for driver lifecycle
///
/// A value of the driver type exists only while the driver is live:
/// `init` either returns a fully initialized driver or has already released
/// everything it acquired, and `exit` consumes the driver.
pub trait Driver: DriverMetadata {
    /// Load-time parameters
    type Params;

    /// Acquire every resource the driver needs
    fn init(broker: Arc<dyn CapabilityBroker>, params: Self::Params) -> Result<Self>
    where
        Self: Sized;

    /// Release every resource, in reverse acquisition order
    fn exit(self)
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let exhausted = DriverError::exhausted(Resource::Memory, CapabilityError::OutOfMemory { requested: 8 });
        assert_eq!(exhausted.errno(), -12);

        let conflict = DriverError::RegistrationConflict {
            irq: 10,
            source: CapabilityError::IrqBusy {
                irq: 10,
                reason: "line is not shared",
            },
        };
        assert_eq!(conflict.errno(), -16);
        assert_eq!(DriverError::TransferFailed.errno(), -14);
        assert_eq!(DriverError::ProcessingError("boom".into()).errno(), -5);
    }

    #[test]
    fn test_error_messages_carry_cause() {
        let err = DriverError::exhausted(Resource::Class, CapabilityError::ClassExists { name: "demo".into() });
        assert_eq!(err.to_string(), "device class allocation failed: Device class already exists: demo");
    }

    #[test]
    fn test_transfer_failure_maps_to_bad_address() {
        let err: CapabilityError = DriverError::TransferFailed.into();
        assert!(matches!(err, CapabilityError::BadAddress));

        let err: CapabilityError = DriverError::ProcessingError("boom".into()).into();
        assert!(matches!(err, CapabilityError::IoError(_)));
    }
}
