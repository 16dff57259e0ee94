//! Error types for the ring-building engine.

use thiserror::Error;

use crate::device::DeviceId;

/// Result type for ring-builder operations.
pub type RingResult<T> = Result<T, RingError>;

/// Errors that can occur while editing or rebalancing a ring.
///
/// Every error is returned to the caller; the builder never retries
/// internally, and a failed operation leaves the builder state untouched.
#[derive(Debug, Error)]
pub enum RingError {
    /// The builder has no persisted identity yet.
    #[error("builder id has not been assigned; persist the builder first")]
    UninitializedIdentity,

    /// No weighted active device is left in the ring.
    #[error("there are no active devices in this ring, or all devices have been removed")]
    EmptyRing,

    /// An active device reported a non-positive weight.
    #[error("invalid weight {weight} for active device {device}")]
    InvalidWeight {
        /// The offending device id.
        device: DeviceId,
        /// The weight it reported.
        weight: f64,
    },

    /// An explicit device id collides with a live device.
    #[error("duplicate device id: {0}")]
    DuplicateDevice(DeviceId),

    /// A device spec is incomplete.
    #[error("device {} is missing required key(s): {}", .device, .missing.join(", "))]
    MissingFields {
        /// The device id as requested by the caller, or "(unassigned)".
        device: String,
        /// Every absent key, in declaration order.
        missing: Vec<&'static str>,
    },

    /// A mutation was attempted on a device queued for removal.
    #[error("operation {operation} could not be completed on device {device}: marked for removal")]
    MarkedForRemoval {
        /// The removed device id.
        device: DeviceId,
        /// The operation that was refused.
        operation: &'static str,
    },

    /// The referenced device does not exist.
    #[error("unknown device id: {0}")]
    UnknownDevice(DeviceId),

    /// A construction or setter argument was out of domain.
    #[error("invalid value for {parameter}: {reason}")]
    InvalidParameter {
        /// The parameter that failed validation.
        parameter: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
