//! Error types for the switch fabric control plane.
//!
//! Data-path exhaustion (full rings, failed scratch allocation) is never
//! reported through these types; it is accounted in per-port counters.

use thiserror::Error;

/// Coarse classification of a control-plane failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request: bad names, bad modes, out-of-range values.
    Configuration,
    /// Authorization or ownership conflict.
    Ownership,
    /// Capacity exhausted.
    Resource,
}

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("bridge not found: {0}")]
    BridgeNotFound(String),

    #[error("bridge already exists: {0}")]
    BridgeExists(String),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("port already exists: {0}")]
    PortExists(String),

    #[error("port busy: {0}")]
    PortBusy(String),

    #[error("bridge busy: {0}")]
    BridgeBusy(String),

    #[error("permission denied on bridge {0}")]
    PermissionDenied(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("polling already active on {0}")]
    PollingActive(String),

    #[error("polling not active on {0}")]
    PollingInactive(String),

    #[error("no free bridge slot for {0}")]
    NoBridgeSlot(String),

    #[error("bridge {0} is full")]
    BridgeFull(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SwitchError::InvalidName(_)
            | SwitchError::InvalidArgument(_)
            | SwitchError::BridgeNotFound(_)
            | SwitchError::PortNotFound(_)
            | SwitchError::NotSupported(_) => ErrorClass::Configuration,
            SwitchError::BridgeExists(_)
            | SwitchError::PortExists(_)
            | SwitchError::PortBusy(_)
            | SwitchError::BridgeBusy(_)
            | SwitchError::PermissionDenied(_)
            | SwitchError::PollingActive(_)
            | SwitchError::PollingInactive(_) => ErrorClass::Ownership,
            SwitchError::NoBridgeSlot(_) | SwitchError::BridgeFull(_) | SwitchError::Io(_) => {
                ErrorClass::Resource
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchError>;
