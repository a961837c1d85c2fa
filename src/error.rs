//! Error types
//!
//! Each subsystem has its own error enum; [`Error`] wraps them for callers
//! going through the control plane.

use crate::broadcast::BroadcastError;
use crate::consumer::ConsumerError;
use crate::device::{DeviceError, SourceError};

/// Crate-wide error type
#[derive(Debug)]
pub enum Error {
    /// Broadcaster subscription error
    Broadcast(BroadcastError),
    /// Device pipeline error
    Device(DeviceError),
    /// Consumer lifecycle error
    Consumer(ConsumerError),
    /// Sample source error
    Source(SourceError),
    /// I/O error
    Io(std::io::Error),
    /// Configuration could not be parsed
    Config(serde_json::Error),
    /// The control plane task has exited
    ControlPlaneClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Broadcast(e) => write!(f, "Broadcast error: {}", e),
            Error::Device(e) => write!(f, "Device error: {}", e),
            Error::Consumer(e) => write!(f, "Consumer error: {}", e),
            Error::Source(e) => write!(f, "Source error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config(e) => write!(f, "Invalid configuration: {}", e),
            Error::ControlPlaneClosed => write!(f, "Control plane closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Broadcast(e) => Some(e),
            Error::Device(e) => Some(e),
            Error::Consumer(e) => Some(e),
            Error::Source(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Config(e) => Some(e),
            Error::ControlPlaneClosed => None,
        }
    }
}

impl From<BroadcastError> for Error {
    fn from(err: BroadcastError) -> Self {
        Error::Broadcast(err)
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        Error::Device(err)
    }
}

impl From<ConsumerError> for Error {
    fn from(err: ConsumerError) -> Self {
        Error::Consumer(err)
    }
}

impl From<SourceError> for Error {
    fn from(err: SourceError) -> Self {
        Error::Source(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err)
    }
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceId;

    #[test]
    fn test_display_wraps_subsystem_error() {
        let err: Error = DeviceError::NotFound(DeviceId::new("rtl-0")).into();
        assert!(err.to_string().starts_with("Device error: "));
        assert!(std::error::Error::source(&err).is_some());
    }
}
