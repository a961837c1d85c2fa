//! Device lifecycle error types

use crate::broadcast::BroadcastError;
use crate::registry::{DeviceId, SessionId};

use super::source::SourceError;

/// Error type for device pipeline operations
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No pipeline exists for the device
    NotFound(DeviceId),
    /// The device is being torn down; retry once it is gone
    Stopping(DeviceId),
    /// The client is not attached to the device
    NotAttached { device: DeviceId, client: SessionId },
    /// The worker did not acknowledge in time
    Timeout(DeviceId),
    /// The sample source refused the requested configuration
    Rejected(DeviceId),
    /// The worker exited or its control channel closed
    WorkerGone(DeviceId),
    /// The session already has a recorder on this device
    RecorderExists { device: DeviceId, session: SessionId },
    /// The session has no recorder on this device
    NoRecorder { device: DeviceId, session: SessionId },
    /// Talking to the sample source failed
    Source(SourceError),
    /// A broadcaster operation failed
    Broadcast(BroadcastError),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NotFound(device) => write!(f, "Device not found: {}", device),
            DeviceError::Stopping(device) => write!(f, "Device is stopping: {}", device),
            DeviceError::NotAttached { device, client } => {
                write!(f, "Client {} is not attached to {}", client, device)
            }
            DeviceError::Timeout(device) => write!(f, "Worker of {} did not respond in time", device),
            DeviceError::Rejected(device) => write!(f, "Configuration rejected by {}", device),
            DeviceError::WorkerGone(device) => write!(f, "Worker of {} is gone", device),
            DeviceError::RecorderExists { device, session } => {
                write!(f, "Session {} is already recording {}", session, device)
            }
            DeviceError::NoRecorder { device, session } => {
                write!(f, "Session {} is not recording {}", session, device)
            }
            DeviceError::Source(e) => write!(f, "Source error: {}", e),
            DeviceError::Broadcast(e) => write!(f, "Broadcast error: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<SourceError> for DeviceError {
    fn from(err: SourceError) -> Self {
        DeviceError::Source(err)
    }
}

impl From<BroadcastError> for DeviceError {
    fn from(err: BroadcastError) -> Self {
        DeviceError::Broadcast(err)
    }
}
