//! Consumer lifecycle error types

use crate::broadcast::BroadcastError;
use crate::registry::{DeviceId, SlotKey};

use super::role::ConsumerRole;

/// Error type for consumer lifecycle operations
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerError {
    /// The owning device has no running pipeline
    DeviceNotRunning(DeviceId),
    /// A different consumer already occupies the slot
    Duplicate {
        slot: SlotKey,
        existing: ConsumerRole,
        requested: ConsumerRole,
    },
    /// No consumer exists in the slot
    NotFound(SlotKey),
    /// A required configuration parameter is missing
    MissingParameter(&'static str),
    /// A configuration parameter has an invalid value
    InvalidParameter(String),
    /// The internal demodulator a decoder depends on could not be created
    InternalDemodulator(String),
    /// The consumer process could not be spawned
    Spawn(String),
    /// Subscribing to a broadcaster failed
    Subscribe(BroadcastError),
    /// Restart attempts were exhausted
    RestartFailed { slot: SlotKey, attempts: u32, last: Box<ConsumerError> },
}

impl ConsumerError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConsumerError::Spawn(_)
                | ConsumerError::InternalDemodulator(_)
                | ConsumerError::Subscribe(BroadcastError::DuplicateKey(_))
        )
    }
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerError::DeviceNotRunning(device) => write!(f, "Device not running: {}", device),
            ConsumerError::Duplicate {
                slot,
                existing,
                requested,
            } => write!(
                f,
                "Slot {} already runs {} (requested {})",
                slot, existing, requested
            ),
            ConsumerError::NotFound(slot) => write!(f, "No consumer in slot {}", slot),
            ConsumerError::MissingParameter(name) => write!(f, "Missing parameter: {}", name),
            ConsumerError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            ConsumerError::InternalDemodulator(msg) => {
                write!(f, "Internal demodulator unavailable: {}", msg)
            }
            ConsumerError::Spawn(msg) => write!(f, "Failed to spawn consumer: {}", msg),
            ConsumerError::Subscribe(e) => write!(f, "Subscription failed: {}", e),
            ConsumerError::RestartFailed {
                slot,
                attempts,
                last,
            } => write!(
                f,
                "Restart of {} failed after {} attempts: {}",
                slot, attempts, last
            ),
        }
    }
}

impl std::error::Error for ConsumerError {}

impl From<BroadcastError> for ConsumerError {
    fn from(err: BroadcastError) -> Self {
        ConsumerError::Subscribe(err)
    }
}
