//! Broadcaster error types

use crate::registry::SubscriberKey;

/// Error type for broadcaster operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// A subscriber with this key is already registered
    DuplicateKey(SubscriberKey),
    /// The fan-out loop is no longer running
    Stopped(String),
}

impl std::fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastError::DuplicateKey(key) => write!(f, "Subscriber already registered: {}", key),
            BroadcastError::Stopped(name) => write!(f, "Broadcaster stopped: {}", name),
        }
    }
}

impl std::error::Error for BroadcastError {}
