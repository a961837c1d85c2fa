//! Identifier types for devices, sessions and consumer slots
//!
//! Every consumer lives in a slot identified by (device, session, VFO). The
//! single-flight locks of the consumer manager are keyed by [`SlotKey`].

use serde::{Deserialize, Serialize};

/// Identifier of a physical (or remote) SDR device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new device identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an attached client session (one browser tab)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new session identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Virtual tuned channel number within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vfo(pub u8);

impl std::fmt::Display for Vfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vfo{}", self.0)
    }
}

/// Unique identifier for a consumer slot (device + session + VFO)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SlotKey {
    pub device: DeviceId,
    pub session: SessionId,
    pub vfo: Vfo,
}

impl SlotKey {
    /// Create a new slot key
    pub fn new(device: DeviceId, session: SessionId, vfo: Vfo) -> Self {
        Self {
            device,
            session,
            vfo,
        }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.session, self.vfo)
    }
}

/// Key under which a consumer is registered with a broadcaster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriberKey(String);

impl SubscriberKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a consumer of the given role tag in a slot
    pub fn for_slot(tag: &str, slot: &SlotKey) -> Self {
        Self(format!("{}:{}:{}", tag, slot.session, slot.vfo.0))
    }

    /// Key for a session's IQ recorder
    pub fn for_recorder(session: &SessionId) -> Self {
        Self(format!("recorder:{}", session))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
