//! Statistics snapshots for subscriptions, broadcasters and devices

use std::time::Duration;

use serde::Serialize;

use crate::registry::{DeviceId, SessionId, SubscriberKey};
use crate::sample::ConfigSnapshot;

/// How a subscriber channel is fed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Consumer reads in the same address space; chunks share buffers
    InProcess,
    /// Consumer sits across a process boundary; each chunk is deep-copied
    CrossProcess,
}

/// Counters of a single broadcaster subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Subscriber key
    pub key: SubscriberKey,
    /// Channel capacity in chunks
    pub capacity: usize,
    /// Chunks successfully enqueued
    pub delivered: u64,
    /// Chunks dropped because the channel was full
    pub dropped: u64,
    /// Chunks currently waiting in the channel
    pub queued: usize,
    /// Delivery mode of the subscription
    pub mode: DeliveryMode,
}

impl SubscriptionStats {
    /// Fraction of offered chunks that were dropped
    pub fn drop_ratio(&self) -> f64 {
        let offered = self.delivered + self.dropped;
        if offered > 0 {
            self.dropped as f64 / offered as f64
        } else {
            0.0
        }
    }
}

/// Broadcaster-level statistics
#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    /// Broadcaster name
    pub name: String,
    /// Whether the fan-out loop is still running
    pub alive: bool,
    /// Chunks pulled from the source channel
    pub chunks_received: u64,
    /// Queued chunks discarded by flushes
    pub chunks_flushed: u64,
    /// Per-subscriber counters, sorted by key
    pub subscriptions: Vec<SubscriptionStats>,
}

impl BroadcasterStats {
    /// Look up one subscription by key
    pub fn subscription(&self, key: &SubscriberKey) -> Option<&SubscriptionStats> {
        self.subscriptions.iter().find(|s| &s.key == key)
    }
}

/// Device-level statistics
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    /// Device identifier
    pub device: DeviceId,
    /// Attached client sessions
    pub clients: Vec<SessionId>,
    /// Number of demodulator entries (internal ones included)
    pub demodulators: usize,
    /// Number of decoder entries
    pub decoders: usize,
    /// Number of active IQ recorders
    pub recorders: usize,
    /// Current configuration snapshot
    pub config: ConfigSnapshot,
    /// Time since the pipeline was started
    pub uptime: Duration,
    /// Sample broadcaster statistics
    pub broadcaster: BroadcasterStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_ratio() {
        let mut stats = SubscriptionStats {
            key: SubscriberKey::new("a"),
            capacity: 4,
            delivered: 0,
            dropped: 0,
            queued: 0,
            mode: DeliveryMode::InProcess,
        };
        assert_eq!(stats.drop_ratio(), 0.0);

        stats.delivered = 75;
        stats.dropped = 25;
        assert!((stats.drop_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_subscription_lookup() {
        let stats = BroadcasterStats {
            name: "iq".into(),
            alive: true,
            chunks_received: 3,
            chunks_flushed: 0,
            subscriptions: vec![SubscriptionStats {
                key: SubscriberKey::new("demod:s:0"),
                capacity: 8,
                delivered: 3,
                dropped: 0,
                queued: 1,
                mode: DeliveryMode::CrossProcess,
            }],
        };

        assert!(stats.subscription(&SubscriberKey::new("demod:s:0")).is_some());
        assert!(stats.subscription(&SubscriberKey::new("other")).is_none());
    }
}
