//! Broadcaster implementation

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{BoundedChannel, TrySendError};
use crate::registry::SubscriberKey;
use crate::sample::Chunk;
use crate::stats::{BroadcasterStats, DeliveryMode, SubscriptionStats};

use super::error::BroadcastError;

struct Subscriber<T> {
    channel: BoundedChannel<T>,
    mode: DeliveryMode,
    delivered: u64,
    dropped: u64,
}

struct Shared<T> {
    name: String,
    source: BoundedChannel<T>,
    /// Held while a chunk is dequeued and fanned out, and while flushing
    subscribers: Mutex<HashMap<SubscriberKey, Subscriber<T>>>,
    chunks_received: AtomicU64,
    chunks_flushed: AtomicU64,
    stop: watch::Sender<bool>,
}

impl<T: Chunk> Shared<T> {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriberKey, Subscriber<T>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the next source chunk and fan it out
    ///
    /// Dequeue and delivery happen under the subscriber lock, so a flush
    /// either sees the chunk already queued for every subscriber or sees it
    /// still in the source.
    fn deliver_next(&self) {
        let mut subscribers = self.subscribers();

        let chunk = match self.source.try_recv() {
            Ok(chunk) => chunk,
            // Drained or closed since the wakeup; the loop re-checks
            Err(_) => return,
        };
        self.chunks_received.fetch_add(1, Ordering::Relaxed);

        for (key, sub) in subscribers.iter_mut() {
            let item = match sub.mode {
                DeliveryMode::InProcess => chunk.clone(),
                DeliveryMode::CrossProcess => chunk.detach(),
            };

            match sub.channel.try_send(item) {
                Ok(()) => sub.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    sub.dropped += 1;
                    tracing::trace!(
                        broadcaster = %self.name,
                        subscriber = %key,
                        dropped = sub.dropped,
                        "Subscriber queue full, chunk dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    // Consumer already closed its end; unsubscribe will remove it
                    sub.dropped += 1;
                }
            }
        }
    }
}

/// Single-source, multi-subscriber chunk fan-out
///
/// Cheap to clone; all clones control the same fan-out loop.
pub struct Broadcaster<T: Chunk> {
    shared: Arc<Shared<T>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T: Chunk> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            task: Arc::clone(&self.task),
        }
    }
}

impl<T: Chunk> std::fmt::Debug for Broadcaster<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("name", &self.shared.name)
            .field("subscribers", &self.subscriber_count())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<T: Chunk> Broadcaster<T> {
    /// Start a broadcaster reading from `source`
    pub fn spawn(name: impl Into<String>, source: BoundedChannel<T>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            name: name.into(),
            source,
            subscribers: Mutex::new(HashMap::new()),
            chunks_received: AtomicU64::new(0),
            chunks_flushed: AtomicU64::new(0),
            stop,
        });

        let task = tokio::spawn(run(Arc::clone(&shared), stop_rx));
        tracing::debug!(broadcaster = %shared.name, "Broadcaster started");

        Self {
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Broadcaster name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The channel this broadcaster reads from
    pub fn source(&self) -> &BoundedChannel<T> {
        &self.shared.source
    }

    /// Register a new subscriber channel under `key`
    pub fn subscribe(
        &self,
        key: SubscriberKey,
        capacity: usize,
        mode: DeliveryMode,
    ) -> Result<BoundedChannel<T>, BroadcastError> {
        if !self.is_alive() {
            return Err(BroadcastError::Stopped(self.shared.name.clone()));
        }

        let mut subscribers = self.shared.subscribers();
        if subscribers.contains_key(&key) {
            return Err(BroadcastError::DuplicateKey(key));
        }

        let channel = BoundedChannel::new(capacity);
        subscribers.insert(
            key.clone(),
            Subscriber {
                channel: channel.clone(),
                mode,
                delivered: 0,
                dropped: 0,
            },
        );

        tracing::debug!(
            broadcaster = %self.shared.name,
            subscriber = %key,
            capacity = channel.capacity(),
            mode = ?mode,
            subscribers = subscribers.len(),
            "Subscriber added"
        );

        Ok(channel)
    }

    /// Remove and close a subscriber channel
    ///
    /// Unknown keys are ignored; returns whether a subscriber was removed.
    pub fn unsubscribe(&self, key: &SubscriberKey) -> bool {
        let removed = self.shared.subscribers().remove(key);
        match removed {
            Some(sub) => {
                sub.channel.close();
                tracing::debug!(
                    broadcaster = %self.shared.name,
                    subscriber = %key,
                    delivered = sub.delivered,
                    dropped = sub.dropped,
                    "Subscriber removed"
                );
                true
            }
            None => {
                tracing::trace!(broadcaster = %self.shared.name, subscriber = %key, "Unsubscribe of unknown key ignored");
                false
            }
        }
    }

    /// Whether `key` is currently subscribed
    pub fn is_subscribed(&self, key: &SubscriberKey) -> bool {
        self.shared.subscribers().contains_key(key)
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers().len()
    }

    /// Discard everything queued for every subscriber
    ///
    /// Never splits a fan-out: a chunk is either in every subscriber queue
    /// (and drained here) or still in the source. Chunks arriving after the
    /// flush are delivered normally. Returns the number of queued chunks
    /// that were dropped.
    pub fn flush(&self) -> usize {
        let subscribers = self.shared.subscribers();
        let drained: usize = subscribers.values().map(|s| s.channel.drain()).sum();
        self.shared
            .chunks_flushed
            .fetch_add(drained as u64, Ordering::Relaxed);

        tracing::debug!(
            broadcaster = %self.shared.name,
            drained = drained,
            subscribers = subscribers.len(),
            "Subscriber queues flushed"
        );
        drained
    }

    /// Ask the fan-out loop to exit after the chunk it is currently handling
    ///
    /// Subscriber channels are left open for their consumers to close.
    pub fn stop(&self) {
        self.shared.stop.send_replace(true);
    }

    /// Whether the fan-out loop is still running
    pub fn is_alive(&self) -> bool {
        let task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        task.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Counters for one subscriber
    pub fn subscription_stats(&self, key: &SubscriberKey) -> Option<SubscriptionStats> {
        self.shared
            .subscribers()
            .get(key)
            .map(|sub| stats_for(key, sub))
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> BroadcasterStats {
        let mut subscriptions: Vec<SubscriptionStats> = self
            .shared
            .subscribers()
            .iter()
            .map(|(key, sub)| stats_for(key, sub))
            .collect();
        subscriptions.sort_by(|a, b| a.key.cmp(&b.key));

        BroadcasterStats {
            name: self.shared.name.clone(),
            alive: self.is_alive(),
            chunks_received: self.shared.chunks_received.load(Ordering::Relaxed),
            chunks_flushed: self.shared.chunks_flushed.load(Ordering::Relaxed),
            subscriptions,
        }
    }
}

fn stats_for<T>(key: &SubscriberKey, sub: &Subscriber<T>) -> SubscriptionStats {
    SubscriptionStats {
        key: key.clone(),
        capacity: sub.channel.capacity(),
        delivered: sub.delivered,
        dropped: sub.dropped,
        queued: sub.channel.len(),
        mode: sub.mode,
    }
}

async fn run<T: Chunk>(shared: Arc<Shared<T>>, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            tracing::debug!(broadcaster = %shared.name, "Broadcaster stopped");
            break;
        }

        let ready = tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            ready = shared.source.readable() => ready,
        };

        if !ready {
            tracing::warn!(broadcaster = %shared.name, "Source channel closed, broadcaster exiting");
            break;
        }
        shared.deliver_next();
    }
}
