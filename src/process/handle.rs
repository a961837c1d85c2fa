//! Process handle trait and cooperative stop signalling

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one spawned process
///
/// Identities are allocated from a global counter, so a replacement process
/// always has a strictly greater id than the one it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Allocate a fresh identity
    pub fn next() -> Self {
        Self(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How urgently a process has been asked to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopLevel {
    /// Keep running
    Running,
    /// Finish the current unit of work and exit
    StopRequested,
    /// Exit immediately without cleanup
    Terminate,
}

/// Control surface of a running process
pub trait ProcessHandle: Send + Sync + std::fmt::Debug {
    /// Identity of this process
    fn id(&self) -> ProcessId;

    /// Human-readable process name (for logs)
    fn name(&self) -> &str;

    /// Whether the process has not exited yet
    fn is_alive(&self) -> bool;

    /// Ask the process to stop cooperatively
    fn request_stop(&self);

    /// Ask the process to exit immediately
    fn terminate(&self);

    /// End the process unconditionally
    fn kill(&self);
}

/// Stop signal as seen from inside a process body
#[derive(Debug, Clone)]
pub struct ProcessContext {
    id: ProcessId,
    level: watch::Receiver<StopLevel>,
}

impl ProcessContext {
    pub(crate) fn new(id: ProcessId, level: watch::Receiver<StopLevel>) -> Self {
        Self { id, level }
    }

    /// Identity of the process this context belongs to
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Current stop level
    pub fn level(&self) -> StopLevel {
        *self.level.borrow()
    }

    /// Whether the process should exit at the next opportunity
    pub fn should_stop(&self) -> bool {
        self.level() >= StopLevel::StopRequested
    }

    /// Wait until a stop (of any level) is requested
    ///
    /// Resolves immediately if a stop is already pending. Also resolves if the
    /// owning handle is dropped.
    pub async fn stopped(&mut self) {
        loop {
            if self.should_stop() {
                return;
            }
            if self.level.changed().await.is_err() {
                return;
            }
        }
    }
}
