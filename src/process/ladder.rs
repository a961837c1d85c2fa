//! Escalating termination
//!
//! `RequestStop → Terminate → Kill`, each stage with its own timeout. A stage
//! is skipped as soon as the process is observed to have exited.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::handle::ProcessHandle;

/// Per-stage timeouts of the termination ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderTimeouts {
    /// How long to wait after a cooperative stop request
    pub graceful: Duration,
    /// How long to wait after a terminate request
    pub terminate: Duration,
    /// How long to wait after a kill
    pub kill: Duration,
    /// Interval between liveness checks
    pub poll: Duration,
}

impl Default for LadderTimeouts {
    fn default() -> Self {
        Self {
            graceful: Duration::from_secs(5),
            terminate: Duration::from_secs(1),
            kill: Duration::from_millis(200),
            poll: Duration::from_millis(10),
        }
    }
}

/// Stage at which a process was observed to have exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitStage {
    /// It was already gone before the ladder started
    AlreadyExited,
    /// It honored the cooperative stop request
    Cooperative,
    /// It exited after the terminate request
    Terminated,
    /// It had to be killed
    Killed,
    /// It was still reported alive after the kill timeout
    Unresponsive,
}

impl ExitStage {
    /// Whether the process is known to be gone
    pub fn exited(self) -> bool {
        self != ExitStage::Unresponsive
    }
}

/// Poll `process` until it exits or `timeout` elapses
///
/// Returns whether the process exited.
pub async fn wait_for_exit(process: &dyn ProcessHandle, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !process.is_alive() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return !process.is_alive();
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

/// Run the full ladder starting from a cooperative stop request
pub async fn shutdown(process: &dyn ProcessHandle, timeouts: &LadderTimeouts) -> ExitStage {
    if !process.is_alive() {
        return ExitStage::AlreadyExited;
    }

    process.request_stop();
    if wait_for_exit(process, timeouts.graceful, timeouts.poll).await {
        return ExitStage::Cooperative;
    }

    tracing::warn!(
        process = %process.id(),
        name = process.name(),
        grace_ms = timeouts.graceful.as_millis() as u64,
        "Process ignored stop request, terminating"
    );
    escalate(process, timeouts).await
}

/// Run the ladder starting at the terminate stage
///
/// Used when replacing or restarting a process, where waiting for a
/// cooperative exit would only delay the replacement.
pub async fn force_shutdown(process: &dyn ProcessHandle, timeouts: &LadderTimeouts) -> ExitStage {
    if !process.is_alive() {
        return ExitStage::AlreadyExited;
    }
    escalate(process, timeouts).await
}

async fn escalate(process: &dyn ProcessHandle, timeouts: &LadderTimeouts) -> ExitStage {
    process.terminate();
    if wait_for_exit(process, timeouts.terminate, timeouts.poll).await {
        return ExitStage::Terminated;
    }

    tracing::warn!(
        process = %process.id(),
        name = process.name(),
        "Process ignored terminate request, killing"
    );

    process.kill();
    if wait_for_exit(process, timeouts.kill, timeouts.poll).await {
        ExitStage::Killed
    } else {
        tracing::error!(
            process = %process.id(),
            name = process.name(),
            "Process still alive after kill"
        );
        ExitStage::Unresponsive
    }
}

/// Run the ladder on a background task and hand the outcome to `report`
///
/// `forceful` skips the cooperative stage.
pub fn spawn_shutdown<F>(
    process: Arc<dyn ProcessHandle>,
    timeouts: LadderTimeouts,
    forceful: bool,
    report: F,
) -> tokio::task::JoinHandle<ExitStage>
where
    F: FnOnce(ExitStage) + Send + 'static,
{
    tokio::spawn(async move {
        let stage = if forceful {
            force_shutdown(process.as_ref(), &timeouts).await
        } else {
            shutdown(process.as_ref(), &timeouts).await
        };
        tracing::debug!(process = %process.id(), name = process.name(), stage = ?stage, "Process reaped");
        report(stage);
        stage
    })
}
