//! Task-backed processes
//!
//! A [`TaskProcess`] runs its body as a tokio task. Cooperative stop and
//! terminate requests are delivered through the body's [`ProcessContext`];
//! `kill` aborts the task, which drops the body at its next suspension point
//! whether or not it observes the stop signal.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::handle::{ProcessContext, ProcessHandle, ProcessId, StopLevel};

/// A process executed as a supervised tokio task
#[derive(Debug)]
pub struct TaskProcess {
    id: ProcessId,
    name: String,
    level: watch::Sender<StopLevel>,
    task: JoinHandle<()>,
}

impl TaskProcess {
    /// Spawn `body` with a freshly allocated identity
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(ProcessContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_id(ProcessId::next(), name, body)
    }

    /// Spawn `body` under a pre-allocated identity
    pub fn spawn_with_id<F, Fut>(id: ProcessId, name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(ProcessContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (level, rx) = watch::channel(StopLevel::Running);
        let fut = body(ProcessContext::new(id, rx));

        let task_name = name.clone();
        let task = tokio::spawn(async move {
            fut.await;
            tracing::trace!(process = %id, name = %task_name, "Process body returned");
        });

        tracing::debug!(process = %id, name = %name, "Process spawned");

        Self {
            id,
            name,
            level,
            task,
        }
    }

    fn raise(&self, level: StopLevel) {
        self.level.send_if_modified(|current| {
            if *current < level {
                *current = level;
                true
            } else {
                false
            }
        });
    }
}

impl ProcessHandle for TaskProcess {
    fn id(&self) -> ProcessId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    fn request_stop(&self) {
        self.raise(StopLevel::StopRequested);
    }

    fn terminate(&self) {
        self.raise(StopLevel::Terminate);
    }

    fn kill(&self) {
        self.raise(StopLevel::Terminate);
        self.task.abort();
    }
}
