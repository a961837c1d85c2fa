//! Capture worker
//!
//! The worker owns the radio connection. It stamps every block it reads with
//! the tuning it was captured at and offers the chunk to two outputs: the
//! spectrum processor's channel and the sample broadcaster's source channel.
//! Both offers are non-blocking; a full output loses the chunk.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::channel::{BoundedChannel, TrySendError};
use crate::control::{PlaneEvent, PlaneSender};
use crate::process::ProcessContext;
use crate::registry::DeviceId;
use crate::sample::{ConfigChange, ConfigSnapshot, DeviceConfig, IqChunk};

use super::source::{SampleSource, SourceError, SourceFactory};

/// Consecutive transient read errors tolerated before giving up
const MAX_TRANSIENT_ERRORS: u32 = 50;

/// Message on the worker's configuration channel
#[derive(Debug)]
pub enum WorkerCommand {
    /// Apply a partial update
    ///
    /// If `ack` is set the worker replies with the resulting snapshot once the
    /// update is applied and, for a breaking change, its own outputs have been
    /// emptied.
    Configure {
        update: DeviceConfig,
        ack: Option<oneshot::Sender<ConfigSnapshot>>,
    },
    /// Report the configuration currently applied
    Query(oneshot::Sender<ConfigSnapshot>),
}

/// Everything a worker process needs
pub struct WorkerSetup {
    pub device: DeviceId,
    pub config: ConfigSnapshot,
    pub sources: Arc<dyn SourceFactory>,
    pub commands: mpsc::UnboundedReceiver<WorkerCommand>,
    pub spectrum_out: BoundedChannel<IqChunk>,
    pub broadcast_out: BoundedChannel<IqChunk>,
    pub plane: PlaneSender,
}

#[derive(Debug, Default)]
struct OutputCounters {
    produced: u64,
    spectrum_dropped: u64,
    broadcast_dropped: u64,
}

/// Worker process body
pub async fn run_worker(mut ctx: ProcessContext, setup: WorkerSetup) {
    let WorkerSetup {
        device,
        config,
        sources,
        mut commands,
        spectrum_out,
        broadcast_out,
        plane,
    } = setup;

    let origin = ctx.id();
    let fatal = |message: String| {
        tracing::error!(device = %device, error = %message, "Worker failed");
        let _ = plane.send(PlaneEvent::DeviceFatal {
            device: device.clone(),
            origin,
            message,
        });
    };

    let mut source = match sources.open(&device, &config) {
        Ok(source) => source,
        Err(e) => {
            fatal(e.to_string());
            return;
        }
    };

    tracing::info!(
        device = %device,
        sample_rate = ?config.sample_rate,
        center_freq = ?config.center_freq,
        "Worker started"
    );

    let mut snapshot = config;
    let mut counters = OutputCounters::default();
    let mut transient_errors = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = ctx.stopped() => break,
            command = commands.recv() => match command {
                Some(WorkerCommand::Configure { update, ack }) => {
                    snapshot = apply_update(
                        &device,
                        source.as_mut(),
                        snapshot,
                        &update,
                        &spectrum_out,
                        &broadcast_out,
                    );
                    if let Some(ack) = ack {
                        let _ = ack.send(snapshot.clone());
                    }
                }
                Some(WorkerCommand::Query(reply)) => {
                    let _ = reply.send(snapshot.clone());
                }
                None => {
                    tracing::debug!(device = %device, "Worker control channel closed");
                    break;
                }
            },
            read = source.read() => match read {
                Ok(samples) => {
                    transient_errors = 0;
                    if samples.is_empty() {
                        continue;
                    }
                    let (Some(center_freq), Some(sample_rate)) = (snapshot.center_freq, snapshot.sample_rate) else {
                        continue;
                    };
                    let chunk = IqChunk::new(samples, center_freq, sample_rate);
                    publish(chunk, &spectrum_out, &broadcast_out, &mut counters);
                }
                Err(e) if e.is_transient() => {
                    transient_errors += 1;
                    tracing::debug!(device = %device, error = %e, count = transient_errors, "Transient read error");
                    if transient_errors >= MAX_TRANSIENT_ERRORS {
                        fatal(format!("{} consecutive read errors, last: {}", transient_errors, e));
                        break;
                    }
                }
                Err(e) => {
                    fatal(e.to_string());
                    break;
                }
            },
        }
    }

    tracing::info!(
        device = %device,
        produced = counters.produced,
        spectrum_dropped = counters.spectrum_dropped,
        broadcast_dropped = counters.broadcast_dropped,
        "Worker stopped"
    );
}

fn apply_update(
    device: &DeviceId,
    source: &mut dyn SampleSource,
    current: ConfigSnapshot,
    update: &DeviceConfig,
    spectrum_out: &BoundedChannel<IqChunk>,
    broadcast_out: &BoundedChannel<IqChunk>,
) -> ConfigSnapshot {
    let next = current.merged(update);
    if let Err(e) = source.apply(&next) {
        tracing::warn!(device = %device, error = %e, "Configuration rejected by source");
        return current;
    }

    if let ConfigChange::Breaking { reason } = current.compare(&next) {
        // Chunks still queued were captured with the old tuning
        let stale = spectrum_out.drain() + broadcast_out.drain();
        tracing::debug!(device = %device, stale = stale, reason = %reason, "Worker outputs drained");
    }
    next
}

fn publish(
    chunk: IqChunk,
    spectrum_out: &BoundedChannel<IqChunk>,
    broadcast_out: &BoundedChannel<IqChunk>,
    counters: &mut OutputCounters,
) {
    counters.produced += 1;

    if let Err(TrySendError::Full(_)) = spectrum_out.try_send(chunk.clone()) {
        counters.spectrum_dropped += 1;
    }
    if let Err(TrySendError::Full(_)) = broadcast_out.try_send(chunk) {
        counters.broadcast_dropped += 1;
    }
}

/// Ask a worker for its current configuration
pub async fn query(
    control: &mpsc::UnboundedSender<WorkerCommand>,
    timeout: std::time::Duration,
) -> Result<ConfigSnapshot, SourceError> {
    let (tx, rx) = oneshot::channel();
    control
        .send(WorkerCommand::Query(tx))
        .map_err(|_| SourceError::Read("worker is gone".into()))?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(snapshot)) => Ok(snapshot),
        Ok(Err(_)) => Err(SourceError::Read("worker is gone".into())),
        Err(_) => Err(SourceError::Timeout),
    }
}
