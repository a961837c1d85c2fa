//! Process lifecycle manager
//!
//! Owns the per-device pipeline: capture worker, spectrum processor and sample
//! broadcaster. Device-level operations (start, reconfigure, stop, recorder
//! changes) are serialized by one async mutex. Registry locks are only held
//! for short synchronous sections; process exits are awaited by background
//! helpers that report back through the plane channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;

use crate::broadcast::{Broadcaster, DeliveryMode};
use crate::channel::BoundedChannel;
use crate::config::HubConfig;
use crate::consumer::{retire, ConsumerRole};
use crate::control::{HubEvent, PlaneEvent, PlaneSender};
use crate::process::{shutdown, ProcessHandle, ProcessId, TaskProcess};
use crate::registry::{
    ConsumerEntry, DeviceEntry, DeviceId, DeviceState, Pipeline, RecorderEntry, Registry,
    SessionId, SlotKey, SubscriberKey,
};
use crate::sample::{ConfigChange, ConfigSnapshot, DeviceConfig};
use crate::stats::DeviceStats;

use super::error::DeviceError;
use super::recorder::{run_recorder, RecorderSetup};
use super::source::{SourceError, SourceFactory};
use super::spectrum::{run_spectrum, SpectrumCommand, SpectrumSetup};
use super::worker::{self, run_worker, WorkerCommand, WorkerSetup};

/// Result of [`DeviceManager::start`]
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub device: DeviceId,
    /// Whether a new pipeline was spawned (false: client attached to a running one)
    pub created: bool,
    /// How the requested configuration compared to the running one
    pub change: ConfigChange,
}

/// Result of [`DeviceManager::stop`]
#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    /// Consumers removed from the device by this call
    pub stopped: Vec<(SlotKey, ConsumerRole)>,
    /// Whether the last client left and the pipeline is being torn down
    pub tearing_down: bool,
}

/// Manages device pipelines
pub struct DeviceManager {
    registry: Arc<Registry>,
    config: Arc<HubConfig>,
    sources: Arc<dyn SourceFactory>,
    plane: PlaneSender,
    events: broadcast::Sender<HubEvent>,
    ops: tokio::sync::Mutex<()>,
}

impl DeviceManager {
    /// Create a new device manager
    pub fn new(
        registry: Arc<Registry>,
        config: Arc<HubConfig>,
        sources: Arc<dyn SourceFactory>,
        plane: PlaneSender,
        events: broadcast::Sender<HubEvent>,
    ) -> Self {
        Self {
            registry,
            config,
            sources,
            plane,
            events,
            ops: tokio::sync::Mutex::new(()),
        }
    }

    fn emit(&self, event: HubEvent) {
        // No listeners is fine
        let _ = self.events.send(event);
    }

    /// Start a device pipeline or attach `client` to the running one
    ///
    /// Attaching adds the client first, then forwards `config` to the running
    /// pipeline like [`reconfigure`](Self::reconfigure) does. A rejected or
    /// unacknowledged config is returned as an error with the client already
    /// attached. A breaking change is reported in the outcome; restarting the
    /// device's consumers is up to the caller.
    pub async fn start(
        &self,
        device: DeviceId,
        config: DeviceConfig,
        client: SessionId,
    ) -> Result<StartOutcome, DeviceError> {
        let _ops = self.ops.lock().await;

        let existing = self.registry.state(&device).await;
        match existing {
            Some(DeviceState::Stopping) => return Err(DeviceError::Stopping(device)),
            Some(_) => {
                // The client joins even if the worker then rejects the config
                let clients = {
                    let mut devices = self.registry.write().await;
                    let entry = devices
                        .get_mut(&device)
                        .ok_or_else(|| DeviceError::NotFound(device.clone()))?;
                    entry.clients.insert(client.clone());
                    entry.clients.len()
                };

                tracing::info!(device = %device, client = %client, clients = clients, "Client attached to running device");
                self.emit(HubEvent::ClientAttached {
                    device: device.clone(),
                    client,
                    clients,
                });

                let change = self.reconfigure_locked(&device, &config).await?;
                return Ok(StartOutcome {
                    device,
                    created: false,
                    change,
                });
            }
            None => {}
        }

        let snapshot = ConfigSnapshot::unset(device.clone()).merged(&config);
        let pipeline = self.spawn_pipeline(&device, &snapshot);
        let worker = pipeline.worker.id();

        {
            let mut devices = self.registry.write().await;
            let mut entry = DeviceEntry::new(device.clone(), snapshot.clone(), client.clone(), pipeline);
            entry.state = DeviceState::Running;
            devices.insert(device.clone(), entry);
        }

        tracing::info!(
            device = %device,
            client = %client,
            worker = %worker,
            sample_rate = ?snapshot.sample_rate,
            center_freq = ?snapshot.center_freq,
            "Device started"
        );
        self.emit(HubEvent::DeviceStarted {
            device: device.clone(),
            client,
            config: snapshot,
        });

        Ok(StartOutcome {
            device,
            created: true,
            change: ConfigChange::Unchanged,
        })
    }

    fn spawn_pipeline(&self, device: &DeviceId, snapshot: &ConfigSnapshot) -> Pipeline {
        let spectrum_channel = BoundedChannel::new(self.config.spectrum_queue_capacity);
        let broadcast_channel = BoundedChannel::new(self.config.broadcast_queue_capacity);
        let (worker_control, worker_commands) = mpsc::unbounded_channel();
        let (spectrum_control, spectrum_commands) = mpsc::unbounded_channel();

        let broadcaster = Broadcaster::spawn(format!("{}:iq", device), broadcast_channel.clone());

        let spectrum_setup = SpectrumSetup {
            device: device.clone(),
            input: spectrum_channel.clone(),
            commands: spectrum_commands,
            average: self.config.spectrum_average,
            plane: self.plane.clone(),
        };
        let spectrum = TaskProcess::spawn(format!("spectrum:{}", device), move |ctx| {
            run_spectrum(ctx, spectrum_setup)
        });

        let worker_setup = WorkerSetup {
            device: device.clone(),
            config: snapshot.clone(),
            sources: Arc::clone(&self.sources),
            commands: worker_commands,
            spectrum_out: spectrum_channel.clone(),
            broadcast_out: broadcast_channel.clone(),
            plane: self.plane.clone(),
        };
        let worker = TaskProcess::spawn(format!("worker:{}", device), move |ctx| {
            run_worker(ctx, worker_setup)
        });

        Pipeline {
            worker: Arc::new(worker),
            spectrum: Arc::new(spectrum),
            worker_control,
            spectrum_control,
            spectrum_channel,
            broadcast_channel,
            broadcaster,
        }
    }

    /// Apply a partial configuration update to a running device
    ///
    /// A change of sample rate or center frequency is breaking: the worker
    /// acknowledges after emptying its outputs, then every subscriber queue of
    /// the device (audio included) is flushed and the spectrum processor is
    /// reset. The caller restarts the device's consumers.
    pub async fn reconfigure(
        &self,
        device: &DeviceId,
        update: DeviceConfig,
    ) -> Result<ConfigChange, DeviceError> {
        let _ops = self.ops.lock().await;
        self.reconfigure_locked(device, &update).await
    }

    async fn reconfigure_locked(
        &self,
        device: &DeviceId,
        update: &DeviceConfig,
    ) -> Result<ConfigChange, DeviceError> {
        let (current, control) = {
            let devices = self.registry.read().await;
            let entry = devices
                .get(device)
                .ok_or_else(|| DeviceError::NotFound(device.clone()))?;
            if entry.state == DeviceState::Stopping {
                return Err(DeviceError::Stopping(device.clone()));
            }
            (entry.config.clone(), entry.pipeline.worker_control.clone())
        };

        let next = current.merged(update);
        let change = current.compare(&next);

        match &change {
            ConfigChange::Unchanged => {
                tracing::trace!(device = %device, "Configuration unchanged");
            }
            ConfigChange::NonBreaking => {
                control
                    .send(WorkerCommand::Configure {
                        update: update.clone(),
                        ack: None,
                    })
                    .map_err(|_| DeviceError::WorkerGone(device.clone()))?;

                if let Some(entry) = self.registry.write().await.get_mut(device) {
                    entry.config = next;
                }

                tracing::debug!(device = %device, "Non-breaking configuration forwarded");
                self.emit(HubEvent::DeviceReconfigured {
                    device: device.clone(),
                    breaking: false,
                    reason: None,
                });
            }
            ConfigChange::Breaking { reason } => {
                let (ack, acked) = oneshot::channel();
                control
                    .send(WorkerCommand::Configure {
                        update: update.clone(),
                        ack: Some(ack),
                    })
                    .map_err(|_| DeviceError::WorkerGone(device.clone()))?;

                let applied = match tokio::time::timeout(self.config.config_ack_timeout, acked).await {
                    Ok(Ok(applied)) => applied,
                    Ok(Err(_)) => return Err(DeviceError::WorkerGone(device.clone())),
                    Err(_) => {
                        tracing::warn!(device = %device, "Worker did not acknowledge configuration");
                        return Err(DeviceError::Timeout(device.clone()));
                    }
                };
                if applied != next {
                    return Err(DeviceError::Rejected(device.clone()));
                }

                let flushed = {
                    let mut devices = self.registry.write().await;
                    let entry = devices
                        .get_mut(device)
                        .ok_or_else(|| DeviceError::NotFound(device.clone()))?;
                    entry.config = applied;
                    flush_device(entry)
                };

                tracing::info!(device = %device, reason = %reason, flushed = flushed, "Breaking reconfiguration applied");
                self.emit(HubEvent::DeviceReconfigured {
                    device: device.clone(),
                    breaking: true,
                    reason: Some(reason.clone()),
                });
            }
        }

        Ok(change)
    }

    /// Detach `client` from the device
    ///
    /// The client's own consumers and recorder are stopped. When the last
    /// client leaves, the pipeline is torn down in the background: consumers
    /// first, then the spectrum processor and the worker. The registry entry
    /// is removed by [`finish_teardown`](Self::finish_teardown) once the
    /// helper reports back.
    pub async fn stop(&self, device: &DeviceId, client: &SessionId) -> Result<StopOutcome, DeviceError> {
        let _ops = self.ops.lock().await;
        let mut devices = self.registry.write().await;

        let entry = devices
            .get_mut(device)
            .ok_or_else(|| DeviceError::NotFound(device.clone()))?;
        if !entry.clients.remove(client) {
            return Err(DeviceError::NotAttached {
                device: device.clone(),
                client: client.clone(),
            });
        }

        let mut consumers = entry.take_session_consumers(client);
        let mut recorders: Vec<(SessionId, RecorderEntry)> = entry
            .recorders
            .remove(client)
            .map(|r| (client.clone(), r))
            .into_iter()
            .collect();

        if !entry.clients.is_empty() {
            let remaining = entry.clients.len();
            let stopped = describe(&consumers);
            let iq = entry.pipeline.broadcaster.clone();
            drop(devices);

            retire(consumers, &iq, self.config.ladder(), false, &self.plane);
            for (session, recorder) in recorders {
                iq.unsubscribe(&recorder.subscription);
                self.reap_recorder(device, &session, recorder.process);
            }

            tracing::info!(device = %device, client = %client, remaining = remaining, consumers = stopped.len(), "Client detached");
            self.emit(HubEvent::ClientDetached {
                device: device.clone(),
                client: client.clone(),
                remaining,
            });
            return Ok(StopOutcome {
                stopped,
                tearing_down: false,
            });
        }

        entry.state = DeviceState::Stopping;
        entry.pipeline.broadcaster.stop();
        consumers.extend(entry.take_all_consumers());
        recorders.extend(entry.recorders.drain());
        let pipeline = entry.pipeline.clone();
        drop(devices);

        let stopped = describe(&consumers);
        tracing::info!(device = %device, client = %client, consumers = stopped.len(), "Last client left, stopping device");
        self.emit(HubEvent::ClientDetached {
            device: device.clone(),
            client: client.clone(),
            remaining: 0,
        });
        self.emit(HubEvent::DeviceStopping {
            device: device.clone(),
        });
        self.spawn_teardown(device.clone(), pipeline, consumers, recorders);

        Ok(StopOutcome {
            stopped,
            tearing_down: true,
        })
    }

    /// Tear the device down because it can no longer run
    ///
    /// With `origin` set, the failure is only acted upon if it came from the
    /// device's current worker. Returns whether a teardown was started.
    pub async fn fail(&self, device: &DeviceId, origin: Option<ProcessId>, message: &str) -> bool {
        let _ops = self.ops.lock().await;
        let mut devices = self.registry.write().await;

        let Some(entry) = devices.get_mut(device) else {
            return false;
        };
        if entry.state == DeviceState::Stopping {
            return false;
        }
        if origin.is_some_and(|origin| origin != entry.pipeline.worker.id()) {
            tracing::debug!(device = %device, origin = ?origin, "Ignoring failure from a previous worker");
            return false;
        }

        entry.state = DeviceState::Stopping;
        entry.pipeline.broadcaster.stop();
        let clients: Vec<SessionId> = std::mem::take(&mut entry.clients).into_iter().collect();
        let consumers = entry.take_all_consumers();
        let recorders: Vec<(SessionId, RecorderEntry)> = entry.recorders.drain().collect();
        let pipeline = entry.pipeline.clone();
        drop(devices);

        tracing::error!(device = %device, error = %message, clients = clients.len(), "Device failed, tearing down");
        self.emit(HubEvent::DeviceError {
            device: device.clone(),
            message: message.to_string(),
            clients,
        });
        self.emit(HubEvent::DeviceStopping {
            device: device.clone(),
        });
        self.spawn_teardown(device.clone(), pipeline, consumers, recorders);
        true
    }

    /// Fail every running device whose broadcaster or worker has exited
    ///
    /// Returns the devices that were failed.
    pub async fn check_health(&self) -> Vec<DeviceId> {
        let unhealthy: Vec<(DeviceId, &'static str)> = {
            let devices = self.registry.read().await;
            devices
                .values()
                .filter(|entry| entry.state == DeviceState::Running)
                .filter_map(|entry| {
                    let pipeline = &entry.pipeline;
                    let reason = if !pipeline.broadcaster.is_alive() {
                        "sample broadcaster exited"
                    } else if !pipeline.worker.is_alive() {
                        "capture worker exited"
                    } else if !pipeline.spectrum.is_alive() {
                        "spectrum processor exited"
                    } else {
                        return None;
                    };
                    Some((entry.id.clone(), reason))
                })
                .collect()
        };

        let mut failed = Vec::new();
        for (device, reason) in unhealthy {
            if self.fail(&device, None, reason).await {
                failed.push(device);
            }
        }
        failed
    }

    fn spawn_teardown(
        &self,
        device: DeviceId,
        pipeline: Pipeline,
        consumers: Vec<(SlotKey, ConsumerEntry)>,
        recorders: Vec<(SessionId, RecorderEntry)>,
    ) {
        let ladder = self.config.ladder();
        let plane = self.plane.clone();

        let mut helpers = retire(consumers, &pipeline.broadcaster, ladder, false, &plane);
        for (session, recorder) in recorders {
            pipeline.broadcaster.unsubscribe(&recorder.subscription);
            helpers.push(self.reap_recorder(&device, &session, recorder.process));
        }

        tokio::spawn(async move {
            for helper in helpers {
                let _ = helper.await;
            }

            let mut ladders = JoinSet::new();
            for (subject, process) in [("spectrum", pipeline.spectrum), ("worker", pipeline.worker)] {
                ladders.spawn(async move {
                    let stage = shutdown(process.as_ref(), &ladder).await;
                    (subject, process.id(), stage)
                });
            }
            while let Some(done) = ladders.join_next().await {
                if let Ok((subject, process, stage)) = done {
                    let _ = plane.send(PlaneEvent::ProcessReaped {
                        device: device.clone(),
                        subject: subject.to_string(),
                        process,
                        stage,
                    });
                }
            }

            pipeline.spectrum_channel.close();
            pipeline.broadcast_channel.close();

            tracing::debug!(device = %device, "Device processes exited");
            let _ = plane.send(PlaneEvent::DeviceTornDown { device });
        });
    }

    /// Remove the entry of a device whose teardown helper finished
    pub async fn finish_teardown(&self, device: &DeviceId) -> bool {
        let removed = {
            let mut devices = self.registry.write().await;
            match devices.get(device) {
                Some(entry) if entry.state == DeviceState::Stopping => devices.remove(device),
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                tracing::info!(
                    device = %device,
                    uptime_secs = entry.created_at.elapsed().as_secs(),
                    "Device stopped"
                );
                self.emit(HubEvent::DeviceStopped {
                    device: device.clone(),
                });
                true
            }
            None => false,
        }
    }

    /// Start recording the device's IQ stream for `session`
    pub async fn start_recorder(
        &self,
        device: &DeviceId,
        session: &SessionId,
        path: PathBuf,
    ) -> Result<ProcessId, DeviceError> {
        let _ops = self.ops.lock().await;
        let mut devices = self.registry.write().await;

        let entry = devices
            .get_mut(device)
            .ok_or_else(|| DeviceError::NotFound(device.clone()))?;
        if !entry.is_running() {
            return Err(DeviceError::Stopping(device.clone()));
        }
        let iq = entry.pipeline.broadcaster.clone();

        if let Some(existing) = entry.recorders.get(session) {
            if existing.process.is_alive() {
                return Err(DeviceError::RecorderExists {
                    device: device.clone(),
                    session: session.clone(),
                });
            }
            // Recorder exited on its own (write error); replace it
            iq.unsubscribe(&existing.subscription);
        }

        let key = SubscriberKey::for_recorder(session);
        let input = iq.subscribe(key.clone(), self.config.subscriber_queue_capacity, DeliveryMode::CrossProcess)?;

        let setup = RecorderSetup {
            device: device.clone(),
            session: session.clone(),
            path: path.clone(),
            input,
            plane: self.plane.clone(),
        };
        let process = TaskProcess::spawn(format!("recorder:{}", session), move |ctx| {
            run_recorder(ctx, setup)
        });
        let id = process.id();

        entry.recorders.insert(
            session.clone(),
            RecorderEntry {
                process: Arc::new(process),
                subscription: key,
                path,
                started_at: Instant::now(),
            },
        );

        tracing::info!(device = %device, session = %session, process = %id, "Recorder started");
        Ok(id)
    }

    /// Stop the recorder of `session`
    pub async fn stop_recorder(&self, device: &DeviceId, session: &SessionId) -> Result<(), DeviceError> {
        let _ops = self.ops.lock().await;

        let (recorder, iq) = {
            let mut devices = self.registry.write().await;
            let entry = devices
                .get_mut(device)
                .ok_or_else(|| DeviceError::NotFound(device.clone()))?;
            let recorder = entry.recorders.remove(session).ok_or_else(|| DeviceError::NoRecorder {
                device: device.clone(),
                session: session.clone(),
            })?;
            (recorder, entry.pipeline.broadcaster.clone())
        };

        iq.unsubscribe(&recorder.subscription);
        tracing::info!(
            device = %device,
            session = %session,
            secs = recorder.started_at.elapsed().as_secs(),
            "Recorder stopping"
        );
        self.reap_recorder(device, session, recorder.process);
        Ok(())
    }

    fn reap_recorder(
        &self,
        device: &DeviceId,
        session: &SessionId,
        process: Arc<dyn ProcessHandle>,
    ) -> tokio::task::JoinHandle<crate::process::ExitStage> {
        let plane = self.plane.clone();
        let device = device.clone();
        let subject = format!("recorder {}", session);
        let id = process.id();
        crate::process::spawn_shutdown(process, self.config.ladder(), false, move |stage| {
            let _ = plane.send(PlaneEvent::ProcessReaped {
                device,
                subject,
                process: id,
                stage,
            });
        })
    }

    /// Ask the worker for the configuration it is running with
    pub async fn current_config(&self, device: &DeviceId) -> Result<ConfigSnapshot, DeviceError> {
        let control = {
            let devices = self.registry.read().await;
            let entry = devices
                .get(device)
                .ok_or_else(|| DeviceError::NotFound(device.clone()))?;
            entry.pipeline.worker_control.clone()
        };

        worker::query(&control, self.config.config_ack_timeout)
            .await
            .map_err(|e| match e {
                SourceError::Timeout => DeviceError::Timeout(device.clone()),
                _ => DeviceError::WorkerGone(device.clone()),
            })
    }

    /// Statistics snapshot of one device
    pub async fn device_stats(&self, device: &DeviceId) -> Result<DeviceStats, DeviceError> {
        let devices = self.registry.read().await;
        let entry = devices
            .get(device)
            .ok_or_else(|| DeviceError::NotFound(device.clone()))?;

        Ok(DeviceStats {
            device: entry.id.clone(),
            clients: entry.clients.iter().cloned().collect(),
            demodulators: entry.consumer_count(crate::consumer::RoleKind::Demodulator),
            decoders: entry.consumer_count(crate::consumer::RoleKind::Decoder),
            recorders: entry.recorders.len(),
            config: entry.config.clone(),
            uptime: entry.created_at.elapsed(),
            broadcaster: entry.pipeline.broadcaster.stats(),
        })
    }

    /// Attached clients of a device
    pub async fn clients(&self, device: &DeviceId) -> Vec<SessionId> {
        let devices = self.registry.read().await;
        devices
            .get(device)
            .map(|entry| entry.clients.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Empty every queue holding chunks captured with the previous tuning
fn flush_device(entry: &DeviceEntry) -> usize {
    let mut flushed = entry.pipeline.broadcaster.flush();
    flushed += entry.pipeline.spectrum_channel.drain();

    for vfos in entry.demodulators.values() {
        for demod in vfos.values() {
            if let Some(audio) = &demod.audio {
                flushed += audio.source().drain();
                flushed += audio.flush();
            }
        }
    }

    let _ = entry.pipeline.spectrum_control.send(SpectrumCommand::Reset);
    flushed
}

fn describe(consumers: &[(SlotKey, ConsumerEntry)]) -> Vec<(SlotKey, ConsumerRole)> {
    consumers
        .iter()
        .filter(|(_, entry)| !entry.internal)
        .map(|(slot, entry)| (slot.clone(), entry.role))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::device::source::{SampleSource, SyntheticFactory};
    use crate::sample::IqChunk;

    struct Harness {
        manager: DeviceManager,
        registry: Arc<Registry>,
        plane: mpsc::UnboundedReceiver<PlaneEvent>,
        events: broadcast::Receiver<HubEvent>,
    }

    /// Synthetic source that refuses sample rates above `max_rate`
    struct LimitedFactory {
        inner: SyntheticFactory,
        max_rate: u32,
    }

    struct LimitedSource {
        inner: Box<dyn SampleSource>,
        max_rate: u32,
    }

    #[async_trait]
    impl SampleSource for LimitedSource {
        async fn read(&mut self) -> Result<Vec<num_complex::Complex32>, SourceError> {
            self.inner.read().await
        }

        fn apply(&mut self, config: &ConfigSnapshot) -> Result<(), SourceError> {
            match config.sample_rate {
                Some(rate) if rate > self.max_rate => Err(SourceError::Unsupported(format!("sample rate {}", rate))),
                _ => self.inner.apply(config),
            }
        }
    }

    impl SourceFactory for LimitedFactory {
        fn open(&self, device: &DeviceId, config: &ConfigSnapshot) -> Result<Box<dyn SampleSource>, SourceError> {
            Ok(Box::new(LimitedSource {
                inner: self.inner.open(device, config)?,
                max_rate: self.max_rate,
            }))
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(SyntheticFactory {
            tone_offset_hz: 1_000.0,
            block: Duration::from_millis(2),
        }))
    }

    fn harness_with(sources: Arc<dyn SourceFactory>) -> Harness {
        let registry = Arc::new(Registry::new());
        let config = HubConfig::default().termination_timeouts(
            Duration::from_millis(50),
            Duration::from_millis(30),
            Duration::from_millis(30),
        );
        let (plane_tx, plane) = mpsc::unbounded_channel();
        let (events_tx, events) = broadcast::channel(256);

        Harness {
            manager: DeviceManager::new(Arc::clone(&registry), Arc::new(config), sources, plane_tx, events_tx),
            registry,
            plane,
            events,
        }
    }

    fn rtl() -> DeviceId {
        DeviceId::new("rtl-0")
    }

    fn tuned() -> DeviceConfig {
        DeviceConfig::new().sample_rate(48_000).center_freq(145_800_000)
    }

    async fn worker_id(registry: &Registry) -> ProcessId {
        registry.read().await.get(&rtl()).unwrap().pipeline.worker.id()
    }

    async fn wait_torn_down(plane: &mut mpsc::UnboundedReceiver<PlaneEvent>) {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), plane.recv()).await.unwrap() {
                Some(PlaneEvent::DeviceTornDown { .. }) => return,
                Some(_) => continue,
                None => panic!("plane closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_second_client_attaches_without_new_processes() {
        let h = harness();

        let first = h.manager.start(rtl(), tuned(), SessionId::new("a")).await.unwrap();
        assert!(first.created);
        let worker = worker_id(&h.registry).await;

        let second = h
            .manager
            .start(rtl(), DeviceConfig::new().gain(20.0), SessionId::new("b"))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.change, ConfigChange::NonBreaking);
        assert_eq!(worker_id(&h.registry).await, worker);
        assert_eq!(h.manager.clients(&rtl()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_detach_keeps_pipeline_for_remaining_clients() {
        let mut h = harness();
        for client in ["a", "b", "c"] {
            h.manager.start(rtl(), tuned(), SessionId::new(client)).await.unwrap();
        }

        let outcome = h.manager.stop(&rtl(), &SessionId::new("b")).await.unwrap();
        assert!(!outcome.tearing_down);
        assert_eq!(h.registry.state(&rtl()).await, Some(DeviceState::Running));
        assert_eq!(
            h.manager.clients(&rtl()).await,
            vec![SessionId::new("a"), SessionId::new("c")]
        );
        assert!(h.plane.try_recv().map_or(true, |e| !matches!(e, PlaneEvent::DeviceTornDown { .. })));
    }

    #[tokio::test]
    async fn test_last_client_tears_down_pipeline() {
        let mut h = harness();
        h.manager.start(rtl(), tuned(), SessionId::new("a")).await.unwrap();
        let (worker, iq) = {
            let devices = h.registry.read().await;
            let pipeline = &devices.get(&rtl()).unwrap().pipeline;
            (Arc::clone(&pipeline.worker), pipeline.broadcaster.clone())
        };

        let outcome = h.manager.stop(&rtl(), &SessionId::new("a")).await.unwrap();
        assert!(outcome.tearing_down);
        assert_eq!(h.registry.state(&rtl()).await, Some(DeviceState::Stopping));

        let err = h.manager.start(rtl(), tuned(), SessionId::new("b")).await.unwrap_err();
        assert_eq!(err, DeviceError::Stopping(rtl()));

        wait_torn_down(&mut h.plane).await;
        assert!(!worker.is_alive());
        assert!(!iq.is_alive());
        // Entry survives until the control plane acknowledges the teardown
        assert!(h.registry.contains(&rtl()).await);

        assert!(h.manager.finish_teardown(&rtl()).await);
        assert!(!h.registry.contains(&rtl()).await);
        assert!(!h.manager.finish_teardown(&rtl()).await);
    }

    #[tokio::test]
    async fn test_attach_with_rejected_config_keeps_client() {
        let mut h = harness_with(Arc::new(LimitedFactory {
            inner: SyntheticFactory::default(),
            max_rate: 250_000,
        }));
        h.manager.start(rtl(), tuned(), SessionId::new("a")).await.unwrap();

        let err = h
            .manager
            .start(rtl(), DeviceConfig::new().sample_rate(2_400_000), SessionId::new("b"))
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::Rejected(rtl()));

        assert_eq!(
            h.manager.clients(&rtl()).await,
            vec![SessionId::new("a"), SessionId::new("b")]
        );
        assert_eq!(h.manager.current_config(&rtl()).await.unwrap().sample_rate, Some(48_000));
        loop {
            match h.events.try_recv() {
                Ok(HubEvent::ClientAttached { client, clients, .. }) => {
                    assert_eq!(client, SessionId::new("b"));
                    assert_eq!(clients, 2);
                    break;
                }
                Ok(_) => continue,
                Err(e) => panic!("no attach event: {:?}", e),
            }
        }

        // The rejected client detaches like any other
        let outcome = h.manager.stop(&rtl(), &SessionId::new("b")).await.unwrap();
        assert!(!outcome.tearing_down);
    }

    #[tokio::test]
    async fn test_unknown_client_is_rejected() {
        let h = harness();
        h.manager.start(rtl(), tuned(), SessionId::new("a")).await.unwrap();

        let err = h.manager.stop(&rtl(), &SessionId::new("zz")).await.unwrap_err();
        assert!(matches!(err, DeviceError::NotAttached { .. }));
        assert_eq!(
            h.manager.stop(&DeviceId::new("nope"), &SessionId::new("a")).await.unwrap_err(),
            DeviceError::NotFound(DeviceId::new("nope"))
        );
    }

    #[tokio::test]
    async fn test_breaking_reconfigure_flushes_subscribers() {
        let h = harness();
        h.manager.start(rtl(), tuned(), SessionId::new("a")).await.unwrap();

        let probe = {
            let devices = h.registry.read().await;
            devices
                .get(&rtl())
                .unwrap()
                .pipeline
                .broadcaster
                .subscribe(SubscriberKey::new("probe"), 1024, DeliveryMode::InProcess)
                .unwrap()
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!probe.is_empty());

        let change = h
            .manager
            .reconfigure(&rtl(), DeviceConfig::new().sample_rate(96_000))
            .await
            .unwrap();
        assert!(matches!(change, ConfigChange::Breaking { .. }));

        let stale: Vec<IqChunk> = std::iter::from_fn(|| probe.try_recv().ok())
            .filter(|c| c.sample_rate != 96_000)
            .collect();
        assert!(stale.is_empty());

        let next = tokio::time::timeout(Duration::from_secs(1), probe.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.sample_rate, 96_000);
        assert_eq!(
            h.manager.current_config(&rtl()).await.unwrap().sample_rate,
            Some(96_000)
        );
    }

    #[tokio::test]
    async fn test_worker_fatal_from_stale_origin_is_ignored() {
        let mut h = harness();
        h.manager.start(rtl(), tuned(), SessionId::new("a")).await.unwrap();
        let worker = worker_id(&h.registry).await;

        assert!(!h.manager.fail(&rtl(), Some(ProcessId::next()), "old worker").await);
        assert_eq!(h.registry.state(&rtl()).await, Some(DeviceState::Running));

        assert!(h.manager.fail(&rtl(), Some(worker), "usb gone").await);
        loop {
            match h.events.recv().await.unwrap() {
                HubEvent::DeviceError { message, clients, .. } => {
                    assert_eq!(message, "usb gone");
                    assert_eq!(clients, vec![SessionId::new("a")]);
                    break;
                }
                _ => continue,
            }
        }
        wait_torn_down(&mut h.plane).await;
    }

    #[tokio::test]
    async fn test_health_check_fails_device_with_dead_broadcaster() {
        let h = harness();
        h.manager.start(rtl(), tuned(), SessionId::new("a")).await.unwrap();
        assert!(h.manager.check_health().await.is_empty());

        h.registry.read().await.get(&rtl()).unwrap().pipeline.broadcaster.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.manager.check_health().await, vec![rtl()]);
        assert_eq!(h.registry.state(&rtl()).await, Some(DeviceState::Stopping));
    }

    #[tokio::test]
    async fn test_recorder_lifecycle() {
        let h = harness();
        h.manager.start(rtl(), tuned(), SessionId::new("a")).await.unwrap();
        let session = SessionId::new("a");
        let path = std::env::temp_dir().join(format!("sdr-hub-mgr-{}.iq", std::process::id()));

        h.manager.start_recorder(&rtl(), &session, path.clone()).await.unwrap();
        let err = h.manager.start_recorder(&rtl(), &session, path.clone()).await.unwrap_err();
        assert!(matches!(err, DeviceError::RecorderExists { .. }));

        let stats = h.manager.device_stats(&rtl()).await.unwrap();
        assert_eq!(stats.recorders, 1);
        let sub = stats
            .broadcaster
            .subscription(&SubscriberKey::for_recorder(&session))
            .unwrap();
        assert_eq!(sub.mode, DeliveryMode::CrossProcess);

        h.manager.stop_recorder(&rtl(), &session).await.unwrap();
        assert!(matches!(
            h.manager.stop_recorder(&rtl(), &session).await.unwrap_err(),
            DeviceError::NoRecorder { .. }
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tokio::fs::remove_file(&path).await;
    }
}
