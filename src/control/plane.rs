//! Control plane actor
//!
//! One task owns the managers and accepts commands through a [`ControlHandle`].
//! It never waits on a process or a data-plane channel itself: every command
//! runs on its own task (the managers serialize what must be serialized), and
//! the loop only dispatches commands, applies [`PlaneEvent`]s and ticks the
//! health check.
//!
//! ```text
//!   ControlHandle ──cmd──►┌──────────────┐──► DeviceManager
//!                         │ ControlPlane │──► ConsumerManager
//!   data plane ──event───►└──────┬───────┘
//!                                │ broadcast
//!                                ▼
//!                           HubEvent listeners
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{HubConfig, MIN_HEALTH_CHECK_INTERVAL};
use crate::consumer::{
    Caller, ConfigResolver, ConsumerFactory, ConsumerManager, ConsumerRole, RoleKind, StartRequest,
    StartStatus,
};
use crate::device::{DeviceManager, SourceFactory, StartOutcome, StopOutcome};
use crate::error::{Error, Result};
use crate::process::ProcessId;
use crate::registry::{DeviceId, Registry, SessionId, SlotKey};
use crate::sample::{ConfigChange, ConfigSnapshot, DeviceConfig};
use crate::stats::DeviceStats;

use super::message::{HubEvent, MessageBody, PlaneEvent};

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Request sent to the control plane
#[derive(Debug)]
enum Command {
    StartDevice {
        device: DeviceId,
        config: DeviceConfig,
        client: SessionId,
        reply: Reply<StartOutcome>,
    },
    ConfigureDevice {
        device: DeviceId,
        config: DeviceConfig,
        reply: Reply<ConfigChange>,
    },
    StopDevice {
        device: DeviceId,
        client: SessionId,
        reply: Reply<StopOutcome>,
    },
    StartConsumer {
        slot: SlotKey,
        request: StartRequest,
        reply: Reply<StartStatus>,
    },
    StopConsumer {
        slot: SlotKey,
        kind: Option<RoleKind>,
        reply: Reply<Vec<ConsumerRole>>,
    },
    RestartConsumer {
        slot: SlotKey,
        reason: String,
        reply: Reply<Vec<ProcessId>>,
    },
    StartRecorder {
        device: DeviceId,
        session: SessionId,
        path: PathBuf,
        reply: Reply<ProcessId>,
    },
    StopRecorder {
        device: DeviceId,
        session: SessionId,
        reply: Reply<()>,
    },
    CurrentConfig {
        device: DeviceId,
        reply: Reply<ConfigSnapshot>,
    },
    DeviceStats {
        device: DeviceId,
        reply: Reply<DeviceStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The control plane task state
pub struct ControlPlane {
    config: Arc<HubConfig>,
    registry: Arc<Registry>,
    devices: Arc<DeviceManager>,
    consumers: Arc<ConsumerManager>,
    events: broadcast::Sender<HubEvent>,
    commands: mpsc::Receiver<Command>,
    plane: mpsc::UnboundedReceiver<PlaneEvent>,
    health_running: Arc<AtomicBool>,
}

impl ControlPlane {
    /// Create a control plane and the handle used to drive it
    pub fn new(
        config: HubConfig,
        sources: Arc<dyn SourceFactory>,
        factory: Arc<dyn ConsumerFactory>,
        resolver: Arc<dyn ConfigResolver>,
    ) -> (Self, ControlHandle) {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new());
        let (plane_tx, plane_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);

        let devices = Arc::new(DeviceManager::new(
            Arc::clone(&registry),
            Arc::clone(&config),
            sources,
            plane_tx.clone(),
            events.clone(),
        ));
        let consumers = Arc::new(ConsumerManager::new(
            Arc::clone(&registry),
            Arc::clone(&config),
            factory,
            resolver,
            plane_tx,
            events.clone(),
        ));

        let handle = ControlHandle {
            commands: commands_tx,
            events: events.clone(),
        };

        let plane = Self {
            config,
            registry,
            devices,
            consumers,
            events,
            commands: commands_rx,
            plane: plane_rx,
            health_running: Arc::new(AtomicBool::new(false)),
        };
        (plane, handle)
    }

    /// Create a control plane and run it on a new task
    pub fn spawn(
        config: HubConfig,
        sources: Arc<dyn SourceFactory>,
        factory: Arc<dyn ConsumerFactory>,
        resolver: Arc<dyn ConfigResolver>,
    ) -> ControlHandle {
        let (plane, handle) = Self::new(config, sources, factory, resolver);
        tokio::spawn(plane.run());
        handle
    }

    /// Shared registry, for inspection
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run until a shutdown command arrives or every handle is dropped
    pub async fn run(mut self) {
        tracing::info!("Control plane running");

        // Fields are public, so a zero interval can bypass the builders
        let period = self.config.health_check_interval.max(MIN_HEALTH_CHECK_INTERVAL);
        let mut health = tokio::time::interval(period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        health.tick().await;

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.dispatch(command),
                    None => break,
                },
                Some(event) = self.plane.recv() => self.apply(event),
                _ = health.tick() => self.spawn_health_check(),
            }
        }

        self.shutdown().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        tracing::info!("Control plane stopped");
    }

    fn dispatch(&self, command: Command) {
        let devices = Arc::clone(&self.devices);
        let consumers = Arc::clone(&self.consumers);

        match command {
            Command::StartDevice {
                device,
                config,
                client,
                reply,
            } => {
                tokio::spawn(async move {
                    let result = devices.start(device, config, client).await;
                    if let Ok(outcome) = &result {
                        restart_on_breaking(&consumers, &outcome.device, &outcome.change).await;
                    }
                    let _ = reply.send(result.map_err(Error::from));
                });
            }
            Command::ConfigureDevice {
                device,
                config,
                reply,
            } => {
                tokio::spawn(async move {
                    let result = devices.reconfigure(&device, config).await;
                    if let Ok(change) = &result {
                        restart_on_breaking(&consumers, &device, change).await;
                    }
                    let _ = reply.send(result.map_err(Error::from));
                });
            }
            Command::StopDevice {
                device,
                client,
                reply,
            } => {
                tokio::spawn(async move {
                    let _ = reply.send(devices.stop(&device, &client).await.map_err(Error::from));
                });
            }
            Command::StartConsumer {
                slot,
                request,
                reply,
            } => {
                tokio::spawn(async move {
                    let result = consumers.start(slot, request, Caller::User).await;
                    let _ = reply.send(result.map_err(Error::from));
                });
            }
            Command::StopConsumer { slot, kind, reply } => {
                tokio::spawn(async move {
                    let result = match kind {
                        Some(kind) => consumers.stop_role(&slot, kind).await,
                        None => consumers.stop(&slot).await,
                    };
                    let _ = reply.send(result.map_err(Error::from));
                });
            }
            Command::RestartConsumer {
                slot,
                reason,
                reply,
            } => {
                tokio::spawn(async move {
                    let result = consumers.restart(&slot, &reason, None).await;
                    let _ = reply.send(result.map_err(Error::from));
                });
            }
            Command::StartRecorder {
                device,
                session,
                path,
                reply,
            } => {
                tokio::spawn(async move {
                    let result = devices.start_recorder(&device, &session, path).await;
                    let _ = reply.send(result.map_err(Error::from));
                });
            }
            Command::StopRecorder {
                device,
                session,
                reply,
            } => {
                tokio::spawn(async move {
                    let result = devices.stop_recorder(&device, &session).await;
                    let _ = reply.send(result.map_err(Error::from));
                });
            }
            Command::CurrentConfig { device, reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(devices.current_config(&device).await.map_err(Error::from));
                });
            }
            Command::DeviceStats { device, reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(devices.device_stats(&device).await.map_err(Error::from));
                });
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    /// Apply a data-plane report, relaying it to listeners where relevant
    fn apply(&self, event: PlaneEvent) {
        match event {
            PlaneEvent::Consumer(message) => {
                if let MessageBody::RestartRequest { reason } = &message.body {
                    let consumers = Arc::clone(&self.consumers);
                    let slot = message.slot();
                    let reason = reason.clone();
                    let origin = message.origin;
                    tracing::info!(slot = %slot, origin = %origin, reason = %reason, "Consumer requested restart");
                    tokio::spawn(async move {
                        if let Err(e) = consumers.restart(&slot, &reason, Some(origin)).await {
                            tracing::warn!(slot = %slot, error = %e, "Requested restart failed");
                        }
                    });
                }
                self.emit(HubEvent::ConsumerMessage(message));
            }
            PlaneEvent::Recorder {
                device,
                session,
                body,
            } => self.emit(HubEvent::RecorderMessage {
                device,
                session,
                body,
            }),
            PlaneEvent::Spectrum(frame) => self.emit(HubEvent::Spectrum(frame)),
            PlaneEvent::DeviceFatal {
                device,
                origin,
                message,
            } => {
                let devices = Arc::clone(&self.devices);
                tokio::spawn(async move {
                    devices.fail(&device, Some(origin), &message).await;
                });
            }
            PlaneEvent::ProcessReaped {
                device,
                subject,
                process,
                stage,
            } => {
                tracing::debug!(device = %device, subject = %subject, process = %process, stage = ?stage, "Process reaped");
                self.emit(HubEvent::ProcessReaped {
                    device,
                    subject,
                    process,
                    stage,
                });
            }
            PlaneEvent::DeviceTornDown { device } => {
                let devices = Arc::clone(&self.devices);
                tokio::spawn(async move {
                    devices.finish_teardown(&device).await;
                });
            }
        }
    }

    fn spawn_health_check(&self) {
        if self.health_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let devices = Arc::clone(&self.devices);
        let running = Arc::clone(&self.health_running);
        tokio::spawn(async move {
            let failed = devices.check_health().await;
            if !failed.is_empty() {
                tracing::warn!(devices = ?failed, "Health check failed devices");
            }
            running.store(false, Ordering::Release);
        });
    }

    fn emit(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }

    /// Detach every client and wait for the pipelines to be torn down
    async fn shutdown(&mut self) {
        let attached: Vec<(DeviceId, Vec<SessionId>)> = {
            let devices = self.registry.read().await;
            devices
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clients.iter().cloned().collect()))
                .collect()
        };
        tracing::info!(devices = attached.len(), "Shutting down control plane");

        for (device, clients) in attached {
            for client in clients {
                if let Err(e) = self.devices.stop(&device, &client).await {
                    tracing::debug!(device = %device, client = %client, error = %e, "Stop during shutdown failed");
                }
            }
        }

        // Teardown reports arrive on the plane channel; keep applying them
        let ladder = self.config.ladder();
        let deadline = Instant::now() + (ladder.graceful + ladder.terminate + ladder.kill) * 2 + Duration::from_millis(100);
        while self.registry.device_count().await > 0 {
            match tokio::time::timeout_at(deadline, self.plane.recv()).await {
                Ok(Some(PlaneEvent::DeviceTornDown { device })) => {
                    self.devices.finish_teardown(&device).await;
                }
                Ok(Some(event)) => self.apply(event),
                Ok(None) => break,
                Err(_) => {
                    let left = self.registry.device_count().await;
                    tracing::warn!(devices = left, "Shutdown deadline passed with devices still registered");
                    break;
                }
            }
        }
    }
}

/// Restart every consumer of the device after a breaking change
async fn restart_on_breaking(consumers: &ConsumerManager, device: &DeviceId, change: &ConfigChange) {
    if let ConfigChange::Breaking { reason } = change {
        consumers.restart_device(device, reason).await;
    }
}

/// Cloneable handle to a running [`ControlPlane`]
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<HubEvent>,
}

impl ControlHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| Error::ControlPlaneClosed)?;
        rx.await.map_err(|_| Error::ControlPlaneClosed)?
    }

    /// Listen to hub events
    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Start a device or attach `client` to it
    pub async fn start_device(&self, device: DeviceId, config: DeviceConfig, client: SessionId) -> Result<StartOutcome> {
        self.request(|reply| Command::StartDevice {
            device,
            config,
            client,
            reply,
        })
        .await
    }

    /// Apply a partial configuration to a running device
    pub async fn configure_device(&self, device: DeviceId, config: DeviceConfig) -> Result<ConfigChange> {
        self.request(|reply| Command::ConfigureDevice {
            device,
            config,
            reply,
        })
        .await
    }

    /// Detach `client`; the last client tears the device down
    pub async fn stop_device(&self, device: DeviceId, client: SessionId) -> Result<StopOutcome> {
        self.request(|reply| Command::StopDevice {
            device,
            client,
            reply,
        })
        .await
    }

    pub async fn start_consumer(&self, slot: SlotKey, request: StartRequest) -> Result<StartStatus> {
        self.request(|reply| Command::StartConsumer {
            slot,
            request,
            reply,
        })
        .await
    }

    /// Stop one role in the slot, or both when `kind` is `None`
    pub async fn stop_consumer(&self, slot: SlotKey, kind: Option<RoleKind>) -> Result<Vec<ConsumerRole>> {
        self.request(|reply| Command::StopConsumer { slot, kind, reply })
            .await
    }

    pub async fn restart_consumer(&self, slot: SlotKey, reason: impl Into<String>) -> Result<Vec<ProcessId>> {
        let reason = reason.into();
        self.request(|reply| Command::RestartConsumer {
            slot,
            reason,
            reply,
        })
        .await
    }

    pub async fn start_recorder(&self, device: DeviceId, session: SessionId, path: impl Into<PathBuf>) -> Result<ProcessId> {
        let path = path.into();
        self.request(|reply| Command::StartRecorder {
            device,
            session,
            path,
            reply,
        })
        .await
    }

    pub async fn stop_recorder(&self, device: DeviceId, session: SessionId) -> Result<()> {
        self.request(|reply| Command::StopRecorder {
            device,
            session,
            reply,
        })
        .await
    }

    /// Configuration the worker is actually running with
    pub async fn current_config(&self, device: DeviceId) -> Result<ConfigSnapshot> {
        self.request(|reply| Command::CurrentConfig { device, reply })
            .await
    }

    pub async fn device_stats(&self, device: DeviceId) -> Result<DeviceStats> {
        self.request(|reply| Command::DeviceStats { device, reply })
            .await
    }

    /// Tear every device down and stop the control plane
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply: tx })
            .await
            .map_err(|_| Error::ControlPlaneClosed)?;
        rx.await.map_err(|_| Error::ControlPlaneClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{BuiltinFactory, DecoderKind, DefaultResolver, DemodulatorKind, Overrides};
    use crate::device::{DeviceError, SyntheticFactory};
    use crate::registry::Vfo;

    fn hub() -> ControlHandle {
        let config = HubConfig::default()
            .termination_timeouts(Duration::from_millis(50), Duration::from_millis(30), Duration::from_millis(30))
            .restart_policy(3, Duration::from_millis(5))
            .debounce_window(Duration::ZERO)
            .health_check_interval(Duration::from_millis(20));
        ControlPlane::spawn(
            config,
            Arc::new(SyntheticFactory {
                tone_offset_hz: 2_000.0,
                block: Duration::from_millis(2),
            }),
            Arc::new(BuiltinFactory::new().backlog_limit(4)),
            Arc::new(DefaultResolver::default()),
        )
    }

    fn rtl() -> DeviceId {
        DeviceId::new("rtl-0")
    }

    fn session(id: &str) -> SessionId {
        SessionId::new(id)
    }

    fn slot(session_id: &str, vfo: u8) -> SlotKey {
        SlotKey::new(rtl(), session(session_id), Vfo(vfo))
    }

    fn tuned(role: ConsumerRole) -> StartRequest {
        StartRequest::new(role).overrides(Overrides {
            freq: Some(100_002_000),
            ..Default::default()
        })
    }

    async fn next_matching<F>(events: &mut broadcast::Receiver<HubEvent>, mut pred: F) -> HubEvent
    where
        F: FnMut(&HubEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_device_lifecycle_through_handle() {
        let hub = hub();
        let mut events = hub.subscribe_events();
        let config = DeviceConfig::new().sample_rate(240_000).center_freq(100_000_000);

        let outcome = hub.start_device(rtl(), config.clone(), session("a")).await.unwrap();
        assert!(outcome.created);
        let outcome = hub.start_device(rtl(), config, session("b")).await.unwrap();
        assert!(!outcome.created);

        let current = hub.current_config(rtl()).await.unwrap();
        assert_eq!(current.sample_rate, Some(240_000));

        hub.stop_device(rtl(), session("a")).await.unwrap();
        let outcome = hub.stop_device(rtl(), session("b")).await.unwrap();
        assert!(outcome.tearing_down);

        next_matching(&mut events, |e| matches!(e, HubEvent::DeviceStopped { .. })).await;
        let err = hub.device_stats(rtl()).await.unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_detaching_one_client_leaves_others_running() {
        let hub = hub();
        let config = DeviceConfig::new().sample_rate(240_000).center_freq(100_000_000);
        for id in ["a", "b", "c"] {
            hub.start_device(rtl(), config.clone(), session(id)).await.unwrap();
        }
        hub.start_consumer(slot("a", 1), tuned(ConsumerRole::Decoder(DecoderKind::Lora))).await.unwrap();
        hub.start_consumer(slot("b", 1), tuned(ConsumerRole::Decoder(DecoderKind::Fsk))).await.unwrap();
        hub.start_consumer(slot("c", 1), tuned(ConsumerRole::Demodulator(DemodulatorKind::Fm))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let before = hub.device_stats(rtl()).await.unwrap();

        let outcome = hub.stop_device(rtl(), session("b")).await.unwrap();
        assert!(!outcome.tearing_down);
        assert_eq!(outcome.stopped.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let after = hub.device_stats(rtl()).await.unwrap();
        assert_eq!(after.clients, vec![session("a"), session("c")]);

        for key in ["decoder:a:1", "demod:c:1"] {
            let key = crate::registry::SubscriberKey::new(key);
            let earlier = before.broadcaster.subscription(&key).unwrap().delivered;
            let later = after.broadcaster.subscription(&key).unwrap().delivered;
            assert!(later > earlier, "{} stalled", key);
        }
        assert!(after
            .broadcaster
            .subscription(&crate::registry::SubscriberKey::new("decoder:b:1"))
            .is_none());

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_breaking_configure_restarts_consumers() {
        let hub = hub();
        let mut events = hub.subscribe_events();
        hub.start_device(rtl(), DeviceConfig::new().sample_rate(240_000).center_freq(100_000_000), session("a"))
            .await
            .unwrap();
        let StartStatus::Started(old) = hub
            .start_consumer(slot("a", 1), tuned(ConsumerRole::Decoder(DecoderKind::Bpsk)))
            .await
            .unwrap()
        else {
            panic!("decoder did not start");
        };

        let change = hub
            .configure_device(rtl(), DeviceConfig::new().center_freq(100_500_000))
            .await
            .unwrap();
        assert!(matches!(change, ConfigChange::Breaking { .. }));

        let event = next_matching(&mut events, |e| matches!(e, HubEvent::ConsumerRestarted { .. })).await;
        let HubEvent::ConsumerRestarted { process, .. } = event else {
            unreachable!();
        };
        assert!(process > old);

        // Gain alone does not disturb consumers
        let change = hub.configure_device(rtl(), DeviceConfig::new().gain(20.0)).await.unwrap();
        assert_eq!(change, ConfigChange::NonBreaking);

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_breaking_configure_renews_audio_decoder_and_its_demodulator() {
        let hub = hub();
        let mut events = hub.subscribe_events();
        hub.start_device(rtl(), DeviceConfig::new().sample_rate(240_000).center_freq(100_000_000), session("a"))
            .await
            .unwrap();
        let StartStatus::Started(decoder) = hub
            .start_consumer(slot("a", 2), tuned(ConsumerRole::Decoder(DecoderKind::Sstv)))
            .await
            .unwrap()
        else {
            panic!("decoder did not start");
        };
        let event = next_matching(&mut events, |e| matches!(e, HubEvent::ConsumerStarted { internal: true, .. })).await;
        let HubEvent::ConsumerStarted { process: demod, .. } = event else {
            unreachable!();
        };

        let change = hub
            .configure_device(rtl(), DeviceConfig::new().sample_rate(480_000))
            .await
            .unwrap();
        assert!(matches!(change, ConfigChange::Breaking { .. }));

        let mut renewed = Vec::new();
        while renewed.len() < 2 {
            let event = next_matching(&mut events, |e| matches!(e, HubEvent::ConsumerRestarted { .. })).await;
            if let HubEvent::ConsumerRestarted { role, process, .. } = event {
                renewed.push((role.kind(), process));
            }
        }
        for (kind, process) in renewed {
            match kind {
                RoleKind::Demodulator => assert!(process > demod),
                RoleKind::Decoder => assert!(process > decoder),
            }
        }

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_health_interval_does_not_kill_plane() {
        let mut config = HubConfig::default();
        config.health_check_interval = Duration::ZERO;
        let hub = ControlPlane::spawn(
            config,
            Arc::new(SyntheticFactory::default()),
            Arc::new(BuiltinFactory::new()),
            Arc::new(DefaultResolver::default()),
        );

        hub.start_device(rtl(), DeviceConfig::new().sample_rate(240_000).center_freq(100_000_000), session("a"))
            .await
            .unwrap();
        assert_eq!(hub.device_stats(rtl()).await.unwrap().clients, vec![session("a")]);
        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_saturated_decoder_restarts_itself() {
        // A tiny queue and a fast source keep the decoder's input saturated
        let config = HubConfig::default()
            .termination_timeouts(Duration::from_millis(50), Duration::from_millis(30), Duration::from_millis(30))
            .subscriber_queue_capacity(1);
        let hub = ControlPlane::spawn(
            config,
            Arc::new(SyntheticFactory {
                tone_offset_hz: 0.0,
                block: Duration::from_millis(1),
            }),
            Arc::new(BuiltinFactory::new().backlog_limit(1)),
            Arc::new(DefaultResolver::default()),
        );
        let mut events = hub.subscribe_events();

        hub.start_device(rtl(), DeviceConfig::new().sample_rate(240_000).center_freq(100_000_000), session("a"))
            .await
            .unwrap();
        hub.start_consumer(slot("a", 1), tuned(ConsumerRole::Decoder(DecoderKind::Lora)))
            .await
            .unwrap();

        let event = next_matching(&mut events, |e| matches!(e, HubEvent::ConsumerRestarted { .. })).await;
        let HubEvent::ConsumerRestarted { reason, .. } = event else {
            unreachable!();
        };
        assert_eq!(reason, "input_backlog_exceeded");

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let hub = hub();
        hub.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = hub.device_stats(rtl()).await.unwrap_err();
        assert!(matches!(err, Error::ControlPlaneClosed));
    }
}
