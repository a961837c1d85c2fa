//! Consumer lifecycle manager
//!
//! Owns the demodulator and decoder entries of every device and guarantees at
//! most one live consumer per (device, session, VFO, role).
//!
//! # Single flight
//!
//! Every operation on a slot first takes that slot's async mutex. A user start
//! never queues behind another start: if a start holds the lock, or a start of
//! the same role completed within the debounce window, the request is absorbed
//! and reported as [`StartStatus::Debounced`]. Behind a stop or a restart it
//! waits for the lock instead. Restarts always wait and bypass debounce and
//! duplicate checks. Lock and debounce bookkeeping is dropped once a slot goes
//! quiet.
//!
//! # Internal demodulators
//!
//! Audio decoders need a demodulator in their slot. If none of the right kind
//! runs as an internal (decoder-owned) demodulator, one is created first and
//! the decoder subscribes to its audio broadcaster. A user who later starts
//! the same demodulator kind in that slot takes it over: the process is
//! replaced, the audio broadcaster and the decoder's subscription stay.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::broadcast::Broadcaster;
use crate::channel::BoundedChannel;
use crate::config::HubConfig;
use crate::control::{HubEvent, PlaneEvent, PlaneSender, Reporter};
use crate::process::{spawn_shutdown, ExitStage, LadderTimeouts, ProcessHandle, ProcessId};
use crate::registry::{
    ConsumerEntry, DeviceEntry, DeviceId, InputSource, Registry, SlotKey, SubscriberKey,
};
use crate::sample::IqChunk;

use super::error::ConsumerError;
use super::factory::{ConsumerFactory, ConsumerInput, ConsumerLaunch};
use super::resolve::{ConfigResolver, ConsumerConfig, Overrides, TransmitterInfo};
use super::role::{ConsumerRole, DemodulatorKind, InputKind, RoleKind};

const TAG_DEMOD: &str = "demod";
const TAG_INTERNAL_DEMOD: &str = "idemod";
const TAG_DECODER: &str = "decoder";

/// Who is asking for a start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Caller {
    /// A client request; debounced and never replaces another consumer type
    User,
    /// A restart; waits for in-flight operations and may replace
    Restart,
}

/// Consumer start request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub role: ConsumerRole,
    #[serde(default)]
    pub transmitter: Option<TransmitterInfo>,
    #[serde(default)]
    pub overrides: Overrides,
}

impl StartRequest {
    pub fn new(role: ConsumerRole) -> Self {
        Self {
            role,
            transmitter: None,
            overrides: Overrides::default(),
        }
    }

    pub fn transmitter(mut self, transmitter: TransmitterInfo) -> Self {
        self.transmitter = Some(transmitter);
        self
    }

    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Successful outcome of [`ConsumerManager::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "process", rename_all = "kebab-case")]
pub enum StartStatus {
    /// A new process was spawned
    Started(ProcessId),
    /// The same consumer type already runs in the slot
    AlreadyRunning(ProcessId),
    /// Absorbed by an in-flight or just-completed start
    Debounced,
}

/// Manages demodulator and decoder processes
pub struct ConsumerManager {
    registry: Arc<Registry>,
    config: Arc<HubConfig>,
    factory: Arc<dyn ConsumerFactory>,
    resolver: Arc<dyn ConfigResolver>,
    plane: PlaneSender,
    events: broadcast::Sender<HubEvent>,
    locks: Mutex<HashMap<SlotKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Slots whose lock is held by a start
    starting: Mutex<HashSet<SlotKey>>,
    recent: Mutex<HashMap<(SlotKey, RoleKind), Instant>>,
}

impl ConsumerManager {
    /// Create a new consumer manager
    pub fn new(
        registry: Arc<Registry>,
        config: Arc<HubConfig>,
        factory: Arc<dyn ConsumerFactory>,
        resolver: Arc<dyn ConfigResolver>,
        plane: PlaneSender,
        events: broadcast::Sender<HubEvent>,
    ) -> Self {
        Self {
            registry,
            config,
            factory,
            resolver,
            plane,
            events,
            locks: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    fn emit(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<SlotKey, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn starting_set(&self) -> MutexGuard<'_, HashSet<SlotKey>> {
        self.starting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn recent_map(&self) -> MutexGuard<'_, HashMap<(SlotKey, RoleKind), Instant>> {
        self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot_lock(&self, slot: &SlotKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.lock_map().entry(slot.clone()).or_default())
    }

    fn release_slot_lock(&self, slot: &SlotKey, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.lock_map();
        let current = locks.get(slot).is_some_and(|held| Arc::ptr_eq(held, lock));
        // Only the map and the caller hold it; nobody is waiting
        if current && Arc::strong_count(lock) == 2 {
            locks.remove(slot);
        }
    }

    fn recently_started(&self, slot: &SlotKey, kind: RoleKind) -> bool {
        self.recent_map()
            .get(&(slot.clone(), kind))
            .is_some_and(|at| at.elapsed() < self.config.debounce_window)
    }

    fn mark_started(&self, slot: &SlotKey, kind: RoleKind) {
        let window = self.config.debounce_window;
        let mut recent = self.recent_map();
        recent.retain(|_, at| at.elapsed() < window);
        recent.insert((slot.clone(), kind), Instant::now());
    }

    fn forget_started(&self, slot: &SlotKey, kind: RoleKind) {
        self.recent_map().remove(&(slot.clone(), kind));
    }

    /// Start a consumer in `slot`
    pub async fn start(
        &self,
        slot: SlotKey,
        request: StartRequest,
        caller: Caller,
    ) -> Result<StartStatus, ConsumerError> {
        let role = request.role;
        let lock = self.slot_lock(&slot);

        let guard = match caller {
            Caller::User => match self.try_begin_start(&slot, &lock) {
                Ok(guard) => guard,
                Err(true) => {
                    tracing::debug!(slot = %slot, role = %role, "Start already in flight, debounced");
                    self.release_slot_lock(&slot, &lock);
                    return Ok(StartStatus::Debounced);
                }
                Err(false) => {
                    tracing::debug!(slot = %slot, role = %role, "Slot busy with a stop or restart, waiting");
                    self.begin_start(&slot, &lock).await
                }
            },
            Caller::Restart => self.begin_start(&slot, &lock).await,
        };

        let result = self.start_locked(&slot, request, caller).await;

        self.starting_set().remove(&slot);
        drop(guard);
        self.release_slot_lock(&slot, &lock);
        result
    }

    /// Take the slot lock for a start without waiting
    ///
    /// On failure reports whether the holder is itself a start.
    fn try_begin_start(
        &self,
        slot: &SlotKey,
        lock: &Arc<tokio::sync::Mutex<()>>,
    ) -> Result<OwnedMutexGuard<()>, bool> {
        let mut starting = self.starting_set();
        match Arc::clone(lock).try_lock_owned() {
            Ok(guard) => {
                starting.insert(slot.clone());
                Ok(guard)
            }
            Err(_) => Err(starting.contains(slot)),
        }
    }

    async fn begin_start(&self, slot: &SlotKey, lock: &Arc<tokio::sync::Mutex<()>>) -> OwnedMutexGuard<()> {
        let guard = Arc::clone(lock).lock_owned().await;
        self.starting_set().insert(slot.clone());
        guard
    }

    async fn start_locked(
        &self,
        slot: &SlotKey,
        request: StartRequest,
        caller: Caller,
    ) -> Result<StartStatus, ConsumerError> {
        let role = request.role;
        if caller == Caller::User && self.recently_started(slot, role.kind()) {
            tracing::debug!(slot = %slot, role = %role, "Start within debounce window, debounced");
            return Ok(StartStatus::Debounced);
        }

        let config = self
            .resolver
            .resolve(role, request.transmitter.as_ref(), &request.overrides)?;

        if let Some(status) = self.clear_slot(slot, role, caller).await? {
            return Ok(status);
        }

        let id = self.launch(slot, role, config).await?;
        self.mark_started(slot, role.kind());
        Ok(StartStatus::Started(id))
    }

    /// Make room for `role` in the slot
    ///
    /// Returns a status if the request is already satisfied.
    async fn clear_slot(
        &self,
        slot: &SlotKey,
        role: ConsumerRole,
        caller: Caller,
    ) -> Result<Option<StartStatus>, ConsumerError> {
        let kind = role.kind();
        let (replaced, iq) = {
            let mut devices = self.registry.write().await;
            let entry = running_entry(&mut devices, &slot.device)?;

            let Some(existing) = entry.consumer(kind, &slot.session, slot.vfo) else {
                return Ok(None);
            };

            if existing.is_alive() {
                if existing.role == role {
                    if existing.internal && caller == Caller::User {
                        // Takeover happens in launch
                        return Ok(None);
                    }
                    return Ok(Some(StartStatus::AlreadyRunning(existing.process.id())));
                }
                if caller == Caller::User {
                    return Err(ConsumerError::Duplicate {
                        slot: slot.clone(),
                        existing: existing.role,
                        requested: role,
                    });
                }
            } else {
                tracing::debug!(slot = %slot, role = %existing.role, "Replacing exited consumer");
            }

            unsubscribe_input(entry, slot, existing);
            let owns_internal = existing.owns_internal_demod;
            let mut replaced: Vec<(SlotKey, ConsumerEntry)> = entry
                .remove_consumer(kind, &slot.session, slot.vfo)
                .map(|old| (slot.clone(), old))
                .into_iter()
                .collect();
            // A replaced decoder takes its internal demodulator along
            if kind == RoleKind::Decoder && owns_internal {
                let internal = entry
                    .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                    .is_some_and(|d| d.internal);
                if internal {
                    if let Some(demod) = entry.remove_consumer(RoleKind::Demodulator, &slot.session, slot.vfo) {
                        replaced.push((slot.clone(), demod));
                    }
                }
            }
            (replaced, entry.pipeline.broadcaster.clone())
        };

        let Some((_, old)) = replaced.first() else {
            return Ok(None);
        };
        let (old_role, old_internal, was_alive) = (old.role, old.internal, old.is_alive());

        let reapers = retire(replaced, &iq, self.config.replace_ladder(), true, &self.plane);
        if was_alive {
            tracing::info!(slot = %slot, old = %old_role, new = %role, "Replacing consumer of a different type");
            for reaper in reapers {
                if let Ok(stage) = reaper.await {
                    tracing::debug!(slot = %slot, stage = ?stage, "Replaced consumer joined");
                }
            }
        }
        if !old_internal {
            self.emit(HubEvent::ConsumerStopped {
                slot: slot.clone(),
                role: old_role,
            });
        }
        Ok(None)
    }

    async fn launch(
        &self,
        slot: &SlotKey,
        role: ConsumerRole,
        config: ConsumerConfig,
    ) -> Result<ProcessId, ConsumerError> {
        let mut devices = self.registry.write().await;
        let entry = running_entry(&mut devices, &slot.device)?;

        match role {
            ConsumerRole::Demodulator(kind) => {
                // An internal demodulator of this kind is taken over, keeping its audio
                let takeover = entry
                    .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                    .filter(|d| d.internal)
                    .and_then(|d| d.audio.clone());

                let demod = self.spawn_demodulator(entry, slot, kind, config, false, takeover)?;
                let id = demod.process.id();

                if let Some(old) = entry.insert_consumer(RoleKind::Demodulator, slot.session.clone(), slot.vfo, demod) {
                    entry.pipeline.broadcaster.unsubscribe(&old.subscription);
                    self.reap(slot, old.role, old.process, self.config.replace_ladder(), true);
                    tracing::info!(slot = %slot, "Internal demodulator taken over by user");
                }

                tracing::info!(slot = %slot, role = %role, process = %id, "Consumer started");
                self.emit(HubEvent::ConsumerStarted {
                    slot: slot.clone(),
                    role,
                    process: id,
                    internal: false,
                });
                Ok(id)
            }
            ConsumerRole::Decoder(_) => match role.capability().input {
                InputKind::RawIq => {
                    let key = SubscriberKey::for_slot(TAG_DECODER, slot);
                    let iq = entry.pipeline.broadcaster.clone();
                    let input = iq.subscribe(key.clone(), self.config.subscriber_queue_capacity, self.factory.delivery_mode())?;

                    let id = ProcessId::next();
                    let process = match self.factory.spawn(self.launch_spec(id, slot, role, &config, ConsumerInput::Iq(input), None)) {
                        Ok(process) => process,
                        Err(e) => {
                            iq.unsubscribe(&key);
                            return Err(e);
                        }
                    };

                    entry.insert_consumer(
                        RoleKind::Decoder,
                        slot.session.clone(),
                        slot.vfo,
                        ConsumerEntry {
                            role,
                            process,
                            subscription: key,
                            input: InputSource::DeviceIq,
                            internal: false,
                            owns_internal_demod: false,
                            config,
                            audio: None,
                            started_at: Instant::now(),
                            restarts: 0,
                        },
                    );

                    tracing::info!(slot = %slot, role = %role, process = %id, "Consumer started");
                    self.emit(HubEvent::ConsumerStarted {
                        slot: slot.clone(),
                        role,
                        process: id,
                        internal: false,
                    });
                    Ok(id)
                }
                InputKind::Audio {
                    demodulator,
                    bandwidth_hz,
                } => self.launch_audio_decoder(entry, slot, role, config, demodulator, bandwidth_hz),
            },
        }
    }

    fn launch_audio_decoder(
        &self,
        entry: &mut DeviceEntry,
        slot: &SlotKey,
        role: ConsumerRole,
        config: ConsumerConfig,
        demodulator: DemodulatorKind,
        bandwidth_hz: u32,
    ) -> Result<ProcessId, ConsumerError> {
        let wanted = ConsumerRole::Demodulator(demodulator);
        let reusable = entry
            .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
            .filter(|d| d.internal && d.role == wanted && d.is_alive())
            .and_then(|d| d.audio.clone());

        let (created, audio) = match reusable {
            Some(audio) => (None, audio),
            None => {
                // An orphaned internal demodulator would collide with the new subscription
                let orphan = entry
                    .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                    .is_some_and(|d| d.internal);
                if orphan {
                    if let Some(old) = entry.remove_consumer(RoleKind::Demodulator, &slot.session, slot.vfo) {
                        let iq = entry.pipeline.broadcaster.clone();
                        retire(vec![(slot.clone(), old)], &iq, self.config.replace_ladder(), true, &self.plane);
                    }
                }

                if let Some(existing) = entry
                    .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                    .filter(|d| d.is_alive())
                {
                    tracing::warn!(
                        slot = %slot,
                        existing = %existing.role,
                        decoder = %role,
                        "Replacing user demodulator with an internal one"
                    );
                }
                let demod = self
                    .spawn_demodulator(entry, slot, demodulator, config.internal_demodulator(bandwidth_hz), true, None)
                    .map_err(|e| ConsumerError::InternalDemodulator(e.to_string()))?;
                let audio = demod
                    .audio
                    .clone()
                    .ok_or_else(|| ConsumerError::InternalDemodulator("demodulator has no audio output".into()))?;
                (Some(demod), audio)
            }
        };

        let rollback = |created: Option<ConsumerEntry>, entry: &DeviceEntry| {
            if let Some(demod) = created {
                retire(
                    vec![(slot.clone(), demod)],
                    &entry.pipeline.broadcaster,
                    self.config.replace_ladder(),
                    true,
                    &self.plane,
                );
            }
        };

        let key = SubscriberKey::for_slot(TAG_DECODER, slot);
        let input = match audio.subscribe(key.clone(), self.config.audio_queue_capacity, self.factory.delivery_mode()) {
            Ok(input) => input,
            Err(e) => {
                rollback(created, &*entry);
                return Err(e.into());
            }
        };

        let id = ProcessId::next();
        let process = match self.factory.spawn(self.launch_spec(id, slot, role, &config, ConsumerInput::Audio(input), None)) {
            Ok(process) => process,
            Err(e) => {
                audio.unsubscribe(&key);
                rollback(created, &*entry);
                return Err(e);
            }
        };

        if let Some(demod) = created {
            let demod_id = demod.process.id();
            if let Some(old) = entry.insert_consumer(RoleKind::Demodulator, slot.session.clone(), slot.vfo, demod) {
                let old_role = old.role;
                let old_internal = old.internal;
                retire(
                    vec![(slot.clone(), old)],
                    &entry.pipeline.broadcaster,
                    self.config.replace_ladder(),
                    true,
                    &self.plane,
                );
                if !old_internal {
                    self.emit(HubEvent::ConsumerStopped {
                        slot: slot.clone(),
                        role: old_role,
                    });
                }
            }
            tracing::info!(slot = %slot, role = %wanted, process = %demod_id, "Internal demodulator started");
            self.emit(HubEvent::ConsumerStarted {
                slot: slot.clone(),
                role: wanted,
                process: demod_id,
                internal: true,
            });
        }

        entry.insert_consumer(
            RoleKind::Decoder,
            slot.session.clone(),
            slot.vfo,
            ConsumerEntry {
                role,
                process,
                subscription: key,
                input: InputSource::DemodulatorAudio,
                internal: false,
                owns_internal_demod: true,
                config,
                audio: None,
                started_at: Instant::now(),
                restarts: 0,
            },
        );

        tracing::info!(slot = %slot, role = %role, process = %id, "Consumer started");
        self.emit(HubEvent::ConsumerStarted {
            slot: slot.clone(),
            role,
            process: id,
            internal: false,
        });
        Ok(id)
    }

    /// Subscribe and spawn a demodulator; nothing is left behind on failure
    fn spawn_demodulator(
        &self,
        entry: &DeviceEntry,
        slot: &SlotKey,
        kind: DemodulatorKind,
        config: ConsumerConfig,
        internal: bool,
        audio: Option<Broadcaster<crate::sample::AudioChunk>>,
    ) -> Result<ConsumerEntry, ConsumerError> {
        let role = ConsumerRole::Demodulator(kind);
        let tag = if internal { TAG_INTERNAL_DEMOD } else { TAG_DEMOD };
        let key = SubscriberKey::for_slot(tag, slot);
        let iq = &entry.pipeline.broadcaster;

        let input = iq.subscribe(key.clone(), self.config.subscriber_queue_capacity, self.factory.delivery_mode())?;

        let fresh = audio.is_none();
        let audio = audio.unwrap_or_else(|| {
            Broadcaster::spawn(
                format!("{}:audio", slot),
                BoundedChannel::new(self.config.audio_queue_capacity),
            )
        });

        let id = ProcessId::next();
        let launch = self.launch_spec(id, slot, role, &config, ConsumerInput::Iq(input), Some(audio.source().clone()));
        match self.factory.spawn(launch) {
            Ok(process) => Ok(ConsumerEntry {
                role,
                process,
                subscription: key,
                input: InputSource::DeviceIq,
                internal,
                owns_internal_demod: false,
                config,
                audio: Some(audio),
                started_at: Instant::now(),
                restarts: 0,
            }),
            Err(e) => {
                iq.unsubscribe(&key);
                if fresh {
                    audio.stop();
                }
                Err(e)
            }
        }
    }

    fn launch_spec(
        &self,
        id: ProcessId,
        slot: &SlotKey,
        role: ConsumerRole,
        config: &ConsumerConfig,
        input: ConsumerInput,
        audio_out: Option<BoundedChannel<crate::sample::AudioChunk>>,
    ) -> ConsumerLaunch {
        ConsumerLaunch {
            process_id: id,
            slot: slot.clone(),
            role,
            config: config.clone(),
            input,
            audio_out,
            reporter: Reporter::new(self.plane.clone(), slot, role, id),
        }
    }

    /// Stop every consumer in the slot
    pub async fn stop(&self, slot: &SlotKey) -> Result<Vec<ConsumerRole>, ConsumerError> {
        self.stop_roles(slot, &[RoleKind::Decoder, RoleKind::Demodulator]).await
    }

    /// Stop the consumer of one role in the slot
    ///
    /// Stopping a decoder also stops the internal demodulator it created.
    /// Stopping a user demodulator that still feeds a decoder hands it back to
    /// the decoder as an internal demodulator instead.
    pub async fn stop_role(&self, slot: &SlotKey, kind: RoleKind) -> Result<Vec<ConsumerRole>, ConsumerError> {
        self.stop_roles(slot, &[kind]).await
    }

    async fn stop_roles(&self, slot: &SlotKey, kinds: &[RoleKind]) -> Result<Vec<ConsumerRole>, ConsumerError> {
        let lock = self.slot_lock(slot);
        let guard = Arc::clone(&lock).lock_owned().await;
        let result = self.stop_roles_locked(slot, kinds).await;
        drop(guard);
        self.release_slot_lock(slot, &lock);
        result
    }

    async fn stop_roles_locked(&self, slot: &SlotKey, kinds: &[RoleKind]) -> Result<Vec<ConsumerRole>, ConsumerError> {
        let stop_decoder = kinds.contains(&RoleKind::Decoder);
        let stop_demod = kinds.contains(&RoleKind::Demodulator);

        let mut taken = Vec::new();
        let mut stopped = Vec::new();
        let iq = {
            let mut devices = self.registry.write().await;
            let entry = devices
                .get_mut(&slot.device)
                .ok_or_else(|| ConsumerError::DeviceNotRunning(slot.device.clone()))?;

            let mut release_internal = false;
            if stop_decoder {
                if let Some(decoder) = entry.consumer(RoleKind::Decoder, &slot.session, slot.vfo) {
                    unsubscribe_input(entry, slot, decoder);
                    release_internal = decoder.owns_internal_demod;
                    if let Some(decoder) = entry.remove_consumer(RoleKind::Decoder, &slot.session, slot.vfo) {
                        stopped.push(decoder.role);
                        taken.push((slot.clone(), decoder));
                    }
                }
            }

            let demod = entry
                .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                .map(|d| d.internal);
            let feeds_decoder = entry
                .consumer(RoleKind::Decoder, &slot.session, slot.vfo)
                .is_some_and(|d| d.input == InputSource::DemodulatorAudio);

            match demod {
                Some(true) if release_internal || (stop_demod && !feeds_decoder) => {
                    if let Some(demod) = entry.remove_consumer(RoleKind::Demodulator, &slot.session, slot.vfo) {
                        entry.pipeline.broadcaster.unsubscribe(&demod.subscription);
                        taken.push((slot.clone(), demod));
                    }
                }
                Some(false) if stop_demod && feeds_decoder => {
                    if let Some(demod) = entry.consumer_mut(RoleKind::Demodulator, &slot.session, slot.vfo) {
                        demod.internal = true;
                        stopped.push(demod.role);
                        tracing::info!(slot = %slot, "User demodulator released, kept for its decoder");
                    }
                    if let Some(decoder) = entry.consumer_mut(RoleKind::Decoder, &slot.session, slot.vfo) {
                        decoder.owns_internal_demod = true;
                    }
                }
                Some(false) if stop_demod => {
                    if let Some(demod) = entry.remove_consumer(RoleKind::Demodulator, &slot.session, slot.vfo) {
                        entry.pipeline.broadcaster.unsubscribe(&demod.subscription);
                        stopped.push(demod.role);
                        taken.push((slot.clone(), demod));
                    }
                }
                _ => {}
            }

            entry.pipeline.broadcaster.clone()
        };

        for kind in kinds {
            self.forget_started(slot, *kind);
        }

        if stopped.is_empty() && taken.is_empty() {
            return Err(ConsumerError::NotFound(slot.clone()));
        }

        retire(taken, &iq, self.config.ladder(), false, &self.plane);

        for role in &stopped {
            tracing::info!(slot = %slot, role = %role, "Consumer stopped");
            self.emit(HubEvent::ConsumerStopped {
                slot: slot.clone(),
                role: *role,
            });
        }

        Ok(stopped)
    }

    /// Replace the consumers of a slot with fresh processes
    ///
    /// With `origin` set, the request came from that process: only the
    /// processes related to it are restarted, and a request from a process
    /// that no longer occupies the slot is ignored. Without `origin` every
    /// consumer in the slot is restarted, demodulator first.
    pub async fn restart(
        &self,
        slot: &SlotKey,
        reason: &str,
        origin: Option<ProcessId>,
    ) -> Result<Vec<ProcessId>, ConsumerError> {
        let lock = self.slot_lock(slot);
        let guard = Arc::clone(&lock).lock_owned().await;
        let result = self.restart_locked(slot, reason, origin).await;
        drop(guard);
        self.release_slot_lock(slot, &lock);
        result
    }

    async fn restart_locked(
        &self,
        slot: &SlotKey,
        reason: &str,
        origin: Option<ProcessId>,
    ) -> Result<Vec<ProcessId>, ConsumerError> {
        let targets = {
            let devices = self.registry.read().await;
            let entry = devices
                .get(&slot.device)
                .filter(|e| e.is_running())
                .ok_or_else(|| ConsumerError::DeviceNotRunning(slot.device.clone()))?;

            let demod = entry
                .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                .map(|d| (d.process.id(), d.internal));
            let decoder = entry
                .consumer(RoleKind::Decoder, &slot.session, slot.vfo)
                .map(|d| (d.process.id(), d.input, d.owns_internal_demod));

            restart_targets(demod, decoder, origin)
        };

        if targets.is_empty() {
            if let Some(origin) = origin {
                tracing::debug!(slot = %slot, origin = %origin, reason = reason, "Ignoring restart request from a replaced process");
                return Ok(Vec::new());
            }
            return Err(ConsumerError::NotFound(slot.clone()));
        }

        let mut restarted = Vec::with_capacity(targets.len());
        for kind in targets {
            match self.restart_one(slot, kind, reason).await {
                Ok(id) => restarted.push(id),
                Err(e) => {
                    if kind == RoleKind::Demodulator {
                        self.drop_unfed_decoder(slot).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(restarted)
    }

    /// Remove an audio decoder whose demodulator is gone
    async fn drop_unfed_decoder(&self, slot: &SlotKey) {
        let (decoder, iq) = {
            let mut devices = self.registry.write().await;
            let Some(entry) = devices.get_mut(&slot.device) else {
                return;
            };
            let fed = entry
                .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                .is_some_and(|d| d.audio.as_ref().is_some_and(|a| a.is_alive()));
            let starved = entry
                .consumer(RoleKind::Decoder, &slot.session, slot.vfo)
                .is_some_and(|d| d.input == InputSource::DemodulatorAudio);
            if fed || !starved {
                return;
            }
            let Some(decoder) = entry.remove_consumer(RoleKind::Decoder, &slot.session, slot.vfo) else {
                return;
            };
            let iq = entry.pipeline.broadcaster.clone();
            (decoder, iq)
        };

        let role = decoder.role;
        tracing::warn!(slot = %slot, role = %role, "Demodulator restart failed, removing the decoder it fed");
        retire(vec![(slot.clone(), decoder)], &iq, self.config.ladder(), true, &self.plane);
        self.forget_started(slot, RoleKind::Decoder);
        self.emit(HubEvent::ConsumerStopped {
            slot: slot.clone(),
            role,
        });
    }

    async fn restart_one(&self, slot: &SlotKey, kind: RoleKind, reason: &str) -> Result<ProcessId, ConsumerError> {
        let (role, old) = {
            let mut devices = self.registry.write().await;
            let entry = running_entry(&mut devices, &slot.device)?;
            let consumer = entry
                .consumer(kind, &slot.session, slot.vfo)
                .ok_or_else(|| ConsumerError::NotFound(slot.clone()))?;

            unsubscribe_input(entry, slot, consumer);
            if let Some(audio) = &consumer.audio {
                // Audio produced by the old process is stale
                audio.source().drain();
                audio.flush();
            }
            (consumer.role, Arc::clone(&consumer.process))
        };

        // Restarts are urgent: no cooperative stage
        old.terminate();
        self.reap(slot, role, old, self.config.ladder(), true);

        let attempts = self.config.restart_attempts.max(1);
        let mut attempt = 1;
        let last = loop {
            match self.respawn(slot, kind).await {
                Ok(id) => {
                    tracing::info!(slot = %slot, role = %role, process = %id, reason = reason, attempt = attempt, "Consumer restarted");
                    self.emit(HubEvent::ConsumerRestarted {
                        slot: slot.clone(),
                        role,
                        process: id,
                        reason: reason.to_string(),
                    });
                    return Ok(id);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = self.config.backoff_for(attempt);
                    tracing::warn!(slot = %slot, role = %role, error = %e, attempt = attempt, backoff_ms = backoff.as_millis() as u64, "Restart attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        tracing::error!(slot = %slot, role = %role, error = %last, attempts = attempt, "Restart failed, removing consumer");
        {
            let mut devices = self.registry.write().await;
            if let Some(entry) = devices.get_mut(&slot.device) {
                if let Some(consumer) = entry.remove_consumer(kind, &slot.session, slot.vfo) {
                    let iq = entry.pipeline.broadcaster.clone();
                    retire(vec![(slot.clone(), consumer)], &iq, self.config.ladder(), true, &self.plane);
                }
            }
        }

        let error = ConsumerError::RestartFailed {
            slot: slot.clone(),
            attempts: attempt,
            last: Box::new(last),
        };
        self.emit(HubEvent::ConsumerRestartFailed {
            slot: slot.clone(),
            reason: reason.to_string(),
            error: error.to_string(),
        });
        Err(error)
    }

    /// Re-subscribe and spawn a new process for an existing entry in place
    async fn respawn(&self, slot: &SlotKey, kind: RoleKind) -> Result<ProcessId, ConsumerError> {
        let mut devices = self.registry.write().await;
        let entry = running_entry(&mut devices, &slot.device)?;

        let consumer = entry
            .consumer(kind, &slot.session, slot.vfo)
            .ok_or_else(|| ConsumerError::NotFound(slot.clone()))?;
        let role = consumer.role;
        let config = consumer.config.clone();
        let key = consumer.subscription.clone();
        let source = consumer.input;
        let audio_out = consumer.audio.as_ref().map(|a| a.source().clone());
        let mode = self.factory.delivery_mode();

        let (input, unsubscribe): (ConsumerInput, Box<dyn Fn() + Send>) = match source {
            InputSource::DeviceIq => {
                let iq = entry.pipeline.broadcaster.clone();
                let ch = iq.subscribe(key.clone(), self.config.subscriber_queue_capacity, mode)?;
                let key = key.clone();
                (ConsumerInput::Iq(ch), Box::new(move || {
                    iq.unsubscribe(&key);
                }))
            }
            InputSource::DemodulatorAudio => {
                let audio = entry
                    .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                    .and_then(|d| d.audio.clone())
                    .ok_or_else(|| ConsumerError::InternalDemodulator("no demodulator feeds the slot".into()))?;
                let ch = audio.subscribe(key.clone(), self.config.audio_queue_capacity, mode)?;
                let key = key.clone();
                (ConsumerInput::Audio(ch), Box::new(move || {
                    audio.unsubscribe(&key);
                }))
            }
        };

        if role.kind() == RoleKind::Demodulator && audio_out.is_none() {
            unsubscribe();
            return Err(ConsumerError::Spawn(format!("{} has no audio output", role)));
        }

        let id = ProcessId::next();
        let process = match self.factory.spawn(self.launch_spec(id, slot, role, &config, input, audio_out)) {
            Ok(process) => process,
            Err(e) => {
                unsubscribe();
                return Err(e);
            }
        };

        if let Some(consumer) = entry.consumer_mut(kind, &slot.session, slot.vfo) {
            consumer.process = process;
            consumer.started_at = Instant::now();
            consumer.restarts += 1;
        }
        Ok(id)
    }

    /// Restart every consumer of a device
    ///
    /// Used after a breaking reconfiguration. Failures are reported as events
    /// and do not stop the remaining restarts.
    pub async fn restart_device(&self, device: &DeviceId, reason: &str) -> Vec<(SlotKey, Result<Vec<ProcessId>, ConsumerError>)> {
        let slots = {
            let devices = self.registry.read().await;
            let Some(entry) = devices.get(device) else {
                return Vec::new();
            };
            let mut slots = entry.slots(RoleKind::Demodulator);
            for slot in entry.slots(RoleKind::Decoder) {
                if !slots.contains(&slot) {
                    slots.push(slot);
                }
            }
            slots
        };

        tracing::info!(device = %device, slots = slots.len(), reason = reason, "Restarting device consumers");

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            let result = self.restart(&slot, reason, None).await;
            if let Err(e) = &result {
                tracing::warn!(slot = %slot, error = %e, "Consumer restart after reconfiguration failed");
            }
            results.push((slot, result));
        }
        results
    }

    fn reap(
        &self,
        slot: &SlotKey,
        role: ConsumerRole,
        process: Arc<dyn ProcessHandle>,
        ladder: LadderTimeouts,
        forceful: bool,
    ) -> JoinHandle<ExitStage> {
        reap(slot, role, process, ladder, forceful, &self.plane)
    }
}

fn running_entry<'a>(
    devices: &'a mut HashMap<DeviceId, DeviceEntry>,
    device: &DeviceId,
) -> Result<&'a mut DeviceEntry, ConsumerError> {
    devices
        .get_mut(device)
        .filter(|entry| entry.is_running())
        .ok_or_else(|| ConsumerError::DeviceNotRunning(device.clone()))
}

/// Remove a consumer's subscription from whichever broadcaster feeds it
fn unsubscribe_input(entry: &DeviceEntry, slot: &SlotKey, consumer: &ConsumerEntry) {
    match consumer.input {
        InputSource::DeviceIq => {
            entry.pipeline.broadcaster.unsubscribe(&consumer.subscription);
        }
        InputSource::DemodulatorAudio => {
            if let Some(audio) = entry
                .consumer(RoleKind::Demodulator, &slot.session, slot.vfo)
                .and_then(|d| d.audio.as_ref())
            {
                audio.unsubscribe(&consumer.subscription);
            }
        }
    }
}

/// Which roles a restart request touches, demodulator first
fn restart_targets(
    demod: Option<(ProcessId, bool)>,
    decoder: Option<(ProcessId, InputSource, bool)>,
    origin: Option<ProcessId>,
) -> Vec<RoleKind> {
    let decoder_on_audio = decoder.is_some_and(|(_, input, _)| input == InputSource::DemodulatorAudio);
    let decoder_owns_demod = decoder.is_some_and(|(_, _, owns)| owns) && demod.is_some_and(|(_, internal)| internal);

    let Some(origin) = origin else {
        let mut all = Vec::new();
        if demod.is_some() {
            all.push(RoleKind::Demodulator);
        }
        if decoder.is_some() {
            all.push(RoleKind::Decoder);
        }
        return all;
    };

    if demod.is_some_and(|(id, _)| id == origin) {
        let mut targets = vec![RoleKind::Demodulator];
        if decoder_on_audio {
            targets.push(RoleKind::Decoder);
        }
        targets
    } else if decoder.is_some_and(|(id, _, _)| id == origin) {
        if decoder_owns_demod {
            vec![RoleKind::Demodulator, RoleKind::Decoder]
        } else {
            vec![RoleKind::Decoder]
        }
    } else {
        Vec::new()
    }
}

fn reap(
    slot: &SlotKey,
    role: ConsumerRole,
    process: Arc<dyn ProcessHandle>,
    ladder: LadderTimeouts,
    forceful: bool,
    plane: &PlaneSender,
) -> JoinHandle<ExitStage> {
    let plane = plane.clone();
    let device = slot.device.clone();
    let subject = format!("{} {}", role, slot);
    let id = process.id();
    spawn_shutdown(process, ladder, forceful, move |stage| {
        let _ = plane.send(PlaneEvent::ProcessReaped {
            device,
            subject,
            process: id,
            stage,
        });
    })
}

/// Detach consumers that were removed from their device entry and run the
/// termination ladder on each in the background
///
/// Decoders fed by a demodulator of the same batch are unsubscribed from its
/// audio broadcaster; every audio broadcaster in the batch is stopped.
pub(crate) fn retire(
    taken: Vec<(SlotKey, ConsumerEntry)>,
    iq: &Broadcaster<IqChunk>,
    ladder: LadderTimeouts,
    forceful: bool,
    plane: &PlaneSender,
) -> Vec<JoinHandle<ExitStage>> {
    for (slot, consumer) in &taken {
        match consumer.input {
            InputSource::DeviceIq => {
                iq.unsubscribe(&consumer.subscription);
            }
            InputSource::DemodulatorAudio => {
                let feeder = taken
                    .iter()
                    .find(|(s, c)| s == slot && c.audio.is_some())
                    .and_then(|(_, c)| c.audio.as_ref());
                if let Some(audio) = feeder {
                    audio.unsubscribe(&consumer.subscription);
                }
            }
        }
    }

    for (_, consumer) in &taken {
        if let Some(audio) = &consumer.audio {
            audio.stop();
        }
    }

    taken
        .into_iter()
        .map(|(slot, consumer)| reap(&slot, consumer.role, consumer.process, ladder, forceful, plane))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::{Duration, SystemTime};

    use tokio::sync::mpsc;

    use super::*;
    use crate::consumer::factory::BuiltinFactory;
    use crate::consumer::resolve::DefaultResolver;
    use crate::consumer::role::DecoderKind;
    use crate::device::{DeviceManager, SyntheticFactory};
    use crate::process::{ProcessContext, TaskProcess};
    use crate::registry::{SessionId, Vfo};
    use crate::sample::{AudioChunk, ConfigChange, DeviceConfig};
    use crate::stats::DeliveryMode;

    /// Built-in factory with spawn counting and injectable failures
    #[derive(Default)]
    struct TestFactory {
        inner: BuiltinFactory,
        spawned: AtomicU32,
        fail_demodulators: AtomicBool,
        fail_next: AtomicU32,
        stubborn: AtomicBool,
    }

    impl ConsumerFactory for TestFactory {
        fn spawn(&self, launch: ConsumerLaunch) -> Result<Arc<dyn ProcessHandle>, ConsumerError> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(ConsumerError::Spawn("injected".into()));
            }
            if self.fail_demodulators.load(Ordering::SeqCst) && launch.role.kind() == RoleKind::Demodulator {
                return Err(ConsumerError::Spawn("no demodulator binary".into()));
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);

            if self.stubborn.load(Ordering::SeqCst) {
                let process = TaskProcess::spawn_with_id(launch.process_id, "stubborn", |_ctx: ProcessContext| async move {
                    loop {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
                return Ok(Arc::new(process));
            }
            self.inner.spawn(launch)
        }
    }

    struct Harness {
        devices: DeviceManager,
        consumers: Arc<ConsumerManager>,
        registry: Arc<Registry>,
        factory: Arc<TestFactory>,
        _plane: mpsc::UnboundedReceiver<PlaneEvent>,
    }

    async fn harness(config: HubConfig) -> Harness {
        let registry = Arc::new(Registry::new());
        let config = Arc::new(config);
        let (plane, plane_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let factory = Arc::new(TestFactory::default());

        let devices = DeviceManager::new(
            Arc::clone(&registry),
            Arc::clone(&config),
            Arc::new(SyntheticFactory {
                tone_offset_hz: 1_000.0,
                block: Duration::from_millis(2),
            }),
            plane.clone(),
            events.clone(),
        );
        let consumers = Arc::new(ConsumerManager::new(
            Arc::clone(&registry),
            config,
            Arc::clone(&factory) as Arc<dyn ConsumerFactory>,
            Arc::new(DefaultResolver::default()),
            plane,
            events,
        ));

        devices
            .start(
                DeviceId::new("rtl-0"),
                DeviceConfig::new().sample_rate(240_000).center_freq(145_800_000),
                SessionId::new("s1"),
            )
            .await
            .unwrap();

        Harness {
            devices,
            consumers,
            registry,
            factory,
            _plane: plane_rx,
        }
    }

    fn fast() -> HubConfig {
        HubConfig::default()
            .termination_timeouts(Duration::from_millis(50), Duration::from_millis(30), Duration::from_millis(30))
            .restart_policy(3, Duration::from_millis(5))
    }

    fn slot(session: &str, vfo: u8) -> SlotKey {
        SlotKey::new(DeviceId::new("rtl-0"), SessionId::new(session), Vfo(vfo))
    }

    fn request(role: ConsumerRole) -> StartRequest {
        StartRequest::new(role).overrides(Overrides {
            freq: Some(145_800_000),
            ..Default::default()
        })
    }

    fn decoder(kind: DecoderKind) -> StartRequest {
        request(ConsumerRole::Decoder(kind))
    }

    fn demod(kind: DemodulatorKind) -> StartRequest {
        request(ConsumerRole::Demodulator(kind))
    }

    async fn process_of(registry: &Registry, slot: &SlotKey, kind: RoleKind) -> Option<(ProcessId, bool, u32)> {
        let devices = registry.read().await;
        devices
            .get(&slot.device)?
            .consumer(kind, &slot.session, slot.vfo)
            .map(|c| (c.process.id(), c.internal, c.restarts))
    }

    async fn live_consumers(registry: &Registry, kind: RoleKind) -> usize {
        let devices = registry.read().await;
        devices
            .values()
            .map(|entry| {
                entry
                    .slots(kind)
                    .iter()
                    .filter(|s| entry.consumer(kind, &s.session, s.vfo).is_some_and(|c| c.is_alive()))
                    .count()
            })
            .sum()
    }

    #[tokio::test]
    async fn test_concurrent_starts_create_one_consumer() {
        let h = harness(fast()).await;
        let s = slot("s1", 1);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let consumers = Arc::clone(&h.consumers);
            let s = s.clone();
            tasks.push(tokio::spawn(async move {
                consumers.start(s, decoder(DecoderKind::Lora), Caller::User).await
            }));
        }

        let mut started = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                StartStatus::Started(_) => started += 1,
                StartStatus::Debounced | StartStatus::AlreadyRunning(_) => {}
            }
        }

        assert_eq!(started, 1);
        assert_eq!(h.factory.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(live_consumers(&h.registry, RoleKind::Decoder).await, 1);
    }

    #[tokio::test]
    async fn test_debounce_then_already_running() {
        let h = harness(fast().debounce_window(Duration::from_millis(100))).await;
        let s = slot("s1", 1);

        let first = h.consumers.start(s.clone(), decoder(DecoderKind::Fsk), Caller::User).await.unwrap();
        let StartStatus::Started(id) = first else {
            panic!("expected a start, got {:?}", first);
        };
        assert_eq!(
            h.consumers.start(s.clone(), decoder(DecoderKind::Fsk), Caller::User).await.unwrap(),
            StartStatus::Debounced
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            h.consumers.start(s, decoder(DecoderKind::Fsk), Caller::User).await.unwrap(),
            StartStatus::AlreadyRunning(id)
        );
        assert_eq!(h.factory.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_type_rejected_for_user_replaced_for_restart() {
        let h = harness(fast().debounce_window(Duration::ZERO)).await;
        let s = slot("s1", 1);

        h.consumers.start(s.clone(), decoder(DecoderKind::Lora), Caller::User).await.unwrap();
        let (old, _, _) = process_of(&h.registry, &s, RoleKind::Decoder).await.unwrap();

        let err = h
            .consumers
            .start(s.clone(), decoder(DecoderKind::Bpsk), Caller::User)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Duplicate { .. }));

        let status = h
            .consumers
            .start(s.clone(), decoder(DecoderKind::Bpsk), Caller::Restart)
            .await
            .unwrap();
        let StartStatus::Started(new) = status else {
            panic!("expected a start, got {:?}", status);
        };
        assert!(new > old);

        let devices = h.registry.read().await;
        let entry = devices.get(&s.device).unwrap();
        let current = entry.consumer(RoleKind::Decoder, &s.session, s.vfo).unwrap();
        assert_eq!(current.role, ConsumerRole::Decoder(DecoderKind::Bpsk));
        assert_eq!(entry.pipeline.broadcaster.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_audio_decoder_creates_and_releases_internal_demodulator() {
        let h = harness(fast()).await;
        let s = slot("s1", 2);

        h.consumers.start(s.clone(), decoder(DecoderKind::Sstv), Caller::User).await.unwrap();

        let (demod_id, internal, _) = process_of(&h.registry, &s, RoleKind::Demodulator).await.unwrap();
        assert!(internal);
        {
            let devices = h.registry.read().await;
            let entry = devices.get(&s.device).unwrap();
            let demod = entry.consumer(RoleKind::Demodulator, &s.session, s.vfo).unwrap();
            assert_eq!(demod.role, ConsumerRole::Demodulator(DemodulatorKind::Fm));
            assert_eq!(demod.config.bandwidth_hz, 12_500);
            let decoder = entry.consumer(RoleKind::Decoder, &s.session, s.vfo).unwrap();
            assert_eq!(decoder.input, InputSource::DemodulatorAudio);
            assert!(decoder.owns_internal_demod);
            assert!(demod.audio.as_ref().unwrap().is_subscribed(&decoder.subscription));
        }

        let stopped = h.consumers.stop(&s).await.unwrap();
        assert_eq!(stopped, vec![ConsumerRole::Decoder(DecoderKind::Sstv)]);
        assert!(process_of(&h.registry, &s, RoleKind::Demodulator).await.is_none());
        assert!(ProcessId::next() > demod_id);

        let devices = h.registry.read().await;
        assert_eq!(devices.get(&s.device).unwrap().pipeline.broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_internal_demodulator_leaves_nothing_behind() {
        let h = harness(fast()).await;
        let s = slot("s1", 3);
        h.factory.fail_demodulators.store(true, Ordering::SeqCst);

        let err = h
            .consumers
            .start(s.clone(), decoder(DecoderKind::Apt), Caller::User)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::InternalDemodulator(_)));

        assert!(process_of(&h.registry, &s, RoleKind::Decoder).await.is_none());
        assert!(process_of(&h.registry, &s, RoleKind::Demodulator).await.is_none());
        let devices = h.registry.read().await;
        assert_eq!(devices.get(&s.device).unwrap().pipeline.broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_user_takes_over_internal_demodulator() {
        let h = harness(fast()).await;
        let s = slot("s1", 4);

        h.consumers.start(s.clone(), decoder(DecoderKind::Afsk), Caller::User).await.unwrap();
        let (internal_id, _, _) = process_of(&h.registry, &s, RoleKind::Demodulator).await.unwrap();

        let status = h.consumers.start(s.clone(), demod(DemodulatorKind::Fm), Caller::User).await.unwrap();
        assert!(matches!(status, StartStatus::Started(id) if id > internal_id));
        let (_, internal, _) = process_of(&h.registry, &s, RoleKind::Demodulator).await.unwrap();
        assert!(!internal);

        // The decoder keeps listening to the same audio broadcaster
        {
            let devices = h.registry.read().await;
            let entry = devices.get(&s.device).unwrap();
            let demod = entry.consumer(RoleKind::Demodulator, &s.session, s.vfo).unwrap();
            let decoder = entry.consumer(RoleKind::Decoder, &s.session, s.vfo).unwrap();
            assert!(demod.audio.as_ref().unwrap().is_subscribed(&decoder.subscription));
        }

        // Stopping the decoder leaves the user's demodulator alone
        h.consumers.stop_role(&s, RoleKind::Decoder).await.unwrap();
        let (_, internal, _) = process_of(&h.registry, &s, RoleKind::Demodulator).await.unwrap();
        assert!(!internal);
    }

    #[tokio::test]
    async fn test_restart_preserves_config_with_newer_process() {
        let h = harness(fast()).await;
        let s = slot("s1", 5);

        let overrides = Overrides {
            freq: Some(145_825_000),
            bandwidth_hz: Some(20_000),
            ..Default::default()
        };
        h.consumers
            .start(s.clone(), StartRequest::new(ConsumerRole::Decoder(DecoderKind::Lora)).overrides(overrides), Caller::User)
            .await
            .unwrap();
        let (old, _, _) = process_of(&h.registry, &s, RoleKind::Decoder).await.unwrap();

        let restarted = h.consumers.restart(&s, "shm_threshold_exceeded", Some(old)).await.unwrap();
        assert_eq!(restarted.len(), 1);
        assert!(restarted[0] > old);

        let (current, _, restarts) = process_of(&h.registry, &s, RoleKind::Decoder).await.unwrap();
        assert_eq!(current, restarted[0]);
        assert_eq!(restarts, 1);
        {
            let devices = h.registry.read().await;
            let entry = devices.get(&s.device).unwrap();
            let decoder = entry.consumer(RoleKind::Decoder, &s.session, s.vfo).unwrap();
            assert_eq!(decoder.config.freq, 145_825_000);
            assert_eq!(decoder.config.bandwidth_hz, 20_000);
            assert!(entry.pipeline.broadcaster.is_subscribed(&decoder.subscription));
        }

        // A late request from the replaced process is ignored
        assert!(h.consumers.restart(&s, "late", Some(old)).await.unwrap().is_empty());
        assert_eq!(process_of(&h.registry, &s, RoleKind::Decoder).await.unwrap().0, current);
    }

    #[tokio::test]
    async fn test_restart_during_in_flight_start() {
        let h = harness(fast()).await;
        let s = slot("s1", 6);
        h.consumers.start(s.clone(), decoder(DecoderKind::Bpsk), Caller::User).await.unwrap();

        let user = {
            let consumers = Arc::clone(&h.consumers);
            let s = s.clone();
            tokio::spawn(async move { consumers.start(s, decoder(DecoderKind::Bpsk), Caller::User).await })
        };
        let restart = {
            let consumers = Arc::clone(&h.consumers);
            let s = s.clone();
            tokio::spawn(async move { consumers.restart(&s, "shm_threshold_exceeded", None).await })
        };

        assert!(user.await.unwrap().is_ok());
        assert_eq!(restart.await.unwrap().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(live_consumers(&h.registry, RoleKind::Decoder).await, 1);
        let devices = h.registry.read().await;
        assert_eq!(devices.get(&s.device).unwrap().pipeline.broadcaster.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_retries_transient_failures() {
        let h = harness(fast()).await;
        let s = slot("s1", 7);
        h.consumers.start(s.clone(), decoder(DecoderKind::Lora), Caller::User).await.unwrap();

        h.factory.fail_next.store(2, Ordering::SeqCst);
        let restarted = h.consumers.restart(&s, "test", None).await.unwrap();
        assert_eq!(restarted.len(), 1);

        h.factory.fail_next.store(10, Ordering::SeqCst);
        let err = h.consumers.restart(&s, "test", None).await.unwrap_err();
        assert!(matches!(err, ConsumerError::RestartFailed { attempts: 3, .. }));
        assert!(process_of(&h.registry, &s, RoleKind::Decoder).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_demodulator_restart_removes_its_decoder() {
        let h = harness(fast()).await;
        let s = slot("s1", 9);
        h.consumers.start(s.clone(), decoder(DecoderKind::Sstv), Caller::User).await.unwrap();
        let decoder_process = {
            let devices = h.registry.read().await;
            let entry = devices.get(&s.device).unwrap();
            Arc::clone(&entry.consumer(RoleKind::Decoder, &s.session, s.vfo).unwrap().process)
        };

        h.factory.fail_demodulators.store(true, Ordering::SeqCst);
        let err = h.consumers.restart(&s, "test", None).await.unwrap_err();
        assert!(matches!(err, ConsumerError::RestartFailed { .. }));

        assert!(process_of(&h.registry, &s, RoleKind::Demodulator).await.is_none());
        assert!(process_of(&h.registry, &s, RoleKind::Decoder).await.is_none());

        // terminate 30ms + kill 30ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!decoder_process.is_alive());

        // The slot is usable again once demodulators can spawn
        h.factory.fail_demodulators.store(false, Ordering::SeqCst);
        let status = h.consumers.start(s.clone(), decoder(DecoderKind::Sstv), Caller::User).await.unwrap();
        assert!(matches!(status, StartStatus::Started(_)));
    }

    #[tokio::test]
    async fn test_slot_bookkeeping_is_released() {
        let h = harness(fast().debounce_window(Duration::from_millis(20))).await;

        for vfo in 1..=4 {
            let s = slot("s1", vfo);
            h.consumers.start(s.clone(), decoder(DecoderKind::Lora), Caller::User).await.unwrap();
            h.consumers.restart(&s, "test", None).await.unwrap();
        }
        assert!(h.consumers.lock_map().is_empty());
        assert!(!h.consumers.recent_map().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.consumers.start(slot("s2", 1), decoder(DecoderKind::Fsk), Caller::User).await.unwrap();
        assert_eq!(h.consumers.recent_map().len(), 1);
        assert!(h.consumers.lock_map().is_empty());
        assert!(h.consumers.starting_set().is_empty());
    }

    #[tokio::test]
    async fn test_user_start_waits_behind_stop() {
        let h = harness(fast().debounce_window(Duration::ZERO)).await;
        let s = slot("s1", 10);

        // Stands in for a stop holding the slot
        let held = h.consumers.slot_lock(&s).lock_owned().await;
        let start = {
            let consumers = Arc::clone(&h.consumers);
            let s = s.clone();
            tokio::spawn(async move { consumers.start(s, decoder(DecoderKind::Lora), Caller::User).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!start.is_finished());

        drop(held);
        let status = start.await.unwrap().unwrap();
        assert!(matches!(status, StartStatus::Started(_)));
        assert_eq!(live_consumers(&h.registry, RoleKind::Decoder).await, 1);
    }

    #[tokio::test]
    async fn test_breaking_reconfigure_empties_audio_queues() {
        let h = harness(fast()).await;
        let s = slot("s1", 11);
        h.consumers.start(s.clone(), decoder(DecoderKind::Sstv), Caller::User).await.unwrap();

        let tap = {
            let devices = h.registry.read().await;
            let entry = devices.get(&s.device).unwrap();
            let demod = entry.consumer(RoleKind::Demodulator, &s.session, s.vfo).unwrap();
            demod
                .audio
                .as_ref()
                .unwrap()
                .subscribe(SubscriberKey::new("tap"), 8, DeliveryMode::InProcess)
                .unwrap()
        };

        // Audio that was demodulated with the old tuning
        let stale = || AudioChunk::new(vec![9.0f32], 1, SystemTime::UNIX_EPOCH);
        tap.drain();
        let mut queued = 0;
        while tap.try_send(stale()).is_ok() {
            queued += 1;
        }
        assert!(queued > 0);

        let change = h
            .devices
            .reconfigure(&s.device, DeviceConfig::new().sample_rate(480_000))
            .await
            .unwrap();
        assert!(matches!(change, ConfigChange::Breaking { .. }));

        let left: Vec<AudioChunk> = std::iter::from_fn(|| tap.try_recv().ok()).collect();
        assert!(left.iter().all(|chunk| chunk.sample_rate != 1));
    }

    #[tokio::test]
    async fn test_breaking_reconfigure_renews_every_consumer() {
        let h = harness(fast()).await;
        let a = slot("s1", 1);
        let b = slot("s2", 1);

        h.consumers.start(a.clone(), demod(DemodulatorKind::Fm), Caller::User).await.unwrap();
        h.consumers.start(b.clone(), decoder(DecoderKind::Apt), Caller::User).await.unwrap();

        let before = [
            process_of(&h.registry, &a, RoleKind::Demodulator).await.unwrap().0,
            process_of(&h.registry, &b, RoleKind::Demodulator).await.unwrap().0,
            process_of(&h.registry, &b, RoleKind::Decoder).await.unwrap().0,
        ];

        let change = h
            .devices
            .reconfigure(&a.device, DeviceConfig::new().sample_rate(480_000))
            .await
            .unwrap();
        let ConfigChange::Breaking { reason } = change else {
            panic!("expected a breaking change");
        };
        let results = h.consumers.restart_device(&a.device, &reason).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        let after = [
            process_of(&h.registry, &a, RoleKind::Demodulator).await.unwrap().0,
            process_of(&h.registry, &b, RoleKind::Demodulator).await.unwrap().0,
            process_of(&h.registry, &b, RoleKind::Decoder).await.unwrap().0,
        ];
        for (old, new) in before.iter().zip(after.iter()) {
            assert!(new > old);
        }
    }

    #[tokio::test]
    async fn test_stubborn_consumer_killed_on_stop() {
        let h = harness(fast()).await;
        let s = slot("s1", 8);
        h.factory.stubborn.store(true, Ordering::SeqCst);

        h.consumers.start(s.clone(), decoder(DecoderKind::Lora), Caller::User).await.unwrap();
        let process = {
            let devices = h.registry.read().await;
            let entry = devices.get(&s.device).unwrap();
            Arc::clone(&entry.consumer(RoleKind::Decoder, &s.session, s.vfo).unwrap().process)
        };

        h.consumers.stop(&s).await.unwrap();
        assert!(process.is_alive());

        // graceful 50ms + terminate 30ms + kill 30ms
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!process.is_alive());
        assert!(matches!(h.consumers.stop(&s).await, Err(ConsumerError::NotFound(_))));
    }

    #[test]
    fn test_restart_targets() {
        let demod = ProcessId::next();
        let decoder = ProcessId::next();

        assert_eq!(
            restart_targets(Some((demod, true)), Some((decoder, InputSource::DemodulatorAudio, true)), Some(decoder)),
            vec![RoleKind::Demodulator, RoleKind::Decoder]
        );
        assert_eq!(
            restart_targets(Some((demod, false)), Some((decoder, InputSource::DeviceIq, false)), Some(demod)),
            vec![RoleKind::Demodulator]
        );
        assert_eq!(
            restart_targets(Some((demod, false)), Some((decoder, InputSource::DeviceIq, false)), Some(decoder)),
            vec![RoleKind::Decoder]
        );
        assert!(restart_targets(None, Some((decoder, InputSource::DeviceIq, false)), Some(demod)).is_empty());
        assert_eq!(
            restart_targets(Some((demod, false)), None, None),
            vec![RoleKind::Demodulator]
        );
    }
}
