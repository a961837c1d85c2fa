//! Device and consumer entries
//!
//! This module defines the per-device state stored in the registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::broadcast::Broadcaster;
use crate::channel::BoundedChannel;
use crate::consumer::{ConsumerConfig, ConsumerRole, RoleKind};
use crate::device::spectrum::SpectrumCommand;
use crate::device::worker::WorkerCommand;
use crate::process::ProcessHandle;
use crate::sample::{AudioChunk, ConfigSnapshot, IqChunk};

use super::key::{DeviceId, SessionId, SlotKey, SubscriberKey, Vfo};

/// Lifecycle state of a device pipeline
///
/// A device that is absent from the registry has no pipeline at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Processes are being spawned
    Starting,
    /// Pipeline is up and accepting consumers
    Running,
    /// Teardown in progress; the entry is removed once every process exited
    Stopping,
}

/// The OS-level pipeline of one device
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Capture worker
    pub worker: Arc<dyn ProcessHandle>,
    /// Spectrum processor fed by `spectrum_channel`
    pub spectrum: Arc<dyn ProcessHandle>,
    /// Worker configuration channel
    pub worker_control: mpsc::UnboundedSender<WorkerCommand>,
    /// Spectrum processor control channel
    pub spectrum_control: mpsc::UnboundedSender<SpectrumCommand>,
    /// Worker output feeding the spectrum processor
    pub spectrum_channel: BoundedChannel<IqChunk>,
    /// Worker output feeding the sample broadcaster
    pub broadcast_channel: BoundedChannel<IqChunk>,
    /// Fan-out of raw IQ to consumers
    pub broadcaster: Broadcaster<IqChunk>,
}

/// Where a consumer gets its input from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// The device's sample broadcaster
    DeviceIq,
    /// The audio broadcaster of the demodulator in the same slot
    DemodulatorAudio,
}

/// One consumer (demodulator or decoder) in a slot
#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    /// Concrete consumer type
    pub role: ConsumerRole,
    /// Running process
    pub process: Arc<dyn ProcessHandle>,
    /// Key registered with the input broadcaster
    pub subscription: SubscriberKey,
    /// Which broadcaster `subscription` belongs to
    pub input: InputSource,
    /// Demodulator auto-created for a decoder, hidden from the user
    pub internal: bool,
    /// Decoder that created the internal demodulator of its slot
    pub owns_internal_demod: bool,
    /// Resolved configuration, reused verbatim on restart
    pub config: ConsumerConfig,
    /// Audio fan-out owned by a demodulator
    pub audio: Option<Broadcaster<AudioChunk>>,
    /// When the current process was started
    pub started_at: Instant,
    /// Number of times the slot's process has been replaced
    pub restarts: u32,
}

impl ConsumerEntry {
    /// Whether the consumer process is still running
    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }
}

/// An IQ recorder attached to a session
#[derive(Debug, Clone)]
pub struct RecorderEntry {
    pub process: Arc<dyn ProcessHandle>,
    pub subscription: SubscriberKey,
    pub path: std::path::PathBuf,
    pub started_at: Instant,
}

type SlotMap = HashMap<SessionId, HashMap<Vfo, ConsumerEntry>>;

/// Registry entry for one device
#[derive(Debug)]
pub struct DeviceEntry {
    /// Device identifier
    pub id: DeviceId,
    /// Lifecycle state
    pub state: DeviceState,
    /// Configuration the pipeline was last configured with
    pub config: ConfigSnapshot,
    /// Attached client sessions
    pub clients: BTreeSet<SessionId>,
    /// Running processes and channels
    pub pipeline: Pipeline,
    /// `demodulators[session][vfo]`
    pub demodulators: SlotMap,
    /// `decoders[session][vfo]`
    pub decoders: SlotMap,
    /// `recorders[session]`
    pub recorders: HashMap<SessionId, RecorderEntry>,
    /// When the pipeline was created
    pub created_at: Instant,
}

impl DeviceEntry {
    /// Create an entry for a freshly spawned pipeline
    pub fn new(id: DeviceId, config: ConfigSnapshot, client: SessionId, pipeline: Pipeline) -> Self {
        Self {
            id,
            state: DeviceState::Starting,
            config,
            clients: BTreeSet::from([client]),
            pipeline,
            demodulators: HashMap::new(),
            decoders: HashMap::new(),
            recorders: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    /// Whether new consumers may attach
    pub fn is_running(&self) -> bool {
        self.state == DeviceState::Running
    }

    fn map(&self, kind: RoleKind) -> &SlotMap {
        match kind {
            RoleKind::Demodulator => &self.demodulators,
            RoleKind::Decoder => &self.decoders,
        }
    }

    fn map_mut(&mut self, kind: RoleKind) -> &mut SlotMap {
        match kind {
            RoleKind::Demodulator => &mut self.demodulators,
            RoleKind::Decoder => &mut self.decoders,
        }
    }

    /// Consumer of `kind` in the slot
    pub fn consumer(&self, kind: RoleKind, session: &SessionId, vfo: Vfo) -> Option<&ConsumerEntry> {
        self.map(kind).get(session).and_then(|vfos| vfos.get(&vfo))
    }

    /// Mutable consumer of `kind` in the slot
    pub fn consumer_mut(
        &mut self,
        kind: RoleKind,
        session: &SessionId,
        vfo: Vfo,
    ) -> Option<&mut ConsumerEntry> {
        self.map_mut(kind)
            .get_mut(session)
            .and_then(|vfos| vfos.get_mut(&vfo))
    }

    /// Store a consumer, returning the one it replaced
    pub fn insert_consumer(
        &mut self,
        kind: RoleKind,
        session: SessionId,
        vfo: Vfo,
        entry: ConsumerEntry,
    ) -> Option<ConsumerEntry> {
        self.map_mut(kind).entry(session).or_default().insert(vfo, entry)
    }

    /// Remove a consumer, dropping empty session maps
    pub fn remove_consumer(
        &mut self,
        kind: RoleKind,
        session: &SessionId,
        vfo: Vfo,
    ) -> Option<ConsumerEntry> {
        let map = self.map_mut(kind);
        let vfos = map.get_mut(session)?;
        let removed = vfos.remove(&vfo);
        if vfos.is_empty() {
            map.remove(session);
        }
        removed
    }

    /// All occupied slots of `kind`
    pub fn slots(&self, kind: RoleKind) -> Vec<SlotKey> {
        let mut slots: Vec<SlotKey> = self
            .map(kind)
            .iter()
            .flat_map(|(session, vfos)| {
                vfos.keys()
                    .map(move |vfo| SlotKey::new(self.id.clone(), session.clone(), *vfo))
            })
            .collect();
        slots.sort_by(|a, b| (&a.session, a.vfo).cmp(&(&b.session, b.vfo)));
        slots
    }

    /// Remove every consumer belonging to `session`
    pub fn take_session_consumers(&mut self, session: &SessionId) -> Vec<(SlotKey, ConsumerEntry)> {
        let mut taken = Vec::new();
        for kind in [RoleKind::Decoder, RoleKind::Demodulator] {
            if let Some(vfos) = self.map_mut(kind).remove(session) {
                for (vfo, entry) in vfos {
                    taken.push((SlotKey::new(self.id.clone(), session.clone(), vfo), entry));
                }
            }
        }
        taken
    }

    /// Remove every consumer of the device
    pub fn take_all_consumers(&mut self) -> Vec<(SlotKey, ConsumerEntry)> {
        let sessions: BTreeSet<SessionId> = self
            .demodulators
            .keys()
            .chain(self.decoders.keys())
            .cloned()
            .collect();
        sessions
            .iter()
            .flat_map(|session| self.take_session_consumers(session))
            .collect()
    }

    /// Number of consumers of `kind`
    pub fn consumer_count(&self, kind: RoleKind) -> usize {
        self.map(kind).values().map(HashMap::len).sum()
    }
}
