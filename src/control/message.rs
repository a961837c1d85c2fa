//! Messages between the data plane, the control plane and listeners
//!
//! Data-plane processes never call into the managers. They report through a
//! [`PlaneSender`]; the control plane applies what needs applying and relays
//! everything else to listeners as [`HubEvent`]s.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::consumer::ConsumerRole;
use crate::process::{ExitStage, ProcessId};
use crate::registry::{DeviceId, SessionId, SlotKey, Vfo};
use crate::sample::ConfigSnapshot;

/// Payload of a consumer message, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageBody {
    Status { status: String },
    Stats { metrics: BTreeMap<String, f64> },
    Progress { percent: f32 },
    Output { format: String, data: Bytes },
    Error { message: String },
    /// Ask the control plane to replace this process
    RestartRequest { reason: String },
}

/// A message emitted by a consumer process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerMessage {
    pub device: DeviceId,
    pub session: SessionId,
    pub vfo: Vfo,
    pub role: ConsumerRole,
    /// Process that sent the message
    pub origin: ProcessId,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl ConsumerMessage {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.device.clone(), self.session.clone(), self.vfo)
    }
}

/// Averaged power snapshot from a spectrum processor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumFrame {
    pub device: DeviceId,
    pub center_freq: u64,
    pub sample_rate: u32,
    /// Mean power over the averaging window, dBFS
    pub power_db: f32,
    /// Peak sample power over the averaging window, dBFS
    pub peak_db: f32,
}

/// Report from the data plane or a background helper
#[derive(Debug, Clone)]
pub enum PlaneEvent {
    Consumer(ConsumerMessage),
    Recorder {
        device: DeviceId,
        session: SessionId,
        body: MessageBody,
    },
    Spectrum(SpectrumFrame),
    /// A worker cannot continue (hardware failed to open, read error)
    DeviceFatal {
        device: DeviceId,
        origin: ProcessId,
        message: String,
    },
    /// A background helper finished running the termination ladder
    ProcessReaped {
        device: DeviceId,
        subject: String,
        process: ProcessId,
        stage: ExitStage,
    },
    /// Every process of a stopping device has exited
    DeviceTornDown { device: DeviceId },
}

/// Sender half used by every data-plane process and helper
pub type PlaneSender = mpsc::UnboundedSender<PlaneEvent>;

/// Event published to external listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HubEvent {
    DeviceStarted {
        device: DeviceId,
        client: SessionId,
        config: ConfigSnapshot,
    },
    ClientAttached {
        device: DeviceId,
        client: SessionId,
        clients: usize,
    },
    DeviceReconfigured {
        device: DeviceId,
        breaking: bool,
        reason: Option<String>,
    },
    ClientDetached {
        device: DeviceId,
        client: SessionId,
        remaining: usize,
    },
    DeviceStopping {
        device: DeviceId,
    },
    DeviceStopped {
        device: DeviceId,
    },
    DeviceError {
        device: DeviceId,
        message: String,
        clients: Vec<SessionId>,
    },
    ConsumerStarted {
        slot: SlotKey,
        role: ConsumerRole,
        process: ProcessId,
        internal: bool,
    },
    ConsumerStopped {
        slot: SlotKey,
        role: ConsumerRole,
    },
    ConsumerRestarted {
        slot: SlotKey,
        role: ConsumerRole,
        process: ProcessId,
        reason: String,
    },
    ConsumerRestartFailed {
        slot: SlotKey,
        reason: String,
        error: String,
    },
    ConsumerMessage(ConsumerMessage),
    RecorderMessage {
        device: DeviceId,
        session: SessionId,
        #[serde(flatten)]
        body: MessageBody,
    },
    Spectrum(SpectrumFrame),
    ProcessReaped {
        device: DeviceId,
        subject: String,
        process: ProcessId,
        stage: ExitStage,
    },
}

/// Handle a consumer process uses to report to the control plane
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: PlaneSender,
    device: DeviceId,
    session: SessionId,
    vfo: Vfo,
    role: ConsumerRole,
    origin: ProcessId,
}

impl Reporter {
    pub fn new(tx: PlaneSender, slot: &SlotKey, role: ConsumerRole, origin: ProcessId) -> Self {
        Self {
            tx,
            device: slot.device.clone(),
            session: slot.session.clone(),
            vfo: slot.vfo,
            role,
            origin,
        }
    }

    /// Process this reporter speaks for
    pub fn origin(&self) -> ProcessId {
        self.origin
    }

    /// Send a message; returns false if the control plane is gone
    pub fn send(&self, body: MessageBody) -> bool {
        self.tx
            .send(PlaneEvent::Consumer(ConsumerMessage {
                device: self.device.clone(),
                session: self.session.clone(),
                vfo: self.vfo,
                role: self.role,
                origin: self.origin,
                body,
            }))
            .is_ok()
    }

    pub fn status(&self, status: impl Into<String>) -> bool {
        self.send(MessageBody::Status {
            status: status.into(),
        })
    }

    pub fn stats(&self, metrics: BTreeMap<String, f64>) -> bool {
        self.send(MessageBody::Stats { metrics })
    }

    pub fn progress(&self, percent: f32) -> bool {
        self.send(MessageBody::Progress {
            percent: percent.clamp(0.0, 100.0),
        })
    }

    pub fn output(&self, format: impl Into<String>, data: Bytes) -> bool {
        self.send(MessageBody::Output {
            format: format.into(),
            data,
        })
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(MessageBody::Error {
            message: message.into(),
        })
    }

    /// Ask to be replaced by a fresh process with the same configuration
    pub fn request_restart(&self, reason: impl Into<String>) -> bool {
        self.send(MessageBody::RestartRequest {
            reason: reason.into(),
        })
    }
}
