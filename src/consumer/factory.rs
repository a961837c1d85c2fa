//! Consumer process factory
//!
//! The consumer manager decides what to run and wires the inputs; a
//! [`ConsumerFactory`] turns the wiring into a running process. The built-in
//! factory runs the simple bodies from [`builtin`](super::builtin); an
//! application with real DSP plugs in its own.

use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::DeliveryMode;
use crate::channel::BoundedChannel;
use crate::control::Reporter;
use crate::process::{ProcessHandle, ProcessId, TaskProcess};
use crate::registry::SlotKey;
use crate::sample::{AudioChunk, IqChunk};

use super::builtin::{run_decoder, run_demodulator, DecoderSettings};
use super::error::ConsumerError;
use super::resolve::ConsumerConfig;
use super::role::ConsumerRole;

/// Input channel handed to a consumer process
#[derive(Debug, Clone)]
pub enum ConsumerInput {
    /// Subscription to the device's sample broadcaster
    Iq(BoundedChannel<IqChunk>),
    /// Subscription to a demodulator's audio broadcaster
    Audio(BoundedChannel<AudioChunk>),
}

impl ConsumerInput {
    pub fn len(&self) -> usize {
        match self {
            ConsumerInput::Iq(ch) => ch.len(),
            ConsumerInput::Audio(ch) => ch.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match self {
            ConsumerInput::Iq(ch) => ch.capacity(),
            ConsumerInput::Audio(ch) => ch.capacity(),
        }
    }
}

/// Everything needed to launch one consumer process
#[derive(Debug)]
pub struct ConsumerLaunch {
    /// Identity the process must run under; `reporter` already carries it
    pub process_id: ProcessId,
    pub slot: SlotKey,
    pub role: ConsumerRole,
    pub config: ConsumerConfig,
    pub input: ConsumerInput,
    /// Where a demodulator publishes its audio
    pub audio_out: Option<BoundedChannel<AudioChunk>>,
    pub reporter: Reporter,
}

/// Spawns consumer processes
pub trait ConsumerFactory: Send + Sync {
    fn spawn(&self, launch: ConsumerLaunch) -> Result<Arc<dyn ProcessHandle>, ConsumerError>;

    /// How broadcasters should feed processes spawned by this factory
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::InProcess
    }
}

/// Factory running the built-in consumer bodies as tasks
#[derive(Debug, Clone, Default)]
pub struct BuiltinFactory {
    pub decoder: DecoderSettings,
}

impl BuiltinFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval between decoder stats reports
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.decoder.stats_interval = interval;
        self
    }

    /// Consecutive saturated reads after which a decoder asks to be restarted
    pub fn backlog_limit(mut self, reads: u32) -> Self {
        self.decoder.backlog_limit = reads.max(1);
        self
    }
}

impl ConsumerFactory for BuiltinFactory {
    fn spawn(&self, launch: ConsumerLaunch) -> Result<Arc<dyn ProcessHandle>, ConsumerError> {
        let name = format!("{}@{}", launch.role, launch.slot);
        let id = launch.process_id;

        let process = match launch.role {
            ConsumerRole::Demodulator(kind) => {
                let ConsumerInput::Iq(input) = launch.input else {
                    return Err(ConsumerError::Spawn(format!("{} needs raw IQ input", name)));
                };
                let Some(output) = launch.audio_out else {
                    return Err(ConsumerError::Spawn(format!("{} has no audio output", name)));
                };
                let config = launch.config;
                let reporter = launch.reporter;
                TaskProcess::spawn_with_id(id, name, move |ctx| {
                    run_demodulator(ctx, kind, config, input, output, reporter)
                })
            }
            ConsumerRole::Decoder(kind) => {
                let settings = self.decoder.clone();
                let input = launch.input;
                let reporter = launch.reporter;
                TaskProcess::spawn_with_id(id, name, move |ctx| {
                    run_decoder(ctx, kind, input, settings, reporter)
                })
            }
        };

        Ok(Arc::new(process))
    }
}
