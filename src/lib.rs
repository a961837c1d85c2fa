//! Real-time IQ sample distribution and consumer lifecycle management
//!
//! `sdr-hub` sits between SDR capture workers and the demodulators and
//! decoders that consume their samples. Each device runs one capture worker,
//! a spectrum processor and a sample broadcaster; consumers attach per client
//! session and VFO.
//!
//! ```text
//!   SampleSource ─► worker ─┬─► spectrum processor ─► SpectrumFrame
//!                           └─► Broadcaster<IqChunk> ─┬─► demodulator ─► Broadcaster<AudioChunk> ─► decoder
//!                                                     ├─► raw-IQ decoder
//!                                                     └─► IQ recorder
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sdr_hub::{BuiltinFactory, ControlPlane, DefaultResolver, DeviceConfig, DeviceId, HubConfig, SessionId, SyntheticFactory};
//!
//! # async fn run() -> sdr_hub::Result<()> {
//! let hub = ControlPlane::spawn(
//!     HubConfig::default(),
//!     Arc::new(SyntheticFactory::default()),
//!     Arc::new(BuiltinFactory::new()),
//!     Arc::new(DefaultResolver::default()),
//! );
//!
//! let mut events = hub.subscribe_events();
//! hub.start_device(
//!     DeviceId::new("rtl-0"),
//!     DeviceConfig::new().sample_rate(2_048_000).center_freq(137_500_000),
//!     SessionId::new("tab-1"),
//! )
//! .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Slow consumers never stall the device: every subscriber has its own bounded
//! queue and chunks that do not fit are dropped and counted.

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod control;
pub mod device;
pub mod error;
pub mod process;
pub mod registry;
pub mod sample;
pub mod stats;

pub use broadcast::{BroadcastError, Broadcaster};
pub use channel::BoundedChannel;
pub use config::HubConfig;
pub use consumer::{
    BuiltinFactory, Caller, ConsumerError, ConsumerFactory, ConsumerManager, ConsumerRole, DecoderKind,
    DefaultResolver, DemodulatorKind, Overrides, StartRequest, StartStatus, TransmitterInfo,
};
pub use control::{ControlHandle, ControlPlane, HubEvent};
pub use device::{DeviceError, DeviceManager, SampleSource, SourceError, SourceFactory, SyntheticFactory};
pub use error::{Error, Result};
pub use process::{ProcessHandle, ProcessId, TaskProcess};
pub use registry::{DeviceId, Registry, SessionId, SlotKey, Vfo};
pub use sample::{AudioChunk, ConfigChange, ConfigSnapshot, DeviceConfig, IqChunk};
pub use stats::DeviceStats;
