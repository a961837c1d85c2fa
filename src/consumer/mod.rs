//! Demodulators and decoders
//!
//! Consumers occupy slots identified by (device, session, VFO); each slot
//! holds at most one demodulator and one decoder.
//!
//! ```text
//!   Broadcaster<IqChunk> ──► demodulator ──► Broadcaster<AudioChunk> ──► audio decoder
//!            │
//!            └──────────────────────────────────────────────────────► raw-IQ decoder
//! ```
//!
//! What a role consumes comes from the static capability table in
//! [`role`]. Configuration is resolved once at start and stored on the entry
//! so restarts recreate the consumer identically.

pub mod builtin;
pub mod error;
pub mod factory;
pub mod manager;
pub mod resolve;
pub mod role;

pub use builtin::{DecoderSettings, Demodulator};
pub use error::ConsumerError;
pub use factory::{BuiltinFactory, ConsumerFactory, ConsumerInput, ConsumerLaunch};
pub(crate) use manager::retire;
pub use manager::{Caller, ConsumerManager, StartRequest, StartStatus};
pub use resolve::{ConfigResolver, ConsumerConfig, DefaultResolver, Overrides, TransmitterInfo};
pub use role::{Capability, ConsumerRole, DecoderKind, DemodulatorKind, InputKind, RoleKind};
