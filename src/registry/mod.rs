//! Per-device registry
//!
//! One [`DeviceEntry`] per SDR device that has a pipeline running or shutting
//! down. Consumers live in nested maps of their device entry.
//!
//! # Architecture
//!
//! ```text
//!                      Arc<Registry>
//!            ┌──────────────────────────────────┐
//!            │ devices: HashMap<DeviceId,       │
//!            │   DeviceEntry {                  │
//!            │     pipeline: { worker,          │
//!            │       spectrum, broadcaster },   │
//!            │     demodulators[session][vfo],  │
//!            │     decoders[session][vfo],      │
//!            │     recorders[session],          │
//!            │   }                              │
//!            │ >                                │
//!            └────────────────┬─────────────────┘
//!                             │
//!              ┌──────────────┴──────────────┐
//!              ▼                             ▼
//!        DeviceManager                ConsumerManager
//!   start / reconfigure / stop    start / stop / restart
//! ```

pub mod entry;
pub mod key;
pub mod store;

pub use entry::{ConsumerEntry, DeviceEntry, DeviceState, InputSource, Pipeline, RecorderEntry};
pub use key::{DeviceId, SessionId, SlotKey, SubscriberKey, Vfo};
pub use store::Registry;
