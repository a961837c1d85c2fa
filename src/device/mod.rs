//! Device pipelines
//!
//! Every device in use runs one capture worker, one spectrum processor and one
//! sample broadcaster:
//!
//! ```text
//!                 ┌──────────────┐  spectrum channel  ┌────────────────────┐
//!   SampleSource ─► Worker       ├───────────────────► Spectrum processor  ├─► SpectrumFrame
//!                 │  (config ch) │                    └────────────────────┘
//!                 │              │  broadcast channel ┌────────────────────┐
//!                 │              ├───────────────────► Broadcaster<IqChunk>├─► consumers, recorders
//!                 └──────────────┘                    └────────────────────┘
//! ```
//!
//! The [`DeviceManager`] creates this wiring on the first client's start,
//! shares it with later clients, propagates configuration changes and tears
//! everything down when the last client leaves or the device fails.

pub mod error;
pub mod manager;
pub mod recorder;
pub mod source;
pub mod spectrum;
pub mod worker;

pub use error::DeviceError;
pub use manager::{DeviceManager, StartOutcome, StopOutcome};
pub use source::{SampleSource, SourceError, SourceFactory, SyntheticFactory, SyntheticSource};
pub use spectrum::SpectrumCommand;
pub use worker::WorkerCommand;
