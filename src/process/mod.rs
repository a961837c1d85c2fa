//! Process handles and escalating termination
//!
//! Capture workers, spectrum processors and consumers each run as an
//! independently supervised process. The managers only ever see a
//! [`ProcessHandle`]; how the process is actually executed is up to the
//! backend. [`TaskProcess`] runs the process body as a task on the tokio
//! runtime.
//!
//! # Termination ladder
//!
//! ```text
//!   request_stop() ──wait graceful──► terminate() ──wait terminate──► kill() ──wait kill──► done
//!        │                                 │                              │
//!        └── exited? skip rest ────────────┴── exited? skip rest ─────────┘
//! ```
//!
//! The managers never wait on a process without a timeout. Waits happen in
//! background helpers ([`spawn_shutdown`]) that report their outcome back as
//! messages.

pub mod handle;
pub mod ladder;
pub mod task;

pub use handle::{ProcessContext, ProcessHandle, ProcessId, StopLevel};
pub use ladder::{force_shutdown, shutdown, spawn_shutdown, wait_for_exit, ExitStage, LadderTimeouts};
pub use task::TaskProcess;
