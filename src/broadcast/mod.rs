//! Per-subscriber fan-out of sample chunks
//!
//! A [`Broadcaster`] pulls chunks from one source channel and offers every
//! chunk to every subscriber's own bounded channel.
//!
//! # Architecture
//!
//! ```text
//!                       Broadcaster<T>
//!   source ──recv()──► ┌───────────────────────────┐
//!  (BoundedChannel)    │ subscribers: HashMap<Key, │
//!                      │   { channel, counters }   │
//!                      │ >                         │
//!                      └─────────────┬─────────────┘
//!                                    │ try_send() per subscriber
//!            ┌───────────────────────┼───────────────────────┐
//!            ▼                       ▼                       ▼
//!      [demodulator]             [decoder]               [recorder]
//!   full? drop + dropped++   full? drop + dropped++   full? drop + dropped++
//! ```
//!
//! # Load shedding
//!
//! Delivery is at-most-once and best effort. A subscriber whose channel is
//! full loses that chunk; nobody else is delayed and the producer is never
//! blocked. Order within one subscriber channel is FIFO.

pub mod broadcaster;
pub mod error;

pub use broadcaster::Broadcaster;
pub use error::BroadcastError;
pub use crate::stats::DeliveryMode;
