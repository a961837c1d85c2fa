//! Control plane
//!
//! The [`ControlPlane`] task serializes lifecycle commands from a
//! [`ControlHandle`], applies the reports data-plane processes send over a
//! [`PlaneSender`], and publishes [`HubEvent`]s to listeners.

pub mod message;
pub mod plane;

pub use message::{ConsumerMessage, HubEvent, MessageBody, PlaneEvent, PlaneSender, Reporter, SpectrumFrame};
pub use plane::{ControlHandle, ControlPlane};
