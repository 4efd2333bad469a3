//! Service layer: delivery, presence and chat orchestration.
//!
//! [`Dispatcher`] fans frames out over the
//! [`ConnectionRegistry`](crate::domain::ConnectionRegistry),
//! [`LivenessMonitor`] runs the grace-period checks after disconnects, and
//! [`ChatService`] applies message lifecycle rules and pushes live events
//! through the dispatcher.

pub mod chat_service;
pub mod dispatcher;
pub mod liveness;

pub use chat_service::{ChatOverview, ChatService, MessagePage, MessageView, SendMessage};
pub use dispatcher::{DeliveryReport, Dispatcher};
pub use liveness::{GraceOutcome, LivenessMonitor, LivenessState};
