//! Shared application state injected into all Axum handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::ConnectionRegistry;
use crate::identity::IdentityResolver;
use crate::persistence::{ChatStore, SessionStore};
use crate::service::{ChatService, Dispatcher, LivenessMonitor};

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Live connections grouped by user.
    pub registry: Arc<ConnectionRegistry>,
    /// Fan-out over the registry.
    pub dispatcher: Dispatcher,
    /// Grace-period checks after disconnects.
    pub liveness: Arc<LivenessMonitor>,
    /// Resolves the caller of upgrades and REST requests.
    pub identity: IdentityResolver,
    /// Chat and message operations.
    pub chat_service: Arc<ChatService>,
}

impl AppState {
    /// Wires the registry, dispatcher, liveness monitor and chat service
    /// around the given persistence collaborators.
    ///
    /// Grace timers stop when `shutdown` is cancelled.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        chats: Arc<dyn ChatStore>,
        identity: IdentityResolver,
        grace_period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let liveness = Arc::new(LivenessMonitor::new(
            Arc::clone(&registry),
            sessions,
            grace_period,
            shutdown,
        ));
        let chat_service = Arc::new(ChatService::new(chats, dispatcher.clone()));
        Self {
            registry,
            dispatcher,
            liveness,
            identity,
            chat_service,
        }
    }
}
