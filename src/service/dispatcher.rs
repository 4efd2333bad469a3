//! Fan-out dispatcher: directed send and broadcast over the registry.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{ConnectionId, ConnectionRegistry, UserId};
use crate::transport::FrameSink;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct DeliveryReport {
    /// Connections a frame was handed to.
    pub attempted: usize,
    /// Connections that accepted it.
    pub delivered: usize,
}

impl DeliveryReport {
    /// Number of failed deliveries.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.attempted.saturating_sub(self.delivered)
    }
}

/// Delivers frames to registered connections.
///
/// Every send first snapshots the target sinks under the registry's shared
/// lock, releases it, and only then writes. One failing sink is logged and
/// never stops delivery to the others. Delivery is best-effort: nothing is
/// retried or queued for offline users.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Returns a reference to the inner [`ConnectionRegistry`].
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Sends `payload` to every connection of `user_id`.
    pub async fn send_to_user(&self, user_id: UserId, payload: &str) -> DeliveryReport {
        let sinks = self.registry.sinks_for_user(user_id).await;
        if sinks.is_empty() {
            tracing::debug!(%user_id, "no live connections, dropping frame");
            return DeliveryReport::default();
        }
        let report = deliver(&sinks, payload);
        tracing::debug!(
            %user_id,
            attempted = report.attempted,
            delivered = report.delivered,
            "sent to user"
        );
        report
    }

    /// Sends `payload` to one connection. No-op if it is not registered.
    pub async fn send_to_connection(
        &self,
        connection_id: ConnectionId,
        payload: &str,
    ) -> DeliveryReport {
        let Some(sink) = self.registry.sink_for(connection_id).await else {
            tracing::debug!(%connection_id, "connection not registered");
            return DeliveryReport::default();
        };
        deliver(&[(connection_id, sink)], payload)
    }

    /// Sends `payload` to every registered connection.
    pub async fn broadcast(&self, payload: &str) -> DeliveryReport {
        let sinks = self.registry.all_sinks().await;
        let report = deliver(&sinks, payload);
        tracing::info!(
            attempted = report.attempted,
            delivered = report.delivered,
            "broadcast"
        );
        report
    }

    /// Sends `payload` to every connection of each listed user. Duplicate
    /// user ids are delivered once.
    pub async fn broadcast_to_users(&self, user_ids: &[UserId], payload: &str) -> DeliveryReport {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let mut sinks = Vec::new();
        for user_id in user_ids {
            if seen.insert(*user_id) {
                sinks.extend(self.registry.sinks_for_user(*user_id).await);
            }
        }
        let report = deliver(&sinks, payload);
        tracing::info!(
            users = seen.len(),
            attempted = report.attempted,
            delivered = report.delivered,
            "broadcast to users"
        );
        report
    }

    /// Force-closes every connection of `user_id` and removes them from the
    /// registry. Returns the number closed.
    ///
    /// Reader tasks of the closed connections observe the close and
    /// deregister (a no-op by then), which still schedules the usual
    /// grace-period check.
    pub async fn close_user_connections(&self, user_id: UserId) -> usize {
        let removed = self.registry.remove_user(user_id).await;
        for connection in &removed {
            connection.sink.close();
        }
        tracing::info!(%user_id, closed = removed.len(), "closed user connections");
        removed.len()
    }
}

fn deliver(sinks: &[(ConnectionId, Arc<dyn FrameSink>)], payload: &str) -> DeliveryReport {
    let mut report = DeliveryReport {
        attempted: sinks.len(),
        delivered: 0,
    };
    for (connection_id, sink) in sinks {
        match sink.send_text(payload) {
            Ok(()) => report.delivered += 1,
            Err(e) => tracing::warn!(%connection_id, error = %e, "delivery failed"),
        }
    }
    report
}
