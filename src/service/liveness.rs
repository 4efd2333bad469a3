//! Grace-period presence tracking.
//!
//! A closed connection does not make a user offline straight away: clients
//! reconnect on network changes and page reloads. Each deregistration
//! schedules one delayed re-check. If the user still has no connection when
//! it fires, the session marker is cleared through the [`SessionStore`].
//!
//! ```text
//!  HAS_CONNECTIONS ──last close──▶ GRACE_PERIOD ──timer, still 0──▶ CONFIRMED_OFFLINE
//!        ▲                              │
//!        └──────── reconnect ───────────┘ (observed when the timer fires)
//! ```
//!
//! Timers are never cancelled individually; overlapping cycles for the same
//! user simply each re-sample the registry. All timers are tracked and stop
//! early only on process shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use utoipa::ToSchema;

use crate::domain::{ConnectionRegistry, UserId};
use crate::persistence::SessionStore;

/// Presence of a user as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessState {
    /// At least one live connection.
    HasConnections,
    /// No connection, but a grace timer is still running.
    GracePeriod,
    /// No connection and no pending timer.
    ConfirmedOffline,
}

/// How one grace cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceOutcome {
    /// The user had a connection again when the timer fired.
    Reconnected,
    /// The user was still offline and the session was cleared.
    ConfirmedOffline,
    /// The user was offline but clearing the session failed.
    ClearFailed,
    /// Shutdown interrupted the wait.
    Cancelled,
}

type PendingTimers = Arc<Mutex<HashMap<UserId, usize>>>;

/// Schedules and tracks grace-period checks.
#[derive(Debug)]
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<dyn SessionStore>,
    grace_period: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    pending: PendingTimers,
}

impl LivenessMonitor {
    /// Creates a monitor whose timers stop when `shutdown` is cancelled.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<dyn SessionStore>,
        grace_period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            sessions,
            grace_period,
            shutdown,
            tracker: TaskTracker::new(),
            pending: Arc::default(),
        }
    }

    /// Configured grace period.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Starts one grace cycle for `user_id`.
    ///
    /// Call after every deregistration, whether or not the user has other
    /// connections left.
    pub fn on_disconnect(&self, user_id: UserId) -> JoinHandle<GraceOutcome> {
        adjust(&self.pending, user_id, true);

        let registry = Arc::clone(&self.registry);
        let sessions = Arc::clone(&self.sessions);
        let pending = Arc::clone(&self.pending);
        let shutdown = self.shutdown.clone();
        let grace = self.grace_period;

        tracing::debug!(%user_id, grace_secs = grace.as_secs(), "grace period started");
        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                () = shutdown.cancelled() => GraceOutcome::Cancelled,
                () = tokio::time::sleep(grace) => {
                    confirm(&registry, sessions.as_ref(), user_id).await
                }
            };
            adjust(&pending, user_id, false);
            outcome
        })
    }

    /// Current presence of `user_id`.
    pub async fn state_of(&self, user_id: UserId) -> LivenessState {
        if self.registry.is_online(user_id).await {
            return LivenessState::HasConnections;
        }
        let waiting = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .copied()
            .unwrap_or(0);
        if waiting > 0 {
            LivenessState::GracePeriod
        } else {
            LivenessState::ConfirmedOffline
        }
    }

    /// Number of grace timers still running.
    #[must_use]
    pub fn pending_checks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancels every running timer and waits for all of them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("liveness monitor stopped");
    }
}

async fn confirm(
    registry: &ConnectionRegistry,
    sessions: &dyn SessionStore,
    user_id: UserId,
) -> GraceOutcome {
    if registry.is_online(user_id).await {
        tracing::debug!(%user_id, "user reconnected within grace period");
        return GraceOutcome::Reconnected;
    }
    match sessions.clear_session(user_id).await {
        Ok(()) => {
            tracing::info!(%user_id, "user confirmed offline, session cleared");
            GraceOutcome::ConfirmedOffline
        }
        Err(e) => {
            tracing::error!(%user_id, error = %e, "failed to clear session");
            GraceOutcome::ClearFailed
        }
    }
}

fn adjust(pending: &PendingTimers, user_id: UserId, started: bool) {
    let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
    if started {
        *map.entry(user_id).or_default() += 1;
        return;
    }
    if let Some(count) = map.get_mut(&user_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(&user_id);
        }
    }
}
