//! chat-gateway server entry point.
//!
//! Starts the Axum HTTP server with REST and WebSocket endpoints, and the
//! poll-model server when `POLL_LISTEN_ADDR` is set.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chat_gateway::api;
use chat_gateway::app_state::AppState;
use chat_gateway::config::{AuthMode, GatewayConfig, LogFormat};
use chat_gateway::identity::IdentityResolver;
use chat_gateway::persistence::{ChatStore, InMemoryStore, PostgresStore, SessionStore};
#[cfg(unix)]
use chat_gateway::transport::poll::PolledConnection;
#[cfg(unix)]
use chat_gateway::transport::poll_server::PollServer;
#[cfg(unix)]
use chat_gateway::ws::frame::route_binary;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    init_tracing(config.log_format);
    tracing::info!(addr = %config.listen_addr, "starting chat-gateway");

    // Persistence collaborators
    let (sessions, chats): (Arc<dyn SessionStore>, Arc<dyn ChatStore>) =
        if config.persistence_enabled {
            let store = Arc::new(
                PostgresStore::connect(&config)
                    .await
                    .context("connecting to database")?,
            );
            store.migrate().await.context("running migrations")?;
            tracing::info!("using PostgreSQL store");
            (
                Arc::clone(&store) as Arc<dyn SessionStore>,
                store as Arc<dyn ChatStore>,
            )
        } else {
            tracing::warn!("persistence disabled, chats are kept in memory");
            let store = Arc::new(InMemoryStore::new());
            (
                Arc::clone(&store) as Arc<dyn SessionStore>,
                store as Arc<dyn ChatStore>,
            )
        };

    let identity = match config.auth_mode {
        AuthMode::Session => IdentityResolver::SessionToken(Arc::clone(&sessions)),
        AuthMode::TrustedHeader => IdentityResolver::TrustedHeaders,
    };

    let shutdown = CancellationToken::new();
    let app_state = AppState::new(
        sessions,
        chats,
        identity,
        config.grace_period(),
        shutdown.child_token(),
    );
    let liveness = Arc::clone(&app_state.liveness);

    #[cfg(unix)]
    let poll_server = match config.poll_listen_addr {
        Some(addr) => Some(
            PollServer::start(
                addr,
                config.poll_batch_size,
                config.poll_timeout(),
                Arc::new(log_polled_frame),
                shutdown.child_token(),
            )
            .context("starting poll server")?,
        ),
        None => None,
    };

    let app = api::build_app(app_state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            signal.cancel();
        })
        .await?;

    liveness.shutdown().await;
    #[cfg(unix)]
    if let Some(server) = poll_server {
        tokio::task::spawn_blocking(move || server.stop()).await?;
    }
    tracing::info!("chat-gateway stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[cfg(unix)]
fn log_polled_frame(connection: &PolledConnection, payload: &[u8]) {
    match route_binary(payload) {
        Ok(frame) => tracing::info!(
            fd = connection.fd(),
            peer = %connection.peer(),
            recipient = %frame.recipient,
            body = frame.body,
            "poll frame"
        ),
        Err(e) => tracing::warn!(fd = connection.fd(), error = %e, "dropping poll frame"),
    }
}
