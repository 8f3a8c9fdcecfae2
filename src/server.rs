//! Server assembly: state wiring, listener, graceful shutdown

use crate::api::{create_router, PubSubState, ServerState, SessionSettings};
use crate::auth::{AuthGate, IdentityStore, InMemoryIdentityStore, RemoteIdentityStore};
use crate::events::{ConnectionRegistry, InterceptPolicy, Publisher};
use crate::Config;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;
use tracing::{info, warn};

/// Build the shared state from configuration
pub fn build_state(config: &Config) -> Result<PubSubState> {
    let registry = Arc::new(ConnectionRegistry::new());
    let publisher = Arc::new(Publisher::new(registry.clone(), config.max_concurrency));

    let auth_gate = if config.auth_enabled {
        let store: Arc<dyn IdentityStore> = match &config.identity_url {
            Some(url) => {
                info!("Looking up access tokens at {}", url);
                Arc::new(RemoteIdentityStore::new(url.as_str())?)
            }
            None => {
                if config.identity_tokens.is_empty() {
                    warn!("Auth is enabled but no access tokens are configured; every client will be rejected");
                }
                Arc::new(InMemoryIdentityStore::from_records(
                    config.identity_tokens.iter().cloned(),
                ))
            }
        };
        Some(AuthGate::new(store))
    } else {
        warn!("WebSocket auth is disabled, every connection receives events");
        None
    };

    let policy = InterceptPolicy::new(&config.ignored_endpoints)
        .context("Invalid ignored_endpoints pattern")?;

    let session = SessionSettings {
        channel_capacity: config.channel_capacity.max(1),
        auth_timeout: Duration::from_millis(config.auth_timeout_ms),
        ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
    };

    Ok(Arc::new(ServerState::new(
        registry, publisher, auth_gate, policy, session,
    )))
}

/// A running server.
///
/// Dropping the handle cancels the server without waiting for it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: PubSubState,
    server: JoinHandle<std::io::Result<()>>,
    _guard: DropGuard,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &PubSubState {
        &self.state
    }

    /// Close every socket, drain in-flight publishes and stop the listener
    pub async fn shutdown(self) -> Result<()> {
        self.state.shutdown().await;
        self.server
            .await
            .context("Server task panicked")?
            .context("Server error")?;
        info!("Server stopped");
        Ok(())
    }
}

/// Bind the listener and start serving in the background
pub async fn bind(config: Config) -> Result<ServerHandle> {
    let state = build_state(&config)?;
    let app = create_router(state.clone());

    let listener = TcpListener::bind((config.server_host.as_str(), config.server_port))
        .await
        .with_context(|| {
            format!(
                "Failed to bind {}:{}",
                config.server_host, config.server_port
            )
        })?;
    let local_addr = listener.local_addr()?;

    let stop = state.shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(stop.clone().cancelled_owned())
            .await;
        if let Err(e) = &result {
            warn!("Server exited with error: {}", e);
            stop.cancel();
        }
        result
    });

    Ok(ServerHandle {
        local_addr,
        _guard: state.shutdown.clone().drop_guard(),
        state,
        server,
    })
}

/// Run the server until Ctrl-C
pub async fn start_server(config: Config) -> Result<()> {
    let handle = bind(config).await?;
    info!(
        "PubSub server listening on {} (WebSocket at /ws)",
        handle.local_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    handle.shutdown().await
}
