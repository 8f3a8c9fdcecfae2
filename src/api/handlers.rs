//! API request handlers

use crate::auth::AuthGate;
use crate::events::{
    AuthBus, ChangeEvent, ConnectionRegistry, InterceptPolicy, PublishError, PublishReport,
    Publisher,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Per-connection WebSocket session settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Outbound queue length per connection
    pub channel_capacity: usize,
    /// Time a new connection has to authenticate
    pub auth_timeout: Duration,
    /// Interval between server-sent pings
    pub ping_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            auth_timeout: Duration::from_millis(1000),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Shared server state
pub struct ServerState {
    pub registry: Arc<ConnectionRegistry>,
    pub publisher: Arc<Publisher>,
    /// Auth gate: None means auth is disabled and every connection is admitted
    pub auth_gate: Option<AuthGate>,
    pub auth_bus: AuthBus,
    pub policy: InterceptPolicy,
    pub session: SessionSettings,
    /// Cancelled when the server shuts down
    pub shutdown: CancellationToken,
    /// Tracks live WebSocket connection tasks
    pub connections: TaskTracker,
}

/// Shared pubsub state
pub type PubSubState = Arc<ServerState>;

impl ServerState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        publisher: Arc<Publisher>,
        auth_gate: Option<AuthGate>,
        policy: InterceptPolicy,
        session: SessionSettings,
    ) -> Self {
        Self {
            registry,
            publisher,
            auth_gate,
            auth_bus: AuthBus::default(),
            policy,
            session,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_gate.is_some()
    }

    /// Stop the delivery machinery.
    ///
    /// Closes every socket, waits for in-flight publishes and connection
    /// tasks, then clears the registry. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.publisher.close().await;
        self.connections.close();
        self.connections.wait().await;
        let dropped = self.registry.clear().await;
        debug!(dropped, "PubSub state shut down");
    }
}

// ============================================================================
// Health check
// ============================================================================

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connections: usize,
    pub authenticated: usize,
}

/// Health check handler: reports live connection counts.
///
/// Returns 503 + `"shutting_down"` once shutdown has begun.
pub async fn health(State(state): State<PubSubState>) -> (StatusCode, Json<HealthResponse>) {
    let shutting_down = state.shutdown.is_cancelled();
    let (status, http_status) = if shutting_down {
        ("shutting_down", StatusCode::SERVICE_UNAVAILABLE)
    } else {
        ("ok", StatusCode::OK)
    };

    (
        http_status,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connections: state.registry.len().await,
            authenticated: state.registry.authenticated_count().await,
        }),
    )
}

// ============================================================================
// Event ingest
// ============================================================================

/// Response to POST /internal/events
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Whether the event went through fanout (false = dropped by policy)
    pub published: bool,
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl From<PublishReport> for IngestResponse {
    fn from(report: PublishReport) -> Self {
        Self {
            published: true,
            delivered: report.delivered,
            skipped: report.skipped,
            failed: report.failed,
        }
    }
}

/// Receive a ChangeEvent from the host request pipeline and publish it.
///
/// Delivery failures never reach the producer; only a shut-down publisher
/// is reported (503).
pub async fn ingest_event(
    State(state): State<PubSubState>,
    payload: Result<Json<ChangeEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let Json(event) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    if !state.policy.should_publish(&event) {
        debug!(method = %event.method(), endpoint = %event.endpoint(), "ChangeEvent ignored by policy");
        return Ok((StatusCode::ACCEPTED, Json(IngestResponse::default())));
    }

    match state.publisher.publish(&event).await {
        Ok(report) => Ok((StatusCode::ACCEPTED, Json(report.into()))),
        Err(PublishError::AllDeliveriesFailed { failed, .. }) => Ok((
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                published: true,
                failed,
                ..Default::default()
            }),
        )),
        Err(e @ PublishError::SnapshotFailure(_)) => {
            warn!(endpoint = %event.endpoint(), "Publish rejected: {}", e);
            Err(AppError::ServiceUnavailable(e.to_string()))
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// API error type
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    ServiceUnavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
