//! Test helper factories and mock state builders
//!
//! Provides recording/failing sinks and helpers for building a mock
//! ServerState with an in-memory token store.
#![allow(dead_code)]

use crate::api::{PubSubState, ServerState, SessionSettings};
use crate::auth::{
    AccessTokenRecord, AuthGate, IdentityError, IdentityStore, InMemoryIdentityStore,
};
use crate::events::{
    parse_endpoint_filter, ChangeEvent, ConnectionId, ConnectionRegistry, DeliveryError,
    EventSink, InterceptPolicy, Publisher, ServerMessage,
};
use crate::Config;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

// ============================================================================
// Sinks
// ============================================================================

/// Sink that keeps every message it is handed
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<ServerMessage>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<ServerMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Only the change events, in delivery order
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                ServerMessage::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, message: ServerMessage) -> Result<(), DeliveryError> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

/// Sink whose every delivery fails
#[derive(Debug, Default)]
pub struct FailingSink;

#[async_trait]
impl EventSink for FailingSink {
    async fn deliver(&self, _message: ServerMessage) -> Result<(), DeliveryError> {
        Err(DeliveryError::Failed("transport broken".to_string()))
    }
}

/// Sink that parks every delivery until released, then hands it to `inner`
pub struct GatedSink {
    inner: Arc<dyn EventSink>,
    /// Notified when a delivery reaches the gate
    pub entered: Notify,
    /// Notify to let one parked delivery through
    pub release: Notify,
}

impl GatedSink {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl EventSink for GatedSink {
    async fn deliver(&self, message: ServerMessage) -> Result<(), DeliveryError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.deliver(message).await
    }
}

/// Identity store whose lookups never complete
#[derive(Debug, Default)]
pub struct PendingIdentityStore;

#[async_trait]
impl IdentityStore for PendingIdentityStore {
    async fn find_tokens(
        &self,
        _token_id: &str,
        _user_id: &str,
    ) -> Result<Vec<AccessTokenRecord>, IdentityError> {
        std::future::pending().await
    }
}

// ============================================================================
// Mock state builders
// ============================================================================

/// Token every auth-enabled mock state accepts
pub const TEST_TOKEN: &str = "tok-1";
pub const TEST_USER: &str = "42";

/// Config with auth on, one seeded token and an ephemeral port
pub fn test_config() -> Config {
    Config {
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        auth_timeout_ms: 500,
        identity_tokens: vec![AccessTokenRecord::new(TEST_TOKEN, TEST_USER)],
        ..Config::default()
    }
}

pub fn build_mock_state(auth_gate: Option<AuthGate>) -> PubSubState {
    let registry = Arc::new(ConnectionRegistry::new());
    let publisher = Arc::new(Publisher::new(registry.clone(), 8));
    Arc::new(ServerState::new(
        registry,
        publisher,
        auth_gate,
        InterceptPolicy::default(),
        SessionSettings::default(),
    ))
}

/// Mock state with auth enabled and `TEST_TOKEN` / `TEST_USER` seeded
pub fn mock_state() -> PubSubState {
    let store = InMemoryIdentityStore::from_records([AccessTokenRecord::new(
        TEST_TOKEN, TEST_USER,
    )]);
    build_mock_state(Some(AuthGate::new(Arc::new(store))))
}

/// Mock state with auth disabled
pub fn mock_state_without_auth() -> PubSubState {
    build_mock_state(None)
}

/// Register a connection directly in the registry, bypassing the socket
pub async fn add_connection(
    state: &ServerState,
    sink: Arc<dyn EventSink>,
    authenticated: bool,
    filter: Option<&str>,
) -> ConnectionId {
    let id = Uuid::new_v4();
    state.registry.register(id, sink).await.unwrap();
    if authenticated {
        state
            .registry
            .mark_authenticated(id, Some(TEST_USER.to_string()))
            .await
            .unwrap();
    }
    if let Some(filter) = filter {
        state
            .registry
            .set_subscriptions(id, parse_endpoint_filter([filter]))
            .await
            .unwrap();
    }
    id
}
