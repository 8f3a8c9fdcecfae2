//! Registry of live WebSocket connections and their auth state

use super::sink::EventSink;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Registry consistency errors. These indicate a transport bug, so they
/// are surfaced to whoever manages the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// A connected client as seen by the registry
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    authenticated: bool,
    user_id: Option<String>,
    subscriptions: Option<HashSet<String>>,
    sink: Arc<dyn EventSink>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    fn new(id: ConnectionId, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id,
            authenticated: false,
            user_id: None,
            subscriptions: None,
            sink,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Endpoint filters, `None` when the connection receives everything
    pub fn subscriptions(&self) -> Option<&HashSet<String>> {
        self.subscriptions.as_ref()
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether an event for `endpoint` passes this connection's filters
    pub fn accepts(&self, endpoint: &str) -> bool {
        match &self.subscriptions {
            None => true,
            Some(filters) => filters.iter().any(|f| endpoint_matches(f, endpoint)),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("authenticated", &self.authenticated)
            .field("user_id", &self.user_id)
            .field("subscriptions", &self.subscriptions)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Check whether a subscription filter covers an endpoint.
///
/// Matching is by whole path segments: `/rooms` covers `/rooms` and
/// `/rooms/5/accounts` but not `/roomsX`. Query strings are ignored.
pub fn endpoint_matches(filter: &str, endpoint: &str) -> bool {
    let path = endpoint.split('?').next().unwrap_or_default();
    let path = path.trim_end_matches('/');
    let filter = filter.trim_end_matches('/');

    if filter.is_empty() {
        return true;
    }
    match path.strip_prefix(filter) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Parse a comma-separated endpoint list (e.g. `"/rooms, /accounts"`).
///
/// Returns `None` when nothing usable remains, meaning "no filter".
pub fn parse_endpoint_filter<I, S>(endpoints: I) -> Option<HashSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let filters: HashSet<String> = endpoints
        .into_iter()
        .flat_map(|s| {
            s.as_ref()
                .split(',')
                .map(|part| part.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|s| !s.is_empty())
        .map(|s| if s.starts_with('/') { s } else { format!("/{}", s) })
        .collect();

    if filters.is_empty() {
        None
    } else {
        Some(filters)
    }
}

/// Live set of connections.
///
/// Snapshots happen once per publish while membership changes only on
/// connect/disconnect, so a reader-writer lock guards the map.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unauthenticated connection
    pub async fn register(
        &self,
        id: ConnectionId,
        sink: Arc<dyn EventSink>,
    ) -> Result<Connection, RegistryError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }
        let connection = Connection::new(id, sink);
        connections.insert(id, connection.clone());
        debug!(connection_id = %id, total = connections.len(), "Connection registered");
        Ok(connection)
    }

    /// Flip a connection to authenticated.
    ///
    /// Returns `Ok(true)` on the transition and `Ok(false)` if it was
    /// already authenticated (in which case nothing changes).
    pub async fn mark_authenticated(
        &self,
        id: ConnectionId,
        user_id: Option<String>,
    ) -> Result<bool, RegistryError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        if connection.authenticated {
            return Ok(false);
        }
        connection.authenticated = true;
        connection.user_id = user_id;
        Ok(true)
    }

    /// Replace a connection's endpoint filters (`None` = everything)
    pub async fn set_subscriptions(
        &self,
        id: ConnectionId,
        subscriptions: Option<HashSet<String>>,
    ) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        connection.subscriptions = subscriptions;
        Ok(())
    }

    /// Remove a connection. Absent ids are fine: disconnects race with shutdown.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            debug!(connection_id = %id, "Connection unregistered");
        }
        removed
    }

    /// Point-in-time copy of every authenticated connection
    pub async fn snapshot_authenticated(&self) -> Vec<Connection> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.authenticated)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn authenticated_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.authenticated)
            .count()
    }

    /// Drop every connection, returning how many were removed
    pub async fn clear(&self) -> usize {
        let mut connections = self.connections.write().await;
        let count = connections.len();
        connections.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingSink;

    fn sink() -> Arc<dyn EventSink> {
        Arc::new(RecordingSink::default())
    }

    #[tokio::test]
    async fn test_register_starts_unauthenticated() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();

        let conn = registry.register(id, sink()).await.unwrap();
        assert_eq!(conn.id(), id);
        assert!(!conn.is_authenticated());
        assert!(conn.subscriptions().is_none());
        assert_eq!(registry.len().await, 1);
        assert!(registry.snapshot_authenticated().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, sink()).await.unwrap();

        let err = registry.register(id, sink()).await.unwrap_err();
        assert_eq!(err, RegistryError::DuplicateConnection(id));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_mark_authenticated_transitions_once() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, sink()).await.unwrap();

        assert!(registry
            .mark_authenticated(id, Some("42".into()))
            .await
            .unwrap());
        // Second call is a no-op and keeps the first user
        assert!(!registry
            .mark_authenticated(id, Some("99".into()))
            .await
            .unwrap());

        let conn = registry.get(id).await.unwrap();
        assert!(conn.is_authenticated());
        assert_eq!(conn.user_id(), Some("42"));
    }

    #[tokio::test]
    async fn test_mark_authenticated_unknown_fails() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let err = registry.mark_authenticated(id, None).await.unwrap_err();
        assert_eq!(err, RegistryError::UnknownConnection(id));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, sink()).await.unwrap();

        assert!(registry.unregister(id).await.is_some());
        assert!(registry.unregister(id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_never_contains_unregistered() {
        let registry = ConnectionRegistry::new();
        let ids: Vec<_> = (0..6).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            registry.register(*id, sink()).await.unwrap();
            registry.mark_authenticated(*id, None).await.unwrap();
        }
        for id in ids.iter().step_by(2) {
            registry.unregister(*id).await;
            // Repeated disconnects must not disturb the count
            registry.unregister(*id).await;
        }

        let snapshot = registry.snapshot_authenticated().await;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.authenticated_count().await, 3);
        for id in ids.iter().step_by(2) {
            assert!(snapshot.iter().all(|c| c.id() != *id));
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_point_in_time() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, sink()).await.unwrap();
        registry.mark_authenticated(id, None).await.unwrap();

        let snapshot = registry.snapshot_authenticated().await;
        registry.unregister(id).await;

        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot_authenticated().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_churn_keeps_registry_consistent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();

        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let id = Uuid::new_v4();
                registry
                    .register(id, Arc::new(RecordingSink::default()))
                    .await
                    .unwrap();
                registry.mark_authenticated(id, None).await.unwrap();
                let _ = registry.snapshot_authenticated().await;
                if i % 2 == 0 {
                    registry.unregister(id).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len().await, 16);
        assert_eq!(registry.authenticated_count().await, 16);
    }

    #[tokio::test]
    async fn test_set_subscriptions() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id, sink()).await.unwrap();

        registry
            .set_subscriptions(id, parse_endpoint_filter(["/rooms"]))
            .await
            .unwrap();
        let conn = registry.get(id).await.unwrap();
        assert!(conn.accepts("/rooms/5"));
        assert!(!conn.accepts("/accounts/2"));

        let err = registry
            .set_subscriptions(Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = ConnectionRegistry::new();
        registry.register(Uuid::new_v4(), sink()).await.unwrap();
        registry.register(Uuid::new_v4(), sink()).await.unwrap();
        assert_eq!(registry.clear().await, 2);
        assert!(registry.is_empty().await);
    }

    #[test]
    fn test_endpoint_matches_whole_segments() {
        assert!(endpoint_matches("/rooms", "/rooms"));
        assert!(endpoint_matches("/rooms", "/rooms/5"));
        assert!(endpoint_matches("/rooms/", "/rooms/5/accounts"));
        assert!(!endpoint_matches("/rooms", "/roomsX"));
        assert!(!endpoint_matches("/rooms", "/accounts/2"));
        assert!(endpoint_matches("/", "/anything"));
    }

    #[test]
    fn test_endpoint_matches_ignores_query_string() {
        assert!(endpoint_matches(
            "/rooms",
            "/rooms/5?filter=%7B%22include%22%3A%22owner%22%7D"
        ));
        assert!(!endpoint_matches("/rooms/5", "/rooms?id=5"));
    }

    #[test]
    fn test_parse_endpoint_filter() {
        let filter = parse_endpoint_filter(["/rooms, accounts", " "]).unwrap();
        assert!(filter.contains("/rooms"));
        assert!(filter.contains("/accounts"));
        assert_eq!(filter.len(), 2);

        assert!(parse_endpoint_filter(Vec::<String>::new()).is_none());
        assert!(parse_endpoint_filter([" , "]).is_none());
    }
}
