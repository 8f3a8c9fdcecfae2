//! Broadcast of successful WebSocket authentications to interested collaborators

use super::registry::ConnectionId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default broadcast channel capacity
const DEFAULT_CAPACITY: usize = 256;

/// Announces that a connection's logical user passed the auth handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthNotice {
    pub connection_id: ConnectionId,
    pub user_id: String,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl AuthNotice {
    pub fn new(connection_id: ConnectionId, user_id: impl Into<String>) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Distributes AuthNotices via `tokio::sync::broadcast`
///
/// Fire-and-forget: notifying never blocks, never panics.
/// If nobody is listening, notices are silently dropped.
#[derive(Debug, Clone)]
pub struct AuthBus {
    sender: broadcast::Sender<AuthNotice>,
}

impl AuthBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthNotice> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn notify(&self, notice: AuthNotice) {
        let user_id = notice.user_id.clone();
        if let Ok(n) = self.sender.send(notice) {
            debug!(user_id = %user_id, subscribers = n, "AuthNotice sent");
        }
    }
}

impl Default for AuthBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
