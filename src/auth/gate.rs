//! Connection-time credential check

use super::store::{string_or_number, IdentityStore};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Credential presented by a connecting client.
///
/// Wire names follow the socketio-auth handshake (`id`, `userId`).
/// Missing fields come through as empty strings and are rejected.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    #[serde(
        default,
        rename = "id",
        alias = "token_id",
        alias = "tokenId",
        deserialize_with = "string_or_number"
    )]
    pub token_id: String,
    #[serde(
        default,
        rename = "userId",
        alias = "user_id",
        deserialize_with = "string_or_number"
    )]
    pub user_id: String,
}

impl Credential {
    pub fn new(token_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Both fields present and non-blank
    pub fn is_complete(&self) -> bool {
        !self.token_id.trim().is_empty() && !self.user_id.trim().is_empty()
    }
}

// Keep the token out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token_id", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// The credential was not accepted. Deliberately carries no reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("authentication rejected")]
pub struct AuthRejected;

/// Decides whether a connection may be authenticated
#[derive(Clone)]
pub struct AuthGate {
    store: Arc<dyn IdentityStore>,
}

impl AuthGate {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// Accept iff the store holds at least one live token for this
    /// token id + user id pair. Lookup errors deny.
    pub async fn verify(&self, credential: &Credential) -> Result<(), AuthRejected> {
        if !credential.is_complete() {
            debug!("Auth gate: incomplete credential");
            return Err(AuthRejected);
        }

        let records = match self
            .store
            .find_tokens(&credential.token_id, &credential.user_id)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(user_id = %credential.user_id, "Auth gate: identity lookup failed: {}", e);
                return Err(AuthRejected);
            }
        };

        let now = chrono::Utc::now();
        let matched = records.iter().any(|r| {
            r.id == credential.token_id && r.user_id == credential.user_id && !r.is_expired(now)
        });

        if matched {
            Ok(())
        } else {
            debug!(user_id = %credential.user_id, "Auth gate: no live token matched");
            Err(AuthRejected)
        }
    }

    pub async fn authenticate(&self, credential: &Credential) -> bool {
        self.verify(credential).await.is_ok()
    }
}
