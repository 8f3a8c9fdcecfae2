//! Access-token stores the auth gate looks credentials up in

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Accept an identifier written either as a JSON string or a number.
///
/// LoopBack keys users by integer, so `userId` usually arrives as `42`.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        String(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::String(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// An access token as held by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(
        rename = "userId",
        alias = "user_id",
        deserialize_with = "string_or_number"
    )]
    pub user_id: String,
    /// Absent means the token never expires
    #[serde(
        default,
        rename = "expiresAt",
        alias = "expires_at",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessTokenRecord {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("identity service returned status {0}")]
    Status(u16),
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a token id + user id pair to the matching access-token records
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_tokens(
        &self,
        token_id: &str,
        user_id: &str,
    ) -> Result<Vec<AccessTokenRecord>, IdentityError>;
}

/// Process-local token store, seeded from configuration
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    tokens: DashMap<String, AccessTokenRecord>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = AccessTokenRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    pub fn insert(&self, record: AccessTokenRecord) {
        self.tokens.insert(record.id.clone(), record);
    }

    /// Remove a token; returns whether it existed
    pub fn revoke(&self, token_id: &str) -> bool {
        self.tokens.remove(token_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_tokens(
        &self,
        token_id: &str,
        user_id: &str,
    ) -> Result<Vec<AccessTokenRecord>, IdentityError> {
        Ok(self
            .tokens
            .get(token_id)
            .filter(|record| record.user_id == user_id)
            .map(|record| vec![record.value().clone()])
            .unwrap_or_default())
    }
}

/// Token store behind an HTTP service.
///
/// Issues `GET {url}?id=<token>&userId=<user>` and expects a JSON array
/// of matching records.
#[derive(Clone)]
pub struct RemoteIdentityStore {
    client: reqwest::Client,
    url: String,
}

impl RemoteIdentityStore {
    pub fn new(url: impl Into<String>) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IdentityStore for RemoteIdentityStore {
    async fn find_tokens(
        &self,
        token_id: &str,
        user_id: &str,
    ) -> Result<Vec<AccessTokenRecord>, IdentityError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("id", token_id), ("userId", user_id)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IdentityError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_record_wire_names() {
        let record: AccessTokenRecord =
            serde_json::from_value(json!({"id": "tok", "userId": "42"})).unwrap();
        assert_eq!(record, AccessTokenRecord::new("tok", "42"));

        let record: AccessTokenRecord = serde_json::from_value(json!({
            "id": "tok",
            "user_id": "42",
            "expires_at": "2020-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(record.is_expired(Utc::now()));

        let record: AccessTokenRecord =
            serde_json::from_value(json!({"id": 7, "userId": 42})).unwrap();
        assert_eq!(record, AccessTokenRecord::new("7", "42"));
    }

    #[tokio::test]
    async fn test_in_memory_lookup_requires_both_fields() {
        let store = InMemoryIdentityStore::from_records([AccessTokenRecord::new("tok", "42")]);

        assert_eq!(store.find_tokens("tok", "42").await.unwrap().len(), 1);
        assert!(store.find_tokens("tok", "43").await.unwrap().is_empty());
        assert!(store.find_tokens("other", "42").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_revoke() {
        let store = InMemoryIdentityStore::new();
        store.insert(AccessTokenRecord::new("tok", "42"));
        assert_eq!(store.len(), 1);

        assert!(store.revoke("tok"));
        assert!(!store.revoke("tok"));
        assert!(store.find_tokens("tok", "42").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/AccessTokens"))
            .and(query_param("id", "tok"))
            .and(query_param("userId", "42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": "tok", "userId": "42"}])),
            )
            .mount(&server)
            .await;

        let store = RemoteIdentityStore::new(format!("{}/api/AccessTokens", server.uri())).unwrap();
        let records = store.find_tokens("tok", "42").await.unwrap();
        assert_eq!(records, vec![AccessTokenRecord::new("tok", "42")]);
    }

    #[tokio::test]
    async fn test_remote_lookup_accepts_loopback_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/AccessTokens"))
            .and(query_param("userId", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "tok",
                "userId": 42,
                "ttl": 1209600,
                "created": "2024-01-01T00:00:00.000Z"
            }])))
            .mount(&server)
            .await;

        let store = RemoteIdentityStore::new(format!("{}/api/AccessTokens", server.uri())).unwrap();
        let records = store.find_tokens("tok", "42").await.unwrap();
        assert_eq!(records, vec![AccessTokenRecord::new("tok", "42")]);
    }

    #[tokio::test]
    async fn test_remote_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = RemoteIdentityStore::new(server.uri()).unwrap();
        let err = store.find_tokens("tok", "42").await.unwrap_err();
        assert!(matches!(err, IdentityError::Status(500)));
    }
}
