//! Change event and wire message types for WebSocket notifications

use crate::auth::Credential;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The HTTP method of the intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether a request with this method mutates data
    pub fn is_mutation(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = InvalidEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(InvalidEvent::UnknownMethod(other.to_string())),
        }
    }
}

/// Rejected ChangeEvent construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidEvent {
    #[error("endpoint must be an absolute path, got {0:?}")]
    RelativeEndpoint(String),
    #[error("unknown HTTP method: {0}")]
    UnknownMethod(String),
}

/// Unvalidated wire shape of a ChangeEvent
#[derive(Deserialize)]
struct RawChangeEvent {
    method: HttpMethod,
    endpoint: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = InvalidEvent;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        ChangeEvent::new(raw.method, raw.endpoint, raw.data)
    }
}

/// A data mutation intercepted by the host request pipeline.
///
/// Immutable once constructed; the endpoint is always an absolute path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChangeEvent")]
pub struct ChangeEvent {
    method: HttpMethod,
    endpoint: String,
    data: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(
        method: HttpMethod,
        endpoint: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<Self, InvalidEvent> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with('/') {
            return Err(InvalidEvent::RelativeEndpoint(endpoint));
        }
        Ok(Self {
            method,
            endpoint,
            data,
        })
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }
}

/// Messages sent from the server to a WebSocket client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of the auth handshake. Never carries a reason.
    Authenticated { success: bool },
    /// A published change, carried verbatim
    Event(ChangeEvent),
    /// Reply to a liveness probe: Unix time in fractional seconds
    Pong { timestamp: f64 },
    /// The endpoint filter now in effect (empty = everything)
    Subscribed { endpoints: Vec<String> },
    Error { message: String },
}

/// Messages sent from a WebSocket client to the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authentication(Credential),
    Ping,
    Subscribe {
        #[serde(default)]
        endpoints: Vec<String>,
    },
}
