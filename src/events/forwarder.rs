//! HTTP client that forwards ChangeEvents to a running server
//!
//! Used by host processes (the request pipeline that intercepts mutations)
//! to hand events to the notifier via POST /internal/events.

use super::ChangeEvent;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request to notifier failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notifier responded with status {0}")]
    Status(u16),
}

/// Ingest response returned by the notifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ForwardOutcome {
    pub published: bool,
    #[serde(default)]
    pub delivered: usize,
    #[serde(default)]
    pub skipped: usize,
    #[serde(default)]
    pub failed: usize,
}

/// Posts ChangeEvents to the notifier's /internal/events endpoint.
#[derive(Clone)]
pub struct EventForwarder {
    client: reqwest::Client,
    url: String,
}

impl EventForwarder {
    /// The base_url should be the notifier root (e.g. "http://localhost:3000").
    pub fn new(base_url: &str) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        let url = format!("{}/internal/events", base_url.trim_end_matches('/'));

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forward an event and wait for the notifier's answer
    pub async fn forward(&self, event: &ChangeEvent) -> Result<ForwardOutcome, ForwardError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(ForwardError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    /// Fire-and-forget: errors are logged but never reach the caller.
    pub fn emit(&self, event: ChangeEvent) {
        let forwarder = self.clone();

        tokio::spawn(async move {
            if let Err(e) = forwarder.forward(&event).await {
                warn!(
                    url = %forwarder.url,
                    method = %event.method(),
                    endpoint = %event.endpoint(),
                    "Failed to forward event to notifier: {}",
                    e
                );
            }
        });
    }
}
