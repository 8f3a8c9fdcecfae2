//! Per-connection delivery handles

use super::ServerMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// A single failed delivery. Non-fatal to a publish.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The connection went away (socket closed, writer task gone)
    #[error("connection closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Where a connection's outbound messages go.
///
/// The WebSocket handler owns the other end and writes to the socket,
/// so per-connection ordering follows the order of `deliver` calls.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, message: ServerMessage) -> Result<(), DeliveryError>;
}

/// Bounded channel sink drained by a connection's writer task.
///
/// Never waits on a slow reader: when the queue is full the message is
/// dropped for that connection and the delivery reported as failed.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<ServerMessage>,
}

impl ChannelSink {
    /// Create a sink and the receiver its writer task should drain
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, message: ServerMessage) -> Result<(), DeliveryError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Failed("outbound queue full".to_string()),
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}
