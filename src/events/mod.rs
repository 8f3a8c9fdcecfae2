//! Change event fanout for real-time WebSocket notifications
//!
//! This module provides:
//! - `ChangeEvent`: an intercepted mutation (method, endpoint, data)
//! - `ConnectionRegistry`: live connections, auth state, endpoint filters
//! - `Publisher`: bounded-concurrency fanout to authenticated connections
//! - `AuthBus`: broadcast of successful WebSocket authentications
//! - `InterceptPolicy` / `EventForwarder`: producer-side helpers

mod bus;
pub mod forwarder;
mod interceptor;
mod publisher;
mod registry;
mod sink;
mod types;

pub use bus::{AuthBus, AuthNotice};
pub use forwarder::{EventForwarder, ForwardError, ForwardOutcome};
pub use interceptor::{InterceptPolicy, DEFAULT_IGNORED_ENDPOINTS};
pub use publisher::{PublishError, PublishReport, Publisher, DEFAULT_MAX_CONCURRENCY};
pub use registry::{
    endpoint_matches, parse_endpoint_filter, Connection, ConnectionId, ConnectionRegistry,
    RegistryError,
};
pub use sink::{ChannelSink, DeliveryError, EventSink};
pub use types::{ChangeEvent, ClientMessage, HttpMethod, InvalidEvent, ServerMessage};
