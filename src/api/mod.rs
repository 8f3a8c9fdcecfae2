//! HTTP and WebSocket API for the notifier

pub mod handlers;
pub mod routes;
pub mod ws_handlers;

pub use handlers::{PubSubState, ServerState, SessionSettings};
pub use routes::create_router;
