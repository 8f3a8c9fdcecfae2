//! Authentication module: WebSocket handshake against an access-token store
//!
//! Provides:
//! - `Credential` / `AuthGate`: the connection-time check (`gate` submodule)
//! - `IdentityStore` and its in-memory and HTTP implementations (`store` submodule)

pub mod gate;
pub mod store;

pub use gate::{AuthGate, AuthRejected, Credential};
pub use store::{
    AccessTokenRecord, IdentityError, IdentityStore, InMemoryIdentityStore, RemoteIdentityStore,
};
