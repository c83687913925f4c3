//! # parley-server
//!
//! Real-time relay for end-to-end encrypted chat. The server stores and
//! forwards opaque envelopes; it never holds a private key.
//!
//! - **Connection registry** of live WebSocket connections per user
//! - **Presence** deltas on first connect and last disconnect
//! - **Message router** that persists, then pushes to live connections
//! - **Key directory** of versioned public keys
//! - **Groups** with per-member wrapped keys
//! - **Moderation** (ban, suspend) driven from an authenticated admin channel
//! - **REST API** (axum) for the pull tier, with per-IP rate limiting

pub mod admin;
pub mod api;
pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod groups;
pub mod moderation;
pub mod presence;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;

pub use api::{build_router, serve, serve_on};
pub use config::ServerConfig;
pub use error::ServerError;
pub use state::AppState;
