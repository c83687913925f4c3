//! # parley-store
//!
//! Server-side persistence for Parley, backed by SQLite.
//!
//! The store only ever sees message envelopes and wrapped keys; it cannot
//! read message contents. The crate exposes a synchronous `Database` handle
//! that wraps a `rusqlite::Connection` and provides typed helpers for
//! messages, groups and the public-key directory.

pub mod database;
pub mod groups;
pub mod keys;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
