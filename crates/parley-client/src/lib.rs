//! # parley-client
//!
//! Client side of Parley: the encryption engine and its secret vault, the
//! REST client for the key directory and message history, and the live
//! WebSocket session with presence tracking.

pub mod client;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod presence;
pub mod rest;
pub mod session;
pub mod vault;

pub use client::{ParleyClient, ReadableMessage, SentMessage};
pub use config::ClientConfig;
pub use engine::{Decryption, EncryptionEngine, Outgoing};
pub use error::{ClientError, Result};
pub use presence::PresenceView;
pub use session::{ChatSession, SessionEvent, StopReason};
pub use vault::{FileSecretStore, KeyVault, MemorySecretStore, SecretStore};
