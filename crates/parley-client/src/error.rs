use thiserror::Error;

use parley_shared::error::{CryptoError, ProtocolError};
use parley_shared::types::GroupId;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vault encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("No key held for group {0}")]
    MissingGroupKey(GroupId),

    #[error("Key directory kept another key at version {stored}")]
    KeyNotPublished { stored: u32 },

    #[error("Session closed")]
    SessionClosed,
}

impl ClientError {
    /// HTTP status carried by a server rejection, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
