use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid base64 encoding")]
    InvalidEncoding,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}
