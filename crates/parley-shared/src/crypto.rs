use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];
pub type Nonce = [u8; NONCE_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt under a fresh random nonce, returned separately from the ciphertext.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>), CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok((nonce, ciphertext))
}

pub fn open(key: &SymmetricKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (nonce, ciphertext) = seal(key, plaintext)?;
    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    open(key, nonce, ciphertext)
}

pub fn derive_key_from_passphrase(passphrase: &[u8], context: &str) -> SymmetricKey {
    blake3::derive_key(context, passphrase)
}

pub fn to_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn from_base64(s: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(s.trim())
        .map_err(|_| CryptoError::InvalidEncoding)
}

pub fn symmetric_key_from_slice(bytes: &[u8]) -> Result<SymmetricKey, CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}
