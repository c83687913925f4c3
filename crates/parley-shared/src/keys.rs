//! X25519 key pairs and asymmetric wrapping of symmetric keys.
//!
//! A wrapped key is `ephemeral_public(32) || nonce(24) || ciphertext(48)`:
//! the sender generates an ephemeral X25519 secret, runs Diffie-Hellman
//! against the recipient's public key, derives a one-off wrapping key with
//! BLAKE3, and seals the symmetric key with XChaCha20-Poly1305. Only the
//! holder of the matching private key can recover it.

use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_KEY_WRAP, NONCE_SIZE, PUBKEY_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE};
use crate::crypto::{self, SymmetricKey};
use crate::error::CryptoError;

/// Length of a wrapped symmetric key in bytes.
pub const WRAPPED_KEY_SIZE: usize = PUBKEY_SIZE + NONCE_SIZE + SYMMETRIC_KEY_SIZE + TAG_SIZE;

/// Raw X25519 public key, exchanged as base64 through the key directory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub [u8; PUBKEY_SIZE]);

impl PublicKeyBytes {
    pub fn to_base64(&self) -> String {
        crypto::to_base64(&self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = crypto::from_base64(s)?;
        let arr: [u8; PUBKEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", self.to_base64())
    }
}

/// A user's long-term X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from secret key bytes
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes(self.public.to_bytes())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

fn derive_wrapping_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; PUBKEY_SIZE],
    recipient_public: &[u8; PUBKEY_SIZE],
) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_KEY_WRAP);
    hasher.update(shared_secret);
    hasher.update(ephemeral_public);
    hasher.update(recipient_public);
    *hasher.finalize().as_bytes()
}

/// Wrap `key` so that only the owner of `recipient` can unwrap it.
pub fn wrap_key(recipient: &PublicKeyBytes, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();

    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(CryptoError::EncryptionFailed);
    }

    let wrapping_key = derive_wrapping_key(shared.as_bytes(), &ephemeral_public, &recipient.0);
    let (nonce, ciphertext) = crypto::seal(&wrapping_key, key)?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_SIZE);
    out.extend_from_slice(&ephemeral_public);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn unwrap_key(keypair: &KeyPair, wrapped: &[u8]) -> Result<SymmetricKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (ephemeral_public, rest) = wrapped.split_at(PUBKEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let ephemeral_public: [u8; PUBKEY_SIZE] = ephemeral_public
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let shared = keypair
        .secret
        .diffie_hellman(&PublicKey::from(ephemeral_public));
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }

    let wrapping_key =
        derive_wrapping_key(shared.as_bytes(), &ephemeral_public, &keypair.public.to_bytes());
    let key = crypto::open(&wrapping_key, nonce, ciphertext)?;
    crypto::symmetric_key_from_slice(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_symmetric_key;

    #[test]
    fn test_keypair_restore() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(kp.secret_bytes());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let recipient = KeyPair::generate();
        let key = generate_symmetric_key();

        let wrapped = wrap_key(&recipient.public_key(), &key).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_KEY_SIZE);
        assert_eq!(unwrap_key(&recipient, &wrapped).unwrap(), key);
    }

    #[test]
    fn test_unwrap_with_foreign_key_fails() {
        let recipient = KeyPair::generate();
        let intruder = KeyPair::generate();
        let wrapped = wrap_key(&recipient.public_key(), &generate_symmetric_key()).unwrap();

        assert_eq!(
            unwrap_key(&intruder, &wrapped),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_wrapping_is_randomized() {
        let recipient = KeyPair::generate();
        let key = generate_symmetric_key();
        let a = wrap_key(&recipient.public_key(), &key).unwrap();
        let b = wrap_key(&recipient.public_key(), &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_low_order_public_key_rejected() {
        let zero = PublicKeyBytes([0u8; 32]);
        assert!(wrap_key(&zero, &generate_symmetric_key()).is_err());
    }

    #[test]
    fn test_public_key_base64() {
        let kp = KeyPair::generate();
        let b64 = kp.public_key().to_base64();
        assert_eq!(PublicKeyBytes::from_base64(&b64).unwrap(), kp.public_key());
        assert_eq!(
            PublicKeyBytes::from_base64("AAAA"),
            Err(CryptoError::InvalidKeyLength)
        );
    }
}
