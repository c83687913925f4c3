//! Ciphertext envelopes carried in `Message::content`.
//!
//! Direct messages use hybrid encryption: a fresh symmetric key per message,
//! wrapped under the recipient's public key. Group messages are sealed
//! directly with the group's shared key.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, SymmetricKey};
use crate::error::CryptoError;
use crate::keys::{self, KeyPair, PublicKeyBytes};
use crate::types::GroupId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Per-message key wrapped under the recipient's public key (base64).
    pub key: String,
    /// XChaCha20 nonce (base64).
    pub iv: String,
    /// Sealed plaintext (base64).
    pub content: String,
    /// Version of the recipient key the message key was wrapped under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
}

impl MessageEnvelope {
    pub fn seal(
        plaintext: &str,
        recipient: &PublicKeyBytes,
        recipient_key_version: u32,
    ) -> Result<Self, CryptoError> {
        let message_key = crypto::generate_symmetric_key();
        let (nonce, ciphertext) = crypto::seal(&message_key, plaintext.as_bytes())?;
        let wrapped = keys::wrap_key(recipient, &message_key)?;

        Ok(Self {
            key: crypto::to_base64(&wrapped),
            iv: crypto::to_base64(&nonce),
            content: crypto::to_base64(&ciphertext),
            key_version: Some(recipient_key_version),
        })
    }

    pub fn open(&self, keypair: &KeyPair) -> Result<String, CryptoError> {
        let wrapped = crypto::from_base64(&self.key)?;
        let message_key = keys::unwrap_key(keypair, &wrapped)?;
        let nonce = crypto::from_base64(&self.iv)?;
        let ciphertext = crypto::from_base64(&self.content)?;
        let plaintext = crypto::open(&message_key, &nonce, &ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Recognise an envelope. Anything else (plain text, partial objects)
    /// yields `None`.
    pub fn parse(content: &str) -> Option<Self> {
        serde_json::from_str(content).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupEnvelope {
    pub iv: String,
    pub content: String,
    pub group_id: GroupId,
}

impl GroupEnvelope {
    pub fn seal(
        group_id: GroupId,
        group_key: &SymmetricKey,
        plaintext: &str,
    ) -> Result<Self, CryptoError> {
        let (nonce, ciphertext) = crypto::seal(group_key, plaintext.as_bytes())?;
        Ok(Self {
            iv: crypto::to_base64(&nonce),
            content: crypto::to_base64(&ciphertext),
            group_id,
        })
    }

    pub fn open(&self, group_key: &SymmetricKey) -> Result<String, CryptoError> {
        let nonce = crypto::from_base64(&self.iv)?;
        let ciphertext = crypto::from_base64(&self.content)?;
        let plaintext = crypto::open(group_key, &nonce, &ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }

    pub fn parse(content: &str) -> Option<Self> {
        serde_json::from_str(content).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
