//! Client-resident encryption engine.
//!
//! Owns the user's key pair, retired key pairs, and every group key it has
//! received. Private keys never leave this module except into the vault.
//! Encryption degrades to a flagged plaintext fallback when the peer has no
//! usable key; decryption never fails loudly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use parley_shared::constants::UNDECRYPTABLE_NOTICE;
use parley_shared::crypto::{self, SymmetricKey};
use parley_shared::envelope::{GroupEnvelope, MessageEnvelope};
use parley_shared::keys::{self, PublicKeyBytes};
use parley_shared::rest::{PublicKeyResponse, WrappedGroupKey};
use parley_shared::types::{GroupId, UserId};

use crate::directory::KeyDirectoryClient;
use crate::error::{ClientError, Result};
use crate::vault::{KeyMaterial, KeyVault};

/// Outcome of [`EncryptionEngine::encrypt_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Serialized envelope ready for `Message::content`.
    Encrypted(String),
    /// The recipient has no usable key; the plaintext goes out as-is.
    Unavailable { plaintext: String },
}

impl Outgoing {
    pub fn encryption_unavailable(&self) -> bool {
        matches!(self, Outgoing::Unavailable { .. })
    }

    pub fn into_content(self) -> String {
        match self {
            Outgoing::Encrypted(content) => content,
            Outgoing::Unavailable { plaintext } => plaintext,
        }
    }
}

/// Outcome of decrypting a stored or received message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decryption {
    /// Not an envelope; shown unchanged.
    Plaintext(String),
    Decrypted(String),
    /// An envelope none of our keys could open.
    Failed,
}

impl Decryption {
    /// Text to display. Failures become the inline notice.
    pub fn into_text(self) -> String {
        match self {
            Decryption::Plaintext(text) | Decryption::Decrypted(text) => text,
            Decryption::Failed => UNDECRYPTABLE_NOTICE.to_string(),
        }
    }
}

/// Result of wrapping a group key for several members.
#[derive(Debug, Default)]
pub struct SharedGroupKey {
    pub wrapped: HashMap<UserId, WrappedGroupKey>,
    /// Members with no published key; they cannot read the group until
    /// they publish one and the key is shared again.
    pub missing: Vec<UserId>,
}

pub struct EncryptionEngine {
    directory: Arc<dyn KeyDirectoryClient>,
    vault: KeyVault,
    material: RwLock<KeyMaterial>,
    peer_keys: Mutex<HashMap<UserId, PublicKeyResponse>>,
}

impl EncryptionEngine {
    /// Restore key material from the vault, generating a first key pair when
    /// the vault is empty.
    pub fn open(directory: Arc<dyn KeyDirectoryClient>, vault: KeyVault) -> Result<Self> {
        let material = vault.load_or_generate()?;
        Ok(Self {
            directory,
            vault,
            material: RwLock::new(material),
            peer_keys: Mutex::new(HashMap::new()),
        })
    }

    pub async fn public_key(&self) -> PublicKeyBytes {
        self.material.read().await.current.public_key()
    }

    pub async fn key_version(&self) -> u32 {
        self.material.read().await.version
    }

    /// Publish the current public key under its version.
    ///
    /// When the directory already holds a different key at the same or a
    /// higher version (another install of this account, or a lost vault),
    /// the local version jumps past it and the key is published again.
    pub async fn publish_key(&self) -> Result<()> {
        let (key, version) = {
            let material = self.material.read().await;
            (material.current.public_key(), material.version)
        };
        let published = self.directory.publish_key(&key, version).await?;
        if published.public_key == key.to_base64() {
            info!(version = published.key_version, "public key published");
            return Ok(());
        }

        let version = {
            let mut material = self.material.write().await;
            let version = material.advance_past(published.key_version);
            self.vault.save(&material)?;
            version
        };
        warn!(
            stored = published.key_version,
            version, "directory held another key; publishing under a newer version"
        );
        let published = self.directory.publish_key(&key, version).await?;
        if published.public_key != key.to_base64() {
            return Err(ClientError::KeyNotPublished {
                stored: published.key_version,
            });
        }
        info!(version, "public key published");
        Ok(())
    }

    /// Peer's current key from cache or the directory. Lookup failures are
    /// logged and reported as absence.
    async fn peer_key(&self, user: &UserId) -> Option<PublicKeyResponse> {
        if let Some(cached) = self.peer_keys.lock().await.get(user) {
            return Some(cached.clone());
        }
        match self.directory.fetch_key(user).await {
            Ok(Some(found)) => {
                self.peer_keys
                    .lock()
                    .await
                    .insert(user.clone(), found.clone());
                Some(found)
            }
            Ok(None) => {
                debug!(peer = %user.short(), "peer has no published key");
                None
            }
            Err(e) => {
                warn!(peer = %user.short(), error = %e, "key lookup failed");
                None
            }
        }
    }

    /// Forget a cached peer key, e.g. after the peer rotated.
    pub async fn forget_peer(&self, user: &UserId) {
        self.peer_keys.lock().await.remove(user);
    }

    pub async fn encrypt_message(&self, plaintext: &str, recipient: &UserId) -> Outgoing {
        let Some(peer) = self.peer_key(recipient).await else {
            return Outgoing::Unavailable {
                plaintext: plaintext.to_string(),
            };
        };

        let sealed = PublicKeyBytes::from_base64(&peer.public_key)
            .and_then(|key| MessageEnvelope::seal(plaintext, &key, peer.key_version));
        match sealed {
            Ok(envelope) => Outgoing::Encrypted(envelope.to_json()),
            Err(e) => {
                warn!(peer = %recipient.short(), error = %e, "peer key unusable");
                self.forget_peer(recipient).await;
                Outgoing::Unavailable {
                    plaintext: plaintext.to_string(),
                }
            }
        }
    }

    /// Decrypt a direct message body. Uses the key matching the envelope's
    /// version when known, otherwise tries every key newest first.
    pub async fn decrypt_message(&self, content: &str) -> Decryption {
        let Some(envelope) = MessageEnvelope::parse(content) else {
            return Decryption::Plaintext(content.to_string());
        };

        let material = self.material.read().await;
        if let Some(pair) = envelope.key_version.and_then(|v| material.pair_for_version(v)) {
            if let Ok(text) = envelope.open(pair) {
                return Decryption::Decrypted(text);
            }
        }
        for pair in material.all_pairs() {
            if let Ok(text) = envelope.open(pair) {
                return Decryption::Decrypted(text);
            }
        }

        debug!(key_version = ?envelope.key_version, "envelope could not be opened");
        Decryption::Failed
    }

    /// Fresh key for a group this user is creating. The server assigns the
    /// group id, so the key is kept only once [`Self::install_group_key`]
    /// is called with it.
    pub fn generate_group_key(&self) -> SymmetricKey {
        crypto::generate_symmetric_key()
    }

    pub async fn has_group_key(&self, group_id: &GroupId) -> bool {
        self.material.read().await.group_keys.contains_key(group_id)
    }

    /// Wrap `group_key` for one member. `Ok(None)` when the member has no
    /// published key.
    pub async fn encrypt_group_key(
        &self,
        group_key: &SymmetricKey,
        member: &UserId,
    ) -> Result<Option<WrappedGroupKey>> {
        let Some(peer) = self.peer_key(member).await else {
            return Ok(None);
        };
        let public = PublicKeyBytes::from_base64(&peer.public_key)?;
        let wrapped = keys::wrap_key(&public, group_key)?;
        Ok(Some(WrappedGroupKey {
            wrapped_key: crypto::to_base64(&wrapped),
            key_version: peer.key_version,
        }))
    }

    /// Wrap the held key of `group_id` for every member in `members`.
    pub async fn share_group_key(
        &self,
        group_id: &GroupId,
        members: &[UserId],
    ) -> Result<SharedGroupKey> {
        let group_key = self
            .material
            .read()
            .await
            .group_keys
            .get(group_id)
            .copied()
            .ok_or(ClientError::MissingGroupKey(*group_id))?;
        self.wrap_for_members(&group_key, members).await
    }

    /// Wrap `group_key` for each member, collecting those without a key.
    pub async fn wrap_for_members(
        &self,
        group_key: &SymmetricKey,
        members: &[UserId],
    ) -> Result<SharedGroupKey> {
        let mut shared = SharedGroupKey::default();
        for member in members {
            match self.encrypt_group_key(group_key, member).await? {
                Some(wrapped) => {
                    shared.wrapped.insert(member.clone(), wrapped);
                }
                None => shared.missing.push(member.clone()),
            }
        }
        if !shared.missing.is_empty() {
            warn!(missing = shared.missing.len(), "members without a published key");
        }
        Ok(shared)
    }

    /// Keep a key from [`Self::generate_group_key`] under its assigned id.
    pub async fn install_group_key(&self, group_id: GroupId, key: SymmetricKey) -> Result<()> {
        self.store_group_key(group_id, key).await
    }

    /// Unwrap a group key distributed to this user and keep it.
    pub async fn accept_group_key(&self, group_id: GroupId, wrapped: &WrappedGroupKey) -> Result<()> {
        let bytes = crypto::from_base64(&wrapped.wrapped_key)?;
        let key = {
            let material = self.material.read().await;
            let preferred = material.pair_for_version(wrapped.key_version);
            let key = preferred
                .into_iter()
                .chain(material.all_pairs())
                .find_map(|pair| keys::unwrap_key(pair, &bytes).ok())
                .ok_or(parley_shared::error::CryptoError::DecryptionFailed)?;
            key
        };
        self.store_group_key(group_id, key).await?;
        info!(group = %group_id, "group key accepted");
        Ok(())
    }

    pub async fn encrypt_group_message(&self, group_id: &GroupId, plaintext: &str) -> Result<String> {
        let key = self
            .material
            .read()
            .await
            .group_keys
            .get(group_id)
            .copied()
            .ok_or(ClientError::MissingGroupKey(*group_id))?;
        Ok(GroupEnvelope::seal(*group_id, &key, plaintext)?.to_json())
    }

    pub async fn decrypt_group_message(&self, content: &str) -> Decryption {
        let Some(envelope) = GroupEnvelope::parse(content) else {
            return Decryption::Plaintext(content.to_string());
        };
        let material = self.material.read().await;
        match material.group_keys.get(&envelope.group_id) {
            Some(key) => envelope
                .open(key)
                .map(Decryption::Decrypted)
                .unwrap_or(Decryption::Failed),
            None => {
                debug!(group = %envelope.group_id, "no key for group envelope");
                Decryption::Failed
            }
        }
    }

    /// Retire the current key pair, publish a new one under the next version
    /// and drop cached peer keys. Group keys are kept as they are.
    pub async fn rotate_keys(&self) -> Result<u32> {
        let version = {
            let mut material = self.material.write().await;
            let version = material.rotate();
            self.vault.save(&material)?;
            version
        };
        self.peer_keys.lock().await.clear();
        info!(version, "key pair rotated");
        self.publish_key().await?;
        Ok(self.key_version().await)
    }

    async fn store_group_key(&self, group_id: GroupId, key: SymmetricKey) -> Result<()> {
        let mut material = self.material.write().await;
        material.group_keys.insert(group_id, key);
        self.vault.save(&material)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use parley_shared::keys::KeyPair;

    use super::*;
    use crate::vault::MemorySecretStore;

    /// In-process stand-in for the server's key directory.
    #[derive(Default)]
    pub(crate) struct FakeDirectory {
        keys: StdMutex<HashMap<UserId, PublicKeyResponse>>,
        pub(crate) fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl KeyDirectoryClient for FakeDirectory {
        async fn publish_key(
            &self,
            key: &PublicKeyBytes,
            version: u32,
        ) -> Result<PublicKeyResponse> {
            let mut keys = self.keys.lock().unwrap();
            let entry = keys
                .entry(UserId::from("self"))
                .or_insert_with(|| PublicKeyResponse {
                    public_key: key.to_base64(),
                    key_version: version,
                });
            // Same rule as the server: an older version never replaces a newer one.
            if version >= entry.key_version {
                *entry = PublicKeyResponse {
                    public_key: key.to_base64(),
                    key_version: version,
                };
            }
            Ok(entry.clone())
        }

        async fn fetch_key(&self, user: &UserId) -> Result<Option<PublicKeyResponse>> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ClientError::Status {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(self.keys.lock().unwrap().get(user).cloned())
        }
    }

    impl FakeDirectory {
        pub(crate) fn insert(&self, user: &str, key: PublicKeyBytes, version: u32) {
            self.keys.lock().unwrap().insert(
                UserId::from(user),
                PublicKeyResponse {
                    public_key: key.to_base64(),
                    key_version: version,
                },
            );
        }
    }

    /// Engines for alice and bob sharing one directory, keys published.
    async fn pair() -> (EncryptionEngine, EncryptionEngine, Arc<FakeDirectory>) {
        let dir = Arc::new(FakeDirectory::default());
        let alice = engine(dir.clone());
        let bob = engine(dir.clone());
        dir.insert("alice", alice.public_key().await, 1);
        dir.insert("bob", bob.public_key().await, 1);
        (alice, bob, dir)
    }

    fn engine(dir: Arc<FakeDirectory>) -> EncryptionEngine {
        EncryptionEngine::open(dir, KeyVault::new(Box::new(MemorySecretStore::new()))).unwrap()
    }

    #[tokio::test]
    async fn test_publish_moves_past_a_newer_stored_key() {
        let dir = Arc::new(FakeDirectory::default());
        // A previous install of this account left version 2 behind.
        dir.insert("self", KeyPair::generate().public_key(), 2);

        let fresh = engine(dir.clone());
        assert_eq!(fresh.key_version().await, 1);
        fresh.publish_key().await.unwrap();

        assert_eq!(fresh.key_version().await, 3);
        let stored = dir.fetch_key(&UserId::from("self")).await.unwrap().unwrap();
        assert_eq!(stored.public_key, fresh.public_key().await.to_base64());
        assert_eq!(stored.key_version, 3);

        // Mail sealed against the directory entry opens locally.
        let alice = engine(dir.clone());
        let content = alice
            .encrypt_message("hi", &UserId::from("self"))
            .await
            .into_content();
        assert_eq!(
            fresh.decrypt_message(&content).await,
            Decryption::Decrypted("hi".into())
        );
    }

    #[tokio::test]
    async fn test_direct_round_trip() {
        let (alice, bob, _) = pair().await;
        let out = alice.encrypt_message("hi", &UserId::from("bob")).await;
        assert!(!out.encryption_unavailable());

        let content = out.into_content();
        assert!(!content.contains("hi\""));
        assert_eq!(
            bob.decrypt_message(&content).await,
            Decryption::Decrypted("hi".into())
        );
        // The sender cannot read what was sealed for the recipient.
        assert_eq!(alice.decrypt_message(&content).await, Decryption::Failed);
    }

    #[tokio::test]
    async fn test_unavailable_peer_falls_back() {
        let (alice, _, dir) = pair().await;
        let out = alice.encrypt_message("hello", &UserId::from("carol")).await;
        assert_eq!(
            out,
            Outgoing::Unavailable {
                plaintext: "hello".into()
            }
        );

        dir.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let out = alice.encrypt_message("hello", &UserId::from("dave")).await;
        assert!(out.encryption_unavailable());
    }

    #[tokio::test]
    async fn test_decrypt_garbage_is_safe() {
        let (alice, _, _) = pair().await;
        assert_eq!(
            alice.decrypt_message("not json").await,
            Decryption::Plaintext("not json".into())
        );
        assert_eq!(
            alice.decrypt_message(r#"{"key":"x"}"#).await.into_text(),
            r#"{"key":"x"}"#
        );
        let bogus = r#"{"key":"AAAA","iv":"AAAA","content":"AAAA"}"#;
        assert_eq!(
            alice.decrypt_message(bogus).await.into_text(),
            UNDECRYPTABLE_NOTICE
        );
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_messages_readable() {
        let (alice, bob, dir) = pair().await;
        let before = alice.encrypt_message("old", &UserId::from("bob")).await;

        assert_eq!(bob.rotate_keys().await.unwrap(), 2);
        dir.insert("bob", bob.public_key().await, 2);
        alice.forget_peer(&UserId::from("bob")).await;
        let after = alice.encrypt_message("new", &UserId::from("bob")).await;

        assert_eq!(
            bob.decrypt_message(&before.into_content()).await.into_text(),
            "old"
        );
        assert_eq!(
            bob.decrypt_message(&after.into_content()).await.into_text(),
            "new"
        );
    }

    #[tokio::test]
    async fn test_group_key_distribution() {
        let (alice, bob, _) = pair().await;
        let group = GroupId::new();

        let key = alice.generate_group_key();
        alice.install_group_key(group, key).await.unwrap();
        let members = [UserId::from("bob"), UserId::from("carol")];
        let shared = alice.share_group_key(&group, &members).await.unwrap();
        assert_eq!(shared.missing, vec![UserId::from("carol")]);

        // Bob rotates before picking up the key; the legacy key still opens it.
        bob.rotate_keys().await.unwrap();
        bob.accept_group_key(group, &shared.wrapped[&UserId::from("bob")])
            .await
            .unwrap();
        assert!(bob.has_group_key(&group).await);

        let sealed = alice.encrypt_group_message(&group, "team").await.unwrap();
        assert_eq!(
            bob.decrypt_group_message(&sealed).await,
            Decryption::Decrypted("team".into())
        );
    }

    #[tokio::test]
    async fn test_group_without_key() {
        let (alice, bob, _) = pair().await;
        let group = GroupId::new();
        assert!(matches!(
            bob.encrypt_group_message(&group, "x").await,
            Err(ClientError::MissingGroupKey(_))
        ));

        let key = alice.generate_group_key();
        alice.install_group_key(group, key).await.unwrap();
        let sealed = alice.encrypt_group_message(&group, "secret").await.unwrap();
        assert_eq!(bob.decrypt_group_message(&sealed).await, Decryption::Failed);
        assert_eq!(
            bob.decrypt_group_message("plain").await,
            Decryption::Plaintext("plain".into())
        );
    }
}
