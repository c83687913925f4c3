//! Client secret storage.
//!
//! The engine persists its key material through a [`SecretStore`]: an opaque
//! blob in, the same blob out. [`FileSecretStore`] encrypts the blob at rest
//! under a key derived from a passphrase; [`MemorySecretStore`] is for tests
//! and ephemeral sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use parley_shared::constants::KDF_CONTEXT_VAULT_KEY;
use parley_shared::crypto::{self, SymmetricKey};
use parley_shared::keys::KeyPair;
use parley_shared::types::GroupId;

use crate::error::{ClientError, Result};

pub trait SecretStore: Send + Sync {
    /// The last saved blob, or `None` when nothing was saved yet.
    fn load(&self) -> Result<Option<Vec<u8>>>;
    fn save(&self, blob: &[u8]) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySecretStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        let guard = self
            .blob
            .lock()
            .map_err(|_| ClientError::Io(std::io::Error::other("vault lock poisoned")))?;
        Ok(guard.clone())
    }

    fn save(&self, blob: &[u8]) -> Result<()> {
        let mut guard = self
            .blob
            .lock()
            .map_err(|_| ClientError::Io(std::io::Error::other("vault lock poisoned")))?;
        *guard = Some(blob.to_vec());
        Ok(())
    }
}

/// Passphrase-encrypted vault file.
pub struct FileSecretStore {
    path: PathBuf,
    key: SymmetricKey,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>, passphrase: &str) -> Self {
        Self {
            path: path.into(),
            key: crypto::derive_key_from_passphrase(passphrase.as_bytes(), KDF_CONTEXT_VAULT_KEY),
        }
    }

    /// `<data dir>/parley/vault.bin` on the current platform.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("com", "parley", "parley").ok_or_else(|| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "cannot determine data directory",
            ))
        })?;
        Ok(dirs.data_dir().join("vault.bin"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for FileSecretStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let sealed = std::fs::read(&self.path)?;
        // A wrong passphrase surfaces as a decryption failure.
        let blob = crypto::decrypt(&self.key, &sealed)?;
        debug!(path = %self.path.display(), "vault loaded");
        Ok(Some(blob))
    }

    fn save(&self, blob: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let sealed = crypto::encrypt(&self.key, blob)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, sealed)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "vault saved");
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    version: u32,
    secret: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct VaultContents {
    current: StoredKey,
    /// Retired keys, newest first.
    legacy: Vec<StoredKey>,
    group_keys: HashMap<GroupId, SymmetricKey>,
}

/// Everything the engine must not lose: the current key pair and version,
/// retired key pairs, and unwrapped group keys.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub current: KeyPair,
    pub version: u32,
    /// Retired key pairs tagged with their version, newest first.
    pub legacy: Vec<(u32, KeyPair)>,
    pub group_keys: HashMap<GroupId, SymmetricKey>,
}

impl KeyMaterial {
    pub fn generate() -> Self {
        Self {
            current: KeyPair::generate(),
            version: 1,
            legacy: Vec::new(),
            group_keys: HashMap::new(),
        }
    }

    /// Retire the current pair and switch to a fresh one. Returns the new
    /// version.
    pub fn rotate(&mut self) -> u32 {
        let retired = std::mem::replace(&mut self.current, KeyPair::generate());
        self.legacy.insert(0, (self.version, retired));
        self.version += 1;
        self.version
    }

    /// Move the current pair to a version above `stored` without
    /// generating a new pair. Returns the new version.
    pub fn advance_past(&mut self, stored: u32) -> u32 {
        if self.version <= stored {
            self.version = stored.saturating_add(1);
        }
        self.version
    }

    /// The key pair that was current at `version`.
    pub fn pair_for_version(&self, version: u32) -> Option<&KeyPair> {
        if version == self.version {
            return Some(&self.current);
        }
        self.legacy
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, pair)| pair)
    }

    /// Current pair first, then legacy pairs newest first.
    pub fn all_pairs(&self) -> impl Iterator<Item = &KeyPair> {
        std::iter::once(&self.current).chain(self.legacy.iter().map(|(_, pair)| pair))
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let contents = VaultContents {
            current: StoredKey {
                version: self.version,
                secret: self.current.secret_bytes(),
            },
            legacy: self
                .legacy
                .iter()
                .map(|(version, pair)| StoredKey {
                    version: *version,
                    secret: pair.secret_bytes(),
                })
                .collect(),
            group_keys: self.group_keys.clone(),
        };
        Ok(bincode::serialize(&contents)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let contents: VaultContents = bincode::deserialize(bytes)?;
        Ok(Self {
            current: KeyPair::from_secret_bytes(contents.current.secret),
            version: contents.current.version,
            legacy: contents
                .legacy
                .into_iter()
                .map(|k| (k.version, KeyPair::from_secret_bytes(k.secret)))
                .collect(),
            group_keys: contents.group_keys,
        })
    }
}

/// Typed view over a [`SecretStore`].
pub struct KeyVault {
    store: Box<dyn SecretStore>,
}

impl KeyVault {
    pub fn new(store: Box<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Load saved material, or generate and save a fresh identity.
    pub fn load_or_generate(&self) -> Result<KeyMaterial> {
        if let Some(blob) = self.store.load()? {
            let material = KeyMaterial::from_bytes(&blob)?;
            info!(
                version = material.version,
                legacy = material.legacy.len(),
                groups = material.group_keys.len(),
                "key material restored"
            );
            return Ok(material);
        }

        let material = KeyMaterial::generate();
        self.save(&material)?;
        info!("generated new key pair");
        Ok(material)
    }

    pub fn save(&self, material: &KeyMaterial) -> Result<()> {
        self.store.save(&material.to_bytes()?)
    }
}
