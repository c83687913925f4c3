use tracing::{debug, info};

use parley_shared::keys::PublicKeyBytes;
use parley_shared::rest::PublicKeyResponse;
use parley_shared::types::UserId;

use crate::error::ServerError;
use crate::state::SharedDatabase;

/// Server-side directory of users' current public keys.
#[derive(Clone)]
pub struct KeyDirectory {
    db: SharedDatabase,
}

impl KeyDirectory {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Idempotent upsert. Without an explicit version the stored version is
    /// kept (or 1 for a first publish). Returns the entry now in effect.
    pub fn publish(
        &self,
        user: &UserId,
        public_key: &str,
        version: Option<u32>,
    ) -> Result<PublicKeyResponse, ServerError> {
        let key = PublicKeyBytes::from_base64(public_key)
            .map_err(|e| ServerError::BadRequest(format!("public key: {e}")))?;
        let encoded = key.to_base64();

        let db = self.db.lock()?;
        let version = match version {
            Some(v) => v,
            None => db.get_public_key(user)?.map_or(1, |r| r.key_version),
        };

        if db.upsert_public_key(user, &encoded, version)? {
            info!(user = %user.short(), version, "public key published");
        } else {
            debug!(user = %user.short(), version, "stale public key ignored");
        }

        let current = db
            .get_public_key(user)?
            .ok_or_else(|| ServerError::Internal("published key vanished".into()))?;
        Ok(PublicKeyResponse {
            public_key: current.public_key,
            key_version: current.key_version,
        })
    }

    /// `None` is the expected answer for users who never published a key.
    pub fn lookup(&self, user: &UserId) -> Result<Option<PublicKeyResponse>, ServerError> {
        let record = self.db.lock()?.get_public_key(user)?;
        Ok(record.map(|r| PublicKeyResponse {
            public_key: r.public_key,
            key_version: r.key_version,
        }))
    }
}
