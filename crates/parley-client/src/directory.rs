use async_trait::async_trait;

use parley_shared::keys::PublicKeyBytes;
use parley_shared::rest::PublicKeyResponse;
use parley_shared::types::UserId;

use crate::error::Result;

/// Where the engine publishes its public key and looks up peers' keys.
///
/// `fetch_key` returns `Ok(None)` for a user who never published a key;
/// that is an expected outcome, not an error. `publish_key` returns the
/// entry the directory holds afterwards, which is not ours when it kept a
/// newer key.
#[async_trait]
pub trait KeyDirectoryClient: Send + Sync {
    async fn publish_key(&self, key: &PublicKeyBytes, version: u32) -> Result<PublicKeyResponse>;
    async fn fetch_key(&self, user: &UserId) -> Result<Option<PublicKeyResponse>>;
}
