/// Application name
pub const APP_NAME: &str = "Parley";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Maximum message content size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Separator between the two sorted identities of a direct conversation id.
/// Persisted data depends on this exact value.
pub const CONVERSATION_SEPARATOR: &str = "_";

/// Minimum number of members (creator included) needed to create a group
pub const MIN_GROUP_MEMBERS: usize = 3;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_KEY_WRAP: &str = "parley-key-wrap-v1";
pub const KDF_CONTEXT_VAULT_KEY: &str = "parley-vault-key-v1";

/// Inline placeholder shown instead of a message body that cannot be decrypted
pub const UNDECRYPTABLE_NOTICE: &str = "[Unable to decrypt this message]";

/// Shown to the sender for their own direct messages, which are sealed for
/// the recipient only
pub const SENT_ENCRYPTED_NOTICE: &str = "[Sent encrypted]";
