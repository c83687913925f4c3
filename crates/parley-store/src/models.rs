//! Records persisted by the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::rest::WrappedGroupKey;
use parley_shared::types::{GroupId, UserId};

pub use parley_shared::types::Message;

/// A group conversation. Members live in `group_members`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Immutable after creation.
    pub creator: UserId,
    pub created_at: DateTime<Utc>,
}

/// A member to insert, with their copy of the group key if one was supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroupMember {
    pub user_id: UserId,
    pub wrapped_key: Option<WrappedGroupKey>,
}

/// Current entry of the key directory for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKeyRecord {
    pub user_id: UserId,
    /// Base64 X25519 public key
    pub public_key: String,
    pub key_version: u32,
    pub updated_at: DateTime<Utc>,
}
