//! JSON bodies of the REST API, shared by the server handlers and the client.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GroupId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterKeyRequest {
    pub public_key: String,
    #[serde(default)]
    pub key_version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    pub public_key: String,
    pub key_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub recipient_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    pub users: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub count: u64,
}

/// Paging for the pull tier. Defaults to the 50 most recent messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_page_limit() -> u32 {
    50
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            limit: default_page_limit(),
            offset: 0,
        }
    }
}

/// A group key wrapped for one member, tagged with the member key version it
/// was wrapped under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WrappedGroupKey {
    pub wrapped_key: String,
    pub key_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    /// Other members; the caller is added as creator.
    pub members: Vec<UserId>,
    #[serde(default)]
    pub wrapped_keys: HashMap<UserId, WrappedGroupKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembersRequest {
    pub members: Vec<UserId>,
    #[serde(default)]
    pub wrapped_keys: HashMap<UserId, WrappedGroupKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub id: GroupId,
    pub name: String,
    pub creator: UserId,
    pub members: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    /// Aggregated presence: at least one member online
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
