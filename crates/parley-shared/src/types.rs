use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::CONVERSATION_SEPARATOR;
use crate::error::ProtocolError;

/// Opaque account identifier owned by the external identity system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Validate and wrap an identifier coming from outside the process.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::InvalidId("user id must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|e| ProtocolError::InvalidId(format!("group id: {e}")))
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identity. Direct conversations are `sort(a, b).join("_")`, group
/// conversations are the group id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Ids are ordered by UTF-16 code units, the order web clients sort
    /// strings in, so both sides derive the same id for any pair.
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let a_first = a.as_str().encode_utf16().le(b.as_str().encode_utf16());
        let (first, second) = if a_first { (a, b) } else { (b, a) };
        Self(format!(
            "{}{}{}",
            first.as_str(),
            CONVERSATION_SEPARATOR,
            second.as_str()
        ))
    }

    pub fn group(group_id: &GroupId) -> Self {
        Self(group_id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted chat message. `content` is either an encryption envelope or
/// plaintext; the server never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender_id: UserId,
    /// A user id for direct messages, a group id for group messages.
    pub recipient_id: String,
    pub content: String,
    pub conversation_id: ConversationId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub is_group: bool,
}

/// Wall-clock time at the microsecond precision messages are stored with.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl Message {
    pub fn direct(
        sender: &UserId,
        recipient: &UserId,
        content: String,
        attachments: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender.clone(),
            recipient_id: recipient.to_string(),
            content,
            conversation_id: ConversationId::direct(sender, recipient),
            timestamp: now(),
            read: false,
            attachments,
            is_group: false,
        }
    }

    pub fn group(
        sender: &UserId,
        group_id: &GroupId,
        content: String,
        attachments: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender.clone(),
            recipient_id: group_id.to_string(),
            content,
            conversation_id: ConversationId::group(group_id),
            timestamp: now(),
            read: false,
            attachments,
            is_group: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_id_is_symmetric() {
        let pairs = [
            ("alice", "bob"),
            ("64f1a0", "64f0ff"),
            ("Zed", "adam"),
            ("user_1", "user_10"),
        ];
        for (a, b) in pairs {
            let a = UserId::from(a);
            let b = UserId::from(b);
            assert_eq!(ConversationId::direct(&a, &b), ConversationId::direct(&b, &a));
        }
    }

    #[test]
    fn test_conversation_id_format_is_sorted_join() {
        let id = ConversationId::direct(&UserId::from("bob"), &UserId::from("alice"));
        assert_eq!(id.as_str(), "alice_bob");

        // Byte-wise ordering: uppercase sorts before lowercase.
        let id = ConversationId::direct(&UserId::from("adam"), &UserId::from("Zed"));
        assert_eq!(id.as_str(), "Zed_adam");
    }

    #[test]
    fn test_conversation_id_orders_by_utf16_units() {
        // U+FF5E sorts before U+1F600 in UTF-8 bytes but after its
        // surrogate pair in UTF-16.
        let wide = UserId::from("\u{FF5E}");
        let emoji = UserId::from("\u{1F600}");
        let id = ConversationId::direct(&wide, &emoji);
        assert_eq!(id.as_str(), "\u{1F600}_\u{FF5E}");
        assert_eq!(id, ConversationId::direct(&emoji, &wide));
    }

    #[test]
    fn test_user_id_parse_rejects_blank() {
        assert!(UserId::parse("   ").is_err());
        assert_eq!(UserId::parse(" carol ").unwrap().as_str(), "carol");
    }

    #[test]
    fn test_message_json_shape() {
        let msg = Message::direct(
            &UserId::from("alice"),
            &UserId::from("bob"),
            "hi".into(),
            vec![],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["recipientId"], "bob");
        assert_eq!(json["conversationId"], "alice_bob");
        assert_eq!(json["read"], false);
    }
}
