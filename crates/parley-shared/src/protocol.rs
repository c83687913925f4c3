use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ConversationId, GroupId, Message, PresenceStatus, UserId};

/// Events pushed from the server over a WebSocket connection.
///
/// Serialized as `{"type": "...", ...fields}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Presence snapshot, sent once on every (re)connect
    OnlineUsersList { users: Vec<UserId> },

    /// Presence delta
    #[serde(rename_all = "camelCase")]
    UserStatusUpdate {
        user_id: UserId,
        status: PresenceStatus,
    },

    #[serde(rename_all = "camelCase")]
    NewMessage {
        message: Message,
        recipient_id: String,
    },

    #[serde(rename = "group-added", rename_all = "camelCase")]
    GroupAdded {
        group_id: GroupId,
        group_name: String,
        added_by: UserId,
    },

    AuthResult { success: bool, message: String },

    #[serde(rename_all = "camelCase")]
    UserBanned { user_id: UserId, reason: String },

    #[serde(rename_all = "camelCase")]
    UserUnbanned { user_id: UserId, reason: String },

    #[serde(rename_all = "camelCase")]
    UserSuspended {
        user_id: UserId,
        reason: String,
        until: DateTime<Utc>,
    },

    /// Admin-only: failed authentication and other suspicious activity
    SecurityAlert {
        alert: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    /// A client event was rejected
    Error { message: String },
}

impl ServerEvent {
    pub fn presence(user_id: UserId, online: bool) -> Self {
        Self::UserStatusUpdate {
            user_id,
            status: PresenceStatus::from_online(online),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Events sent by clients. Moderation events are only honoured on an
/// authenticated admin connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        recipient_id: String,
        content: String,
        #[serde(default)]
        attachments: Vec<String>,
        #[serde(default)]
        is_group: bool,
    },

    #[serde(rename_all = "camelCase")]
    MarkRead { conversation_id: ConversationId },

    GetOnlineUsers,

    AdminAuth { token: String },

    #[serde(rename_all = "camelCase")]
    BanUser {
        user_id: UserId,
        #[serde(default)]
        reason: String,
    },

    #[serde(rename_all = "camelCase")]
    UnbanUser { user_id: UserId },

    #[serde(rename_all = "camelCase")]
    SuspendUser {
        user_id: UserId,
        #[serde(default)]
        reason: String,
        /// Seconds; absent means the server default
        #[serde(default)]
        duration: Option<u64>,
    },
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_update_wire_shape() {
        let ev = ServerEvent::presence(UserId::from("alice"), false);
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            value,
            json!({"type": "user_status_update", "userId": "alice", "status": "offline"})
        );
    }

    #[test]
    fn test_group_added_uses_hyphenated_tag() {
        let group_id = GroupId::new();
        let ev = ServerEvent::GroupAdded {
            group_id,
            group_name: "climbers".into(),
            added_by: UserId::from("carol"),
        };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "group-added");
        assert_eq!(value["groupId"], group_id.to_string());
        assert_eq!(value["addedBy"], "carol");
    }

    #[test]
    fn test_new_message_roundtrip() {
        let msg = Message::direct(
            &UserId::from("a"),
            &UserId::from("b"),
            "payload".into(),
            vec![],
        );
        let ev = ServerEvent::NewMessage {
            recipient_id: "b".into(),
            message: msg,
        };
        let raw = ev.to_json().unwrap();
        assert!(raw.contains(r#""type":"new_message""#));
        assert_eq!(ServerEvent::from_json(&raw).unwrap(), ev);
    }

    #[test]
    fn test_client_event_defaults() {
        let ev = ClientEvent::from_json(
            r#"{"type":"send_message","recipientId":"bob","content":"x"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            ClientEvent::SendMessage {
                recipient_id: "bob".into(),
                content: "x".into(),
                attachments: vec![],
                is_group: false,
            }
        );

        let ev = ClientEvent::from_json(r#"{"type":"get_online_users"}"#).unwrap();
        assert_eq!(ev, ClientEvent::GetOnlineUsers);

        let ev = ClientEvent::from_json(
            r#"{"type":"suspend_user","userId":"mallory","reason":"spam"}"#,
        )
        .unwrap();
        assert!(matches!(ev, ClientEvent::SuspendUser { duration: None, .. }));
    }

    #[test]
    fn test_unknown_event_is_protocol_error() {
        assert!(ClientEvent::from_json(r#"{"type":"drop_tables"}"#).is_err());
        assert!(ClientEvent::from_json("garbage").is_err());
    }
}
