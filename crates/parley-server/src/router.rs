//! Message routing: persist first, then push to live connections.
//!
//! Persistence happens outside the registry lock. Delivery is best effort:
//! recipients without a live connection pick messages up through the REST
//! pull endpoints.

use tracing::{debug, info};

use parley_shared::constants::MAX_MESSAGE_SIZE;
use parley_shared::protocol::ServerEvent;
use parley_shared::rest::PageQuery;
use parley_shared::types::{ConversationId, GroupId, Message, UserId};

use crate::error::ServerError;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::state::SharedDatabase;

/// A message as submitted by a client, before validation.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub target: String,
    pub content: String,
    pub attachments: Vec<String>,
    pub is_group: bool,
}

#[derive(Clone)]
pub struct MessageRouter {
    db: SharedDatabase,
    registry: ConnectionRegistry,
}

impl MessageRouter {
    pub fn new(db: SharedDatabase, registry: ConnectionRegistry) -> Self {
        Self { db, registry }
    }

    /// Persist and deliver. `origin` is the sending connection, which is
    /// excluded from delivery; REST sends pass `None`.
    pub async fn send(
        &self,
        sender: &UserId,
        outgoing: OutgoingMessage,
        origin: Option<ConnectionId>,
    ) -> Result<Message, ServerError> {
        validate_content(&outgoing.content)?;

        if outgoing.is_group {
            self.send_group(sender, outgoing, origin).await
        } else {
            self.send_direct(sender, outgoing, origin).await
        }
    }

    async fn send_direct(
        &self,
        sender: &UserId,
        outgoing: OutgoingMessage,
        origin: Option<ConnectionId>,
    ) -> Result<Message, ServerError> {
        let recipient = UserId::parse(&outgoing.target)
            .map_err(|e| ServerError::BadRequest(e.to_string()))?;

        let message = Message::direct(sender, &recipient, outgoing.content, outgoing.attachments);
        self.db.lock()?.insert_message(&message)?;

        let event = ServerEvent::NewMessage {
            message: message.clone(),
            recipient_id: recipient.to_string(),
        };
        // For a self-conversation the recipient and sender sets coincide.
        let delivered = if &recipient == sender {
            self.registry.send_to_user(sender, event, origin).await
        } else {
            self.registry
                .send_to_users([&recipient, sender], event, origin)
                .await
        };

        info!(
            from = %sender.short(),
            to = %recipient.short(),
            message = %message.id,
            delivered,
            "direct message routed"
        );
        Ok(message)
    }

    async fn send_group(
        &self,
        sender: &UserId,
        outgoing: OutgoingMessage,
        origin: Option<ConnectionId>,
    ) -> Result<Message, ServerError> {
        let group_id = GroupId::parse(&outgoing.target)
            .map_err(|e| ServerError::BadRequest(e.to_string()))?;

        let (message, members) = {
            let db = self.db.lock()?;
            if db.get_group(&group_id)?.is_none() {
                return Err(ServerError::NotFound(format!("group {group_id}")));
            }
            if !db.is_group_member(&group_id, sender)? {
                return Err(ServerError::Forbidden("not a member of this group".into()));
            }
            let message =
                Message::group(sender, &group_id, outgoing.content, outgoing.attachments);
            db.insert_message(&message)?;
            (message, db.group_members(&group_id)?)
        };

        let event = ServerEvent::NewMessage {
            message: message.clone(),
            recipient_id: group_id.to_string(),
        };
        let delivered = self.registry.send_to_users(&members, event, origin).await;

        info!(
            from = %sender.short(),
            group = %group_id,
            message = %message.id,
            members = members.len(),
            delivered,
            "group message routed"
        );
        Ok(message)
    }

    /// Mark the reader's unread messages in a conversation as read.
    pub fn mark_read(
        &self,
        conversation: &ConversationId,
        reader: &UserId,
    ) -> Result<usize, ServerError> {
        let updated = self.db.lock()?.mark_conversation_read(conversation, reader)?;
        debug!(conversation = %conversation, reader = %reader.short(), updated, "marked read");
        Ok(updated)
    }

    pub fn conversation(
        &self,
        reader: &UserId,
        peer: &UserId,
        page: PageQuery,
    ) -> Result<Vec<Message>, ServerError> {
        let conversation = ConversationId::direct(reader, peer);
        Ok(self
            .db
            .lock()?
            .get_conversation(&conversation, page.limit, page.offset)?)
    }

    pub fn group_messages(
        &self,
        group_id: &GroupId,
        reader: &UserId,
        page: PageQuery,
    ) -> Result<Vec<Message>, ServerError> {
        let db = self.db.lock()?;
        if db.get_group(group_id)?.is_none() {
            return Err(ServerError::NotFound(format!("group {group_id}")));
        }
        if !db.is_group_member(group_id, reader)? {
            return Err(ServerError::Forbidden("not a member of this group".into()));
        }
        Ok(db.get_conversation(&ConversationId::group(group_id), page.limit, page.offset)?)
    }

    pub fn unread_count(&self, reader: &UserId) -> Result<u64, ServerError> {
        Ok(self.db.lock()?.unread_count(reader)?)
    }
}

fn validate_content(content: &str) -> Result<(), ServerError> {
    if content.trim().is_empty() {
        return Err(ServerError::BadRequest("message content is empty".into()));
    }
    if content.len() > MAX_MESSAGE_SIZE {
        return Err(ServerError::BadRequest(format!(
            "message content exceeds {MAX_MESSAGE_SIZE} bytes"
        )));
    }
    Ok(())
}
