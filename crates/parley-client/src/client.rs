//! High-level client: the engine wired to the REST API.
//!
//! Every outgoing body is encrypted before it leaves this module and every
//! fetched body is decrypted before it is returned.

use std::sync::Arc;

use tracing::{info, warn};

use parley_shared::constants::SENT_ENCRYPTED_NOTICE;
use parley_shared::rest::{
    AddMembersRequest, CreateGroupRequest, GroupInfo, PageQuery, SendMessageRequest,
};
use parley_shared::types::{GroupId, Message, UserId};

use crate::config::ClientConfig;
use crate::engine::{Decryption, EncryptionEngine};
use crate::error::{ClientError, Result};
use crate::rest::RestClient;
use crate::session::ChatSession;
use crate::vault::{KeyVault, SecretStore};

/// A message sent through [`ParleyClient::send_direct`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: Message,
    /// The recipient had no usable key and the body went out in plaintext.
    pub encryption_unavailable: bool,
}

/// A stored message with its body ready for display.
#[derive(Debug, Clone)]
pub struct ReadableMessage {
    pub message: Message,
    pub text: String,
}

pub struct ParleyClient {
    config: ClientConfig,
    user: UserId,
    rest: Arc<RestClient>,
    engine: EncryptionEngine,
}

impl ParleyClient {
    pub fn new(config: ClientConfig, user: UserId, store: Box<dyn SecretStore>) -> Result<Self> {
        let rest = Arc::new(RestClient::new(&config, user.clone())?);
        let engine = EncryptionEngine::open(rest.clone(), KeyVault::new(store))?;
        Ok(Self {
            config,
            user,
            rest,
            engine,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn engine(&self) -> &EncryptionEngine {
        &self.engine
    }

    /// Publish this device's public key.
    pub async fn register(&self) -> Result<()> {
        self.engine.publish_key().await
    }

    /// Open a live session for push delivery and presence.
    pub fn connect(&self) -> ChatSession {
        ChatSession::connect(self.config.clone(), self.user.clone())
    }

    pub async fn send_direct(&self, recipient: &UserId, plaintext: &str) -> Result<SentMessage> {
        let outgoing = self.engine.encrypt_message(plaintext, recipient).await;
        let encryption_unavailable = outgoing.encryption_unavailable();
        if encryption_unavailable {
            warn!(peer = %recipient.short(), "sending without end-to-end encryption");
        }

        let message = self
            .rest
            .send_message(&SendMessageRequest {
                recipient_id: recipient.to_string(),
                content: outgoing.into_content(),
                attachments: Vec::new(),
                is_group: false,
            })
            .await?;
        Ok(SentMessage {
            message,
            encryption_unavailable,
        })
    }

    pub async fn send_group(&self, group_id: &GroupId, plaintext: &str) -> Result<Message> {
        if !self.sync_group_key(group_id).await? {
            return Err(ClientError::MissingGroupKey(*group_id));
        }
        let content = self.engine.encrypt_group_message(group_id, plaintext).await?;
        self.rest
            .send_message(&SendMessageRequest {
                recipient_id: group_id.to_string(),
                content,
                attachments: Vec::new(),
                is_group: true,
            })
            .await
    }

    /// Create a group keyed with a fresh group key wrapped for every member,
    /// the creator included.
    pub async fn create_group(&self, name: &str, members: &[UserId]) -> Result<GroupInfo> {
        let group_key = self.engine.generate_group_key();
        let mut recipients = members.to_vec();
        recipients.push(self.user.clone());
        let shared = self.engine.wrap_for_members(&group_key, &recipients).await?;

        let group = self
            .rest
            .create_group(&CreateGroupRequest {
                name: name.to_string(),
                members: members.to_vec(),
                wrapped_keys: shared.wrapped,
            })
            .await?;
        self.engine.install_group_key(group.id, group_key).await?;
        info!(group = %group.id, members = group.members.len(), "group created");
        Ok(group)
    }

    pub async fn add_members(&self, group_id: &GroupId, members: &[UserId]) -> Result<GroupInfo> {
        if !self.sync_group_key(group_id).await? {
            return Err(ClientError::MissingGroupKey(*group_id));
        }
        let shared = self.engine.share_group_key(group_id, members).await?;
        self.rest
            .add_members(
                group_id,
                &AddMembersRequest {
                    members: members.to_vec(),
                    wrapped_keys: shared.wrapped,
                },
            )
            .await
    }

    /// Make sure the engine holds the key of `group_id`, fetching this
    /// user's wrapped copy when needed. False when none was shared.
    pub async fn sync_group_key(&self, group_id: &GroupId) -> Result<bool> {
        if self.engine.has_group_key(group_id).await {
            return Ok(true);
        }
        match self.rest.group_key(group_id).await? {
            Some(wrapped) => {
                self.engine.accept_group_key(*group_id, &wrapped).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Decrypted body of a received or fetched message.
    pub async fn open_message(&self, message: &Message) -> String {
        let decryption = if message.is_group {
            self.engine.decrypt_group_message(&message.content).await
        } else if message.sender_id == self.user {
            // Direct bodies are sealed for the recipient only.
            match self.engine.decrypt_message(&message.content).await {
                Decryption::Failed => Decryption::Plaintext(SENT_ENCRYPTED_NOTICE.to_string()),
                other => other,
            }
        } else {
            self.engine.decrypt_message(&message.content).await
        };
        decryption.into_text()
    }

    pub async fn conversation(&self, peer: &UserId, page: PageQuery) -> Result<Vec<ReadableMessage>> {
        let messages = self.rest.conversation(peer, page).await?;
        Ok(self.readable(messages).await)
    }

    pub async fn group_messages(
        &self,
        group_id: &GroupId,
        page: PageQuery,
    ) -> Result<Vec<ReadableMessage>> {
        self.sync_group_key(group_id).await?;
        let messages = self.rest.group_messages(group_id, page).await?;
        Ok(self.readable(messages).await)
    }

    pub async fn mark_read(&self, sender: &UserId) -> Result<usize> {
        self.rest.mark_read(sender).await
    }

    pub async fn unread_count(&self) -> Result<u64> {
        self.rest.unread_count().await
    }

    pub async fn rotate_keys(&self) -> Result<u32> {
        self.engine.rotate_keys().await
    }

    async fn readable(&self, messages: Vec<Message>) -> Vec<ReadableMessage> {
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            let text = self.open_message(&message).await;
            out.push(ReadableMessage { message, text });
        }
        out
    }
}
