//! REST client for the key directory and the pull tier.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use parley_shared::keys::PublicKeyBytes;
use parley_shared::rest::{
    AddMembersRequest, CreateGroupRequest, ErrorBody, GroupInfo, MarkReadResponse,
    OnlineUsersResponse, PageQuery, PublicKeyResponse, RegisterKeyRequest, SendMessageRequest,
    UnreadCountResponse, WrappedGroupKey,
};
use parley_shared::types::{GroupId, Message, UserId};

use crate::config::ClientConfig;
use crate::directory::KeyDirectoryClient;
use crate::error::{ClientError, Result};

/// Header carrying the caller identity, set by the authentication layer in
/// production deployments.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    user: UserId,
}

impl RestClient {
    pub fn new(config: &ClientConfig, user: UserId) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let id = HeaderValue::from_str(user.as_str()).map_err(|_| ClientError::Status {
            status: 0,
            message: format!("user id {user} is not a valid header value"),
        })?;
        headers.insert(USER_ID_HEADER, id);

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base: config.base_url().to_string(),
            user,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn register_key(&self, req: &RegisterKeyRequest) -> Result<PublicKeyResponse> {
        let resp = self
            .http
            .post(self.url("/messages/register-key"))
            .json(req)
            .send()
            .await?;
        json(resp).await
    }

    pub async fn public_key(&self, user: &UserId) -> Result<Option<PublicKeyResponse>> {
        let resp = self
            .http
            .get(self.url(&format!("/messages/public-key/{user}")))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        json(resp).await.map(Some)
    }

    pub async fn send_message(&self, req: &SendMessageRequest) -> Result<Message> {
        let resp = self
            .http
            .post(self.url("/messages/send"))
            .json(req)
            .send()
            .await?;
        json(resp).await
    }

    /// Mark everything `sender` sent to this user as read.
    pub async fn mark_read(&self, sender: &UserId) -> Result<usize> {
        let resp = self
            .http
            .put(self.url(&format!("/messages/mark-read/{sender}")))
            .send()
            .await?;
        let body: MarkReadResponse = json(resp).await?;
        Ok(body.updated)
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>> {
        let resp = self
            .http
            .get(self.url("/messages/online-users"))
            .send()
            .await?;
        let body: OnlineUsersResponse = json(resp).await?;
        Ok(body.users)
    }

    pub async fn conversation(&self, peer: &UserId, page: PageQuery) -> Result<Vec<Message>> {
        let resp = self
            .http
            .get(self.url(&format!("/messages/conversation/{peer}")))
            .query(&page)
            .send()
            .await?;
        json(resp).await
    }

    pub async fn unread_count(&self) -> Result<u64> {
        let resp = self
            .http
            .get(self.url("/messages/unread-count"))
            .send()
            .await?;
        let body: UnreadCountResponse = json(resp).await?;
        Ok(body.count)
    }

    pub async fn create_group(&self, req: &CreateGroupRequest) -> Result<GroupInfo> {
        let resp = self.http.post(self.url("/groups")).json(req).send().await?;
        json(resp).await
    }

    pub async fn groups(&self) -> Result<Vec<GroupInfo>> {
        let resp = self.http.get(self.url("/groups")).send().await?;
        json(resp).await
    }

    pub async fn group(&self, id: &GroupId) -> Result<GroupInfo> {
        let resp = self
            .http
            .get(self.url(&format!("/groups/{id}")))
            .send()
            .await?;
        json(resp).await
    }

    pub async fn add_members(&self, id: &GroupId, req: &AddMembersRequest) -> Result<GroupInfo> {
        let resp = self
            .http
            .post(self.url(&format!("/groups/{id}/members")))
            .json(req)
            .send()
            .await?;
        json(resp).await
    }

    /// This user's wrapped copy of the group key, `None` if none was shared.
    pub async fn group_key(&self, id: &GroupId) -> Result<Option<WrappedGroupKey>> {
        let resp = self
            .http
            .get(self.url(&format!("/groups/{id}/key")))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        json(resp).await.map(Some)
    }

    pub async fn group_messages(&self, id: &GroupId, page: PageQuery) -> Result<Vec<Message>> {
        let resp = self
            .http
            .get(self.url(&format!("/groups/{id}/messages")))
            .query(&page)
            .send()
            .await?;
        json(resp).await
    }
}

#[async_trait]
impl KeyDirectoryClient for RestClient {
    async fn publish_key(&self, key: &PublicKeyBytes, version: u32) -> Result<PublicKeyResponse> {
        let published = self
            .register_key(&RegisterKeyRequest {
                public_key: key.to_base64(),
                key_version: Some(version),
            })
            .await?;
        debug!(version = published.key_version, "public key registered");
        Ok(published)
    }

    async fn fetch_key(&self, user: &UserId) -> Result<Option<PublicKeyResponse>> {
        self.public_key(user).await
    }
}

async fn json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}
