//! Admin channel on `/admin/ws`.
//!
//! Admin connections are tracked apart from user connections so they never
//! show up in presence. A connection must authenticate with `admin_auth`
//! before any moderation event is honoured; every failed attempt raises a
//! `security_alert` on the authenticated admin connections.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::types::UserId;

use crate::config::ServerConfig;
use crate::registry::{ConnectionId, Outbound, Outbox};
use crate::state::AppState;
use crate::ws::{reply, spawn_writer};

#[derive(Debug)]
struct AdminSession {
    outbox: Outbox,
    authenticated: bool,
    peer: Option<IpAddr>,
}

#[derive(Clone, Default)]
pub struct AdminHub {
    sessions: Arc<RwLock<HashMap<ConnectionId, AdminSession>>>,
}

impl AdminHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, id: ConnectionId, outbox: Outbox, peer: Option<IpAddr>) {
        self.sessions.write().await.insert(
            id,
            AdminSession {
                outbox,
                authenticated: false,
                peer,
            },
        );
    }

    pub async fn detach(&self, id: ConnectionId) {
        self.sessions.write().await.remove(&id);
    }

    async fn authenticate(&self, id: ConnectionId) -> bool {
        match self.sessions.write().await.get_mut(&id) {
            Some(session) => {
                session.authenticated = true;
                true
            }
            None => false,
        }
    }

    pub async fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.sessions
            .read()
            .await
            .get(&id)
            .is_some_and(|s| s.authenticated)
    }

    async fn peer(&self, id: ConnectionId) -> Option<IpAddr> {
        self.sessions.read().await.get(&id).and_then(|s| s.peer)
    }

    /// Deliver to every authenticated admin connection.
    pub async fn notify_admins(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.authenticated)
            .filter(|s| s.outbox.send(Outbound::Event(event.clone())).is_ok())
            .count()
    }

    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        match self.sessions.read().await.get(&id) {
            Some(s) => s.outbox.send(Outbound::Event(event.into())).is_ok(),
            None => false,
        }
    }
}

/// Constant-time comparison against the configured admin token.
pub fn verify_admin_token(config: &ServerConfig, presented: &str) -> bool {
    let Some(ref expected) = config.admin_token else {
        return false;
    };
    let presented = presented.as_bytes();
    let expected = expected.as_bytes();
    presented.len() == expected.len() && presented.ct_eq(expected).unwrap_u8() == 1
}

pub async fn admin_ws_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    ws.on_upgrade(move |socket| handle_admin_socket(socket, state, peer))
}

async fn handle_admin_socket(socket: WebSocket, state: AppState, peer: Option<IpAddr>) {
    let id = ConnectionId::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let (sink, mut stream) = socket.split();

    state.admins.attach(id, tx.clone(), peer).await;
    info!(connection = %id, ?peer, "admin channel opened");

    let mut writer = spawn_writer(sink, rx, state.config.heartbeat_interval);
    let timeout = state.config.client_timeout;

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = tokio::time::timeout(timeout, stream.next()) => match frame {
                Err(_) | Ok(None) | Ok(Some(Ok(WsMessage::Close(_)))) => break,
                Ok(Some(Err(e))) => {
                    debug!(connection = %id, error = %e, "admin websocket error");
                    break;
                }
                Ok(Some(Ok(WsMessage::Text(text)))) => match ClientEvent::from_json(&text) {
                    Ok(event) => handle_admin_event(&state, id, event).await,
                    Err(e) => reply(&tx, ServerEvent::error(e.to_string())),
                },
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    state.admins.detach(id).await;
    writer.abort();
    info!(connection = %id, "admin channel closed");
}

/// Apply one event received on admin connection `id`.
pub async fn handle_admin_event(state: &AppState, id: ConnectionId, event: ClientEvent) {
    match event {
        ClientEvent::AdminAuth { token } => authenticate(state, id, &token).await,

        ClientEvent::GetOnlineUsers => {
            if require_admin(state, id).await {
                let users = state.presence.snapshot_online_users().await;
                state
                    .admins
                    .send_to(id, ServerEvent::OnlineUsersList { users })
                    .await;
            }
        }

        ClientEvent::BanUser { user_id, reason } => {
            if require_admin(state, id).await {
                let reason = reason_or(reason, "banned by an administrator");
                state.moderation.ban(&user_id, &reason).await;
                let notice = ServerEvent::UserBanned { user_id: user_id.clone(), reason };
                force_disconnect(state, &user_id, notice, "banned").await;
            }
        }

        ClientEvent::SuspendUser {
            user_id,
            reason,
            duration,
        } => {
            if require_admin(state, id).await {
                let reason = reason_or(reason, "suspended by an administrator");
                let until = state.moderation.suspend(&user_id, &reason, duration).await;
                let notice = ServerEvent::UserSuspended {
                    user_id: user_id.clone(),
                    reason,
                    until,
                };
                force_disconnect(state, &user_id, notice, "suspended").await;
            }
        }

        ClientEvent::UnbanUser { user_id } => {
            if require_admin(state, id).await {
                let lifted = state.moderation.unban(&user_id).await;
                let reason = if lifted {
                    "sanctions lifted"
                } else {
                    "no active sanction"
                };
                state
                    .admins
                    .notify_admins(ServerEvent::UserUnbanned {
                        user_id,
                        reason: reason.to_string(),
                    })
                    .await;
            }
        }

        ClientEvent::SendMessage { .. } | ClientEvent::MarkRead { .. } => {
            state
                .admins
                .send_to(id, ServerEvent::error("not available on the admin channel"))
                .await;
        }
    }
}

async fn authenticate(state: &AppState, id: ConnectionId, token: &str) {
    if state.config.admin_token.is_none() {
        state
            .admins
            .send_to(
                id,
                ServerEvent::AuthResult {
                    success: false,
                    message: "admin channel disabled".into(),
                },
            )
            .await;
        return;
    }

    if verify_admin_token(&state.config, token) {
        state.admins.authenticate(id).await;
        info!(connection = %id, "admin authenticated");
        state
            .admins
            .send_to(
                id,
                ServerEvent::AuthResult {
                    success: true,
                    message: "authenticated".into(),
                },
            )
            .await;
        return;
    }

    let peer = state.admins.peer(id).await;
    warn!(connection = %id, ?peer, "admin authentication failed");
    state
        .admins
        .send_to(
            id,
            ServerEvent::AuthResult {
                success: false,
                message: "invalid admin token".into(),
            },
        )
        .await;
    raise_alert(state, "admin_auth_failed", peer).await;
}

/// True when `id` is authenticated. Otherwise replies with a failed
/// `auth_result` and raises a security alert.
async fn require_admin(state: &AppState, id: ConnectionId) -> bool {
    if state.admins.is_authenticated(id).await {
        return true;
    }
    let peer = state.admins.peer(id).await;
    warn!(connection = %id, ?peer, "unauthenticated moderation attempt");
    state
        .admins
        .send_to(
            id,
            ServerEvent::AuthResult {
                success: false,
                message: "authentication required".into(),
            },
        )
        .await;
    raise_alert(state, "unauthenticated_admin_command", peer).await;
    false
}

async fn raise_alert(state: &AppState, alert: &str, peer: Option<IpAddr>) {
    let origin = peer.map_or_else(|| "unknown address".to_string(), |ip| ip.to_string());
    state
        .admins
        .notify_admins(ServerEvent::SecurityAlert {
            alert: alert.to_string(),
            detail: format!("admin channel request from {origin}"),
            timestamp: Utc::now(),
        })
        .await;
}

async fn force_disconnect(state: &AppState, user: &UserId, notice: ServerEvent, reason: &str) {
    let closed = state
        .registry
        .disconnect_user(user, notice.clone(), reason)
        .await;
    info!(user = %user.short(), closed, reason, "moderation applied");
    state.admins.notify_admins(notice).await;
}

fn reason_or(reason: String, default: &str) -> String {
    if reason.trim().is_empty() {
        default.to_string()
    } else {
        reason
    }
}
