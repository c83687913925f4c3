//! User WebSocket channel.
//!
//! Each connection runs a reader loop (this task) and a writer task draining
//! the connection's outbox. The writer also sends heartbeat pings; the reader
//! drops the connection when the client stays silent past the timeout.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::types::UserId;

use crate::auth::AuthenticatedUser;
use crate::error::ServerError;
use crate::moderation::Sanction;
use crate::registry::{ConnectionId, Outbound, Outbox, Registration};
use crate::router::OutgoingMessage;
use crate::state::AppState;

/// `GET /ws`: refuse sanctioned users and users at their connection cap
/// before upgrading.
pub async fn ws_handler(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    if let Some(sanction) = state.moderation.status(&user).await {
        warn!(user = %user.short(), "sanctioned user refused at handshake");
        return Err(ServerError::Forbidden(match sanction {
            Sanction::Banned { .. } => "account banned".to_string(),
            Sanction::Suspended { until, .. } => format!("account suspended until {until}"),
        }));
    }

    let cap = state.config.max_connections_per_user;
    if cap > 0 && state.registry.connections_for(&user).await.len() >= cap {
        warn!(user = %user.short(), cap, "connection cap reached");
        return Err(ServerError::TooManyRequests);
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

/// Register an upgraded connection. The handshake checks ran before the
/// upgrade, so both are repeated against the registry: a cap reached by
/// another device closes this connection, and a sanction recorded in the
/// meantime disconnects the user.
pub(crate) async fn admit(state: &AppState, user: &UserId, id: ConnectionId, tx: Outbox) {
    if state.registry.register(user, id, tx.clone()).await == Registration::LimitReached {
        let _ = tx.send(Outbound::Close {
            reason: "too many connections".into(),
        });
        return;
    }

    if let Some(sanction) = state.moderation.status(user).await {
        let closed = state
            .registry
            .disconnect_user(user, sanction.notice(user), "sanctioned during handshake")
            .await;
        warn!(user = %user.short(), closed, "sanction landed during handshake");
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId) {
    let id = ConnectionId::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let (sink, mut stream) = socket.split();

    admit(&state, &user, id, tx.clone()).await;

    let mut writer = spawn_writer(sink, rx, state.config.heartbeat_interval);
    let timeout = state.config.client_timeout;

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = tokio::time::timeout(timeout, stream.next()) => match frame {
                Err(_) => {
                    info!(user = %user.short(), connection = %id, "client timed out");
                    break;
                }
                Ok(None) | Ok(Some(Ok(WsMessage::Close(_)))) => break,
                Ok(Some(Err(e))) => {
                    debug!(connection = %id, error = %e, "websocket error");
                    break;
                }
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    handle_client_event(&state, &user, id, &tx, &text).await;
                }
                // Pings are answered by axum; pongs and binary frames only
                // refresh the timeout.
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    state.registry.deregister(id).await;
    writer.abort();
}

pub(crate) fn reply(tx: &Outbox, event: ServerEvent) {
    let _ = tx.send(Outbound::Event(event.into()));
}

async fn handle_client_event(
    state: &AppState,
    user: &UserId,
    id: ConnectionId,
    tx: &Outbox,
    raw: &str,
) {
    let event = match ClientEvent::from_json(raw) {
        Ok(event) => event,
        Err(e) => {
            debug!(connection = %id, error = %e, "malformed client event");
            reply(tx, ServerEvent::error(e.to_string()));
            return;
        }
    };

    match event {
        ClientEvent::SendMessage {
            recipient_id,
            content,
            attachments,
            is_group,
        } => {
            if !state.send_limiter.check(user.clone()).await {
                warn!(user = %user.short(), "send rate limit exceeded");
                reply(tx, ServerEvent::error(ServerError::TooManyRequests.public_message()));
                return;
            }
            let outgoing = OutgoingMessage {
                target: recipient_id,
                content,
                attachments,
                is_group,
            };
            if let Err(e) = state.router.send(user, outgoing, Some(id)).await {
                reply(tx, ServerEvent::error(e.public_message()));
            }
        }
        ClientEvent::MarkRead { conversation_id } => {
            if let Err(e) = state.router.mark_read(&conversation_id, user) {
                reply(tx, ServerEvent::error(e.public_message()));
            }
        }
        ClientEvent::GetOnlineUsers => {
            let users = state.presence.snapshot_online_users().await;
            reply(tx, ServerEvent::OnlineUsersList { users });
        }
        ClientEvent::AdminAuth { .. }
        | ClientEvent::BanUser { .. }
        | ClientEvent::UnbanUser { .. }
        | ClientEvent::SuspendUser { .. } => {
            warn!(user = %user.short(), "moderation event on user channel");
            reply(
                tx,
                ServerEvent::error("moderation events are only accepted on /admin/ws"),
            );
        }
    }
}

/// Drain an outbox into the socket, pinging every `heartbeat`.
pub(crate) fn spawn_writer(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    heartbeat: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat);
        ping.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(Outbound::Event(event)) => {
                        let text = match event.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to encode server event");
                                continue;
                            }
                        };
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { reason }) => {
                        let frame = CloseFrame {
                            code: close_code::POLICY,
                            reason: reason.into(),
                        };
                        let _ = sink.send(WsMessage::Close(Some(frame))).await;
                        break;
                    }
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use parley_store::Database;

    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::tests::{drain, outbox};

    fn state() -> AppState {
        AppState::new(ServerConfig::default(), Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_admit_registers_clean_user() {
        let state = state();
        let user = UserId::from("alice");
        let (tx, mut rx) = outbox();

        admit(&state, &user, ConnectionId::new(), tx).await;
        assert!(state.registry.is_online(&user).await);
        assert!(!drain(&mut rx)
            .iter()
            .any(|o| matches!(o, Outbound::Close { .. })));
    }

    #[tokio::test]
    async fn test_ban_between_handshake_and_register_disconnects() {
        let state = state();
        let user = UserId::from("mallory");
        // The ban lands after the handshake check passed; nothing is
        // registered yet for the moderation path to close.
        state.moderation.ban(&user, "spam").await;

        let (tx, mut rx) = outbox();
        admit(&state, &user, ConnectionId::new(), tx).await;

        assert!(!state.registry.is_online(&user).await);
        let sent = drain(&mut rx);
        let banned = sent.iter().position(|o| {
            matches!(o, Outbound::Event(e) if matches!(**e, ServerEvent::UserBanned { .. }))
        });
        let closed = sent
            .iter()
            .position(|o| matches!(o, Outbound::Close { .. }));
        assert!(banned.is_some());
        assert!(banned < closed);
    }
}
