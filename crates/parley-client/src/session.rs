//! Live WebSocket session with fixed-delay reconnect.
//!
//! The session task owns the socket. Outgoing client events are queued on a
//! channel; server events are mirrored into a [`PresenceView`] and handed to
//! the caller in arrival order. Transport failures trigger a reconnect after
//! a constant delay, up to the configured attempt limit. Administrative
//! outcomes (ban, suspension, handshake refusal) stop the session for good.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::types::{ConversationId, UserId};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::presence::PresenceView;
use crate::rest::USER_ID_HEADER;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Server(ServerEvent),
    /// The connection dropped; a reconnect is scheduled.
    Disconnected { attempt: u32 },
    /// The session ended and will not reconnect.
    Stopped(StopReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Banned { reason: String },
    Suspended { reason: String, until: DateTime<Utc> },
    /// Handshake refused with a 4xx status (sanctioned or unauthenticated).
    /// A refusal at the connection cap is retried instead.
    Rejected { status: u16 },
    RetriesExhausted,
    Shutdown,
}

impl StopReason {
    /// True when the user must sign in again before reconnecting.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            StopReason::Banned { .. } | StopReason::Suspended { .. } | StopReason::Rejected { .. }
        )
    }
}

pub struct ChatSession {
    commands: mpsc::UnboundedSender<ClientEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    presence: Arc<RwLock<PresenceView>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ChatSession {
    /// Spawn the session task. Connection happens in the background; watch
    /// for [`SessionEvent::Connected`].
    pub fn connect(config: ClientConfig, user: UserId) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let presence = Arc::new(RwLock::new(PresenceView::new()));

        let task = tokio::spawn(run(
            config,
            user,
            cmd_rx,
            event_tx,
            presence.clone(),
            shutdown_rx,
        ));

        Self {
            commands: cmd_tx,
            events: event_rx,
            presence,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Queue a client event. Events queued while disconnected go out after
    /// the next successful reconnect.
    pub fn send(&self, event: ClientEvent) -> Result<()> {
        self.commands
            .send(event)
            .map_err(|_| ClientError::SessionClosed)
    }

    pub fn send_message(&self, recipient: &str, content: String, is_group: bool) -> Result<()> {
        self.send(ClientEvent::SendMessage {
            recipient_id: recipient.to_string(),
            content,
            attachments: Vec::new(),
            is_group,
        })
    }

    pub fn mark_read(&self, conversation: ConversationId) -> Result<()> {
        self.send(ClientEvent::MarkRead {
            conversation_id: conversation,
        })
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Current presence view.
    pub async fn presence(&self) -> PresenceView {
        self.presence.read().await.clone()
    }

    /// Close the socket and wait for the task to finish.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

enum Exit {
    Lost,
    Stopped(StopReason),
}

async fn run(
    config: ClientConfig,
    user: UserId,
    mut commands: mpsc::UnboundedReceiver<ClientEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    presence: Arc<RwLock<PresenceView>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut failures: u32 = 0;

    let reason = loop {
        let connected = tokio::select! {
            _ = &mut shutdown => break StopReason::Shutdown,
            result = open_socket(&config, &user) => result,
        };

        match connected {
            Ok(socket) => {
                failures = 0;
                info!(user = %user.short(), "session connected");
                let _ = events.send(SessionEvent::Connected);
                match drive(socket, &user, &mut commands, &events, &presence, &mut shutdown).await {
                    Exit::Stopped(reason) => break reason,
                    Exit::Lost => warn!(user = %user.short(), "connection lost"),
                }
            }
            Err(ClientError::WebSocket(WsError::Http(resp)))
                if is_fatal_refusal(resp.status()) =>
            {
                let status = resp.status().as_u16();
                warn!(user = %user.short(), status, "handshake refused");
                break StopReason::Rejected { status };
            }
            Err(e) => warn!(user = %user.short(), error = %e, "connect failed"),
        }

        presence.write().await.clear();
        failures += 1;
        if failures > config.max_reconnect_attempts {
            break StopReason::RetriesExhausted;
        }
        let _ = events.send(SessionEvent::Disconnected { attempt: failures });
        debug!(attempt = failures, delay_ms = config.reconnect_delay.as_millis() as u64, "reconnecting");

        tokio::select! {
            _ = &mut shutdown => break StopReason::Shutdown,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    };

    info!(user = %user.short(), ?reason, "session stopped");
    presence.write().await.clear();
    let _ = events.send(SessionEvent::Stopped(reason));
}

async fn open_socket(config: &ClientConfig, user: &UserId) -> Result<Socket> {
    let mut request = config.ws_url().into_client_request()?;
    let id = HeaderValue::from_str(user.as_str()).map_err(|_| ClientError::Status {
        status: 0,
        message: format!("user id {user} is not a valid header value"),
    })?;
    request.headers_mut().insert(USER_ID_HEADER, id);

    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

async fn drive(
    socket: Socket,
    user: &UserId,
    commands: &mut mpsc::UnboundedReceiver<ClientEvent>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    presence: &RwLock<PresenceView>,
    shutdown: &mut oneshot::Receiver<()>,
) -> Exit {
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Exit::Stopped(StopReason::Shutdown);
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Exit::Stopped(StopReason::Shutdown);
                };
                match command.to_json() {
                    Ok(text) => {
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            return Exit::Lost;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode client event"),
                }
            }
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_json(&text) {
                    Ok(event) => {
                        let stop = stop_reason(&event, user);
                        presence.write().await.apply(&event);
                        let _ = events.send(SessionEvent::Server(event));
                        if let Some(reason) = stop {
                            return Exit::Stopped(reason);
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring unknown server event"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "server closed the connection");
                    return Exit::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    return Exit::Lost;
                }
                None => return Exit::Lost,
            }
        }
    }
}

/// 4xx refusals end the session, except 429: the per-user connection cap
/// frees up when another device disconnects.
fn is_fatal_refusal(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
}

/// A ban or suspension addressed to this user ends the session.
fn stop_reason(event: &ServerEvent, me: &UserId) -> Option<StopReason> {
    match event {
        ServerEvent::UserBanned { user_id, reason } if user_id == me => Some(StopReason::Banned {
            reason: reason.clone(),
        }),
        ServerEvent::UserSuspended {
            user_id,
            reason,
            until,
        } if user_id == me => Some(StopReason::Suspended {
            reason: reason.clone(),
            until: *until,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_own_sanctions_stop() {
        let me = UserId::from("me");
        let banned_me = ServerEvent::UserBanned {
            user_id: me.clone(),
            reason: "spam".into(),
        };
        let banned_other = ServerEvent::UserBanned {
            user_id: UserId::from("other"),
            reason: "spam".into(),
        };

        let reason = stop_reason(&banned_me, &me).unwrap();
        assert!(reason.requires_reauthentication());
        assert!(stop_reason(&banned_other, &me).is_none());
        assert!(stop_reason(&ServerEvent::error("x"), &me).is_none());
        assert!(!StopReason::RetriesExhausted.requires_reauthentication());
    }

    #[test]
    fn test_connection_cap_is_not_fatal() {
        assert!(!is_fatal_refusal(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_fatal_refusal(StatusCode::FORBIDDEN));
        assert!(is_fatal_refusal(StatusCode::UNAUTHORIZED));
        assert!(!is_fatal_refusal(StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Nothing listens on port 9 of localhost.
        let config = ClientConfig {
            reconnect_delay: std::time::Duration::from_millis(10),
            max_reconnect_attempts: 2,
            ..ClientConfig::new("http://127.0.0.1:9")
        };
        let mut session = ChatSession::connect(config, UserId::from("me"));

        let mut attempts = Vec::new();
        let stopped = loop {
            match session.next_event().await {
                Some(SessionEvent::Disconnected { attempt }) => attempts.push(attempt),
                Some(SessionEvent::Stopped(reason)) => break reason,
                other => panic!("unexpected event: {other:?}"),
            }
        };
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(stopped, StopReason::RetriesExhausted);
    }
}
