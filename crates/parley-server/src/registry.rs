//! Live WebSocket connections per user.
//!
//! The registry is the single piece of shared mutable state on the delivery
//! path. Every connection owns an unbounded outbox, so enqueueing never
//! blocks while the lock is held and each connection sees events in the
//! order they were enqueued. Presence transitions are fanned out while the
//! write lock is held, which gives every connection the same total order of
//! online/offline events.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::protocol::ServerEvent;
use parley_shared::types::UserId;

use crate::presence;

/// Handle of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instruction consumed by a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<ServerEvent>),
    /// Send a close frame and stop writing.
    Close { reason: String },
}

pub type Outbox = mpsc::UnboundedSender<Outbound>;

#[derive(Debug)]
pub(crate) struct ConnectionEntry {
    pub(crate) user: UserId,
    pub(crate) outbox: Outbox,
    pub(crate) connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) connections: HashMap<ConnectionId, ConnectionEntry>,
    pub(crate) by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl RegistryState {
    /// Enqueue on every live connection. Returns how many accepted it.
    pub(crate) fn fan_out(&self, event: &Arc<ServerEvent>) -> usize {
        self.connections
            .values()
            .filter(|c| c.outbox.send(Outbound::Event(event.clone())).is_ok())
            .count()
    }

    pub(crate) fn send_to_user(
        &self,
        user: &UserId,
        event: &Arc<ServerEvent>,
        except: Option<ConnectionId>,
    ) -> usize {
        let Some(ids) = self.by_user.get(user) else {
            return 0;
        };
        ids.iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| self.connections.get(id))
            .filter(|c| c.outbox.send(Outbound::Event(event.clone())).is_ok())
            .count()
    }

    pub(crate) fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.by_user.keys().cloned().collect();
        users.sort();
        users
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Connection recorded; `first` is true when the user just came online.
    Registered { first: bool },
    /// The handle was already registered. Nothing changed.
    AlreadyRegistered,
    /// The per-user connection cap is reached.
    LimitReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deregistration {
    /// The handle was not registered (already removed or never added).
    Unknown,
    Removed { user: UserId, last: bool },
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
    max_per_user: usize,
}

impl ConnectionRegistry {
    /// `max_per_user == 0` means unlimited.
    pub fn new(max_per_user: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            max_per_user,
        }
    }

    pub(crate) async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().await
    }

    /// Record a new connection. The presence snapshot is enqueued on the new
    /// outbox before any delta can reach it; if this is the user's first
    /// connection an online delta goes to every connection.
    pub async fn register(&self, user: &UserId, id: ConnectionId, outbox: Outbox) -> Registration {
        let mut state = self.state.write().await;

        if state.connections.contains_key(&id) {
            return Registration::AlreadyRegistered;
        }

        let current = state.by_user.get(user).map_or(0, HashSet::len);
        if self.max_per_user > 0 && current >= self.max_per_user {
            debug!(user = %user.short(), limit = self.max_per_user, "connection cap reached");
            return Registration::LimitReached;
        }

        state.connections.insert(
            id,
            ConnectionEntry {
                user: user.clone(),
                outbox: outbox.clone(),
                connected_at: Utc::now(),
            },
        );
        state.by_user.entry(user.clone()).or_default().insert(id);
        let first = current == 0;

        let snapshot = ServerEvent::OnlineUsersList {
            users: state.online_users(),
        };
        let _ = outbox.send(Outbound::Event(Arc::new(snapshot)));

        if first {
            presence::announce(&state, user, true);
        }

        info!(
            user = %user.short(),
            connection = %id,
            devices = current + 1,
            "connection registered"
        );
        Registration::Registered { first }
    }

    /// Remove a connection. Removing an unknown handle is a no-op.
    pub async fn deregister(&self, id: ConnectionId) -> Deregistration {
        let mut state = self.state.write().await;

        let Some(entry) = state.connections.remove(&id) else {
            return Deregistration::Unknown;
        };
        let user = entry.user;
        let connected_secs = (Utc::now() - entry.connected_at).num_seconds();

        let last = match state.by_user.get_mut(&user) {
            Some(ids) => {
                ids.remove(&id);
                ids.is_empty()
            }
            None => true,
        };
        if last {
            state.by_user.remove(&user);
            presence::announce(&state, &user, false);
        }

        info!(
            user = %user.short(),
            connection = %id,
            connected_secs,
            "connection deregistered"
        );
        Deregistration::Removed { user, last }
    }

    /// Force-close every connection of `user`. Each connection receives the
    /// notice, then a close instruction. Returns the number of connections
    /// closed.
    pub async fn disconnect_user(&self, user: &UserId, notice: ServerEvent, reason: &str) -> usize {
        let mut state = self.state.write().await;

        let Some(ids) = state.by_user.remove(user) else {
            return 0;
        };
        let notice = Arc::new(notice);
        for id in &ids {
            if let Some(entry) = state.connections.remove(id) {
                let _ = entry.outbox.send(Outbound::Event(notice.clone()));
                let _ = entry.outbox.send(Outbound::Close {
                    reason: reason.to_string(),
                });
            }
        }
        presence::announce(&state, user, false);

        info!(user = %user.short(), closed = ids.len(), reason, "user force-disconnected");
        ids.len()
    }

    pub async fn send_to_user(
        &self,
        user: &UserId,
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let state = self.state.read().await;
        state.send_to_user(user, &Arc::new(event), except)
    }

    /// Deliver one event to every connection of every listed user. Duplicate
    /// users are delivered once.
    pub async fn send_to_users<'a, I>(
        &self,
        users: I,
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        let event = Arc::new(event);
        let state = self.state.read().await;
        let mut seen = HashSet::new();
        users
            .into_iter()
            .filter(|u| seen.insert(*u))
            .map(|u| state.send_to_user(u, &event, except))
            .sum()
    }

    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let state = self.state.read().await;
        state.fan_out(&Arc::new(event))
    }

    pub async fn connections_for(&self, user: &UserId) -> HashSet<ConnectionId> {
        let state = self.state.read().await;
        state.by_user.get(user).cloned().unwrap_or_default()
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.state.read().await.by_user.contains_key(user)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.state.read().await.online_users()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parley_shared::types::PresenceStatus;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) fn outbox() -> (Outbox, UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    pub(crate) fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn status_updates(msgs: &[Outbound]) -> Vec<(String, PresenceStatus)> {
        msgs.iter()
            .filter_map(|m| match m {
                Outbound::Event(ev) => match ev.as_ref() {
                    ServerEvent::UserStatusUpdate { user_id, status } => {
                        Some((user_id.to_string(), *status))
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_connection_gets_snapshot_then_delta() {
        let registry = ConnectionRegistry::new(0);
        let alice = UserId::from("alice");
        let (tx, mut rx) = outbox();

        let reg = registry.register(&alice, ConnectionId::new(), tx).await;
        assert_eq!(reg, Registration::Registered { first: true });

        let msgs = drain(&mut rx);
        assert!(matches!(
            &msgs[0],
            Outbound::Event(ev) if matches!(ev.as_ref(), ServerEvent::OnlineUsersList { users } if users == &vec![alice.clone()])
        ));
        assert_eq!(
            status_updates(&msgs),
            vec![("alice".to_string(), PresenceStatus::Online)]
        );
    }

    #[tokio::test]
    async fn test_repeat_register_is_idempotent() {
        let registry = ConnectionRegistry::new(0);
        let bob = UserId::from("bob");
        let (watch_tx, mut watch_rx) = outbox();
        registry
            .register(&UserId::from("watcher"), ConnectionId::new(), watch_tx)
            .await;
        drain(&mut watch_rx);

        let id = ConnectionId::new();
        let (tx, _rx) = outbox();
        registry.register(&bob, id, tx.clone()).await;
        assert_eq!(
            registry.register(&bob, id, tx.clone()).await,
            Registration::AlreadyRegistered
        );

        // A second device does not re-announce.
        let (tx2, _rx2) = outbox();
        assert_eq!(
            registry.register(&bob, ConnectionId::new(), tx2).await,
            Registration::Registered { first: false }
        );

        assert_eq!(status_updates(&drain(&mut watch_rx)).len(), 1);
        assert_eq!(registry.connections_for(&bob).await.len(), 2);
    }

    #[tokio::test]
    async fn test_deregister_last_connection_goes_offline() {
        let registry = ConnectionRegistry::new(0);
        let a = UserId::from("a");
        let b = UserId::from("b");
        let a_conn = ConnectionId::new();
        let (a_tx, _a_rx) = outbox();
        let (b_tx, mut b_rx) = outbox();
        registry.register(&a, a_conn, a_tx).await;
        registry.register(&b, ConnectionId::new(), b_tx).await;
        drain(&mut b_rx);

        let result = registry.deregister(a_conn).await;
        assert_eq!(
            result,
            Deregistration::Removed {
                user: a.clone(),
                last: true
            }
        );
        assert!(!registry.is_online(&a).await);
        assert!(registry.is_online(&b).await);
        assert_eq!(
            status_updates(&drain(&mut b_rx)),
            vec![("a".to_string(), PresenceStatus::Offline)]
        );

        assert_eq!(registry.deregister(a_conn).await, Deregistration::Unknown);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let registry = ConnectionRegistry::new(1);
        let a = UserId::from("a");
        let (tx, _rx) = outbox();
        registry.register(&a, ConnectionId::new(), tx.clone()).await;
        assert_eq!(
            registry.register(&a, ConnectionId::new(), tx).await,
            Registration::LimitReached
        );
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_to_user_skips_origin() {
        let registry = ConnectionRegistry::new(0);
        let a = UserId::from("a");
        let phone = ConnectionId::new();
        let (phone_tx, mut phone_rx) = outbox();
        let (laptop_tx, mut laptop_rx) = outbox();
        registry.register(&a, phone, phone_tx).await;
        registry.register(&a, ConnectionId::new(), laptop_tx).await;
        drain(&mut phone_rx);
        drain(&mut laptop_rx);

        let delivered = registry
            .send_to_user(&a, ServerEvent::error("ping"), Some(phone))
            .await;
        assert_eq!(delivered, 1);
        assert!(drain(&mut phone_rx).is_empty());
        assert_eq!(drain(&mut laptop_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_sends_notice_before_close() {
        let registry = ConnectionRegistry::new(0);
        let m = UserId::from("mallory");
        let (tx, mut rx) = outbox();
        let (w_tx, mut w_rx) = outbox();
        registry.register(&m, ConnectionId::new(), tx).await;
        registry.register(&UserId::from("w"), ConnectionId::new(), w_tx).await;
        drain(&mut rx);
        drain(&mut w_rx);

        let notice = ServerEvent::UserBanned {
            user_id: m.clone(),
            reason: "spam".into(),
        };
        assert_eq!(registry.disconnect_user(&m, notice, "banned").await, 1);

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(&msgs[0], Outbound::Event(ev) if matches!(ev.as_ref(), ServerEvent::UserBanned { .. })));
        assert!(matches!(&msgs[1], Outbound::Close { .. }));

        assert!(!registry.is_online(&m).await);
        assert_eq!(
            status_updates(&drain(&mut w_rx)),
            vec![("mallory".to_string(), PresenceStatus::Offline)]
        );
    }
}
