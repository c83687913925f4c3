use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use parley_shared::presence::group_online;
use parley_shared::protocol::ServerEvent;
use parley_shared::types::UserId;

use crate::registry::{ConnectionRegistry, RegistryState};

/// Emit one status delta to every live connection. Called by the registry
/// with its write lock held.
pub(crate) fn announce(state: &RegistryState, user: &UserId, online: bool) -> usize {
    let event = Arc::new(ServerEvent::presence(user.clone(), online));
    let delivered = state.fan_out(&event);
    debug!(user = %user.short(), online, delivered, "presence change");
    delivered
}

/// Presence queries and explicit announcements on top of the registry.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    registry: ConnectionRegistry,
}

impl PresenceBroadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Send a status delta for `user` to every live connection.
    pub async fn broadcast_presence_change(&self, user: &UserId, is_online: bool) -> usize {
        let state = self.registry.read().await;
        announce(&state, user, is_online)
    }

    pub async fn snapshot_online_users(&self) -> Vec<UserId> {
        self.registry.online_users().await
    }

    pub async fn online_set(&self) -> HashSet<UserId> {
        self.registry.online_users().await.into_iter().collect()
    }

    /// Aggregated presence of a group: any member online.
    pub async fn group_online(&self, members: &[UserId]) -> bool {
        group_online(members, &self.online_set().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{drain, outbox};
    use crate::registry::{ConnectionId, Outbound};

    #[tokio::test]
    async fn test_group_presence_follows_registry() {
        let registry = ConnectionRegistry::new(0);
        let presence = PresenceBroadcaster::new(registry.clone());
        let members: Vec<UserId> = ["a", "b", "c"].into_iter().map(UserId::from).collect();

        assert!(!presence.group_online(&members).await);

        let b_conn = ConnectionId::new();
        let (tx, _rx) = outbox();
        registry.register(&UserId::from("b"), b_conn, tx).await;
        assert!(presence.group_online(&members).await);
        assert!(!presence.group_online(&[]).await);

        registry.deregister(b_conn).await;
        assert!(!presence.group_online(&members).await);
    }

    #[tokio::test]
    async fn test_explicit_broadcast_reaches_everyone() {
        let registry = ConnectionRegistry::new(0);
        let presence = PresenceBroadcaster::new(registry.clone());
        let (tx1, mut rx1) = outbox();
        let (tx2, mut rx2) = outbox();
        registry.register(&UserId::from("x"), ConnectionId::new(), tx1).await;
        registry.register(&UserId::from("y"), ConnectionId::new(), tx2).await;
        drain(&mut rx1);
        drain(&mut rx2);

        let delivered = presence
            .broadcast_presence_change(&UserId::from("x"), true)
            .await;
        assert_eq!(delivered, 2);
        for rx in [&mut rx1, &mut rx2] {
            let msgs = drain(rx);
            assert!(matches!(
                &msgs[..],
                [Outbound::Event(ev)] if matches!(ev.as_ref(), ServerEvent::UserStatusUpdate { .. })
            ));
        }
        assert_eq!(
            presence.snapshot_online_users().await,
            vec![UserId::from("x"), UserId::from("y")]
        );
    }
}
