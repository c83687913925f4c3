use std::collections::HashSet;

use parley_shared::presence::group_online;
use parley_shared::protocol::ServerEvent;
use parley_shared::types::UserId;

/// Client-side mirror of who is online, fed by server events.
///
/// The snapshot sent on every (re)connect replaces the whole view, so a
/// missed delta during a disconnect never leaves stale entries.
#[derive(Debug, Default, Clone)]
pub struct PresenceView {
    online: HashSet<UserId>,
}

impl PresenceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a presence event. Returns false for events that carry no
    /// presence information.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::OnlineUsersList { users } => {
                self.online = users.iter().cloned().collect();
                true
            }
            ServerEvent::UserStatusUpdate { user_id, status } => {
                if status.is_online() {
                    self.online.insert(user_id.clone());
                } else {
                    self.online.remove(user_id);
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.contains(user)
    }

    /// Online users, sorted.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn group_online(&self, members: &[UserId]) -> bool {
        group_online(members, &self.online)
    }

    pub fn clear(&mut self) {
        self.online.clear();
    }
}
