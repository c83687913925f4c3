//! Bans and time-boxed suspensions.
//!
//! Sanctions live in memory only; a restart lifts them. Expired suspensions
//! stop blocking immediately and are evicted by a periodic purge.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use parley_shared::protocol::ServerEvent;
use parley_shared::types::UserId;

/// Suspension length when the admin does not give one.
pub const DEFAULT_SUSPENSION_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sanction {
    Banned {
        reason: String,
        since: DateTime<Utc>,
    },
    Suspended {
        reason: String,
        until: DateTime<Utc>,
    },
}

impl Sanction {
    /// Event announcing this sanction to the sanctioned user.
    pub fn notice(&self, user: &UserId) -> ServerEvent {
        match self {
            Sanction::Banned { reason, .. } => ServerEvent::UserBanned {
                user_id: user.clone(),
                reason: reason.clone(),
            },
            Sanction::Suspended { reason, until } => ServerEvent::UserSuspended {
                user_id: user.clone(),
                reason: reason.clone(),
                until: *until,
            },
        }
    }

    fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self {
            Sanction::Banned { .. } => true,
            Sanction::Suspended { until, .. } => now < *until,
        }
    }
}

#[derive(Clone, Default)]
pub struct ModerationList {
    sanctions: Arc<RwLock<HashMap<UserId, Sanction>>>,
}

impl ModerationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ban(&self, user: &UserId, reason: &str) {
        let mut sanctions = self.sanctions.write().await;
        sanctions.insert(
            user.clone(),
            Sanction::Banned {
                reason: reason.to_string(),
                since: Utc::now(),
            },
        );
        info!(user = %user.short(), reason, "user banned");
    }

    /// Suspend for `duration_secs` (default one day). A ban is not downgraded
    /// to a suspension. Returns when the suspension ends.
    pub async fn suspend(
        &self,
        user: &UserId,
        reason: &str,
        duration_secs: Option<u64>,
    ) -> DateTime<Utc> {
        let secs = duration_secs.unwrap_or(DEFAULT_SUSPENSION_SECS);
        let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        let until = Utc::now()
            .checked_add_signed(Duration::seconds(secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut sanctions = self.sanctions.write().await;
        if !matches!(sanctions.get(user), Some(Sanction::Banned { .. })) {
            sanctions.insert(
                user.clone(),
                Sanction::Suspended {
                    reason: reason.to_string(),
                    until,
                },
            );
        }
        info!(user = %user.short(), reason, %until, "user suspended");
        until
    }

    /// Lift any ban or suspension. Returns whether one was active.
    pub async fn unban(&self, user: &UserId) -> bool {
        let removed = self.sanctions.write().await.remove(user);
        let lifted = removed.is_some_and(|s| s.is_active(Utc::now()));
        info!(user = %user.short(), lifted, "sanctions lifted");
        lifted
    }

    /// The active sanction for `user`, if any.
    pub async fn status(&self, user: &UserId) -> Option<Sanction> {
        let sanctions = self.sanctions.read().await;
        sanctions
            .get(user)
            .filter(|s| s.is_active(Utc::now()))
            .cloned()
    }

    pub async fn is_blocked(&self, user: &UserId) -> bool {
        self.status(user).await.is_some()
    }

    pub async fn purge_expired(&self) -> usize {
        let mut sanctions = self.sanctions.write().await;
        let before = sanctions.len();
        let now = Utc::now();
        sanctions.retain(|_, s| s.is_active(now));
        let removed = before - sanctions.len();
        if removed > 0 {
            debug!(removed, "Purged expired suspensions");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ban_and_unban() {
        let list = ModerationList::new();
        let m = UserId::from("mallory");

        assert!(!list.is_blocked(&m).await);
        list.ban(&m, "spam").await;
        assert!(matches!(list.status(&m).await, Some(Sanction::Banned { .. })));

        assert!(list.unban(&m).await);
        assert!(!list.is_blocked(&m).await);
        assert!(!list.unban(&m).await);
    }

    #[tokio::test]
    async fn test_suspension_expires() {
        let list = ModerationList::new();
        let m = UserId::from("mallory");

        let until = list.suspend(&m, "cool down", Some(3600)).await;
        assert!(until > Utc::now());
        assert!(list.is_blocked(&m).await);

        list.suspend(&m, "instant", Some(0)).await;
        assert!(!list.is_blocked(&m).await);
        assert_eq!(list.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_suspend_does_not_downgrade_ban() {
        let list = ModerationList::new();
        let m = UserId::from("mallory");
        list.ban(&m, "fraud").await;
        list.suspend(&m, "also this", Some(1)).await;
        assert!(matches!(list.status(&m).await, Some(Sanction::Banned { .. })));
    }

    #[tokio::test]
    async fn test_default_suspension_is_one_day() {
        let list = ModerationList::new();
        let until = list.suspend(&UserId::from("x"), "", None).await;
        let remaining = until - Utc::now();
        assert!(remaining > Duration::hours(23));
    }
}
