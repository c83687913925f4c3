use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use parley_shared::types::UserId;
use parley_store::Database;

use crate::admin::AdminHub;
use crate::config::ServerConfig;
use crate::directory::KeyDirectory;
use crate::error::ServerError;
use crate::groups::GroupService;
use crate::moderation::ModerationList;
use crate::presence::PresenceBroadcaster;
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

/// The SQLite handle shared by every service. Queries are short and never
/// held across an `.await`.
#[derive(Clone)]
pub struct SharedDatabase(Arc<Mutex<Database>>);

impl SharedDatabase {
    pub fn new(db: Database) -> Self {
        Self(Arc::new(Mutex::new(db)))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Database>, ServerError> {
        self.0
            .lock()
            .map_err(|_| ServerError::Internal("database mutex poisoned".into()))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: SharedDatabase,
    pub registry: ConnectionRegistry,
    pub presence: PresenceBroadcaster,
    pub router: MessageRouter,
    pub directory: KeyDirectory,
    pub groups: GroupService,
    pub moderation: ModerationList,
    pub admins: AdminHub,
    pub http_limiter: RateLimiter<IpAddr>,
    pub send_limiter: RateLimiter<UserId>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every service around one registry and one database handle.
    pub fn new(config: ServerConfig, db: Database) -> Self {
        let db = SharedDatabase::new(db);
        let registry = ConnectionRegistry::new(config.max_connections_per_user);
        let presence = PresenceBroadcaster::new(registry.clone());

        Self {
            router: MessageRouter::new(db.clone(), registry.clone()),
            directory: KeyDirectory::new(db.clone()),
            groups: GroupService::new(db.clone(), registry.clone(), presence.clone()),
            moderation: ModerationList::new(),
            admins: AdminHub::new(),
            http_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            send_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            started_at: Instant::now(),
            config: Arc::new(config),
            db,
            registry,
            presence,
        }
    }
}
