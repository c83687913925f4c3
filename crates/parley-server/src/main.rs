use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_server::{serve, AppState, ServerConfig};
use parley_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and open storage
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let db = Database::open(&config.database_path)?;
    let http_addr = config.http_addr;
    let state = AppState::new(config, db);

    // -----------------------------------------------------------------------
    // 3. Spawn background tasks
    // -----------------------------------------------------------------------

    // Evict rate-limit buckets idle for more than 10 minutes.
    let http_limiter = state.http_limiter.clone();
    let send_limiter = state.send_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            http_limiter.purge_stale(600.0).await;
            send_limiter.purge_stale(600.0).await;
        }
    });

    let moderation = state.moderation.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            moderation.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 4. Run the HTTP/WebSocket server until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        result = serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
