// src/server/main.rs
// Entry point for the fretline chat gateway
use fretline::server::{auth, provisioner};
use fretline::server::chats::ChatStore;
use fretline::server::config::ServerConfig;
use fretline::server::database::Database;
use fretline::server::gateway::Gateway;
use fretline::server::rooms::RoomRegistry;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    let config = ServerConfig::from_env();

    let database = Database::connect(&config.database_url).await?;
    info!("🗄️ Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("✅ Database migrations completed successfully");

    let registry = RoomRegistry::new();
    let store = ChatStore::new(database.clone());

    // Repair requests that never got their chat before serving traffic,
    // then keep sweeping in the background.
    match provisioner::reconcile_missing_chats(&database, &store).await {
        Ok(0) => {}
        Ok(n) => info!("Reconciliation created {} missing chats at startup", n),
        Err(e) => error!("Startup reconciliation failed: {}", e),
    }
    let sweep_db = database.clone();
    let sweep_store = store.clone();
    let sweep_every = Duration::from_secs(config.reconcile_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        interval.tick().await; // the startup sweep already ran
        loop {
            interval.tick().await;
            match provisioner::reconcile_missing_chats(&sweep_db, &sweep_store).await {
                Ok(0) => {}
                Ok(n) => info!("Reconciliation created {} missing chats", n),
                Err(e) => error!("Periodic reconciliation failed: {}", e),
            }
            auth::cleanup_expired_sessions(&sweep_db).await;
        }
    });

    let gateway = Arc::new(Gateway::new(database, registry, config.clone()));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket gateway listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("New WebSocket connection from {}", peer);
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.handle_connection(stream).await {
                error!("Connection error ({}): {}", peer, e);
            }
        });
    }
}
