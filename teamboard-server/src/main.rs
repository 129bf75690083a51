use std::sync::Arc;

use log::info;
use teamboard_sync::registry::SessionRegistry;
use teamboard_sync::server::{ServerConfig, SyncServer};
use teamboard_sync::storage::{MemoryElementStore, PersistenceMode};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting teamboard sync server...");

    let config = ServerConfig::from_env();
    let registry = match config.hub.persistence {
        PersistenceMode::Disabled => SessionRegistry::new(config.hub.clone()),
        mode => {
            info!("Element store: in-memory ({})", mode.as_str());
            SessionRegistry::new(config.hub.clone()).with_store(Arc::new(MemoryElementStore::new()))
        }
    };

    let handle = SyncServer::with_registry(config, registry).bind().await?;
    info!("Accepting clients at {}", handle.url());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
