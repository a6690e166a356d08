//! Standalone relay.
//!
//! Usage: `tandem-relay [BIND_ADDR] [STORAGE_DIR]`
//!
//! Without a storage directory documents live in memory and are lost on exit.

use log::info;
use tandem_sync::{FileDocumentStore, MemoryDocumentStore, ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mut config = ServerConfig::default();
    if let Some(addr) = args.next() {
        config.bind_addr = addr;
    }

    match args.next() {
        Some(dir) => {
            let store = FileDocumentStore::open(&dir).await?;
            info!("Starting relay on {} (documents in {dir})", config.bind_addr);
            let server = SyncServer::new(config, store);
            server.run().await
        }
        None => {
            info!("Starting relay on {} (in-memory documents)", config.bind_addr);
            let server = SyncServer::new(config, MemoryDocumentStore::new());
            server.run().await
        }
    }
}
