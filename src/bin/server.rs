//! Standalone collaboration server.
//!
//! ```text
//! tandem-server [bind_addr]
//! ```
//!
//! Serves every document under `ws://<bind_addr>/<doc_id>`, backed by the
//! in-memory store. Set `RUST_LOG=info` to watch connections come and go.

use std::sync::Arc;

use tandem::server::{CollabServer, ServerConfig};
use tandem::storage::MemoryStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_string());

    let store = Arc::new(MemoryStore::new());
    store.seed("welcome", "Welcome to tandem. Everything you type here is shared.\n");

    let config = ServerConfig {
        bind_addr,
        ..ServerConfig::default()
    };
    CollabServer::with_store(config, store).run().await
}
