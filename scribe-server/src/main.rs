//! Scribe sync server — standalone WebSocket endpoint.
//!
//! Configuration comes from the environment (optionally via a `.env` file):
//! - `SCRIBE_BIND_ADDR` — listening address (default `0.0.0.0:9090`)
//! - `SCRIBE_SEND_QUEUE` — outbound frames buffered per connection (default 256)
//! - `RUST_LOG` — log filter, e.g. `info,scribe_collab=debug`

use std::env;
use std::sync::Arc;
use log::info;
use scribe_collab::broker::LocalBroker;
use scribe_collab::server::{ServerConfig, SyncServer};

fn config_from_env() -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
        bind_addr: env::var("SCRIBE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string()),
        send_queue_capacity: env::var("SCRIBE_SEND_QUEUE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.send_queue_capacity),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = config_from_env();
    info!("Starting sync server on {}", config.bind_addr);

    // Multi-instance deployments plug their broker client in through
    // SyncServer::new; a single instance fans out in-process.
    let server = SyncServer::new(config, Arc::new(LocalBroker::new()));
    if let Err(e) = server.run().await {
        log::error!("Server failed: {e}");
        std::process::exit(1);
    }
}
