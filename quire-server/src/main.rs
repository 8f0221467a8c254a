//! Quire sync server.
//!
//! Configuration comes from the environment:
//!
//! | Variable                  | Default          |
//! |---------------------------|------------------|
//! | `QUIRE_BIND_ADDR`         | `127.0.0.1:9090` |
//! | `QUIRE_HISTORY_LIMIT`     | `1024`           |
//! | `QUIRE_MAX_QUEUE`         | `10000`          |
//! | `QUIRE_DUPLICATE_POLICY`  | `replace`        |
//! | `QUIRE_EVICT_EMPTY_ROOMS` | `false`          |
//!
//! Log output is controlled by `RUST_LOG`.

use std::env;
use std::str::FromStr;

use quire_sync::{DuplicatePolicy, ServerConfig, SyncServer};

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{key}: cannot parse {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn duplicate_policy() -> Result<DuplicatePolicy, String> {
    match env::var("QUIRE_DUPLICATE_POLICY") {
        Err(_) => Ok(DuplicatePolicy::default()),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(DuplicatePolicy::Replace),
            "reject" => Ok(DuplicatePolicy::Reject),
            other => Err(format!(
                "QUIRE_DUPLICATE_POLICY: expected \"replace\" or \"reject\", got {other:?}"
            )),
        },
    }
}

fn load_config() -> Result<ServerConfig, String> {
    let mut config = ServerConfig::default();
    config.bind_addr = env_or("QUIRE_BIND_ADDR", config.bind_addr)?;
    config.hub.history_limit = env_or("QUIRE_HISTORY_LIMIT", config.hub.history_limit)?;
    config.hub.max_queue_len = env_or("QUIRE_MAX_QUEUE", config.hub.max_queue_len)?;
    config.hub.duplicate_policy = duplicate_policy()?;
    config.evict_empty_rooms = env_or("QUIRE_EVICT_EMPTY_ROOMS", config.evict_empty_rooms)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = load_config()?;
    log::info!(
        "Starting quire server: history {} ops, queue {} payloads, {:?} on duplicate sessions",
        config.hub.history_limit,
        config.hub.max_queue_len,
        config.hub.duplicate_policy
    );

    SyncServer::new(config).run().await
}
