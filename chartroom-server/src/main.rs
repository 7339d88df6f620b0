//! Chartroom server — WebSocket collaboration gateway plus the structured
//! case-update API in one deployable process.
//!
//! Configuration is environment-driven:
//!
//! | Variable | Default | Purpose |
//! |---|---|---|
//! | `CHARTROOM_GATEWAY_ADDR` | `127.0.0.1:9090` | WebSocket bind address |
//! | `CHARTROOM_API_ADDR` | `127.0.0.1:9091` | HTTP API bind address |
//! | `CHARTROOM_SECRET` | dev-only fallback | HS256 token secret |
//! | `CHARTROOM_DATA_DIR` | `chartroom_data` | RocksDB directory |
//! | `CHARTROOM_HEARTBEAT_SECS` | `10` | expected heartbeat cadence |
//! | `CHARTROOM_HEARTBEAT_TIMEOUT_SECS` | `30` | eviction timeout |
//! | `CHARTROOM_QUEUE_BOUND` | `256` | per-connection outbound bound |
//! | `CHARTROOM_BUS_CAPACITY` | `1024` | bus ring buffer per subscriber |
//! | `CHARTROOM_COMPACTION_THRESHOLD` | `100` | doc ops before snapshot |

use log::{info, warn};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use chartroom_caseapi::{AppState, CaseStore, CaseStoreConfig};
use chartroom_collab::storage::{DocumentVault, SnapshotStore, VaultConfig};
use chartroom_collab::{
    CollabGateway, DocumentEngine, EngineConfig, FanoutBus, GatewayConfig, IdentityVerifier,
};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let secret = match std::env::var("CHARTROOM_SECRET") {
        Ok(secret) => secret,
        Err(_) => {
            warn!("CHARTROOM_SECRET not set; using an insecure development secret");
            "chartroom-dev-secret".to_string()
        }
    };
    let data_dir = PathBuf::from(env_or("CHARTROOM_DATA_DIR", "chartroom_data".to_string()));
    let gateway_addr = env_or("CHARTROOM_GATEWAY_ADDR", "127.0.0.1:9090".to_string());
    let api_addr = env_or("CHARTROOM_API_ADDR", "127.0.0.1:9091".to_string());
    let heartbeat = Duration::from_secs(env_or("CHARTROOM_HEARTBEAT_SECS", 10));
    let heartbeat_timeout = Duration::from_secs(env_or("CHARTROOM_HEARTBEAT_TIMEOUT_SECS", 30));
    if heartbeat_timeout < heartbeat * 3 {
        warn!(
            "Heartbeat timeout {heartbeat_timeout:?} is under 3x the {heartbeat:?} interval; \
             transient network jitter may evict live participants"
        );
    }

    let verifier = Arc::new(IdentityVerifier::new(secret.as_bytes()));
    let bus = Arc::new(FanoutBus::new(env_or("CHARTROOM_BUS_CAPACITY", 1024)));

    let vault: Arc<dyn SnapshotStore> = Arc::new(DocumentVault::open(VaultConfig {
        path: data_dir.join("docs"),
        ..VaultConfig::default()
    })?);
    let engine = Arc::new(DocumentEngine::new(
        Uuid::new_v4(),
        bus.clone(),
        Some(vault),
        EngineConfig {
            compaction_threshold: env_or("CHARTROOM_COMPACTION_THRESHOLD", 100),
        },
    ));
    let recovered = engine.recover().await?;
    if recovered > 0 {
        info!("Recovered {recovered} documents from storage");
    }

    let gateway = CollabGateway::new(
        GatewayConfig {
            bind_addr: gateway_addr,
            heartbeat_interval: heartbeat,
            heartbeat_timeout,
            outbound_queue_bound: env_or("CHARTROOM_QUEUE_BOUND", 256),
            ..GatewayConfig::default()
        },
        verifier.clone(),
        bus,
        engine.clone(),
    );
    let health = gateway.health_handle();
    tokio::spawn({
        let gateway = gateway.clone();
        async move {
            if let Err(e) = gateway.run().await {
                log::error!("Gateway stopped: {e}");
            }
        }
    });

    let store = Arc::new(CaseStore::open(CaseStoreConfig {
        path: data_dir.join("cases"),
        ..CaseStoreConfig::default()
    })?);
    let state = AppState {
        store,
        verifier,
        health,
    };
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("Case API listening on {api_addr}");

    tokio::select! {
        result = chartroom_caseapi::serve(state, listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    // Flush document snapshots before the process exits.
    engine.flush_all().await;
    info!("Shutdown complete");
    Ok(())
}
