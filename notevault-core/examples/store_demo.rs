//! Walk through the store and the broadcast engine
//!
//! Run with:
//! ```bash
//! cargo run --example store_demo
//! ```

use notevault_core::config::{BroadcastConfig, StoreConfig};
use notevault_core::core_broadcast::{Broadcaster, EchoNode, NodeId, NodeRegistry};
use notevault_core::core_crypto::MasterKey;
use notevault_core::core_store::{DataStore, LogicalKey};
use notevault_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging_with_config(LogConfig::new(LogLevel::Debug).with_target(true))?;

    let dir = tempfile::tempdir()?;
    let config = StoreConfig {
        data_dir: dir.path().to_path_buf(),
        ..StoreConfig::default()
    };
    let store = DataStore::open(&config, MasterKey::generate())?;

    let key = LogicalKey::new("notes", "inbox", "welcome", "v1");
    store.put(key.clone(), json!({ "title": "hello", "tags": ["demo"] })).await?;
    info!(document = %store.get(key.clone()).await?, "Read back");

    let report = store.rotate_key(MasterKey::generate()).await?;
    info!(rotated = report.rotated, "Rotated master key");
    info!(document = %store.get(key).await?, "Still readable after rotation");

    let registry = NodeRegistry::new();
    registry.insert(NodeId::from("alpha"), Arc::new(EchoNode)).await;
    registry.insert(NodeId::from("beta"), Arc::new(EchoNode)).await;
    let broadcaster = Broadcaster::new(registry, &BroadcastConfig::default());

    let recipients = [NodeId::from("alpha"), NodeId::from("beta"), NodeId::from("gamma")];
    let outcome = broadcaster.broadcast(&b"ping"[..], &recipients).await?;
    for (id, entry) in outcome.results() {
        match entry.failure() {
            Some(err) => info!(node = %id, stage = err.stage.as_str(), "Delivery failed"),
            None => info!(node = %id, "Delivered"),
        }
    }

    Ok(())
}
