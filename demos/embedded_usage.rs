//! Minimal embedding example for flagsync-core
//!
//! This example registers a few flags, synchronizes them with an in-memory
//! store, and edits the store the way an operator would. The synchronizer
//! lifecycle is fully managed by the application.
//!
//! Environment:
//! - `FLAGSYNC_PREFIX`: store prefix to synchronize (default `/config/demo`)
//! - `FLAGSYNC_LOG_LEVEL`: trace, debug, info, warn or error (default `info`)

use flagsync_core::traits::{KvStore, SetOptions};
use flagsync_core::{DynamicValue, FlagSet, MemoryKvStore, SyncConfig, Synchronizer};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Rate limits tuned at runtime
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
struct RateLimits {
    #[prost(uint32, tag = "1")]
    #[serde(default)]
    requests_per_second: u32,
    #[prost(uint32, tag = "2")]
    #[serde(default)]
    burst: u32,
}

fn init_logging() -> anyhow::Result<()> {
    let log_level = match env::var("FLAGSYNC_LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn edit(store: &MemoryKvStore, key: &str, value: &str) -> anyhow::Result<()> {
    info!("operator: {} = {}", key, value);
    store.set(key, value, SetOptions::default()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let prefix = env::var("FLAGSYNC_PREFIX").unwrap_or_else(|_| "/config/demo".to_string());
    let config = SyncConfig::new(prefix);
    let root = config.normalized_prefix();
    let key = |name: &str| format!("{}{}", root, name);

    // 1. Register flags
    let flags = Arc::new(FlagSet::new());
    let workers = flags.scalar("workers", 4u32, "worker threads, read at start-up")?;
    let log_level = flags.scalar("log_level", "info".to_string(), "service log level")?;
    flags.mark_dynamic("log_level")?;
    let limits = flags.dynamic(
        "rate_limits",
        DynamicValue::new(RateLimits {
            requests_per_second: 100,
            burst: 10,
        })
        .with_validator(|l: &RateLimits| {
            anyhow::ensure!(
                l.burst <= l.requests_per_second,
                "burst {} exceeds rate {}",
                l.burst,
                l.requests_per_second
            );
            Ok(())
        })
        .with_notifier(|old, new| {
            info!(
                "rate limits changed: {} rps -> {} rps",
                old.requests_per_second, new.requests_per_second
            )
        }),
        "request rate limits",
    )?;

    // 2. Seed the store
    let store = Arc::new(MemoryKvStore::new());
    store.set(&key("workers"), "16", SetOptions::default()).await?;
    store
        .set(
            &key("rate_limits"),
            r#"{"requests_per_second": 200, "burst": 20}"#,
            SetOptions::default(),
        )
        .await?;

    // 3. Load and watch
    let mut sync = Synchronizer::new(flags.clone(), store.clone(), config)?;
    if let Err(e) = sync.initialize().await {
        warn!("initial load was incomplete: {}", e);
    }
    info!(
        "workers={} log_level={} limits={}",
        workers.get(),
        log_level.get(),
        limits
    );
    sync.start()?;

    // 4. Runtime edits
    edit(&store, &key("log_level"), "debug").await?;
    edit(&store, &key("workers"), "64").await?;
    edit(&store, &key("rate_limits"), r#"{"requests_per_second": 50, "burst": 500}"#).await?;
    edit(&store, &key("rate_limits"), r#"{"requests_per_second": 500, "burst": 50}"#).await?;

    info!(
        "workers={} (start-up only) log_level={} limits={}",
        workers.get(),
        log_level.get(),
        limits
    );
    info!(
        "store holds rate_limits={:?}",
        store.value(&key("rate_limits"))
    );

    // 5. Shut down
    sync.stop()?;
    sync.wait_stopped().await?;
    info!("synchronizer stopped at index={}", sync.last_index());

    Ok(())
}
