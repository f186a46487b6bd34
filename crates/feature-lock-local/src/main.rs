mod config;
mod resolver;
mod store;

use std::sync::Arc;

use clap::Parser;
use feature_lock_core::{Lock, LockInfo, LockManager, Query, SystemClock};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Command, Config};
use resolver::IdResolver;
use store::FileLockStore;

/// A lock with its record enumerations.
#[derive(Debug, Serialize)]
struct LockReport {
    #[serde(flatten)]
    info: LockInfo,
    locked: Vec<String>,
    failed: Vec<String>,
}

impl LockReport {
    async fn collect(lock: &Lock) -> anyhow::Result<Self> {
        Ok(Self {
            info: lock.info().clone(),
            locked: lock.locked_feature_ids().await?.collect_all().await?,
            failed: lock.failed_feature_ids().await?.collect_all().await?,
        })
    }
}

#[derive(Debug, Serialize)]
struct RecordStatus {
    record_id: String,
    locked: bool,
    modifiable: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON result.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    let store = FileLockStore::new(config.effective_store_dir());
    info!("Using lock store at {}", store.base_dir().display());

    let manager = LockManager::new(
        Arc::new(store),
        Arc::new(IdResolver::new()),
        Arc::new(SystemClock),
    )
    .with_page_size(config.page_size);

    let output = run(&manager, &config).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(manager: &LockManager, config: &Config) -> anyhow::Result<serde_json::Value> {
    let output = match &config.command {
        Command::Acquire {
            record_type,
            ids,
            mode,
            expiry_secs,
        } => {
            let query = Query::ids(record_type.as_str(), ids.iter().cloned());
            let ttl = config.expiry(*expiry_secs);
            info!("Acquiring {} records ({}, {}s)", ids.len(), mode, ttl.as_secs());
            let lock = manager.acquire_lock(&query, (*mode).into(), ttl).await?;
            serde_json::to_value(LockReport::collect(&lock).await?)?
        }
        Command::Show { lock_id } => {
            let lock = manager.get_lock(lock_id).await?;
            serde_json::to_value(LockReport::collect(&lock).await?)?
        }
        Command::List => {
            let locks = manager.active_locks().await?.collect_all().await?;
            let infos: Vec<&LockInfo> = locks.iter().map(Lock::info).collect();
            serde_json::to_value(infos)?
        }
        Command::Release { lock_id } => {
            manager.release(lock_id).await?;
            serde_json::json!({ "released": lock_id })
        }
        Command::ReleaseRecord { lock_id, record_id } => {
            manager.release_record(lock_id, record_id).await?;
            let lock = manager.get_lock(lock_id).await?;
            serde_json::to_value(LockReport::collect(&lock).await?)?
        }
        Command::Status {
            record_ids,
            lock_id,
        } => {
            let mut statuses = Vec::with_capacity(record_ids.len());
            for record_id in record_ids {
                statuses.push(RecordStatus {
                    record_id: record_id.clone(),
                    locked: manager.is_feature_locked(record_id).await?,
                    modifiable: manager
                        .is_feature_modifiable(record_id, lock_id.as_deref())
                        .await?,
                });
            }
            serde_json::to_value(statuses)?
        }
        Command::Renew {
            lock_id,
            expiry_secs,
        } => {
            let lock = manager.renew(lock_id, config.expiry(*expiry_secs)).await?;
            serde_json::to_value(lock.info())?
        }
        Command::Complete {
            lock_id,
            touched,
            release,
        } => {
            info!("Completing transaction on {} (release {})", lock_id, release);
            manager.ensure_modifiable(touched, Some(lock_id.as_str())).await?;
            match manager
                .complete_transaction(lock_id, (*release).into(), touched)
                .await?
            {
                Some(lock) => serde_json::to_value(LockReport::collect(&lock).await?)?,
                None => serde_json::json!({ "released": lock_id }),
            }
        }
        Command::Sweep => {
            let removed = manager.sweep_expired().await?;
            serde_json::json!({ "removed": removed })
        }
    };
    Ok(output)
}
