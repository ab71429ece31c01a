//! The gateway context: configuration, storage, live sink and device manager
//! bundled together and passed explicitly to whatever serves the API.

use anyhow::{anyhow, Result};
use fs2::FileExt;
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::device::{CompanionConnector, Connector, DeviceManager};
use crate::live::BroadcastSink;
use crate::metrics;
use crate::storage::{SqliteStore, Store};

const LOCK_FILE: &str = "meshgate.lock";

/// Exclusive claim on a data directory, held for the life of the process.
#[derive(Debug)]
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("Failed to create data directory {}: {}", dir.display(), e))?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| anyhow!("Failed to open lock file {}: {}", path.display(), e))?;
        file.try_lock_exclusive().map_err(|e| {
            anyhow!(
                "Data directory {} is in use by another meshgate process ({})",
                dir.display(),
                e
            )
        })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

pub struct Gateway {
    config: Config,
    store: Arc<SqliteStore>,
    live: Arc<BroadcastSink>,
    manager: DeviceManager,
    _lock: DataDirLock,
}

impl Gateway {
    /// Build a gateway that talks to real hardware.
    pub fn new(config: Config) -> Result<Self> {
        let connector = Arc::new(CompanionConnector::new(config.device.connect_timeout()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        let lock = DataDirLock::acquire(Path::new(&config.storage.data_dir))?;
        let db_path = config.storage.database_path();
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .map_err(|e| anyhow!("Failed to open database {}: {}", db_path.display(), e))?,
        );
        let live = Arc::new(BroadcastSink::default());
        let manager = DeviceManager::new(
            config.device.clone(),
            connector,
            store.clone(),
            live.clone(),
        );
        Ok(Self {
            config,
            store,
            live,
            manager,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn live(&self) -> &Arc<BroadcastSink> {
        &self.live
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// Start the device manager and serve until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.manager.start();
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow!("Failed to listen for shutdown signal: {}", e))?;
        info!("Shutdown requested");
        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.manager.stop().await;
        let m = metrics::snapshot();
        info!(
            "Session totals: {} connects, {} reconnects, {} commands ok, {} failed, {} timed out, {} events",
            m.connects,
            m.reconnects,
            m.commands_ok,
            m.commands_failed,
            m.commands_timed_out,
            m.events_ingested
        );
    }

    /// Storage stats, stored device identity, connection status and counters.
    pub fn status_report(&self) -> Result<serde_json::Value> {
        status_report(self.store.as_ref(), Some(&self.manager))
    }
}

/// Status summary built from storage, plus live connection state when a
/// manager is running in this process.
pub fn status_report(store: &dyn Store, manager: Option<&DeviceManager>) -> Result<serde_json::Value> {
    let stats = store.get_stats()?;
    let device = store.get_device_info()?;
    Ok(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "device": device,
        "connection": manager.map(|m| m.status()),
        "stats": stats,
        "metrics": metrics::snapshot(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = DataDirLock::acquire(dir.path()).unwrap();
        let second = DataDirLock::acquire(dir.path());
        assert!(second.is_err());
        assert!(first.path().ends_with(LOCK_FILE));
        drop(first);
        assert!(DataDirLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn status_report_without_manager() {
        let store = SqliteStore::in_memory().unwrap();
        let report = status_report(&store, None).unwrap();
        assert_eq!(report["stats"]["contacts"], 0);
        assert!(report["connection"].is_null());
    }
}
