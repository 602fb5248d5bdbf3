//! Device store backed by the configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use calima_core::{DeviceStore, Error};
use calima_types::{DeviceIdentity, DeviceSettings};

use crate::config::Config;

/// Writes per-device settings back into the [`Config`] and, when a path is
/// set, to disk.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    config: Arc<Mutex<Config>>,
    path: Option<PathBuf>,
    /// Serializes file writes so they land in update order.
    writes: Arc<Mutex<()>>,
}

impl ConfigStore {
    /// Store that persists to `path`.
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            path: Some(path),
            writes: Arc::default(),
        }
    }

    /// Store that keeps changes in memory only.
    pub fn in_memory(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            path: None,
            writes: Arc::default(),
        }
    }

    /// Current configuration, including saved changes.
    pub async fn config(&self) -> Config {
        self.config.lock().await.clone()
    }
}

#[async_trait]
impl DeviceStore for ConfigStore {
    async fn save_store(
        &self,
        identity: &DeviceIdentity,
        settings: &DeviceSettings,
    ) -> calima_core::Result<()> {
        let _write = self.writes.lock().await;
        let snapshot = {
            let mut config = self.config.lock().await;
            let device = config.find_device_mut(&identity.address).ok_or_else(|| {
                Error::Host(format!("device {} is not configured", identity.address))
            })?;
            device.mode = settings.mode;
            device.first_run = settings.first_run;
            debug!(address = %identity.address, ?settings, "Updated device settings");
            config.clone()
        };

        if let Some(path) = self.path.clone() {
            let saved = path.clone();
            tokio::task::spawn_blocking(move || snapshot.save(&saved))
                .await
                .map_err(|e| Error::Host(format!("config write task failed: {e}")))?
                .map_err(|e| Error::Host(e.to_string()))?;
            info!("Saved configuration to {}", path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use calima_types::OperatingMode;

    fn config() -> Config {
        let mut config = Config::default();
        config.devices.push(DeviceConfig {
            name: "Bathroom".to_string(),
            address: "58:2B:DB:01:02:03".to_string(),
            id: None,
            pin: Some("1234".to_string()),
            mode: Some(OperatingMode::HeatDistributionMode),
            first_run: true,
        });
        config
    }

    #[tokio::test]
    async fn test_save_store_persists_first_run() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("service.toml");
        let store = ConfigStore::new(config(), path.clone());

        let identity = config().devices[0].identity();
        let settings = DeviceSettings {
            mode: Some(OperatingMode::HeatDistributionMode),
            first_run: false,
        };
        store.save_store(&identity, &settings).await.unwrap();

        assert!(!store.config().await.devices[0].first_run);
        let loaded = Config::load(&path).unwrap();
        assert!(!loaded.devices[0].first_run);
        assert_eq!(loaded.devices[0].pin.as_deref(), Some("1234"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_config_readable_during_save() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("service.toml");
        let store = ConfigStore::new(config(), path.clone());
        let identity = config().devices[0].identity();

        let saves = (0..4).map(|i| {
            let store = store.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                let settings = DeviceSettings {
                    mode: Some(OperatingMode::MultiMode),
                    first_run: i % 2 == 0,
                };
                store.save_store(&identity, &settings).await
            })
        });
        let readers = (0..4).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.config().await.devices.len() })
        });

        for save in futures::future::join_all(saves).await {
            save.unwrap().unwrap();
        }
        for reader in futures::future::join_all(readers).await {
            assert_eq!(reader.unwrap(), 1);
        }

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.devices[0].mode, Some(OperatingMode::MultiMode));
        assert_eq!(
            loaded.devices[0].first_run,
            store.config().await.devices[0].first_run
        );
    }

    #[tokio::test]
    async fn test_unknown_device_is_an_error() {
        let store = ConfigStore::in_memory(Config::default());
        let identity = DeviceIdentity::new("58:2B:DB:09:09:09", "58:2B:DB:09:09:09", None);

        let result = store
            .save_store(&identity, &DeviceSettings::default())
            .await;
        assert!(matches!(result, Err(Error::Host(_))));
    }
}
