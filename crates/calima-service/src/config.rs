//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use calima_core::driver::DiscoveryOptions;
use calima_core::{ConnectionConfig, ReconnectPolicy, ScanOptions};
use calima_types::{DeviceIdentity, DeviceRecord, DeviceSettings, OperatingMode, Pin};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sync schedule.
    pub sync: SyncConfig,
    /// Connection timeouts and retry behavior.
    pub connection: ConnectionSettings,
    /// Scan settings used by `scan` and `pair`.
    pub discovery: DiscoverySettings,
    /// Paired fans.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - The sync interval is within reasonable bounds (10s - 1 hour)
    /// - Connection timeouts and retry delays are non-zero
    /// - Device addresses are not empty and PINs are four digits
    /// - No duplicate device addresses
    ///
    /// # Example
    ///
    /// ```
    /// use calima_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.sync.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.discovery.validate());

        let mut seen_addresses = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            let addr_upper = device.address.to_uppercase();
            if !seen_addresses.insert(addr_upper) {
                errors.push(ValidationError {
                    field: format!("{}.address", prefix),
                    message: format!("duplicate device address '{}'", device.address),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    ///
    /// This is a convenience method that combines `load()` and `validate()`.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Find a device by name, address or id.
    pub fn find_device(&self, key: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.matches(key))
    }

    /// Find a device by name, address or id for editing.
    pub fn find_device_mut(&mut self, key: &str) -> Option<&mut DeviceConfig> {
        self.devices.iter_mut().find(|d| d.matches(key))
    }

    /// Add a freshly paired device, replacing any entry with the same address.
    pub fn upsert_device(&mut self, record: &DeviceRecord) {
        let device = DeviceConfig::from(record);
        match self
            .devices
            .iter_mut()
            .find(|d| d.address.eq_ignore_ascii_case(&device.address))
        {
            Some(existing) => *existing = device,
            None => self.devices.push(device),
        }
    }

    /// Records for every configured device.
    pub fn records(&self) -> Vec<DeviceRecord> {
        self.devices.iter().map(DeviceConfig::to_record).collect()
    }

    /// Identities of every configured device.
    pub fn identities(&self) -> Vec<DeviceIdentity> {
        self.devices.iter().map(DeviceConfig::identity).collect()
    }
}

/// Minimum sync interval in seconds (10 seconds).
pub const MIN_SYNC_INTERVAL: u64 = 10;
/// Maximum sync interval in seconds (1 hour).
pub const MAX_SYNC_INTERVAL: u64 = 3600;

/// Sync schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between syncs of each device.
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl SyncConfig {
    /// Interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Validate the sync schedule.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.interval_secs < MIN_SYNC_INTERVAL {
            errors.push(ValidationError {
                field: "sync.interval_secs".to_string(),
                message: format!(
                    "sync interval {} is too short (minimum {} seconds)",
                    self.interval_secs, MIN_SYNC_INTERVAL
                ),
            });
        } else if self.interval_secs > MAX_SYNC_INTERVAL {
            errors.push(ValidationError {
                field: "sync.interval_secs".to_string(),
                message: format!(
                    "sync interval {} is too long (maximum {} seconds / 1 hour)",
                    self.interval_secs, MAX_SYNC_INTERVAL
                ),
            });
        }

        errors
    }
}

/// Connection timeouts and retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Delay before the first retry of a failed connect.
    pub first_retry_secs: u64,
    /// Delay before every later retry.
    pub retry_secs: u64,
    /// Connect attempts per sync or action; 0 retries until success.
    pub max_attempts: u32,
    /// Seconds a discovered advertisement is reused before scanning again.
    pub advertisement_ttl_secs: u64,
    /// Reconnect in the background after the fan drops the link.
    pub auto_reconnect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            first_retry_secs: 10,
            retry_secs: 30,
            max_attempts: 3,
            advertisement_ttl_secs: 300,
            auto_reconnect: true,
        }
    }
}

impl ConnectionSettings {
    /// Validate connection settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let fields = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("first_retry_secs", self.first_retry_secs),
            ("retry_secs", self.retry_secs),
        ];
        fields
            .into_iter()
            .filter(|(_, value)| *value == 0)
            .map(|(name, _)| ValidationError {
                field: format!("connection.{}", name),
                message: "must be at least 1 second".to_string(),
            })
            .collect()
    }

    /// Retry behavior for each device's connection manager.
    pub fn policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::default()
            .first_retry_delay(Duration::from_secs(self.first_retry_secs))
            .retry_delay(Duration::from_secs(self.retry_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .advertisement_ttl(Duration::from_secs(self.advertisement_ttl_secs))
            .auto_reconnect(self.auto_reconnect);
        if self.max_attempts == 0 {
            ReconnectPolicy {
                max_attempts: None,
                ..policy
            }
        } else {
            policy.max_attempts(self.max_attempts)
        }
    }

    /// Timeouts for BLE links.
    pub fn link_config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .connection_timeout(Duration::from_secs(self.connect_timeout_secs))
            .read_timeout(Duration::from_secs(self.read_timeout_secs))
            .write_timeout(Duration::from_secs(self.write_timeout_secs))
    }
}

/// Scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Only advertisements whose address starts with this are considered.
    pub address_prefix: String,
    /// Seconds each scan listens.
    pub scan_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            address_prefix: calima_types::PAX_ADDRESS_PREFIX.to_string(),
            scan_secs: 5,
        }
    }
}

impl DiscoverySettings {
    /// Validate scan settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.scan_secs == 0 {
            errors.push(ValidationError {
                field: "discovery.scan_secs".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }

        errors
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions::new().duration_secs(self.scan_secs)
    }

    /// Options for a pairing discovery run.
    pub fn discovery_options(&self, connection: &ConnectionSettings) -> DiscoveryOptions {
        DiscoveryOptions::default()
            .address_prefix(self.address_prefix.clone())
            .connect_timeout(Duration::from_secs(connection.connect_timeout_secs))
    }
}

/// A paired fan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name shown in logs and status output.
    pub name: String,
    /// BLE MAC address.
    pub address: String,
    /// Advertisement identifier; defaults to the address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Four digit PIN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
    /// Operating mode read at pairing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OperatingMode>,
    /// Cleared after the first sync adjusted the device's capabilities.
    #[serde(default = "default_first_run")]
    pub first_run: bool,
}

fn default_first_run() -> bool {
    true
}

impl DeviceConfig {
    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.address", prefix),
                message: "device address cannot be empty".to_string(),
            });
        }

        if self.name.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.name", prefix),
                message: "device name cannot be empty".to_string(),
            });
        }

        if let Some(id) = &self.id
            && id.is_empty()
        {
            errors.push(ValidationError {
                field: format!("{}.id", prefix),
                message: "id cannot be empty string (use null/omit instead)".to_string(),
            });
        }

        if let Some(pin) = &self.pin
            && let Err(e) = Pin::parse(pin)
        {
            errors.push(ValidationError {
                field: format!("{}.pin", prefix),
                message: e.to_string(),
            });
        }

        errors
    }

    /// Whether `key` names this device.
    pub fn matches(&self, key: &str) -> bool {
        self.name == key || self.identity().matches(key)
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            &self.address,
            self.id.clone().unwrap_or_else(|| self.address.to_uppercase()),
            self.pin.clone(),
        )
    }

    pub fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            mode: self.mode,
            first_run: self.first_run,
        }
    }

    /// The record a [`calima_core::FanDevice`] is built from.
    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            name: self.name.clone(),
            identity: self.identity(),
            settings: self.settings(),
        }
    }
}

impl From<&DeviceRecord> for DeviceConfig {
    fn from(record: &DeviceRecord) -> Self {
        let id = (!record.identity.id.eq_ignore_ascii_case(&record.identity.address))
            .then(|| record.identity.id.clone());
        Self {
            name: record.name.clone(),
            address: record.identity.address.clone(),
            id,
            pin: record.identity.pin.clone(),
            mode: record.settings.mode,
            first_run: record.settings.first_run,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `sync.interval_secs` or `devices[0].pin`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("calima")
        .join("service.toml")
}
