//! Device client configuration
//!
//! Loaded from TOML. Secrets may be given inline or through environment
//! variables (`*_env` fields), which are resolved at load time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Maximum length of a device name read back from storage
pub const STORED_DEVICE_NAME_CAPACITY: usize = 11;

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    /// Claiming is disabled when this section is absent
    pub claim: Option<ClaimSection>,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Device identity used for provisioning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device name sent with the provisioning request. Falls back to the
    /// stored `device_name` key when absent.
    pub name: Option<String>,
    /// Provisioning key shared by the device profile
    #[serde(default)]
    pub provision_key: String,
    /// Provisioning secret shared by the device profile
    #[serde(default)]
    pub provision_secret: String,
    /// Environment variable overriding `provision_secret`
    pub provision_secret_env: Option<String>,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Fixed delay between transport reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Delay before reconnecting with a freshly provisioned token
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Bounded wait for the session lock when publishing telemetry
    #[serde(default = "default_telemetry_lock_timeout_ms")]
    pub telemetry_lock_timeout_ms: u64,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_reconnect_interval_ms() -> u64 {
    2000
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_telemetry_lock_timeout_ms() -> u64 {
    1000
}

/// One-time claim announcement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimSection {
    #[serde(default)]
    pub secret_key: String,
    /// Environment variable overriding `secret_key`
    pub secret_key_env: Option<String>,
    #[serde(default = "default_claim_duration_ms")]
    pub duration_ms: u64,
}

fn default_claim_duration_ms() -> u64 {
    60_000
}

/// Credential persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("tb-device/credentials.json")
}

/// Sampling loop settings for the `tb-device` binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_telemetry_interval_secs")]
    pub interval_secs: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: default_telemetry_interval_secs(),
        }
    }
}

fn default_telemetry_interval_secs() -> u64 {
    5
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No device name configured and none stored")]
    MissingDeviceName,
}

impl DeviceConfig {
    /// Load configuration from a TOML file, resolve secrets and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text, resolve secrets and validate
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: DeviceConfig = toml::from_str(content)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(name) = &self.device.provision_secret_env {
            self.device.provision_secret = Self::get_env_var_required(name)?;
        }
        if let Some(claim) = self.claim.as_mut() {
            if let Some(name) = &claim.secret_key_env {
                claim.secret_key = Self::get_env_var_required(name)?;
            }
        }
        Ok(())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Check the configuration for values the client cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.device.name {
            if name.is_empty() {
                return Err(invalid("device.name must not be empty"));
            }
        }
        if self.device.provision_key.is_empty() {
            return Err(invalid("device.provision_key must not be empty"));
        }
        if self.device.provision_secret.is_empty() {
            return Err(invalid("device.provision_secret must not be empty"));
        }

        validate_broker_url(&self.mqtt.broker_url)?;

        if self.mqtt.keep_alive_secs == 0 {
            return Err(invalid("mqtt.keep_alive_secs must be greater than zero"));
        }
        if self.mqtt.reconnect_interval_ms == 0 {
            return Err(invalid("mqtt.reconnect_interval_ms must be greater than zero"));
        }
        if self.mqtt.telemetry_lock_timeout_ms == 0 {
            return Err(invalid(
                "mqtt.telemetry_lock_timeout_ms must be greater than zero",
            ));
        }

        if let Some(claim) = &self.claim {
            if claim.secret_key.is_empty() {
                return Err(invalid("claim.secret_key must not be empty"));
            }
        }

        if self.telemetry.interval_secs == 0 {
            return Err(invalid("telemetry.interval_secs must be greater than zero"));
        }

        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt.reconnect_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.mqtt.restart_delay_ms)
    }

    pub fn telemetry_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt.telemetry_lock_timeout_ms)
    }

    /// Copy of the configuration with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.device.provision_secret = "***".to_string();
        if let Some(claim) = copy.claim.as_mut() {
            claim.secret_key = "***".to_string();
        }
        copy
    }

    /// Minimal configuration for unit tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
name = "test-device"
provision_key = "test-key"
provision_secret = "test-secret"

[mqtt]
broker_url = "mqtt://localhost:1883"

[claim]
secret_key = "abcd1234"
duration_ms = 60000
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}

/// Broker URL must parse, carry a host and use `mqtt` or `mqtts`
pub fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.broker_url '{broker_url}': {e}")))?;

    if !matches!(url.scheme(), "mqtt" | "mqtts") {
        return Err(ConfigError::InvalidConfig(format!(
            "mqtt.broker_url scheme must be mqtt or mqtts, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidConfig(format!(
            "mqtt.broker_url '{broker_url}' has no host"
        )));
    }

    Ok(())
}
