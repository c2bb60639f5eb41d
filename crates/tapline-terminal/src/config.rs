//! # Terminal Configuration
//!
//! Configuration for the backend client, reader discovery, reader
//! connection and payments.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TAPLINE_BACKEND_URL=https://pay.example.com                        │
//! │     TAPLINE_DISCOVERY_METHOD=internet                                  │
//! │     TAPLINE_SIMULATED=false                                            │
//! │     TAPLINE_CURRENCY=eur                                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/terminal/terminal.toml (Linux)                           │
//! │     ~/Library/Application Support/tech.tapline.terminal/terminal.toml  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Emulator loopback backend, simulated internet readers, CZK         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [backend]
//! url = "http://10.0.2.2:4567"
//! request_timeout_secs = 30
//!
//! [discovery]
//! method = "internet"
//! simulated = true
//! timeout_secs = 0
//!
//! [connection]
//! fail_if_in_use = true
//! connect_timeout_secs = 0
//!
//! [payment]
//! currency = "czk"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use tapline_core::DEFAULT_CURRENCY;

use crate::error::{SessionError, SessionResult};
use crate::sdk::{ConnectionConfig, DiscoveryConfig, DiscoveryMethod};

// =============================================================================
// Backend Settings
// =============================================================================

/// Merchant backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL of the merchant backend.
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_backend_url() -> String {
    // Host loopback as seen from the Android emulator the demo backend targets.
    "http://10.0.2.2:4567".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            url: default_backend_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Discovery Settings
// =============================================================================

/// Reader discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default)]
    pub method: DiscoveryMethod,

    /// Use simulated readers.
    #[serde(default = "default_true")]
    pub simulated: bool,

    /// Scan duration passed to the SDK (seconds). 0 scans until cancelled.
    #[serde(default)]
    pub timeout_secs: u32,
}

fn default_true() -> bool {
    true
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            method: DiscoveryMethod::default(),
            simulated: true,
            timeout_secs: 0,
        }
    }
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Reader connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_true")]
    pub fail_if_in_use: bool,

    /// Upper bound on a single connect attempt (seconds). 0 disables it.
    #[serde(default)]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            fail_if_in_use: true,
            connect_timeout_secs: 0,
        }
    }
}

// =============================================================================
// Payment Settings
// =============================================================================

/// Payment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSettings {
    /// Lowercase ISO 4217 code charged for every payment.
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

impl Default for PaymentSettings {
    fn default() -> Self {
        PaymentSettings {
            currency: default_currency(),
        }
    }
}

// =============================================================================
// Main Terminal Configuration
// =============================================================================

/// Complete terminal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub payment: PaymentSettings,
}

impl TerminalConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (terminal.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SessionResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading terminal config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load terminal config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SessionResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SessionError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Terminal config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SessionResult<()> {
        let url = Url::parse(&self.backend.url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SessionError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {}",
                self.backend.url
            )));
        }

        let currency = &self.payment.currency;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(SessionError::InvalidConfig(format!(
                "currency must be a three-letter ISO code, got: '{}'",
                currency
            )));
        }

        if self.backend.request_timeout_secs == 0 {
            return Err(SessionError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TAPLINE_BACKEND_URL") {
            debug!(url = %url, "Overriding backend URL from environment");
            self.backend.url = url;
        }

        if let Some(method) = lookup("TAPLINE_DISCOVERY_METHOD") {
            match method.parse() {
                Ok(parsed) => self.discovery.method = parsed,
                Err(_) => warn!(method = %method, "Unknown discovery method in environment"),
            }
        }

        if let Some(simulated) = lookup("TAPLINE_SIMULATED") {
            match simulated.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.discovery.simulated = true,
                "0" | "false" | "no" => self.discovery.simulated = false,
                _ => warn!(value = %simulated, "Unrecognized TAPLINE_SIMULATED value"),
            }
        }

        if let Some(currency) = lookup("TAPLINE_CURRENCY") {
            debug!(currency = %currency, "Overriding currency from environment");
            self.payment.currency = currency.to_lowercase();
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("tech", "tapline", "terminal")
            .map(|dirs| dirs.config_dir().join("terminal.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the discovery request handed to the SDK.
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            timeout_secs: self.discovery.timeout_secs,
            method: self.discovery.method,
            simulated: self.discovery.simulated,
        }
    }

    /// Returns the connection request handed to the SDK.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            fail_if_in_use: self.connection.fail_if_in_use,
        }
    }

    /// Returns the connect timeout, if one is configured.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connection.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Returns the backend request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    /// Returns the payment currency.
    pub fn currency(&self) -> &str {
        &self.payment.currency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = TerminalConfig::default();
        assert_eq!(config.backend.url, "http://10.0.2.2:4567");
        assert_eq!(config.currency(), "czk");
        assert!(config.discovery.simulated);
        assert_eq!(config.connect_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TerminalConfig::default();

        config.backend.url = "ws://localhost:4567".to_string();
        assert!(matches!(config.validate(), Err(SessionError::InvalidUrl(_))));

        config.backend.url = "not a url".to_string();
        assert!(config.validate().is_err());

        config.backend.url = "https://pay.example.com".to_string();
        assert!(config.validate().is_ok());

        config.payment.currency = "eu".to_string();
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));

        config.payment.currency = "e1r".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TAPLINE_BACKEND_URL", "https://pay.example.com"),
            ("TAPLINE_DISCOVERY_METHOD", "bluetooth_scan"),
            ("TAPLINE_SIMULATED", "false"),
            ("TAPLINE_CURRENCY", "EUR"),
        ]
        .into_iter()
        .collect();

        let mut config = TerminalConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.backend.url, "https://pay.example.com");
        assert_eq!(config.discovery.method, DiscoveryMethod::BluetoothScan);
        assert!(!config.discovery.simulated);
        assert_eq!(config.currency(), "eur");
    }

    #[test]
    fn test_partial_toml() {
        let config: TerminalConfig = toml::from_str(
            r#"
            [connection]
            connect_timeout_secs = 15
            "#,
        )
        .unwrap();

        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(15)));
        assert!(config.connection.fail_if_in_use);
        assert_eq!(config.currency(), "czk");
    }

    #[test]
    fn test_toml_serialization() {
        let config = TerminalConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[backend]"));
        assert!(toml_str.contains("[discovery]"));
        assert!(toml_str.contains("method = \"internet\""));
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let path = std::env::temp_dir().join(format!(
            "tapline-config-{}/terminal.toml",
            uuid::Uuid::new_v4()
        ));

        let mut config = TerminalConfig::default();
        config.payment.currency = "usd".to_string();
        config.save(Some(path.clone())).unwrap();

        let loaded: TerminalConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.currency(), "usd");

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
