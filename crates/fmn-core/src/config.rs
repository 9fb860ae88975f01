use std::path::Path;

use fmn_proto::adv::BatteryState;
use fmn_proto::validation::sizes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::conn::MAX_CONNECTIONS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Upper bound for the Nearby -> Separated timeout.
pub const MAX_NEARBY_TIMEOUT_SECS: u16 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessoryConfig {
    // Connection admission
    pub max_connections: u8,
    pub security_timeout_secs: u64,

    // State machine timers
    pub nearby_timeout_secs: u16, // 0 = straight to Separated
    pub pairing_mode_timeout_secs: u64, // 0 = never expires
    pub pairing_mode_auto_enter: bool,
    pub key_rotation_period_secs: u64,
    pub persistent_reconnect_fast_adv_secs: u64,
    pub enable_timeout_secs: u64,

    // Product identity
    pub battery_level: u8, // 0 full .. 3 critically low
    pub product_data: String, // hex, 8 bytes
    pub category: String,     // hex, 8 bytes
    pub fw_version: u32,

    pub server_keys: Option<ServerKeysConfig>,
}

/// Server public keys, uncompressed P-256, hex encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerKeysConfig {
    pub encryption_key: String,
    pub signature_key: String,
}

/// Decoded server keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeys {
    pub encryption_key: [u8; sizes::SERVER_PUBLIC_KEY],
    pub signature_key: [u8; sizes::SERVER_PUBLIC_KEY],
}

/// Product identity reported during pairing and in unpaired advertising.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductInfo {
    pub product_data: [u8; sizes::PRODUCT_DATA],
    pub category: [u8; sizes::CATEGORY],
    pub fw_version: u32,
}

impl Default for AccessoryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            security_timeout_secs: 5,
            nearby_timeout_secs: 30,
            pairing_mode_timeout_secs: 600, // 10 minutes
            pairing_mode_auto_enter: true,
            key_rotation_period_secs: 900, // 15 minutes
            persistent_reconnect_fast_adv_secs: 3,
            enable_timeout_secs: 60,
            battery_level: 0,
            product_data: "0000000000000000".to_string(),
            category: "0100000000000000".to_string(),
            fw_version: 0x0001_0000,
            server_keys: None,
        }
    }
}

fn decode_hex<const N: usize>(field: &str, value: &str) -> Result<[u8; N], ConfigError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| ConfigError::ValidationError(format!("{field}: {e}")))?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        ConfigError::ValidationError(format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

impl ServerKeysConfig {
    pub fn decode(&self) -> Result<ServerKeys, ConfigError> {
        let encryption_key = decode_hex("server_keys.encryption_key", &self.encryption_key)?;
        let signature_key = decode_hex("server_keys.signature_key", &self.signature_key)?;
        for (name, key) in [("encryption_key", &encryption_key), ("signature_key", &signature_key)] {
            fmn_crypto::ec::import_p256_point(key).map_err(|_| {
                ConfigError::ValidationError(format!("server_keys.{name} is not a valid P-256 point"))
            })?;
        }
        Ok(ServerKeys {
            encryption_key,
            signature_key,
        })
    }
}

impl AccessoryConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(e.to_string()))?;

        let config: AccessoryConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        info!(path = %path.display(), "loaded accessory config");
        Ok(config)
    }

    pub fn load_from_env() -> Self {
        Self::default().apply_env()
    }

    /// Override fields from `FMN_*` environment variables.
    pub fn apply_env(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            let raw = std::env::var(name).ok()?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(var = name, value = %raw, "ignoring unparsable environment override");
                    None
                }
            }
        }

        if let Some(v) = parsed("FMN_MAX_CONNECTIONS") {
            self.max_connections = v;
        }
        if let Some(v) = parsed("FMN_NEARBY_TIMEOUT_SECS") {
            self.nearby_timeout_secs = v;
        }
        if let Some(v) = parsed("FMN_PAIRING_MODE_TIMEOUT_SECS") {
            self.pairing_mode_timeout_secs = v;
        }
        if let Some(v) = parsed("FMN_PAIRING_MODE_AUTO_ENTER") {
            self.pairing_mode_auto_enter = v;
        }
        if let Some(v) = parsed("FMN_KEY_ROTATION_PERIOD_SECS") {
            self.key_rotation_period_secs = v;
        }
        if let Some(v) = parsed("FMN_BATTERY_LEVEL") {
            self.battery_level = v;
        }
        if let (Ok(enc), Ok(sig)) = (
            std::env::var("FMN_SERVER_ENCRYPTION_KEY"),
            std::env::var("FMN_SERVER_SIGNATURE_KEY"),
        ) {
            self.server_keys = Some(ServerKeysConfig {
                encryption_key: enc,
                signature_key: sig,
            });
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 || self.max_connections as usize > MAX_CONNECTIONS {
            return Err(ConfigError::ValidationError(format!(
                "max_connections must be between 1 and {MAX_CONNECTIONS}"
            )));
        }
        if self.nearby_timeout_secs > MAX_NEARBY_TIMEOUT_SECS {
            return Err(ConfigError::ValidationError(format!(
                "nearby_timeout_secs must be at most {MAX_NEARBY_TIMEOUT_SECS}"
            )));
        }
        if self.key_rotation_period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "key_rotation_period_secs must be at least 1".to_string(),
            ));
        }
        if self.security_timeout_secs == 0 || self.enable_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "security and enable timeouts must be at least 1 second".to_string(),
            ));
        }
        self.battery()?;
        self.product_data()?;
        self.category()?;
        self.server_keys()?;
        Ok(())
    }

    pub fn battery(&self) -> Result<BatteryState, ConfigError> {
        BatteryState::from_u8(self.battery_level).ok_or_else(|| {
            ConfigError::ValidationError("battery_level must be between 0 and 3".to_string())
        })
    }

    pub fn product_data(&self) -> Result<[u8; sizes::PRODUCT_DATA], ConfigError> {
        decode_hex("product_data", &self.product_data)
    }

    pub fn category(&self) -> Result<[u8; sizes::CATEGORY], ConfigError> {
        decode_hex("category", &self.category)
    }

    pub fn product_info(&self) -> Result<ProductInfo, ConfigError> {
        Ok(ProductInfo {
            product_data: self.product_data()?,
            category: self.category()?,
            fw_version: self.fw_version,
        })
    }

    pub fn server_keys(&self) -> Result<ServerKeys, ConfigError> {
        self.server_keys
            .as_ref()
            .ok_or_else(|| ConfigError::ValidationError("server_keys are required".to_string()))?
            .decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TestServer;

    fn with_keys() -> AccessoryConfig {
        AccessoryConfig {
            server_keys: Some(TestServer::new(1).keys_config()),
            ..AccessoryConfig::default()
        }
    }

    #[test]
    fn test_defaults_need_server_keys() {
        let config = AccessoryConfig::default();
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.nearby_timeout_secs, 30);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
        assert!(with_keys().validate().is_ok());
    }

    #[test]
    fn test_ranges_are_enforced() {
        let mut config = with_keys();
        config.max_connections = 21;
        assert!(config.validate().is_err());

        let mut config = with_keys();
        config.nearby_timeout_secs = 3601;
        assert!(config.validate().is_err());

        let mut config = with_keys();
        config.battery_level = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_server_key_rejected() {
        let mut config = with_keys();
        if let Some(keys) = config.server_keys.as_mut() {
            keys.encryption_key = "04".repeat(65);
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let config = with_keys();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accessory.toml");
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = AccessoryConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.server_keys().unwrap(), config.server_keys().unwrap());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let loaded: AccessoryConfig = toml::from_str("nearby_timeout_secs = 0").unwrap();
        assert_eq!(loaded.nearby_timeout_secs, 0);
        assert_eq!(loaded.key_rotation_period_secs, 900);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AccessoryConfig::load_from_file(Path::new("/nonexistent/fmn.toml")),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
