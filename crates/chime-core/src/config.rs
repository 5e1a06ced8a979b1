//! Configuration loading and validation.
//!
//! JSON5 format. Config location: `~/.chime/chime.json`, overridable with
//! the `CHIME_CONFIG_DIR` environment variable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Client-side settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// Server-side settings.
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if an existing config cannot be read or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("chime.json")
    }

    /// Get the Chime state directory.
    ///
    /// Uses `CHIME_CONFIG_DIR` if set, otherwise `~/.chime`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("CHIME_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".chime")
        } else {
            PathBuf::from(".chime")
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_port == 0 {
            return Err(ConfigError::Validation(
                "Server listen port cannot be 0".to_string(),
            ));
        }
        if self.client.call_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "Client call timeout cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// How long a synchronous call waits for its response, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

const fn default_call_timeout_ms() -> u64 {
    5000
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Host to bind.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind_host: default_bind_host(),
        }
    }
}

const fn default_listen_port() -> u16 {
    6161
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.call_timeout_ms, 5000);
        assert_eq!(config.server.listen_port, 6161);
        assert_eq!(config.server.bind_host, "127.0.0.1");
    }

    #[test]
    fn test_config_roundtrip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("chime.json");

        let mut config = Config::default();
        config.client.call_timeout_ms = 750;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.client.call_timeout_ms, 750);
    }

    #[test]
    fn test_json5_parsing() {
        let content = r#"{
            // comments are allowed
            client: {
                callTimeoutMs: 250,
            },
            server: {
                listenPort: 9000, // trailing comma
            },
        }"#;

        let config: Config = json5::from_str(content).unwrap();
        assert_eq!(config.client.call_timeout_ms, 250);
        assert_eq!(config.server.listen_port, 9000);
    }

    #[test]
    fn test_config_validation_rejects_port_zero() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("chime.json");
        std::fs::write(&path, r#"{ server: { listenPort: 0 } }"#).unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Validation(_))
        ));
    }
}
