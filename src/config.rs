//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::EchoPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broadcast relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether the sender of a frame also receives it
    #[serde(default)]
    pub echo: EchoPolicy,

    /// Frames queued per connection before it is treated as a failed target
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Drop connections that send nothing, not even a pong to the relay's
    /// pings, for this long. Unset disables the check.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_outbound_buffer() -> usize {
    1024
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            echo: EchoPolicy::default(),
            outbound_buffer: default_outbound_buffer(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            idle_timeout_secs: None,
        }
    }
}

impl RelayConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("sensor-relay").join("config.toml")),
            Some(PathBuf::from("/etc/sensor-relay/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Relay overrides
        if let Some(host) = lookup("SENSOR_RELAY_HOST") {
            self.relay.host = host;
        }
        if let Some(port) = lookup("SENSOR_RELAY_PORT") {
            match port.parse() {
                Ok(p) => self.relay.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid SENSOR_RELAY_PORT"),
            }
        }
        if let Some(echo) = lookup("SENSOR_RELAY_ECHO") {
            match echo.parse() {
                Ok(policy) => self.relay.echo = policy,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid SENSOR_RELAY_ECHO"),
            }
        }

        // Logging overrides
        if let Some(level) = lookup("SENSOR_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("SENSOR_RELAY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Sensor Relay Configuration
#
# Environment variables override these settings:
# - SENSOR_RELAY_HOST
# - SENSOR_RELAY_PORT
# - SENSOR_RELAY_ECHO
# - SENSOR_RELAY_LOG_LEVEL
# - SENSOR_RELAY_LOG_FORMAT

[relay]
# Interface to listen on
host = "0.0.0.0"

# WebSocket port
port = 8080

# Who receives a frame: "all" (sender included) or "except_sender"
echo = "all"

# Frames queued per connection before a slow consumer is disconnected
outbound_buffer = 1024

# Maximum number of simultaneous connections
max_connections = 1000

# Largest accepted inbound frame (bytes)
max_message_size = 65536

# Disconnect peers that send nothing, not even a pong, for this many seconds.
# The relay pings every peer twice per window while this is set.
# idle_timeout_secs = 300

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let config = Config::default();
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.relay.addr(), "0.0.0.0:8080");
        assert_eq!(config.relay.echo, EchoPolicy::All);
        assert!(config.relay.idle_timeout().is_none());
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_generated_config_parses() {
        let config = Config::parse(&generate_default_config()).unwrap();
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.relay.outbound_buffer, 1024);
        assert_eq!(config.relay.max_message_size, 65536);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::parse(
            r#"
            [relay]
            port = 9001
            echo = "except_sender"
            idle_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.port, 9001);
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.relay.echo, EchoPolicy::ExceptSender);
        assert_eq!(config.relay.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_idle_timeout_disables_check() {
        let config = Config::parse("[relay]\nidle_timeout_secs = 0\n").unwrap();
        assert!(config.relay.idle_timeout().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nhost = \"127.0.0.1\"\nport = 7000").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.relay.addr(), "127.0.0.1:7000");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/sensor-relay.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay\nport = ").unwrap();

        let result = Config::load(file.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SENSOR_RELAY_HOST", "127.0.0.1"),
            ("SENSOR_RELAY_PORT", "9100"),
            ("SENSOR_RELAY_ECHO", "except_sender"),
            ("SENSOR_RELAY_LOG_FORMAT", "json"),
        ]);

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.relay.addr(), "127.0.0.1:9100");
        assert_eq!(config.relay.echo, EchoPolicy::ExceptSender);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_overrides_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "SENSOR_RELAY_PORT" => Some("not-a-port".to_string()),
            "SENSOR_RELAY_ECHO" => Some("sometimes".to_string()),
            _ => None,
        });

        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.relay.echo, EchoPolicy::All);
    }
}
