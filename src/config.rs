//! Configuration management for KubeForge
//!
//! Settings are resolved from three layers:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request read timeout in seconds
    pub read_timeout_secs: u64,
    /// Response write timeout in seconds
    pub write_timeout_secs: u64,
    /// Graceful shutdown budget in seconds
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Driver name: sqlite, postgres or mysql
    pub driver: String,
    /// Driver-specific data source name
    pub dsn: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format: "text" or "json"
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout_secs: 15,
            write_timeout_secs: 15,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            dsn: "sqlite://kubeforge.db".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Config {
    /// Load configuration from an optional config file and environment variables
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file() {
            if let Ok(file_config) = Self::load_from_file(&path) {
                config = file_config;
            }
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("KUBEFORGE_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/kubeforge/config.toml")),
            Some(PathBuf::from("./kubeforge.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(secs) = std::env::var("SERVER_READ_TIMEOUT") {
            if let Ok(secs) = secs.parse() {
                self.server.read_timeout_secs = secs;
            }
        }
        if let Ok(secs) = std::env::var("SERVER_WRITE_TIMEOUT") {
            if let Ok(secs) = secs.parse() {
                self.server.write_timeout_secs = secs;
            }
        }
        if let Ok(secs) = std::env::var("SERVER_SHUTDOWN_TIMEOUT") {
            if let Ok(secs) = secs.parse() {
                self.server.shutdown_timeout_secs = secs;
            }
        }

        if let Ok(driver) = std::env::var("DB_DRIVER") {
            self.database.driver = driver;
        }
        if let Ok(dsn) = std::env::var("DB_DSN") {
            self.database.dsn = dsn;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("port cannot be 0".to_string()));
        }

        if self.database.dsn.is_empty() {
            return Err(ConfigError::Validation("database DSN cannot be empty".to_string()));
        }

        match self.database.driver.as_str() {
            "sqlite" | "postgres" | "mysql" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown database driver '{}'",
                    other
                )));
            }
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, err) => {
                write!(f, "failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.read_timeout_secs, 15);
        assert_eq!(config.server.shutdown_timeout_secs, 10);
        assert_eq!(config.database.driver, "sqlite");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let mut invalid = Config::default();
        invalid.server.port = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = Config::default();
        invalid.database.driver = "oracle".to_string();
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("[server]"));
        assert!(rendered.contains("[database]"));
        assert!(rendered.contains("[logging]"));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.database.dsn, config.database.dsn);
    }

    #[test]
    fn test_timeout_durations() {
        let server = ServerConfig::default();
        assert_eq!(server.read_timeout(), Duration::from_secs(15));
        assert_eq!(server.shutdown_timeout(), Duration::from_secs(10));
    }
}
