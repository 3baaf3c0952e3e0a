/// Configuration management for the SiriDB HTTP gateway

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::address::{self, ServerAddress};
use crate::core::backend::Credentials;
use crate::core::session::AuthSettings;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SiriDB database and connection settings
    pub database: DatabaseConfig,
    /// HTTP and socket server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SiriDB database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub dbname: String,
    /// Comma separated server list, e.g. `siridb01:9000,siridb02:9000`
    pub servers: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host or IP to listen on
    pub listen_addr: String,
    pub port: u16,
    pub require_authentication: bool,
    /// Serve the WebSocket event channel at `/socket`
    pub enable_socket: bool,
    pub enable_multi_user: bool,
    /// Cookie session lifetime in seconds
    pub cookie_max_age: u64,
    /// Insert timeout in seconds
    pub insert_timeout: u64,
    /// Default query timeout in seconds
    pub query_timeout: u64,
    /// Shared secret accepted in `Authorization: Secret <value>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            user: "iris".to_string(),
            password: "siri".to_string(),
            dbname: "dbtest".to_string(),
            servers: "localhost:9000".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 8080,
            require_authentication: true,
            enable_socket: true,
            enable_multi_user: false,
            cookie_max_age: 604800,
            insert_timeout: 60,
            query_timeout: 60,
            secret: None,
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
    /// `host:port` string the listener binds to
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.contains(':') && !self.listen_addr.starts_with('[') {
            format!("[{}]:{}", self.listen_addr, self.port)
        } else {
            format!("{}:{}", self.listen_addr, self.port)
        }
    }

    pub fn cookie_max_age(&self) -> Duration {
        Duration::from_secs(self.cookie_max_age)
    }

    pub fn insert_timeout(&self) -> Duration {
        Duration::from_secs(self.insert_timeout)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            require_auth: self.require_authentication,
            multi_user: self.enable_multi_user,
            secret: self.secret.clone(),
        }
    }
}

impl DatabaseConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.user.clone(), self.password.clone())
    }

    /// Resolve the server list into addresses
    pub fn addresses(&self) -> Result<Vec<ServerAddress>, ConfigError> {
        address::resolve(&self.servers).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.user.is_empty() {
            return Err(ConfigError::ValidationError(
                "database user cannot be empty".to_string(),
            ));
        }

        if self.database.dbname.is_empty() {
            return Err(ConfigError::ValidationError(
                "database dbname cannot be empty".to_string(),
            ));
        }

        self.database.addresses()?;

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "port must be greater than 0".to_string(),
            ));
        }

        if self.server.cookie_max_age == 0 {
            return Err(ConfigError::ValidationError(
                "cookie_max_age must be greater than 0".to_string(),
            ));
        }

        if self.server.insert_timeout == 0 {
            return Err(ConfigError::ValidationError(
                "insert_timeout must be greater than 0".to_string(),
            ));
        }

        if self.server.query_timeout == 0 {
            return Err(ConfigError::ValidationError(
                "query_timeout must be greater than 0".to_string(),
            ));
        }

        if matches!(self.server.secret.as_deref(), Some("")) {
            return Err(ConfigError::ValidationError(
                "secret cannot be an empty string".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            database: DatabaseConfig {
                servers: "siridb01.local:9000,siridb02.local:9000".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
