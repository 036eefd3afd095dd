//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.
//! Every section is optional; an empty object yields the defaults.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mcp::session::SessionOptions;
use crate::mcp::types::Implementation;

/// Log levels accepted in `logging.level`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Root configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Server identity.
    #[serde(default)]
    pub server: ServerConfig,

    /// Session tunables.
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "server.name must not be empty".to_string(),
            });
        }

        if self.session.max_consecutive_decode_errors == 0 {
            return Err(ConfigError::ValidationError {
                message: "session.max_consecutive_decode_errors must be at least 1".to_string(),
            });
        }

        if self.session.request_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError {
                message: "session.request_timeout_secs must be at least 1 when set".to_string(),
            });
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }

        Ok(())
    }
}

/// Identity the server announces during the handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Server name. Default: `mcp-lite`.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Server version. Default: the crate version.
    #[serde(default = "default_server_version")]
    pub version: String,

    /// Usage hints returned to clients.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl ServerConfig {
    /// Returns the implementation info announced to clients.
    #[must_use]
    pub fn implementation(&self) -> Implementation {
        Implementation::new(&self.name, &self.version)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
            instructions: None,
        }
    }
}

fn default_server_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Session engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Undecodable frames in a row before the session gives up. Default: 8
    #[serde(default = "default_max_decode_errors")]
    pub max_consecutive_decode_errors: u32,

    /// Deadline for requests sent by the client facade, in seconds.
    /// Unset means wait indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl SessionConfig {
    /// Session engine options derived from these settings.
    #[must_use]
    pub const fn options(&self) -> SessionOptions {
        SessionOptions {
            max_consecutive_decode_errors: self.max_consecutive_decode_errors,
        }
    }

    /// The request deadline, if one is configured.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_consecutive_decode_errors: default_max_decode_errors(),
            request_timeout_secs: None,
        }
    }
}

const fn default_max_decode_errors() -> u32 {
    8
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
