//! Configuration file loading and parsing.
//!
//! # Configuration File Locations
//!
//! 1. Path given as the `CONFIG_FILE` argument. It must exist.
//! 2. Default location, used only if present:
//!    - **Linux/macOS:** `~/.mcp-lite/config.json`
//!    - **Windows:** `%USERPROFILE%\.mcp-lite\config.json`
//!
//! Without either file the built-in defaults apply.
//!
//! # Example Configuration
//!
//! ```json
//! {
//!     "server": { "name": "mcp-lite", "instructions": "Try swift_echo" },
//!     "session": { "max_consecutive_decode_errors": 8, "request_timeout_secs": 30 },
//!     "logging": { "level": "info" }
//! }
//! ```

mod settings;

pub use settings::{Config, LoggingConfig, ServerConfig, SessionConfig, LOG_LEVELS};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.mcp-lite/`
/// - **Windows:** `%USERPROFILE%\.mcp-lite\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".mcp-lite"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads, parses and validates the configuration.
///
/// If `path` is `None`, the default location is tried and a missing file
/// yields [`Config::default`].
///
/// # Errors
///
/// Returns an error if:
/// - An explicitly given file does not exist
/// - The file cannot be read
/// - The JSON is malformed or has unknown keys
/// - A setting fails validation
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::NotFound {
                    path: p.to_path_buf(),
                });
            }
            p.to_path_buf()
        }
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(Config::default()),
        },
    };

    load_file(&config_path)
}

fn load_file(config_path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.to_path_buf(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: config_path.to_path_buf(),
        source: e,
    })?;

    config.validate()?;

    Ok(config)
}
