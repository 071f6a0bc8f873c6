//! Configuration system for the Optex dispatcher
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (OPTEX_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Main dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker executable trust policy
    pub security: SecuritySettings,

    /// Ephemeral worker lifecycle settings
    pub launch: LaunchSettings,

    /// Persistent worker connection settings
    pub connect: ConnectSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Worker executable trust policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Require worker executables to be under /usr, or owned by the
    /// invoking user and located in their home directory
    pub secure: bool,
}

/// Ephemeral worker lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// Grace window in milliseconds for a worker to exit on its own
    /// after delivering its response
    pub response_linger_ms: u64,

    /// Time in milliseconds between SIGTERM and SIGKILL when tearing
    /// a worker down
    pub terminate_grace_ms: u64,
}

/// Persistent worker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectSettings {
    /// Maximum connection attempts before giving up
    pub attempts: u32,

    /// Pause between connection attempts in milliseconds
    pub retry_interval_ms: u64,

    /// Timeout for a single connection attempt in milliseconds
    pub timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            security: SecuritySettings::default(),
            launch: LaunchSettings::default(),
            connect: ConnectSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self { secure: true }
    }
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            response_linger_ms: 2000,
            terminate_grace_ms: 200,
        }
    }
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            attempts: 20,
            retry_interval_ms: 200,
            timeout_ms: 5000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json_format: false,
        }
    }
}

impl LaunchSettings {
    /// Post-response grace window as a Duration
    pub fn response_linger(&self) -> Duration {
        Duration::from_millis(self.response_linger_ms)
    }

    /// SIGTERM-to-SIGKILL grace as a Duration
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl ConnectSettings {
    /// Pause between connection attempts as a Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Single-attempt timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl DispatchConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::ConfigNotFound {
                path: path.clone(),
                source: Some(e),
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());
            if path.exists() {
                return Ok(Some(path));
            } else {
                return Err(Error::config_not_found(path));
            }
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("optex-dispatch.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("optex-dispatch").join("config.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".optex").join("dispatch.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/optex/dispatch.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Security settings
        if let Ok(val) = std::env::var("OPTEX_SECURE") {
            self.security.secure = val.to_lowercase() == "true" || val == "1";
        }

        // Launch settings
        if let Ok(val) = std::env::var("OPTEX_RESPONSE_LINGER_MS") {
            if let Ok(n) = val.parse() {
                self.launch.response_linger_ms = n;
            }
        }
        if let Ok(val) = std::env::var("OPTEX_TERMINATE_GRACE_MS") {
            if let Ok(n) = val.parse() {
                self.launch.terminate_grace_ms = n;
            }
        }

        // Connect settings
        if let Ok(val) = std::env::var("OPTEX_CONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.connect.attempts = n;
            }
        }
        if let Ok(val) = std::env::var("OPTEX_CONNECT_RETRY_MS") {
            if let Ok(n) = val.parse() {
                self.connect.retry_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("OPTEX_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.connect.timeout_ms = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("OPTEX_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("OPTEX_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("OPTEX_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.connect.attempts == 0 {
            return Err(Error::config_field_invalid(
                "connect.attempts",
                "must be at least 1",
            ));
        }

        if self.connect.timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "connect.timeout_ms",
                "must be nonzero",
            ));
        }

        if self.launch.response_linger_ms == 0 {
            return Err(Error::config_field_invalid(
                "launch.response_linger_ms",
                "must be nonzero",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "invalid level '{}', must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<()> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".optex")
                .join("dispatch.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::config_validation(format!("Failed to create config directory: {}", e))
        })?;
    }

    // Generate default config with comments
    let config_content = generate_default_config();

    // Write the file
    fs::write(&config_path, config_content)
        .map_err(|e| Error::config_validation(format!("Failed to write config file: {}", e)))?;

    println!("Configuration file created: {}", config_path.display());
    Ok(())
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# Optex Dispatcher Configuration
# https://github.com/optex-framework/dispatch

[security]
# Require worker executables to be under /usr, or owned by the invoking
# user and located in their home directory
secure = true

[launch]
# Grace window in milliseconds for an ephemeral worker to exit on its
# own after delivering its response
response_linger_ms = 2000

# Time in milliseconds between SIGTERM and SIGKILL when tearing a
# worker down
terminate_grace_ms = 200

[connect]
# Maximum attempts to reach a persistent worker before giving up
attempts = 20

# Pause between connection attempts in milliseconds
retry_interval_ms = 200

# Timeout for a single connection attempt in milliseconds
timeout_ms = 5000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.optex/logs/dispatch.log"

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
