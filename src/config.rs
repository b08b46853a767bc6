//! Layered configuration using Figment.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `PRINTER_BRIDGE_`
//! 2. TOML configuration file (default: `config/printer_bridge.toml`)
//! 3. Built-in defaults
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore, so single underscores
//! inside key names survive:
//!
//! ```text
//! PRINTER_BRIDGE_SERIAL__PORT=/dev/ttyACM0
//! PRINTER_BRIDGE_APPLICATION__LOG_LEVEL=debug
//! PRINTER_BRIDGE_QUEUE__INSTRUCTION_TIMEOUT_MS=20000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use printer_bridge::config::BridgeConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::load_from("config/printer_bridge.toml")?;
//!     println!("Serial port: {}", config.serial.port);
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::TimeRemainingPolicy;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/printer_bridge.toml";

/// Prefix of environment variables that override file values.
pub const ENV_PREFIX: &str = "PRINTER_BRIDGE_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Instruction queue settings
    #[serde(default)]
    pub queue: QueueSettings,
    /// Printer command settings
    #[serde(default)]
    pub commands: CommandSettings,
    /// Telemetry polling settings
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path of the printer's serial port
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Time the printer firmware needs after (re)opening the port
    #[serde(default = "default_boot_wait")]
    pub boot_wait_ms: u64,
    /// Pause between failed attempts to reopen the port
    #[serde(default = "default_reopen_backoff")]
    pub reopen_backoff_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            boot_wait_ms: default_boot_wait(),
            reopen_backoff_ms: default_reopen_backoff(),
        }
    }
}

/// Instruction queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Default time a sent instruction may wait for its verdict
    #[serde(default = "default_instruction_timeout")]
    pub instruction_timeout_ms: u64,
    /// Patterns marking a response line as a rejection. Group 1, when
    /// present, is the reported token.
    #[serde(default = "default_rejection_patterns")]
    pub rejection_patterns: Vec<String>,
    /// How long to wait for the `ok` that trails a rejection or pattern match
    #[serde(default = "default_rejection_ack_grace")]
    pub rejection_ack_grace_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            instruction_timeout_ms: default_instruction_timeout(),
            rejection_patterns: default_rejection_patterns(),
            rejection_ack_grace_ms: default_rejection_ack_grace(),
        }
    }
}

impl QueueSettings {
    /// Compiles the configured rejection patterns.
    pub fn compiled_rejection_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.rejection_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "Invalid rejection pattern '{}': {}",
                        pattern, e
                    ))
                })
            })
            .collect()
    }
}

/// Printer command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSettings {
    /// After this long without a verdict a G-code command is reported as accepted
    #[serde(default = "default_ack_window")]
    pub ack_window_ms: u64,
    /// Upper bound for slow G-codes (homing, heating) to finish
    #[serde(default = "default_long_gcode_timeout")]
    pub long_gcode_timeout_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            ack_window_ms: default_ack_window(),
            long_gcode_timeout_ms: default_long_gcode_timeout(),
        }
    }
}

/// Telemetry polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Interval between polling rounds
    #[serde(default = "default_telemetry_interval")]
    pub interval_ms: u64,
    /// G-codes sent each round
    #[serde(default = "default_telemetry_gcodes")]
    pub gcodes: Vec<String>,
    /// Which remaining-time estimate to report
    #[serde(default)]
    pub time_remaining_mode: TimeRemainingPolicy,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            interval_ms: default_telemetry_interval(),
            gcodes: default_telemetry_gcodes(),
            time_remaining_mode: TimeRemainingPolicy::default(),
        }
    }
}

// ============================================================================
// Default Value Functions
// ============================================================================

fn default_name() -> String {
    "printer_bridge".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "/dev/ttyAMA0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_boot_wait() -> u64 {
    8000
}

fn default_reopen_backoff() -> u64 {
    2000
}

fn default_instruction_timeout() -> u64 {
    10_000
}

fn default_rejection_patterns() -> Vec<String> {
    vec!["(Unknown command)".to_string()]
}

fn default_rejection_ack_grace() -> u64 {
    1000
}

fn default_ack_window() -> u64 {
    2000
}

fn default_long_gcode_timeout() -> u64 {
    120_000
}

fn default_telemetry_interval() -> u64 {
    2000
}

fn default_telemetry_gcodes() -> Vec<String> {
    ["M105", "M114", "PRUSA FAN", "M27", "M73"]
        .iter()
        .map(|g| g.to_string())
        .collect()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl BridgeConfig {
    /// Load configuration from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(BridgeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.port.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "serial.port must not be empty".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial.baud_rate must be positive".to_string(),
            ));
        }
        if self.serial.reopen_backoff_ms == 0 {
            return Err(ConfigError::ValidationError(
                "serial.reopen_backoff_ms must be positive".to_string(),
            ));
        }

        if self.queue.instruction_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "queue.instruction_timeout_ms must be positive".to_string(),
            ));
        }
        self.queue.compiled_rejection_patterns()?;

        if self.commands.long_gcode_timeout_ms < self.commands.ack_window_ms {
            return Err(ConfigError::ValidationError(
                "commands.long_gcode_timeout_ms must not be shorter than commands.ack_window_ms"
                    .to_string(),
            ));
        }

        if self.telemetry.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "telemetry.interval_ms must be positive".to_string(),
            ));
        }
        if let Some(blank) = self.telemetry.gcodes.iter().find(|g| g.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "telemetry.gcodes contains a blank entry: {:?}",
                blank
            )));
        }

        Ok(())
    }
}

impl SerialConfig {
    /// Boot wait as a duration
    pub fn boot_wait(&self) -> Duration {
        Duration::from_millis(self.boot_wait_ms)
    }

    /// Reopen backoff as a duration
    pub fn reopen_backoff(&self) -> Duration {
        Duration::from_millis(self.reopen_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.port, "/dev/ttyAMA0");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.queue.rejection_patterns, vec!["(Unknown command)"]);
        assert_eq!(config.telemetry.gcodes.len(), 5);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = BridgeConfig::default();
        config.application.log_level = "loud".to_string();

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_invalid_rejection_pattern() {
        let mut config = BridgeConfig::default();
        config.queue.rejection_patterns = vec!["(unclosed".to_string()];

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("(unclosed"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = BridgeConfig::default();
        config.queue.instruction_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[serial]
port = "/dev/ttyACM0"
boot_wait_ms = 0

[telemetry]
gcodes = ["M105"]
time_remaining_mode = "normal"
"#
        )
        .unwrap();

        let config = BridgeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.boot_wait(), Duration::ZERO);
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.telemetry.gcodes, vec!["M105"]);
        assert_eq!(
            config.telemetry.time_remaining_mode,
            TimeRemainingPolicy::Normal
        );
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.serial.reopen_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[serial\nport = ").unwrap();

        let result = BridgeConfig::load_from(file.path());
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }
}
