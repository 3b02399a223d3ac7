//! Configuration system for the Prism sensor
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation
//!
//! The loaded [`SensorConfig`] is built once at startup and is not mutated
//! afterwards; every stage receives a read-only view of it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor settings
    pub sensor: SensorSettings,

    /// Capture settings
    pub capture: CaptureSettings,

    /// Storage settings
    pub storage: StorageSettings,

    /// Read loop and dispatch queue settings
    pub pipeline: PipelineSettings,
}

impl SensorConfig {
    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Debug mode: debug logging plus payload previews
    pub debug: bool,

    /// Verbose output
    pub verbose: bool,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug: false,
            verbose: false,
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Network interface to tap
    pub interface: String,

    /// Directory holding the compiled probe objects.
    /// Only consulted when the probes were not embedded at build time.
    pub probe_dir: Option<String>,

    /// Pages per CPU for the perf buffer transport (power of two)
    pub perf_buffer_pages: usize,

    /// Capacity of the channel merging per-CPU perf readers
    pub perf_merge_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: "lo".to_string(),
            probe_dir: None,
            perf_buffer_pages: 1,
            perf_merge_capacity: 256,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Path handed to the storage stage
    pub data_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_path: "./db".to_string(),
        }
    }
}

/// Read loop and dispatch queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Dispatch queue capacity
    pub queue_capacity: usize,

    /// How long shutdown waits for the read loop before giving up on it
    pub shutdown_timeout_ms: u64,
}

impl PipelineSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: crate::pipeline::DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout_ms: 5000,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. PRISM_CONFIG environment variable
    /// 3. ~/.config/prism/config.toml
    /// 4. /etc/prism/config.toml
    /// 5. Default values
    ///
    /// Environment overrides are applied on top of whichever source won.
    /// CLI flags are merged by the caller after this returns, so the result
    /// is not validated here; call [`ConfigLoader::validate`] once the
    /// configuration is final.
    pub fn load(&self) -> ConfigResult<SensorConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            SensorConfig::default()
        };

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // 1. CLI --config flag
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        // 2. PRISM_CONFIG environment variable
        if let Ok(env_path) = std::env::var("PRISM_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("PRISM_CONFIG path does not exist: {}", env_path);
        }

        // 3. ~/.config/prism/config.toml
        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("prism").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        // 4. /etc/prism/config.toml
        let path = PathBuf::from("/etc/prism/config.toml");
        if path.exists() {
            return Some(path);
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<SensorConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut SensorConfig) {
        apply_overrides(config, |key| std::env::var(key).ok());
    }

    /// Validate configuration
    pub fn validate(&self, config: &SensorConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if config.capture.interface.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Capture interface cannot be empty".to_string(),
            ));
        }

        if !config.capture.perf_buffer_pages.is_power_of_two() {
            return Err(ConfigError::ValidationError(format!(
                "perf_buffer_pages must be a power of two, got {}",
                config.capture.perf_buffer_pages
            )));
        }

        if config.capture.perf_merge_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "perf_merge_capacity cannot be 0".to_string(),
            ));
        }

        if config.pipeline.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Dispatch queue capacity cannot be 0".to_string(),
            ));
        }

        if config.pipeline.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "shutdown_timeout_ms cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `PRISM_*` overrides read through `lookup`
fn apply_overrides<F>(config: &mut SensorConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Sensor settings
    if let Some(val) = lookup("PRISM_LOG_LEVEL") {
        config.sensor.log_level = val;
    }
    if let Some(val) = lookup("PRISM_DEBUG") {
        config.sensor.debug = val.parse().unwrap_or(config.sensor.debug);
    }

    // Capture settings
    if let Some(val) = lookup("PRISM_INTERFACE") {
        config.capture.interface = val;
    }
    if let Some(val) = lookup("PRISM_PROBE_DIR") {
        config.capture.probe_dir = Some(val);
    }

    // Storage settings
    if let Some(val) = lookup("PRISM_DATA_PATH") {
        config.storage.data_path = val;
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SensorConfig::default();
        assert_eq!(config.sensor.log_level, "info");
        assert!(!config.sensor.debug);
        assert_eq!(config.capture.interface, "lo");
        assert_eq!(config.capture.perf_buffer_pages, 1);
        assert_eq!(config.storage.data_path, "./db");
        assert_eq!(config.pipeline.queue_capacity, 100);
        assert_eq!(
            config.pipeline.shutdown_timeout(),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "debug"
        "#;
        let config: SensorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "debug");
        // Other fields should be default
        assert_eq!(config.capture.interface, "lo");
        assert_eq!(config.pipeline.queue_capacity, 100);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "trace"
            debug = true

            [capture]
            interface = "eth0"
            probe_dir = "/opt/prism/probes"
            perf_buffer_pages = 8
            perf_merge_capacity = 1024

            [storage]
            data_path = "/var/lib/prism"

            [pipeline]
            queue_capacity = 32
            shutdown_timeout_ms = 250
        "#;

        let config: SensorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "trace");
        assert!(config.sensor.debug);
        assert_eq!(config.capture.interface, "eth0");
        assert_eq!(
            config.capture.probe_dir.as_deref(),
            Some("/opt/prism/probes")
        );
        assert_eq!(config.capture.perf_buffer_pages, 8);
        assert_eq!(config.capture.perf_merge_capacity, 1024);
        assert_eq!(config.storage.data_path, "/var/lib/prism");
        assert_eq!(config.pipeline.queue_capacity, 32);
        assert_eq!(config.pipeline.shutdown_timeout_ms, 250);
    }

    #[test]
    fn test_load_from_cli_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[capture]\ninterface = \"veth0\"").unwrap();

        let loader = ConfigLoader::new().with_cli_path(Some(file.path().to_path_buf()));
        let config = loader.load_from_file(file.path()).unwrap();
        assert_eq!(config.capture.interface, "veth0");
        assert_eq!(loader.find_config_file(), Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_load_leaves_validation_to_caller() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[capture]\ninterface = \"\"").unwrap();

        let loader = ConfigLoader::new().with_cli_path(Some(file.path().to_path_buf()));
        let mut config = loader.load().unwrap();

        // An interface given on the command line fills the gap
        config.capture.interface = "eth0".to_string();
        assert!(loader.validate(&config).is_ok());
    }

    #[test]
    fn test_load_from_file_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[capture\ninterface = ").unwrap();

        let loader = ConfigLoader::new();
        let result = loader.load_from_file(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PRISM_LOG_LEVEL", "warn"),
            ("PRISM_INTERFACE", "eth1"),
            ("PRISM_DATA_PATH", "/tmp/prism-db"),
            ("PRISM_DEBUG", "true"),
            ("PRISM_PROBE_DIR", "/tmp/probes"),
        ]
        .into_iter()
        .collect();

        let mut config = SensorConfig::default();
        apply_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.sensor.log_level, "warn");
        assert!(config.sensor.debug);
        assert_eq!(config.capture.interface, "eth1");
        assert_eq!(config.capture.probe_dir.as_deref(), Some("/tmp/probes"));
        assert_eq!(config.storage.data_path, "/tmp/prism-db");
    }

    #[test]
    fn test_env_override_ignores_unparseable_bool() {
        let mut config = SensorConfig::default();
        apply_overrides(&mut config, |key| {
            (key == "PRISM_DEBUG").then(|| "maybe".to_string())
        });
        assert!(!config.sensor.debug);
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = SensorConfig {
            sensor: SensorSettings {
                log_level: "invalid".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let loader = ConfigLoader::new();
        let result = loader.validate(&config);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_empty_interface() {
        let mut config = SensorConfig::default();
        config.capture.interface = "  ".to_string();
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_perf_pages_power_of_two() {
        let mut config = SensorConfig::default();
        config.capture.perf_buffer_pages = 3;
        assert!(ConfigLoader::new().validate(&config).is_err());

        config.capture.perf_buffer_pages = 0;
        assert!(ConfigLoader::new().validate(&config).is_err());

        config.capture.perf_buffer_pages = 64;
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_validation_zero_capacities() {
        let mut config = SensorConfig::default();
        config.pipeline.queue_capacity = 0;
        assert!(ConfigLoader::new().validate(&config).is_err());

        let mut config = SensorConfig::default();
        config.capture.perf_merge_capacity = 0;
        assert!(ConfigLoader::new().validate(&config).is_err());

        let mut config = SensorConfig::default();
        config.pipeline.shutdown_timeout_ms = 0;
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_serialize_config() {
        let config = SensorConfig::default();
        let toml_str = config.to_toml().unwrap();
        assert!(toml_str.contains("[sensor]"));
        assert!(toml_str.contains("[capture]"));
        assert!(toml_str.contains("interface = \"lo\""));
    }
}
