// src/config/mod.rs

//! Configuration for the orchestration core
//!
//! Supports multiple file formats (YAML, JSON, TOML) selected by extension,
//! serde-driven defaults for every section, and environment variable
//! overrides for the scalar tuning knobs. Pool capacities and the event
//! debounce window are deliberately configuration rather than constants;
//! the shipped defaults are small, bounded, and positive but not otherwise
//! load-bearing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub app: AppSettings,
    pub logging: LoggingConfig,
    pub tasks: TaskConfig,
    pub event_bus: EventBusConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app: AppSettings::default(),
            logging: LoggingConfig::default(),
            tasks: TaskConfig::default(),
            event_bus: EventBusConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Loads configuration from a file, detecting the format by extension.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_extension(path).ok_or_else(|| {
            Error::config(format!(
                "Unsupported configuration file extension: {}",
                path.display()
            ))
        })?;

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content, format)
    }

    /// Parses configuration from a string in the given format.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let config: Self = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| Error::config(format!("Invalid YAML configuration: {}", e)))?,
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| Error::config(format!("Invalid JSON configuration: {}", e)))?,
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| Error::config(format!("Invalid TOML configuration: {}", e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Applies `TASKFORGE_*` environment variable overrides to the scalar
    /// tuning knobs. Unknown or unparsable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok()?.parse().ok()
        }

        if let Ok(level) = std::env::var("TASKFORGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = parse_env("TASKFORGE_DEBOUNCE_MS") {
            self.event_bus.debounce_ms = v;
        }
        if let Some(v) = parse_env("TASKFORGE_MAIN_CAPACITY") {
            self.tasks.main_capacity = v;
        }
        if let Some(v) = parse_env("TASKFORGE_BACKGROUND_CAPACITY") {
            self.tasks.background_capacity = v;
        }
        if let Some(v) = parse_env("TASKFORGE_DOWNLOAD_CAPACITY") {
            self.tasks.download_capacity = v;
        }
        if let Some(v) = parse_env("TASKFORGE_IMAGE_CACHE_CAPACITY") {
            self.tasks.image_cache_capacity = v;
        }
    }

    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.tasks.main_capacity == 0 {
            errors.push("tasks.main_capacity must be > 0".to_string());
        }
        if self.tasks.background_capacity == 0 {
            errors.push("tasks.background_capacity must be > 0".to_string());
        }
        if self.tasks.download_capacity == 0 {
            errors.push("tasks.download_capacity must be > 0".to_string());
        }
        if self.tasks.image_cache_capacity == 0 {
            errors.push("tasks.image_cache_capacity must be > 0".to_string());
        }
        if self.event_bus.debounce_ms == 0 {
            errors.push("event_bus.debounce_ms must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::new(
                crate::error::ErrorKind::Configuration {
                    key: None,
                    validation_errors: errors,
                },
                "Configuration validation failed",
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub debug: bool,
    pub data_dir: PathBuf,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "Taskforge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            debug: cfg!(debug_assertions),
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<FileLogConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    pub directory: PathBuf,
    pub file_name: String,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            file_name: "taskforge.log".to_string(),
        }
    }
}

/// Per-category worker pool capacities.
///
/// The main pool is serial so only one library-wide operation runs at a
/// time; the remaining pools cap network and disk contention without
/// letting any single category starve the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub main_capacity: usize,
    pub background_capacity: usize,
    pub download_capacity: usize,
    pub image_cache_capacity: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            main_capacity: 1,
            background_capacity: num_cpus::get().clamp(2, 4),
            download_capacity: 3,
            image_cache_capacity: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Delay after the first publish on a topic before the accumulated
    /// batch is flushed to listeners.
    pub debounce_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { debounce_ms: 250 }
    }
}
