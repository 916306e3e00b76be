pub mod capture;
pub mod convert;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource, PixelFormat, SimulatedConfig, SimulatedSource};
pub use error::ConfigError;
pub use pipeline::{Orchestrator, SourcePipeline, SourceStats};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub persistence: PersistenceConfig,
    pub preview: PreviewConfig,
    pub monitor: MonitorConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Upper bound on one blocking retrieve call
    pub retrieve_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub save_root: PathBuf,
    /// Frames held per source before new ones are dropped
    pub queue_capacity: usize,
    /// Save workers per source
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Every Kth frame goes to preview; 0 disables preview
    pub interval: u32,
    /// Clamped to 1..=5
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// 0 disables the queue monitor
    pub interval_ms: u64,
}

/// One logical camera source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    pub channel: Option<u32>,
    /// Overrides `persistence.save_root` for this source
    pub save_root: Option<PathBuf>,
    pub simulated: SimulatedConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            retrieve_timeout_ms: 1000,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_root: PathBuf::from("captures"),
            queue_capacity: 500,
            workers: 4,
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            interval: 5,
            queue_capacity: 2,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_ms: 5000 }
    }
}

impl Config {
    /// Load from an optional TOML file, then `MULTICAP__SECTION__KEY` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(config::Environment::with_prefix("MULTICAP").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.persistence.queue_capacity == 0 {
            return Err(ConfigError::Invalid("persistence.queue_capacity must be > 0".into()));
        }
        if self.persistence.workers == 0 {
            return Err(ConfigError::Invalid("persistence.workers must be > 0".into()));
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(ConfigError::Invalid("source name must not be empty".into()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name {}",
                    source.name
                )));
            }
        }
        Ok(())
    }

    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.retrieve_timeout_ms)
    }
}

impl PreviewConfig {
    pub fn enabled(&self) -> bool {
        self.interval > 0
    }

    pub fn capacity(&self) -> usize {
        self.queue_capacity.clamp(1, 5)
    }
}

impl SourceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// `<root>/<name>`, with the per-source root taking precedence.
    pub fn save_dir(&self, default_root: &Path) -> PathBuf {
        self.save_root
            .as_deref()
            .unwrap_or(default_root)
            .join(&self.name)
    }
}
