//! Configuration structures for ModelPlay
//!
//! Configurations are loaded from YAML files and can be overridden by
//! environment variables (`MODELPLAY__<SECTION>__<KEY>`).

use crate::error::{ModelPlayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "MODELPLAY";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPlayConfig {
    /// Worker process supervision
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Persisted documents and model storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Worker supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Path to the worker executable
    pub worker_binary: PathBuf,

    /// Device string passed to every model's `load`
    pub device: String,

    /// Maximum wait for the load handshake
    pub handshake_timeout_secs: u64,

    /// Maximum wait for an inference or configure reply
    pub request_timeout_secs: u64,

    /// Maximum wait for the terminate acknowledgment and process exit
    pub terminate_timeout_secs: u64,

    /// Maximum duration of a download process
    pub download_timeout_secs: u64,

    /// How often a blocked caller checks that the worker process is alive
    pub liveness_probe_interval_ms: u64,

    /// Extra attempts when spawning a worker process fails
    pub spawn_retries: u32,

    /// Pause between spawn attempts
    pub spawn_retry_backoff_ms: u64,

    /// Interval of the background dead-worker sweep
    pub health_check_interval_secs: u64,

    /// Largest IPC frame accepted in either direction
    pub max_frame_bytes: usize,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory; relative paths below resolve against it
    pub data_dir: PathBuf,

    /// Where downloaded models are stored
    pub models_dir: PathBuf,

    /// Model registry document
    pub registry_file: PathBuf,

    /// Playground definitions document
    pub playgrounds_file: PathBuf,

    /// Runtime usage map document
    pub usage_file: PathBuf,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or an EnvFilter directive
    pub log_level: String,

    /// Emit JSON log lines
    pub structured_logging: bool,

    /// Enable Prometheus metrics
    pub enable_metrics: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_binary: PathBuf::from("modelplay-worker"),
            device: "cpu".to_string(),
            handshake_timeout_secs: 120,
            request_timeout_secs: 300,
            terminate_timeout_secs: 10,
            download_timeout_secs: 3600,
            liveness_probe_interval_ms: 500,
            spawn_retries: 2,
            spawn_retry_backoff_ms: 250,
            health_check_interval_secs: 5,
            max_frame_bytes: modelplay_proto::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            models_dir: PathBuf::from("models"),
            registry_file: PathBuf::from("registry.json"),
            playgrounds_file: PathBuf::from("playgrounds.json"),
            usage_file: PathBuf::from("usage.json"),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            structured_logging: false,
            enable_metrics: true,
        }
    }
}

impl SupervisorConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn liveness_probe_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_probe_interval_ms)
    }

    pub fn spawn_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.spawn_retry_backoff_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl StorageConfig {
    /// Resolve a configured path against `data_dir`
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.resolve(&self.registry_file)
    }

    pub fn playgrounds_path(&self) -> PathBuf {
        self.resolve(&self.playgrounds_file)
    }

    pub fn usage_path(&self) -> PathBuf {
        self.resolve(&self.usage_file)
    }

    pub fn models_path(&self) -> PathBuf {
        self.resolve(&self.models_dir)
    }
}

impl ModelPlayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ModelPlayError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: ModelPlayConfig = serde_yaml::from_str(&content).map_err(|e| {
            ModelPlayError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `MODELPLAY__*` environment variables only
    pub fn from_env() -> Result<Self> {
        Self::layered(None)
    }

    /// Load an optional YAML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::layered(Some(path.as_ref()))
    }

    fn layered(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );
        }

        let config: ModelPlayConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ModelPlayError::Config(format!("Failed to assemble configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let s = &self.supervisor;
        if s.worker_binary.as_os_str().is_empty() {
            return Err(ModelPlayError::config("supervisor.worker_binary must not be empty"));
        }
        if s.handshake_timeout_secs == 0
            || s.request_timeout_secs == 0
            || s.terminate_timeout_secs == 0
            || s.download_timeout_secs == 0
        {
            return Err(ModelPlayError::config("supervisor timeouts must be non-zero"));
        }
        if s.liveness_probe_interval_ms == 0 {
            return Err(ModelPlayError::config(
                "supervisor.liveness_probe_interval_ms must be non-zero",
            ));
        }
        if s.max_frame_bytes == 0 {
            return Err(ModelPlayError::config("supervisor.max_frame_bytes must be non-zero"));
        }
        Ok(())
    }
}
