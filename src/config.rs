//! Configuration for replay execution

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::dag::ExtractionMode;
use crate::error::{FlowError, Result};

/// Configuration for the replay engine and its worker client
///
/// Durations are written as milliseconds in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Interval between two status polls of a submitted task
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Wall-clock limit for a single task, `None` waits forever
    #[serde(with = "opt_duration_ms")]
    pub task_timeout: Option<Duration>,

    /// Wall-clock limit for a whole replay
    #[serde(with = "opt_duration_ms")]
    pub replay_timeout: Option<Duration>,

    /// Below this many usage samples a task is charged the flat quota rate
    pub min_usage_samples: usize,

    /// Submit tasks of the same wave concurrently
    pub parallel_waves: bool,

    /// How unresolvable data references are treated during extraction
    pub extraction_mode: ExtractionMode,

    pub worker: WorkerConfig,
}

/// Connection settings for the external function workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub base_url: String,

    /// Passed to workers so they can report completion out of band
    pub callback_url: Option<String>,

    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            task_timeout: Some(Duration::from_secs(3600)),
            replay_timeout: None,
            min_usage_samples: 60,
            parallel_waves: false,
            extraction_mode: ExtractionMode::Lenient,
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            callback_url: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl FlowConfig {
    /// Create a new builder for flow configuration
    pub fn builder() -> FlowConfigBuilder {
        FlowConfigBuilder::default()
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlowConfig = serde_yaml::from_str(&content)
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DATALAB_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("DATALAB_WORKER_URL") {
            self.worker.base_url = url;
        }
        if let Ok(url) = std::env::var("DATALAB_CALLBACK_URL") {
            self.worker.callback_url = Some(url);
        }
        if let Ok(ms) = std::env::var("DATALAB_POLL_INTERVAL_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| {
                    FlowError::Config(format!("invalid DATALAB_POLL_INTERVAL_MS: {}", ms))
                })?;
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(secs) = std::env::var("DATALAB_TASK_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                FlowError::Config(format!("invalid DATALAB_TASK_TIMEOUT_SECS: {}", secs))
            })?;
            // 0 disables the timeout
            self.task_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(FlowError::Config("poll_interval must be greater than 0".to_string()));
        }

        if matches!(self.task_timeout, Some(t) if t < self.poll_interval) {
            return Err(FlowError::Config(
                "task_timeout must not be shorter than poll_interval".to_string(),
            ));
        }

        if self.worker.base_url.is_empty() {
            return Err(FlowError::Config("worker.base_url must not be empty".to_string()));
        }

        Ok(())
    }
}

/// Builder for flow configuration
#[derive(Debug, Default)]
pub struct FlowConfigBuilder {
    poll_interval: Option<Duration>,
    task_timeout: Option<Option<Duration>>,
    replay_timeout: Option<Duration>,
    min_usage_samples: Option<usize>,
    parallel_waves: Option<bool>,
    extraction_mode: Option<ExtractionMode>,
    worker_url: Option<String>,
}

impl FlowConfigBuilder {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the per-task timeout, `None` disables it
    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn replay_timeout(mut self, timeout: Duration) -> Self {
        self.replay_timeout = Some(timeout);
        self
    }

    pub fn min_usage_samples(mut self, min: usize) -> Self {
        self.min_usage_samples = Some(min);
        self
    }

    pub fn parallel_waves(mut self, enable: bool) -> Self {
        self.parallel_waves = Some(enable);
        self
    }

    pub fn extraction_mode(mut self, mode: ExtractionMode) -> Self {
        self.extraction_mode = Some(mode);
        self
    }

    pub fn worker_url(mut self, url: impl Into<String>) -> Self {
        self.worker_url = Some(url.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> FlowConfig {
        let defaults = FlowConfig::default();

        FlowConfig {
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            task_timeout: self.task_timeout.unwrap_or(defaults.task_timeout),
            replay_timeout: self.replay_timeout.or(defaults.replay_timeout),
            min_usage_samples: self.min_usage_samples.unwrap_or(defaults.min_usage_samples),
            parallel_waves: self.parallel_waves.unwrap_or(defaults.parallel_waves),
            extraction_mode: self.extraction_mode.unwrap_or(defaults.extraction_mode),
            worker: WorkerConfig {
                base_url: self.worker_url.unwrap_or(defaults.worker.base_url),
                ..defaults.worker
            },
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
