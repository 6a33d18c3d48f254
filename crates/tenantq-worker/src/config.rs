use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use tenantq_async::{BufferConfig, DispatcherConfig, PopulatorConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Worker configuration file. Every section and key is optional.
///
/// ```toml
/// [buffering]
/// max_buffered_messages = 64
/// max_buffered_messages_per_tenant = 4
/// on_tenant_capacity = "wait"
/// max_concurrent_handlers = 4
/// max_concurrent_handlers_per_tenant = 1
///
/// [populator]
/// not_admitted = "leave"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub buffering: BufferingConfig,
    pub populator: PopulatorConfig,
    pub source: SourceConfig,
    pub producer: ProducerConfig,
    pub processor: ProcessorConfig,
}

/// The `[buffering]` section carries both buffer and dispatcher limits.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BufferingConfig {
    #[serde(flatten)]
    pub buffer: BufferConfig,
    #[serde(flatten)]
    pub dispatcher: DispatcherConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// How long a delivered message may stay unacknowledged before the source
    /// hands it out again.
    pub visibility_timeout_ms: u64,
    /// Delay before a requeued message becomes visible again.
    pub requeue_delay_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 30_000,
            requeue_delay_ms: 30_000,
        }
    }
}

impl SourceConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Stop producing after this many messages; unlimited when absent.
    pub messages: Option<u64>,
    pub tenant_min: i32,
    pub tenant_max: i32,
    pub delay_ms_min: u64,
    pub delay_ms_max: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            messages: None,
            tenant_min: 1,
            tenant_max: 20,
            delay_ms_min: 50,
            delay_ms_max: 150,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub min_ms: u64,
    pub max_ms: u64,
    /// Probability in `[0, 1]` that a message fails and is requeued.
    pub failure_rate: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            min_ms: 120,
            max_ms: 240,
            failure_rate: 0.0,
        }
    }
}

impl WorkerConfig {
    /// Loads the file at `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let producer = &self.producer;
        if producer.tenant_min > producer.tenant_max {
            return Err(ConfigError::Invalid(format!(
                "producer.tenant_min ({}) exceeds producer.tenant_max ({})",
                producer.tenant_min, producer.tenant_max
            )));
        }
        if producer.delay_ms_min > producer.delay_ms_max {
            return Err(ConfigError::Invalid(format!(
                "producer.delay_ms_min ({}) exceeds producer.delay_ms_max ({})",
                producer.delay_ms_min, producer.delay_ms_max
            )));
        }
        let processor = &self.processor;
        if processor.min_ms > processor.max_ms {
            return Err(ConfigError::Invalid(format!(
                "processor.min_ms ({}) exceeds processor.max_ms ({})",
                processor.min_ms, processor.max_ms
            )));
        }
        if !(0.0..=1.0).contains(&processor.failure_rate) {
            return Err(ConfigError::Invalid(format!(
                "processor.failure_rate must be within [0, 1], got {}",
                processor.failure_rate
            )));
        }
        Ok(())
    }
}
