//! Stream configuration and validation.

use crate::error::ConfigurationError;
use crate::message::QueueRef;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hard ceiling of the queue service: at most 10 messages per receive
pub const MAX_BATCH_SIZE: u32 = 10;

/// Long-poll wait used when none is configured
pub const DEFAULT_WAIT_SECONDS: u32 = 20;
/// Lease duration used when none is configured
pub const DEFAULT_LEASE_SECONDS: u32 = 100;
/// Buffer bound used when none is configured
pub const DEFAULT_HIGH_WATER_MARK: u32 = 1;

/// Environment variable prefix used by [`StreamOptions::load`]
pub const ENV_PREFIX: &str = "QUEUE_STREAM";

/// Unvalidated stream options as a user, a file or the environment supplies them.
///
/// A numeric setting of `0` counts as unset and takes its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Queue reference (URL); required
    pub queue: Option<String>,

    /// Long-poll wait per receive call, in seconds
    pub wait: Option<u32>,

    /// Lease granted to every received message, in seconds
    pub timeout: Option<u32>,

    /// Bound on read-side items buffered ahead of the consumer, and on
    /// concurrent writes
    #[serde(alias = "highWaterMark")]
    pub high_water_mark: Option<u32>,

    /// Maximum messages requested per receive call
    #[serde(alias = "batchSize")]
    pub batch_size: Option<u32>,

    /// Lease granted by each progress signal, in seconds
    #[serde(alias = "extendLeaseBy")]
    pub extend_lease_by: Option<u32>,
}

impl StreamOptions {
    /// Create options for a queue with every other setting defaulted
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Self::default()
        }
    }

    /// Parse options from a JSON value.
    ///
    /// A bare string is taken as the queue reference. Anything other than a
    /// string or an object is rejected.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigurationError> {
        match value {
            serde_json::Value::String(queue) => Ok(Self::new(queue)),
            serde_json::Value::Object(_) => {
                serde_json::from_value(value).map_err(|e| ConfigurationError::Parsing {
                    message: e.to_string(),
                })
            }
            other => Err(ConfigurationError::Invalid {
                message: format!(
                    "expected a queue reference or an options object, got {}",
                    json_kind(&other)
                ),
            }),
        }
    }

    /// Load options from an optional file, overlaid with `QUEUE_STREAM_*`
    /// environment variables (e.g. `QUEUE_STREAM_HIGH_WATER_MARK=5`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })
    }

    /// Set the long-poll wait
    pub fn with_wait(mut self, seconds: u32) -> Self {
        self.wait = Some(seconds);
        self
    }

    /// Set the lease granted on receive
    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Set the read buffer and write concurrency bound
    pub fn with_high_water_mark(mut self, items: u32) -> Self {
        self.high_water_mark = Some(items);
        self
    }

    /// Set the messages requested per receive
    pub fn with_batch_size(mut self, messages: u32) -> Self {
        self.batch_size = Some(messages);
        self
    }

    /// Set the lease granted by each progress signal
    pub fn with_extend_lease_by(mut self, seconds: u32) -> Self {
        self.extend_lease_by = Some(seconds);
        self
    }

    /// Validate and freeze
    pub fn build(self) -> Result<StreamConfig, ConfigurationError> {
        StreamConfig::try_from(self)
    }
}

/// Validated, immutable stream configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    queue: QueueRef,
    wait_seconds: u32,
    lease_seconds: u32,
    high_water_mark: u32,
    batch_size: u32,
    extend_lease_seconds: u32,
}

impl StreamConfig {
    /// Configuration for a bare queue reference with all defaults
    pub fn new(queue: impl Into<String>) -> Result<Self, ConfigurationError> {
        StreamOptions::new(queue).build()
    }

    /// Queue this stream reads from and writes to
    pub fn queue(&self) -> &QueueRef {
        &self.queue
    }

    /// Long-poll wait per receive call, in seconds
    pub fn wait_seconds(&self) -> u32 {
        self.wait_seconds
    }

    /// Lease granted on receive, in seconds
    pub fn lease_seconds(&self) -> u32 {
        self.lease_seconds
    }

    /// Bound on buffered reads and in-flight writes
    pub fn high_water_mark(&self) -> u32 {
        self.high_water_mark
    }

    /// Maximum messages per receive call
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Lease granted by each progress signal, in seconds
    pub fn extend_lease_seconds(&self) -> u32 {
        self.extend_lease_seconds
    }
}

impl TryFrom<StreamOptions> for StreamConfig {
    type Error = ConfigurationError;

    fn try_from(options: StreamOptions) -> Result<Self, Self::Error> {
        let queue = options.queue.ok_or_else(|| ConfigurationError::Missing {
            key: "queue".to_string(),
        })?;
        let queue = QueueRef::new(queue)?;

        let high_water_mark = set(options.high_water_mark).unwrap_or(DEFAULT_HIGH_WATER_MARK);
        check_bounded("high_water_mark", high_water_mark)?;

        // One receive call fills the buffer unless told otherwise
        let batch_size = set(options.batch_size).unwrap_or(high_water_mark);
        check_bounded("batch_size", batch_size)?;

        let lease_seconds = set(options.timeout).unwrap_or(DEFAULT_LEASE_SECONDS);

        Ok(Self {
            queue,
            wait_seconds: set(options.wait).unwrap_or(DEFAULT_WAIT_SECONDS),
            lease_seconds,
            high_water_mark,
            batch_size,
            extend_lease_seconds: set(options.extend_lease_by).unwrap_or(lease_seconds),
        })
    }
}

fn set(value: Option<u32>) -> Option<u32> {
    value.filter(|v| *v > 0)
}

fn check_bounded(key: &str, value: u32) -> Result<(), ConfigurationError> {
    if value > MAX_BATCH_SIZE {
        return Err(ConfigurationError::OutOfRange {
            key: key.to_string(),
            value,
            max: MAX_BATCH_SIZE,
        });
    }

    Ok(())
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
