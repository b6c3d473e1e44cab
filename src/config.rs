use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default queue wait slice; bounds how long a blocked worker takes to notice cancellation
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default budget for joining workers and draining queues at exit
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default output queue capacity of a stage
pub const DEFAULT_BUFFER_SIZE: usize = 10;

/// Per-stage settings shared by every stage kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Name used in logs, metrics and error messages
    pub name: Option<String>,
    /// Capacity of the stage's output queue
    pub buffer_size: usize,
    /// Number of workers pulling from the stage's input
    pub n_workers: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            n_workers: 1,
        }
    }
}

impl StageConfig {
    /// Reject zero buffer sizes and worker counts
    pub fn validate(&self) -> Result<()> {
        let label = self.name.as_deref().unwrap_or("<unnamed>");
        if self.buffer_size == 0 {
            return Err(PipelineError::ConfigError(format!(
                "stage `{label}`: buffer_size must be at least 1"
            )));
        }
        if self.n_workers == 0 {
            return Err(PipelineError::ConfigError(format!(
                "stage `{label}`: n_workers must be at least 1"
            )));
        }
        Ok(())
    }
}

/// What a `Many2One` stage does with a final batch shorter than its batch size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialBatch {
    /// Combine and push the short batch
    #[default]
    Emit,
    /// Discard the leftover items
    Drop,
    /// Fail the stage
    Fail,
}

/// Pipeline-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_interval_ms: u64,
    pub teardown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            teardown_timeout_ms: DEFAULT_TEARDOWN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set how often blocked queue operations check the token
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set how long exit waits for each queue to be fully consumed
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Teardown timeout as a `Duration`
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Reject a zero poll interval or a teardown timeout shorter than it
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::ConfigError(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.teardown_timeout_ms < self.poll_interval_ms {
            return Err(PipelineError::ConfigError(
                "teardown_timeout_ms must not be shorter than poll_interval_ms".into(),
            ));
        }
        Ok(())
    }
}
