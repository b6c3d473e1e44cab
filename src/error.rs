use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while building, running or tearing down a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A blocking queue wait was interrupted by the cancellation token
    #[error("Queue wait cancelled")]
    Cancelled,

    /// A user transform failed (or panicked) while processing a unit of work
    #[error("Stage `{stage}` failed: {source:#}")]
    StageError {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    /// Joining workers or draining queues failed at exit
    #[error("Pipeline teardown error: {0}")]
    TeardownError(String),

    /// A worker thread could not be spawned
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Invalid stage or pipeline configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A worker process broke the frame protocol or exited unexpectedly
    #[error("Worker transport error: {0}")]
    TransportError(String),

    /// Workers were already started on this runner
    #[error("Stage has already been started")]
    AlreadyStarted,

    /// Pipe or process I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration document or worker payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Wrap a user-function failure with the name of the stage it happened in
    pub fn stage(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::StageError {
            stage: stage.into(),
            source,
        }
    }

    /// True for the expected shutdown signal, false for real failures
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
