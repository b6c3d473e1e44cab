//! A staged, concurrent data-processing pipeline for a single machine.
//!
//! A pipeline is a linear chain of stages joined by bounded queues. Each
//! stage runs a pool of workers, either threads or child processes, and
//! every blocking queue operation polls a shared cancellation token, so a
//! failure anywhere, or the consumer walking away, stops the whole chain
//! within one poll interval.
//!
//! # Features
//!
//! - Four stage shapes: [`Source`], [`One2One`], [`One2Many`] and [`Many2One`]
//! - Bounded, interruptible queues that provide backpressure
//! - Thread or worker-process execution per stage ([`Backend`])
//! - First stage error surfaces to the consumer as [`PipelineError::StageError`]
//! - Guaranteed teardown: exiting joins every worker and drains every queue
//! - Per-stage metrics: consumed and emitted counts, throughput, latency percentiles
//!
//! # Example
//!
//! ```
//! use staged_pipeline::{Many2One, One2One, Pipeline, Source};
//!
//! let sums = Pipeline::new(Source::new(1..=8u32))
//!     .then(One2One::new(|x: u32| x * x).workers(2))
//!     .then(Many2One::with_combine(4, |batch: Vec<u32>| batch.len()))
//!     .collect()?;
//! assert_eq!(sums, vec![4, 4]);
//! # Ok::<(), staged_pipeline::PipelineError>(())
//! ```

pub mod combine;
pub mod config;
pub mod error;
pub mod kinds;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod queue;
pub mod stage;
pub mod token;
pub mod transport;

// Re-exports for convenience
pub use combine::{combine_batches, pack_args};
pub use config::{PartialBatch, PipelineConfig, StageConfig};
pub use error::{PipelineError, Result};
pub use kinds::{Many2One, One2Many, One2One, Source};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::{Pipeline, RunningPipeline, StageDescriptor};
pub use process::WorkerCommand;
pub use queue::{InterruptableQueue, Message};
pub use stage::{Stage, StageContext, StageKind, StageRunner};
pub use token::CancellationToken;
pub use transport::{Backend, Executor, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
