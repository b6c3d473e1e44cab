use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::kinds::Source;
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::queue::{DrainQueue, InterruptableQueue, Message};
use crate::stage::{FailureSlot, Stage, StageContext, StageKind, StageRunner};
use crate::token::CancellationToken;
use crate::transport::Backend;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

/// Static description of one stage of a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    pub kind: StageKind,
    pub backend: Backend,
    pub n_workers: usize,
    pub buffer_size: usize,
}

impl fmt::Display for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} x{} {}, buffer {}]",
            self.name, self.kind, self.n_workers, self.backend, self.buffer_size
        )
    }
}

/// Collects what `enter` creates so it can be torn down on any path
struct Launcher {
    token: CancellationToken,
    poll_interval: Duration,
    failure: FailureSlot,
    runners: Vec<StageRunner>,
    queues: Vec<Box<dyn DrainQueue>>,
    metrics: Vec<StageMetrics>,
}

impl Launcher {
    fn queue<T: Send + 'static>(&mut self, capacity: usize) -> Result<InterruptableQueue<Message<T>>> {
        let queue = InterruptableQueue::new(capacity, self.poll_interval, self.token.clone())?;
        self.queues.push(Box::new(queue.clone()));
        Ok(queue)
    }

    fn context(&mut self, name: &str) -> StageContext {
        let ctx = StageContext::shared(name, self.token.clone(), self.failure.clone());
        self.metrics.push(ctx.metrics().clone());
        ctx
    }

    fn runner(&mut self, name: &str) -> &mut StageRunner {
        self.runners.push(StageRunner::new(name));
        let last = self.runners.len() - 1;
        &mut self.runners[last]
    }

    fn into_teardown(self, timeout: Duration) -> Teardown {
        Teardown {
            token: self.token,
            runners: self.runners,
            queues: self.queues,
            timeout,
        }
    }
}

/// Joins every started worker, then empties and joins every queue
struct Teardown {
    token: CancellationToken,
    runners: Vec<StageRunner>,
    queues: Vec<Box<dyn DrainQueue>>,
    timeout: Duration,
}

impl Teardown {
    /// Returns a description of every step that failed
    fn run(&mut self) -> Vec<String> {
        self.token.cancel("pipeline exit");
        let mut problems = Vec::new();
        for runner in &mut self.runners {
            debug!(stage = runner.stage(), workers = runner.worker_count(), "joining workers");
            if let Err(err) = runner.join() {
                problems.push(err.to_string());
            }
        }
        for (index, queue) in self.queues.iter().enumerate() {
            let drained = queue.drain();
            if drained > 0 {
                debug!(queue = index, drained, "discarded unconsumed items");
            }
            if !queue.join_timeout(self.timeout) {
                problems.push(format!(
                    "queue {index} still has {} unfinished item(s)",
                    queue.unfinished()
                ));
            }
        }
        problems
    }

    fn live_workers(&self) -> usize {
        self.runners.iter().map(StageRunner::live_workers).sum()
    }
}

type LaunchFn<T> = Box<dyn FnOnce(&mut Launcher) -> Result<InterruptableQueue<Message<T>>> + Send>;

/// A linear chain of stages, not yet running.
///
/// Built from a [`Source`] with [`then`](Pipeline::then); nothing is
/// allocated or spawned until [`enter`](Pipeline::enter).
///
/// ```
/// use staged_pipeline::{Many2One, One2Many, One2One, Pipeline, Source};
///
/// let batches = Pipeline::new(Source::new(1..=6))
///     .then(One2One::new(|x: u32| x * 10))
///     .then(One2Many::new(|x: u32| [x, x + 1]))
///     .then(Many2One::new(4))
///     .collect()
///     .unwrap();
/// assert_eq!(batches, vec![vec![10, 11, 20, 21], vec![30, 31, 40, 41], vec![50, 51, 60, 61]]);
/// ```
pub struct Pipeline<T> {
    config: PipelineConfig,
    stages: Vec<StageDescriptor>,
    validation: Result<()>,
    launch: LaunchFn<T>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn new(source: Source<T>) -> Self {
        let name = source
            .config()
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-0", source.kind()));
        let buffer_size = source.config().buffer_size;
        let descriptor = StageDescriptor {
            name: name.clone(),
            kind: source.kind(),
            backend: source.backend(),
            n_workers: source.config().n_workers,
            buffer_size,
        };
        let validation = source.config().validate();

        let launch: LaunchFn<T> = Box::new(move |launcher: &mut Launcher| {
            let output = launcher.queue::<T>(buffer_size)?;
            let ctx = launcher.context(&name);
            source.start(ctx, output.clone(), launcher.runner(&name))?;
            Ok(output)
        });

        Self {
            config: PipelineConfig::default(),
            stages: vec![descriptor],
            validation,
            launch,
        }
    }

    /// Append a stage consuming this pipeline's current output
    pub fn then<S>(self, stage: S) -> Pipeline<S::Output>
    where
        S: Stage<Input = T>,
    {
        let Self {
            config,
            mut stages,
            validation,
            launch: previous,
        } = self;

        let index = stages.len();
        let name = stage
            .config()
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{index}", stage.kind()));
        let buffer_size = stage.config().buffer_size;
        stages.push(StageDescriptor {
            name: name.clone(),
            kind: stage.kind(),
            backend: stage.backend(),
            n_workers: stage.config().n_workers,
            buffer_size,
        });
        let validation = validation.and_then(|()| stage.validate());

        let launch: LaunchFn<S::Output> = Box::new(move |launcher: &mut Launcher| {
            let input = previous(launcher)?;
            let output = launcher.queue::<S::Output>(buffer_size)?;
            let ctx = launcher.context(&name);
            stage.start(ctx, input, output.clone(), launcher.runner(&name))?;
            Ok(output)
        });

        Pipeline {
            config,
            stages,
            validation,
            launch,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Allocate the queues and start every stage in chain order.
    ///
    /// If starting any stage fails, the stages already running are stopped
    /// and joined before the error is returned.
    pub fn enter(self) -> Result<RunningPipeline<T>> {
        self.config.validate()?;
        self.validation?;

        let token = CancellationToken::new();
        let mut launcher = Launcher {
            token: token.clone(),
            poll_interval: self.config.poll_interval(),
            failure: FailureSlot::default(),
            runners: Vec::with_capacity(self.stages.len()),
            queues: Vec::with_capacity(self.stages.len()),
            metrics: Vec::with_capacity(self.stages.len()),
        };
        for stage in &self.stages {
            debug!(stage = %stage, "starting stage");
        }

        let output = match (self.launch)(&mut launcher) {
            Ok(output) => output,
            Err(err) => {
                error!(error = %err, "pipeline failed to start, stopping started stages");
                let problems = launcher.into_teardown(self.config.teardown_timeout()).run();
                for problem in problems {
                    error!(problem = %problem, "teardown after failed start");
                }
                return Err(err);
            }
        };

        info!(stages = self.stages.len(), "pipeline entered");
        let failure = launcher.failure.clone();
        let metrics = std::mem::take(&mut launcher.metrics);
        Ok(RunningPipeline {
            output,
            token,
            failure,
            stages: self.stages,
            metrics,
            teardown: launcher.into_teardown(self.config.teardown_timeout()),
            finished: false,
            exited: false,
        })
    }

    /// Enter, hand the running pipeline to `body`, then exit, even if
    /// `body` stops iterating early
    pub fn scope<R, F>(self, body: F) -> Result<R>
    where
        F: FnOnce(&mut RunningPipeline<T>) -> R,
    {
        let mut running = self.enter()?;
        let result = body(&mut running);
        running.exit()?;
        Ok(result)
    }

    /// Run to completion and collect every final item
    pub fn collect(self) -> Result<Vec<T>> {
        self.scope(|running| running.by_ref().collect::<Result<Vec<T>>>())?
    }
}

/// A started pipeline: iterate it to pull final results.
///
/// Yields `Ok(item)` until the stream ends. If any stage fails, the next
/// pull yields that `Err` once and iteration ends. Dropping the handle
/// exits the pipeline.
pub struct RunningPipeline<T> {
    output: InterruptableQueue<Message<T>>,
    token: CancellationToken,
    failure: FailureSlot,
    stages: Vec<StageDescriptor>,
    metrics: Vec<StageMetrics>,
    teardown: Teardown,
    finished: bool,
    exited: bool,
}

impl<T: Send + 'static> RunningPipeline<T> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Ask every stage to stop; workers notice within one poll interval.
    /// Iteration then ends with `Err(Cancelled)`.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.token.cancel(reason);
    }

    /// Worker threads still running
    pub fn live_workers(&self) -> usize {
        self.teardown.live_workers()
    }

    /// Per-stage metrics in chain order
    pub fn metrics(&self) -> Vec<(&str, MetricsSnapshot)> {
        self.stages
            .iter()
            .zip(&self.metrics)
            .map(|(stage, metrics)| (stage.name.as_str(), metrics.snapshot()))
            .collect()
    }

    pub fn metrics_summary(&self) -> String {
        let mut summary = String::from("Pipeline Metrics Summary:\n");
        for (index, (name, snapshot)) in self.metrics().into_iter().enumerate() {
            summary.push_str(&format!("  Stage {index} ({name}): {}\n", snapshot.format()));
        }
        summary
    }

    /// Stop every stage, join all workers and drain all queues.
    ///
    /// Idempotent. Returns a stage failure that was never delivered through
    /// iteration in preference to any teardown problem.
    pub fn exit(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        self.finished = true;

        let problems = self.teardown.run();
        let undelivered = self.failure.lock().take();
        info!(live_workers = self.live_workers(), "pipeline exited");

        match undelivered {
            Some(err) => {
                for problem in &problems {
                    error!(problem = problem.as_str(), "teardown problem after stage failure");
                }
                Err(err)
            }
            None if problems.is_empty() => Ok(()),
            None => Err(PipelineError::TeardownError(problems.join("; "))),
        }
    }
}

impl<T: Send + 'static> Iterator for RunningPipeline<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        // A failing worker stores its error before it sets the token.
        if self.token.is_cancelled() {
            self.finished = true;
            let err = self.failure.lock().take().unwrap_or(PipelineError::Cancelled);
            return Some(Err(err));
        }
        match self.output.get() {
            Ok(Message::Item(item)) => {
                self.output.task_done();
                Some(Ok(item))
            }
            Ok(Message::End) => {
                self.output.task_done();
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(self.failure.lock().take().unwrap_or(err)))
            }
        }
    }
}

impl<T> Drop for RunningPipeline<T> {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;
        let problems = self.teardown.run();
        if let Some(err) = self.failure.lock().take() {
            error!(error = %err, "pipeline dropped with an unreported stage failure");
        }
        for problem in problems {
            error!(problem = %problem, "teardown problem while dropping pipeline");
        }
    }
}
