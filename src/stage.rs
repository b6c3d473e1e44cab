use crate::config::{PartialBatch, StageConfig};
use crate::error::{PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::queue::{InterruptableQueue, Message};
use crate::token::CancellationToken;
use crate::transport::{Backend, CallError, Executor, Transport};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

/// Shape of a stage: how many items it consumes and produces per call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Source,
    One2One,
    One2Many,
    Many2One { batch_size: usize },
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::One2One => f.write_str("one2one"),
            Self::One2Many => f.write_str("one2many"),
            Self::Many2One { batch_size } => write!(f, "many2one({batch_size})"),
        }
    }
}

/// A pipeline step that consumes from an input queue.
///
/// `start` spawns the stage's workers on `runner` and returns immediately.
/// Workers stop when the stream-end marker has passed through, when the
/// token is set, or when the stage function fails.
pub trait Stage: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn config(&self) -> &StageConfig;

    fn kind(&self) -> StageKind;

    fn backend(&self) -> Backend;

    fn validate(&self) -> Result<()> {
        self.config().validate()
    }

    fn start(
        self,
        ctx: StageContext,
        input: InterruptableQueue<Message<Self::Input>>,
        output: InterruptableQueue<Message<Self::Output>>,
        runner: &mut StageRunner,
    ) -> Result<()>
    where
        Self: Sized;
}

/// First error raised by any worker of a pipeline
pub(crate) type FailureSlot = Arc<Mutex<Option<PipelineError>>>;

/// Everything a stage's workers share besides their queues
#[derive(Clone)]
pub struct StageContext {
    name: Arc<str>,
    token: CancellationToken,
    failure: FailureSlot,
    metrics: StageMetrics,
}

impl StageContext {
    /// Context for a stage run outside of a [`Pipeline`](crate::Pipeline),
    /// e.g. on caller-owned queues
    pub fn new(name: impl Into<String>, token: CancellationToken) -> Self {
        Self::shared(name, token, FailureSlot::default())
    }

    pub(crate) fn shared(name: impl Into<String>, token: CancellationToken, failure: FailureSlot) -> Self {
        Self {
            name: Arc::from(name.into()),
            token,
            failure,
            metrics: StageMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Record a fatal worker error and stop every worker of the pipeline.
    /// Only the first error is kept.
    pub fn fail(&self, err: PipelineError) {
        self.metrics.record_failure();
        warn!(stage = %self.name, error = %err, "stage failed, cancelling pipeline");
        {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.token.cancel(format!("stage `{}` failed", self.name));
    }

    /// Take the recorded failure, leaving the slot empty
    pub fn take_failure(&self) -> Option<PipelineError> {
        self.failure.lock().take()
    }
}

/// Decrements the pool's running count when a worker body ends, even by panic
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker pool of one stage
pub struct StageRunner {
    stage: String,
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicUsize>,
}

impl StageRunner {
    /// Create an empty pool for the stage called `stage`
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            handles: Vec::new(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails if workers were already started on this runner
    pub fn ensure_idle(&self) -> Result<()> {
        if self.handles.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::AlreadyStarted)
        }
    }

    /// Start one worker thread
    pub fn spawn<F>(&mut self, worker: usize, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.running.fetch_add(1, Ordering::AcqRel);
        let guard = RunningGuard(Arc::clone(&self.running));
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.stage, worker))
            .spawn(move || {
                let _guard = guard;
                body()
            })
            .map_err(|e| {
                PipelineError::ThreadError(format!(
                    "failed to spawn worker {worker} of stage `{}`: {e}",
                    self.stage
                ))
            })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Name of the stage this pool runs
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Workers started and not yet joined
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Workers whose loop is still running, whether joined or not
    pub fn live_workers(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Join every worker. All workers are joined even if some panicked.
    pub fn join(&mut self) -> Result<()> {
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(PipelineError::TeardownError(format!(
                "{panicked} worker(s) of stage `{}` panicked",
                self.stage
            )));
        }
        Ok(())
    }
}

/// Counts the workers of a stage that have not yet seen the stream end
#[derive(Debug)]
pub(crate) struct EndLatch {
    remaining: AtomicUsize,
}

impl EndLatch {
    pub(crate) fn new(workers: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(workers),
        })
    }

    /// Returns `true` for the last worker to arrive
    fn arrive(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Called by a worker that received the stream-end marker: hand it on to a
/// sibling, or downstream if every sibling has already finished
fn pass_end<In: Send, Out: Send>(
    ctx: &StageContext,
    worker: usize,
    latch: &EndLatch,
    input: &InterruptableQueue<Message<In>>,
    output: &InterruptableQueue<Message<Out>>,
) {
    let forwarded = if latch.arrive() {
        debug!(stage = ctx.name(), worker, "stream end, forwarding downstream");
        output.put(Message::End)
    } else {
        input.put(Message::End)
    };
    if forwarded.is_err() {
        debug!(stage = ctx.name(), worker, "cancelled while passing stream end");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run one call and push its results. Returns `false` when the worker must stop.
fn deliver<In, Out: Send>(
    ctx: &StageContext,
    transport: &mut dyn Transport<In, Out>,
    input: In,
    output: &InterruptableQueue<Message<Out>>,
) -> bool {
    let started = Instant::now();
    ctx.metrics().record_consumed();

    let mut emit = |out: Out| -> Result<()> {
        output.put(Message::Item(out))?;
        ctx.metrics().record_emitted();
        Ok(())
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| transport.call(input, &mut emit)));

    match outcome {
        Ok(Ok(())) => {
            ctx.metrics().record_latency(started.elapsed());
            true
        }
        Ok(Err(CallError::Cancelled)) => false,
        Ok(Err(CallError::Function(source))) => {
            ctx.fail(PipelineError::stage(ctx.name(), source));
            false
        }
        Ok(Err(CallError::Transport(err))) => {
            ctx.fail(err);
            false
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            ctx.fail(PipelineError::stage(
                ctx.name(),
                anyhow::anyhow!("stage function panicked: {message}"),
            ));
            false
        }
    }
}

fn connect<In, Out>(
    ctx: &StageContext,
    worker: usize,
    executor: &Executor<In, Out>,
) -> Option<Box<dyn Transport<In, Out>>>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    match executor.connect(ctx.name(), worker) {
        Ok(transport) => {
            debug!(stage = ctx.name(), worker, backend = %executor.backend(), "worker started");
            Some(transport)
        }
        Err(err) => {
            ctx.fail(err);
            None
        }
    }
}

fn close<In, Out>(ctx: &StageContext, worker: usize, mut transport: Box<dyn Transport<In, Out>>) {
    if let Err(err) = transport.close() {
        warn!(stage = ctx.name(), worker, error = %err, "worker transport did not close cleanly");
    }
    debug!(stage = ctx.name(), worker, "worker stopped");
}

/// Worker loop for stages that call their function once per input item
pub(crate) fn run_item_worker<In, Out>(
    ctx: StageContext,
    worker: usize,
    executor: Executor<In, Out>,
    input: InterruptableQueue<Message<In>>,
    output: InterruptableQueue<Message<Out>>,
    latch: Arc<EndLatch>,
) where
    In: Send + 'static,
    Out: Send + 'static,
{
    let Some(mut transport) = connect(&ctx, worker, &executor) else {
        return;
    };

    // Any queue error here is cancellation: leave the loop quietly.
    while let Ok(message) = input.get() {
        let item = match message {
            Message::Item(item) => item,
            Message::End => {
                input.task_done();
                pass_end(&ctx, worker, &latch, &input, &output);
                break;
            }
        };
        let keep_going = deliver(&ctx, transport.as_mut(), item, &output);
        input.task_done();
        if !keep_going {
            break;
        }
    }

    close(&ctx, worker, transport);
}

/// Serializes batch assembly across the workers of one fan-in stage
pub(crate) type BatchGate = Arc<Mutex<()>>;

/// Outcome of pulling one batch off the input queue
enum Assembled<T> {
    Full(Vec<T>),
    /// The stream ended; holds whatever arrived before the marker
    Last(Vec<T>),
    Interrupted,
}

fn assemble<T: Send>(input: &InterruptableQueue<Message<T>>, batch_size: usize) -> Assembled<T> {
    let mut batch = Vec::with_capacity(batch_size);
    while batch.len() < batch_size {
        match input.get() {
            Ok(Message::Item(item)) => {
                input.task_done();
                batch.push(item);
            }
            Ok(Message::End) => {
                input.task_done();
                return Assembled::Last(batch);
            }
            Err(_) => return Assembled::Interrupted,
        }
    }
    Assembled::Full(batch)
}

/// Worker loop for fan-in stages: collect `batch_size` consecutive items,
/// then call the function once with the whole batch.
///
/// Workers take turns filling batches under `gate`, so every batch is a run
/// of consecutive input items; the call itself happens outside the gate.
pub(crate) fn run_batch_worker<In, Out>(
    ctx: StageContext,
    worker: usize,
    executor: Executor<Vec<In>, Out>,
    batch_size: usize,
    partial: PartialBatch,
    gate: BatchGate,
    input: InterruptableQueue<Message<In>>,
    output: InterruptableQueue<Message<Out>>,
    latch: Arc<EndLatch>,
) where
    In: Send + 'static,
    Out: Send + 'static,
{
    let Some(mut transport) = connect(&ctx, worker, &executor) else {
        return;
    };

    loop {
        let assembled = {
            let _turn = gate.lock();
            assemble(&input, batch_size)
        };
        match assembled {
            Assembled::Full(batch) => {
                if !deliver(&ctx, transport.as_mut(), batch, &output) {
                    break;
                }
            }
            Assembled::Last(batch) => {
                if !batch.is_empty() {
                    match partial {
                        PartialBatch::Emit => {
                            if !deliver(&ctx, transport.as_mut(), batch, &output) {
                                break;
                            }
                        }
                        PartialBatch::Drop => {
                            debug!(stage = ctx.name(), worker, dropped = batch.len(), "dropping partial batch");
                        }
                        PartialBatch::Fail => {
                            ctx.fail(PipelineError::stage(
                                ctx.name(),
                                anyhow::anyhow!(
                                    "input ended with a partial batch of {} item(s), batch size is {batch_size}",
                                    batch.len()
                                ),
                            ));
                            break;
                        }
                    }
                }
                pass_end(&ctx, worker, &latch, &input, &output);
                break;
            }
            Assembled::Interrupted => break,
        }
    }

    close(&ctx, worker, transport);
}

/// Items a source's feeders pull from, shared behind a lock
pub(crate) type SharedItems<T> = Arc<Mutex<Box<dyn Iterator<Item = anyhow::Result<T>> + Send>>>;

/// Feeder loop of a source stage
pub(crate) fn run_source_worker<T: Send + 'static>(
    ctx: StageContext,
    worker: usize,
    items: SharedItems<T>,
    output: InterruptableQueue<Message<T>>,
    latch: Arc<EndLatch>,
) {
    debug!(stage = ctx.name(), worker, "feeder started");
    loop {
        let next = match panic::catch_unwind(AssertUnwindSafe(|| items.lock().next())) {
            Ok(next) => next,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                ctx.fail(PipelineError::stage(
                    ctx.name(),
                    anyhow::anyhow!("source iterator panicked: {message}"),
                ));
                break;
            }
        };
        match next {
            Some(Ok(item)) => {
                ctx.metrics().record_consumed();
                if output.put(Message::Item(item)).is_err() {
                    break;
                }
                ctx.metrics().record_emitted();
            }
            Some(Err(source)) => {
                ctx.fail(PipelineError::stage(ctx.name(), source));
                break;
            }
            None => {
                if latch.arrive() {
                    debug!(stage = ctx.name(), worker, "source exhausted");
                    // Cancellation here only means nobody is listening anymore.
                    let _ = output.put(Message::End);
                }
                break;
            }
        }
    }
    debug!(stage = ctx.name(), worker, "feeder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_reports_last_arrival() {
        let latch = EndLatch::new(3);
        assert!(!latch.arrive());
        assert!(!latch.arrive());
        assert!(latch.arrive());
    }

    #[test]
    fn test_first_failure_wins_and_cancels() {
        let token = CancellationToken::new();
        let ctx = StageContext::new("load", token.clone());
        ctx.fail(PipelineError::stage("load", anyhow::anyhow!("first")));
        ctx.fail(PipelineError::stage("load", anyhow::anyhow!("second")));

        assert!(token.is_cancelled());
        let err = ctx.take_failure().unwrap();
        assert!(err.to_string().contains("first"));
        assert!(ctx.take_failure().is_none());
        assert_eq!(ctx.metrics().total_failures(), 2);
    }

    #[test]
    fn test_runner_joins_all_workers() {
        let mut runner = StageRunner::new("pool");
        let counter = Arc::new(AtomicUsize::new(0));
        for worker in 0..4 {
            let counter = Arc::clone(&counter);
            runner
                .spawn(worker, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(runner.worker_count(), 4);
        runner.join().unwrap();
        assert_eq!(runner.worker_count(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_live_workers_tracks_running_bodies() {
        let mut runner = StageRunner::new("pool");
        let token = CancellationToken::new();
        for worker in 0..3 {
            let token = token.clone();
            runner
                .spawn(worker, move || {
                    while !token.is_cancelled() {
                        thread::sleep(std::time::Duration::from_millis(1));
                    }
                })
                .unwrap();
        }
        runner.spawn(3, || panic!("early exit")).unwrap();

        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        while runner.live_workers() != 3 && Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(runner.live_workers(), 3);

        token.cancel("done");
        while runner.live_workers() != 0 && Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        // The bodies ended on their own, before any join
        assert_eq!(runner.live_workers(), 0);
        assert_eq!(runner.worker_count(), 4);
        assert!(runner.join().is_err());
    }

    #[test]
    fn test_runner_reports_panicked_worker() {
        let mut runner = StageRunner::new("pool");
        runner.spawn(0, || panic!("engine bug")).unwrap();
        runner.spawn(1, || {}).unwrap();
        assert!(matches!(runner.join(), Err(PipelineError::TeardownError(_))));
        assert_eq!(runner.worker_count(), 0);
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
    }
}
