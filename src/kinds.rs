//! The four stage shapes a pipeline is built from.

use crate::config::{PartialBatch, StageConfig};
use crate::error::{PipelineError, Result};
use crate::process::{self, WorkerCommand};
use crate::queue::{InterruptableQueue, Message};
use crate::stage::{self, BatchGate, EndLatch, SharedItems, Stage, StageContext, StageKind, StageRunner};
use crate::transport::{self, Backend, Executor};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

macro_rules! stage_setters {
    () => {
        /// Name used in logs, metrics and errors
        pub fn named(mut self, name: impl Into<String>) -> Self {
            self.config.name = Some(name.into());
            self
        }

        /// Capacity of this stage's output queue
        pub fn buffer_size(mut self, buffer_size: usize) -> Self {
            self.config.buffer_size = buffer_size;
            self
        }

        /// Number of parallel workers
        pub fn workers(mut self, n_workers: usize) -> Self {
            self.config.n_workers = n_workers;
            self
        }

        /// Replace the whole stage configuration
        pub fn with_config(mut self, config: StageConfig) -> Self {
            self.config = config;
            self
        }
    };
}

/// First stage of every pipeline: feeds items from an iterator.
///
/// With more than one worker the feeders share the iterator, so the order
/// in which items reach the output queue is no longer guaranteed.
pub struct Source<T> {
    items: Box<dyn Iterator<Item = anyhow::Result<T>> + Send>,
    config: StageConfig,
}

impl<T: Send + 'static> Source<T> {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::try_new(items.into_iter().map(Ok))
    }

    /// A source whose items may fail; the first `Err` fails the pipeline
    pub fn try_new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<T>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            items: Box::new(items.into_iter()),
            config: StageConfig::default(),
        }
    }

    stage_setters!();

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn kind(&self) -> StageKind {
        StageKind::Source
    }

    /// Sources always feed from threads: an iterator cannot leave the process
    pub fn backend(&self) -> Backend {
        Backend::Thread
    }

    /// Spawn the feeders; they push every item and then one stream-end marker
    pub fn start(
        self,
        ctx: StageContext,
        output: InterruptableQueue<Message<T>>,
        runner: &mut StageRunner,
    ) -> Result<()> {
        runner.ensure_idle()?;
        let workers = self.config.n_workers;
        let items: SharedItems<T> = Arc::new(Mutex::new(self.items));
        let latch = EndLatch::new(workers);
        for worker in 0..workers {
            let ctx = ctx.clone();
            let items = Arc::clone(&items);
            let output = output.clone();
            let latch = Arc::clone(&latch);
            runner.spawn(worker, move || {
                stage::run_source_worker(ctx, worker, items, output, latch)
            })?;
        }
        Ok(())
    }
}

fn start_item_workers<In, Out>(
    config: &StageConfig,
    executor: Executor<In, Out>,
    ctx: StageContext,
    input: InterruptableQueue<Message<In>>,
    output: InterruptableQueue<Message<Out>>,
    runner: &mut StageRunner,
) -> Result<()>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    runner.ensure_idle()?;
    let latch = EndLatch::new(config.n_workers);
    for worker in 0..config.n_workers {
        let ctx = ctx.clone();
        let executor = executor.clone();
        let input = input.clone();
        let output = output.clone();
        let latch = Arc::clone(&latch);
        runner.spawn(worker, move || {
            stage::run_item_worker(ctx, worker, executor, input, output, latch)
        })?;
    }
    Ok(())
}

/// Applies a function to every item: exactly one result per input.
///
/// With a single worker the output order matches the input order.
pub struct One2One<In, Out> {
    executor: Executor<In, Out>,
    config: StageConfig,
}

impl<In, Out> One2One<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(In) -> Out + Send + Sync + 'static,
    {
        Self::try_new(move |input| Ok(function(input)))
    }

    /// A function whose error fails the pipeline
    pub fn try_new<F>(function: F) -> Self
    where
        F: Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        Self::with_executor(Executor::thread(transport::one_to_one(function)))
    }

    /// Each worker forwards items to its own child process started from
    /// `command`, which must call [`serve_one2one`](crate::process::serve_one2one)
    pub fn process(command: WorkerCommand) -> Self
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        Self::with_executor(process::executor(command))
    }

    pub fn with_executor(executor: Executor<In, Out>) -> Self {
        Self {
            executor,
            config: StageConfig::default(),
        }
    }

    stage_setters!();
}

impl<In, Out> Stage for One2One<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Input = In;
    type Output = Out;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn kind(&self) -> StageKind {
        StageKind::One2One
    }

    fn backend(&self) -> Backend {
        self.executor.backend()
    }

    fn start(
        self,
        ctx: StageContext,
        input: InterruptableQueue<Message<In>>,
        output: InterruptableQueue<Message<Out>>,
        runner: &mut StageRunner,
    ) -> Result<()> {
        start_item_workers(&self.config, self.executor, ctx, input, output, runner)
    }
}

/// Fan-out: each input yields zero or more results.
///
/// Results are pushed one at a time as the function's iterator produces
/// them, so a full output queue stalls the worker mid-sequence. The results
/// of one input keep their relative order.
pub struct One2Many<In, Out> {
    executor: Executor<In, Out>,
    config: StageConfig,
}

impl<In, Out> One2Many<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<R, F>(function: F) -> Self
    where
        R: IntoIterator<Item = Out>,
        F: Fn(In) -> R + Send + Sync + 'static,
    {
        Self::try_new(move |input| Ok(function(input)))
    }

    pub fn try_new<R, F>(function: F) -> Self
    where
        R: IntoIterator<Item = Out>,
        F: Fn(In) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self::with_executor(Executor::thread(transport::one_to_many(function)))
    }

    /// Child processes must call [`serve_one2many`](crate::process::serve_one2many)
    pub fn process(command: WorkerCommand) -> Self
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        Self::with_executor(process::executor(command))
    }

    pub fn with_executor(executor: Executor<In, Out>) -> Self {
        Self {
            executor,
            config: StageConfig::default(),
        }
    }

    stage_setters!();
}

impl<In, Out> Stage for One2Many<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Input = In;
    type Output = Out;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn kind(&self) -> StageKind {
        StageKind::One2Many
    }

    fn backend(&self) -> Backend {
        self.executor.backend()
    }

    fn start(
        self,
        ctx: StageContext,
        input: InterruptableQueue<Message<In>>,
        output: InterruptableQueue<Message<Out>>,
        runner: &mut StageRunner,
    ) -> Result<()> {
        start_item_workers(&self.config, self.executor, ctx, input, output, runner)
    }
}

/// Fan-in: collects `batch_size` consecutive items into a `Vec` and combines
/// them into one result.
///
/// Items are batched in arrival order. With several workers the workers take
/// turns filling batches, so every batch is still a run of consecutive items;
/// only the order in which batch results are emitted may vary. What happens to a short final batch is set by
/// [`PartialBatch`] (default: it is combined and emitted).
pub struct Many2One<In, Out> {
    batch_size: usize,
    partial: PartialBatch,
    executor: Executor<Vec<In>, Out>,
    config: StageConfig,
}

impl<In: Send + 'static> Many2One<In, Vec<In>> {
    /// Emit each batch as-is
    pub fn new(batch_size: usize) -> Self {
        Self::with_combine(batch_size, |batch| batch)
    }
}

impl<In, Out> Many2One<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn with_combine<F>(batch_size: usize, combine: F) -> Self
    where
        F: Fn(Vec<In>) -> Out + Send + Sync + 'static,
    {
        Self::try_with_combine(batch_size, move |batch| Ok(combine(batch)))
    }

    pub fn try_with_combine<F>(batch_size: usize, combine: F) -> Self
    where
        F: Fn(Vec<In>) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        Self::with_executor(batch_size, Executor::thread(transport::one_to_one(combine)))
    }

    /// Batches are sent to child processes whole; the child serves
    /// `Vec<In> -> Out` with [`serve_one2one`](crate::process::serve_one2one)
    pub fn process(batch_size: usize, command: WorkerCommand) -> Self
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        Self::with_executor(batch_size, process::executor(command))
    }

    pub fn with_executor(batch_size: usize, executor: Executor<Vec<In>, Out>) -> Self {
        Self {
            batch_size,
            partial: PartialBatch::default(),
            executor,
            config: StageConfig::default(),
        }
    }

    /// Policy for a final batch shorter than `batch_size`
    pub fn partial_batch(mut self, partial: PartialBatch) -> Self {
        self.partial = partial;
        self
    }

    stage_setters!();
}

impl<In, Out> Stage for Many2One<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Input = In;
    type Output = Out;

    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn kind(&self) -> StageKind {
        StageKind::Many2One {
            batch_size: self.batch_size,
        }
    }

    fn backend(&self) -> Backend {
        self.executor.backend()
    }

    fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.batch_size == 0 {
            return Err(PipelineError::ConfigError(
                "many2one batch size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn start(
        self,
        ctx: StageContext,
        input: InterruptableQueue<Message<In>>,
        output: InterruptableQueue<Message<Out>>,
        runner: &mut StageRunner,
    ) -> Result<()> {
        runner.ensure_idle()?;
        let latch = EndLatch::new(self.config.n_workers);
        let gate: BatchGate = Arc::new(Mutex::new(()));
        for worker in 0..self.config.n_workers {
            let ctx = ctx.clone();
            let executor = self.executor.clone();
            let input = input.clone();
            let output = output.clone();
            let latch = Arc::clone(&latch);
            let gate = Arc::clone(&gate);
            let (batch_size, partial) = (self.batch_size, self.partial);
            runner.spawn(worker, move || {
                stage::run_batch_worker(ctx, worker, executor, batch_size, partial, gate, input, output, latch)
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::CancellationToken;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(20);

    struct Harness<In, Out> {
        token: CancellationToken,
        input: InterruptableQueue<Message<In>>,
        output: InterruptableQueue<Message<Out>>,
        runner: StageRunner,
        ctx: StageContext,
    }

    impl<In: Send + 'static, Out: Send + 'static> Harness<In, Out> {
        fn new(buffer_size: usize) -> Self {
            let token = CancellationToken::new();
            Self {
                input: InterruptableQueue::new(buffer_size, POLL, token.clone()).unwrap(),
                output: InterruptableQueue::new(buffer_size, POLL, token.clone()).unwrap(),
                runner: StageRunner::new("under-test"),
                ctx: StageContext::new("under-test", token.clone()),
                token,
            }
        }

        fn start<S: Stage<Input = In, Output = Out>>(&mut self, stage: S) {
            stage
                .start(self.ctx.clone(), self.input.clone(), self.output.clone(), &mut self.runner)
                .unwrap();
        }

        /// Feed all inputs and an end marker from a helper thread, collect
        /// results until the end marker comes out
        fn run(&mut self, inputs: Vec<In>) -> Vec<Out> {
            let feeder = {
                let input = self.input.clone();
                std::thread::spawn(move || {
                    for item in inputs {
                        input.put(Message::Item(item)).unwrap();
                    }
                    input.put(Message::End).unwrap();
                })
            };
            let mut results = Vec::new();
            loop {
                let message = self.output.get().unwrap();
                self.output.task_done();
                match message {
                    Message::Item(item) => results.push(item),
                    Message::End => break,
                }
            }
            feeder.join().unwrap();
            self.runner.join().unwrap();
            self.input.join();
            self.output.join();
            results
        }
    }

    #[test]
    fn test_one2one_single_worker_keeps_order() {
        let mut harness = Harness::new(20);
        harness.start(One2One::new(|x: i64| x * x));
        let inputs: Vec<i64> = (0..200).collect();
        let expected: Vec<i64> = inputs.iter().map(|x| x * x).collect();
        assert_eq!(harness.run(inputs), expected);
    }

    #[test]
    fn test_one2one_many_workers_same_multiset() {
        for workers in [4, 10] {
            let mut harness = Harness::new(20);
            harness.start(One2One::new(|x: i64| x * x).workers(workers));
            let inputs: Vec<i64> = (0..200).collect();
            let mut expected: Vec<i64> = inputs.iter().map(|x| x * x).collect();
            let mut results = harness.run(inputs);
            results.sort_unstable();
            expected.sort_unstable();
            assert_eq!(results, expected);
        }
    }

    #[test]
    fn test_one2many_preserves_internal_order() {
        let mut harness = Harness::new(2);
        harness.start(One2Many::new(|x: u32| (0..x).map(move |i| (x, i))));
        let results = harness.run(vec![3, 0, 2, 1]);
        assert_eq!(
            results,
            vec![(3, 0), (3, 1), (3, 2), (2, 0), (2, 1), (1, 0)]
        );
    }

    #[test]
    fn test_many2one_exact_batches() {
        let mut harness = Harness::new(4);
        harness.start(Many2One::new(3));
        let results = harness.run((0..9).collect::<Vec<u8>>());
        assert_eq!(results, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]]);
    }

    #[test]
    fn test_many2one_emits_short_final_batch() {
        let mut harness = Harness::new(4);
        harness.start(Many2One::with_combine(3, |batch: Vec<u32>| batch.iter().sum::<u32>()));
        assert_eq!(harness.run(vec![1, 2, 3, 4, 5]), vec![6, 9]);
    }

    #[test]
    fn test_many2one_drops_short_final_batch() {
        let mut harness = Harness::new(4);
        harness.start(Many2One::new(2).partial_batch(PartialBatch::Drop));
        assert_eq!(harness.run(vec![1, 2, 3]), vec![vec![1, 2]]);
    }

    #[test]
    fn test_many2one_workers_share_consecutive_batches() {
        let mut harness = Harness::new(8);
        harness.start(Many2One::new(4).workers(3));
        let mut batches = harness.run((0..60u32).collect());
        batches.sort_unstable_by_key(|batch| batch[0]);

        let expected: Vec<Vec<u32>> = (0..15).map(|i| (i * 4..i * 4 + 4).collect()).collect();
        assert_eq!(batches, expected);
    }

    #[test]
    fn test_many2one_workers_leave_one_short_batch() {
        let mut harness = Harness::new(8);
        harness.start(Many2One::new(4).workers(3).partial_batch(PartialBatch::Drop));
        let mut batches = harness.run((0..22u32).collect());
        batches.sort_unstable_by_key(|batch| batch[0]);

        // Only the trailing 20, 21 are dropped
        let expected: Vec<Vec<u32>> = (0..5).map(|i| (i * 4..i * 4 + 4).collect()).collect();
        assert_eq!(batches, expected);
    }

    #[test]
    fn test_many2one_zero_batch_invalid() {
        let stage: Many2One<u8, Vec<u8>> = Many2One::new(0);
        assert!(matches!(stage.validate(), Err(PipelineError::ConfigError(_))));
    }

    #[test]
    fn test_function_error_cancels_and_is_recorded() {
        let mut harness: Harness<i32, i32> = Harness::new(4);
        harness.start(
            One2One::try_new(|x: i32| {
                anyhow::ensure!(x != 3, "refusing {}", x);
                Ok(x)
            })
            .workers(2),
        );
        for x in 0..5 {
            if harness.input.put(Message::Item(x)).is_err() {
                break;
            }
        }
        harness.runner.join().unwrap();
        assert!(harness.token.is_cancelled());
        let err = harness.ctx.take_failure().unwrap();
        assert!(err.to_string().contains("refusing 3"));
    }

    #[test]
    fn test_panicking_function_becomes_stage_error() {
        let mut harness: Harness<i32, i32> = Harness::new(4);
        harness.start(One2One::new(|_: i32| -> i32 { panic!("kaboom") }));
        harness.input.put(Message::Item(1)).unwrap();
        harness.runner.join().unwrap();
        let err = harness.ctx.take_failure().unwrap();
        assert!(matches!(err, PipelineError::StageError { .. }));
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_runner_rejects_second_start() {
        let mut harness: Harness<u8, u8> = Harness::new(2);
        harness.start(One2One::new(|x: u8| x));
        let again = One2One::new(|x: u8| x).start(
            harness.ctx.clone(),
            harness.input.clone(),
            harness.output.clone(),
            &mut harness.runner,
        );
        assert!(matches!(again, Err(PipelineError::AlreadyStarted)));
        assert_eq!(harness.runner.worker_count(), 1);

        harness.token.cancel("test over");
        harness.runner.join().unwrap();
    }

    #[test]
    fn test_source_feeds_then_ends() {
        let token = CancellationToken::new();
        let output = InterruptableQueue::new(3, POLL, token.clone()).unwrap();
        let mut runner = StageRunner::new("source");
        Source::new(vec!["a", "b", "c", "d"])
            .start(StageContext::new("source", token), output.clone(), &mut runner)
            .unwrap();

        let mut seen = Vec::new();
        loop {
            let message = output.get().unwrap();
            output.task_done();
            match message {
                Message::Item(item) => seen.push(item),
                Message::End => break,
            }
        }
        runner.join().unwrap();
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_source_error_fails_stage() {
        let token = CancellationToken::new();
        let output = InterruptableQueue::new(3, POLL, token.clone()).unwrap();
        let mut runner = StageRunner::new("source");
        let ctx = StageContext::new("source", token.clone());
        let items = vec![Ok(1), Err(anyhow::anyhow!("corrupt record")), Ok(3)];
        Source::try_new(items)
            .start(ctx.clone(), output.clone(), &mut runner)
            .unwrap();
        runner.join().unwrap();
        assert!(token.is_cancelled());
        assert!(ctx.take_failure().unwrap().to_string().contains("corrupt record"));
        assert_eq!(output.get().unwrap(), Message::Item(1));
    }
}
