//! How a worker hands one unit of work to the stage function.
//!
//! The worker loop is identical for every backend. It owns one [`Transport`]
//! and calls it once per unit of work; the transport either runs the
//! function on the worker's own thread or forwards the unit to a dedicated
//! worker process (see [`crate::process`]).

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Where a stage's function executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// OS threads sharing the pipeline's memory
    Thread,
    /// One child process per worker; items cross a serialization boundary
    Process,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => f.write_str("thread"),
            Self::Process => f.write_str("process"),
        }
    }
}

/// Callback receiving each result of a call, in order.
///
/// Each push may block on a full output queue and fails with
/// [`PipelineError::Cancelled`] once the pipeline is shutting down.
pub type Emit<'a, Out> = dyn FnMut(Out) -> Result<()> + 'a;

/// Why a call did not complete
#[derive(Debug)]
pub enum CallError {
    /// An output push was interrupted by the token
    Cancelled,
    /// The user function returned an error or panicked
    Function(anyhow::Error),
    /// The transport itself broke (worker process died, bad frame, ...)
    Transport(PipelineError),
}

impl From<PipelineError> for CallError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Cancelled => Self::Cancelled,
            other => Self::Transport(other),
        }
    }
}

/// One worker's connection to the stage function
pub trait Transport<In, Out>: Send {
    /// Run the function on `input`, pushing every result through `emit`
    fn call(&mut self, input: In, emit: &mut Emit<'_, Out>) -> std::result::Result<(), CallError>;

    /// Release resources held by this worker (child process, pipes)
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Function signature every in-process stage function is adapted to
pub type StageFn<In, Out> =
    dyn Fn(In, &mut Emit<'_, Out>) -> std::result::Result<(), CallError> + Send + Sync;

/// Runs the stage function on the calling worker thread
pub struct ThreadTransport<In, Out> {
    function: Arc<StageFn<In, Out>>,
}

impl<In, Out> ThreadTransport<In, Out> {
    pub fn new(function: Arc<StageFn<In, Out>>) -> Self {
        Self { function }
    }
}

impl<In, Out> Transport<In, Out> for ThreadTransport<In, Out>
where
    In: Send,
    Out: Send,
{
    fn call(&mut self, input: In, emit: &mut Emit<'_, Out>) -> std::result::Result<(), CallError> {
        (self.function)(input, emit)
    }
}

type ConnectFn<In, Out> = dyn Fn(&str, usize) -> Result<Box<dyn Transport<In, Out>>> + Send + Sync;

/// Opens one transport per worker of a stage
pub struct Executor<In, Out> {
    backend: Backend,
    connect: Arc<ConnectFn<In, Out>>,
}

impl<In, Out> Clone for Executor<In, Out> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend,
            connect: Arc::clone(&self.connect),
        }
    }
}

impl<In, Out> Executor<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Every worker shares `function` and calls it on its own thread
    pub fn thread(function: Arc<StageFn<In, Out>>) -> Self {
        Self {
            backend: Backend::Thread,
            connect: Arc::new(move |_stage, _worker| {
                Ok(Box::new(ThreadTransport::new(Arc::clone(&function))) as Box<dyn Transport<In, Out>>)
            }),
        }
    }

    /// Workers obtain their transport from `connect(stage, worker)`, e.g. by
    /// spawning a child process
    pub fn custom<F>(backend: Backend, connect: F) -> Self
    where
        F: Fn(&str, usize) -> Result<Box<dyn Transport<In, Out>>> + Send + Sync + 'static,
    {
        Self {
            backend,
            connect: Arc::new(connect),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn connect(&self, stage: &str, worker: usize) -> Result<Box<dyn Transport<In, Out>>> {
        (self.connect)(stage, worker)
    }
}

/// Pin a closure to the [`StageFn`] signature
pub(crate) fn stage_fn<In, Out, F>(function: F) -> Arc<StageFn<In, Out>>
where
    F: Fn(In, &mut Emit<'_, Out>) -> std::result::Result<(), CallError> + Send + Sync + 'static,
{
    Arc::new(function)
}

/// Adapt a fallible one-to-one function
pub(crate) fn one_to_one<In, Out, F>(function: F) -> Arc<StageFn<In, Out>>
where
    F: Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static,
{
    stage_fn(move |input, emit| {
        let output = function(input).map_err(CallError::Function)?;
        emit(output)?;
        Ok(())
    })
}

/// Adapt a fallible one-to-many function; results are pushed one by one as
/// the returned iterator yields them
pub(crate) fn one_to_many<In, Out, R, F>(function: F) -> Arc<StageFn<In, Out>>
where
    F: Fn(In) -> anyhow::Result<R> + Send + Sync + 'static,
    R: IntoIterator<Item = Out>,
{
    stage_fn(move |input, emit| {
        for output in function(input).map_err(CallError::Function)? {
            emit(output)?;
        }
        Ok(())
    })
}
