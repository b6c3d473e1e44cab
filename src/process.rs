//! Worker-process backend.
//!
//! Each worker of a process-backed stage owns one child process, spawned
//! from a [`WorkerCommand`]. The parent-side worker thread relays units of
//! work to the child over its stdin and reads results from its stdout.
//! Messages are serde_json payloads inside length-prefixed frames:
//!
//! ```text
//! parent -> child   Hello { version } | Call(input)
//! child  -> parent  HelloOk { version } | Output(result)* then Done | Failed { message }
//! ```
//!
//! Closing the child's stdin asks it to exit. The child side is implemented
//! by [`serve`], [`serve_one2one`] and [`serve_one2many`]; anything the child
//! wants to log must go to stderr.

use crate::error::{PipelineError, Result};
use crate::transport::{Backend, CallError, Emit, Executor, Transport};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const PROTOCOL_VERSION: u32 = 1;

/// Set in every worker process to its index within the stage
pub const WORKER_INDEX_ENV: &str = "STAGED_PIPELINE_WORKER";

/// Set in every worker process to the name of the stage it serves
pub const WORKER_STAGE_ENV: &str = "STAGED_PIPELINE_STAGE";

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const EXIT_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize, Deserialize)]
enum Request<T> {
    Hello { version: u32 },
    Call(T),
}

#[derive(Debug, Serialize, Deserialize)]
enum Response<T> {
    HelloOk { version: u32 },
    Output(T),
    Done,
    Failed { message: String },
}

fn write_frame<W: Write, T: Serialize>(mut w: W, msg: &T) -> Result<()> {
    let payload = serde_json::to_vec(msg)?;
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| PipelineError::TransportError("frame too large".into()))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

fn read_frame<R: Read, T: DeserializeOwned>(mut r: R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PipelineError::TransportError(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

fn is_eof(err: &PipelineError) -> bool {
    matches!(err, PipelineError::Io(io) if io.kind() == ErrorKind::UnexpectedEof)
}

/// How to launch one worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the running binary; its `main` is expected to detect the
    /// worker role (see [`worker_stage`]) and call one of the `serve` functions
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn command(&self, stage: &str, worker: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_STAGE_ENV, stage)
            .env(WORKER_INDEX_ENV, worker.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

/// Parent-side end of one worker process
pub struct ProcessTransport<In, Out> {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    // A call was abandoned mid-response; the child may be stuck writing
    interrupted: bool,
    reaped: bool,
    _items: PhantomData<fn(In) -> Out>,
}

impl<In, Out> ProcessTransport<In, Out>
where
    In: Serialize,
    Out: DeserializeOwned,
{
    /// Spawn the worker process and complete the version handshake
    pub fn spawn(command: &WorkerCommand, stage: &str, worker: usize) -> Result<Self> {
        let mut child = command.command(stage, worker).spawn().map_err(|e| {
            PipelineError::TransportError(format!(
                "failed to spawn worker process {} for stage `{stage}`: {e}",
                command.program.display()
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::TransportError("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::TransportError("failed to capture worker stdout".into()))?;

        let mut transport = Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
            interrupted: false,
            reaped: false,
            _items: PhantomData,
        };
        transport.send(&Request::<In>::Hello {
            version: PROTOCOL_VERSION,
        })?;
        match transport.recv()? {
            Response::HelloOk { version } if version == PROTOCOL_VERSION => {
                debug!(stage, worker, pid = transport.child.id(), "worker process ready");
                Ok(transport)
            }
            Response::HelloOk { version } => Err(PipelineError::TransportError(format!(
                "worker protocol mismatch: expected {PROTOCOL_VERSION}, got {version}"
            ))),
            Response::Failed { message } => Err(PipelineError::TransportError(message)),
            _ => Err(PipelineError::TransportError(
                "unexpected reply to handshake".into(),
            )),
        }
    }

    fn send(&mut self, request: &Request<In>) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::TransportError("worker stdin already closed".into()))?;
        write_frame(stdin, request)
    }

    fn recv(&mut self) -> Result<Response<Out>> {
        read_frame(&mut self.stdout).map_err(|err| {
            if is_eof(&err) {
                PipelineError::TransportError(format!(
                    "worker process {} exited unexpectedly",
                    self.child.id()
                ))
            } else {
                err
            }
        })
    }

    fn wait_for_exit(&mut self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                if status.success() {
                    return Ok(());
                }
                return Err(PipelineError::TransportError(format!(
                    "worker process {} exited with {status}",
                    self.child.id()
                )));
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL);
        }
        self.kill();
        Err(PipelineError::TransportError(format!(
            "worker process {} did not exit and was killed",
            self.child.id()
        )))
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl<In, Out> Transport<In, Out> for ProcessTransport<In, Out>
where
    In: Serialize + Send,
    Out: DeserializeOwned + Send,
{
    fn call(&mut self, input: In, emit: &mut Emit<'_, Out>) -> std::result::Result<(), CallError> {
        self.send(&Request::Call(input))?;
        loop {
            match self.recv()? {
                Response::Output(output) => {
                    if let Err(err) = emit(output) {
                        self.interrupted = true;
                        return Err(err.into());
                    }
                }
                Response::Done => return Ok(()),
                Response::Failed { message } => {
                    return Err(CallError::Function(anyhow::Error::msg(message)));
                }
                Response::HelloOk { .. } => {
                    return Err(CallError::Transport(PipelineError::TransportError(
                        "unexpected handshake reply during a call".into(),
                    )));
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        if self.interrupted {
            self.kill();
            return Ok(());
        }
        // EOF on stdin is the shutdown request
        drop(self.stdin.take());
        self.wait_for_exit(EXIT_GRACE)
    }
}

impl<In, Out> Drop for ProcessTransport<In, Out> {
    fn drop(&mut self) {
        if !self.reaped {
            warn!(pid = self.child.id(), "worker process still running at drop, killing it");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Executor whose workers each run `command` as a child process
pub fn executor<In, Out>(command: WorkerCommand) -> Executor<In, Out>
where
    In: Serialize + Send + 'static,
    Out: DeserializeOwned + Send + 'static,
{
    Executor::custom(Backend::Process, move |stage, worker| {
        let transport = ProcessTransport::<In, Out>::spawn(&command, stage, worker)?;
        Ok(Box::new(transport) as Box<dyn Transport<In, Out>>)
    })
}

/// Name of the stage this process serves, if it was started as a worker
pub fn worker_stage() -> Option<String> {
    std::env::var(WORKER_STAGE_ENV).ok()
}

/// Index of this worker within its stage, if it was started as a worker
pub fn worker_index() -> Option<usize> {
    std::env::var(WORKER_INDEX_ENV).ok()?.parse().ok()
}

/// Serve calls from the parent pipeline on stdin/stdout until stdin closes.
///
/// `handler` receives each input and pushes its results through the
/// callback; an error it returns is reported to the parent as a stage failure.
pub fn serve<In, Out, F>(mut handler: F) -> Result<()>
where
    In: DeserializeOwned,
    Out: Serialize,
    F: FnMut(In, &mut Emit<'_, Out>) -> anyhow::Result<()>,
{
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = BufWriter::new(stdout.lock());

    loop {
        let request: Request<In> = match read_frame(&mut reader) {
            Ok(request) => request,
            Err(err) if is_eof(&err) => return Ok(()),
            Err(err) => return Err(err),
        };
        match request {
            Request::Hello { version } if version == PROTOCOL_VERSION => {
                write_frame(&mut writer, &Response::<Out>::HelloOk { version })?;
            }
            Request::Hello { version } => {
                let message = format!(
                    "protocol version mismatch: parent={version}, worker={PROTOCOL_VERSION}"
                );
                write_frame(&mut writer, &Response::<Out>::Failed { message })?;
            }
            Request::Call(input) => {
                let outcome = {
                    let mut emit = |output: Out| -> Result<()> {
                        write_frame(&mut writer, &Response::Output(output))
                    };
                    handler(input, &mut emit)
                };
                let reply = match outcome {
                    Ok(()) => Response::<Out>::Done,
                    Err(err) => Response::Failed {
                        message: format!("{err:#}"),
                    },
                };
                write_frame(&mut writer, &reply)?;
            }
        }
    }
}

/// Serve a one-to-one function (also the child side of a `Many2One` stage,
/// whose input is the whole batch)
pub fn serve_one2one<In, Out, F>(mut function: F) -> Result<()>
where
    In: DeserializeOwned,
    Out: Serialize,
    F: FnMut(In) -> anyhow::Result<Out>,
{
    serve(move |input, emit: &mut Emit<'_, Out>| {
        emit(function(input)?)?;
        Ok(())
    })
}

/// Serve a one-to-many function; each result is sent as soon as it is produced
pub fn serve_one2many<In, Out, R, F>(mut function: F) -> Result<()>
where
    In: DeserializeOwned,
    Out: Serialize,
    R: IntoIterator<Item = Out>,
    F: FnMut(In) -> anyhow::Result<R>,
{
    serve(move |input, emit: &mut Emit<'_, Out>| {
        for output in function(input)? {
            emit(output)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::Call(vec![1u8, 2])).unwrap();
        let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - 4);

        let decoded: Request<Vec<u8>> = read_frame(Cursor::new(buf)).unwrap();
        assert!(matches!(decoded, Request::Call(ref v) if v == &[1, 2]));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let result: Result<Response<u8>> = read_frame(Cursor::new(buf));
        assert!(matches!(result, Err(PipelineError::TransportError(_))));
    }

    #[test]
    fn test_truncated_stream_is_eof() {
        let result: Result<Response<u8>> = read_frame(Cursor::new(vec![5, 0]));
        assert!(result.as_ref().is_err_and(is_eof));
    }

    #[test]
    fn test_missing_program_is_transport_error() {
        let command = WorkerCommand::new("/nonexistent/staged-pipeline-worker");
        let result = ProcessTransport::<u32, u32>::spawn(&command, "missing", 0);
        assert!(matches!(result, Err(PipelineError::TransportError(_))));
    }
}
