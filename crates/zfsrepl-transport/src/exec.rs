//! Handle to one in-flight command

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::shell::Shell;
use crate::traits::{ChildProcess, ProcessReader, StdinMode};
use crate::types::{Encoding, ExecOptions};

/// How long output tasks may keep running after a stopped command was killed
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of an [`AsyncExec`] or a `ReplicationProcess`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Built, not yet started
    Created,
    /// `run` succeeded, exit status not yet observed
    Running,
    /// Exit status known (zero or not)
    Completed,
    /// Terminated through `stop`
    Stopped,
    /// Could not start or lost the command
    Failed,
}

/// Cloneable handle that stops an execution from any task
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request termination
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Whether termination was requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolve once a stop was requested
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stopped| *stopped).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// One command invocation on a [`Shell`]
///
/// Created by [`Shell::exec_async`]; runs exactly one process.
pub struct AsyncExec {
    id: String,
    shell: Shell,
    args: Vec<String>,
    encoding: Encoding,
    sink: Option<mpsc::UnboundedSender<String>>,
    state: ExecState,
    stop: StopHandle,
    task: Option<JoinHandle<Result<String, ExecError>>>,
    outcome: Option<Result<String, ExecError>>,
}

impl AsyncExec {
    /// Prepare an execution of `args` on `shell`
    pub fn new(shell: Shell, args: Vec<String>, options: ExecOptions) -> Self {
        Self {
            id: shell.next_exec_id(),
            shell,
            args,
            encoding: options.encoding,
            sink: options.stdout,
            state: ExecState::Created,
            stop: StopHandle::new(),
            task: None,
            outcome: None,
        }
    }

    /// Diagnostic identifier (`shell-N/exec-M`)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Command arguments
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ExecState {
        self.state
    }

    /// Handle for stopping this execution from another task
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Start the command
    ///
    /// Only waits for the process or channel to be set up.
    ///
    /// # Errors
    /// Returns `ExecError::AlreadyStarted` on a second call, or the backend's
    /// error if the command could not be started
    #[instrument(skip(self), fields(exec = %self.id))]
    pub async fn run(&mut self) -> Result<(), ExecError> {
        if self.state != ExecState::Created {
            return Err(ExecError::AlreadyStarted);
        }
        if let Err(e) = self.shell.ensure_open() {
            self.state = ExecState::Failed;
            return Err(e);
        }

        debug!(command = ?self.args, "starting command");

        let process = match self.shell.backend().spawn(&self.args, StdinMode::Null).await {
            Ok(process) => process,
            Err(e) => {
                self.state = ExecState::Failed;
                return Err(e);
            }
        };

        self.task = Some(tokio::spawn(drive(
            process,
            self.sink.take(),
            self.encoding,
            self.stop.subscribe(),
            self.id.clone(),
        )));
        self.state = ExecState::Running;
        Ok(())
    }

    /// Wait for the command to finish
    ///
    /// Returns the decoded stdout, or an empty string when stdout was
    /// streamed into a sink. Calling it again returns the same outcome.
    ///
    /// # Errors
    /// `ExecError::CommandFailed` for a non-zero exit, `ExecError::Stopped` after
    /// `stop`, `ExecError::NotStarted` before `run`
    pub async fn wait(&mut self) -> Result<String, ExecError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(task) = self.task.as_mut() else {
            return Err(ExecError::NotStarted);
        };

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ExecError::IoError(format!("execution task failed: {e}"))),
        };
        self.task = None;

        self.state = match &outcome {
            Ok(_) | Err(ExecError::CommandFailed { .. }) => ExecState::Completed,
            Err(ExecError::Stopped) => ExecState::Stopped,
            Err(_) => ExecState::Failed,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Request termination of the command (best effort)
    pub fn stop(&self) {
        debug!(exec = %self.id, "stop requested");
        self.stop.stop();
    }
}

impl fmt::Debug for AsyncExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncExec")
            .field("id", &self.id)
            .field("args", &self.args)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for AsyncExec {
    fn drop(&mut self) {
        // Nobody can wait for the result any more
        if self.task.is_some() {
            self.stop.stop();
        }
    }
}

/// Read a pipe to the end
pub(crate) async fn read_all(pipe: Option<ProcessReader>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Join an output task, aborting it if it outlives `grace`
pub(crate) async fn finish_within<T>(task: &mut JoinHandle<T>, grace: Duration) {
    if timeout(grace, &mut *task).await.is_err() {
        task.abort();
    }
}

async fn join_output(
    task: &mut JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, ExecError> {
    match task.await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(ExecError::IoError(e.to_string())),
        Err(e) => Err(ExecError::IoError(format!("output task failed: {e}"))),
    }
}

/// Copy `reader` into `sink` line by line
///
/// Lines keep their terminators. The sink is dropped when this returns,
/// which closes the channel and marks the end of the stream. On a read or
/// decode error the rest of the output is drained and discarded.
pub(crate) async fn copy_lines(
    reader: ProcessReader,
    sink: mpsc::UnboundedSender<String>,
    encoding: Encoding,
    exec_id: &str,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(exec = %exec_id, error = %e, "copying stdout failed");
                break;
            }
        }

        match encoding.decode(std::mem::take(&mut line)) {
            Ok(text) => {
                if sink.send(text).is_err() {
                    debug!(exec = %exec_id, "stdout consumer went away");
                    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                    break;
                }
            }
            Err(e) => {
                warn!(exec = %exec_id, error = %e, "copying stdout failed");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }

    drop(sink);
}

async fn drive(
    mut process: Box<dyn ChildProcess>,
    sink: Option<mpsc::UnboundedSender<String>>,
    encoding: Encoding,
    mut stop_rx: watch::Receiver<bool>,
    exec_id: String,
) -> Result<String, ExecError> {
    let stdout = process.take_stdout();
    let stderr = process.take_stderr();
    let streamed = sink.is_some();

    let copy_id = exec_id.clone();
    let mut stdout_task = tokio::spawn(async move {
        match (stdout, sink) {
            (Some(stdout), Some(sink)) => {
                copy_lines(stdout, sink, encoding, &copy_id).await;
                Ok(Vec::new())
            }
            (stdout, _) => read_all(stdout).await,
        }
    });
    let mut stderr_task = tokio::spawn(read_all(stderr));

    let finished = tokio::select! {
        finished = async {
            let exit_code = process.wait().await?;
            let stdout = join_output(&mut stdout_task).await?;
            let stderr = join_output(&mut stderr_task).await?;
            Ok::<_, ExecError>((exit_code, stdout, stderr))
        } => finished,
        () = stopped(&mut stop_rx) => {
            debug!(exec = %exec_id, "killing command");
            if let Err(e) = process.kill().await {
                warn!(exec = %exec_id, error = %e, "failed to kill command");
            }
            let _ = timeout(STOP_GRACE, process.wait()).await;
            finish_within(&mut stdout_task, STOP_GRACE).await;
            finish_within(&mut stderr_task, STOP_GRACE).await;
            return Err(ExecError::Stopped);
        }
    };

    let (exit_code, stdout, stderr) = match finished {
        Ok(finished) => finished,
        Err(e) => {
            stdout_task.abort();
            stderr_task.abort();
            return Err(e);
        }
    };

    debug!(exec = %exec_id, status = exit_code, "command completed");

    if exit_code == 0 {
        if streamed {
            return Ok(String::new());
        }
        return encoding.decode(stdout);
    }

    let mut output = Encoding::Utf8Lossy.decode(stdout)?;
    output.push_str(&Encoding::Utf8Lossy.decode(stderr)?);
    Err(ExecError::CommandFailed { exit_code, output })
}
