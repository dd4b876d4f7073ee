//! Orchestration of one `zfs send | zfs recv` pipeline

use std::collections::VecDeque;
use std::fmt;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{ExecError, PipelineSide};
use crate::exec::{ExecState, STOP_GRACE, StopHandle, finish_within, read_all, stopped};
use crate::replication::observers::{ProgressCallback, ProgressObserver, ProgressObservers};
use crate::replication::progress::{Progress, parse_progress_line};
use crate::replication::task::{ReplicationDirection, ReplicationTask};
use crate::replication::throttle::{BandwidthLimiter, copy_limited};
use crate::replication::zfs;
use crate::shell::Shell;
use crate::traits::{ChildProcess, ProcessReader, StdinMode};
use crate::transport::Transport;

/// Non-progress stderr lines of `zfs send` kept for error reports
const DIAGNOSTIC_LINES: usize = 20;

/// One replication run between a local and a remote shell
///
/// The sending side is chosen by the task's direction. Bytes flow through
/// this process: sender stdout is copied (and rate-limited) into receiver
/// stdin, while the sender's stderr feeds the progress observers.
pub struct ReplicationProcess {
    id: String,
    transport: Transport,
    local_shell: Shell,
    remote_shell: Shell,
    task: ReplicationTask,
    observers: ProgressObservers,
    state: ExecState,
    stop: StopHandle,
    driver: Option<JoinHandle<Result<(), ExecError>>>,
    outcome: Option<Result<(), ExecError>>,
}

impl ReplicationProcess {
    /// Prepare a replication run; nothing is started until [`run`](Self::run)
    pub fn new(
        transport: Transport,
        local_shell: Shell,
        remote_shell: Shell,
        task: ReplicationTask,
    ) -> Self {
        Self {
            id: format!("replication-{}", task.id),
            transport,
            local_shell,
            remote_shell,
            task,
            observers: ProgressObservers::new(),
            state: ExecState::Created,
            stop: StopHandle::new(),
            driver: None,
            outcome: None,
        }
    }

    /// Diagnostic identifier (`replication-<task id>`)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport of the remote end
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Transfer parameters
    #[must_use]
    pub fn task(&self) -> &ReplicationTask {
        &self.task
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ExecState {
        self.state
    }

    /// Handle for stopping this run from another task
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Register a progress observer; allowed before and during a run
    pub fn add_progress_observer<O: ProgressObserver + 'static>(&self, observer: O) {
        self.observers.add(observer);
    }

    /// Register a progress closure that cannot fail
    pub fn add_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&str, u64, u64) + Send + Sync + 'static,
    {
        self.observers.add(ProgressCallback(callback));
    }

    /// Notify every registered observer in registration order
    pub fn notify_progress_observer(&self, snapshot: &str, current: u64, total: u64) {
        self.observers.notify(&self.id, snapshot, current, total);
    }

    /// `(sending, receiving)` shells
    fn endpoints(&self) -> (&Shell, &Shell) {
        match self.task.direction {
            ReplicationDirection::Push => (&self.local_shell, &self.remote_shell),
            ReplicationDirection::Pull => (&self.remote_shell, &self.local_shell),
        }
    }

    /// Start both sides of the pipeline
    ///
    /// Returns once both commands are running.
    ///
    /// # Errors
    /// `ExecError::AlreadyStarted` on a second call, or
    /// `ExecError::ReplicationFailed` naming the side that could not start
    #[instrument(skip(self), fields(process = %self.id))]
    pub async fn run(&mut self) -> Result<(), ExecError> {
        if self.state != ExecState::Created {
            return Err(ExecError::AlreadyStarted);
        }

        match self.start().await {
            Ok(driver) => {
                self.driver = Some(driver);
                self.state = ExecState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = ExecState::Failed;
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<JoinHandle<Result<(), ExecError>>, ExecError> {
        let (sending, receiving) = self.endpoints();
        sending
            .ensure_open()
            .map_err(|e| side_error(PipelineSide::Send, e))?;
        receiving
            .ensure_open()
            .map_err(|e| side_error(PipelineSide::Receive, e))?;

        let sender_args = zfs::sender_command(&self.task);
        let receiver_args = zfs::receiver_command(&self.task);

        info!(
            mode = ?self.task.mode(),
            direction = ?self.task.direction,
            source = %self.task.source_dataset,
            target = %self.task.target_dataset,
            snapshot = %self.task.snapshot,
            "starting replication"
        );
        debug!(sender = ?sender_args, receiver = ?receiver_args, "pipeline commands");

        let mut receiver = receiving
            .backend()
            .spawn(&receiver_args, StdinMode::Piped)
            .await
            .map_err(|e| side_error(PipelineSide::Receive, e))?;

        let mut sender = match sending.backend().spawn(&sender_args, StdinMode::Null).await {
            Ok(sender) => sender,
            Err(e) => {
                let _ = receiver.kill().await;
                return Err(side_error(PipelineSide::Send, e));
            }
        };

        let (Some(mut stream), Some(mut sink)) = (sender.take_stdout(), receiver.take_stdin())
        else {
            let _ = sender.kill().await;
            let _ = receiver.kill().await;
            return Err(ExecError::IoError(
                "pipeline stdio not available".to_string(),
            ));
        };

        let limiter = self.task.speed_limit.map(BandwidthLimiter::new);
        let pump = tokio::spawn(async move { copy_limited(&mut stream, &mut sink, limiter).await });
        let progress = tokio::spawn(watch_progress(
            sender.take_stderr(),
            self.observers.clone(),
            self.id.clone(),
            self.task.snapshot.clone(),
        ));
        let receive_stderr = tokio::spawn(read_all(receiver.take_stderr()));

        let pipeline = Pipeline {
            id: self.id.clone(),
            sender,
            receiver,
            pump,
            progress,
            receive_stderr,
        };
        Ok(tokio::spawn(pipeline.drive(self.stop.subscribe())))
    }

    /// Wait for the pipeline to finish
    ///
    /// Calling it again returns the same outcome.
    ///
    /// # Errors
    /// `ExecError::ReplicationFailed` naming the failing side,
    /// `ExecError::Stopped` after `stop`, `ExecError::NotStarted` before `run`
    pub async fn wait(&mut self) -> Result<(), ExecError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(driver) = self.driver.as_mut() else {
            return Err(ExecError::NotStarted);
        };

        let outcome = match driver.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ExecError::IoError(format!("replication task failed: {e}"))),
        };
        self.driver = None;

        self.state = match &outcome {
            Ok(()) => ExecState::Completed,
            Err(ExecError::Stopped) => ExecState::Stopped,
            Err(_) => ExecState::Failed,
        };
        match &outcome {
            Ok(()) => info!(process = %self.id, "replication completed"),
            Err(e) => warn!(process = %self.id, error = %e, "replication did not complete"),
        }
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Stop both sides of the pipeline (best effort)
    pub fn stop(&self) {
        debug!(process = %self.id, "stop requested");
        self.stop.stop();
    }
}

impl fmt::Debug for ReplicationProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationProcess")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("task", &self.task)
            .field("state", &self.state)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for ReplicationProcess {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.stop.stop();
        }
    }
}

fn side_error(side: PipelineSide, source: ExecError) -> ExecError {
    ExecError::ReplicationFailed {
        side,
        source: Box::new(source),
    }
}

/// Read `zfs send` stderr, notifying observers on progress lines
///
/// Returns the last non-progress lines for error reports.
async fn watch_progress(
    stderr: Option<ProcessReader>,
    observers: ProgressObservers,
    process_id: String,
    snapshot: String,
) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };

    let mut lines = BufReader::new(stderr).lines();
    let mut progress = Progress::default();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_LINES);

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_progress_line(&line) {
                Some(parsed) => {
                    if progress.apply(parsed) {
                        observers.notify(&process_id, &snapshot, progress.current, progress.total);
                    }
                }
                None => {
                    if tail.len() == DIAGNOSTIC_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(process = %process_id, error = %e, "reading send progress failed");
                let mut rest = lines.into_inner();
                let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
                break;
            }
        }
    }

    Vec::from(tail).join("\n")
}

enum Exited {
    Sender(Result<i32, ExecError>),
    Receiver(Result<i32, ExecError>),
    Stopped,
}

/// Running send and receive commands plus the tasks connecting them
struct Pipeline {
    id: String,
    sender: Box<dyn ChildProcess>,
    receiver: Box<dyn ChildProcess>,
    pump: JoinHandle<std::io::Result<u64>>,
    progress: JoinHandle<String>,
    receive_stderr: JoinHandle<std::io::Result<Vec<u8>>>,
}

impl Pipeline {
    async fn drive(mut self, mut stop_rx: watch::Receiver<bool>) -> Result<(), ExecError> {
        let exited = tokio::select! {
            code = self.sender.wait() => Exited::Sender(code),
            code = self.receiver.wait() => Exited::Receiver(code),
            () = stopped(&mut stop_rx) => Exited::Stopped,
        };

        match exited {
            Exited::Stopped => {
                info!(process = %self.id, "stopping replication");
                self.halt().await;
                Err(ExecError::Stopped)
            }
            Exited::Sender(Ok(0)) => self.finish_receiver(&mut stop_rx).await,
            Exited::Receiver(Ok(0)) => self.finish_sender(&mut stop_rx).await,
            Exited::Sender(result) => Err(self.sender_failed(result).await),
            Exited::Receiver(result) => Err(self.receiver_failed(result).await),
        }
    }

    /// Sender is done; wait for the receiver to drain the stream
    async fn finish_receiver(
        &mut self,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), ExecError> {
        let result = tokio::select! {
            result = self.receiver.wait() => result,
            () = stopped(stop_rx) => {
                self.halt().await;
                return Err(ExecError::Stopped);
            }
        };
        match result {
            Ok(0) => {
                self.complete().await;
                Ok(())
            }
            result => Err(self.receiver_failed(result).await),
        }
    }

    /// Receiver exited cleanly before the sender
    async fn finish_sender(&mut self, stop_rx: &mut watch::Receiver<bool>) -> Result<(), ExecError> {
        let result = tokio::select! {
            result = self.sender.wait() => result,
            () = stopped(stop_rx) => {
                self.halt().await;
                return Err(ExecError::Stopped);
            }
        };
        match result {
            Ok(0) => {
                self.complete().await;
                Ok(())
            }
            result => Err(self.sender_failed(result).await),
        }
    }

    async fn sender_failed(&mut self, result: Result<i32, ExecError>) -> ExecError {
        // The pump closes receiver stdin once sender stdout ends, so the
        // receiver can keep its partial state.
        self.settle_receiver().await;
        let source = match result {
            Ok(exit_code) => {
                let output = self.send_diagnostics().await;
                ExecError::command_failed(exit_code, output)
            }
            Err(e) => e,
        };
        self.abort_tasks();
        warn!(process = %self.id, error = %source, "send side failed");
        side_error(PipelineSide::Send, source)
    }

    async fn receiver_failed(&mut self, result: Result<i32, ExecError>) -> ExecError {
        self.kill_sender().await;
        let source = match result {
            Ok(exit_code) => {
                let output = self.receive_diagnostics().await;
                ExecError::command_failed(exit_code, output)
            }
            Err(e) => {
                self.kill_receiver().await;
                e
            }
        };
        self.abort_tasks();
        warn!(process = %self.id, error = %source, "receive side failed");
        side_error(PipelineSide::Receive, source)
    }

    /// Kill the sender first so the receiver sees a truncated stream
    /// and keeps a resume token, then make sure the receiver is gone too.
    async fn halt(&mut self) {
        self.kill_sender().await;
        self.settle_receiver().await;
        self.abort_tasks();
    }

    async fn complete(&mut self) {
        match timeout(STOP_GRACE, &mut self.pump).await {
            Ok(Ok(Ok(bytes))) => debug!(process = %self.id, bytes, "stream copied"),
            Ok(Ok(Err(e))) => warn!(process = %self.id, error = %e, "stream copy ended with error"),
            Ok(Err(e)) => warn!(process = %self.id, error = %e, "stream copy task failed"),
            Err(_) => self.pump.abort(),
        }
        finish_within(&mut self.progress, STOP_GRACE).await;
        finish_within(&mut self.receive_stderr, STOP_GRACE).await;
    }

    async fn kill_sender(&mut self) {
        if let Err(e) = self.sender.kill().await {
            debug!(process = %self.id, error = %e, "failed to kill sender");
        }
        let _ = timeout(STOP_GRACE, self.sender.wait()).await;
    }

    async fn kill_receiver(&mut self) {
        if let Err(e) = self.receiver.kill().await {
            debug!(process = %self.id, error = %e, "failed to kill receiver");
        }
        let _ = timeout(STOP_GRACE, self.receiver.wait()).await;
    }

    /// Give the receiver a grace period to exit on its own, then kill it
    async fn settle_receiver(&mut self) {
        if !matches!(timeout(STOP_GRACE, self.receiver.wait()).await, Ok(Ok(_))) {
            self.kill_receiver().await;
        }
    }

    async fn send_diagnostics(&mut self) -> String {
        match timeout(STOP_GRACE, &mut self.progress).await {
            Ok(Ok(tail)) => tail,
            _ => {
                self.progress.abort();
                String::new()
            }
        }
    }

    async fn receive_diagnostics(&mut self) -> String {
        match timeout(STOP_GRACE, &mut self.receive_stderr).await {
            Ok(Ok(Ok(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => {
                self.receive_stderr.abort();
                String::new()
            }
        }
    }

    fn abort_tasks(&self) {
        self.pump.abort();
        self.progress.abort();
        self.receive_stderr.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(direction: ReplicationDirection) -> ReplicationTask {
        ReplicationTask::new("t1", direction, "tank/src", "backup/dst", "snap")
    }

    fn shells() -> (Shell, Shell) {
        (
            Transport::Local.shell().unwrap(),
            Transport::Local.shell().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_endpoints_follow_direction() {
        let (local, remote) = shells();

        let push = ReplicationProcess::new(
            Transport::Local,
            local.clone(),
            remote.clone(),
            task(ReplicationDirection::Push),
        );
        let (sending, receiving) = push.endpoints();
        assert_eq!(sending.id(), local.id());
        assert_eq!(receiving.id(), remote.id());

        let pull = ReplicationProcess::new(
            Transport::Local,
            local.clone(),
            remote.clone(),
            task(ReplicationDirection::Pull),
        );
        let (sending, receiving) = pull.endpoints();
        assert_eq!(sending.id(), remote.id());
        assert_eq!(receiving.id(), local.id());
    }

    #[tokio::test]
    async fn test_wait_before_run() {
        let (local, remote) = shells();
        let mut process = ReplicationProcess::new(
            Transport::Local,
            local,
            remote,
            task(ReplicationDirection::Push),
        );

        assert_eq!(process.id(), "replication-t1");
        assert!(matches!(process.wait().await, Err(ExecError::NotStarted)));
    }

    #[tokio::test]
    async fn test_missing_zfs_binary_fails_run() {
        let (local, remote) = shells();
        let mut process = ReplicationProcess::new(
            Transport::Local,
            local,
            remote,
            task(ReplicationDirection::Push).with_zfs_binary("/nonexistent/zfs"),
        );

        let err = process.run().await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::ReplicationFailed {
                side: PipelineSide::Receive,
                ..
            }
        ));
        assert_eq!(process.state(), ExecState::Failed);
    }

    #[tokio::test]
    async fn test_closed_shell_fails_run() {
        let (local, remote) = shells();
        remote.close().await.unwrap();
        let mut process = ReplicationProcess::new(
            Transport::Local,
            local,
            remote,
            task(ReplicationDirection::Push),
        );

        let err = process.run().await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::ReplicationFailed {
                side: PipelineSide::Receive,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_manual_notification_reaches_observers() {
        let (local, remote) = shells();
        let process = ReplicationProcess::new(
            Transport::Local,
            local,
            remote,
            task(ReplicationDirection::Push),
        );
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = std::sync::Arc::clone(&seen);
        process.add_progress_observer(
            move |snapshot: &str, current: u64, total: u64| -> Result<(), crate::replication::ObserverError> {
                recorder
                    .lock()
                    .unwrap()
                    .push((snapshot.to_string(), current, total));
                Ok(())
            },
        );

        process.notify_progress_observer("snap", 5, 0);
        assert_eq!(*seen.lock().unwrap(), vec![("snap".to_string(), 5, 0)]);
    }
}
