//! Backend traits implemented by every transport

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ExecError;
use crate::types::DirEntry;

/// Readable end of a child's output pipe
pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable end of a child's input pipe
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How a spawned command's stdin is wired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdinMode {
    /// Command sees an empty stdin
    #[default]
    Null,
    /// Caller writes to the command through [`ChildProcess::take_stdin`]
    Piped,
}

/// A command started by a [`ShellBackend`]
#[async_trait]
pub trait ChildProcess: Send {
    /// Take the stdin pipe (only present for [`StdinMode::Piped`])
    fn take_stdin(&mut self) -> Option<ProcessWriter>;

    /// Take the stdout pipe
    fn take_stdout(&mut self) -> Option<ProcessReader>;

    /// Take the stderr pipe
    fn take_stderr(&mut self) -> Option<ProcessReader>;

    /// Wait for the command to exit and return its exit code.
    ///
    /// Must be cancel safe: dropping the future and calling `kill`
    /// afterwards is how executions are stopped.
    async fn wait(&mut self) -> Result<i32, ExecError>;

    /// Kill the command (best effort)
    async fn kill(&mut self) -> Result<(), ExecError>;
}

/// Execution surface of one transport backend
#[async_trait]
pub trait ShellBackend: Send + Sync + fmt::Debug {
    /// Start `args` without waiting for it to finish
    async fn spawn(
        &self,
        args: &[String],
        stdin: StdinMode,
    ) -> Result<Box<dyn ChildProcess>, ExecError>;

    /// Check whether `path` exists
    async fn exists(&self, path: &str) -> Result<bool, ExecError>;

    /// List the entries of directory `path` (non-recursive)
    async fn ls(&self, path: &str) -> Result<Vec<DirEntry>, ExecError>;

    /// Write everything from `source` to `destination`, replacing it
    async fn put_file(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        destination: &str,
    ) -> Result<(), ExecError>;

    /// Release backend resources
    async fn close(&self) -> Result<(), ExecError>;

    /// Get backend type name (for logging)
    fn backend_type(&self) -> &'static str;
}
