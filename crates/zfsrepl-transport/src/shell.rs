//! Command-execution surface bound to one transport

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncRead;
use tracing::{debug, info, instrument};

use crate::error::ExecError;
use crate::exec::AsyncExec;
use crate::ids::{self, IdGenerator};
use crate::traits::ShellBackend;
use crate::transport::Transport;
use crate::types::{DirEntry, ExecOptions};

/// Shell on one transport
///
/// Cheap to clone; clones share the backend connection and the closed
/// flag. Every `exec_async` call gets its own [`AsyncExec`], so concurrent
/// executions are tracked independently.
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

struct ShellInner {
    id: String,
    transport: Transport,
    backend: Arc<dyn ShellBackend>,
    exec_ids: IdGenerator,
    closed: AtomicBool,
}

impl Shell {
    /// Open a shell on `transport` using the process-wide id generator
    ///
    /// # Errors
    /// Returns an error if the transport's backend cannot be initialized
    pub fn new(transport: Transport) -> Result<Self, ExecError> {
        Self::with_ids(transport, ids::shell_ids())
    }

    /// Open a shell on `transport` taking its id from `ids`
    ///
    /// # Errors
    /// Returns an error if the transport's backend cannot be initialized
    pub fn with_ids(transport: Transport, ids: &IdGenerator) -> Result<Self, ExecError> {
        let backend = transport.backend()?;
        Ok(Self::with_backend(transport, backend, ids))
    }

    /// Open a shell over an explicit backend
    pub fn with_backend(
        transport: Transport,
        backend: Arc<dyn ShellBackend>,
        ids: &IdGenerator,
    ) -> Self {
        let id = format!("shell-{}", ids.next_id());
        debug!(shell = %id, transport = %transport, backend = backend.backend_type(), "shell opened");
        Self {
            inner: Arc::new(ShellInner {
                id,
                transport,
                backend,
                exec_ids: IdGenerator::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Diagnostic identifier (`shell-N`)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Transport this shell is bound to
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ShellBackend> {
        &self.inner.backend
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ExecError> {
        if self.is_closed() {
            return Err(ExecError::ShellClosed(self.inner.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn next_exec_id(&self) -> String {
        format!("{}/exec-{}", self.inner.id, self.inner.exec_ids.next_id())
    }

    /// Run a command to completion and return its decoded output
    ///
    /// # Errors
    /// Returns `ExecError::CommandFailed` for a non-zero exit code, or a
    /// transport error if the command could not be run
    pub async fn exec(
        &self,
        args: &[impl AsRef<str>],
        options: ExecOptions,
    ) -> Result<String, ExecError> {
        self.exec_async(args, options).await?.wait().await
    }

    /// Start a command and return its handle without waiting for it
    ///
    /// # Errors
    /// Returns an error if the command could not be started
    pub async fn exec_async(
        &self,
        args: &[impl AsRef<str>],
        options: ExecOptions,
    ) -> Result<AsyncExec, ExecError> {
        let args = args.iter().map(|a| a.as_ref().to_string()).collect();
        let mut exec = AsyncExec::new(self.clone(), args, options);
        exec.run().await?;
        Ok(exec)
    }

    /// Check whether `path` exists
    ///
    /// # Errors
    /// Returns an error if the check itself fails
    pub async fn exists(&self, path: &str) -> Result<bool, ExecError> {
        self.ensure_open()?;
        self.inner.backend.exists(path).await
    }

    /// List directory entries of `path`
    ///
    /// # Errors
    /// Returns an error if the directory cannot be listed
    pub async fn ls(&self, path: &str) -> Result<Vec<DirEntry>, ExecError> {
        self.ensure_open()?;
        self.inner.backend.ls(path).await
    }

    /// Upload everything read from `source` to `destination`, replacing it
    ///
    /// # Errors
    /// Returns an error if the upload fails
    pub async fn put_file(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        destination: &str,
    ) -> Result<(), ExecError> {
        self.ensure_open()?;
        self.inner.backend.put_file(source, destination).await
    }

    /// Close the shell and release backend resources
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns an error if the backend fails to shut down cleanly
    #[instrument(skip(self), fields(shell = %self.inner.id))]
    pub async fn close(&self) -> Result<(), ExecError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("closing shell");
        self.inner.backend.close().await
    }
}

impl fmt::Debug for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shell")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
