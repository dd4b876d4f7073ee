//! Local command execution using `tokio::process`

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::traits::{ChildProcess, ProcessReader, ProcessWriter, ShellBackend, StdinMode};
use crate::types::DirEntry;

/// Local shell backend
///
/// Spawns commands on the local machine with `tokio::process::Command`.
/// Arguments are passed directly to the program, no shell is involved.
/// On Unix every command leads its own process group, and killing it kills
/// the whole group, so `sh -c` pipelines go down together.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// Create a new local backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Process spawned by [`LocalBackend`]
#[derive(Debug)]
pub struct LocalProcess {
    child: Child,
    group: Option<u32>,
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            let _ = kill_process_group(group);
        }
    }
}

#[async_trait]
impl ChildProcess for LocalProcess {
    fn take_stdin(&mut self) -> Option<ProcessWriter> {
        self.child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as ProcessWriter)
    }

    fn take_stdout(&mut self) -> Option<ProcessReader> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as ProcessReader)
    }

    fn take_stderr(&mut self) -> Option<ProcessReader> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as ProcessReader)
    }

    async fn wait(&mut self) -> Result<i32, ExecError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        // The leader is reaped, its id may be reused
        self.group = None;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<(), ExecError> {
        if let Some(group) = self.group
            && let Err(e) = kill_process_group(group)
        {
            warn!(group, error = %e, "failed to kill process group");
        }

        match self.child.kill().await {
            Ok(()) => {
                self.group = None;
                Ok(())
            }
            // Already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(ExecError::IoError(e.to_string())),
        }
    }
}

/// Send `SIGKILL` to every process in process group `group`
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
fn kill_process_group(group: u32) -> std::io::Result<()> {
    let group = libc::pid_t::try_from(group)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // SAFETY: kill(2) takes plain integers and touches no memory of ours
    let rc = unsafe { libc::kill(-group, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl ShellBackend for LocalBackend {
    #[instrument(skip(self), level = "debug")]
    async fn spawn(
        &self,
        args: &[String],
        stdin: StdinMode,
    ) -> Result<Box<dyn ChildProcess>, ExecError> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| ExecError::SpawnError("empty command".to_string()))?;

        debug!(command = ?args, "spawning local command");

        let stdin = match stdin {
            StdinMode::Null => Stdio::null(),
            StdinMode::Piped => Stdio::piped(),
        };

        let mut command = Command::new(program);
        command
            .args(rest)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| ExecError::SpawnError(format!("{program}: {e}")))?;
        let group = if cfg!(unix) { child.id() } else { None };

        Ok(Box::new(LocalProcess { child, group }))
    }

    async fn exists(&self, path: &str) -> Result<bool, ExecError> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ls(&self, path: &str) -> Result<Vec<DirEntry>, ExecError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            entries.push(DirEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    #[instrument(skip(self, source), level = "debug")]
    async fn put_file(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        destination: &str,
    ) -> Result<(), ExecError> {
        let mut file = tokio::fs::File::create(destination).await?;
        let copied = tokio::io::copy(source, &mut file).await?;
        file.sync_all().await?;
        debug!(destination, bytes = copied, "file uploaded");
        Ok(())
    }

    async fn close(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
