//! SSH command execution using russh crate

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect, Sig, client};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::command;
use crate::error::ExecError;
use crate::exec::read_all;
use crate::traits::{ChildProcess, ProcessReader, ProcessWriter, ShellBackend, StdinMode};
use crate::transport::SshTransport;
use crate::types::DirEntry;

/// Buffer between the channel pump and the readers of stdout/stderr
const PIPE_CAPACITY: usize = 256 * 1024;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    /// Pinned server key; `None` accepts any key
    host_key: Option<ssh_key::PublicKey>,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.host_key {
            Some(expected) => {
                let matches = expected.key_data() == server_public_key.key_data();
                if !matches {
                    warn!(host = %self.host, "server host key does not match pinned key");
                }
                Ok(matches)
            }
            None => {
                warn!(host = %self.host, "no host key pinned, accepting server key");
                Ok(true)
            }
        }
    }
}

/// SSH shell backend
///
/// Manages one SSH session per shell; every command runs on its own
/// session channel. The connection is established on first use.
pub struct SshBackend {
    /// Connection configuration
    transport: SshTransport,
    /// Private key used for public key authentication
    key: Arc<PrivateKey>,
    /// Pinned server key
    host_key: Option<ssh_key::PublicKey>,
    /// SSH session (initialized on first use)
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshBackend")
            .field("hostname", &self.transport.hostname)
            .field("port", &self.transport.port)
            .field("username", &self.transport.username)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshBackend {
    /// Create a new SSH backend
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if the private key cannot be loaded and
    /// `ExecError::ConfigError` if the pinned host key does not parse
    pub fn new(transport: &SshTransport) -> Result<Self, ExecError> {
        let key = transport
            .private_key
            .load()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        let host_key = transport
            .host_key
            .as_deref()
            .map(ssh_key::PublicKey::from_openssh)
            .transpose()
            .map_err(|e| ExecError::ConfigError(format!("invalid host_key: {e}")))?;

        Ok(Self {
            transport: transport.clone(),
            key: Arc::new(key),
            host_key,
            session: Mutex::new(None),
        })
    }

    fn is_connected(&self) -> bool {
        // Only a best-effort view; a busy lock reads as disconnected
        self.session
            .try_lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Connect to the remote host
    #[instrument(skip(self), fields(host = %self.transport.hostname))]
    async fn connect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if session_lock.is_some() {
            return Ok(());
        }

        info!(
            host = %self.transport.hostname,
            port = self.transport.port,
            user = %self.transport.username,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler {
            host: self.transport.hostname.clone(),
            host_key: self.host_key.clone(),
        };

        let connect_timeout = Duration::from_secs(self.transport.connect_timeout);
        let mut session = timeout(
            connect_timeout,
            client::connect(
                config,
                (&self.transport.hostname[..], self.transport.port),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            ExecError::ConnectionFailed(format!("timed out after {connect_timeout:?}"))
        })?
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &self.transport.username,
                PrivateKeyWithHashAlg::new(Arc::clone(&self.key), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "Public key authentication failed".to_string(),
            ));
        }

        info!(host = %self.transport.hostname, "SSH connected and authenticated");

        *session_lock = Some(session);
        Ok(())
    }

    /// Run a command to completion, optionally feeding `input` to its stdin
    async fn run_collect(
        &self,
        args: &[String],
        input: Option<&mut (dyn AsyncRead + Send + Unpin)>,
    ) -> Result<(i32, String, String), ExecError> {
        let stdin_mode = if input.is_some() {
            StdinMode::Piped
        } else {
            StdinMode::Null
        };
        let mut process = self.spawn(args, stdin_mode).await?;
        let stdin = process.take_stdin();
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();

        let feed = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                tokio::io::copy(input, &mut stdin).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, stdout, stderr) = tokio::join!(feed, read_all(stdout), read_all(stderr));
        let exit_code = process.wait().await?;
        fed?;

        Ok((
            exit_code,
            String::from_utf8_lossy(&stdout?).into_owned(),
            String::from_utf8_lossy(&stderr?).into_owned(),
        ))
    }

    /// Disconnect from remote host
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if disconnection fails
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.transport.hostname, "SSH disconnected");
        }
        Ok(())
    }
}

#[async_trait]
impl ShellBackend for SshBackend {
    #[instrument(skip(self), fields(host = %self.transport.hostname))]
    async fn spawn(
        &self,
        args: &[String],
        stdin: StdinMode,
    ) -> Result<Box<dyn ChildProcess>, ExecError> {
        if args.is_empty() {
            return Err(ExecError::SpawnError("empty command".to_string()));
        }
        self.connect().await?;

        debug!(command = %command::join(args), "executing remote command");

        let channel = {
            let session_lock = self.session.lock().await;
            let session = session_lock.as_ref().ok_or(ExecError::NotConnected)?;
            session
                .channel_open_session()
                .await
                .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?
        };

        channel
            .exec(true, remote_command_line(args))
            .await
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let stdin = match stdin {
            StdinMode::Piped => Some(Box::new(Box::pin(channel.make_writer())) as ProcessWriter),
            StdinMode::Null => {
                channel
                    .eof()
                    .await
                    .map_err(|e| ExecError::IoError(e.to_string()))?;
                None
            }
        };

        Ok(Box::new(SshProcess::start(channel, stdin)))
    }

    async fn exists(&self, path: &str) -> Result<bool, ExecError> {
        let args = vec!["test".to_string(), "-e".to_string(), path.to_string()];
        match self.run_collect(&args, None).await? {
            (0, _, _) => Ok(true),
            (1, _, _) => Ok(false),
            (exit_code, stdout, stderr) => Err(ExecError::command_failed(
                exit_code,
                format!("{stdout}{stderr}"),
            )),
        }
    }

    #[instrument(skip(self), fields(host = %self.transport.hostname))]
    async fn ls(&self, path: &str) -> Result<Vec<DirEntry>, ExecError> {
        let args = vec![
            "ls".to_string(),
            "-1Ap".to_string(),
            "--".to_string(),
            path.to_string(),
        ];
        let (exit_code, stdout, stderr) = self.run_collect(&args, None).await?;
        if exit_code != 0 {
            return Err(ExecError::command_failed(
                exit_code,
                format!("{stdout}{stderr}"),
            ));
        }
        Ok(parse_ls_output(&stdout))
    }

    #[instrument(skip(self, source), fields(host = %self.transport.hostname))]
    async fn put_file(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        destination: &str,
    ) -> Result<(), ExecError> {
        let script = format!("cat > {}", command::quote(destination));
        let args = vec!["sh".to_string(), "-c".to_string(), script];
        let (exit_code, stdout, stderr) = self.run_collect(&args, Some(source)).await?;
        if exit_code != 0 {
            return Err(ExecError::command_failed(
                exit_code,
                format!("{stdout}{stderr}"),
            ));
        }
        debug!(destination, "file uploaded");
        Ok(())
    }

    async fn close(&self) -> Result<(), ExecError> {
        self.disconnect().await
    }

    fn backend_type(&self) -> &'static str {
        "ssh"
    }
}

/// Parse `ls -1Ap` output; directories carry a trailing slash
fn parse_ls_output(output: &str) -> Vec<DirEntry> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_suffix('/') {
            Some(name) => DirEntry::new(name, true),
            None => DirEntry::new(line, false),
        })
        .collect()
}

/// Shell command line sent to the server for `args`
///
/// The command runs in the background with the channel's stdin, under a
/// shell that kills its whole process group on `SIGTERM` or `SIGHUP`.
/// sshd starts every session in a new process group, so a signal on the
/// channel reaches each stage of a pipeline. The exit status is the
/// command's own.
fn remote_command_line(args: &[String]) -> String {
    let script = format!(
        "exec 3<&0; trap 'kill -KILL 0' HUP TERM; {} <&3 3<&- & wait $!",
        command::join(args)
    );
    command::join(&["sh", "-c", script.as_str()])
}

/// Command running on an SSH session channel
///
/// A pump task owns the channel and forwards its data into in-memory
/// pipes until the server closes the channel.
pub struct SshProcess {
    stdin: Option<ProcessWriter>,
    stdout: Option<ProcessReader>,
    stderr: Option<ProcessReader>,
    kill_tx: Option<oneshot::Sender<()>>,
    pump: JoinHandle<i32>,
    exit_code: Option<i32>,
}

impl SshProcess {
    fn start(channel: Channel<client::Msg>, stdin: Option<ProcessWriter>) -> Self {
        let (stdout_reader, stdout_writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_reader, stderr_writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();

        let pump = tokio::spawn(pump_channel(channel, stdout_writer, stderr_writer, kill_rx));

        Self {
            stdin,
            stdout: Some(Box::new(stdout_reader)),
            stderr: Some(Box::new(stderr_reader)),
            kill_tx: Some(kill_tx),
            pump,
            exit_code: None,
        }
    }
}

async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8]) {
    if let Some(writer) = pipe.as_mut()
        && writer.write_all(data).await.is_err()
    {
        // reader dropped, discard the rest
        *pipe = None;
    }
}

async fn pump_channel(
    mut channel: Channel<client::Msg>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    mut kill_rx: oneshot::Receiver<()>,
) -> i32 {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut exit_code = -1;

    loop {
        tokio::select! {
            _ = &mut kill_rx => {
                let _ = channel.signal(Sig::TERM).await;
                let _ = channel.close().await;
                break;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => forward(&mut stdout, &data).await,
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    forward(&mut stderr, &data).await;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = exit_status.cast_signed();
                }
                Some(ChannelMsg::Eof) => {
                    stdout = None;
                    stderr = None;
                }
                None => break,
                Some(_) => {}
            }
        }
    }

    exit_code
}

#[async_trait]
impl ChildProcess for SshProcess {
    fn take_stdin(&mut self) -> Option<ProcessWriter> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<ProcessReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<ProcessReader> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> Result<i32, ExecError> {
        if let Some(exit_code) = self.exit_code {
            return Ok(exit_code);
        }
        let exit_code = (&mut self.pump)
            .await
            .map_err(|e| ExecError::IoError(format!("channel pump failed: {e}")))?;
        self.exit_code = Some(exit_code);
        Ok(exit_code)
    }

    async fn kill(&mut self) -> Result<(), ExecError> {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeySource;

    #[test]
    fn test_parse_ls_output() {
        let entries = parse_ls_output("auto-2026-10-18/\nnotes.txt\n.hidden\n");
        assert_eq!(
            entries,
            vec![
                DirEntry::new("auto-2026-10-18", true),
                DirEntry::new("notes.txt", false),
                DirEntry::new(".hidden", false),
            ]
        );
    }

    async fn run_remote_line(args: &[&str], input: &[u8]) -> (i32, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        let line = remote_command_line(&args);
        let backend = crate::local::LocalBackend::new();
        let mut process = backend
            .spawn(
                &["sh".to_string(), "-c".to_string(), line],
                StdinMode::Piped,
            )
            .await
            .unwrap();

        let mut stdin = process.take_stdin().unwrap();
        stdin.write_all(input).await.unwrap();
        stdin.shutdown().await.unwrap();
        drop(stdin);

        let mut out = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        (process.wait().await.unwrap(), out)
    }

    #[tokio::test]
    async fn test_remote_line_keeps_stdin_and_status() {
        let (code, out) = run_remote_line(&["sh", "-c", "cat; exit 3"], b"stream").await;

        assert_eq!(code, 3);
        assert_eq!(out, "stream");
    }

    #[tokio::test]
    async fn test_remote_line_term_kills_command() {
        // The command signals the wrapper shell the way sshd relays a
        // channel signal, then blocks
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_remote_line(&["sh", "-c", "kill -TERM $PPID; exec sleep 30"], b""),
        )
        .await
        .expect("wrapper should kill the command on SIGTERM");

        assert_ne!(outcome.0, 0);
    }

    #[test]
    fn test_new_rejects_bad_key() {
        let transport = SshTransport::new(
            "backup.example.com",
            KeySource::Inline("not a key".to_string()),
        );
        let result = SshBackend::new(&transport);
        assert!(matches!(result, Err(ExecError::SshKeyError(_))));
    }

    // These tests require an SSH server - marked as ignored
    #[tokio::test]
    #[ignore = "requires SSH server (ZFSREPL_TEST_SSH_HOST, ZFSREPL_TEST_SSH_KEY)"]
    async fn test_ssh_exec_roundtrip() {
        let host = std::env::var("ZFSREPL_TEST_SSH_HOST").unwrap();
        let key = std::env::var("ZFSREPL_TEST_SSH_KEY").unwrap();
        let transport = SshTransport::new(host, KeySource::Path(key.into()));
        let backend = SshBackend::new(&transport).unwrap();

        let args = vec!["echo".to_string(), "hello".to_string()];
        let (exit_code, stdout, _) = backend.run_collect(&args, None).await.unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(stdout, "hello\n");
        assert!(backend.exists("/").await.unwrap());

        backend.disconnect().await.unwrap();
    }
}
