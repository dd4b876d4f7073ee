//! Error types for zfsrepl-transport

use std::fmt;

use thiserror::Error;

/// Errors that can occur while executing commands or replicating datasets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Command ran to completion with a non-zero exit code
    #[error("{}", command_failure_message(.exit_code, .output))]
    CommandFailed {
        /// Exit status code
        exit_code: i32,
        /// Captured output (stdout followed by stderr)
        output: String,
    },

    /// One side of a replication pipeline failed
    #[error("{side} side of replication failed: {source}")]
    ReplicationFailed {
        /// Which side failed
        side: PipelineSide,
        /// Failure reported by that side
        #[source]
        source: Box<ExecError>,
    },

    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Output could not be decoded with the requested encoding
    #[error("failed to decode command output: {0}")]
    Decode(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,

    /// Shell was closed
    #[error("shell {0} is closed")]
    ShellClosed(String),

    /// `run` was called twice on the same execution
    #[error("execution already started")]
    AlreadyStarted,

    /// `wait` was called before `run`
    #[error("execution not started")]
    NotStarted,

    /// Execution was stopped before it completed
    #[error("execution stopped")]
    Stopped,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

/// Side of a send/receive pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineSide {
    /// The `zfs send` side
    Send,
    /// The `zfs recv` side
    Receive,
}

impl fmt::Display for PipelineSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineSide::Send => f.write_str("send"),
            PipelineSide::Receive => f.write_str("receive"),
        }
    }
}

fn command_failure_message(exit_code: &i32, output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        format!("Command failed with code {exit_code}")
    } else {
        trimmed.to_string()
    }
}

impl ExecError {
    /// Build a command failure
    pub fn command_failed(exit_code: i32, output: impl Into<String>) -> Self {
        ExecError::CommandFailed {
            exit_code,
            output: output.into(),
        }
    }

    /// Exit code of a failed command, if this error carries one
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::CommandFailed { exit_code, .. } => Some(*exit_code),
            ExecError::ReplicationFailed { source, .. } => source.exit_code(),
            _ => None,
        }
    }

    /// Captured output of a failed command, if this error carries one
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::CommandFailed { output, .. } => Some(output),
            ExecError::ReplicationFailed { source, .. } => source.output(),
            _ => None,
        }
    }

    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::NotConnected
        )
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::IoError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_renders_trimmed_output() {
        let err = ExecError::command_failed(2, "  cannot open 'tank/missing'\n");
        assert_eq!(err.to_string(), "cannot open 'tank/missing'");
        assert_eq!(err.exit_code(), Some(2));
    }

    #[test]
    fn test_command_failed_falls_back_to_exit_code() {
        let err = ExecError::command_failed(1, " \n");
        assert_eq!(err.to_string(), "Command failed with code 1");
    }

    #[test]
    fn test_replication_failed_names_side() {
        let err = ExecError::ReplicationFailed {
            side: PipelineSide::Receive,
            source: Box::new(ExecError::command_failed(1, "destination has snapshots")),
        };
        assert_eq!(
            err.to_string(),
            "receive side of replication failed: destination has snapshots"
        );
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(err.output(), Some("destination has snapshots"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(ExecError::ConnectionFailed("reset".into()).is_retryable());
        assert!(!ExecError::command_failed(1, "").is_retryable());
        assert!(!ExecError::Stopped.is_retryable());
    }
}
