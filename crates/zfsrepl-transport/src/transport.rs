//! Transport identity and backend selection

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::ids::IdGenerator;
use crate::keys::KeySource;
use crate::local::LocalBackend;
use crate::replication::{ReplicationProcess, ReplicationTask};
use crate::shell::Shell;
use crate::ssh::SshBackend;
use crate::traits::ShellBackend;

/// How to reach a host
///
/// Built once from configuration and never mutated. Two transports
/// compare equal when they describe the same destination, so they can
/// key connection caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    /// The machine this process runs on
    Local,
    /// A remote machine reached over SSH
    Ssh(SshTransport),
}

/// SSH destination and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTransport {
    /// Host address
    pub hostname: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username (default root)
    #[serde(default = "default_username")]
    pub username: String,
    /// Private key used for authentication
    pub private_key: KeySource,
    /// Pinned server key in OpenSSH format (`ssh-ed25519 AAAA...`)
    #[serde(default)]
    pub host_key: Option<String>,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl SshTransport {
    /// Create an SSH transport with default port, user and timeout
    pub fn new(hostname: impl Into<String>, private_key: KeySource) -> Self {
        Self {
            hostname: hostname.into(),
            port: default_port(),
            username: default_username(),
            private_key,
            host_key: None,
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set username
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Pin the server host key
    #[must_use]
    pub fn with_host_key(mut self, host_key: impl Into<String>) -> Self {
        self.host_key = Some(host_key.into());
        self
    }
}

// Identity is the destination only; credentials and timeouts don't count.
impl PartialEq for SshTransport {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname
            && self.port == other.port
            && self.username == other.username
    }
}

impl Eq for SshTransport {}

impl Hash for SshTransport {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hostname.hash(state);
        self.port.hash(state);
        self.username.hash(state);
    }
}

impl Transport {
    /// Build a transport from a structured configuration object
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the object does not describe a known transport
    pub fn from_data(data: &serde_json::Value) -> Result<Self, ExecError> {
        let transport = Transport::deserialize(data)
            .map_err(|e| ExecError::ConfigError(format!("invalid transport: {e}")))?;
        if let Transport::Ssh(ssh) = &transport
            && ssh.hostname.is_empty()
        {
            return Err(ExecError::ConfigError(
                "invalid transport: empty hostname".to_string(),
            ));
        }
        Ok(transport)
    }

    /// Backend name (for logging)
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Local => "local",
            Transport::Ssh(_) => "ssh",
        }
    }

    /// Create the backend this transport executes commands with
    ///
    /// # Errors
    /// Returns an error if the backend cannot be initialized (e.g. SSH key problems)
    pub fn backend(&self) -> Result<Arc<dyn ShellBackend>, ExecError> {
        match self {
            Transport::Local => Ok(Arc::new(LocalBackend::new())),
            Transport::Ssh(ssh) => Ok(Arc::new(SshBackend::new(ssh)?)),
        }
    }

    /// Open a shell on this transport
    ///
    /// # Errors
    /// Returns an error if the backend cannot be initialized
    pub fn shell(&self) -> Result<Shell, ExecError> {
        Shell::new(self.clone())
    }

    /// Open a shell taking its id from `ids`
    ///
    /// # Errors
    /// Returns an error if the backend cannot be initialized
    pub fn shell_with_ids(&self, ids: &IdGenerator) -> Result<Shell, ExecError> {
        Shell::with_ids(self.clone(), ids)
    }

    /// Create a replication process between `local_shell` and `remote_shell`
    pub fn replication_process(
        &self,
        local_shell: Shell,
        remote_shell: Shell,
        task: ReplicationTask,
    ) -> ReplicationProcess {
        ReplicationProcess::new(self.clone(), local_shell, remote_shell, task)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Local => f.write_str("local"),
            Transport::Ssh(ssh) => write!(f, "ssh://{}@{}:{}", ssh.username, ssh.hostname, ssh.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_from_data_local() {
        let transport = Transport::from_data(&json!({"type": "local"})).unwrap();
        assert_eq!(transport, Transport::Local);
        assert_eq!(transport.kind(), "local");
    }

    #[test]
    fn test_from_data_ssh_defaults() {
        let transport = Transport::from_data(&json!({
            "type": "ssh",
            "hostname": "backup.example.com",
            "private_key": {"path": "/root/.ssh/id_ed25519"}
        }))
        .unwrap();

        let Transport::Ssh(ssh) = &transport else {
            panic!("expected ssh transport");
        };
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.username, "root");
        assert_eq!(ssh.connect_timeout, 10);
        assert_eq!(transport.to_string(), "ssh://root@backup.example.com:22");
    }

    #[test]
    fn test_from_data_rejects_malformed() {
        let cases = [
            json!({"type": "carrier-pigeon"}),
            json!({"hostname": "backup.example.com"}),
            json!({"type": "ssh", "private_key": {"path": "/k"}}),
            json!({"type": "ssh", "hostname": "", "private_key": {"path": "/k"}}),
            json!({"type": "ssh", "hostname": "h", "port": "twenty-two", "private_key": {"path": "/k"}}),
            json!("local"),
        ];
        for data in cases {
            let result = Transport::from_data(&data);
            assert!(
                matches!(result, Err(ExecError::ConfigError(_))),
                "accepted {data}"
            );
        }
    }

    #[test]
    fn test_same_destination_is_equal() {
        let a = Transport::from_data(&json!({
            "type": "ssh",
            "hostname": "backup.example.com",
            "private_key": {"path": "/root/.ssh/id_ed25519"}
        }))
        .unwrap();
        let b = Transport::from_data(&json!({
            "type": "ssh",
            "hostname": "backup.example.com",
            "port": 22,
            "username": "root",
            "private_key": {"env": "BACKUP_KEY"},
            "connect_timeout": 30
        }))
        .unwrap();

        assert_eq!(a, b);
        let set: HashSet<Transport> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_pinned_host_key_round_trips_through_data() {
        let pinned = SshTransport::new(
            "backup.example.com",
            KeySource::Path("/root/.ssh/id_ed25519".into()),
        )
        .with_host_key("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl");

        let Transport::Ssh(parsed) = Transport::from_data(&json!({
            "type": "ssh",
            "hostname": "backup.example.com",
            "private_key": {"path": "/root/.ssh/id_ed25519"},
            "host_key": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl"
        }))
        .unwrap() else {
            panic!("expected ssh transport");
        };

        assert_eq!(parsed.host_key, pinned.host_key);
        // the pin is a credential, not part of the destination
        let unpinned = SshTransport {
            host_key: None,
            ..pinned.clone()
        };
        assert_eq!(unpinned, pinned);
    }

    #[test]
    fn test_different_destinations_differ() {
        let key = KeySource::Path("/root/.ssh/id_ed25519".into());
        let base = SshTransport::new("backup.example.com", key.clone());
        let transports = [
            Transport::Local,
            Transport::Ssh(base.clone()),
            Transport::Ssh(base.clone().with_port(2222)),
            Transport::Ssh(base.with_username("zfs")),
            Transport::Ssh(SshTransport::new("offsite.example.com", key)),
        ];

        let set: HashSet<&Transport> = transports.iter().collect();
        assert_eq!(set.len(), transports.len());
    }
}
