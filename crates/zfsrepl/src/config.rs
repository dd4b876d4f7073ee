//! Configuration loading and types

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use zfsrepl_transport::{ReplicationTask, Transport};

/// Top-level configuration for zfsrepl
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named transports, in the shape accepted by `Transport::from_data`
    #[serde(default)]
    pub transports: BTreeMap<String, toml::Value>,
    /// Replication tasks
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A replication task bound to a named transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Name of the remote end in `[transports]`
    pub transport: String,
    #[serde(flatten)]
    pub task: ReplicationTask,
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Find the configuration file to use
    ///
    /// An explicit path always wins, then `ZFSREPL_CONFIG`, then
    /// `./zfsrepl.toml` and the user config directory.
    pub fn locate(explicit: Option<PathBuf>) -> Option<PathBuf> {
        if explicit.is_some() {
            return explicit;
        }

        if let Ok(path) = std::env::var("ZFSREPL_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let mut paths = vec![PathBuf::from("zfsrepl.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("zfsrepl/config.toml"));
        }

        paths.into_iter().find(|path| path.exists())
    }

    /// Resolve a transport by name
    ///
    /// `local` names this machine unless the config defines it otherwise.
    ///
    /// # Errors
    /// Returns error for unknown names and malformed transport tables
    pub fn transport(&self, name: &str) -> eyre::Result<Transport> {
        let Some(value) = self.transports.get(name) else {
            if name == "local" {
                return Ok(Transport::Local);
            }
            eyre::bail!("unknown transport '{name}'");
        };

        let data = serde_json::to_value(value)
            .wrap_err_with(|| format!("transport '{name}' is not representable as data"))?;
        Transport::from_data(&data).wrap_err_with(|| format!("transport '{name}'"))
    }

    /// Tasks to run: all of them, or the one with id `id`
    ///
    /// # Errors
    /// Returns error if no task has the requested id
    pub fn select_tasks(&self, id: Option<&str>) -> eyre::Result<Vec<&TaskConfig>> {
        match id {
            None => Ok(self.tasks.iter().collect()),
            Some(id) => {
                let task = self
                    .tasks
                    .iter()
                    .find(|t| t.task.id == id)
                    .ok_or_else(|| eyre::eyre!("no task with id '{id}'"))?;
                Ok(vec![task])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use zfsrepl_transport::{KeySource, ReplicationCompression, ReplicationDirection};

    use super::*;

    const SAMPLE: &str = r#"
[logging]
level = "debug"
json = true

[transports.backup]
type = "ssh"
hostname = "backup.example.com"
private_key = { path = "/root/.ssh/id_ed25519" }

[transports.broken]
type = "carrier-pigeon"

[[tasks]]
id = "tank-home"
transport = "backup"
direction = "push"
source_dataset = "tank/home"
target_dataset = "backup/home"
snapshot = "auto-2026-10-19"
incremental_base = "auto-2026-10-18"
compression = "lz4"
speed_limit = 10485760

[[tasks]]
id = "restore"
transport = "local"
direction = "pull"
source_dataset = "backup/home"
target_dataset = "tank/restore"
snapshot = "auto-2026-10-19"
"#;

    fn sample() -> Config {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();

        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.tasks.len(), 2);

        let task = &config.tasks[0].task;
        assert_eq!(config.tasks[0].transport, "backup");
        assert_eq!(task.direction, ReplicationDirection::Push);
        assert_eq!(task.incremental_base.as_deref(), Some("auto-2026-10-18"));
        assert_eq!(task.compression, Some(ReplicationCompression::Lz4));
        assert_eq!(task.speed_limit.map(|l| l.get()), Some(10_485_760));
        assert_eq!(task.zfs_binary, "zfs");
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn test_transport_lookup() {
        let config = sample();

        let Transport::Ssh(ssh) = config.transport("backup").unwrap() else {
            panic!("expected ssh transport");
        };
        assert_eq!(ssh.hostname, "backup.example.com");
        assert_eq!(ssh.port, 22);
        assert_eq!(
            ssh.private_key,
            KeySource::Path(PathBuf::from("/root/.ssh/id_ed25519"))
        );

        assert_eq!(config.transport("local").unwrap(), Transport::Local);
        assert!(config.transport("missing").is_err());
        assert!(config.transport("broken").is_err());
    }

    #[test]
    fn test_select_tasks() {
        let config = sample();

        assert_eq!(config.select_tasks(None).unwrap().len(), 2);
        let selected = config.select_tasks(Some("restore")).unwrap();
        assert_eq!(selected[0].task.target_dataset, "tank/restore");
        assert!(config.select_tasks(Some("nope")).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zfsrepl.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.tasks[1].task.id, "restore");

        assert_eq!(Config::locate(Some(path.clone())), Some(path));
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
