//! zfsrepl-transport: Command execution and ZFS stream replication
//!
//! A [`Transport`] names where commands run (this host or an SSH server)
//! and hands out [`Shell`]s for running them, synchronously or as
//! stoppable [`AsyncExec`] handles. [`ReplicationProcess`] pipes
//! `zfs send` on one side into `zfs recv` on the other.

pub mod command;
pub mod error;
pub mod exec;
pub mod ids;
pub mod keys;
pub mod local;
pub mod replication;
pub mod shell;
pub mod ssh;
pub mod traits;
pub mod transport;
pub mod types;

pub use error::{ExecError, PipelineSide};
pub use exec::{AsyncExec, ExecState, StopHandle};
pub use ids::IdGenerator;
pub use keys::{KeyError, KeySource};
pub use local::LocalBackend;
pub use replication::{
    ObserverError, ProgressCallback, ProgressObserver, ProgressObservers, ReplicationCompression,
    ReplicationDirection, ReplicationProcess, ReplicationTask, TransferMode,
};
pub use shell::Shell;
pub use ssh::SshBackend;
pub use traits::{ChildProcess, ShellBackend, StdinMode};
pub use transport::{SshTransport, Transport};
pub use types::{DirEntry, Encoding, ExecOptions};
