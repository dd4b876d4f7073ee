//! Replication of one dataset snapshot between a local and a remote shell

mod observers;
mod process;
pub mod progress;
mod task;
pub mod throttle;
pub mod zfs;

pub use observers::{ObserverError, ProgressCallback, ProgressObserver, ProgressObservers};
pub use process::ReplicationProcess;
pub use task::{ReplicationCompression, ReplicationDirection, ReplicationTask, TransferMode};
