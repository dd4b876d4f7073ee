//! Replication task parameters

use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// Which end sends the data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationDirection {
    /// Local shell sends, remote shell receives
    Push,
    /// Remote shell sends, local shell receives
    Pull,
}

/// Stream compression applied between `zfs send` and `zfs recv`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationCompression {
    Lz4,
    Pigz,
    Plzip,
    Xz,
}

impl ReplicationCompression {
    /// Command compressing stdin to stdout
    #[must_use]
    pub fn compress_args(self) -> &'static [&'static str] {
        match self {
            ReplicationCompression::Lz4 => &["lz4c"],
            ReplicationCompression::Pigz => &["pigz"],
            ReplicationCompression::Plzip => &["plzip"],
            ReplicationCompression::Xz => &["xz"],
        }
    }

    /// Command decompressing stdin to stdout
    #[must_use]
    pub fn decompress_args(self) -> &'static [&'static str] {
        match self {
            ReplicationCompression::Lz4 => &["lz4c", "-d"],
            ReplicationCompression::Pigz => &["pigz", "-d"],
            ReplicationCompression::Plzip => &["plzip", "-d"],
            ReplicationCompression::Xz => &["xz", "-d"],
        }
    }
}

/// What a run transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode<'a> {
    /// Whole snapshot
    Full,
    /// Delta from the base snapshot
    Incremental(&'a str),
    /// Continue a partially received stream
    Resume(&'a str),
}

/// Parameters of one dataset snapshot transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Replication task id (used in logs)
    pub id: String,
    /// Transfer direction
    pub direction: ReplicationDirection,
    /// Dataset on the sending side
    pub source_dataset: String,
    /// Dataset on the receiving side
    pub target_dataset: String,
    /// Snapshot name (without the dataset part)
    pub snapshot: String,
    /// Send dataset properties
    #[serde(default)]
    pub properties: bool,
    /// Snapshot the transfer is computed relative to
    #[serde(default)]
    pub incremental_base: Option<String>,
    /// Token of a partially completed receive
    #[serde(default)]
    pub receive_resume_token: Option<String>,
    /// Stream compression
    #[serde(default)]
    pub compression: Option<ReplicationCompression>,
    /// Transfer rate limit in bytes per second
    #[serde(default)]
    pub speed_limit: Option<NonZeroU64>,
    /// Generate a deduplicated stream
    #[serde(default)]
    pub dedup: bool,
    /// Allow blocks larger than 128 KiB
    #[serde(default)]
    pub large_block: bool,
    /// Use WRITE_EMBEDDED records
    #[serde(default)]
    pub embed: bool,
    /// Send compressed blocks as they are on disk
    #[serde(default)]
    pub compressed: bool,
    /// `zfs` executable on both ends
    #[serde(default = "default_zfs_binary")]
    pub zfs_binary: String,
}

fn default_zfs_binary() -> String {
    "zfs".to_string()
}

impl ReplicationTask {
    /// Full send of `source_dataset@snapshot` into `target_dataset`
    pub fn new(
        id: impl Into<String>,
        direction: ReplicationDirection,
        source_dataset: impl Into<String>,
        target_dataset: impl Into<String>,
        snapshot: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            source_dataset: source_dataset.into(),
            target_dataset: target_dataset.into(),
            snapshot: snapshot.into(),
            properties: false,
            incremental_base: None,
            receive_resume_token: None,
            compression: None,
            speed_limit: None,
            dedup: false,
            large_block: false,
            embed: false,
            compressed: false,
            zfs_binary: default_zfs_binary(),
        }
    }

    /// Send only the delta from `base`
    #[must_use]
    pub fn with_incremental_base(mut self, base: impl Into<String>) -> Self {
        self.incremental_base = Some(base.into());
        self
    }

    /// Resume a partial receive
    #[must_use]
    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.receive_resume_token = Some(token.into());
        self
    }

    /// Compress the stream in transit
    #[must_use]
    pub fn with_compression(mut self, compression: ReplicationCompression) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Limit the transfer rate (bytes per second)
    #[must_use]
    pub fn with_speed_limit(mut self, bytes_per_second: NonZeroU64) -> Self {
        self.speed_limit = Some(bytes_per_second);
        self
    }

    /// Send dataset properties
    #[must_use]
    pub fn with_properties(mut self, properties: bool) -> Self {
        self.properties = properties;
        self
    }

    /// Set the `-D`, `-L`, `-e` and `-c` stream flags
    #[must_use]
    pub fn with_stream_flags(
        mut self,
        dedup: bool,
        large_block: bool,
        embed: bool,
        compressed: bool,
    ) -> Self {
        self.dedup = dedup;
        self.large_block = large_block;
        self.embed = embed;
        self.compressed = compressed;
        self
    }

    /// Use another `zfs` executable
    #[must_use]
    pub fn with_zfs_binary(mut self, zfs_binary: impl Into<String>) -> Self {
        self.zfs_binary = zfs_binary.into();
        self
    }

    /// What this run transfers; a resume token wins over an incremental base
    #[must_use]
    pub fn mode(&self) -> TransferMode<'_> {
        if let Some(token) = self.receive_resume_token.as_deref() {
            TransferMode::Resume(token)
        } else if let Some(base) = self.incremental_base.as_deref() {
            TransferMode::Incremental(base)
        } else {
            TransferMode::Full
        }
    }
}
