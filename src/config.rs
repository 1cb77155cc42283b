//! Typed, validated settings the core needs to construct a [`crate::namespace::Storage`].
//!
//! The TOML file itself (loading, secret interpolation, CLI-flag merge) is an external
//! collaborator; this struct is just the shape that loader is expected to produce, deserialized
//! with `serde::Deserialize` plus `humantime_serde` for durations so operators write `"30s"`
//! rather than nanosecond counts.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

/// A single cluster peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub machine_id: u32,
    pub address: String,
}

/// Settings for one namespace's storage engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// This node's machine id. Must be unique across the cluster; the namespace rejects startup
    /// if a peer entry claims the same id.
    pub machine_id: u32,

    /// Directory holding one file per primary/replica spool.
    pub spool_dir: PathBuf,

    /// Number of replicas each new primary is assigned, drawn round-robin from `peers` with no
    /// failure-based exclusion.
    pub replicas: usize,

    /// The cluster's peer list, used for replica assignment and read-resolver fallback.
    pub peers: Vec<PeerConfig>,

    /// Minimum number of primaries kept open per namespace.
    #[serde(default = "default_min_open")]
    pub min_open_files: usize,

    /// Maximum number of primaries concurrently open (including in-flight opens).
    #[serde(default = "default_max_open")]
    pub max_open_files: usize,

    /// Replica orphan-detection watchdog interval; the primary emits heartbeats at half this.
    #[serde(with = "humantime_serde")]
    pub heartbeat_time: Duration,

    /// Wall-clock age beyond which a primary is sealed regardless of size.
    #[serde(with = "humantime_serde")]
    pub upload_older: Duration,

    /// Size beyond which a primary seals immediately after a successful insert.
    pub upload_larger_than: u64,

    /// When `Some`, sealed spools are gzip-compressed before upload.
    #[serde(default)]
    pub compress: bool,

    /// Delay between upload completion and local-file deletion (read-cache retention).
    #[serde(default, with = "humantime_serde::option")]
    pub delay_delete: Option<Duration>,

    /// Printf-style object-store key template.
    pub key_format: String,

    /// Object-store bucket name.
    pub bucket: String,

    /// Object-store key prefix, joined with the formatted key.
    #[serde(default)]
    pub key_prefix: String,

    /// Worker-pool sizes for the four background `WorkQueue`s.
    #[serde(default = "default_queue_parallelism")]
    pub compress_parallelism: usize,
    #[serde(default = "default_queue_parallelism")]
    pub upload_parallelism: usize,
    #[serde(default = "default_queue_parallelism")]
    pub delete_local_parallelism: usize,
    #[serde(default = "default_queue_parallelism")]
    pub delete_remotes_parallelism: usize,
}

fn default_min_open() -> usize {
    1
}

fn default_max_open() -> usize {
    16
}

fn default_queue_parallelism() -> usize {
    10
}

impl Settings {
    /// Validates cross-field invariants the loader can't express structurally.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message if a peer entry claims this node's own `machine_id`, or
    /// if `min_open_files` exceeds `max_open_files`.
    pub fn validate(&self) -> Result<(), String> {
        if self.peers.iter().any(|p| p.machine_id == self.machine_id) {
            return Err(format!(
                "peer list contains this node's own machine_id {}",
                self.machine_id
            ));
        }
        if self.min_open_files > self.max_open_files {
            return Err(format!(
                "min_open_files ({}) exceeds max_open_files ({})",
                self.min_open_files, self.max_open_files
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_machine_id() {
        let settings = Settings {
            machine_id: 1,
            spool_dir: "/tmp".into(),
            replicas: 0,
            peers: vec![PeerConfig {
                machine_id: 1,
                address: "10.0.0.1:9000".into(),
            }],
            min_open_files: 1,
            max_open_files: 2,
            heartbeat_time: Duration::from_secs(30),
            upload_older: Duration::from_secs(3600),
            upload_larger_than: 1 << 20,
            compress: false,
            delay_delete: None,
            key_format: "%F/%T-%K".into(),
            bucket: "bucket".into(),
            key_prefix: String::new(),
            compress_parallelism: 10,
            upload_parallelism: 10,
            delete_local_parallelism: 10,
            delete_remotes_parallelism: 10,
        };
        assert!(settings.validate().is_err());
    }
}
