//! Fixtures shared by the unit tests in `replica.rs`, `primary.rs`, and `namespace.rs`.

#![cfg(test)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use blobby_buffers::{DelayQueue, WorkQueue};
use blobby_common::{SystemClock, TestClock};
use blobby_keyfmt::KeyTemplate;
use bytes::Bytes;

use crate::{
    config::{PeerConfig, Settings},
    metrics::NamespaceMetrics,
    object_store::{ObjectStore, ObjectStoreError},
    remote::{Remote, RemoteError},
    shared::Shared,
};

/// An in-memory object store for tests: `put` records the bytes, `get_range` slices them back.
#[derive(Default)]
pub struct FakeObjectStore {
    pub objects: Mutex<HashMap<String, Bytes>>,
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, key: &str, body: Bytes, _content_md5_b64: &str) -> Result<String, ObjectStoreError> {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(&body);
        let hex = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect::<String>();
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(hex)
    }

    async fn get_range(&self, key: &str, start: u64, length: u64) -> Result<Bytes, ObjectStoreError> {
        let objects = self.objects.lock().unwrap();
        let data = objects.get(key).cloned().unwrap_or_default();
        let start = start as usize;
        let end = (start + length as usize).min(data.len());
        Ok(data.slice(start..end))
    }
}

/// A `Remote` double that always succeeds and records the calls it received, for assertions in
/// scenario tests.
pub struct FakeRemote {
    pub machine_id: u32,
    pub replicated: Mutex<Vec<(u64, Bytes, String)>>,
    pub fail_next: AtomicBool,
    pub calls: AtomicU32,
}

impl FakeRemote {
    #[must_use]
    pub fn new(machine_id: u32) -> Self {
        Self {
            machine_id,
            replicated: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Remote for FakeRemote {
    fn machine_id(&self) -> u32 {
        self.machine_id
    }

    async fn initialize(&self, _namespace: &str, _fid: blobby_common::FileId) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn heart_beat(&self, _namespace: &str, _fid: blobby_common::FileId) -> Result<bool, RemoteError> {
        Ok(false)
    }

    async fn replicate(
        &self,
        _namespace: &str,
        _fid: blobby_common::FileId,
        start: u64,
        data: Bytes,
        hash: &str,
    ) -> Result<bool, RemoteError> {
        use std::sync::atomic::Ordering;
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Status { status: 500 });
        }
        self.replicated
            .lock()
            .unwrap()
            .push((start, data, hash.to_string()));
        Ok(false)
    }

    async fn delete(&self, _namespace: &str, _fid: blobby_common::FileId) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn read(
        &self,
        _namespace: &str,
        _token: blobby_common::IdToken,
        _local_only: bool,
    ) -> Result<Option<Bytes>, RemoteError> {
        Ok(None)
    }
}

fn test_settings(spool_dir: std::path::PathBuf) -> Settings {
    Settings {
        machine_id: 1,
        spool_dir,
        replicas: 0,
        peers: vec![PeerConfig {
            machine_id: 2,
            address: "127.0.0.1:9001".into(),
        }],
        min_open_files: 1,
        max_open_files: 4,
        heartbeat_time: std::time::Duration::from_secs(30),
        upload_older: std::time::Duration::from_secs(3600),
        upload_larger_than: 1 << 20,
        compress: false,
        delay_delete: None,
        key_format: "%F/%T-%K-%L".into(),
        bucket: "test-bucket".into(),
        key_prefix: String::new(),
        compress_parallelism: 2,
        upload_parallelism: 2,
        delete_local_parallelism: 2,
        delete_remotes_parallelism: 2,
    }
}

/// Builds a [`Shared`] wired to a temp spool dir, a fake object store, and no remotes, for tests
/// that don't need replication fan-out.
pub async fn test_shared() -> (Arc<Shared>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(test_settings(dir.path().to_path_buf()));
    let shared = Arc::new(Shared {
        namespace: "test-ns".to_string(),
        settings: settings.clone(),
        clock: Arc::new(SystemClock),
        delay_queue: DelayQueue::start(),
        compress_queue: WorkQueue::new(settings.compress_parallelism),
        upload_queue: WorkQueue::new(settings.upload_parallelism),
        delete_local_queue: WorkQueue::new(settings.delete_local_parallelism),
        delete_remotes_queue: WorkQueue::new(settings.delete_remotes_parallelism),
        object_store: Arc::new(FakeObjectStore::default()),
        key_template: KeyTemplate::compile(&settings.key_format).unwrap(),
        metrics: NamespaceMetrics::new("test-ns"),
        remotes: Vec::new(),
        shutting_down: Arc::new(AtomicBool::new(false)),
    });
    (shared, dir)
}

/// Like [`test_shared`], but wired to a `TestClock` and the given remotes, for tests driving the
/// replication fan-out and timer-based transitions deterministically.
pub async fn test_shared_with(
    remotes: Vec<Arc<dyn Remote>>,
    clock: Arc<TestClock>,
) -> (Arc<Shared>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path().to_path_buf());
    settings.replicas = remotes.len();
    let settings = Arc::new(settings);
    let shared = Arc::new(Shared {
        namespace: "test-ns".to_string(),
        settings: settings.clone(),
        clock,
        delay_queue: DelayQueue::start(),
        compress_queue: WorkQueue::new(settings.compress_parallelism),
        upload_queue: WorkQueue::new(settings.upload_parallelism),
        delete_local_queue: WorkQueue::new(settings.delete_local_parallelism),
        delete_remotes_queue: WorkQueue::new(settings.delete_remotes_parallelism),
        object_store: Arc::new(FakeObjectStore::default()),
        key_template: KeyTemplate::compile(&settings.key_format).unwrap(),
        metrics: NamespaceMetrics::new("test-ns"),
        remotes,
        shutting_down: Arc::new(AtomicBool::new(false)),
    });
    (shared, dir)
}
