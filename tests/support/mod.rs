//! Fixtures for the scenario tests (the S1-S6), mirroring `src/test_support.rs`'s
//! fakes but living here since integration tests link against the crate without `cfg(test)`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use blobby::{
    config::{PeerConfig, Settings},
    object_store::{ObjectStore, ObjectStoreError},
    remote::{Remote, RemoteError, ShuttingDown},
    shared::Shared,
};
use blobby_buffers::{DelayQueue, WorkQueue};
use blobby_common::{Clock, FileId, IdToken, SystemClock};
use blobby_keyfmt::KeyTemplate;
use bytes::Bytes;

/// An in-memory [`ObjectStore`] that records every PUT so a test can assert on the uploaded
/// bytes and their MD5 without a real S3 endpoint.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Pre-populates an object, for tests exercising the cold-storage read tier directly rather
    /// than through a preceding `put`.
    pub fn seed(&self, key: &str, body: Bytes) {
        self.objects.lock().unwrap().insert(key.to_string(), body);
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes, content_md5_b64: &str) -> Result<String, ObjectStoreError> {
        use base64::Engine as _;
        use md5::{Digest, Md5};

        let mut hasher = Md5::new();
        hasher.update(&body);
        let digest = hasher.finalize();
        let expected_b64 = base64::engine::general_purpose::STANDARD.encode(digest.as_slice());
        assert_eq!(content_md5_b64, expected_b64, "Content-MD5 header didn't match the body");

        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
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

/// A [`Remote`] a test drives directly: records every `replicate` call and can be told to
/// return 404 (`Ok(None)`) or fail outright on the next read/replicate.
pub struct FakeRemote {
    machine_id: u32,
    pub replicated: Mutex<Vec<(u64, Bytes, String)>>,
    pub fail_next: AtomicBool,
    pub read_reply: Mutex<Option<Bytes>>,
}

impl FakeRemote {
    #[must_use]
    pub fn new(machine_id: u32) -> Self {
        Self {
            machine_id,
            replicated: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            read_reply: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Remote for FakeRemote {
    fn machine_id(&self) -> u32 {
        self.machine_id
    }

    async fn initialize(&self, _namespace: &str, _fid: FileId) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn heart_beat(&self, _namespace: &str, _fid: FileId) -> Result<ShuttingDown, RemoteError> {
        Ok(false)
    }

    async fn replicate(
        &self,
        _namespace: &str,
        _fid: FileId,
        start: u64,
        data: Bytes,
        hash: &str,
    ) -> Result<ShuttingDown, RemoteError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Status { status: 503 });
        }
        self.replicated.lock().unwrap().push((start, data, hash.to_string()));
        Ok(false)
    }

    async fn delete(&self, _namespace: &str, _fid: FileId) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn read(&self, _namespace: &str, _token: IdToken, _local_only: bool) -> Result<Option<Bytes>, RemoteError> {
        Ok(self.read_reply.lock().unwrap().clone())
    }
}

/// Settings matching the scenario fixtures: short timers so the tests don't need to
/// wait long for background transitions, real wall-clock time (no paused runtime) since the
/// compress/upload/delete steps run on `tokio::spawn`ed workers the paused-clock tests elsewhere
/// in this crate don't need to coordinate with.
pub fn scenario_settings(spool_dir: std::path::PathBuf, peers: Vec<PeerConfig>, replicas: usize) -> Settings {
    Settings {
        machine_id: 1,
        spool_dir,
        replicas,
        peers,
        min_open_files: 1,
        max_open_files: 4,
        heartbeat_time: std::time::Duration::from_millis(60),
        upload_older: std::time::Duration::from_millis(40),
        upload_larger_than: 1 << 20,
        compress: false,
        delay_delete: None,
        key_format: "%F/%T-%K-%L".into(),
        bucket: "scenario-bucket".into(),
        key_prefix: String::new(),
        compress_parallelism: 2,
        upload_parallelism: 2,
        delete_local_parallelism: 2,
        delete_remotes_parallelism: 2,
    }
}

pub struct ScenarioNode {
    pub shared: Arc<Shared>,
    pub object_store: Arc<MemoryObjectStore>,
    pub _spool_dir: tempfile::TempDir,
}

pub async fn build_node(remotes: Vec<Arc<dyn Remote>>, replicas: usize) -> ScenarioNode {
    let spool_dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(scenario_settings(spool_dir.path().to_path_buf(), Vec::new(), replicas));
    let object_store = Arc::new(MemoryObjectStore::default());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shared = Arc::new(Shared {
        namespace: "scenario".to_string(),
        settings: settings.clone(),
        clock,
        delay_queue: DelayQueue::start(),
        compress_queue: WorkQueue::new(settings.compress_parallelism),
        upload_queue: WorkQueue::new(settings.upload_parallelism),
        delete_local_queue: WorkQueue::new(settings.delete_local_parallelism),
        delete_remotes_queue: WorkQueue::new(settings.delete_remotes_parallelism),
        object_store: object_store.clone() as Arc<dyn ObjectStore>,
        key_template: KeyTemplate::compile(&settings.key_format).unwrap(),
        metrics: blobby::metrics::NamespaceMetrics::new("scenario"),
        remotes,
        shutting_down: Arc::new(AtomicBool::new(false)),
    });
    ScenarioNode {
        shared,
        object_store,
        _spool_dir: spool_dir,
    }
}
