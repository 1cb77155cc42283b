//! The replica state machine: a peer-initiated copy of a primary's spool.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use blobby_buffers::DelayToken;
use blobby_common::{FileId, HashValidator};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::{error::BlobbyError, shared::Shared, uploader};

/// All states a replica can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    New,
    Opening,
    Waiting,
    Appending,
    Failed,
    PendingCompression,
    Compressing,
    PendingUpload,
    Uploading,
    PendingDelete,
    DeletingCompressed,
    ClosingCompressed,
    Deleting,
    Closing,
    Completed,
}

impl ReplicaState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ReplicaState::New => "New",
            ReplicaState::Opening => "Opening",
            ReplicaState::Waiting => "Waiting",
            ReplicaState::Appending => "Appending",
            ReplicaState::Failed => "Failed",
            ReplicaState::PendingCompression => "PendingCompression",
            ReplicaState::Compressing => "Compressing",
            ReplicaState::PendingUpload => "PendingUpload",
            ReplicaState::Uploading => "Uploading",
            ReplicaState::PendingDelete => "PendingDelete",
            ReplicaState::DeletingCompressed => "DeletingCompressed",
            ReplicaState::ClosingCompressed => "ClosingCompressed",
            ReplicaState::Deleting => "Deleting",
            ReplicaState::Closing => "Closing",
            ReplicaState::Completed => "Completed",
        }
    }

    fn accepts_heartbeat(self) -> bool {
        matches!(
            self,
            ReplicaState::New | ReplicaState::Opening | ReplicaState::Waiting | ReplicaState::Appending
        )
    }

    fn is_in_delete_cascade(self) -> bool {
        matches!(
            self,
            ReplicaState::PendingDelete
                | ReplicaState::DeletingCompressed
                | ReplicaState::ClosingCompressed
                | ReplicaState::Deleting
                | ReplicaState::Closing
                | ReplicaState::Completed
        )
    }
}

struct Inner {
    state: ReplicaState,
    file: Option<tokio::fs::File>,
    offset: u64,
    queued_for_upload: Option<Duration>,
}

/// A peer-hosted copy of a primary's spool. Strictly ordered: an offset mismatch on the first
/// append failure is terminal.
pub struct Replica {
    fid: FileId,
    fid_string: String,
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
    heartbeat_token: DelayToken,
    completed_tx: UnboundedSender<String>,
    shutting_down: Arc<AtomicBool>,
    /// Whether this replica was ever counted in the `open_replicas` gauge (only true for
    /// replicas that completed a normal `open()`, not ones reconstructed by
    /// [`from_recovered`](Self::from_recovered), which never accept heartbeats) — so the
    /// terminal delete step knows whether a matching decrement is owed.
    counted: AtomicBool,
}

impl Replica {
    /// Constructs a brand-new replica in state `New`; call [`open`](Self::open) to proceed.
    #[must_use]
    pub fn new(
        fid: FileId,
        shared: Arc<Shared>,
        completed_tx: UnboundedSender<String>,
        shutting_down: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let fid_string = fid.to_string_id();
        let heartbeat_token = shared.delay_queue.new_token();
        Arc::new(Self {
            fid,
            fid_string,
            shared,
            inner: Mutex::new(Inner {
                state: ReplicaState::New,
                file: None,
                offset: 0,
                queued_for_upload: None,
            }),
            heartbeat_token,
            completed_tx,
            shutting_down,
            counted: AtomicBool::new(false),
        })
    }

    /// Registers a replica discovered during spool-directory recovery,
    /// already at `offset` and directly in `PendingCompression` or `PendingUpload` depending on
    /// configuration, skipping the normal open handshake (there is no primary left to talk to).
    #[must_use]
    pub fn from_recovered(
        fid: FileId,
        offset: u64,
        shared: Arc<Shared>,
        completed_tx: UnboundedSender<String>,
        shutting_down: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let replica = Self::new(fid, shared, completed_tx, shutting_down);
        let initial = if replica.shared.settings.compress && offset > 0 {
            ReplicaState::PendingCompression
        } else if offset > 0 {
            ReplicaState::PendingUpload
        } else {
            ReplicaState::PendingDelete
        };
        {
            let mut g = replica.inner.lock();
            g.offset = offset;
            g.state = initial;
        }
        replica.enqueue_for(initial);
        replica
    }

    #[must_use]
    pub fn fid(&self) -> FileId {
        self.fid
    }

    #[must_use]
    pub fn fid_string(&self) -> &str {
        &self.fid_string
    }

    #[must_use]
    pub fn state(&self) -> ReplicaState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.inner.lock().offset
    }

    fn spool_path(&self) -> PathBuf {
        self.shared.spool_path(&format!("r-{}", self.fid_string))
    }

    fn compressed_path(&self) -> PathBuf {
        let mut p = self.spool_path();
        p.set_extension("gz");
        p
    }

    /// New → Opening → Waiting on success (file created, heartbeat armed); Opening → Completed
    /// on failure.
    pub async fn open(self: &Arc<Self>) -> Result<(), BlobbyError> {
        {
            let mut g = self.inner.lock();
            g.state = ReplicaState::Opening;
        }

        let path = self.spool_path();
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                let mut g = self.inner.lock();
                g.file = Some(file);
                g.state = ReplicaState::Waiting;
                drop(g);
                self.counted.store(true, Ordering::SeqCst);
                self.shared.metrics.open_replicas.increment(1.0);
                self.rearm_heartbeat();
                Ok(())
            }
            Err(source) => {
                let mut g = self.inner.lock();
                g.state = ReplicaState::Completed;
                drop(g);
                let _ = self.completed_tx.send(self.fid_string.clone());
                Err(BlobbyError::Io { source })
            }
        }
    }

    /// `Waiting → Appending` iff `start == offset` and the advertised hash validates against
    /// the streamed bytes; `Appending → Waiting` on success. Any failure → `Failed`, and the
    /// replica never accepts another append.
    pub async fn replicate(
        self: &Arc<Self>,
        start: u64,
        data: Bytes,
        hash: &str,
    ) -> Result<bool, BlobbyError> {
        let mut file = {
            let mut g = self.inner.lock();
            if g.state != ReplicaState::Waiting {
                return Err(BlobbyError::WrongReplicaState { state: g.state.name() });
            }
            if start != g.offset {
                g.state = ReplicaState::Failed;
                return Err(BlobbyError::OffsetMismatch {
                    expected: g.offset,
                    actual: start,
                });
            }
            g.state = ReplicaState::Appending;
            g.file.take().expect("replica file handle missing while Waiting")
        };

        let mut validator = match HashValidator::new(hash) {
            Ok(v) => v,
            Err(_) => {
                let mut g = self.inner.lock();
                g.file = Some(file);
                g.state = ReplicaState::Failed;
                return Err(BlobbyError::HashMismatch);
            }
        };
        validator.update(&data);
        let hash_ok = validator.check();

        let length = data.len() as u64;
        let write_result = file.write_all(&data).await;

        if write_result.is_ok() && hash_ok {
            let _ = file.flush().await;
            let mut g = self.inner.lock();
            g.file = Some(file);
            g.offset += length;
            g.state = ReplicaState::Waiting;
            drop(g);
            self.rearm_heartbeat();
            return Ok(self.shutting_down.load(Ordering::SeqCst));
        }

        let mut g = self.inner.lock();
        g.file = Some(file);
        g.state = ReplicaState::Failed;
        drop(g);

        match write_result {
            Ok(()) => Err(BlobbyError::HashMismatch),
            Err(source) => Err(BlobbyError::Io { source }),
        }
    }

    /// Accepted iff `state ∈ {New, Opening, Waiting, Appending}`; resets the orphan watchdog.
    pub fn heart_beat(self: &Arc<Self>) -> Result<bool, BlobbyError> {
        {
            let g = self.inner.lock();
            if !g.state.accepts_heartbeat() {
                return Err(BlobbyError::WrongReplicaState { state: g.state.name() });
            }
        }
        self.rearm_heartbeat();
        Ok(self.shutting_down.load(Ordering::SeqCst))
    }

    /// Allowed from `{Waiting, Failed}` (sets `PendingDelete`); idempotent once already in the
    /// delete cascade.
    pub fn queue_delete(self: &Arc<Self>) {
        let next = {
            let mut g = self.inner.lock();
            if matches!(g.state, ReplicaState::Waiting | ReplicaState::Failed) {
                g.state = ReplicaState::PendingDelete;
                Some(ReplicaState::PendingDelete)
            } else {
                None
            }
        };
        if let Some(state) = next {
            self.shared.delay_queue.cancel(self.heartbeat_token);
            self.enqueue_for(state);
        }
    }

    fn rearm_heartbeat(self: &Arc<Self>) {
        let me = self.clone();
        let deadline = std::time::Instant::now() + self.shared.settings.heartbeat_time;
        self.shared
            .delay_queue
            .alter_spawn(self.heartbeat_token, deadline, move || async move {
                me.on_orphan().await;
            });
    }

    /// Fires when no heartbeat or append was observed within `heartbeat_time`: the replica
    /// self-promotes into the upload cascade.
    async fn on_orphan(self: Arc<Self>) {
        let next = {
            let mut g = self.inner.lock();
            if !matches!(g.state, ReplicaState::Waiting | ReplicaState::Failed) {
                return;
            }
            let next = if self.shared.settings.compress && g.offset > 0 {
                ReplicaState::PendingCompression
            } else if g.offset > 0 {
                ReplicaState::PendingUpload
            } else {
                ReplicaState::PendingDelete
            };
            g.state = next;
            next
        };
        debug!(fid = %self.fid_string, state = next.name(), "replica orphaned, entering upload cascade");
        self.enqueue_for(next);
    }

    fn enqueue_for(self: &Arc<Self>, state: ReplicaState) {
        let me = self.clone();
        match state {
            ReplicaState::PendingCompression => self
                .shared
                .compress_queue
                .insert(move || async move { me.compress_step().await }),
            ReplicaState::PendingUpload => self
                .shared
                .upload_queue
                .insert(move || async move { me.upload_step().await }),
            ReplicaState::PendingDelete => self
                .shared
                .delete_local_queue
                .insert(move || async move { me.delete_step().await }),
            _ => {}
        }
    }

    async fn compress_step(self: Arc<Self>) {
        {
            let mut g = self.inner.lock();
            if g.state != ReplicaState::PendingCompression {
                return;
            }
            g.state = ReplicaState::Compressing;
        }

        match self.do_compress().await {
            Ok(()) => {
                let mut g = self.inner.lock();
                g.state = ReplicaState::PendingUpload;
                drop(g);
                self.enqueue_for(ReplicaState::PendingUpload);
            }
            Err(error) => {
                warn!(fid = %self.fid_string, %error, "replica compression failed, requeuing");
                let mut g = self.inner.lock();
                g.state = ReplicaState::PendingCompression;
                drop(g);
                self.enqueue_for(ReplicaState::PendingCompression);
            }
        }
    }

    async fn do_compress(&self) -> std::io::Result<()> {
        let src_path = self.spool_path();
        let dst_path = self.compressed_path();
        let data = tokio::fs::read(&src_path).await?;
        let dst_path2 = dst_path.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use flate2::{write::GzEncoder, Compression};
            let out = std::fs::File::create(&dst_path2)?;
            let mut encoder = GzEncoder::new(out, Compression::default());
            std::io::Write::write_all(&mut encoder, &data)?;
            encoder.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        Ok(())
    }

    async fn upload_step(self: Arc<Self>) {
        {
            let mut g = self.inner.lock();
            if g.state != ReplicaState::PendingUpload {
                return;
            }
            g.state = ReplicaState::Uploading;
            g.queued_for_upload.get_or_insert(self.shared.clock.now_unix());
        }

        let compressed = self.compressed_path();
        let path = if self.shared.settings.compress && compressed.exists() {
            compressed
        } else {
            self.spool_path()
        };

        let key = self.shared.object_key(
            self.fid.epoch_seconds(),
            self.fid.counter(),
            self.fid.machine_id(),
        );

        match uploader::upload_file(self.shared.object_store.as_ref(), &path, &key).await {
            Ok(()) => {
                self.shared.metrics.uploads_total.increment(1);
                let mut g = self.inner.lock();
                g.state = ReplicaState::PendingDelete;
                drop(g);
                self.enqueue_for(ReplicaState::PendingDelete);
            }
            Err(error) => {
                warn!(fid = %self.fid_string, %error, "replica upload failed, requeuing");
                self.shared.metrics.upload_errors_total.increment(1);
                let mut g = self.inner.lock();
                g.state = ReplicaState::PendingUpload;
                drop(g);
                self.enqueue_for(ReplicaState::PendingUpload);
            }
        }
    }

    async fn delete_step(self: Arc<Self>) {
        {
            let mut g = self.inner.lock();
            if g.state != ReplicaState::PendingDelete {
                return;
            }
            g.state = ReplicaState::Deleting;
        }

        let compressed = self.compressed_path();
        if tokio::fs::metadata(&compressed).await.is_ok() {
            {
                let mut g = self.inner.lock();
                g.state = ReplicaState::DeletingCompressed;
            }
            let _ = tokio::fs::remove_file(&compressed).await;
            let mut g = self.inner.lock();
            g.state = ReplicaState::ClosingCompressed;
        }

        let path = self.spool_path();
        let _ = tokio::fs::remove_file(&path).await;

        {
            let mut g = self.inner.lock();
            g.state = ReplicaState::Closing;
            g.file = None;
        }

        self.shared.delay_queue.cancel(self.heartbeat_token);

        {
            let mut g = self.inner.lock();
            g.state = ReplicaState::Completed;
        }
        if self.counted.load(Ordering::SeqCst) {
            self.shared.metrics.open_replicas.decrement(1.0);
        }
        let _ = self.completed_tx.send(self.fid_string.clone());
    }

    #[must_use]
    pub fn is_in_delete_cascade(&self) -> bool {
        self.inner.lock().state.is_in_delete_cascade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_shared;

    #[tokio::test]
    async fn open_creates_spool_file_and_moves_to_waiting() {
        let (shared, _dir) = test_shared().await;
        let fid = FileId::new(1_700_000_000, 1, shared.settings.machine_id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let replica = Replica::new(fid, shared, tx, Arc::new(AtomicBool::new(false)));

        replica.open().await.unwrap();
        assert_eq!(replica.state(), ReplicaState::Waiting);
    }

    #[tokio::test]
    async fn replicate_rejects_offset_mismatch_and_fails_permanently() {
        let (shared, _dir) = test_shared().await;
        let fid = FileId::new(1_700_000_000, 2, shared.settings.machine_id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let replica = Replica::new(fid, shared, tx, Arc::new(AtomicBool::new(false)));
        replica.open().await.unwrap();

        let hash = {
            let mut computer = blobby_common::HashComputer::new(blobby_common::Algorithm::Keyed64);
            computer.update(b"hello");
            computer.hash()
        };

        let err = replica
            .replicate(40, Bytes::from_static(b"hello"), &hash)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobbyError::OffsetMismatch { .. }));
        assert_eq!(replica.state(), ReplicaState::Failed);

        let err2 = replica
            .replicate(0, Bytes::from_static(b"hello"), &hash)
            .await
            .unwrap_err();
        assert!(matches!(err2, BlobbyError::WrongReplicaState { .. }));
    }

    #[tokio::test]
    async fn replicate_accepts_sequential_appends() {
        let (shared, _dir) = test_shared().await;
        let fid = FileId::new(1_700_000_000, 3, shared.settings.machine_id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let replica = Replica::new(fid, shared, tx, Arc::new(AtomicBool::new(false)));
        replica.open().await.unwrap();

        let hash = {
            let mut computer = blobby_common::HashComputer::new(blobby_common::Algorithm::Keyed64);
            computer.update(b"ABCDE");
            computer.hash()
        };
        replica.replicate(0, Bytes::from_static(b"ABCDE"), &hash).await.unwrap();
        assert_eq!(replica.offset(), 5);
        assert_eq!(replica.state(), ReplicaState::Waiting);
    }

    #[tokio::test]
    async fn heart_beat_rejected_once_sealed() {
        let (shared, _dir) = test_shared().await;
        let fid = FileId::new(1_700_000_000, 4, shared.settings.machine_id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let replica = Replica::new(fid, shared, tx, Arc::new(AtomicBool::new(false)));
        replica.open().await.unwrap();
        replica.queue_delete();
        let err = replica.heart_beat().unwrap_err();
        assert!(matches!(err, BlobbyError::WrongReplicaState { .. }));
    }
}
