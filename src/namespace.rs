//! `Storage`: the per-namespace entry point tying primaries, replicas, admission, and the
//! three-tier read resolver together.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use blobby_buffers::{BackOff, WaitingList};
use blobby_common::{FidMinter, FileId, IdToken};
use bytes::Bytes;
use parking_lot::Mutex;
use snafu::ResultExt as _;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{BlobbyError, IoSnafu, ObjectStoreSnafu},
    primary::{Primary, PrimaryHandle, PrimaryState},
    reader::{read_to_bytes, ReadStream},
    remote::Remote,
    replica::Replica,
    shared::Shared,
};

/// Owns every primary and replica live in one namespace, the admission waiting list, and the
/// background work queues they share.
pub struct Storage {
    shared: Arc<Shared>,
    primaries: Mutex<HashMap<String, Arc<Primary>>>,
    replicas: Mutex<HashMap<String, Arc<Replica>>>,
    waiting_list: WaitingList<PrimaryHandle>,
    waiters: AtomicUsize,
    backoff: BackOff,
    fid_minter: FidMinter,
    next_remote: AtomicUsize,
    completed_primary_tx: UnboundedSender<String>,
    completed_primary_rx: Mutex<Option<UnboundedReceiver<String>>>,
    completed_replica_tx: UnboundedSender<String>,
    completed_replica_rx: Mutex<Option<UnboundedReceiver<String>>>,
    shutting_down: Arc<AtomicBool>,
    cancellation: CancellationToken,
}

impl Storage {
    #[must_use]
    pub fn new(shared: Arc<Shared>) -> Arc<Self> {
        let (completed_primary_tx, completed_primary_rx) = mpsc::unbounded_channel();
        let (completed_replica_tx, completed_replica_rx) = mpsc::unbounded_channel();
        let backoff = BackOff::new(
            shared.clock.clone(),
            Duration::from_secs(60),
            Duration::from_millis(200),
            Duration::from_secs(10),
        );
        let fid_minter = FidMinter::new(shared.settings.machine_id, shared.clock.clone());

        Arc::new(Self {
            shared,
            primaries: Mutex::new(HashMap::new()),
            replicas: Mutex::new(HashMap::new()),
            waiting_list: WaitingList::new(),
            waiters: AtomicUsize::new(0),
            backoff,
            fid_minter,
            next_remote: AtomicUsize::new(0),
            completed_primary_tx,
            completed_primary_rx: Mutex::new(Some(completed_primary_rx)),
            completed_replica_tx,
            completed_replica_rx: Mutex::new(Some(completed_replica_rx)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            cancellation: CancellationToken::new(),
        })
    }

    /// Scans the spool directory for files left behind by a prior process (recovery): every
    /// surviving spool, whether it names a primary (bare FID) or a replica
    /// (`r-`-prefixed), is re-registered as a replica and sent straight into the upload cascade —
    /// there is no primary left on this node to resume appending to it. Unparseable file names
    /// are ignored. Spawns the completion-drain tasks and performs the initial admission check.
    pub async fn start(self: &Arc<Self>) -> Result<(), BlobbyError> {
        self.spawn_completion_drains();

        let mut entries = tokio::fs::read_dir(&self.shared.settings.spool_dir)
            .await
            .context(IoSnafu)?;

        while let Some(entry) = entries.next_entry().await.context(IoSnafu)? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.ends_with(".gz") {
                continue;
            }
            let fid_str = name.strip_prefix("r-").unwrap_or(&name);
            let Ok(fid) = FileId::from_string_id(fid_str) else {
                warn!(name = %name, "ignoring unparseable spool file during recovery");
                continue;
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let offset = metadata.len();

            let replica = Replica::from_recovered(
                fid,
                offset,
                self.shared.clone(),
                self.completed_replica_tx.clone(),
                self.shutting_down.clone(),
            );
            self.replicas.lock().insert(replica.fid_string().to_string(), replica);
        }

        self.check_idle_files().await;
        info!(namespace = %self.shared.namespace, primaries = self.primaries.lock().len(), replicas = self.replicas.lock().len(), "namespace recovered");
        Ok(())
    }

    fn spawn_completion_drains(self: &Arc<Self>) {
        if let Some(mut rx) = self.completed_primary_rx.lock().take() {
            let me = self.clone();
            tokio::spawn(async move {
                while let Some(fid) = rx.recv().await {
                    me.primaries.lock().remove(&fid);
                }
            });
        }
        if let Some(mut rx) = self.completed_replica_rx.lock().take() {
            let me = self.clone();
            tokio::spawn(async move {
                while let Some(fid) = rx.recv().await {
                    me.replicas.lock().remove(&fid);
                }
            });
        }
    }

    /// Admits `source` into whichever primary the waiting list hands out, drawn round-robin no
    /// differently than the peer-assignment policy. Returns the
    /// primary to the waiting list afterward iff it's still `Waiting`.
    pub async fn insert<R>(
        self: &Arc<Self>,
        source: R,
        declared_length: Option<u64>,
    ) -> Result<IdToken, BlobbyError>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        self.check_idle_files().await;

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let handle = self.waiting_list.get(|h| Ok::<PrimaryHandle, PrimaryHandle>(h)).await;
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        let primary = handle.0;
        let result = primary.insert(source, declared_length).await;
        if primary.state() == PrimaryState::Waiting {
            self.waiting_list.put(PrimaryHandle(primary)).await;
        }
        result
    }

    /// Opens additional primaries while `open < min_open_files`, or while the number of admission
    /// callers currently suspended exceeds `2^open` (up to `max_open_files`), subject to the
    /// open-failure backoff window.
    async fn check_idle_files(self: &Arc<Self>) {
        let open = self.primaries.lock().len();
        if open >= self.shared.settings.max_open_files {
            return;
        }
        let waiters = self.waiters.load(Ordering::SeqCst);
        let threshold = 1usize.checked_shl(open as u32).unwrap_or(usize::MAX);
        let need_more = open < self.shared.settings.min_open_files || waiters > threshold;
        if !need_more || !self.backoff.healthy() {
            return;
        }
        self.open_new_primary().await;
    }

    async fn open_new_primary(self: &Arc<Self>) {
        let fid = self.fid_minter.mint();
        let remotes = self.pick_remotes();
        let primary = Primary::new(
            fid,
            self.shared.clone(),
            remotes,
            self.waiting_list.clone(),
            self.completed_primary_tx.clone(),
            self.shutting_down.clone(),
        );
        self.primaries.lock().insert(primary.fid_string().to_string(), primary.clone());
        self.shared.metrics.appendable_primaries.increment(1.0);

        match primary.open().await {
            // `open()` can return `Ok(())` having already sealed itself (a peer rejected
            // `Initialize`), in which case it must never enter the idle pool.
            Ok(()) if primary.state() == PrimaryState::Waiting => {
                self.waiting_list.put(PrimaryHandle(primary)).await;
            }
            Ok(()) => {}
            Err(error) => {
                warn!(%error, "failed to open a new primary");
                self.backoff.failure();
            }
        }
    }

    /// Round-robin over the namespace's peers with no failure-based exclusion — an explicitly
    /// resolved Open Question (; see `DESIGN.md`).
    fn pick_remotes(&self) -> Vec<Arc<dyn Remote>> {
        let available = &self.shared.remotes;
        let n = self.shared.settings.replicas.min(available.len());
        if n == 0 {
            return Vec::new();
        }
        (0..n)
            .map(|_| {
                let idx = self.next_remote.fetch_add(1, Ordering::SeqCst) % available.len();
                available[idx].clone()
            })
            .collect()
    }

    /// The three-tier read resolver: local primary/replica, then peers, then
    /// cold storage. `local_only` stops after the first tier (used to answer a peer's own `GET`
    /// request without forwarding it again).
    pub async fn read(&self, token: IdToken, local_only: bool) -> Result<Bytes, BlobbyError> {
        let fid_string = token.fid.to_string_id();
        let end = token.start + u64::from(token.length);

        if let Some(primary) = self.primaries.lock().get(&fid_string).cloned() {
            if primary.offset() >= end {
                let path = self.shared.spool_path(&fid_string);
                if let Ok(bytes) = Self::read_local_file(&path, token.start, u64::from(token.length)).await {
                    return Ok(bytes);
                }
            }
        }
        if let Some(replica) = self.replicas.lock().get(&fid_string).cloned() {
            if replica.offset() >= end {
                let path = self.shared.spool_path(&format!("r-{fid_string}"));
                if let Ok(bytes) = Self::read_local_file(&path, token.start, u64::from(token.length)).await {
                    return Ok(bytes);
                }
            }
        }

        if local_only {
            return Err(BlobbyError::NotFound);
        }

        let owning_machine = token.fid.machine_id();
        if owning_machine != self.shared.settings.machine_id {
            if let Some(remote) = self.shared.remotes.iter().find(|r| r.machine_id() == owning_machine) {
                match remote.read(&self.shared.namespace, token, false).await {
                    Ok(Some(bytes)) => return Ok(bytes),
                    Ok(None) => {}
                    Err(error) => warn!(%error, machine_id = owning_machine, "peer read failed, falling back to object store"),
                }
            }
        }

        if self.shared.settings.compress {
            return Err(BlobbyError::NotPossible);
        }
        let key = self
            .shared
            .object_key(token.fid.epoch_seconds(), token.fid.counter(), token.fid.machine_id());
        let bytes = self
            .shared
            .object_store
            .get_range(&key, token.start, u64::from(token.length))
            .await
            .context(ObjectStoreSnafu)?;
        Ok(bytes)
    }

    /// Answers the "blast path" described in : a caller already knows which FID is
    /// currently primary on this node and just wants the freshest bytes `[start, end)`, failing
    /// fast rather than falling through tiers if this node isn't (yet) hosting it at that offset.
    pub async fn read_blast_path(&self, fid: FileId, start: u64, end: u64) -> Result<Bytes, BlobbyError> {
        let fid_string = fid.to_string_id();
        let primary = self
            .primaries
            .lock()
            .get(&fid_string)
            .cloned()
            .ok_or_else(|| BlobbyError::PrimaryNotFound { fid: fid_string.clone() })?;
        if primary.offset() < end {
            return Err(BlobbyError::ShortRead {
                expected: end,
                actual: primary.offset(),
            });
        }
        let path = self.shared.spool_path(&fid_string);
        Self::read_local_file(&path, start, end - start)
            .await
            .map_err(|source| BlobbyError::Io { source })
    }

    async fn read_local_file(path: &std::path::Path, start: u64, length: u64) -> std::io::Result<Bytes> {
        let mut file = tokio::fs::File::open(path).await?;
        let landed = file.seek(std::io::SeekFrom::Start(start)).await?;
        if landed != start {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("seek landed at {landed}, expected {start} (file shorter than start)"),
            ));
        }
        let stream = ReadStream::from_file(file, length);
        let bytes = read_to_bytes(stream).await?;
        if bytes.len() as u64 != length {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read {} bytes, expected {length} (short file)", bytes.len()),
            ));
        }
        Ok(bytes)
    }

    /// Looks up a replica hosted on this node and appends to it, for the `REPLICATE` verb
    ///.
    pub async fn replicate_into(
        &self,
        fid: FileId,
        start: u64,
        data: Bytes,
        hash: &str,
    ) -> Result<bool, BlobbyError> {
        let fid_string = fid.to_string_id();
        let replica = self
            .replicas
            .lock()
            .get(&fid_string)
            .cloned()
            .ok_or_else(|| BlobbyError::ReplicaNotFound { fid: fid_string })?;
        replica.replicate(start, data, hash).await
    }

    /// Registers a brand-new replica for `fid`, for the `INITIALIZE` verb.
    pub async fn initialize_replica(self: &Arc<Self>, fid: FileId) -> Result<(), BlobbyError> {
        let replica = Replica::new(
            fid,
            self.shared.clone(),
            self.completed_replica_tx.clone(),
            self.shutting_down.clone(),
        );
        replica.open().await?;
        self.replicas.lock().insert(replica.fid_string().to_string(), replica);
        Ok(())
    }

    /// For the `HEARTBEAT` verb: resets a locally-hosted replica's orphan
    /// watchdog, or a locally-hosted primary's own bookkeeping if this node happens to be asked
    /// about a FID it's primary for (defensive; peers should only heartbeat replicas).
    pub fn heart_beat(&self, fid: FileId) -> Result<bool, BlobbyError> {
        let fid_string = fid.to_string_id();
        if let Some(replica) = self.replicas.lock().get(&fid_string).cloned() {
            return replica.heart_beat();
        }
        if let Some(primary) = self.primaries.lock().get(&fid_string).cloned() {
            return primary.heart_beat();
        }
        Err(BlobbyError::ReplicaNotFound { fid: fid_string })
    }

    /// For the `DELETE` verb: queues a locally-hosted replica for deletion.
    pub fn queue_delete(&self, fid: FileId) -> Result<(), BlobbyError> {
        let fid_string = fid.to_string_id();
        let replica = self
            .replicas
            .lock()
            .get(&fid_string)
            .cloned()
            .ok_or_else(|| BlobbyError::ReplicaNotFound { fid: fid_string })?;
        replica.queue_delete();
        Ok(())
    }

    /// Cancels outstanding peer RPCs and uploads, stops the delay queue, and drains every
    /// background work queue.
    pub async fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancellation.cancel();
        self.shared.delay_queue.stop().await;

        for queue in [
            &self.shared.compress_queue,
            &self.shared.upload_queue,
            &self.shared.delete_local_queue,
            &self.shared.delete_remotes_queue,
        ] {
            while !queue.is_idle() || !queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}
