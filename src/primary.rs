//! The primary state machine: the single node currently accepting appends for one FID,
//! replicating each write before acknowledging it.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use blobby_buffers::{DelayToken, WaitingList, Prioritized};
use blobby_common::{FileId, HashComputer, Algorithm, IdToken};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::{error::BlobbyError, remote::Remote, shared::Shared, uploader};

/// All states a primary can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryState {
    New,
    Opening,
    InitializingRepls,
    Waiting,
    Inserting,
    Replicating,
    PendingCompression,
    Compressing,
    PendingUpload,
    Uploading,
    PendingDeleteCompressed,
    DeletingCompressed,
    PendingDeleteRemotes,
    DeletingRemotes,
    DelayLocalDelete,
    PendingDeleteLocal,
    DeletingLocal,
    Complete,
}

impl PrimaryState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PrimaryState::New => "New",
            PrimaryState::Opening => "Opening",
            PrimaryState::InitializingRepls => "InitializingRepls",
            PrimaryState::Waiting => "Waiting",
            PrimaryState::Inserting => "Inserting",
            PrimaryState::Replicating => "Replicating",
            PrimaryState::PendingCompression => "PendingCompression",
            PrimaryState::Compressing => "Compressing",
            PrimaryState::PendingUpload => "PendingUpload",
            PrimaryState::Uploading => "Uploading",
            PrimaryState::PendingDeleteCompressed => "PendingDeleteCompressed",
            PrimaryState::DeletingCompressed => "DeletingCompressed",
            PrimaryState::PendingDeleteRemotes => "PendingDeleteRemotes",
            PrimaryState::DeletingRemotes => "DeletingRemotes",
            PrimaryState::DelayLocalDelete => "DelayLocalDelete",
            PrimaryState::PendingDeleteLocal => "PendingDeleteLocal",
            PrimaryState::DeletingLocal => "DeletingLocal",
            PrimaryState::Complete => "Complete",
        }
    }

    /// The set counted towards `appendable_primaries`: primaries in flight to
    /// becoming appendable count too, not just `Waiting`.
    fn counts_as_appendable(self) -> bool {
        matches!(
            self,
            PrimaryState::New
                | PrimaryState::Opening
                | PrimaryState::InitializingRepls
                | PrimaryState::Waiting
                | PrimaryState::Inserting
                | PrimaryState::Replicating
        )
    }
}

struct Inner {
    state: PrimaryState,
    file: Option<tokio::fs::File>,
    offset: u64,
    first_insert: Option<Duration>,
    queued_for_upload: Option<Duration>,
}

/// A thin, locally-defined newtype so [`Prioritized`] can be implemented on an `Arc<Primary>`
/// without running into the orphan rule, and so the waiting list's element type reads as what it
/// actually is.
#[derive(Clone)]
pub struct PrimaryHandle(pub Arc<Primary>);

impl Prioritized for PrimaryHandle {
    fn expiry_hint(&self) -> u64 {
        self.0.expiry_hint.load(Ordering::Relaxed)
    }
}

/// The node currently accepting appends for one FID, replicating each to a fixed set of peers
/// before acknowledging.
pub struct Primary {
    fid: FileId,
    fid_string: String,
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
    remotes: Mutex<Vec<Option<Arc<dyn Remote>>>>,
    heartbeat_token: DelayToken,
    expiry_token: DelayToken,
    delete_delay_token: DelayToken,
    expiry_hint: AtomicU64,
    unhealthy: AtomicBool,
    waiting_list: WaitingList<PrimaryHandle>,
    completed_tx: UnboundedSender<String>,
    shutting_down: Arc<AtomicBool>,
}

impl Primary {
    /// Constructs a brand-new primary in state `New`, assigned `remotes` as its replica set
    /// (round-robin-chosen by the namespace, fixed for this primary's lifetime). Call
    /// [`open`](Self::open) to proceed.
    #[must_use]
    pub fn new(
        fid: FileId,
        shared: Arc<Shared>,
        remotes: Vec<Arc<dyn Remote>>,
        waiting_list: WaitingList<PrimaryHandle>,
        completed_tx: UnboundedSender<String>,
        shutting_down: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let fid_string = fid.to_string_id();
        let heartbeat_token = shared.delay_queue.new_token();
        let expiry_token = shared.delay_queue.new_token();
        let delete_delay_token = shared.delay_queue.new_token();
        Arc::new(Self {
            fid,
            fid_string,
            shared,
            inner: Mutex::new(Inner {
                state: PrimaryState::New,
                file: None,
                offset: 0,
                first_insert: None,
                queued_for_upload: None,
            }),
            remotes: Mutex::new(remotes.into_iter().map(Some).collect()),
            heartbeat_token,
            expiry_token,
            delete_delay_token,
            expiry_hint: AtomicU64::new(0),
            unhealthy: AtomicBool::new(false),
            waiting_list,
            completed_tx,
            shutting_down,
        })
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
    pub fn state(&self) -> PrimaryState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.inner.lock().offset
    }

    #[must_use]
    pub fn counts_as_appendable(&self) -> bool {
        self.inner.lock().state.counts_as_appendable()
    }

    fn spool_path(&self) -> PathBuf {
        self.shared.spool_path(&self.fid_string)
    }

    fn compressed_path(&self) -> PathBuf {
        let mut p = self.spool_path();
        p.set_extension("gz");
        p
    }

    fn object_key(&self) -> String {
        self.shared
            .object_key(self.fid.epoch_seconds(), self.fid.counter(), self.fid.machine_id())
    }

    /// `New → Opening → InitializingRepls → Waiting` on success; any peer failing `Initialize`
    /// sends the primary straight to `PendingDeleteRemotes` instead.
    pub async fn open(self: &Arc<Self>) -> Result<(), BlobbyError> {
        {
            let mut g = self.inner.lock();
            g.state = PrimaryState::Opening;
        }

        let path = self.spool_path();
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(source) => {
                let mut g = self.inner.lock();
                g.state = PrimaryState::Complete;
                drop(g);
                self.shared.metrics.appendable_primaries.decrement(1.0);
                let _ = self.completed_tx.send(self.fid_string.clone());
                return Err(BlobbyError::Io { source });
            }
        };

        {
            let mut g = self.inner.lock();
            g.file = Some(file);
            g.state = PrimaryState::InitializingRepls;
        }
        self.arm_heartbeat_half();

        let snapshot = self.remotes.lock().clone();
        let ns = self.shared.namespace.clone();
        let fid = self.fid;
        let results = futures::future::join_all(snapshot.iter().map(|slot| {
            let ns = ns.clone();
            async move {
                match slot {
                    Some(remote) => remote.initialize(&ns, fid).await.is_ok(),
                    None => true,
                }
            }
        }))
        .await;

        let mut any_failed = false;
        {
            let mut remotes = self.remotes.lock();
            for (slot, ok) in remotes.iter_mut().zip(results.into_iter()) {
                if !ok {
                    *slot = None;
                    any_failed = true;
                }
            }
        }

        if any_failed {
            warn!(fid = %self.fid_string, "a peer rejected Initialize, sealing before any insert");
            self.seal().await;
        } else {
            self.arm_expiry();
            let mut g = self.inner.lock();
            g.state = PrimaryState::Waiting;
        }
        Ok(())
    }

    /// The nine-step append protocol: stream `source` into the local spool
    /// while hashing it, fan the same bytes out to every live replica, and only then commit the
    /// new offset and mint an [`IdToken`]. `declared_length`, when given, models a caller-declared
    /// body length (e.g. `Content-Length`) disagreeing with what was actually read — the "short
    /// read" boundary case.
    pub async fn insert<R>(
        self: &Arc<Self>,
        mut source: R,
        declared_length: Option<u64>,
    ) -> Result<IdToken, BlobbyError>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        let start = {
            let mut g = self.inner.lock();
            g.state = PrimaryState::Inserting;
            g.offset
        };

        let mut file = {
            let mut g = self.inner.lock();
            g.file.take().expect("primary file handle missing while Inserting")
        };

        let mut hasher = HashComputer::new(Algorithm::Keyed64);
        let mut written: u64 = 0;
        let mut buf = [0u8; 8192];
        let mut source_err = None;
        let mut write_err = None;

        loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    hasher.update(&buf[..n]);
                    if let Err(e) = file.write_all(&buf[..n]).await {
                        write_err = Some(e);
                        break;
                    }
                    written += n as u64;
                }
                Err(e) => {
                    source_err = Some(e);
                    break;
                }
            }
        }

        // Step 3: the source stream errored mid-read (client disconnect) — roll back to the
        // pre-insert offset, surface the error, and stay open for the next caller.
        if let Some(source_error) = source_err {
            let _ = file.set_len(start).await;
            let mut g = self.inner.lock();
            g.file = Some(file);
            drop(g);
            self.enter_waiting_or_seal().await;
            return Err(BlobbyError::Io { source: source_error });
        }

        // Step 4: the local write itself errored — the disk may be in an unknown state, so this
        // is non-recoverable: roll back and seal rather than risk a torn record.
        if let Some(write_error) = write_err {
            let _ = file.set_len(start).await;
            let mut g = self.inner.lock();
            g.file = Some(file);
            drop(g);
            self.seal().await;
            return Err(BlobbyError::Io { source: write_error });
        }
        let _ = file.flush().await;

        // Step 5: caller declared a different length than what was actually read.
        if let Some(declared) = declared_length {
            if declared != written {
                let _ = file.set_len(start).await;
                let mut g = self.inner.lock();
                g.file = Some(file);
                drop(g);
                self.enter_waiting_or_seal().await;
                return Err(BlobbyError::ShortRead {
                    expected: declared,
                    actual: written,
                });
            }
        }

        // Step 6: fan the bytes just written out to every live replica, re-read from the file we
        // just appended to rather than retaining a second in-memory copy while writing.
        {
            let mut g = self.inner.lock();
            g.state = PrimaryState::Replicating;
            g.file = Some(file);
        }
        self.rearm_heartbeat_half();

        let hash = hasher.hash();
        let mut file = { self.inner.lock().file.take().expect("file missing while Replicating") };
        let mut payload_buf = vec![0u8; written as usize];
        let _ = file.seek(std::io::SeekFrom::Start(start)).await;
        let _ = file.read_exact(&mut payload_buf).await;
        {
            let mut g = self.inner.lock();
            g.file = Some(file);
        }
        let payload = Bytes::from(payload_buf);

        let snapshot = self.remotes.lock().clone();
        let ns = self.shared.namespace.clone();
        let fid = self.fid;
        let results = futures::future::join_all(snapshot.iter().map(|slot| {
            let ns = ns.clone();
            let payload = payload.clone();
            let hash = hash.clone();
            async move {
                match slot {
                    Some(remote) => Some(remote.replicate(&ns, fid, start, payload, &hash).await),
                    None => None,
                }
            }
        }))
        .await;

        let mut first_error: Option<(u32, String)> = None;
        let mut any_shutting_down = false;
        for (slot, result) in snapshot.iter().zip(results.iter()) {
            if let (Some(remote), Some(outcome)) = (slot, result) {
                match outcome {
                    Ok(shutting_down) => any_shutting_down |= *shutting_down,
                    Err(error) => {
                        if first_error.is_none() {
                            first_error = Some((remote.machine_id(), error.to_string()));
                        }
                    }
                }
            }
        }

        // Step 7: any peer error leaves that peer's on-disk state ambiguous relative to ours —
        // the insert as a whole is non-recoverable, so roll back and seal.
        if let Some((machine_id, reason)) = first_error {
            self.shared.metrics.replicate_errors_total.increment(1);
            let mut file = { self.inner.lock().file.take().expect("file missing") };
            let _ = file.set_len(start).await;
            {
                let mut g = self.inner.lock();
                g.file = Some(file);
            }
            self.seal().await;
            return Err(BlobbyError::PeerUnreachable { machine_id, reason });
        }

        // Step 8: commit.
        let token = {
            let mut g = self.inner.lock();
            g.offset += written;
            if g.first_insert.is_none() {
                g.first_insert = Some(self.shared.clock.now_unix());
            }
            IdToken::new(self.fid, start, written as u32)
        };
        self.shared.metrics.inserts_total.increment(1);
        self.shared.metrics.insert_bytes_total.increment(written);

        // Step 9: seal if a peer is draining or we've crossed the size threshold, else go back
        // to accepting inserts.
        let offset_now = self.inner.lock().offset;
        if any_shutting_down || offset_now > self.shared.settings.upload_larger_than {
            self.seal().await;
        } else {
            self.enter_waiting_or_seal().await;
        }

        Ok(token)
    }

    /// Re-enters `Waiting` unless the primary was marked `unhealthy` by a failed heartbeat while
    /// it was checked out of the waiting list, in which case it seals instead.
    async fn enter_waiting_or_seal(self: &Arc<Self>) {
        if self.unhealthy.load(Ordering::SeqCst) {
            self.seal().await;
        } else {
            let mut g = self.inner.lock();
            g.state = PrimaryState::Waiting;
        }
    }

    /// Accepted iff `state ∈ {New, Opening, InitializingRepls, Waiting, Inserting,
    /// Replicating}`; resets the replica's view of this primary as alive and rearms our own
    /// heartbeat token.
    pub fn heart_beat(self: &Arc<Self>) -> Result<bool, BlobbyError> {
        {
            let g = self.inner.lock();
            if !g.state.counts_as_appendable() {
                return Err(BlobbyError::WrongReplicaState { state: g.state.name() });
            }
        }
        Ok(self.shutting_down.load(Ordering::SeqCst))
    }

    fn arm_heartbeat_half(self: &Arc<Self>) {
        let me = self.clone();
        let deadline = std::time::Instant::now() + self.shared.settings.heartbeat_time / 2;
        self.shared
            .delay_queue
            .alter_spawn(self.heartbeat_token, deadline, move || async move {
                me.on_heartbeat_fire().await;
            });
    }

    fn rearm_heartbeat_half(self: &Arc<Self>) {
        self.arm_heartbeat_half();
    }

    fn arm_expiry(self: &Arc<Self>) {
        let deadline_instant = std::time::Instant::now() + self.shared.settings.upload_older;
        let deadline_epoch = self.shared.clock.now_unix() + self.shared.settings.upload_older;
        self.expiry_hint.store(deadline_epoch.as_secs(), Ordering::SeqCst);
        let me = self.clone();
        self.shared
            .delay_queue
            .alter_spawn(self.expiry_token, deadline_instant, move || async move {
                me.on_expiry_fire().await;
            });
    }

    /// Fires every `heartbeat_time / 2` while appendable: emits `HeartBeat` to every live peer.
    /// A failure marks the primary `unhealthy`; if it can be pulled out of the waiting list right
    /// away (it was idle), it seals immediately, otherwise the in-flight insert/replicate will
    /// seal on its own next transition.
    async fn on_heartbeat_fire(self: Arc<Self>) {
        let live = {
            let g = self.inner.lock();
            g.state.counts_as_appendable()
        };
        if !live {
            return;
        }

        let snapshot = self.remotes.lock().clone();
        let ns = self.shared.namespace.clone();
        let fid = self.fid;
        let results = futures::future::join_all(snapshot.iter().map(|slot| {
            let ns = ns.clone();
            async move {
                match slot {
                    Some(remote) => Some(remote.heart_beat(&ns, fid).await),
                    None => None,
                }
            }
        }))
        .await;

        let any_failed = results.iter().any(|r| matches!(r, Some(Err(_))));
        if any_failed {
            self.unhealthy.store(true, Ordering::SeqCst);
            self.shared.metrics.heartbeat_failures_total.increment(1);
            let me_for_match = self.clone();
            let removed = self
                .waiting_list
                .remove(|h| Arc::ptr_eq(&h.0, &me_for_match))
                .await;
            if removed.is_some() {
                debug!(fid = %self.fid_string, "primary unhealthy and idle, sealing");
                self.seal().await;
                return;
            }
        }

        let still_live = {
            let g = self.inner.lock();
            g.state.counts_as_appendable()
        };
        if still_live {
            self.arm_heartbeat_half();
        }
    }

    /// Fires `upload_older` after the primary opened. Seals it iff it is still sitting idle in
    /// the waiting list; if it's mid-insert, that path will observe the age on its own next
    /// transition via [`enter_waiting_or_seal`] only if marked unhealthy — the expiry event is
    /// independent of that flag and only acts when it can remove the primary itself
    ///.
    async fn on_expiry_fire(self: Arc<Self>) {
        let me_for_match = self.clone();
        let removed = self
            .waiting_list
            .remove(|h| Arc::ptr_eq(&h.0, &me_for_match))
            .await;
        if removed.is_some() {
            self.seal().await;
        }
    }

    /// Transitions out of the appendable set into the compress/upload/delete cascade
    ///. `offset == 0` skips straight to the delete phases.
    async fn seal(self: &Arc<Self>) {
        self.shared.delay_queue.cancel(self.heartbeat_token);
        self.shared.delay_queue.cancel(self.expiry_token);

        let offset = self.inner.lock().offset;
        let has_live_peer = self.remotes.lock().iter().any(Option::is_some);

        let next = if offset == 0 {
            if has_live_peer {
                PrimaryState::PendingDeleteRemotes
            } else {
                PrimaryState::PendingDeleteLocal
            }
        } else if self.shared.settings.compress {
            PrimaryState::PendingCompression
        } else {
            PrimaryState::PendingUpload
        };

        {
            let mut g = self.inner.lock();
            g.state = next;
        }
        self.shared.metrics.sealed_total.increment(1);
        self.shared.metrics.appendable_primaries.decrement(1.0);
        self.enqueue_for(next);
    }

    fn enqueue_for(self: &Arc<Self>, state: PrimaryState) {
        let me = self.clone();
        match state {
            PrimaryState::PendingCompression => self
                .shared
                .compress_queue
                .insert(move || async move { me.compress_step().await }),
            PrimaryState::PendingUpload => self
                .shared
                .upload_queue
                .insert(move || async move { me.upload_step().await }),
            PrimaryState::PendingDeleteCompressed => self
                .shared
                .delete_local_queue
                .insert(move || async move { me.delete_compressed_step().await }),
            PrimaryState::PendingDeleteRemotes => self
                .shared
                .delete_remotes_queue
                .insert(move || async move { me.delete_remotes_step().await }),
            PrimaryState::PendingDeleteLocal => self
                .shared
                .delete_local_queue
                .insert(move || async move { me.delete_local_step().await }),
            _ => {}
        }
    }

    async fn compress_step(self: Arc<Self>) {
        {
            let mut g = self.inner.lock();
            if g.state != PrimaryState::PendingCompression {
                return;
            }
            g.state = PrimaryState::Compressing;
        }

        match self.do_compress().await {
            Ok(()) => {
                let mut g = self.inner.lock();
                g.state = PrimaryState::PendingUpload;
                drop(g);
                self.enqueue_for(PrimaryState::PendingUpload);
            }
            Err(error) => {
                warn!(fid = %self.fid_string, %error, "primary compression failed, requeuing");
                let mut g = self.inner.lock();
                g.state = PrimaryState::PendingCompression;
                drop(g);
                self.enqueue_for(PrimaryState::PendingCompression);
            }
        }
    }

    async fn do_compress(&self) -> std::io::Result<()> {
        let src_path = self.spool_path();
        let dst_path = self.compressed_path();
        let data = tokio::fs::read(&src_path).await?;

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use flate2::{write::GzEncoder, Compression};
            let out = std::fs::File::create(&dst_path)?;
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
            if g.state != PrimaryState::PendingUpload {
                return;
            }
            g.state = PrimaryState::Uploading;
            g.queued_for_upload.get_or_insert(self.shared.clock.now_unix());
        }

        let compressed = self.compressed_path();
        let path = if self.shared.settings.compress && compressed.exists() {
            compressed
        } else {
            self.spool_path()
        };
        let key = self.object_key();

        match uploader::upload_file(self.shared.object_store.as_ref(), &path, &key).await {
            Ok(()) => {
                self.shared.metrics.uploads_total.increment(1);
                let mut g = self.inner.lock();
                g.state = PrimaryState::PendingDeleteCompressed;
                drop(g);
                self.enqueue_for(PrimaryState::PendingDeleteCompressed);
            }
            Err(error) => {
                warn!(fid = %self.fid_string, %error, "primary upload failed, requeuing");
                self.shared.metrics.upload_errors_total.increment(1);
                let mut g = self.inner.lock();
                g.state = PrimaryState::PendingUpload;
                drop(g);
                self.enqueue_for(PrimaryState::PendingUpload);
            }
        }
    }

    async fn delete_compressed_step(self: Arc<Self>) {
        {
            let mut g = self.inner.lock();
            if g.state != PrimaryState::PendingDeleteCompressed {
                return;
            }
            g.state = PrimaryState::DeletingCompressed;
        }

        let compressed = self.compressed_path();
        if tokio::fs::metadata(&compressed).await.is_ok() {
            if let Err(error) = tokio::fs::remove_file(&compressed).await {
                warn!(fid = %self.fid_string, %error, "failed to remove compressed artifact, requeuing");
                let mut g = self.inner.lock();
                g.state = PrimaryState::PendingDeleteCompressed;
                drop(g);
                self.enqueue_for(PrimaryState::PendingDeleteCompressed);
                return;
            }
        }

        let mut g = self.inner.lock();
        g.state = PrimaryState::PendingDeleteRemotes;
        drop(g);
        self.enqueue_for(PrimaryState::PendingDeleteRemotes);
    }

    /// Tells every live peer to drop its replica. Individual peer failures are logged and
    /// tolerated rather than requeued — an orphaned replica will eventually self-seal via its own
    /// heartbeat watchdog.
    async fn delete_remotes_step(self: Arc<Self>) {
        {
            let mut g = self.inner.lock();
            if !matches!(
                g.state,
                PrimaryState::PendingDeleteRemotes | PrimaryState::Opening | PrimaryState::InitializingRepls
            ) {
                return;
            }
            g.state = PrimaryState::DeletingRemotes;
        }

        let snapshot = self.remotes.lock().clone();
        let ns = self.shared.namespace.clone();
        let fid = self.fid;
        let _ = futures::future::join_all(snapshot.iter().map(|slot| {
            let ns = ns.clone();
            async move {
                if let Some(remote) = slot {
                    if let Err(error) = remote.delete(&ns, fid).await {
                        warn!(fid = %fid.to_string_id(), machine_id = remote.machine_id(), %error, "peer delete failed, ignoring");
                    }
                }
            }
        }))
        .await;

        let next = if let Some(delay) = self.shared.settings.delay_delete {
            let deadline = std::time::Instant::now() + delay;
            let me = self.clone();
            self.shared
                .delay_queue
                .alter_spawn(self.delete_delay_token, deadline, move || async move {
                    me.on_delete_delay_fire().await;
                });
            PrimaryState::DelayLocalDelete
        } else {
            PrimaryState::PendingDeleteLocal
        };

        let mut g = self.inner.lock();
        g.state = next;
        drop(g);
        if next == PrimaryState::PendingDeleteLocal {
            self.enqueue_for(PrimaryState::PendingDeleteLocal);
        }
    }

    async fn on_delete_delay_fire(self: Arc<Self>) {
        let mut g = self.inner.lock();
        if g.state != PrimaryState::DelayLocalDelete {
            return;
        }
        g.state = PrimaryState::PendingDeleteLocal;
        drop(g);
        self.enqueue_for(PrimaryState::PendingDeleteLocal);
    }

    async fn delete_local_step(self: Arc<Self>) {
        {
            let mut g = self.inner.lock();
            if g.state != PrimaryState::PendingDeleteLocal {
                return;
            }
            g.state = PrimaryState::DeletingLocal;
            g.file = None;
        }

        let path = self.spool_path();
        let _ = tokio::fs::remove_file(&path).await;

        let mut g = self.inner.lock();
        g.state = PrimaryState::Complete;
        drop(g);
        self.shared.delay_queue.cancel(self.delete_delay_token);
        let _ = self.completed_tx.send(self.fid_string.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_shared_with, FakeRemote};
    use blobby_common::TestClock;
    use std::io::Cursor;

    fn waiting_list() -> WaitingList<PrimaryHandle> {
        WaitingList::new()
    }

    #[tokio::test]
    async fn open_creates_spool_file_and_initializes_replicas() {
        let clock = Arc::new(TestClock::new(Duration::from_secs(1_700_000_000)));
        let remote = Arc::new(FakeRemote::new(2));
        let (shared, _dir) = test_shared_with(vec![remote.clone()], clock).await;
        let fid = FileId::new(1_700_000_000, 1, shared.settings.machine_id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let primary = Primary::new(
            fid,
            shared,
            vec![remote],
            waiting_list(),
            tx,
            Arc::new(AtomicBool::new(false)),
        );

        primary.open().await.unwrap();
        assert_eq!(primary.state(), PrimaryState::Waiting);
    }

    #[tokio::test]
    async fn insert_replicates_and_commits_offset() {
        let clock = Arc::new(TestClock::new(Duration::from_secs(1_700_000_000)));
        let remote = Arc::new(FakeRemote::new(2));
        let (shared, _dir) = test_shared_with(vec![remote.clone()], clock).await;
        let fid = FileId::new(1_700_000_000, 2, shared.settings.machine_id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let primary = Primary::new(
            fid,
            shared,
            vec![remote.clone()],
            waiting_list(),
            tx,
            Arc::new(AtomicBool::new(false)),
        );
        primary.open().await.unwrap();

        let token = primary
            .insert(Cursor::new(b"hello world".to_vec()), None)
            .await
            .unwrap();
        assert_eq!(token.start, 0);
        assert_eq!(token.length, 11);
        assert_eq!(primary.offset(), 11);
        assert_eq!(primary.state(), PrimaryState::Waiting);
        assert_eq!(remote.replicated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_rejects_declared_length_mismatch() {
        let clock = Arc::new(TestClock::new(Duration::from_secs(1_700_000_000)));
        let (shared, _dir) = test_shared_with(vec![], clock).await;
        let fid = FileId::new(1_700_000_000, 3, shared.settings.machine_id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let primary = Primary::new(
            fid,
            shared,
            vec![],
            waiting_list(),
            tx,
            Arc::new(AtomicBool::new(false)),
        );
        primary.open().await.unwrap();

        let err = primary
            .insert(Cursor::new(b"short".to_vec()), Some(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobbyError::ShortRead { .. }));
        assert_eq!(primary.offset(), 0);
        assert_eq!(primary.state(), PrimaryState::Waiting);
    }

    #[tokio::test]
    async fn peer_replicate_error_seals_and_rolls_back() {
        let clock = Arc::new(TestClock::new(Duration::from_secs(1_700_000_000)));
        let remote = Arc::new(FakeRemote::new(2));
        remote.fail_next.store(true, Ordering::SeqCst);
        let (shared, _dir) = test_shared_with(vec![remote.clone()], clock).await;
        let fid = FileId::new(1_700_000_000, 4, shared.settings.machine_id);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let primary = Primary::new(
            fid,
            shared,
            vec![remote],
            waiting_list(),
            tx,
            Arc::new(AtomicBool::new(false)),
        );
        primary.open().await.unwrap();

        let err = primary.insert(Cursor::new(b"ABCDE".to_vec()), None).await.unwrap_err();
        assert!(matches!(err, BlobbyError::PeerUnreachable { .. }));
        assert_eq!(primary.offset(), 0);
        assert_ne!(primary.state(), PrimaryState::Waiting);
    }
}
