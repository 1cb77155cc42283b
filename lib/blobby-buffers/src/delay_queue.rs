//! A single-threaded timer facility: one background task waits on a single OS timer and fires
//! the earliest-due callback, rescanning an unordered list for the new minimum afterwards.
//!
//! An ordered heap would also work, but the expected workload — thousands of live tokens,
//! frequent `alter` churn (heartbeat/expiry rearm on every insert and replicate call), infrequent
//! actual firings — makes O(n) rescans cheaper in practice than maintaining heap invariants on
//! every rearm. See  / 

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// An opaque handle identifying a scheduled callback.
///
/// Tokens are only meaningful to the [`DelayQueue`] that issued them. The owning entity
/// (a primary or replica) holds exactly one `Token` per timer (heartbeat, expiry, delete-delay)
/// and re-issues `alter` against it for the lifetime of that timer, so there is no ambiguity from
/// id reuse in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Callback {
    /// Run directly on the queue's own task; must be short and non-blocking.
    Inline(Box<dyn FnOnce() + Send>),
    /// Spawned onto the runtime, for callbacks that need to block or do I/O.
    Spawn(Box<dyn FnOnce() -> BoxFuture + Send>),
}

struct Entry {
    deadline: Instant,
    callback: Callback,
}

enum Command {
    Alter {
        token: Token,
        deadline: Instant,
        callback: Callback,
    },
    Cancel {
        token: Token,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a running [`DelayQueue`]. Cheap to clone; all clones share the same background task.
#[derive(Clone)]
pub struct DelayQueue {
    tx: mpsc::UnboundedSender<Command>,
    next_token: std::sync::Arc<AtomicU64>,
}

impl DelayQueue {
    /// Starts the queue's background task and returns a handle to it.
    #[must_use]
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self {
            tx,
            next_token: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    /// Mints a fresh [`Token`] for a new timer. The token is not armed until the first `alter`.
    #[must_use]
    pub fn new_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// (Re)inserts `token` with a new deadline and callback, replacing any previous scheduling.
    ///
    /// `inline` callbacks run directly on the queue's task and must not block; everything else
    /// should use [`alter_spawn`](Self::alter_spawn).
    pub fn alter<F>(&self, token: Token, deadline: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.tx.send(Command::Alter {
            token,
            deadline,
            callback: Callback::Inline(Box::new(callback)),
        });
    }

    /// Like [`alter`](Self::alter), but `callback` is spawned as its own task when it fires,
    /// so it may block or perform I/O (disk truncation, peer RPCs, etc).
    pub fn alter_spawn<F, Fut>(&self, token: Token, deadline: Instant, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.send(Command::Alter {
            token,
            deadline,
            callback: Callback::Spawn(Box::new(move || Box::pin(callback()) as BoxFuture)),
        });
    }

    /// Convenience: arms `token` to fire `after` from now.
    pub fn alter_in<F>(&self, token: Token, after: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.alter(token, Instant::now() + after, callback);
    }

    /// Cancels `token` if it is currently scheduled. A no-op if it already fired or was never
    /// armed.
    pub fn cancel(&self, token: Token) {
        let _ = self.tx.send(Command::Cancel { token });
    }

    /// Stops the background task, dropping any still-pending callbacks without running them.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Stop { ack: ack_tx }).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut entries: HashMap<Token, Entry> = HashMap::new();

    loop {
        let next_deadline = entries.values().map(|e| e.deadline).min();
        let sleep = match next_deadline {
            Some(deadline) => tokio::time::sleep_until(deadline.into()),
            // Sleep "forever" (a year) rather than special-casing an empty queue in the select.
            None => tokio::time::sleep(Duration::from_secs(365 * 24 * 3600)),
        };
        tokio::pin!(sleep);

        tokio::select! {
            biased;

            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Alter { token, deadline, callback }) => {
                        trace!(?token, "delay queue: armed token");
                        entries.insert(token, Entry { deadline, callback });
                    }
                    Some(Command::Cancel { token }) => {
                        trace!(?token, "delay queue: cancelled token");
                        entries.remove(&token);
                    }
                    Some(Command::Stop { ack }) => {
                        let _ = ack.send(());
                        return;
                    }
                    None => return,
                }
            }

            () = &mut sleep, if next_deadline.is_some() => {
                let due: Vec<Token> = entries
                    .iter()
                    .filter(|(_, e)| e.deadline <= Instant::now())
                    .map(|(t, _)| *t)
                    .collect();

                for token in due {
                    if let Some(entry) = entries.remove(&token) {
                        trace!(?token, "delay queue: firing token");
                        match entry.callback {
                            Callback::Inline(f) => f(),
                            Callback::Spawn(f) => {
                                tokio::spawn(f());
                            }
                        }
                    }
                }
            }
        }
    }
}
