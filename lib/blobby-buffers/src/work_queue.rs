//! An unbounded FIFO of one-shot tasks, drained by up to `parallel` lazily-spawned workers.
//!
//! `insert` never blocks — it pushes onto a lock-free [`SegQueue`], which is itself backed by a
//! linked chain of fixed-size segments drawn from an internal free-list rather than a growable
//! ring. Workers are spawned on demand up to `parallel` and exit once the queue drains,
//! so a quiescent queue holds no tasks. See 

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_queue::SegQueue;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Task = Box<dyn FnOnce() -> BoxFuture + Send>;

/// A FIFO work queue with a bounded number of concurrent consumers.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    queue: SegQueue<Task>,
    len: AtomicUsize,
    running: AtomicUsize,
    parallel: usize,
}

impl WorkQueue {
    /// Creates a work queue that runs up to `parallel` tasks concurrently.
    #[must_use]
    pub fn new(parallel: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: SegQueue::new(),
                len: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                parallel: parallel.max(1),
            }),
        }
    }

    /// Enqueues `task`. Never blocks; spawns a worker if fewer than `parallel` are running.
    pub fn insert<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.len.fetch_add(1, Ordering::SeqCst);
        self.inner
            .queue
            .push(Box::new(move || Box::pin(task()) as BoxFuture));
        self.spawn_worker_if_needed();
    }

    /// Current number of tasks not yet picked up by a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if no worker tasks are currently running (queue is fully drained and quiescent).
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) == 0
    }

    fn spawn_worker_if_needed(&self) {
        loop {
            let current = self.inner.running.load(Ordering::SeqCst);
            if current >= self.inner.parallel {
                return;
            }
            if self
                .inner
                .running
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let inner = self.inner.clone();
                tokio::spawn(async move { worker_loop(inner).await });
                return;
            }
        }
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        match inner.queue.pop() {
            Some(task) => {
                inner.len.fetch_sub(1, Ordering::SeqCst);
                task().await;
            }
            None => {
                // Give up our worker slot, but re-check for a race where a task was pushed
                // between our failed pop and releasing the slot — if so, try to reclaim it
                // rather than leave a task stranded with no worker to pick it up.
                inner.running.fetch_sub(1, Ordering::SeqCst);
                if inner.queue.is_empty() {
                    return;
                }
                let current = inner.running.load(Ordering::SeqCst);
                if current >= inner.parallel
                    || inner
                        .running
                        .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicU32, time::Duration};

    use super::*;

    #[tokio::test]
    async fn runs_all_tasks() {
        let queue = WorkQueue::new(4);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..50 {
            let counter = counter.clone();
            queue.insert(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(counter.load(Ordering::SeqCst), 50);
        for _ in 0..100 {
            if queue.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn respects_parallelism_cap() {
        let queue = WorkQueue::new(2);
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            queue.insert(move || async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            });
        }

        for _ in 0..200 {
            if queue.is_idle() && queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
