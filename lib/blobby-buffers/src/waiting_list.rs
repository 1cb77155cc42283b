//! A priority-ordered list of idle primaries, used to satisfy admission requests that arrive
//! while no primary is currently open for a namespace.
//!
//! Entries are kept sorted by an ascending "expiry hint" so that [`WaitingList::get`] always
//! hands out the primary closest to expiring first, spreading load across the rest. A caller that
//! finds nothing suitable suspends on the list until [`WaitingList::put`] wakes it.

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::{Mutex, Notify};

/// An entry a [`WaitingList`] can hold: something with an expiry hint used for ordering.
pub trait Prioritized {
    /// Smaller values are served first.
    fn expiry_hint(&self) -> u64;
}

struct Inner<P> {
    entries: Mutex<VecDeque<P>>,
    notify: Notify,
}

/// A priority-ordered waiting list of idle entries, plus a suspend/wake mechanism for callers
/// with nothing to take yet.
pub struct WaitingList<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for WaitingList<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Prioritized> Default for WaitingList<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Prioritized> WaitingList<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Inserts `entry` in priority order (ascending `expiry_hint`) and wakes one suspended
    /// `get` caller, if any.
    pub async fn put(&self, entry: P) {
        let mut entries = self.inner.entries.lock().await;
        let pos = entries
            .iter()
            .position(|e| e.expiry_hint() > entry.expiry_hint())
            .unwrap_or(entries.len());
        entries.insert(pos, entry);
        drop(entries);
        self.inner.notify.notify_one();
    }

    /// Repeatedly pops the head of the list and offers it to `check`; if `check` accepts it
    /// (returns `Some`), that value is returned. If the list is empty, or `check` rejects every
    /// entry currently present, suspends until [`put`](Self::put) adds something new, then
    /// retries.
    ///
    /// Rejected entries are held aside for the rest of one pass rather than reinserted
    /// immediately — reinserting right away would put a rejected, lowest-`expiry_hint` entry
    /// straight back at the head, where it would only be popped and rejected again forever.
    pub async fn get<F, T>(&self, mut check: F) -> T
    where
        F: FnMut(P) -> Result<T, P>,
    {
        loop {
            let mut rejected = Vec::new();
            loop {
                let popped = {
                    let mut entries = self.inner.entries.lock().await;
                    entries.pop_front()
                };
                let Some(entry) = popped else { break };
                match check(entry) {
                    Ok(value) => {
                        self.reinsert_all(rejected).await;
                        return value;
                    }
                    Err(entry) => rejected.push(entry),
                }
            }
            self.reinsert_all(rejected).await;
            self.inner.notify.notified().await;
        }
    }

    async fn reinsert_all(&self, rejected: Vec<P>) {
        if rejected.is_empty() {
            return;
        }
        let mut entries = self.inner.entries.lock().await;
        for entry in rejected {
            let pos = entries
                .iter()
                .position(|e| e.expiry_hint() > entry.expiry_hint())
                .unwrap_or(entries.len());
            entries.insert(pos, entry);
        }
    }

    /// Removes `entry` from the list if it is still present, per `matches`. Used when a primary
    /// is claimed out-of-band (expired, marked unhealthy) and must not be handed out by a
    /// concurrent `get`.
    pub async fn remove<F>(&self, matches: F) -> Option<P>
    where
        F: Fn(&P) -> bool,
    {
        let mut entries = self.inner.entries.lock().await;
        let pos = entries.iter().position(matches)?;
        entries.remove(pos)
    }

    /// Number of entries currently held (not the number of suspended `get` callers).
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Entry(u64, &'static str);

    impl Prioritized for Entry {
        fn expiry_hint(&self) -> u64 {
            self.0
        }
    }

    #[tokio::test]
    async fn put_orders_by_ascending_expiry_hint() {
        let list: WaitingList<Entry> = WaitingList::new();
        list.put(Entry(30, "c")).await;
        list.put(Entry(10, "a")).await;
        list.put(Entry(20, "b")).await;

        let got = list.get(|e| Ok::<_, Entry>(e)).await;
        assert_eq!(got, Entry(10, "a"));
    }

    #[tokio::test]
    async fn get_suspends_until_put() {
        let list: WaitingList<Entry> = WaitingList::new();
        let list2 = list.clone();

        let handle = tokio::spawn(async move { list2.get(|e| Ok::<_, Entry>(e)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        list.put(Entry(1, "only")).await;

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Entry(1, "only"));
    }

    #[tokio::test]
    async fn get_skips_rejected_entries() {
        let list: WaitingList<Entry> = WaitingList::new();
        list.put(Entry(1, "bad")).await;
        list.put(Entry(2, "good")).await;

        let got = list
            .get(|e| if e.1 == "good" { Ok(e) } else { Err(e) })
            .await;
        assert_eq!(got, Entry(2, "good"));
        assert_eq!(list.len().await, 1); // "bad" was put back
    }

    #[tokio::test]
    async fn remove_unlinks_matching_entry() {
        let list: WaitingList<Entry> = WaitingList::new();
        list.put(Entry(1, "a")).await;
        list.put(Entry(2, "b")).await;

        let removed = list.remove(|e| e.1 == "a").await;
        assert_eq!(removed, Some(Entry(1, "a")));
        assert_eq!(list.len().await, 1);
        assert!(list.remove(|e| e.1 == "a").await.is_none());
    }
}
