//! Delta queue: per-key compression with FIFO key order.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kubecache_core::{Delta, DeltaKind, Object, ObjectKey};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use tokio::sync::Notify;
use tracing::debug;

pub type Deltas<O> = SmallVec<[Delta<O>; 2]>;

/// Everything pending for one key, handed out by [`DeltaQueue::pop`].
#[derive(Debug)]
pub struct Batch<O> {
    pub key: ObjectKey,
    pub deltas: Deltas<O>,
    /// Counted toward the initial population; acknowledge with [`DeltaQueue::done`].
    pub initial: bool,
}

struct Inner<O> {
    items: FxHashMap<ObjectKey, Deltas<O>>,
    order: VecDeque<ObjectKey>,
    populated: bool,
    initial_remaining: usize,
    initial_in_flight: usize,
    closed: bool,
}

/// Thread-safe queue between producers (reflector, resync) and the dispatcher.
///
/// A key holds at most one effective pending delta, except that a queued
/// `Deleted` is never merged away: later deltas for the key are appended
/// behind it.
pub struct DeltaQueue<O> {
    inner: Mutex<Inner<O>>,
    notify: Notify,
}

impl<O: Object> Default for DeltaQueue<O> {
    fn default() -> Self { Self::new() }
}

impl<O: Object> DeltaQueue<O> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                populated: false,
                initial_remaining: 0,
                initial_in_flight: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<O>> {
        // Critical sections never leave the maps half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, delta: Delta<O>) {
        let mut inner = self.lock();
        if inner.closed {
            debug!(key = %delta.key, kind = %delta.kind, "push on closed queue ignored");
            return;
        }
        if inner.enqueue(delta) {
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Enqueue the deltas of one full reconciliation. The first call fixes the
    /// initial population that [`has_synced`](Self::has_synced) waits for.
    pub fn replace(&self, deltas: Vec<Delta<O>>) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        let mut woke = false;
        for d in deltas {
            woke |= inner.enqueue(d);
        }
        if !inner.populated {
            inner.populated = true;
            inner.initial_remaining = inner.order.len();
            debug!(keys = inner.initial_remaining, "initial population queued");
        }
        drop(inner);
        if woke {
            self.notify.notify_one();
        }
    }

    /// Wait for the next key with pending deltas. Returns `None` once closed.
    pub async fn pop(&self) -> Option<Batch<O>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(key) = inner.order.pop_front() {
                    let deltas = inner.items.remove(&key).unwrap_or_default();
                    let initial = inner.initial_remaining > 0;
                    if initial {
                        inner.initial_remaining -= 1;
                        inner.initial_in_flight += 1;
                    }
                    metrics::gauge!("kubecache_queue_keys", inner.order.len() as f64);
                    return Some(Batch { key, deltas, initial });
                }
            }
            notified.await;
        }
    }

    /// Acknowledge that a popped batch has been fully processed.
    pub fn done(&self, batch: &Batch<O>) {
        if batch.initial {
            let mut inner = self.lock();
            inner.initial_in_flight = inner.initial_in_flight.saturating_sub(1);
        }
    }

    /// True once the first reconciliation has been delivered and processed.
    pub fn has_synced(&self) -> bool {
        let inner = self.lock();
        inner.populated && inner.initial_remaining == 0 && inner.initial_in_flight == 0
    }

    /// Keys with pending deltas, in pop order.
    pub fn list_keys(&self) -> Vec<ObjectKey> { self.lock().order.iter().cloned().collect() }

    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Stop accepting deltas and wake every waiter in `pop`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool { self.lock().closed }
}

impl<O: Object> Inner<O> {
    /// Returns true when a new key entered the FIFO.
    fn enqueue(&mut self, delta: Delta<O>) -> bool {
        metrics::counter!("kubecache_deltas_pushed_total", 1u64, "kind" => delta.kind.as_str());
        let Some(pending) = self.items.get_mut(&delta.key) else {
            self.order.push_back(delta.key.clone());
            self.items.insert(delta.key.clone(), smallvec![delta]);
            metrics::gauge!("kubecache_queue_keys", self.order.len() as f64);
            return true;
        };
        let Some(last) = pending.last_mut() else {
            pending.push(delta);
            return false;
        };
        match (last.kind, delta.kind) {
            // Pending state is at least as fresh as the cache copy a sync carries.
            (_, DeltaKind::Sync) => {
                debug!(key = %delta.key, "sync dropped behind pending delta");
            }
            (DeltaKind::Deleted, DeltaKind::Deleted) => {
                last.object = delta.object;
            }
            (DeltaKind::Deleted, _) | (_, DeltaKind::Deleted) => pending.push(delta),
            (DeltaKind::Added, _) => {
                last.object = delta.object;
            }
            (_, kind) => {
                last.kind = kind;
                last.object = delta.object;
            }
        }
        metrics::counter!("kubecache_deltas_compressed_total", 1u64);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubecache_core::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Obj { name: &'static str, rev: u32 }

    impl Object for Obj {
        fn key(&self) -> ObjectKey { ObjectKey::new(Some("ns"), self.name) }
        fn cursor(&self) -> Option<Cursor> { Some(Cursor::new(self.rev.to_string())) }
    }

    fn d(kind: DeltaKind, name: &'static str, rev: u32) -> Delta<Obj> {
        Delta::new(kind, Obj { name, rev })
    }

    fn shape(b: &Batch<Obj>) -> Vec<(DeltaKind, u32)> {
        b.deltas.iter().map(|d| (d.kind, d.object.rev)).collect()
    }

    #[tokio::test]
    async fn updates_collapse_to_latest() {
        let q = DeltaQueue::new();
        q.push(d(DeltaKind::Updated, "a", 1));
        q.push(d(DeltaKind::Updated, "a", 2));
        q.push(d(DeltaKind::Updated, "a", 3));
        assert_eq!(q.len(), 1);
        let b = q.pop().await.unwrap();
        assert_eq!(shape(&b), vec![(DeltaKind::Updated, 3)]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn added_survives_merge_and_delete_is_kept() {
        let q = DeltaQueue::new();
        q.push(d(DeltaKind::Added, "a", 1));
        q.push(d(DeltaKind::Updated, "a", 2));
        q.push(d(DeltaKind::Deleted, "a", 2));
        q.push(d(DeltaKind::Deleted, "a", 3));
        q.push(d(DeltaKind::Added, "a", 4));
        q.push(d(DeltaKind::Sync, "a", 4));
        let b = q.pop().await.unwrap();
        assert_eq!(
            shape(&b),
            vec![(DeltaKind::Added, 2), (DeltaKind::Deleted, 3), (DeltaKind::Added, 4)]
        );
    }

    #[tokio::test]
    async fn sync_never_overrides_pending_change() {
        let q = DeltaQueue::new();
        q.push(d(DeltaKind::Sync, "a", 1));
        q.push(d(DeltaKind::Updated, "a", 2));
        q.push(d(DeltaKind::Sync, "a", 1));
        let b = q.pop().await.unwrap();
        assert_eq!(shape(&b), vec![(DeltaKind::Updated, 2)]);
    }

    #[tokio::test]
    async fn keys_pop_in_first_enqueue_order() {
        let q = DeltaQueue::new();
        q.push(d(DeltaKind::Added, "b", 1));
        q.push(d(DeltaKind::Added, "a", 1));
        q.push(d(DeltaKind::Updated, "b", 2));
        assert_eq!(q.list_keys(), vec![ObjectKey::from("ns/b"), ObjectKey::from("ns/a")]);
        assert_eq!(q.pop().await.unwrap().key.as_str(), "ns/b");
        q.push(d(DeltaKind::Updated, "b", 3));
        assert_eq!(q.pop().await.unwrap().key.as_str(), "ns/a");
        assert_eq!(q.pop().await.unwrap().key.as_str(), "ns/b");
    }

    #[tokio::test]
    async fn has_synced_after_initial_population_processed() {
        let q = DeltaQueue::new();
        assert!(!q.has_synced());
        q.replace(vec![d(DeltaKind::Added, "a", 1), d(DeltaKind::Added, "b", 1)]);
        q.push(d(DeltaKind::Added, "c", 1));
        assert!(!q.has_synced());
        let b1 = q.pop().await.unwrap();
        q.done(&b1);
        let b2 = q.pop().await.unwrap();
        assert!(!q.has_synced());
        q.done(&b2);
        assert!(q.has_synced());
        let b3 = q.pop().await.unwrap();
        assert!(!b3.initial);
    }

    #[tokio::test]
    async fn pushes_before_first_replace_do_not_count_as_synced() {
        let q = DeltaQueue::new();
        q.push(d(DeltaKind::Sync, "early", 1));
        assert!(!q.has_synced());
        q.replace(vec![d(DeltaKind::Added, "a", 1)]);
        assert!(!q.has_synced());
        let b1 = q.pop().await.unwrap();
        q.done(&b1);
        assert!(!q.has_synced());
        let b2 = q.pop().await.unwrap();
        assert_eq!(b2.key.as_str(), "ns/a");
        q.done(&b2);
        assert!(q.has_synced());
    }

    #[tokio::test]
    async fn empty_initial_list_is_synced() {
        let q: DeltaQueue<Obj> = DeltaQueue::new();
        q.replace(Vec::new());
        assert!(q.has_synced());
    }

    #[tokio::test]
    async fn pop_wakes_on_push_and_close() {
        let q = Arc::new(DeltaQueue::<Obj>::new());
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.pop().await.map(|b| b.key) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(d(DeltaKind::Added, "a", 1));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got.unwrap().as_str(), "ns/a");

        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.pop().await.is_none() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
        q.push(d(DeltaKind::Added, "b", 1));
        assert!(q.is_empty());
    }
}
