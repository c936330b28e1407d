//! kubecache store: the delta queue and the in-RAM object cache it feeds.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use kubecache_core::{Delta, DeltaKind, Object, ObjectKey};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::trace;

mod queue;

pub use queue::{Batch, DeltaQueue, Deltas};

struct Shared<O> {
    items: RwLock<FxHashMap<ObjectKey, Arc<O>>>,
    epoch_tx: watch::Sender<u64>,
}

/// Read handle over the cache. Cheap to clone; reads may run alongside the writer.
pub struct Store<O> {
    shared: Arc<Shared<O>>,
}

impl<O> Clone for Store<O> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

/// The only mutator of a [`Store`]. Not `Clone`: whoever owns it owns the writes.
pub struct StoreWriter<O> {
    shared: Arc<Shared<O>>,
}

/// Create a store and its single writer.
pub fn store<O: Object>() -> (StoreWriter<O>, Store<O>) {
    let (epoch_tx, _) = watch::channel(0u64);
    let shared = Arc::new(Shared { items: RwLock::new(FxHashMap::default()), epoch_tx });
    (StoreWriter { shared: Arc::clone(&shared) }, Store { shared })
}

impl<O: Object> Store<O> {
    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ObjectKey, Arc<O>>> {
        self.shared.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<O>> { self.read().get(key).cloned() }

    /// All cached objects, ordered by key.
    pub fn list(&self) -> Vec<Arc<O>> {
        let items = self.read();
        let mut keyed: Vec<_> = items.iter().collect();
        keyed.sort_unstable_by(|a, b| a.0.cmp(b.0));
        keyed.into_iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    pub fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.read().is_empty() }

    /// Number of deltas applied so far.
    pub fn epoch(&self) -> u64 { *self.shared.epoch_tx.borrow() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.shared.epoch_tx.subscribe() }
}

impl<O: Object> StoreWriter<O> {
    /// Apply one delta and return the value it replaced.
    ///
    /// A `Sync` never writes: its object may have been copied out before a newer
    /// delta landed. It returns the value cached now, or `None` if the key is gone.
    pub fn apply(&mut self, delta: &Delta<O>) -> Option<Arc<O>> {
        let (previous, len) = {
            let mut items = self.shared.items.write().unwrap_or_else(PoisonError::into_inner);
            let previous = match delta.kind {
                DeltaKind::Added | DeltaKind::Updated => items.insert(delta.key.clone(), Arc::clone(&delta.object)),
                DeltaKind::Deleted => items.remove(&delta.key),
                DeltaKind::Sync => {
                    let current = items.get(&delta.key).cloned();
                    trace!(key = %delta.key, cached = current.is_some(), "sync resolved against cache");
                    return current;
                }
            };
            (previous, items.len())
        };
        trace!(key = %delta.key, kind = %delta.kind, "applied");
        metrics::gauge!("kubecache_store_objects", len as f64);
        self.shared.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
        previous
    }

    /// A reader over the same map.
    pub fn reader(&self) -> Store<O> { Store { shared: Arc::clone(&self.shared) } }
}
