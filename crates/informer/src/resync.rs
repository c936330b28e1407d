use std::sync::Arc;
use std::time::Duration;

use kubecache_core::{Delta, DeltaKind, Object};
use kubecache_store::{DeltaQueue, Store};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Periodically re-queues every cached object as a `Sync` delta.
/// Only the local store is consulted; nothing is fetched from the remote.
pub struct ResyncScheduler<O: Object> {
    period: Duration,
    store: Store<O>,
    queue: Arc<DeltaQueue<O>>,
}

impl<O: Object> ResyncScheduler<O> {
    pub fn new(period: Duration, store: Store<O>, queue: Arc<DeltaQueue<O>>) -> Self {
        Self { period, store, queue }
    }

    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.resync_once();
                }
            }
        }
        debug!("resync scheduler stopped");
    }

    /// Queue one `Sync` per cached key; returns how many were pushed.
    pub fn resync_once(&self) -> usize {
        let mut pushed = 0;
        for key in self.store.list_keys() {
            if let Some(object) = self.store.get(&key) {
                self.queue.push(Delta { kind: DeltaKind::Sync, key, object });
                pushed += 1;
            }
        }
        metrics::counter!("kubecache_resync_ticks_total", 1u64);
        debug!(keys = pushed, "resync queued");
        pushed
    }
}
