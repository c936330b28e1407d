//! List → watch → relist loop feeding the delta queue.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use kubecache_core::{Cursor, Delta, DeltaKind, Error, InformerConfig, ListWatch, Object, ObjectKey, WatchEvent};
use kubecache_store::DeltaQueue;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A watch that ends cleanly sooner than this without delivering anything counts as a failure.
const MIN_WATCH_DURATION: Duration = Duration::from_secs(1);

enum WatchOutcome {
    Stopped,
    Expired(String),
    Closed,
    Failed(Error),
}

/// Translates remote list/watch activity into deltas.
///
/// The reflector keeps its own baseline of what it has emitted so far. Every
/// (re)list is reconciled against that baseline, never against the store,
/// which may still lag behind the queue.
pub struct Reflector<L: ListWatch> {
    list_watch: Arc<L>,
    config: InformerConfig,
    queue: Arc<DeltaQueue<L::Object>>,
    known: FxHashMap<ObjectKey, Arc<L::Object>>,
}

impl<L: ListWatch> Reflector<L> {
    pub fn new(list_watch: Arc<L>, config: InformerConfig, queue: Arc<DeltaQueue<L::Object>>) -> Self {
        Self { list_watch, config, queue, known: FxHashMap::default() }
    }

    /// Run until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        info!(selector = ?self.config.selector, "reflector started");
        let mut list_backoff = self.config.new_backoff();
        let mut watch_backoff = self.config.new_backoff();
        'relist: loop {
            let listed = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                r = self.list_watch.list(&self.config.selector) => r,
            };
            counter!("kubecache_lists_total", 1u64);
            let list = match listed {
                Ok(list) => list,
                Err(e) => {
                    counter!("kubecache_list_errors_total", 1u64, "reason" => e.reason());
                    let delay = next_delay(&mut list_backoff, &self.config);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "list failed; retrying");
                    if !sleep(delay, &token).await {
                        break;
                    }
                    continue;
                }
            };
            list_backoff.reset();
            let mut cursor = list.cursor;
            self.reconcile(list.items);

            let mut failures = 0u32;
            loop {
                let (outcome, received) = self.watch_once(&mut cursor, &token).await;
                if received > 0 {
                    failures = 0;
                    watch_backoff.reset();
                }
                match outcome {
                    WatchOutcome::Stopped => break 'relist,
                    WatchOutcome::Expired(reason) => {
                        counter!("kubecache_relists_total", 1u64, "reason" => "cursor_expired");
                        info!(%cursor, reason = %reason, "watch cursor expired; relisting");
                        continue 'relist;
                    }
                    WatchOutcome::Closed => {
                        debug!(%cursor, received, "watch closed; resuming");
                        failures = 0;
                        watch_backoff.reset();
                    }
                    WatchOutcome::Failed(e) => {
                        failures += 1;
                        counter!("kubecache_watch_errors_total", 1u64, "reason" => e.reason());
                        let delay = next_delay(&mut watch_backoff, &self.config);
                        if failures >= self.config.max_watch_failures {
                            counter!("kubecache_relists_total", 1u64, "reason" => "watch_failures");
                            warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "watch keeps failing; relisting");
                            if !sleep(delay, &token).await {
                                break 'relist;
                            }
                            continue 'relist;
                        }
                        warn!(error = %e, failures, %cursor, delay_ms = delay.as_millis() as u64, "watch failed; retrying");
                        if !sleep(delay, &token).await {
                            break 'relist;
                        }
                    }
                }
            }
        }
        info!("reflector stopped");
    }

    /// Diff a full listing against the baseline and enqueue the result as one batch.
    fn reconcile(&mut self, items: Vec<L::Object>) {
        let total = items.len();
        let mut next = FxHashMap::with_capacity_and_hasher(total, Default::default());
        let mut deltas = Vec::with_capacity(total);
        let (mut added, mut updated) = (0usize, 0usize);
        for item in items {
            let object = Arc::new(item);
            let key = object.key();
            match self.known.get(&key) {
                None => {
                    added += 1;
                    deltas.push(Delta { kind: DeltaKind::Added, key: key.clone(), object: Arc::clone(&object) });
                }
                Some(prev) if **prev != *object => {
                    updated += 1;
                    deltas.push(Delta { kind: DeltaKind::Updated, key: key.clone(), object: Arc::clone(&object) });
                }
                Some(_) => {}
            }
            next.insert(key, object);
        }
        let mut gone: Vec<_> = self.known.drain().filter(|(k, _)| !next.contains_key(k)).collect();
        gone.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let deleted = gone.len();
        deltas.extend(gone.into_iter().map(|(key, object)| Delta { kind: DeltaKind::Deleted, key, object }));
        self.known = next;
        info!(total, added, updated, deleted, "list reconciled");
        self.queue.replace(deltas);
    }

    async fn watch_once(&mut self, cursor: &mut Cursor, token: &CancellationToken) -> (WatchOutcome, usize) {
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return (WatchOutcome::Stopped, 0),
            r = self.list_watch.watch(&self.config.selector, cursor) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(Error::CursorExpired(m)) => return (WatchOutcome::Expired(m), 0),
            Err(e) => return (WatchOutcome::Failed(e), 0),
        };
        debug!(%cursor, "watch opened");
        let started = Instant::now();
        let mut received = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return (WatchOutcome::Stopped, received),
                n = stream.next() => n,
            };
            match next {
                None if received == 0 && started.elapsed() < MIN_WATCH_DURATION => {
                    let e = Error::Transient("watch closed immediately without events".into());
                    return (WatchOutcome::Failed(e), 0);
                }
                None => return (WatchOutcome::Closed, received),
                Some(Ok(event)) => {
                    received += 1;
                    self.handle_event(event, cursor);
                }
                Some(Err(Error::Malformed(m))) => {
                    counter!("kubecache_malformed_items_total", 1u64);
                    warn!(reason = %m, "skipping undecodable watch item");
                }
                Some(Err(Error::CursorExpired(m))) => return (WatchOutcome::Expired(m), received),
                Some(Err(e)) => return (WatchOutcome::Failed(e), received),
            }
        }
    }

    fn handle_event(&mut self, event: WatchEvent<L::Object>, cursor: &mut Cursor) {
        let (kind, object) = match event {
            WatchEvent::Bookmark(c) => {
                *cursor = c;
                return;
            }
            WatchEvent::Added(o) => (DeltaKind::Added, o),
            WatchEvent::Updated(o) => (DeltaKind::Updated, o),
            WatchEvent::Deleted(o) => (DeltaKind::Deleted, o),
        };
        if let Some(c) = object.cursor().filter(|c| !c.is_empty()) {
            *cursor = c;
        }
        let delta = Delta::new(kind, object);
        if kind == DeltaKind::Deleted {
            self.known.remove(&delta.key);
        } else {
            self.known.insert(delta.key.clone(), Arc::clone(&delta.object));
        }
        self.queue.push(delta);
    }
}

fn next_delay(backoff: &mut ExponentialBackoff, config: &InformerConfig) -> Duration {
    backoff.next_backoff().unwrap_or(config.max_backoff)
}

/// Sleep unless cancelled first; returns false on cancellation.
async fn sleep(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
