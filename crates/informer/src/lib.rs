//! kubecache informer: keeps a local cache in step with a list/watch source and
//! delivers ordered add/update/delete notifications.
//!
//! ```text
//! Reflector ──push──▶ DeltaQueue ──pop──▶ Dispatcher ──▶ Store + handlers
//!                         ▲                                  │
//!                         └──────── ResyncScheduler ◀────────┘ (keys)
//! ```

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kubecache_core::{Error, InformerConfig, ListWatch, Object, Result};
use kubecache_store::{DeltaQueue, Store, StoreWriter};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod dispatcher;
mod reflector;
mod resync;

pub use dispatcher::{Dispatcher, EventHandler, HandlerFuncs};
pub use reflector::Reflector;
pub use resync::ResyncScheduler;

const SYNC_POLL: Duration = Duration::from_millis(100);

/// A configured cache that has not started yet. [`run`](Self::run) consumes it.
pub struct Informer<L: ListWatch> {
    list_watch: Arc<L>,
    config: InformerConfig,
    queue: Arc<DeltaQueue<L::Object>>,
    writer: StoreWriter<L::Object>,
    handler: Arc<dyn EventHandler<L::Object>>,
}

impl<L: ListWatch> Informer<L> {
    pub fn new(list_watch: L, config: InformerConfig, handler: impl EventHandler<L::Object> + 'static) -> Result<Self> {
        config.validate()?;
        let (writer, _) = kubecache_store::store();
        Ok(Self {
            list_watch: Arc::new(list_watch),
            config,
            queue: Arc::new(DeltaQueue::new()),
            writer,
            handler: Arc::new(handler),
        })
    }

    /// Like [`new`](Self::new), reporting a missing collaborator as a configuration error.
    pub fn try_new(
        list_watch: Option<L>,
        config: InformerConfig,
        handler: impl EventHandler<L::Object> + 'static,
    ) -> Result<Self> {
        let list_watch = list_watch.ok_or_else(|| Error::Configuration("no list/watch source provided".into()))?;
        Self::new(list_watch, config, handler)
    }

    pub fn config(&self) -> &InformerConfig { &self.config }

    /// Query handle that stays valid while and after the informer runs.
    pub fn handle(&self) -> InformerHandle<L::Object> {
        InformerHandle { store: self.writer.reader(), queue: Arc::clone(&self.queue) }
    }

    pub fn store(&self) -> Store<L::Object> { self.writer.reader() }

    pub fn queue(&self) -> &Arc<DeltaQueue<L::Object>> { &self.queue }

    pub fn has_synced(&self) -> bool { self.queue.has_synced() }

    /// Start the reflector, dispatcher and resync scheduler, and block until
    /// `token` is cancelled and all three have stopped.
    pub async fn run(self, token: CancellationToken) {
        let Informer { list_watch, config, queue, writer, handler } = self;
        let store = writer.reader();
        info!(selector = ?config.selector, resync = ?config.resync_period, "informer starting");

        let mut tasks = Vec::with_capacity(3);
        if let Some(period) = config.resync_period {
            let resync = ResyncScheduler::new(period, store, Arc::clone(&queue));
            tasks.push(("resync", tokio::spawn(resync.run(token.child_token()))));
        }
        let dispatcher = Dispatcher::new(Arc::clone(&queue), writer, handler);
        tasks.push(("dispatcher", tokio::spawn(dispatcher.run(token.child_token()))));
        let reflector = Reflector::new(list_watch, config, Arc::clone(&queue));
        tasks.push(("reflector", tokio::spawn(reflector.run(token.child_token()))));

        token.cancelled().await;
        queue.close();
        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "informer task ended abnormally");
            }
        }
        info!("informer stopped");
    }
}

/// Read side of a running informer.
pub struct InformerHandle<O: Object> {
    store: Store<O>,
    queue: Arc<DeltaQueue<O>>,
}

impl<O: Object> Clone for InformerHandle<O> {
    fn clone(&self) -> Self { Self { store: self.store.clone(), queue: Arc::clone(&self.queue) } }
}

impl<O: Object> InformerHandle<O> {
    pub fn store(&self) -> &Store<O> { &self.store }

    /// True once the initial listing has been fully applied and delivered.
    pub fn has_synced(&self) -> bool { self.queue.has_synced() }

    /// Wait for [`has_synced`](Self::has_synced); false if cancelled first.
    pub async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        let mut poll = tokio::time::interval(SYNC_POLL);
        loop {
            if self.has_synced() {
                return true;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                _ = poll.tick() => {}
            }
        }
    }
}
