//! Applies queued deltas to the store and fans them out to handlers.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use kubecache_core::{Delta, DeltaKind, Error, Object};
use kubecache_store::{Batch, DeltaQueue, StoreWriter};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Callbacks invoked for every applied delta.
///
/// Calls for one informer never overlap, so per-key order is the queue order.
/// Expect an `on_add` per existing object at startup and an `on_update` with
/// `old == new` at every resync.
pub trait EventHandler<O>: Send + Sync {
    fn on_add(&self, obj: &O) -> anyhow::Result<()> {
        let _ = obj;
        Ok(())
    }

    fn on_update(&self, old: &O, new: &O) -> anyhow::Result<()> {
        let _ = (old, new);
        Ok(())
    }

    fn on_delete(&self, obj: &O) -> anyhow::Result<()> {
        let _ = obj;
        Ok(())
    }
}

type ObjFn<O> = Box<dyn Fn(&O) -> anyhow::Result<()> + Send + Sync>;
type PairFn<O> = Box<dyn Fn(&O, &O) -> anyhow::Result<()> + Send + Sync>;

/// Handler assembled from optional closures.
pub struct HandlerFuncs<O> {
    add: Option<ObjFn<O>>,
    update: Option<PairFn<O>>,
    delete: Option<ObjFn<O>>,
}

impl<O> Default for HandlerFuncs<O> {
    fn default() -> Self { Self { add: None, update: None, delete: None } }
}

impl<O> HandlerFuncs<O> {
    pub fn new() -> Self { Self::default() }

    pub fn add_func(mut self, f: impl Fn(&O) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn update_func(mut self, f: impl Fn(&O, &O) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn delete_func(mut self, f: impl Fn(&O) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<O> EventHandler<O> for HandlerFuncs<O> {
    fn on_add(&self, obj: &O) -> anyhow::Result<()> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &O, new: &O) -> anyhow::Result<()> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &O) -> anyhow::Result<()> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}

/// Single consumer of the delta queue and sole writer of the store.
pub struct Dispatcher<O: Object> {
    queue: Arc<DeltaQueue<O>>,
    writer: StoreWriter<O>,
    handler: Arc<dyn EventHandler<O>>,
}

impl<O: Object> Dispatcher<O> {
    pub fn new(queue: Arc<DeltaQueue<O>>, writer: StoreWriter<O>, handler: Arc<dyn EventHandler<O>>) -> Self {
        Self { queue, writer, handler }
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!("dispatcher started");
        loop {
            let popped = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                b = self.queue.pop() => b,
            };
            let Some(batch) = popped else { break };
            self.process(&batch);
            self.queue.done(&batch);
        }
        info!("dispatcher stopped");
    }

    /// Apply each delta of a batch in order, delivering after each apply.
    pub fn process(&mut self, batch: &Batch<O>) {
        for delta in batch.deltas.iter() {
            let previous = self.writer.apply(delta);
            counter!("kubecache_dispatched_total", 1u64, "kind" => delta.kind.as_str());
            if let Err(e) = self.deliver(delta, previous.as_deref()) {
                counter!("kubecache_handler_errors_total", 1u64);
                error!(key = %delta.key, kind = %delta.kind, error = %e, "handler failed");
            }
        }
    }

    fn deliver(&self, delta: &Delta<O>, previous: Option<&O>) -> Result<(), Error> {
        let handler = &*self.handler;
        let new = &*delta.object;
        let outcome = catch_unwind(AssertUnwindSafe(|| match (delta.kind, previous) {
            (DeltaKind::Deleted, _) => handler.on_delete(new),
            // The cached value, not the copy taken when the sync was queued.
            (DeltaKind::Sync, Some(cached)) => handler.on_update(cached, cached),
            (DeltaKind::Sync, None) => {
                debug!(key = %delta.key, "sync for uncached key; nothing to deliver");
                Ok(())
            }
            (_, Some(old)) => handler.on_update(old, new),
            (_, None) => handler.on_add(new),
        }));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Handler(format!("{:#}", e))),
            Err(panic) => Err(Error::Handler(format!("panicked: {}", panic_message(&*panic)))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
