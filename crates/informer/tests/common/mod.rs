#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubecache_core::{Cursor, Error, ListResult, ListWatch, Object, ObjectKey, Result, Selector, WatchEvent, WatchStream};
use kubecache_informer::EventHandler;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    pub name: String,
    pub phase: String,
    pub rev: u64,
}

impl Object for Pod {
    fn key(&self) -> ObjectKey { ObjectKey::new(Some("default"), &self.name) }
    fn cursor(&self) -> Option<Cursor> { Some(Cursor::new(self.rev.to_string())) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    List,
    Watch(u64),
}

type Item = Result<WatchEvent<Pod>>;

struct State {
    objects: BTreeMap<String, Pod>,
    rev: u64,
    history: Vec<(u64, WatchEvent<Pod>)>,
    compacted_to: u64,
    live: Option<mpsc::UnboundedSender<Item>>,
    list_errors: VecDeque<Error>,
    watch_errors: VecDeque<Error>,
    calls: Vec<(Call, Instant)>,
}

/// In-memory remote with a change history, compaction and fault injection.
#[derive(Clone)]
pub struct Remote {
    state: Arc<Mutex<State>>,
    opened: Arc<watch::Sender<usize>>,
}

impl Remote {
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                rev: 0,
                history: Vec::new(),
                compacted_to: 0,
                live: None,
                list_errors: VecDeque::new(),
                watch_errors: VecDeque::new(),
                calls: Vec::new(),
            })),
            opened: Arc::new(opened),
        }
    }

    fn record(s: &mut State, event: WatchEvent<Pod>) {
        s.history.push((s.rev, event.clone()));
        if let Some(tx) = &s.live {
            let _ = tx.send(Ok(event));
        }
    }

    pub fn upsert(&self, name: &str, phase: &str) -> Pod {
        let mut s = self.state.lock().unwrap();
        s.rev += 1;
        let pod = Pod { name: name.to_string(), phase: phase.to_string(), rev: s.rev };
        let event = match s.objects.insert(name.to_string(), pod.clone()) {
            None => WatchEvent::Added(pod.clone()),
            Some(_) => WatchEvent::Updated(pod.clone()),
        };
        Self::record(&mut s, event);
        pod
    }

    pub fn delete(&self, name: &str) {
        let mut s = self.state.lock().unwrap();
        s.rev += 1;
        let rev = s.rev;
        if let Some(mut pod) = s.objects.remove(name) {
            pod.rev = rev;
            Self::record(&mut s, WatchEvent::Deleted(pod));
        }
    }

    /// Forget history up to now; older cursors become expired.
    pub fn compact(&self) {
        let mut s = self.state.lock().unwrap();
        s.compacted_to = s.rev;
    }

    /// End the live watch, optionally with a terminal error item.
    pub fn disconnect(&self, err: Option<Error>) {
        let mut s = self.state.lock().unwrap();
        if let Some(tx) = s.live.take() {
            if let Some(e) = err {
                let _ = tx.send(Err(e));
            }
        }
    }

    pub fn send_raw(&self, item: Item) {
        let s = self.state.lock().unwrap();
        if let Some(tx) = &s.live {
            let _ = tx.send(item);
        }
    }

    pub fn fail_next_lists(&self, n: usize, err: Error) {
        let mut s = self.state.lock().unwrap();
        s.list_errors.extend(std::iter::repeat(err).take(n));
    }

    pub fn fail_next_watches(&self, n: usize, err: Error) {
        let mut s = self.state.lock().unwrap();
        s.watch_errors.extend(std::iter::repeat(err).take(n));
    }

    pub fn snapshot(&self) -> Vec<Pod> { self.state.lock().unwrap().objects.values().cloned().collect() }

    pub fn calls(&self) -> Vec<(Call, Instant)> { self.state.lock().unwrap().calls.clone() }

    pub fn call_kinds(&self) -> Vec<Call> { self.calls().into_iter().map(|(c, _)| c).collect() }

    pub fn list_count(&self) -> usize { self.call_kinds().iter().filter(|c| **c == Call::List).count() }

    /// Wait until at least `n` watches have been opened successfully.
    pub async fn wait_for_watches(&self, n: usize) {
        let mut rx = self.opened.subscribe();
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|c| *c >= n))
            .await
            .expect("watch was not opened in time")
            .unwrap();
    }
}

#[async_trait::async_trait]
impl ListWatch for Remote {
    type Object = Pod;

    async fn list(&self, _selector: &Selector) -> Result<ListResult<Pod>> {
        let mut s = self.state.lock().unwrap();
        s.calls.push((Call::List, Instant::now()));
        if let Some(e) = s.list_errors.pop_front() {
            return Err(e);
        }
        Ok(ListResult { items: s.objects.values().cloned().collect(), cursor: Cursor::new(s.rev.to_string()) })
    }

    async fn watch(&self, _selector: &Selector, since: &Cursor) -> Result<WatchStream<Pod>> {
        let since: u64 = since.as_str().parse().map_err(|_| Error::Malformed(format!("bad cursor {:?}", since)))?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut s = self.state.lock().unwrap();
            s.calls.push((Call::Watch(since), Instant::now()));
            if let Some(e) = s.watch_errors.pop_front() {
                return Err(e);
            }
            if since < s.compacted_to {
                return Err(Error::CursorExpired(format!("resource version {} is too old", since)));
            }
            for (rev, event) in s.history.iter() {
                if *rev > since {
                    let _ = tx.send(Ok(event.clone()));
                }
            }
            s.live = Some(tx);
        }
        self.opened.send_modify(|n| *n += 1);
        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }))
    }
}

/// Handler that logs every callback as a short line.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn seen(&self) -> Vec<String> { self.0.lock().unwrap().clone() }

    pub fn count(&self, line: &str) -> usize { self.seen().iter().filter(|l| *l == line).count() }
}

impl EventHandler<Pod> for Recorder {
    fn on_add(&self, p: &Pod) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(format!("add {}@{}", p.name, p.rev));
        Ok(())
    }

    fn on_update(&self, old: &Pod, new: &Pod) -> anyhow::Result<()> {
        let line = if old == new {
            format!("resync {}@{}", new.name, new.rev)
        } else {
            format!("update {}@{}->{}", new.name, old.rev, new.rev)
        };
        self.0.lock().unwrap().push(line);
        Ok(())
    }

    fn on_delete(&self, p: &Pod) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(format!("delete {}", p.name));
        Ok(())
    }
}

/// Poll `cond` on the tokio clock until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
