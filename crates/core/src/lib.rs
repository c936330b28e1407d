//! kubecache core types: object identity, deltas, and the list/watch contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod config;
mod error;

pub use config::InformerConfig;
pub use error::{Error, Result};

/// Identity of a cached object: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Opaque resume token for a watch stream (the remote resource version).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Capability every cached object exposes. The cache never looks past these
/// two accessors plus equality (used to tell an update from a no-op on relist).
pub trait Object: fmt::Debug + PartialEq + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;
    fn cursor(&self) -> Option<Cursor>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Re-delivery of already cached state, produced by resync.
    Sync,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Sync => "sync",
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A typed state transition for one key.
#[derive(Debug)]
pub struct Delta<O> {
    pub kind: DeltaKind,
    pub key: ObjectKey,
    pub object: Arc<O>,
}

impl<O> Clone for Delta<O> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, key: self.key.clone(), object: Arc::clone(&self.object) }
    }
}

impl<O: Object> Delta<O> {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<O>>) -> Self {
        let object = object.into();
        Self { kind, key: object.key(), object }
    }
}

/// Filter applied to both list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub namespace: Option<String>,
    pub labels: Option<String>,
    pub fields: Option<String>,
}

impl Selector {
    pub fn namespace(mut self, ns: impl Into<String>) -> Self { self.namespace = Some(ns.into()); self }
    pub fn labels(mut self, s: impl Into<String>) -> Self { self.labels = Some(s.into()); self }
    pub fn fields(mut self, s: impl Into<String>) -> Self { self.fields = Some(s.into()); self }

    /// Reject selectors that could never be sent: empty strings and terms without a key.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.namespace.as_deref(), Some("")) {
            return Err(Error::Configuration("namespace must not be empty (omit it to watch all)".into()));
        }
        for (what, expr) in [("label", &self.labels), ("field", &self.fields)] {
            let Some(expr) = expr.as_deref() else { continue };
            if expr.trim().is_empty() {
                return Err(Error::Configuration(format!("{} selector must not be empty", what)));
            }
            for term in expr.split(',') {
                let key = term.split(['=', '!', ' ']).next().unwrap_or("").trim();
                if key.is_empty() {
                    return Err(Error::Configuration(format!("invalid {} selector term: {:?}", what, term)));
                }
            }
        }
        Ok(())
    }
}

/// One item of a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<O> {
    Added(O),
    Updated(O),
    Deleted(O),
    /// Progress marker: advances the cursor, carries no object.
    Bookmark(Cursor),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListResult<O> {
    pub items: Vec<O>,
    pub cursor: Cursor,
}

pub type WatchStream<O> = BoxStream<'static, Result<WatchEvent<O>>>;

/// Remote access contract consumed by the reflector.
///
/// `list` must report transport failures as [`Error::Transient`]. A watch that
/// cannot resume from `since` (history compacted) must surface
/// [`Error::CursorExpired`], either when opening or as a stream item.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync + 'static {
    type Object: Object;

    async fn list(&self, selector: &Selector) -> Result<ListResult<Self::Object>>;

    async fn watch(&self, selector: &Selector, since: &Cursor) -> Result<WatchStream<Self::Object>>;
}

pub mod prelude {
    pub use super::{
        Cursor, Delta, DeltaKind, Error, InformerConfig, ListResult, ListWatch, Object, ObjectKey, Result,
        Selector, WatchEvent, WatchStream,
    };
}
