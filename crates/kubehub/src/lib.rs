//! kubecache kubehub: list/watch source backed by the Kubernetes API.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::ops::Deref;

use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ErrorResponse, WatchEvent as KubeWatchEvent},
    Resource, ResourceExt,
};
use kubecache_core::{Cursor, Error, ListResult, ListWatch, Object, ObjectKey, Result, Selector, WatchEvent, WatchStream};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Server-side watch timeout; the API server rejects values of 295s and above.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// A Kubernetes resource as seen by the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct KubeObject<K>(pub K);

impl<K> Deref for KubeObject<K> {
    type Target = K;
    fn deref(&self) -> &K { &self.0 }
}

impl<K> KubeObject<K> {
    pub fn into_inner(self) -> K { self.0 }
}

impl<K> Object for KubeObject<K>
where
    K: Resource + Debug + PartialEq + Send + Sync + 'static,
{
    fn key(&self) -> ObjectKey { ObjectKey::new(self.0.namespace().as_deref(), &self.0.name_any()) }

    fn cursor(&self) -> Option<Cursor> { self.0.resource_version().map(Cursor::new) }
}

/// [`ListWatch`] over an `Api<K>`. A selector namespace narrows an all-namespaces `Api`.
pub struct KubeListWatch<K> {
    api: Api<K>,
    strip_managed_fields: bool,
}

impl<K> KubeListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + PartialEq + Send + Sync + 'static,
{
    pub fn new(api: Api<K>) -> Self { Self { api, strip_managed_fields: true } }

    /// Drop `metadata.managedFields` before caching (default on).
    pub fn strip_managed_fields(mut self, on: bool) -> Self {
        self.strip_managed_fields = on;
        self
    }

    fn wrap(&self, obj: K) -> KubeObject<K> { wrap(obj, self.strip_managed_fields) }
}

fn wrap<K: Resource>(mut obj: K, strip_managed_fields: bool) -> KubeObject<K> {
    if strip_managed_fields {
        obj.meta_mut().managed_fields = None;
    }
    KubeObject(obj)
}

/// Field selector sent to the server; a selector namespace becomes a
/// `metadata.namespace` term so an all-namespaces `Api` is still narrowed.
fn field_selector(selector: &Selector) -> Option<String> {
    let ns = selector.namespace.as_deref().map(|ns| format!("metadata.namespace={}", ns));
    match (ns, selector.fields.as_deref()) {
        (Some(ns), Some(fields)) => Some(format!("{},{}", ns, fields)),
        (ns, fields) => ns.or_else(|| fields.map(str::to_string)),
    }
}

fn list_params(selector: &Selector) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(labels) = selector.labels.as_deref() {
        lp = lp.labels(labels);
    }
    if let Some(fields) = field_selector(selector) {
        lp = lp.fields(&fields);
    }
    lp
}

fn watch_params(selector: &Selector) -> WatchParams {
    let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    if let Some(labels) = selector.labels.as_deref() {
        wp = wp.labels(labels);
    }
    if let Some(fields) = field_selector(selector) {
        wp = wp.fields(&fields);
    }
    wp
}

fn is_gone(code: u16) -> bool { code == 410 }

/// Classify a client error by how the reflector should recover from it.
pub fn classify(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if is_gone(ae.code) => Error::CursorExpired(ae.message),
        kube::Error::SerdeError(e) => Error::Malformed(e.to_string()),
        other => Error::Transient(other.to_string()),
    }
}

fn classify_status(status: ErrorResponse) -> Error {
    if is_gone(status.code) {
        Error::CursorExpired(status.message)
    } else {
        Error::Transient(format!("{} ({}): {}", status.reason, status.code, status.message))
    }
}

fn translate<K: Resource>(event: KubeWatchEvent<K>, strip: bool) -> Result<WatchEvent<KubeObject<K>>> {
    match event {
        KubeWatchEvent::Added(o) => Ok(WatchEvent::Added(wrap(o, strip))),
        KubeWatchEvent::Modified(o) => Ok(WatchEvent::Updated(wrap(o, strip))),
        KubeWatchEvent::Deleted(o) => Ok(WatchEvent::Deleted(wrap(o, strip))),
        KubeWatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(Cursor::new(b.metadata.resource_version))),
        KubeWatchEvent::Error(status) => Err(classify_status(status)),
    }
}

#[async_trait::async_trait]
impl<K> ListWatch for KubeListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + PartialEq + Send + Sync + 'static,
{
    type Object = KubeObject<K>;

    async fn list(&self, selector: &Selector) -> Result<ListResult<KubeObject<K>>> {
        let list = self.api.list(&list_params(selector)).await.map_err(classify)?;
        let cursor = Cursor::new(list.metadata.resource_version.unwrap_or_default());
        info!(items = list.items.len(), %cursor, "listed");
        metrics::counter!("kubecache_kube_list_items_total", list.items.len() as u64);
        let items = list.items.into_iter().map(|o| self.wrap(o)).collect();
        Ok(ListResult { items, cursor })
    }

    async fn watch(&self, selector: &Selector, since: &Cursor) -> Result<WatchStream<KubeObject<K>>> {
        let version = if since.is_empty() { "0" } else { since.as_str() };
        debug!(version, "opening watch");
        let stream = self.api.watch(&watch_params(selector), version).await.map_err(classify)?;
        let strip = self.strip_managed_fields;
        Ok(stream
            .map(move |item| match item {
                Ok(event) => translate(event, strip),
                Err(e) => Err(classify(e)),
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;

    fn pod(ns: Option<&str>, name: &str, rv: &str) -> Pod {
        let mut p = Pod::default();
        p.metadata.name = Some(name.to_string());
        p.metadata.namespace = ns.map(|s| s.to_string());
        p.metadata.resource_version = Some(rv.to_string());
        p
    }

    fn status(code: u16, reason: &str) -> ErrorResponse {
        ErrorResponse { status: "Failure".into(), message: "too old resource version: 1 (42)".into(), reason: reason.into(), code }
    }

    #[test]
    fn key_and_cursor_come_from_metadata() {
        let o = KubeObject(pod(Some("default"), "web-0", "42"));
        assert_eq!(o.key().as_str(), "default/web-0");
        assert_eq!(o.cursor(), Some(Cursor::new("42")));
        assert_eq!(o.name_any(), "web-0");
    }

    #[test]
    fn managed_fields_are_stripped_on_request() {
        let mut p = pod(None, "n", "1");
        p.metadata.managed_fields = Some(vec![ManagedFieldsEntry::default()]);
        assert!(wrap(p.clone(), true).metadata.managed_fields.is_none());
        assert!(wrap(p, false).metadata.managed_fields.is_some());
    }

    #[test]
    fn gone_maps_to_cursor_expired() {
        assert!(classify(kube::Error::Api(status(410, "Expired"))).is_cursor_expired());
        assert!(classify(kube::Error::Api(status(500, "InternalError"))).is_transient());
        assert!(classify_status(status(410, "Gone")).is_cursor_expired());
        assert!(classify_status(status(429, "TooManyRequests")).is_transient());
    }

    #[test]
    fn decode_errors_are_malformed() {
        let bad = serde_json::from_str::<Pod>("{\"metadata\": 7}").unwrap_err();
        assert!(classify(kube::Error::SerdeError(bad)).is_malformed());
    }

    #[test]
    fn watch_events_translate() {
        let ev = translate(KubeWatchEvent::Modified(pod(Some("ns"), "a", "9")), true).unwrap();
        match ev {
            WatchEvent::Updated(o) => assert_eq!(o.key().as_str(), "ns/a"),
            other => panic!("unexpected {:?}", other),
        }
        let err = translate::<Pod>(KubeWatchEvent::Error(status(410, "Expired")), true).unwrap_err();
        assert!(err.is_cursor_expired());
    }

    #[test]
    fn selectors_flow_into_params() {
        let sel = Selector::default().labels("foo=bar,baz=quux").fields("spec.nodeName=n1");
        let lp = list_params(&sel);
        assert_eq!(lp.label_selector.as_deref(), Some("foo=bar,baz=quux"));
        assert_eq!(lp.field_selector.as_deref(), Some("spec.nodeName=n1"));
        let wp = watch_params(&sel);
        assert_eq!(wp.label_selector.as_deref(), Some("foo=bar,baz=quux"));
        assert_eq!(wp.timeout, Some(WATCH_TIMEOUT_SECS));
        assert!(wp.bookmarks);
    }

    #[test]
    fn selector_namespace_limits_list_and_watch() {
        let sel = Selector::default().namespace("prod");
        assert_eq!(list_params(&sel).field_selector.as_deref(), Some("metadata.namespace=prod"));
        assert_eq!(watch_params(&sel).field_selector.as_deref(), Some("metadata.namespace=prod"));

        let both = sel.fields("spec.nodeName=n1");
        assert_eq!(
            watch_params(&both).field_selector.as_deref(),
            Some("metadata.namespace=prod,spec.nodeName=n1")
        );
        assert!(list_params(&Selector::default()).field_selector.is_none());
    }
}
