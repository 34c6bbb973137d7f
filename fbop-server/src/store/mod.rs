//! Document store adapter: hierarchical documents addressed by slash paths,
//! atomic write batches, filtered queries and live query subscriptions.

pub mod memory;
pub mod models;
pub mod schema;
pub mod sqlite;

use std::cmp::Ordering;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub use memory::{InjectedFailure, MemoryStore};
pub use sqlite::SqliteStore;

/// Field map of a single document.
pub type Data = serde_json::Map<String, Value>;

/// Upper bound on operations in one [`WriteBatch`].
pub const MAX_BATCH_OPS: usize = 500;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Structured error type for all store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    /// Rejected by the store's access-control layer.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Transient failure; the whole operation may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Path of a document: alternating collection and document id segments,
/// e.g. `families/F1/children/C1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath(String);

impl DocPath {
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let trimmed = path.trim_matches('/');
        let segs: Vec<&str> = trimmed.split('/').collect();
        if segs.len() % 2 != 0 || segs.iter().any(|s| s.trim().is_empty()) {
            return Err(StoreError::InvalidInput(format!(
                "not a document path: {path:?}"
            )));
        }
        Ok(DocPath(trimmed.to_string()))
    }

    /// `{collection}/{id}` at the top level.
    pub fn root(collection: &str, id: &str) -> Result<Self, StoreError> {
        check_segment(collection)?;
        check_segment(id)?;
        Ok(DocPath(format!("{collection}/{id}")))
    }

    /// Document `id` inside this document's subcollection `collection`.
    pub fn child(&self, collection: &str, id: &str) -> Result<Self, StoreError> {
        check_segment(collection)?;
        check_segment(id)?;
        Ok(DocPath(format!("{}/{collection}/{id}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn document_id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Name of the collection holding this document, e.g. `children`.
    pub fn collection_id(&self) -> &str {
        self.0.rsplit('/').nth(1).unwrap_or_default()
    }

    /// Full path of the collection holding this document,
    /// e.g. `families/F1/children`.
    pub fn parent_collection(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn check_segment(seg: &str) -> Result<(), StoreError> {
    if seg.trim().is_empty() || seg.contains('/') {
        return Err(StoreError::InvalidInput(format!(
            "invalid path segment: {seg:?}"
        )));
    }
    Ok(())
}

fn check_collection_path(path: &str) -> Result<(), StoreError> {
    let segs: Vec<&str> = path.split('/').collect();
    if segs.len() % 2 != 1 || segs.iter().any(|s| s.trim().is_empty()) {
        return Err(StoreError::InvalidInput(format!(
            "not a collection path: {path:?}"
        )));
    }
    Ok(())
}

fn check_field(field: &str) -> Result<(), StoreError> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidInput(format!(
            "invalid field name: {field:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocPath,
    pub data: Data,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.document_id()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }
}

/// Serializes a value into document fields. Only JSON objects qualify.
pub fn encode<T: Serialize>(value: &T) -> Result<Data, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidInput(format!(
            "documents must be objects, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or replace.
    Set(DocPath, Data),
    /// Merge top-level fields into an existing document.
    Update(DocPath, Data),
    /// Remove; a no-op when absent.
    Delete(DocPath),
}

impl WriteOp {
    pub fn path(&self) -> &DocPath {
        match self {
            WriteOp::Set(p, _) | WriteOp::Update(p, _) | WriteOp::Delete(p) => p,
        }
    }
}

/// All-or-nothing group of writes.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: DocPath, data: Data) -> &mut Self {
        self.ops.push(WriteOp::Set(path, data));
        self
    }

    pub fn update(&mut self, path: DocPath, data: Data) -> &mut Self {
        self.ops.push(WriteOp::Update(path, data));
        self
    }

    pub fn delete(&mut self, path: DocPath) -> &mut Self {
        self.ops.push(WriteOp::Delete(path));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.ops.len() > MAX_BATCH_OPS {
            return Err(StoreError::InvalidInput(format!(
                "batch has {} operations; limit is {MAX_BATCH_OPS}",
                self.ops.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn changed_paths(&self) -> Vec<DocPath> {
        self.ops.iter().map(|op| op.path().clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One collection, e.g. `families/F1/invites`.
    Collection(String),
    /// Every collection with this id anywhere in the tree.
    CollectionGroup(String),
    /// A single document; result sets hold zero or one entry.
    Document(DocPath),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Lt(String, Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub target: Target,
    pub filters: Vec<Filter>,
    pub order: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    fn new(target: Target) -> Self {
        Self {
            target,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn collection(path: impl Into<String>) -> Self {
        Self::new(Target::Collection(path.into()))
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self::new(Target::CollectionGroup(collection_id.into()))
    }

    pub fn document(path: DocPath) -> Self {
        Self::new(Target::Document(path))
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.into(), value.into()));
        self
    }

    pub fn where_lt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(field.into(), value.into()));
        self
    }

    /// Documents lacking `field` are excluded from ordered results.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        match &self.target {
            Target::Collection(path) => check_collection_path(path)?,
            Target::CollectionGroup(id) => check_segment(id)?,
            Target::Document(_) => {}
        }
        for filter in &self.filters {
            let (Filter::Eq(field, value) | Filter::Lt(field, value)) = filter;
            check_field(field)?;
            if value.is_array() || value.is_object() {
                return Err(StoreError::InvalidInput(format!(
                    "filter on {field} must compare a scalar"
                )));
            }
        }
        if let Some((field, _)) = &self.order {
            check_field(field)?;
        }
        Ok(())
    }

    /// Whether a write to `path` can affect this query's result set.
    pub fn touches(&self, path: &DocPath) -> bool {
        match &self.target {
            Target::Collection(c) => path.parent_collection() == c,
            Target::CollectionGroup(id) => path.collection_id() == id,
            Target::Document(p) => p == path,
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if !self.touches(&doc.path) {
            return false;
        }
        let filters_ok = self.filters.iter().all(|f| match f {
            Filter::Eq(field, want) => doc.data.get(field).is_some_and(|v| values_equal(v, want)),
            Filter::Lt(field, bound) => doc
                .data
                .get(field)
                .and_then(|v| compare_values(v, bound))
                .is_some_and(|o| o == Ordering::Less),
        });
        let has_order_field = match &self.order {
            Some((field, _)) => doc.data.contains_key(field),
            None => true,
        };
        filters_ok && has_order_field
    }

    /// Filters, orders and limits an unordered candidate set.
    pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut out: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
        match &self.order {
            Some((field, direction)) => out.sort_by(|a, b| {
                let ord = match (a.data.get(field), b.data.get(field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                };
                let ord = match direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                ord.then_with(|| a.path.cmp(&b.path))
            }),
            None => out.sort_by(|a, b| a.path.cmp(&b.path)),
        }
        if let Some(n) = self.limit {
            out.truncate(n);
        }
        out
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Orders scalars of the same kind; `None` for mismatched kinds.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Paths written by one committed batch.
pub type ChangeSet = Arc<Vec<DocPath>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError>;

    /// Applies every operation or none of them.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Live query: the current result set now, then again after every
    /// change touching the queried collection.
    fn subscribe(&self, query: Query) -> Result<Subscription, StoreError>;

    async fn set(&self, path: &DocPath, data: Data) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.set(path.clone(), data);
        self.commit(batch).await
    }

    /// Fails with [`StoreError::NotFound`] when the document does not exist.
    async fn update(&self, path: &DocPath, fields: Data) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.update(path.clone(), fields);
        self.commit(batch).await
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(path.clone());
        self.commit(batch).await
    }
}

pub type SharedStore = Arc<dyn DocumentStore>;

pub(crate) fn change_channel() -> broadcast::Sender<ChangeSet> {
    broadcast::channel(CHANGE_CHANNEL_CAPACITY).0
}

pub type Snapshot = Result<Vec<Document>, StoreError>;

/// Handle to a live query. Dropping it, or calling [`Subscription::unsubscribe`],
/// stops the watcher; no snapshot is delivered afterwards.
pub struct Subscription {
    snapshots: ReceiverStream<Snapshot>,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn spawn<S>(
        store: S,
        query: Query,
        mut changes: broadcast::Receiver<ChangeSet>,
    ) -> Self
    where
        S: DocumentStore + 'static,
    {
        let (tx, rx) = mpsc::channel::<Snapshot>(16);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            trace!(target_query = ?query.target, "subscription: started");
            'outer: loop {
                let snapshot = store.query(&query).await;
                let failed = snapshot.is_err();
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    sent = tx.send(snapshot) => if sent.is_err() { break },
                }
                if failed {
                    break;
                }
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break 'outer,
                        msg = changes.recv() => match msg {
                            Ok(paths) if paths.iter().any(|p| query.touches(p)) => continue 'outer,
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!(skipped = n, "subscription: lagged; re-reading");
                                continue 'outer;
                            }
                            Err(broadcast::error::RecvError::Closed) => break 'outer,
                        }
                    }
                }
            }
            trace!(target_query = ?query.target, "subscription: stopped");
        });
        Subscription {
            snapshots: ReceiverStream::new(rx),
            cancel,
        }
    }

    /// Next full result set; `None` once the subscription has ended.
    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        use futures::StreamExt;
        self.snapshots.next().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.snapshots).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(path: &str, data: Value) -> Document {
        Document {
            path: DocPath::parse(path).unwrap(),
            data: data.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn doc_path_accessors() {
        let p = DocPath::parse("families/F1/children/C1").unwrap();
        assert_eq!(p.document_id(), "C1");
        assert_eq!(p.collection_id(), "children");
        assert_eq!(p.parent_collection(), "families/F1/children");
        let tx = p.child("transactions", "T1").unwrap();
        assert_eq!(tx.as_str(), "families/F1/children/C1/transactions/T1");
        assert!(DocPath::parse("families").is_err());
        assert!(DocPath::parse("families//x/y").is_err());
        assert!(p.child("devices", "a/b").is_err());
    }

    #[test]
    fn query_scopes_by_target() {
        let nested = doc("families/F1/invites/AB23XZ7K", json!({}));
        let top = doc("inviteCodes/AB23XZ7K", json!({}));
        let group = Query::collection_group("invites");
        assert!(group.matches(&nested));
        assert!(!group.matches(&top));
        let coll = Query::collection("families/F2/invites");
        assert!(!coll.matches(&nested));
        let single = Query::document(top.path.clone());
        assert!(single.matches(&top));
    }

    #[test]
    fn apply_filters_orders_and_limits() {
        let docs = vec![
            doc("c/a", json!({"expiresAt": 30, "kind": "x"})),
            doc("c/b", json!({"expiresAt": 10, "kind": "x"})),
            doc("c/c", json!({"expiresAt": 20, "kind": "y"})),
            doc("c/d", json!({"kind": "x"})),
        ];
        let q = Query::collection("c")
            .where_eq("kind", "x")
            .order_by("expiresAt", Direction::Desc);
        let ids: Vec<_> = q.apply(docs.clone()).iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let q = Query::collection("c").where_lt("expiresAt", 25).limit(1);
        let ids: Vec<_> = q.apply(docs).iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn batch_limit_is_enforced() {
        let mut batch = WriteBatch::new();
        for i in 0..=MAX_BATCH_OPS {
            batch.delete(DocPath::root("c", &format!("d{i}")).unwrap());
        }
        assert!(matches!(batch.validate(), Err(StoreError::InvalidInput(_))));
    }

    #[test]
    fn rejects_unsafe_fields() {
        assert!(Query::collection("c").where_eq("a') OR 1=1 --", 1).validate().is_err());
        assert!(Query::collection("a/b").validate().is_err());
        assert!(Query::collection("c").where_eq("k", json!([1])).validate().is_err());
    }
}
