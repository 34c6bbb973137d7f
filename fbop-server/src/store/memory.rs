use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use super::{
    ChangeSet, Data, DocPath, Document, DocumentStore, Query, StoreError, Subscription,
    WriteBatch, WriteOp, change_channel,
};

/// Failure returned for writes into a collection, for exercising error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Unavailable,
    PermissionDenied,
}

/// In-process store backed by an ordered map. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    docs: Mutex<BTreeMap<DocPath, Data>>,
    failures: Mutex<HashMap<String, InjectedFailure>>,
    changes: broadcast::Sender<ChangeSet>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(BTreeMap::new()),
                failures: Mutex::new(HashMap::new()),
                changes: change_channel(),
            }),
        }
    }

    /// Makes every batch touching collection `collection_id` fail.
    pub fn inject_write_failure(&self, collection_id: &str, failure: InjectedFailure) {
        lock(&self.inner.failures).insert(collection_id.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        lock(&self.inner.failures).clear();
    }

    /// Number of live subscriptions still listening for changes.
    pub fn subscriber_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.docs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn injected_failure(&self, batch: &WriteBatch) -> Option<StoreError> {
        let failures = lock(&self.inner.failures);
        batch.ops().iter().find_map(|op| {
            let path = op.path();
            failures.get(path.collection_id()).map(|f| match f {
                InjectedFailure::Unavailable => {
                    StoreError::Unavailable(format!("write to {path} failed"))
                }
                InjectedFailure::PermissionDenied => {
                    StoreError::PermissionDenied(format!("write to {path} denied"))
                }
            })
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Every update must target a document that exists, either already or
/// through an earlier op of the same batch.
fn check_updates(docs: &BTreeMap<DocPath, Data>, batch: &WriteBatch) -> Result<(), StoreError> {
    let mut exists: HashMap<&DocPath, bool> = HashMap::new();
    for op in batch.ops() {
        let path = op.path();
        match op {
            WriteOp::Set(..) => {
                exists.insert(path, true);
            }
            WriteOp::Delete(_) => {
                exists.insert(path, false);
            }
            WriteOp::Update(..) => {
                let present = exists
                    .get(path)
                    .copied()
                    .unwrap_or_else(|| docs.contains_key(path));
                if !present {
                    return Err(StoreError::NotFound(path.to_string()));
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let docs = lock(&self.inner.docs);
        Ok(docs.get(path).map(|data| Document {
            path: path.clone(),
            data: data.clone(),
        }))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        batch.validate()?;
        if batch.is_empty() {
            return Ok(());
        }
        if let Some(err) = self.injected_failure(&batch) {
            return Err(err);
        }
        let changed = batch.changed_paths();
        {
            let mut docs = lock(&self.inner.docs);
            check_updates(&docs, &batch)?;
            for op in batch.into_ops() {
                match op {
                    WriteOp::Set(path, data) => {
                        docs.insert(path, data);
                    }
                    WriteOp::Update(path, fields) => {
                        if let Some(existing) = docs.get_mut(&path) {
                            existing.extend(fields);
                        }
                    }
                    WriteOp::Delete(path) => {
                        docs.remove(&path);
                    }
                }
            }
        }
        trace!(ops = changed.len(), "memory store: committed batch");
        // No receivers is fine.
        let _ = self.inner.changes.send(Arc::new(changed));
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        query.validate()?;
        let docs = lock(&self.inner.docs);
        let candidates = docs
            .iter()
            .filter(|(path, _)| query.touches(path))
            .map(|(path, data)| Document {
                path: path.clone(),
                data: data.clone(),
            });
        Ok(query.apply(candidates))
    }

    fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        query.validate()?;
        let changes = self.inner.changes.subscribe();
        Ok(Subscription::spawn(self.clone(), query, changes))
    }
}
