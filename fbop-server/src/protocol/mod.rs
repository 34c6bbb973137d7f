//! Family, invite, child-lookup and device-access operations over a
//! [`DocumentStore`], plus the expiry sweeper.

pub mod child_lookup;
pub mod devices;
pub mod family;
pub mod invite;
pub mod ledger;
pub mod paths;
pub mod sweeper;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;

use crate::store::{DocPath, DocumentStore, MAX_BATCH_OPS, Query, SharedStore, StoreError, WriteBatch};

pub use child_lookup::ChildLookups;
pub use devices::{AccessState, DeviceRegistry};
pub use family::Families;
pub use invite::Invites;
pub use ledger::Ledger;
pub use sweeper::{SweepReport, sweep};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("sign-in required")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Network or service trouble; safe to retry the whole operation.
    #[error("store unavailable: {0}")]
    TransientStoreFailure(String),

    /// An earlier step committed and a later one did not.
    #[error("partial failure: {0}")]
    PartialBatchFailure(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ProtocolError {
    /// Failures a person sees as "invalid or expired code".
    pub fn is_invalid_code(&self) -> bool {
        matches!(self, ProtocolError::NotFound(_) | ProtocolError::Expired(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::TransientStoreFailure(_))
    }
}

impl From<StoreError> for ProtocolError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(p) => ProtocolError::NotFound(p),
            StoreError::PermissionDenied(m) => ProtocolError::PermissionDenied(m),
            StoreError::InvalidInput(m) => ProtocolError::InvalidInput(m),
            StoreError::Serde(e) => ProtocolError::InvalidInput(format!("malformed document: {e}")),
            other @ (StoreError::Unavailable(_)
            | StoreError::Database(_)
            | StoreError::Pool(_)
            | StoreError::Task(_)
            | StoreError::Migration(_)) => ProtocolError::TransientStoreFailure(other.to_string()),
        }
    }
}

/// Source of "now" for timestamps and expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        fbop_shared::domain::now_utc()
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(at.trunc_subsecs(3))),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at.trunc_subsecs(3);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Every protocol component wired to one store and clock.
#[derive(Clone)]
pub struct Protocols {
    pub families: Families,
    pub ledger: Ledger,
    pub invites: Invites,
    pub lookups: ChildLookups,
    pub devices: DeviceRegistry,
}

impl Protocols {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self {
            families: Families::new(store.clone(), clock.clone()),
            ledger: Ledger::new(store.clone(), clock.clone()),
            invites: Invites::new(store.clone(), clock.clone()),
            lookups: ChildLookups::new(store.clone(), clock.clone()),
            devices: DeviceRegistry::new(store, clock),
        }
    }
}

pub type Observed<T> = BoxStream<'static, Result<T, ProtocolError>>;

async fn load<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    path: &DocPath,
) -> Result<Option<T>, ProtocolError> {
    match store.get(path).await? {
        Some(doc) => Ok(Some(doc.decode()?)),
        None => Ok(None),
    }
}

async fn load_all<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    query: &Query,
) -> Result<Vec<T>, ProtocolError> {
    store
        .query(query)
        .await?
        .iter()
        .map(|d| d.decode().map_err(ProtocolError::from))
        .collect()
}

/// Typed live query; each item is the full decoded result set.
fn observe<T>(store: &dyn DocumentStore, query: Query) -> Result<Observed<Vec<T>>, ProtocolError>
where
    T: DeserializeOwned + Send + 'static,
{
    let sub = store.subscribe(query)?;
    Ok(sub
        .map(|snapshot| -> Result<Vec<T>, ProtocolError> {
            snapshot?
                .iter()
                .map(|d| d.decode::<T>().map_err(ProtocolError::from))
                .collect()
        })
        .boxed())
}

/// Deletes `paths` in as many batches as the per-batch limit requires.
async fn delete_in_batches(
    store: &dyn DocumentStore,
    paths: Vec<DocPath>,
) -> Result<usize, ProtocolError> {
    let total = paths.len();
    for chunk in paths.chunks(MAX_BATCH_OPS) {
        let mut batch = WriteBatch::new();
        for path in chunk {
            batch.delete(path.clone());
        }
        store.commit(batch).await?;
    }
    Ok(total)
}

fn require_name(name: &str, what: &str) -> Result<String, ProtocolError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::InvalidInput(format!("{what} name is required")));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(t0);
        clock.advance(Duration::hours(23));
        assert_eq!(clock.now(), t0 + Duration::hours(23));
        clock.set(t0);
        assert_eq!(clock.now(), t0);
    }

    #[test]
    fn store_errors_map_into_taxonomy() {
        let e: ProtocolError = StoreError::Unavailable("offline".into()).into();
        assert!(e.is_retryable());
        let e: ProtocolError = StoreError::PermissionDenied("rules".into()).into();
        assert!(matches!(e, ProtocolError::PermissionDenied(_)));
        assert!(ProtocolError::Expired("x".into()).is_invalid_code());
        assert!(ProtocolError::NotFound("x".into()).is_invalid_code());
        assert!(!ProtocolError::Unauthenticated.is_invalid_code());
    }
}
