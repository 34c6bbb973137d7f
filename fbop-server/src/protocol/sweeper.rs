use serde_json::Value;
use tracing::{debug, error, info};

use super::paths::{self, fields};
use super::{Clock, ProtocolError};
use crate::store::{DocumentStore, MAX_BATCH_OPS, Query, WriteBatch};

/// Documents removed by one sweep, per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub invite_codes: usize,
    pub child_lookups: usize,
    pub family_invites: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.invite_codes + self.child_lookups + self.family_invites
    }
}

/// Deletes up to `limit` expired documents from each code collection.
/// Every collection is committed on its own; a failed batch counts as
/// zero and the run only fails when no non-empty batch went through.
pub async fn sweep(
    store: &dyn DocumentStore,
    clock: &dyn Clock,
    limit: usize,
) -> Result<SweepReport, ProtocolError> {
    let limit = limit.clamp(1, MAX_BATCH_OPS);
    let cutoff = Value::from(clock.now().timestamp_millis());
    let targets = [
        ("invite codes", Query::collection(paths::INVITE_CODES)),
        ("child lookups", Query::collection(paths::CHILD_LOOKUP)),
        ("family invites", Query::collection_group(paths::INVITES)),
    ];

    let mut counts = [0usize; 3];
    let mut last_error = None;
    for (slot, (label, target)) in targets.into_iter().enumerate() {
        let query = target.where_lt(fields::EXPIRES_AT, cutoff.clone()).limit(limit);
        match sweep_one(store, &query).await {
            Ok(0) => {}
            Ok(n) => {
                counts[slot] = n;
                debug!(collection = label, deleted = n, "swept expired documents");
            }
            Err(e) => {
                error!(collection = label, error = %e, "sweep batch failed");
                last_error = Some(e);
            }
        }
    }

    let report = SweepReport {
        invite_codes: counts[0],
        child_lookups: counts[1],
        family_invites: counts[2],
    };
    if let Some(e) = last_error
        && report.total() == 0
    {
        return Err(e);
    }
    if report.total() > 0 {
        info!("deleted {} expired code(s)", report.total());
    } else {
        debug!("no expired codes to clean up");
    }
    Ok(report)
}

async fn sweep_one(store: &dyn DocumentStore, query: &Query) -> Result<usize, ProtocolError> {
    let expired = store.query(query).await?;
    if expired.is_empty() {
        return Ok(0);
    }
    let mut batch = WriteBatch::new();
    for doc in &expired {
        batch.delete(doc.path.clone());
    }
    store.commit(batch).await?;
    Ok(expired.len())
}
