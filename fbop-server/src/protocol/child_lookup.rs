use chrono::Duration;
use fbop_shared::code::{generate_default_code, normalize_code};
use fbop_shared::domain::{ChildId, ChildLookup, FamilyId, is_expired};
use tracing::info;

use super::paths;
use super::{ProtocolError, SharedClock, load};
use crate::store::{SharedStore, encode};

pub const LOOKUP_TTL_HOURS: i64 = 1;

/// Short-lived, reusable codes that point a kid device at one child.
#[derive(Clone)]
pub struct ChildLookups {
    store: SharedStore,
    clock: SharedClock,
}

impl ChildLookups {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn mint(&self, family_id: &FamilyId, child_id: &ChildId) -> Result<ChildLookup, ProtocolError> {
        self.mint_code(family_id, child_id, &generate_default_code()).await
    }

    /// Earlier codes for the same child stay valid until they expire.
    pub async fn mint_code(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        code: &str,
    ) -> Result<ChildLookup, ProtocolError> {
        let record = ChildLookup {
            lookup_code: normalize_code(code),
            family_id: family_id.clone(),
            child_id: child_id.clone(),
            expires_at: self.clock.now() + Duration::hours(LOOKUP_TTL_HOURS),
        };
        self.store
            .set(&paths::child_lookup(&record.lookup_code)?, encode(&record)?)
            .await?;
        info!(family_id = %family_id, child_id = %child_id, "child lookup code minted");
        Ok(record)
    }

    /// Resolves a code without consuming it.
    pub async fn lookup(&self, code: &str) -> Result<ChildLookup, ProtocolError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(ProtocolError::NotFound("lookup code".into()));
        }
        let path = paths::child_lookup(&code)
            .map_err(|_| ProtocolError::NotFound(format!("lookup code {code}")))?;
        let record: ChildLookup = load(self.store.as_ref(), &path)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("lookup code {code}")))?;
        if is_expired(record.expires_at, self.clock.now()) {
            return Err(ProtocolError::Expired(format!("lookup code {code}")));
        }
        Ok(record)
    }
}
