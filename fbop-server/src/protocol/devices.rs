use fbop_shared::domain::{ChildId, DeviceAccess, FamilyId, PrincipalId};
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use super::paths::{self, fields};
use super::{ChildLookups, Observed, ProtocolError, SharedClock, load, load_all, observe};
use crate::store::{Data, Direction, Query, SharedStore, encode};

/// What a kid device sees when it watches its own grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessState {
    Granted(DeviceAccess),
    /// The grant is gone; the device has to pair again.
    Revoked,
}

/// Device grants under `families/{f}/children/{c}/devices/{principal}`.
#[derive(Clone)]
pub struct DeviceRegistry {
    store: SharedStore,
    clock: SharedClock,
    lookups: ChildLookups,
}

impl DeviceRegistry {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        let lookups = ChildLookups::new(store.clone(), clock.clone());
        Self { store, clock, lookups }
    }

    /// Upserts the caller's grant after checking that `lookup_code` still
    /// points at this child. Registering again just refreshes the entry.
    pub async fn register(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        principal: Option<&PrincipalId>,
        device_name: &str,
        lookup_code: &str,
    ) -> Result<DeviceAccess, ProtocolError> {
        let principal = principal.ok_or(ProtocolError::Unauthenticated)?;
        let lookup = self.lookups.lookup(lookup_code).await?;
        if &lookup.family_id != family_id || &lookup.child_id != child_id {
            return Err(ProtocolError::PermissionDenied(
                "lookup code belongs to a different child".into(),
            ));
        }
        let now = self.clock.now();
        let access = DeviceAccess {
            principal_id: principal.clone(),
            device_name: device_name.trim().to_string(),
            lookup_code_used: lookup.lookup_code,
            registered_at: now,
            last_accessed_at: now,
        };
        self.store
            .set(&paths::device(family_id, child_id, principal)?, encode(&access)?)
            .await?;
        info!(
            family_id = %family_id,
            child_id = %child_id,
            principal = %principal,
            device = %access.device_name,
            "device registered"
        );
        Ok(access)
    }

    /// `false` without a signed-in principal; never an error for a missing grant.
    pub async fn check_access(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        principal: Option<&PrincipalId>,
    ) -> Result<bool, ProtocolError> {
        let Some(principal) = principal else {
            return Ok(false);
        };
        Ok(self
            .store
            .get(&paths::device(family_id, child_id, principal)?)
            .await?
            .is_some())
    }

    /// Refreshes `lastAccessedAt`. Failures are logged and swallowed.
    pub async fn touch(&self, family_id: &FamilyId, child_id: &ChildId, principal: Option<&PrincipalId>) {
        let Some(principal) = principal else {
            warn!(family_id = %family_id, child_id = %child_id, "touch skipped: not signed in");
            return;
        };
        let path = match paths::device(family_id, child_id, principal) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "touch skipped");
                return;
            }
        };
        let mut data = Data::new();
        data.insert(
            fields::LAST_ACCESSED_AT.into(),
            Value::from(self.clock.now().timestamp_millis()),
        );
        if let Err(e) = self.store.update(&path, data).await {
            warn!(
                family_id = %family_id,
                child_id = %child_id,
                principal = %principal,
                error = %e,
                "failed to update last access time"
            );
        }
    }

    pub async fn get(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        principal: &PrincipalId,
    ) -> Result<Option<DeviceAccess>, ProtocolError> {
        load(self.store.as_ref(), &paths::device(family_id, child_id, principal)?).await
    }

    fn devices_query(&self, family_id: &FamilyId, child_id: &ChildId) -> Result<Query, ProtocolError> {
        Ok(Query::collection(paths::devices(family_id, child_id)?)
            .order_by(fields::REGISTERED_AT, Direction::Desc))
    }

    /// Most recently registered first.
    pub async fn list(&self, family_id: &FamilyId, child_id: &ChildId) -> Result<Vec<DeviceAccess>, ProtocolError> {
        load_all(self.store.as_ref(), &self.devices_query(family_id, child_id)?).await
    }

    pub fn observe_devices(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
    ) -> Result<Observed<Vec<DeviceAccess>>, ProtocolError> {
        observe(self.store.as_ref(), self.devices_query(family_id, child_id)?)
    }

    pub async fn revoke(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        principal: &PrincipalId,
    ) -> Result<(), ProtocolError> {
        self.store
            .delete(&paths::device(family_id, child_id, principal)?)
            .await?;
        info!(family_id = %family_id, child_id = %child_id, principal = %principal, "device revoked");
        Ok(())
    }

    /// Live view of one device's own grant.
    pub fn watch_access(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        principal: &PrincipalId,
    ) -> Result<Observed<AccessState>, ProtocolError> {
        let query = Query::document(paths::device(family_id, child_id, principal)?);
        Ok(observe::<DeviceAccess>(self.store.as_ref(), query)?
            .map(|snap| {
                snap.map(|docs| match docs.into_iter().next() {
                    Some(access) => AccessState::Granted(access),
                    None => AccessState::Revoked,
                })
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Clock, ManualClock, Protocols};
    use crate::store::{InjectedFailure, MemoryStore};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (MemoryStore, ManualClock, Protocols) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let p = Protocols::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        (store, clock, p)
    }

    fn ids() -> (FamilyId, ChildId, PrincipalId) {
        ("F1".into(), "C1".into(), "D1".into())
    }

    #[tokio::test]
    async fn pair_check_and_revoke() {
        let (_store, _clock, p) = setup();
        let (f, c, d) = ids();
        p.lookups.mint_code(&f, &c, "QZ4K8MNP").await.unwrap();

        let found = p.lookups.lookup("QZ4K8MNP").await.unwrap();
        assert_eq!((&found.family_id, &found.child_id), (&f, &c));
        p.devices
            .register(&f, &c, Some(&d), "Pixel 8", "QZ4K8MNP")
            .await
            .unwrap();
        assert!(p.devices.check_access(&f, &c, Some(&d)).await.unwrap());

        p.devices.revoke(&f, &c, &d).await.unwrap();
        assert!(!p.devices.check_access(&f, &c, Some(&d)).await.unwrap());
        assert!(!p.devices.check_access(&f, &c, None).await.unwrap());
    }

    #[tokio::test]
    async fn re_registering_overwrites_without_duplicates() {
        let (_store, clock, p) = setup();
        let (f, c, d) = ids();
        p.lookups.mint_code(&f, &c, "QZ4K8MNP").await.unwrap();
        p.devices.register(&f, &c, Some(&d), "Pixel 8", "QZ4K8MNP").await.unwrap();
        clock.advance(Duration::minutes(10));
        let second = p
            .devices
            .register(&f, &c, Some(&d), "Pixel 9", "QZ4K8MNP")
            .await
            .unwrap();

        let list = p.devices.list(&f, &c).await.unwrap();
        assert_eq!(list, vec![second.clone()]);
        assert_eq!(second.device_name, "Pixel 9");
        assert_eq!(second.registered_at, second.last_accessed_at);
    }

    #[tokio::test]
    async fn register_rejects_bad_codes() {
        let (_store, clock, p) = setup();
        let (f, c, d) = ids();
        p.lookups.mint_code(&f, &c, "QZ4K8MNP").await.unwrap();
        assert!(matches!(
            p.devices.register(&f, &c, None, "x", "QZ4K8MNP").await,
            Err(ProtocolError::Unauthenticated)
        ));
        assert!(matches!(
            p.devices.register(&f, &"C2".into(), Some(&d), "x", "QZ4K8MNP").await,
            Err(ProtocolError::PermissionDenied(_))
        ));
        clock.advance(Duration::hours(2));
        assert!(matches!(
            p.devices.register(&f, &c, Some(&d), "x", "QZ4K8MNP").await,
            Err(ProtocolError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_touch_is_quiet() {
        let (store, clock, p) = setup();
        let (f, c, _) = ids();
        p.lookups.mint_code(&f, &c, "QZ4K8MNP").await.unwrap();
        p.devices.register(&f, &c, Some(&"old".into()), "A", "QZ4K8MNP").await.unwrap();
        clock.advance(Duration::minutes(1));
        p.devices.register(&f, &c, Some(&"new".into()), "B", "QZ4K8MNP").await.unwrap();
        let names: Vec<_> = p
            .devices
            .list(&f, &c)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.device_name)
            .collect();
        assert_eq!(names, vec!["B", "A"]);

        clock.advance(Duration::minutes(5));
        let old = PrincipalId::from("old");
        p.devices.touch(&f, &c, Some(&old)).await;
        let touched = p.devices.get(&f, &c, &old).await.unwrap().unwrap();
        assert_eq!(touched.last_accessed_at, clock.now());
        assert!(touched.registered_at < touched.last_accessed_at);

        // None of these may fail the caller.
        p.devices.touch(&f, &c, None).await;
        p.devices.touch(&f, &c, Some(&"ghost".into())).await;
        store.inject_write_failure(paths::DEVICES, InjectedFailure::Unavailable);
        p.devices.touch(&f, &c, Some(&old)).await;
    }

    #[tokio::test]
    async fn watch_reports_revocation() {
        let (_store, _clock, p) = setup();
        let (f, c, d) = ids();
        p.lookups.mint_code(&f, &c, "QZ4K8MNP").await.unwrap();
        let mut watch = p.devices.watch_access(&f, &c, &d).unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap(), AccessState::Revoked);

        p.devices.register(&f, &c, Some(&d), "Pixel 8", "QZ4K8MNP").await.unwrap();
        assert!(matches!(
            watch.next().await.unwrap().unwrap(),
            AccessState::Granted(a) if a.device_name == "Pixel 8"
        ));

        p.devices.revoke(&f, &c, &d).await.unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap(), AccessState::Revoked);
    }
}
