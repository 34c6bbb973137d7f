use fbop_shared::domain::{Family, FamilyId, InviteCode, Membership, PrincipalId};
use futures::StreamExt;
use tracing::{error, info};

use super::paths::{self, fields};
use super::{
    Observed, ProtocolError, SharedClock, delete_in_batches, load, load_all, observe, require_name,
};
use crate::store::{DocPath, Direction, Query, SharedStore, WriteBatch, encode};

/// Families and their parent memberships.
#[derive(Clone)]
pub struct Families {
    store: SharedStore,
    clock: SharedClock,
}

impl Families {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Writes the family and the owner's membership in one batch.
    pub async fn create_family(
        &self,
        name: &str,
        owner: &PrincipalId,
        email: &str,
    ) -> Result<Family, ProtocolError> {
        let name = require_name(name, "family")?;
        let now = self.clock.now();
        let family = Family {
            id: FamilyId::from(uuid::Uuid::new_v4().to_string()),
            name,
            owner_principal_id: owner.clone(),
            created_at: now,
        };
        let owner_membership = Membership {
            principal_id: owner.clone(),
            email: email.to_string(),
            joined_at: now,
            originating_invite_code: None,
        };
        let mut batch = WriteBatch::new();
        batch
            .set(paths::family(&family.id)?, encode(&family)?)
            .set(
                paths::parent(&family.id, owner)?,
                encode(&owner_membership)?,
            );
        self.store.commit(batch).await?;
        info!(family_id = %family.id, owner = %owner, "family created");
        Ok(family)
    }

    pub async fn get_family(&self, family_id: &FamilyId) -> Result<Family, ProtocolError> {
        load(self.store.as_ref(), &paths::family(family_id)?)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("family {family_id}")))
    }

    pub async fn rename_family(&self, family_id: &FamilyId, name: &str) -> Result<(), ProtocolError> {
        let name = require_name(name, "family")?;
        let mut data = crate::store::Data::new();
        data.insert(fields::NAME.into(), name.into());
        self.store.update(&paths::family(family_id)?, data).await?;
        Ok(())
    }

    /// Current family document, then again after every change; `None` once deleted.
    pub fn observe_family(
        &self,
        family_id: &FamilyId,
    ) -> Result<Observed<Option<Family>>, ProtocolError> {
        let query = Query::document(paths::family(family_id)?);
        Ok(observe::<Family>(self.store.as_ref(), query)?
            .map(|snap| snap.map(|v| v.into_iter().next()))
            .boxed())
    }

    fn parents_query(&self, family_id: &FamilyId) -> Result<Query, ProtocolError> {
        Ok(Query::collection(paths::parents(family_id)?).order_by(fields::JOINED_AT, Direction::Asc))
    }

    pub async fn list_parents(&self, family_id: &FamilyId) -> Result<Vec<Membership>, ProtocolError> {
        load_all(self.store.as_ref(), &self.parents_query(family_id)?).await
    }

    pub fn observe_parents(
        &self,
        family_id: &FamilyId,
    ) -> Result<Observed<Vec<Membership>>, ProtocolError> {
        observe(self.store.as_ref(), self.parents_query(family_id)?)
    }

    pub async fn membership(
        &self,
        family_id: &FamilyId,
        principal: &PrincipalId,
    ) -> Result<Option<Membership>, ProtocolError> {
        load(self.store.as_ref(), &paths::parent(family_id, principal)?).await
    }

    pub async fn is_member(
        &self,
        family_id: &FamilyId,
        principal: &PrincipalId,
    ) -> Result<bool, ProtocolError> {
        Ok(self.membership(family_id, principal).await?.is_some())
    }

    pub async fn is_owner(
        &self,
        family_id: &FamilyId,
        principal: &PrincipalId,
    ) -> Result<bool, ProtocolError> {
        let family: Option<Family> = load(self.store.as_ref(), &paths::family(family_id)?).await?;
        Ok(family.is_some_and(|f| &f.owner_principal_id == principal))
    }

    /// Only the owner may remove parents, and the owner's own membership
    /// goes only with the family.
    pub async fn remove_parent(
        &self,
        family_id: &FamilyId,
        requester: &PrincipalId,
        target: &PrincipalId,
    ) -> Result<(), ProtocolError> {
        let family = self.get_family(family_id).await?;
        if &family.owner_principal_id != requester {
            return Err(ProtocolError::PermissionDenied(
                "only the family owner can remove parents".into(),
            ));
        }
        if &family.owner_principal_id == target {
            return Err(ProtocolError::PermissionDenied(
                "the owner's membership cannot be removed".into(),
            ));
        }
        self.store.delete(&paths::parent(family_id, target)?).await?;
        info!(family_id = %family_id, principal = %target, "parent removed");
        Ok(())
    }

    /// Family the principal already belongs to, if any.
    pub async fn find_existing_family(
        &self,
        principal: &PrincipalId,
    ) -> Result<Option<FamilyId>, ProtocolError> {
        let query = Query::collection_group(paths::PARENTS)
            .where_eq(fields::PRINCIPAL_ID, principal.as_str())
            .limit(1);
        let docs = self.store.query(&query).await?;
        Ok(docs.first().and_then(|d| paths::family_of(&d.path)))
    }

    /// Owner-only cascading delete. Children (with their transactions and
    /// devices), other parents and invites go first; the owner's membership
    /// and then the family document go last, so a stopped run can be retried.
    pub async fn delete_family(
        &self,
        family_id: &FamilyId,
        requester: &PrincipalId,
    ) -> Result<(), ProtocolError> {
        let family = self.get_family(family_id).await?;
        if &family.owner_principal_id != requester {
            return Err(ProtocolError::PermissionDenied(
                "only the family owner can delete the family".into(),
            ));
        }
        let mut progressed = false;
        let result = self.cascade_delete(&family, &mut progressed).await;
        match result {
            Ok(deleted) => {
                info!(family_id = %family_id, documents = deleted, "family deleted");
                Ok(())
            }
            Err(e) if progressed => {
                error!(family_id = %family_id, error = %e, "family deletion stopped part way");
                Err(ProtocolError::PartialBatchFailure(format!(
                    "family {family_id} partially deleted: {e}"
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn cascade_delete(
        &self,
        family: &Family,
        progressed: &mut bool,
    ) -> Result<usize, ProtocolError> {
        let store = self.store.as_ref();
        let f = &family.id;
        let mut deleted = 0;

        let children = store
            .query(&Query::collection(paths::children(f)?))
            .await?;
        for child in children {
            for sub in [paths::TRANSACTIONS, paths::DEVICES] {
                let coll = format!("{}/{sub}", child.path);
                let docs = store.query(&Query::collection(coll)).await?;
                deleted += delete_in_batches(store, docs.into_iter().map(|d| d.path).collect()).await?;
                *progressed |= deleted > 0;
            }
            store.delete(&child.path).await?;
            deleted += 1;
            *progressed = true;
        }

        let owner_path = paths::parent(f, &family.owner_principal_id)?;
        let others: Vec<DocPath> = store
            .query(&Query::collection(paths::parents(f)?))
            .await?
            .into_iter()
            .map(|d| d.path)
            .filter(|p| p != &owner_path)
            .collect();
        deleted += delete_in_batches(store, others).await?;
        *progressed |= deleted > 0;

        // Audit copies are keyed by code; their top-level lookup copies go
        // too unless the code has since been taken by another family.
        let mut invites = Vec::new();
        for doc in store
            .query(&Query::collection(paths::family_invites(f)?))
            .await?
        {
            let code_path = paths::invite_code(doc.path.document_id())?;
            let lookup: Option<InviteCode> = load(store, &code_path).await?;
            if lookup.is_some_and(|l| &l.family_id == f) {
                invites.push(code_path);
            }
            invites.push(doc.path);
        }
        deleted += delete_in_batches(store, invites).await?;
        *progressed |= deleted > 0;

        store.delete(&owner_path).await?;
        *progressed = true;
        store.delete(&paths::family(f)?).await?;
        Ok(deleted + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ManualClock, Protocols};
    use crate::store::{DocumentStore, InjectedFailure, MemoryStore};
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (MemoryStore, Protocols) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let protocols = Protocols::new(Arc::new(store.clone()), Arc::new(clock));
        (store, protocols)
    }

    #[tokio::test]
    async fn create_family_writes_owner_membership() {
        let (_store, p) = setup();
        let owner = PrincipalId::from("mom");
        let family = p
            .families
            .create_family("  Pig Family ", &owner, "mom@example.com")
            .await
            .unwrap();
        assert_eq!(family.name, "Pig Family");
        let parents = p.families.list_parents(&family.id).await.unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].principal_id, owner);
        assert!(p.families.is_owner(&family.id, &owner).await.unwrap());
        assert_eq!(
            p.families.find_existing_family(&owner).await.unwrap(),
            Some(family.id.clone())
        );
        assert_eq!(
            p.families
                .find_existing_family(&PrincipalId::from("stranger"))
                .await
                .unwrap(),
            None
        );
        assert!(matches!(
            p.families.create_family(" ", &owner, "").await,
            Err(ProtocolError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn rename_and_observe_family() {
        let (_store, p) = setup();
        let owner = PrincipalId::from("mom");
        let family = p.families.create_family("Pigs", &owner, "").await.unwrap();
        let mut watch = p.families.observe_family(&family.id).unwrap();
        let first = watch.next().await.unwrap().unwrap().unwrap();
        assert_eq!(first.name, "Pigs");
        p.families.rename_family(&family.id, "Hogs").await.unwrap();
        let second = watch.next().await.unwrap().unwrap().unwrap();
        assert_eq!(second.name, "Hogs");
        assert!(matches!(
            p.families
                .rename_family(&FamilyId::from("missing"), "x")
                .await,
            Err(ProtocolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn observe_parents_sees_joins() {
        let (_store, p) = setup();
        let family = p
            .families
            .create_family("Pigs", &PrincipalId::from("mom"), "")
            .await
            .unwrap();
        let mom = PrincipalId::from("mom");
        let dad = PrincipalId::from("dad");
        let mut watch = p.families.observe_parents(&family.id).unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap().len(), 1);
        let invite = p.invites.mint(&family.id, &mom).await.unwrap();
        p.invites
            .consume(&family.id, &invite.code, Some(&dad), "dad@example.com")
            .await
            .unwrap();
        let parents = watch.next().await.unwrap().unwrap();
        assert_eq!(parents.len(), 2);
        assert!(parents.iter().any(|m| m.principal_id == dad));
    }

    #[tokio::test]
    async fn owner_cannot_be_removed() {
        let (store, p) = setup();
        let owner = PrincipalId::from("mom");
        let dad = PrincipalId::from("dad");
        let family = p.families.create_family("Pigs", &owner, "").await.unwrap();
        let membership = Membership {
            principal_id: dad.clone(),
            email: String::new(),
            joined_at: Utc::now(),
            originating_invite_code: None,
        };
        store
            .set(&paths::parent(&family.id, &dad).unwrap(), encode(&membership).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            p.families.remove_parent(&family.id, &owner, &owner).await,
            Err(ProtocolError::PermissionDenied(_))
        ));
        assert!(matches!(
            p.families.remove_parent(&family.id, &dad, &owner).await,
            Err(ProtocolError::PermissionDenied(_))
        ));
        p.families.remove_parent(&family.id, &owner, &dad).await.unwrap();
        assert!(!p.families.is_member(&family.id, &dad).await.unwrap());
    }

    #[tokio::test]
    async fn delete_family_cascades_everything() {
        let (store, p) = setup();
        let owner = PrincipalId::from("mom");
        let family = p.families.create_family("Pigs", &owner, "").await.unwrap();
        let child = p.ledger.create_child(&family.id, "Ann").await.unwrap();
        p.ledger
            .create_transaction(
                &family.id,
                &child.id,
                500,
                "gift",
                NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            )
            .await
            .unwrap();
        p.invites.mint(&family.id, &owner).await.unwrap();
        let code = p.lookups.mint(&family.id, &child.id).await.unwrap();
        p.devices
            .register(
                &family.id,
                &child.id,
                Some(&PrincipalId::from("kid")),
                "Pixel 8",
                &code.lookup_code,
            )
            .await
            .unwrap();

        assert!(matches!(
            p.families
                .delete_family(&family.id, &PrincipalId::from("kid"))
                .await,
            Err(ProtocolError::PermissionDenied(_))
        ));
        p.families.delete_family(&family.id, &owner).await.unwrap();

        // Only the child lookup code remains; the sweeper owns it.
        let remaining = store
            .query(&Query::collection_group(paths::PARENTS))
            .await
            .unwrap();
        assert!(remaining.is_empty());
        assert_eq!(store.len(), 1);
        assert!(matches!(
            p.families.get_family(&family.id).await,
            Err(ProtocolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn interrupted_delete_reports_partial_failure() {
        let (store, p) = setup();
        let owner = PrincipalId::from("mom");
        let family = p.families.create_family("Pigs", &owner, "").await.unwrap();
        p.ledger.create_child(&family.id, "Ann").await.unwrap();
        p.invites.mint(&family.id, &owner).await.unwrap();
        store.inject_write_failure(paths::INVITES, InjectedFailure::Unavailable);

        let err = p.families.delete_family(&family.id, &owner).await.unwrap_err();
        assert!(matches!(err, ProtocolError::PartialBatchFailure(_)));
        // Family and owner membership survive, so the delete can be retried.
        assert!(p.families.is_member(&family.id, &owner).await.unwrap());

        store.clear_failures();
        p.families.delete_family(&family.id, &owner).await.unwrap();
    }
}
