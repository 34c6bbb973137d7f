use chrono::Duration;
use fbop_shared::code::{generate_default_code, normalize_code};
use fbop_shared::domain::{FamilyId, Invite, InviteCode, Membership, PrincipalId, is_expired};
use tracing::{info, warn};

use super::paths;
use super::{ProtocolError, SharedClock, load};
use crate::store::{SharedStore, WriteBatch, encode};

pub const INVITE_TTL_HOURS: i64 = 24;

/// Single-use codes that grant a parent membership.
#[derive(Clone)]
pub struct Invites {
    store: SharedStore,
    clock: SharedClock,
}

impl Invites {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn mint(&self, family_id: &FamilyId, issuer: &PrincipalId) -> Result<Invite, ProtocolError> {
        self.mint_code(family_id, issuer, &generate_default_code()).await
    }

    /// Writes the family's audit copy and the top-level lookup copy in one
    /// batch. An existing holder of the same code is overwritten.
    pub async fn mint_code(
        &self,
        family_id: &FamilyId,
        issuer: &PrincipalId,
        code: &str,
    ) -> Result<Invite, ProtocolError> {
        let code = normalize_code(code);
        let expires_at = self.clock.now() + Duration::hours(INVITE_TTL_HOURS);
        let invite = Invite {
            code: code.clone(),
            family_id: family_id.clone(),
            issued_by_principal_id: issuer.clone(),
            expires_at,
        };
        let lookup = InviteCode {
            family_id: family_id.clone(),
            expires_at,
        };
        let mut batch = WriteBatch::new();
        batch
            .set(paths::family_invite(family_id, &code)?, encode(&invite)?)
            .set(paths::invite_code(&code)?, encode(&lookup)?);
        self.store.commit(batch).await?;
        info!(family_id = %family_id, issuer = %issuer, "invite minted");
        Ok(invite)
    }

    /// Family the code is bound to. Absent and expired codes are told apart
    /// here; callers facing a person should treat both the same.
    pub async fn lookup(&self, code: &str) -> Result<FamilyId, ProtocolError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(ProtocolError::NotFound("invite code".into()));
        }
        // A code that cannot even name a document was never issued.
        let path = paths::invite_code(&code)
            .map_err(|_| ProtocolError::NotFound(format!("invite {code}")))?;
        let record: InviteCode = load(self.store.as_ref(), &path)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("invite {code}")))?;
        if is_expired(record.expires_at, self.clock.now()) {
            return Err(ProtocolError::Expired(format!("invite {code}")));
        }
        Ok(record.family_id)
    }

    /// Adds `principal` as a parent of `family_id`, then removes the
    /// top-level code. The removal is best effort; the sweeper reclaims
    /// anything left behind.
    pub async fn consume(
        &self,
        family_id: &FamilyId,
        code: &str,
        principal: Option<&PrincipalId>,
        email: &str,
    ) -> Result<Membership, ProtocolError> {
        let principal = principal.ok_or(ProtocolError::Unauthenticated)?;
        let code = normalize_code(code);
        let bound = self.lookup(&code).await?;
        if &bound != family_id {
            return Err(ProtocolError::NotFound(format!("invite {code}")));
        }
        if self.store.get(&paths::family(family_id)?).await?.is_none() {
            return Err(ProtocolError::NotFound(format!("family {family_id}")));
        }
        let membership = Membership {
            principal_id: principal.clone(),
            email: email.to_string(),
            joined_at: self.clock.now(),
            originating_invite_code: Some(code.clone()),
        };
        self.store
            .set(&paths::parent(family_id, principal)?, encode(&membership)?)
            .await?;
        info!(family_id = %family_id, principal = %principal, "invite consumed");

        if let Err(e) = self.store.delete(&paths::invite_code(&code)?).await {
            warn!(family_id = %family_id, error = %e, "failed to delete consumed invite code");
        }
        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Clock, ManualClock, Protocols};
    use crate::store::{DocumentStore, InjectedFailure, MemoryStore};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (MemoryStore, ManualClock, Protocols) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let p = Protocols::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        (store, clock, p)
    }

    #[tokio::test]
    async fn lookup_succeeds_until_expiry() {
        let (_store, clock, p) = setup();
        let f1 = FamilyId::from("F1");
        let t0 = clock.now();
        p.invites
            .mint_code(&f1, &PrincipalId::from("mom"), "AB23XZ7K")
            .await
            .unwrap();

        clock.set(t0 + Duration::hours(23));
        assert_eq!(p.invites.lookup("AB23XZ7K").await.unwrap(), f1);
        assert_eq!(p.invites.lookup(" ab23xz7k ").await.unwrap(), f1);

        clock.set(t0 + Duration::hours(25));
        let err = p.invites.lookup("AB23XZ7K").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Expired(_)));
        assert!(err.is_invalid_code());
    }

    #[tokio::test]
    async fn mint_writes_both_copies_with_24h_expiry() {
        let (store, clock, p) = setup();
        let f = FamilyId::from("F1");
        let invite = p.invites.mint(&f, &PrincipalId::from("mom")).await.unwrap();
        assert_eq!(invite.code.len(), 8);
        assert_eq!(invite.expires_at, clock.now() + Duration::hours(24));

        let audit = store
            .get(&paths::family_invite(&f, &invite.code).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(audit.decode::<Invite>().unwrap(), invite);
        let top: InviteCode = store
            .get(&paths::invite_code(&invite.code).unwrap())
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(top.expires_at, invite.expires_at);
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let (store, _clock, p) = setup();
        let owner = PrincipalId::from("mom");
        let family = p.families.create_family("Pigs", &owner, "").await.unwrap();
        let invite = p.invites.mint(&family.id, &owner).await.unwrap();
        let dad = PrincipalId::from("dad");

        assert_eq!(p.invites.lookup(&invite.code).await.unwrap(), family.id);
        let membership = p
            .invites
            .consume(&family.id, &invite.code, Some(&dad), "dad@example.com")
            .await
            .unwrap();
        assert_eq!(membership.originating_invite_code.as_deref(), Some(invite.code.as_str()));
        assert!(p.families.is_member(&family.id, &dad).await.unwrap());

        assert!(matches!(
            p.invites.lookup(&invite.code).await,
            Err(ProtocolError::NotFound(_))
        ));
        // The audit copy stays until it expires.
        assert!(store
            .get(&paths::family_invite(&family.id, &invite.code).unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn consume_requires_principal_and_matching_family() {
        let (_store, _clock, p) = setup();
        let f = FamilyId::from("F1");
        let invite = p.invites.mint(&f, &PrincipalId::from("mom")).await.unwrap();
        assert!(matches!(
            p.invites.consume(&f, &invite.code, None, "").await,
            Err(ProtocolError::Unauthenticated)
        ));
        assert!(matches!(
            p.invites
                .consume(&FamilyId::from("F2"), &invite.code, Some(&PrincipalId::from("x")), "")
                .await,
            Err(ProtocolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_code_deletion_does_not_fail_consume() {
        let (store, _clock, p) = setup();
        let owner = PrincipalId::from("mom");
        let f = p.families.create_family("Pigs", &owner, "").await.unwrap().id;
        let invite = p.invites.mint(&f, &owner).await.unwrap();
        store.inject_write_failure(paths::INVITE_CODES, InjectedFailure::Unavailable);

        let dad = PrincipalId::from("dad");
        p.invites.consume(&f, &invite.code, Some(&dad), "").await.unwrap();
        assert!(p.families.is_member(&f, &dad).await.unwrap());
        // Left for the sweeper; a retry would grant membership again.
        assert_eq!(p.invites.lookup(&invite.code).await.unwrap(), f);
    }

    #[tokio::test]
    async fn invites_die_with_their_family() {
        let (store, _clock, p) = setup();
        let owner = PrincipalId::from("mom");
        let family = p.families.create_family("Pigs", &owner, "").await.unwrap();
        let invite = p.invites.mint(&family.id, &owner).await.unwrap();
        p.families.delete_family(&family.id, &owner).await.unwrap();

        assert!(store
            .get(&paths::invite_code(&invite.code).unwrap())
            .await
            .unwrap()
            .is_none());
        let dad = PrincipalId::from("dad");
        assert!(matches!(
            p.invites.consume(&family.id, &invite.code, Some(&dad), "").await,
            Err(ProtocolError::NotFound(_))
        ));
        assert_eq!(p.families.find_existing_family(&dad).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_code_for_a_deleted_family_is_refused() {
        let (_store, _clock, p) = setup();
        let f = FamilyId::from("gone");
        let invite = p.invites.mint(&f, &PrincipalId::from("mom")).await.unwrap();
        let dad = PrincipalId::from("dad");
        assert!(matches!(
            p.invites.consume(&f, &invite.code, Some(&dad), "").await,
            Err(ProtocolError::NotFound(_))
        ));
        assert!(!p.families.is_member(&f, &dad).await.unwrap());
    }

    #[tokio::test]
    async fn unaddressable_codes_are_not_found() {
        let (_store, _clock, p) = setup();
        let err = p.invites.lookup("AB/CD").await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotFound(_)));
        assert!(err.is_invalid_code());
    }
}
