//! Document layout:
//!
//! ```text
//! families/{familyId}
//! families/{familyId}/parents/{principalId}
//! families/{familyId}/children/{childId}
//! families/{familyId}/children/{childId}/transactions/{txId}
//! families/{familyId}/children/{childId}/devices/{principalId}
//! families/{familyId}/invites/{code}
//! inviteCodes/{code}
//! childLookup/{code}
//! sessions/{jti}
//! ```

use fbop_shared::domain::{ChildId, FamilyId, PrincipalId, TransactionId};

use crate::store::{DocPath, StoreError};

pub const FAMILIES: &str = "families";
pub const PARENTS: &str = "parents";
pub const CHILDREN: &str = "children";
pub const TRANSACTIONS: &str = "transactions";
pub const DEVICES: &str = "devices";
pub const INVITES: &str = "invites";
pub const INVITE_CODES: &str = "inviteCodes";
pub const CHILD_LOOKUP: &str = "childLookup";
pub const SESSIONS: &str = "sessions";

/// Document field names used in queries.
pub mod fields {
    pub const EXPIRES_AT: &str = "expiresAt";
    pub const PRINCIPAL_ID: &str = "principalId";
    pub const JOINED_AT: &str = "joinedAt";
    pub const CREATED_AT: &str = "createdAt";
    pub const EFFECTIVE_DATE: &str = "effectiveDate";
    pub const REGISTERED_AT: &str = "registeredAt";
    pub const LAST_ACCESSED_AT: &str = "lastAccessedAt";
    pub const LAST_USED_AT: &str = "lastUsedAt";
    pub const NAME: &str = "name";
}

pub fn family(f: &FamilyId) -> Result<DocPath, StoreError> {
    DocPath::root(FAMILIES, f.as_str())
}

pub fn parents(f: &FamilyId) -> Result<String, StoreError> {
    Ok(format!("{}/{PARENTS}", family(f)?))
}

pub fn parent(f: &FamilyId, p: &PrincipalId) -> Result<DocPath, StoreError> {
    family(f)?.child(PARENTS, p.as_str())
}

pub fn children(f: &FamilyId) -> Result<String, StoreError> {
    Ok(format!("{}/{CHILDREN}", family(f)?))
}

pub fn child(f: &FamilyId, c: &ChildId) -> Result<DocPath, StoreError> {
    family(f)?.child(CHILDREN, c.as_str())
}

pub fn transactions(f: &FamilyId, c: &ChildId) -> Result<String, StoreError> {
    Ok(format!("{}/{TRANSACTIONS}", child(f, c)?))
}

pub fn transaction(f: &FamilyId, c: &ChildId, t: &TransactionId) -> Result<DocPath, StoreError> {
    child(f, c)?.child(TRANSACTIONS, t.as_str())
}

pub fn devices(f: &FamilyId, c: &ChildId) -> Result<String, StoreError> {
    Ok(format!("{}/{DEVICES}", child(f, c)?))
}

pub fn device(f: &FamilyId, c: &ChildId, p: &PrincipalId) -> Result<DocPath, StoreError> {
    child(f, c)?.child(DEVICES, p.as_str())
}

pub fn family_invites(f: &FamilyId) -> Result<String, StoreError> {
    Ok(format!("{}/{INVITES}", family(f)?))
}

pub fn family_invite(f: &FamilyId, code: &str) -> Result<DocPath, StoreError> {
    family(f)?.child(INVITES, code)
}

pub fn invite_code(code: &str) -> Result<DocPath, StoreError> {
    DocPath::root(INVITE_CODES, code)
}

pub fn child_lookup(code: &str) -> Result<DocPath, StoreError> {
    DocPath::root(CHILD_LOOKUP, code)
}

pub fn session(jti: &str) -> Result<DocPath, StoreError> {
    DocPath::root(SESSIONS, jti)
}

/// Family owning a document somewhere below `families/{id}`.
pub fn family_of(path: &DocPath) -> Option<FamilyId> {
    let mut segs = path.as_str().split('/');
    match (segs.next(), segs.next()) {
        (Some(FAMILIES), Some(id)) => Some(FamilyId::from(id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_paths() {
        let f = FamilyId::from("F1");
        let c = ChildId::from("C1");
        let d = PrincipalId::from("D1");
        assert_eq!(
            device(&f, &c, &d).unwrap().as_str(),
            "families/F1/children/C1/devices/D1"
        );
        assert_eq!(transactions(&f, &c).unwrap(), "families/F1/children/C1/transactions");
        assert_eq!(invite_code("AB23XZ7K").unwrap().as_str(), "inviteCodes/AB23XZ7K");
        assert!(child_lookup("").is_err());
    }

    #[test]
    fn family_of_parent_membership() {
        let p = parent(&FamilyId::from("F9"), &PrincipalId::from("u1")).unwrap();
        assert_eq!(family_of(&p), Some(FamilyId::from("F9")));
        assert_eq!(family_of(&invite_code("X").unwrap()), None);
    }
}
