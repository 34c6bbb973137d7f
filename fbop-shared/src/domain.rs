use std::fmt;
use std::str::FromStr;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(value)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(s.to_string()))
            }
        }
    };
}

string_id!(
    /// Top-level tenant grouping parents and children.
    FamilyId
);
string_id!(ChildId);
string_id!(TransactionId);
string_id!(
    /// Stable identifier of an authenticated identity.
    PrincipalId
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Family {
    pub id: FamilyId,
    pub name: String,
    pub owner_principal_id: PrincipalId,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// A principal's parent-role association with a family, keyed by principal id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub principal_id: PrincipalId,
    #[serde(default)]
    pub email: String,
    #[serde(with = "ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub originating_invite_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Child {
    pub id: ChildId,
    pub name: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// A deposit (non-negative amount) or withdrawal (negative amount).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub amount_minor_units: i64,
    #[serde(default)]
    pub description: String,
    pub effective_date: NaiveDate,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub modified_at: DateTime<Utc>,
}

/// Audit copy of an invite, nested under its family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub code: String,
    pub family_id: FamilyId,
    pub issued_by_principal_id: PrincipalId,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

/// Top-level lookup copy of an invite, keyed by the code itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteCode {
    pub family_id: FamilyId,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildLookup {
    pub lookup_code: String,
    pub family_id: FamilyId,
    pub child_id: ChildId,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

/// Durable grant letting one principal's device read one child's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAccess {
    pub principal_id: PrincipalId,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub lookup_code_used: String,
    #[serde(with = "ts_milliseconds")]
    pub registered_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildWithBalance {
    pub child: Child,
    pub balance_minor_units: i64,
    pub transactions: Vec<Transaction>,
}

impl ChildWithBalance {
    pub fn new(child: Child, transactions: Vec<Transaction>) -> Self {
        let balance_minor_units = balance_of(&transactions);
        Self {
            child,
            balance_minor_units,
            transactions,
        }
    }
}

/// Balance is never stored; it is always the sum of the child's transactions.
pub fn balance_of(transactions: &[Transaction]) -> i64 {
    transactions.iter().map(|t| t.amount_minor_units).sum()
}

/// `true` once `expires_at` lies strictly before `now`.
pub fn is_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at < now
}

/// Current time truncated to the millisecond precision documents persist.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
