use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Provider;
use crate::domain;

pub mod endpoints;
#[cfg(feature = "rest-client")]
pub mod rest;

pub const API_V1_PREFIX: &str = "/api/v1";

/// `/api/v1/families/{family_id}`
pub fn family_scope(family_id: &str) -> String {
    format!(
        "{}/families/{}",
        API_V1_PREFIX,
        percent_encoding::utf8_percent_encode(family_id, percent_encoding::NON_ALPHANUMERIC)
    )
}

// Auth
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthReq {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResp {
    pub token: String,
    pub principal_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeResp {
    pub principal_id: String,
    pub email: Option<String>,
    pub provider: Provider,
}

// Families
#[derive(Debug, Serialize, Deserialize)]
pub struct NameReq {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyDto {
    pub id: String,
    pub name: String,
    pub owner_principal_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<domain::Family> for FamilyDto {
    fn from(f: domain::Family) -> Self {
        Self {
            id: f.id.0,
            name: f.name,
            owner_principal_id: f.owner_principal_id.0,
            created_at: f.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MyFamilyResp {
    pub family_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentDto {
    pub principal_id: String,
    pub email: String,
    pub joined_at: DateTime<Utc>,
    pub originating_invite_code: Option<String>,
    pub is_owner: bool,
}

// Invites
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteDto {
    pub code: String,
    pub family_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InviteLookupResp {
    pub family_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinFamilyReq {
    pub code: String,
}

// Children
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildDto {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub balance_minor_units: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildDetailDto {
    pub child: ChildDto,
    pub transactions: Vec<TransactionDto>,
}

impl From<domain::ChildWithBalance> for ChildDetailDto {
    fn from(c: domain::ChildWithBalance) -> Self {
        Self {
            child: ChildDto {
                id: c.child.id.0,
                name: c.child.name,
                created_at: c.child.created_at,
                balance_minor_units: c.balance_minor_units,
            },
            transactions: c.transactions.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupCodeDto {
    pub code: String,
    pub family_id: String,
    pub child_id: String,
    pub expires_at: DateTime<Utc>,
}

impl From<domain::ChildLookup> for LookupCodeDto {
    fn from(l: domain::ChildLookup) -> Self {
        Self {
            code: l.lookup_code,
            family_id: l.family_id.0,
            child_id: l.child_id.0,
            expires_at: l.expires_at,
        }
    }
}

// Transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDto {
    pub id: String,
    pub amount_minor_units: i64,
    pub description: String,
    pub effective_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl From<domain::Transaction> for TransactionDto {
    fn from(t: domain::Transaction) -> Self {
        Self {
            id: t.id.0,
            amount_minor_units: t.amount_minor_units,
            description: t.description,
            effective_date: t.effective_date,
            created_at: t.created_at,
            modified_at: t.modified_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionReq {
    pub amount_minor_units: i64,
    #[serde(default)]
    pub description: String,
    /// Defaults to today (UTC) when absent.
    #[serde(default)]
    pub effective_date: Option<NaiveDate>,
}

// Devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDto {
    pub principal_id: String,
    pub device_name: String,
    pub lookup_code_used: String,
    pub registered_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl From<domain::DeviceAccess> for DeviceDto {
    fn from(d: domain::DeviceAccess) -> Self {
        Self {
            principal_id: d.principal_id.0,
            device_name: d.device_name,
            lookup_code_used: d.lookup_code_used,
            registered_at: d.registered_at,
            last_accessed_at: d.last_accessed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterDeviceReq {
    pub lookup_code: String,
    pub device_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessResp {
    pub has_access: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionInfoDto {
    pub version: String,
}

/// Payload of every server-sent event on the watch endpoints. Each event
/// carries the full current result set, never a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Family { family: Option<FamilyDto> },
    Transactions { items: Vec<TransactionDto> },
    Devices { items: Vec<DeviceDto> },
    /// `device` is `None` once access has been revoked.
    Access { device: Option<DeviceDto> },
}
