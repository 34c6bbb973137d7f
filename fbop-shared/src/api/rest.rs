//! Minimal REST client helpers for consumers (device CLIs).

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::endpoints as ep;
use super::*;

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("http: {0}")]
    Http(String),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("serde: {0}")]
    Serde(String),
}

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .tcp_keepalive(Some(Duration::from_secs(180)))
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(180))
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Shared client for request/response calls. It carries a 60s timeout, so
/// event streams need a client of their own.
pub fn http_client() -> reqwest::Client {
    HTTP_CLIENT.clone()
}

async fn handle_json<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, RestError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(RestError::Status {
            status: status.as_u16(),
            body,
        });
    }
    res.json::<T>()
        .await
        .map_err(|e| RestError::Serde(e.to_string()))
}

async fn handle_empty(res: reqwest::Response) -> Result<(), RestError> {
    if res.status().is_success() {
        Ok(())
    } else {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Err(RestError::Status { status, body })
    }
}

async fn send(req: reqwest::RequestBuilder) -> Result<reqwest::Response, RestError> {
    req.send().await.map_err(|e| RestError::Http(e.to_string()))
}

async fn get_json<T: DeserializeOwned>(url: String, bearer: Option<&str>) -> Result<T, RestError> {
    let mut req = http_client().get(url);
    if let Some(b) = bearer {
        req = req.bearer_auth(b);
    }
    handle_json(send(req).await?).await
}

async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
    url: String,
    bearer: Option<&str>,
    body: Option<&B>,
) -> Result<T, RestError> {
    let mut req = http_client().post(url);
    if let Some(b) = bearer {
        req = req.bearer_auth(b);
    }
    if let Some(body) = body {
        req = req.json(body);
    }
    handle_json(send(req).await?).await
}

async fn patch_empty<B: Serialize + ?Sized>(
    url: String,
    bearer: &str,
    body: &B,
) -> Result<(), RestError> {
    let req = http_client().patch(url).bearer_auth(bearer).json(body);
    handle_empty(send(req).await?).await
}

async fn delete_empty(url: String, bearer: &str) -> Result<(), RestError> {
    let req = http_client().delete(url).bearer_auth(bearer);
    handle_empty(send(req).await?).await
}

pub async fn server_version(base: &str) -> Result<VersionInfoDto, RestError> {
    get_json(ep::version(base), None).await
}

// Auth

pub async fn sign_in_anonymous(base: &str) -> Result<AuthResp, RestError> {
    post_json::<(), _>(ep::auth_anonymous(base), None, None).await
}

pub async fn login(base: &str, req: &AuthReq) -> Result<AuthResp, RestError> {
    post_json(ep::auth_login(base), None, Some(req)).await
}

pub async fn logout(base: &str, bearer: &str) -> Result<(), RestError> {
    let req = http_client().post(ep::auth_logout(base)).bearer_auth(bearer);
    handle_empty(send(req).await?).await
}

pub async fn me(base: &str, bearer: &str) -> Result<MeResp, RestError> {
    get_json(ep::auth_me(base), Some(bearer)).await
}

// Code lookups (public)

pub async fn lookup_invite(base: &str, code: &str) -> Result<InviteLookupResp, RestError> {
    get_json(ep::invite_lookup(base, code), None).await
}

pub async fn lookup_child(base: &str, code: &str) -> Result<LookupCodeDto, RestError> {
    get_json(ep::child_lookup(base, code), None).await
}

// Families

pub async fn create_family(base: &str, bearer: &str, name: &str) -> Result<FamilyDto, RestError> {
    let body = NameReq {
        name: name.to_string(),
    };
    post_json(ep::families(base), Some(bearer), Some(&body)).await
}

pub async fn my_family(base: &str, bearer: &str) -> Result<MyFamilyResp, RestError> {
    get_json(ep::my_family(base), Some(bearer)).await
}

pub async fn get_family(base: &str, family_id: &str, bearer: &str) -> Result<FamilyDto, RestError> {
    get_json(ep::family(base, family_id), Some(bearer)).await
}

pub async fn rename_family(
    base: &str,
    family_id: &str,
    bearer: &str,
    name: &str,
) -> Result<(), RestError> {
    let body = NameReq {
        name: name.to_string(),
    };
    patch_empty(ep::family(base, family_id), bearer, &body).await
}

pub async fn delete_family(base: &str, family_id: &str, bearer: &str) -> Result<(), RestError> {
    delete_empty(ep::family(base, family_id), bearer).await
}

pub async fn list_parents(
    base: &str,
    family_id: &str,
    bearer: &str,
) -> Result<Vec<ParentDto>, RestError> {
    get_json(ep::parents(base, family_id), Some(bearer)).await
}

pub async fn remove_parent(
    base: &str,
    family_id: &str,
    principal_id: &str,
    bearer: &str,
) -> Result<(), RestError> {
    delete_empty(ep::parent(base, family_id, principal_id), bearer).await
}

// Invites

pub async fn create_invite(base: &str, family_id: &str, bearer: &str) -> Result<InviteDto, RestError> {
    post_json::<(), _>(ep::invites(base, family_id), Some(bearer), None).await
}

pub async fn join_family(
    base: &str,
    family_id: &str,
    code: &str,
    bearer: &str,
) -> Result<ParentDto, RestError> {
    let body = JoinFamilyReq {
        code: code.to_string(),
    };
    post_json(ep::join(base, family_id), Some(bearer), Some(&body)).await
}

// Children

pub async fn list_children(
    base: &str,
    family_id: &str,
    bearer: &str,
) -> Result<Vec<ChildDto>, RestError> {
    get_json(ep::children(base, family_id), Some(bearer)).await
}

pub async fn create_child(
    base: &str,
    family_id: &str,
    bearer: &str,
    name: &str,
) -> Result<ChildDto, RestError> {
    let body = NameReq {
        name: name.to_string(),
    };
    post_json(ep::children(base, family_id), Some(bearer), Some(&body)).await
}

pub async fn get_child(
    base: &str,
    family_id: &str,
    child_id: &str,
    bearer: &str,
) -> Result<ChildDetailDto, RestError> {
    get_json(ep::child(base, family_id, child_id), Some(bearer)).await
}

pub async fn rename_child(
    base: &str,
    family_id: &str,
    child_id: &str,
    bearer: &str,
    name: &str,
) -> Result<(), RestError> {
    let body = NameReq {
        name: name.to_string(),
    };
    patch_empty(ep::child(base, family_id, child_id), bearer, &body).await
}

pub async fn delete_child(
    base: &str,
    family_id: &str,
    child_id: &str,
    bearer: &str,
) -> Result<(), RestError> {
    delete_empty(ep::child(base, family_id, child_id), bearer).await
}

pub async fn mint_lookup_code(
    base: &str,
    family_id: &str,
    child_id: &str,
    bearer: &str,
) -> Result<LookupCodeDto, RestError> {
    post_json::<(), _>(
        ep::child_lookup_codes(base, family_id, child_id),
        Some(bearer),
        None,
    )
    .await
}

// Transactions

pub async fn create_transaction(
    base: &str,
    family_id: &str,
    child_id: &str,
    bearer: &str,
    req: &TransactionReq,
) -> Result<TransactionDto, RestError> {
    post_json(ep::transactions(base, family_id, child_id), Some(bearer), Some(req)).await
}

pub async fn update_transaction(
    base: &str,
    family_id: &str,
    child_id: &str,
    tx_id: &str,
    bearer: &str,
    req: &TransactionReq,
) -> Result<(), RestError> {
    patch_empty(ep::transaction(base, family_id, child_id, tx_id), bearer, req).await
}

pub async fn delete_transaction(
    base: &str,
    family_id: &str,
    child_id: &str,
    tx_id: &str,
    bearer: &str,
) -> Result<(), RestError> {
    delete_empty(ep::transaction(base, family_id, child_id, tx_id), bearer).await
}

// Devices

pub async fn list_devices(
    base: &str,
    family_id: &str,
    child_id: &str,
    bearer: &str,
) -> Result<Vec<DeviceDto>, RestError> {
    get_json(ep::devices(base, family_id, child_id), Some(bearer)).await
}

pub async fn register_device(
    base: &str,
    family_id: &str,
    child_id: &str,
    bearer: &str,
    req: &RegisterDeviceReq,
) -> Result<DeviceDto, RestError> {
    post_json(ep::devices(base, family_id, child_id), Some(bearer), Some(req)).await
}

pub async fn check_access(
    base: &str,
    family_id: &str,
    child_id: &str,
    principal_id: &str,
    bearer: &str,
) -> Result<AccessResp, RestError> {
    get_json(
        ep::device(base, family_id, child_id, principal_id),
        Some(bearer),
    )
    .await
}

pub async fn touch_device(
    base: &str,
    family_id: &str,
    child_id: &str,
    principal_id: &str,
    bearer: &str,
) -> Result<(), RestError> {
    let req = http_client()
        .post(ep::device_touch(base, family_id, child_id, principal_id))
        .bearer_auth(bearer);
    handle_empty(send(req).await?).await
}

pub async fn revoke_device(
    base: &str,
    family_id: &str,
    child_id: &str,
    principal_id: &str,
    bearer: &str,
) -> Result<(), RestError> {
    delete_empty(ep::device(base, family_id, child_id, principal_id), bearer).await
}
