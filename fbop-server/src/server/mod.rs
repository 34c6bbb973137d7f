mod acl;
pub mod auth;
mod config;
mod watch;

use crate::protocol::{Protocols, ProtocolError, SharedClock, sweep};
use crate::server::auth::AuthCtx;
use crate::store::{SharedStore, StoreError};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{Method, StatusCode, header},
    routing::{get, post},
};
use bcrypt::verify;
pub use config::{AppConfig, ConfigError, StoreKind, SweepConfig, UserConfig};
use fbop_shared::api;
use fbop_shared::auth::Provider;
use fbop_shared::domain::{ChildId, FamilyId, PrincipalId, TransactionId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

/// The only message a person sees for a bad invite or lookup code.
pub const INVALID_CODE: &str = "invalid or expired code";

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: SharedStore,
    pub clock: SharedClock,
    pub protocols: Protocols,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, store: SharedStore, clock: SharedClock) -> Self {
        let protocols = Protocols::new(store.clone(), clock.clone());
        Self {
            config,
            store,
            clock,
            protocols,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled on shutdown; ends open event streams and the sweeper loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    let private = Router::new()
        .route("/api/v1/auth/me", get(api_auth_me))
        .route("/api/v1/auth/logout", post(api_auth_logout))
        .route("/api/v1/families", post(api_create_family))
        .route("/api/v1/families/mine", get(api_my_family))
        .route(
            "/api/v1/families/{family_id}",
            get(api_get_family)
                .patch(api_rename_family)
                .delete(api_delete_family),
        )
        .route("/api/v1/families/{family_id}/watch", get(watch::family))
        .route("/api/v1/families/{family_id}/parents", get(api_list_parents))
        .route(
            "/api/v1/families/{family_id}/parents/{principal_id}",
            axum::routing::delete(api_remove_parent),
        )
        .route("/api/v1/families/{family_id}/invites", post(api_create_invite))
        .route("/api/v1/families/{family_id}/join", post(api_join_family))
        .route(
            "/api/v1/families/{family_id}/children",
            get(api_list_children).post(api_create_child),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}",
            get(api_get_child)
                .patch(api_rename_child)
                .delete(api_delete_child),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/lookup-codes",
            post(api_mint_lookup_code),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/transactions",
            get(api_list_transactions).post(api_create_transaction),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/transactions/watch",
            get(watch::transactions),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/transactions/{tx_id}",
            axum::routing::patch(api_update_transaction).delete(api_delete_transaction),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/devices",
            get(api_list_devices).post(api_register_device),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/devices/watch",
            get(watch::devices),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/devices/{principal_id}",
            get(api_check_access).delete(api_revoke_device),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/devices/{principal_id}/touch",
            post(api_touch_device),
        )
        .route(
            "/api/v1/families/{family_id}/children/{child_id}/devices/{principal_id}/watch",
            get(watch::device_access),
        )
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            acl::enforce_acl,
        ))
        .layer(middleware::from_fn(set_auth_span_fields))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
            principal = tracing::field::Empty,
            provider = tracing::field::Empty
        )
    });

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/version", get(api_version))
        .route("/api/v1/auth/anonymous", post(api_auth_anonymous))
        .route("/api/v1/auth/login", post(api_auth_login))
        .route("/api/v1/invites/{code}", get(api_invite_lookup))
        .route("/api/v1/child-lookup/{code}", get(api_child_lookup))
        .merge(private)
        .with_state(state.clone())
        .layer(trace)
        .layer(middleware::from_fn(add_security_headers))
        .layer(middleware::from_fn(add_request_id));

    // Optionally add CORS for dev if configured
    if let Some(origin) = &state.config.dev_cors_origin {
        let hv = header::HeaderValue::from_str(origin)
            .unwrap_or(header::HeaderValue::from_static("http://localhost:5173"));
        let cors = CorsLayer::new()
            .allow_origin(hv)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
        app.layer(cors)
    } else {
        app
    }
}

/// Runs the expiry sweep every `sweep.interval_hours` until shutdown.
pub fn spawn_sweeper(state: &AppState) -> JoinHandle<()> {
    let store = state.store.clone();
    let clock = state.clock.clone();
    let cfg = state.config.sweep.clone();
    let shutdown = state.shutdown_token();
    tokio::spawn(async move {
        let hours = cfg.interval_hours.clamp(1, config::MAX_SWEEP_INTERVAL_HOURS);
        let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = sweep(store.as_ref(), clock.as_ref(), cfg.batch_limit).await {
                tracing::error!(error = %e, "sweeper: run failed");
            }
        }
        tracing::debug!("sweeper: stopped");
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn api_version() -> Json<api::VersionInfoDto> {
    Json(api::VersionInfoDto {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(ReqId(rid.clone()));
    let mut resp = next.run(req).await;
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

async fn add_security_headers(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let path = req.uri().path().to_string();
    let mut resp = next.run(req).await;

    let headers = resp.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("same-origin"),
    );
    // HSTS is only honored on HTTPS; harmless otherwise
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    // Balances and codes must never be cached
    if path == "/healthz" || path.starts_with("/api/") {
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        );
        headers.insert(
            HeaderName::from_static("pragma"),
            HeaderValue::from_static("no-cache"),
        );
    }

    Ok(resp)
}

async fn set_auth_span_fields(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    if let Some(auth) = req.extensions().get::<AuthCtx>() {
        let span = Span::current();
        span.record("principal", tracing::field::display(&auth.claims.sub));
        span.record("provider", tracing::field::debug(&auth.claims.provider));
    }
    Ok(next.run(req).await)
}

// Path parameters
#[derive(Deserialize)]
struct FamilyPath {
    family_id: FamilyId,
}

#[derive(Deserialize)]
struct ParentPath {
    family_id: FamilyId,
    principal_id: PrincipalId,
}

#[derive(Deserialize)]
struct ChildPath {
    family_id: FamilyId,
    child_id: ChildId,
}

#[derive(Deserialize)]
struct TransactionPath {
    family_id: FamilyId,
    child_id: ChildId,
    tx_id: TransactionId,
}

#[derive(Deserialize)]
struct DevicePath {
    family_id: FamilyId,
    child_id: ChildId,
    principal_id: PrincipalId,
}

// Auth

async fn api_auth_anonymous(
    State(state): State<AppState>,
) -> Result<Json<api::AuthResp>, AppError> {
    let principal = PrincipalId::from(format!("anon:{}", Uuid::new_v4()));
    let token = auth::issue_jwt(&state, &principal, Provider::Anonymous, None).await?;
    tracing::info!(principal = %principal, "anonymous sign-in");
    Ok(Json(api::AuthResp {
        token,
        principal_id: principal.0,
        email: None,
    }))
}

async fn api_auth_login(
    State(state): State<AppState>,
    Json(body): Json<api::AuthReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    let user = state
        .config
        .users
        .iter()
        .find(|u| u.username == body.username)
        .ok_or_else(|| {
            tracing::warn!(username=%body.username, "login: unknown username");
            AppError::unauthorized()
        })?;
    if !verify(&body.password, &user.password_hash).map_err(|e| {
        tracing::error!(username=%body.username, error=%e, "login: bcrypt verify failed");
        AppError::internal(e)
    })? {
        tracing::warn!(username=%body.username, "login: invalid password");
        return Err(AppError::unauthorized());
    }
    let principal = PrincipalId::from(format!("user:{}", user.username));
    let token =
        auth::issue_jwt(&state, &principal, Provider::Federated, user.email.clone()).await?;
    Ok(Json(api::AuthResp {
        token,
        principal_id: principal.0,
        email: user.email.clone(),
    }))
}

async fn api_auth_logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<StatusCode, AppError> {
    auth::end_session(&state, &auth.claims.jti).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_auth_me(Extension(auth): Extension<AuthCtx>) -> Json<api::MeResp> {
    Json(api::MeResp {
        principal_id: auth.claims.sub.clone(),
        email: auth.claims.email.clone(),
        provider: auth.claims.provider,
    })
}

// Public code lookups

async fn api_invite_lookup(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<api::InviteLookupResp>, AppError> {
    let family_id = state
        .protocols
        .invites
        .lookup(&code)
        .await
        .map_err(code_failure)?;
    Ok(Json(api::InviteLookupResp {
        family_id: family_id.0,
    }))
}

async fn api_child_lookup(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<api::LookupCodeDto>, AppError> {
    let lookup = state
        .protocols
        .lookups
        .lookup(&code)
        .await
        .map_err(code_failure)?;
    Ok(Json(lookup.into()))
}

// Families

async fn api_create_family(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::NameReq>,
) -> Result<Json<api::FamilyDto>, AppError> {
    let family = state
        .protocols
        .families
        .create_family(&body.name, &auth.principal(), auth.email())
        .await?;
    Ok(Json(family.into()))
}

async fn api_my_family(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<api::MyFamilyResp>, AppError> {
    let family_id = state
        .protocols
        .families
        .find_existing_family(&auth.principal())
        .await?;
    Ok(Json(api::MyFamilyResp {
        family_id: family_id.map(|f| f.0),
    }))
}

async fn api_get_family(
    State(state): State<AppState>,
    Path(p): Path<FamilyPath>,
) -> Result<Json<api::FamilyDto>, AppError> {
    let family = state.protocols.families.get_family(&p.family_id).await?;
    Ok(Json(family.into()))
}

async fn api_rename_family(
    State(state): State<AppState>,
    Path(p): Path<FamilyPath>,
    Json(body): Json<api::NameReq>,
) -> Result<StatusCode, AppError> {
    state
        .protocols
        .families
        .rename_family(&p.family_id, &body.name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_delete_family(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<FamilyPath>,
) -> Result<StatusCode, AppError> {
    state
        .protocols
        .families
        .delete_family(&p.family_id, &auth.principal())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_list_parents(
    State(state): State<AppState>,
    Path(p): Path<FamilyPath>,
) -> Result<Json<Vec<api::ParentDto>>, AppError> {
    let families = &state.protocols.families;
    let family = families.get_family(&p.family_id).await?;
    let items = families
        .list_parents(&p.family_id)
        .await?
        .into_iter()
        .map(|m| api::ParentDto {
            is_owner: m.principal_id == family.owner_principal_id,
            principal_id: m.principal_id.0,
            email: m.email,
            joined_at: m.joined_at,
            originating_invite_code: m.originating_invite_code,
        })
        .collect();
    Ok(Json(items))
}

async fn api_remove_parent(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ParentPath>,
) -> Result<StatusCode, AppError> {
    state
        .protocols
        .families
        .remove_parent(&p.family_id, &auth.principal(), &p.principal_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Invites

async fn api_create_invite(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<FamilyPath>,
) -> Result<Json<api::InviteDto>, AppError> {
    // Codes for deleted families would still resolve.
    state.protocols.families.get_family(&p.family_id).await?;
    let invite = state
        .protocols
        .invites
        .mint(&p.family_id, &auth.principal())
        .await?;
    Ok(Json(api::InviteDto {
        code: invite.code,
        family_id: invite.family_id.0,
        expires_at: invite.expires_at,
    }))
}

async fn api_join_family(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<FamilyPath>,
    Json(body): Json<api::JoinFamilyReq>,
) -> Result<Json<api::ParentDto>, AppError> {
    let principal = auth.principal();
    let membership = state
        .protocols
        .invites
        .consume(&p.family_id, &body.code, Some(&principal), auth.email())
        .await
        .map_err(code_failure)?;
    Ok(Json(api::ParentDto {
        principal_id: membership.principal_id.0,
        email: membership.email,
        joined_at: membership.joined_at,
        originating_invite_code: membership.originating_invite_code,
        is_owner: false,
    }))
}

// Children

async fn api_list_children(
    State(state): State<AppState>,
    Path(p): Path<FamilyPath>,
) -> Result<Json<Vec<api::ChildDto>>, AppError> {
    let items = state
        .protocols
        .ledger
        .children_with_balances(&p.family_id)
        .await?
        .into_iter()
        .map(|c| api::ChildDetailDto::from(c).child)
        .collect();
    Ok(Json(items))
}

async fn api_create_child(
    State(state): State<AppState>,
    Path(p): Path<FamilyPath>,
    Json(body): Json<api::NameReq>,
) -> Result<Json<api::ChildDto>, AppError> {
    let child = state
        .protocols
        .ledger
        .create_child(&p.family_id, &body.name)
        .await?;
    Ok(Json(api::ChildDto {
        id: child.id.0,
        name: child.name,
        created_at: child.created_at,
        balance_minor_units: 0,
    }))
}

async fn api_get_child(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
) -> Result<Json<api::ChildDetailDto>, AppError> {
    let detail = state
        .protocols
        .ledger
        .child_with_balance(&p.family_id, &p.child_id)
        .await?;
    Ok(Json(detail.into()))
}

async fn api_rename_child(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
    Json(body): Json<api::NameReq>,
) -> Result<StatusCode, AppError> {
    state
        .protocols
        .ledger
        .rename_child(&p.family_id, &p.child_id, &body.name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_delete_child(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
) -> Result<StatusCode, AppError> {
    state
        .protocols
        .ledger
        .delete_child(&p.family_id, &p.child_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_mint_lookup_code(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
) -> Result<Json<api::LookupCodeDto>, AppError> {
    state
        .protocols
        .ledger
        .get_child(&p.family_id, &p.child_id)
        .await?;
    let lookup = state
        .protocols
        .lookups
        .mint(&p.family_id, &p.child_id)
        .await?;
    Ok(Json(lookup.into()))
}

// Transactions

async fn api_list_transactions(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
) -> Result<Json<Vec<api::TransactionDto>>, AppError> {
    let items = state
        .protocols
        .ledger
        .list_transactions(&p.family_id, &p.child_id)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(items))
}

async fn api_create_transaction(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
    Json(body): Json<api::TransactionReq>,
) -> Result<Json<api::TransactionDto>, AppError> {
    let effective_date = body
        .effective_date
        .unwrap_or_else(|| state.clock.now().date_naive());
    let tx = state
        .protocols
        .ledger
        .create_transaction(
            &p.family_id,
            &p.child_id,
            body.amount_minor_units,
            &body.description,
            effective_date,
        )
        .await?;
    Ok(Json(tx.into()))
}

async fn api_update_transaction(
    State(state): State<AppState>,
    Path(p): Path<TransactionPath>,
    Json(body): Json<api::TransactionReq>,
) -> Result<Json<api::TransactionDto>, AppError> {
    let effective_date = body
        .effective_date
        .unwrap_or_else(|| state.clock.now().date_naive());
    let tx = state
        .protocols
        .ledger
        .update_transaction(
            &p.family_id,
            &p.child_id,
            &p.tx_id,
            body.amount_minor_units,
            &body.description,
            effective_date,
        )
        .await?;
    Ok(Json(tx.into()))
}

async fn api_delete_transaction(
    State(state): State<AppState>,
    Path(p): Path<TransactionPath>,
) -> Result<StatusCode, AppError> {
    state
        .protocols
        .ledger
        .delete_transaction(&p.family_id, &p.child_id, &p.tx_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Devices

async fn api_list_devices(
    State(state): State<AppState>,
    Path(p): Path<ChildPath>,
) -> Result<Json<Vec<api::DeviceDto>>, AppError> {
    let items = state
        .protocols
        .devices
        .list(&p.family_id, &p.child_id)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(items))
}

async fn api_register_device(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<ChildPath>,
    Json(body): Json<api::RegisterDeviceReq>,
) -> Result<Json<api::DeviceDto>, AppError> {
    let principal = auth.principal();
    let access = state
        .protocols
        .devices
        .register(
            &p.family_id,
            &p.child_id,
            Some(&principal),
            &body.device_name,
            &body.lookup_code,
        )
        .await
        .map_err(code_failure)?;
    Ok(Json(access.into()))
}

async fn api_check_access(
    State(state): State<AppState>,
    Path(p): Path<DevicePath>,
) -> Result<Json<api::AccessResp>, AppError> {
    let has_access = state
        .protocols
        .devices
        .check_access(&p.family_id, &p.child_id, Some(&p.principal_id))
        .await?;
    Ok(Json(api::AccessResp { has_access }))
}

async fn api_touch_device(
    State(state): State<AppState>,
    Path(p): Path<DevicePath>,
) -> StatusCode {
    state
        .protocols
        .devices
        .touch(&p.family_id, &p.child_id, Some(&p.principal_id))
        .await;
    StatusCode::NO_CONTENT
}

async fn api_revoke_device(
    State(state): State<AppState>,
    Path(p): Path<DevicePath>,
) -> Result<StatusCode, AppError> {
    state
        .protocols
        .devices
        .revoke(&p.family_id, &p.child_id, &p.principal_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    fn unauthorized() -> Self {
        Self::Unauthorized
    }
    fn forbidden() -> Self {
        Self::Forbidden
    }
    fn not_found<T: Into<String>>(msg: T) -> Self {
        Self::NotFound(msg.into())
    }
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<ProtocolError> for AppError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::NotFound(m) => AppError::NotFound(format!("not found: {m}")),
            ProtocolError::Expired(_) => AppError::not_found(INVALID_CODE),
            ProtocolError::Unauthenticated => AppError::Unauthorized,
            ProtocolError::PermissionDenied(m) => {
                tracing::warn!(reason = %m, "permission denied");
                AppError::Forbidden
            }
            ProtocolError::InvalidInput(m) => AppError::BadRequest(m),
            ProtocolError::TransientStoreFailure(m) => AppError::Unavailable(m),
            ProtocolError::PartialBatchFailure(m) => AppError::Internal(m),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        ProtocolError::from(e).into()
    }
}

/// Absent and expired codes look the same from outside.
fn code_failure(e: ProtocolError) -> AppError {
    if e.is_invalid_code() {
        tracing::info!(reason = %e, "code rejected");
        AppError::not_found(INVALID_CODE)
    } else {
        e.into()
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, kind, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, "bad_request", None),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".into(),
                "unauthorized",
                None,
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".into(), "forbidden", None),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, "not_found", None),
            AppError::Unavailable(m) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily unavailable, retry later".into(),
                "unavailable",
                Some(m),
            ),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".into(),
                "internal",
                Some(m),
            ),
        };
        if let Some(detail) = detail {
            tracing::error!(status = %status, kind = kind, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::error!(status = %status, kind = kind, message = %msg, "request failed");
        }
        let body = axum::Json(ErrorBody { error: msg });
        (status, body).into_response()
    }
}
