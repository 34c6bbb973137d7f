use axum::http::{Request, header};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use fbop_shared::auth::Provider;
use fbop_shared::domain::PrincipalId;
use fbop_shared::jwt::{self, JwtClaims};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::{AppError, AppState};
use crate::protocol::paths::{self, fields};
use crate::store::{Data, encode};

/// How many days of inactivity before a session is considered expired.
const SESSION_IDLE_DAYS: i64 = 30;
/// How many days before mandatory re-sign-in.
const TOKEN_TTL_DAYS: i64 = 2 * SESSION_IDLE_DAYS;

#[derive(Clone, Debug)]
pub struct AuthCtx {
    pub claims: JwtClaims,
}

impl AuthCtx {
    pub fn principal(&self) -> PrincipalId {
        PrincipalId::from(self.claims.sub.as_str())
    }

    pub fn email(&self) -> &str {
        self.claims.email.as_deref().unwrap_or_default()
    }
}

/// Stored at `sessions/{jti}`; removing it signs the token out.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    principal_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    last_used_at: DateTime<Utc>,
}

pub async fn require_bearer(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let unauthorized = || Err(AppError::unauthorized());
    let header_val = match req.headers().get(header::AUTHORIZATION) {
        Some(v) => v,
        None => return unauthorized(),
    };
    let header_str = header_val.to_str().map_err(|_| AppError::unauthorized())?;
    let Some(token) = header_str.strip_prefix("Bearer ") else {
        return unauthorized();
    };

    let claims = match jwt::decode_and_verify(token, state.config.jwt_secret.as_bytes()) {
        Ok(c) => c,
        Err(e) => {
            warn!(error=%e, "auth: jwt decode failed");
            return unauthorized();
        }
    };

    let cutoff = state.clock.now() - Duration::days(SESSION_IDLE_DAYS);
    match touch_session(&state, &claims.jti, cutoff).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                jti = %claims.jti,
                principal = %claims.sub,
                cutoff = %cutoff,
                "auth: session missing or expired"
            );
            return unauthorized();
        }
        Err(e) => {
            error!(jti = %claims.jti, error=%e, "auth: session touch failed");
            return Err(e);
        }
    }
    req.extensions_mut().insert(AuthCtx { claims });
    Ok(next.run(req).await)
}

/// Refreshes `lastUsedAt` unless the session has been idle past `cutoff`.
async fn touch_session(
    state: &AppState,
    jti: &str,
    cutoff: DateTime<Utc>,
) -> Result<bool, AppError> {
    let path = paths::session(jti).map_err(|_| AppError::unauthorized())?;
    let Some(doc) = state.store.get(&path).await? else {
        return Ok(false);
    };
    let session: Session = doc.decode()?;
    if session.last_used_at < cutoff {
        return Ok(false);
    }
    let mut data = Data::new();
    data.insert(
        fields::LAST_USED_AT.into(),
        state.clock.now().timestamp_millis().into(),
    );
    state.store.update(&path, data).await?;
    Ok(true)
}

pub async fn issue_jwt(
    state: &AppState,
    principal: &PrincipalId,
    provider: Provider,
    email: Option<String>,
) -> Result<String, AppError> {
    let jti = uuid::Uuid::new_v4().to_string();
    let now = state.clock.now();
    let claims = JwtClaims {
        sub: principal.to_string(),
        jti: jti.clone(),
        exp: (now + Duration::days(TOKEN_TTL_DAYS)).timestamp(),
        provider,
        email,
    };
    let session = Session {
        principal_id: principal.to_string(),
        created_at: now,
        last_used_at: now,
    };
    let path = paths::session(&jti).map_err(AppError::internal)?;
    state
        .store
        .set(&path, encode(&session)?)
        .await
        .map_err(|e| {
            error!(principal = %principal, error=%e, "sign-in: create session failed");
            AppError::from(e)
        })?;
    let token = jwt::encode(&claims, state.config.jwt_secret.as_bytes()).map_err(|e| {
        error!(principal = %principal, error=%e, "sign-in: jwt encode failed");
        AppError::internal(e)
    })?;
    Ok(token)
}

pub async fn end_session(state: &AppState, jti: &str) -> Result<(), AppError> {
    let path = paths::session(jti).map_err(AppError::internal)?;
    state.store.delete(&path).await?;
    Ok(())
}
