use std::io::{self, Write};

use fbop_shared::api::{self, rest::RestError};
use tracing::{info, warn};

use crate::AppError;

const KEYRING_SERVICE: &str = "fbop-client";

fn keyring_entry(server_url: &str) -> Result<keyring::Entry, AppError> {
    keyring::Entry::new(KEYRING_SERVICE, &crate::config::normalize_server_url(server_url))
        .map_err(|e| AppError::Keyring(e.to_string()))
}

pub fn read_token(server_url: &str) -> Result<String, AppError> {
    keyring_entry(server_url)?.get_password().map_err(|e| match e {
        keyring::Error::NoEntry => {
            AppError::NotConfigured("not signed in; run `sign-in` first".into())
        }
        other => AppError::Keyring(other.to_string()),
    })
}

fn store_token(server_url: &str, token: &str) -> Result<(), AppError> {
    let entry = keyring_entry(server_url)?;
    entry
        .set_password(token)
        .map_err(|e| AppError::Keyring(e.to_string()))
}

/// Signs in and keeps the token; returns the principal id.
pub async fn sign_in(
    server_url: &str,
    anonymous: bool,
    username_arg: Option<String>,
) -> Result<String, AppError> {
    let resp = if anonymous {
        api::rest::sign_in_anonymous(server_url)
            .await
            .map_err(|e| AppError::Http(format!("sign-in failed: {e}")))?
    } else {
        let username = match username_arg {
            Some(u) => u,
            None => prompt("Username: ")?,
        };
        let password = rpassword::prompt_password("Password: ")?;
        api::rest::login(server_url, &api::AuthReq { username, password })
            .await
            .map_err(|e| AppError::Http(format!("sign-in failed: {e}")))?
    };
    store_token(server_url, &resp.token)?;
    info!(principal = %resp.principal_id, "signed in");
    Ok(resp.principal_id)
}

/// Ends the server session, then forgets the local token either way.
pub async fn sign_out(server_url: &str) -> Result<(), AppError> {
    let entry = keyring_entry(server_url)?;
    match entry.get_password() {
        Ok(token) => match api::rest::logout(server_url, &token).await {
            Ok(()) => {}
            Err(RestError::Status { status: 401, .. }) => {}
            Err(e) => warn!(error=%e, "sign-out: server call failed; forgetting token anyway"),
        },
        Err(keyring::Error::NoEntry) => return Ok(()),
        Err(e) => return Err(AppError::Keyring(e.to_string())),
    }
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(AppError::Keyring(e.to_string())),
    }
}

pub fn prompt(msg: &str) -> Result<String, AppError> {
    print!("{}", msg);
    io::stdout().flush().ok();
    let mut buf = String::new();
    io::stdin().read_line(&mut buf).map_err(AppError::Io)?;
    Ok(buf.trim().to_string())
}
