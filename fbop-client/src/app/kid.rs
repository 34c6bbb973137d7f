use fbop_shared::api::{self, RegisterDeviceReq, ServerEvent, TransactionDto};
use fbop_shared::code::normalize_code;
use fbop_shared::jwt;
use fbop_shared::money::format_minor_units;
use tracing::{info, warn};

use super::{Session, render_detail, render_transactions};
use crate::config::AppMode;
use crate::{AppError, login, sse};

fn default_device_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "Kid device".to_string())
}

/// Kid devices sign in anonymously when they have no token yet.
async fn kid_token(session: &Session) -> Result<String, AppError> {
    match session.token() {
        Ok(t) => Ok(t),
        Err(AppError::NotConfigured(_)) => {
            login::sign_in(session.server(), true, None).await?;
            session.token()
        }
        Err(e) => Err(e),
    }
}

pub async fn pair(
    session: &mut Session,
    code: &str,
    device_name: Option<String>,
) -> Result<(), AppError> {
    let code = normalize_code(code);
    let token = kid_token(session).await?;
    let lookup = api::rest::lookup_child(session.server(), &code).await?;
    let device_name = device_name.unwrap_or_else(default_device_name);
    let req = RegisterDeviceReq {
        lookup_code: code.clone(),
        device_name: device_name.clone(),
    };
    let device = api::rest::register_device(
        session.server(),
        &lookup.family_id,
        &lookup.child_id,
        &token,
        &req,
    )
    .await?;
    info!(principal = %device.principal_id, child_id = %lookup.child_id, "device paired");

    session.cfg.mode = AppMode::Kid;
    session.cfg.family_id = Some(lookup.family_id);
    session.cfg.child_id = Some(lookup.child_id);
    session.cfg.lookup_code = Some(code);
    session.cfg.device_name = Some(device_name);
    session.save()?;
    println!("Paired as \"{}\"; run `watch` to follow the balance", device.device_name);
    Ok(())
}

/// Forgets the pairing so the device has to be paired again.
fn revoked(session: &mut Session) -> AppError {
    session.cfg.reset();
    if let Err(e) = session.save() {
        warn!(error=%e, "failed to clear revoked pairing");
    }
    AppError::AccessRevoked
}

fn balance_of(items: &[TransactionDto]) -> i64 {
    items.iter().map(|t| t.amount_minor_units).sum()
}

pub async fn watch(session: &mut Session) -> Result<(), AppError> {
    let (family_id, child_id) = {
        let (f, c) = session.cfg.kid_binding()?;
        (f.to_string(), c.to_string())
    };
    let token = session.token()?;
    let principal =
        jwt::principal_from_token(&token).map_err(|e| AppError::Config(e.to_string()))?;
    let server = session.server().to_string();

    let access =
        api::rest::check_access(&server, &family_id, &child_id, &principal, &token).await?;
    if !access.has_access {
        return Err(revoked(session));
    }
    if let Err(e) = api::rest::touch_device(&server, &family_id, &child_id, &principal, &token).await
    {
        warn!(error=%e, "touch failed; continuing");
    }
    let detail = api::rest::get_child(&server, &family_id, &child_id, &token).await?;
    print!("{}", render_detail(&detail));

    let mut access_rx = sse::spawn_watch(
        api::endpoints::device_watch(&server, &family_id, &child_id, &principal),
        token.clone(),
    );
    let mut tx_rx = sse::spawn_watch(
        api::endpoints::transactions_watch(&server, &family_id, &child_id),
        token,
    );
    // The first snapshot repeats what was just printed.
    let mut seen_first = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            ev = access_rx.recv() => match ev {
                Some(Ok(ServerEvent::Access { device: None })) | Some(Err(AppError::AccessRevoked)) => {
                    return Err(revoked(session));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
            ev = tx_rx.recv() => match ev {
                Some(Ok(ServerEvent::Transactions { items })) => {
                    if !seen_first {
                        seen_first = true;
                        continue;
                    }
                    println!("--");
                    println!("{}: {}", detail.child.name, format_minor_units(balance_of(&items)));
                    print!("{}", render_transactions(&items));
                }
                Some(Ok(_)) => {}
                Some(Err(AppError::AccessRevoked)) => return Err(revoked(session)),
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    #[test]
    fn balance_sums_signed_amounts() {
        let tx = |amount| TransactionDto {
            id: "T".into(),
            amount_minor_units: amount,
            description: String::new(),
            effective_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        };
        assert_eq!(balance_of(&[tx(500), tx(-200)]), 300);
        assert_eq!(balance_of(&[]), 0);
    }

    #[test]
    fn revocation_clears_the_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session {
            cfg_path: dir.path().join("client.yaml"),
            cfg: crate::config::ClientConfig {
                server_url: "http://pig.local".into(),
                mode: AppMode::Kid,
                family_id: Some("F1".into()),
                child_id: Some("C1".into()),
                lookup_code: Some("QZ4K8MNP".into()),
                device_name: Some("Pixel 8".into()),
            },
        };
        assert!(matches!(revoked(&mut session), AppError::AccessRevoked));
        let saved = crate::config::load_config(&session.cfg_path).unwrap();
        assert_eq!(saved.mode, AppMode::NotConfigured);
        assert_eq!(saved.server_url, "http://pig.local");
        assert!(saved.child_id.is_none());
    }
}
