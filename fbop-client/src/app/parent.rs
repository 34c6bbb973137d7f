use std::path::Path;

use chrono::NaiveDate;
use fbop_shared::api::{self, ServerEvent, TransactionReq};
use fbop_shared::code::normalize_code;
use fbop_shared::money::{format_minor_units, parse_minor_units};
use tracing::info;

use super::Session;
use crate::cli::TransactionArgs;
use crate::config::AppMode;
use crate::{AppError, login, qr, sse};

pub async fn sign_in(
    session: &mut Session,
    anonymous: bool,
    username: Option<String>,
) -> Result<(), AppError> {
    let principal = login::sign_in(session.server(), anonymous, username).await?;
    println!("Signed in as {principal}");
    if anonymous {
        return Ok(());
    }
    // Pick up a family this parent already belongs to.
    let token = session.token()?;
    let mine = api::rest::my_family(session.server(), &token).await?;
    if let Some(family_id) = mine.family_id {
        println!("Using family {family_id}");
        session.cfg.mode = AppMode::Parent;
        session.cfg.family_id = Some(family_id);
        session.save()?;
    }
    Ok(())
}

pub async fn sign_out(session: &mut Session) -> Result<(), AppError> {
    login::sign_out(session.server()).await?;
    println!("Signed out");
    Ok(())
}

pub async fn whoami(session: &Session) -> Result<(), AppError> {
    let token = session.token()?;
    let me = api::rest::me(session.server(), &token).await?;
    let version = api::rest::server_version(session.server()).await?;
    println!("{} ({:?}) on {} v{}", me.principal_id, me.provider, session.server(), version.version);
    if let Some(email) = me.email {
        println!("Email: {email}");
    }
    println!("Mode: {:?}", session.cfg.mode);
    if session.cfg.mode == AppMode::Parent {
        let family_id = session.cfg.family_id()?;
        let family = api::rest::get_family(session.server(), family_id, &token).await?;
        println!("Family: {} ({})", family.name, family.id);
    }
    Ok(())
}

pub async fn create_family(session: &mut Session, name: &str) -> Result<(), AppError> {
    let token = session.token()?;
    let family = api::rest::create_family(session.server(), &token, name).await?;
    info!(family_id = %family.id, "family created");
    session.cfg.mode = AppMode::Parent;
    session.cfg.family_id = Some(family.id.clone());
    session.save()?;
    println!("Created family {} ({})", family.name, family.id);
    Ok(())
}

pub async fn rename_family(session: &Session, name: &str) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    api::rest::rename_family(session.server(), family_id, &token, name).await?;
    println!("Renamed family to {name}");
    Ok(())
}

pub async fn delete_family(session: &mut Session) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?.to_string();
    api::rest::delete_family(session.server(), &family_id, &token).await?;
    session.cfg.reset();
    session.save()?;
    println!("Deleted family {family_id}");
    Ok(())
}

pub async fn parents(session: &Session) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    for p in api::rest::list_parents(session.server(), family_id, &token).await? {
        let role = if p.is_owner { "owner" } else { "parent" };
        println!("{}  {:<6}  {}", p.principal_id, role, p.email);
    }
    Ok(())
}

pub async fn remove_parent(session: &Session, principal_id: &str) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    api::rest::remove_parent(session.server(), family_id, principal_id, &token).await?;
    println!("Removed {principal_id}");
    Ok(())
}

pub async fn invite(session: &Session) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    let invite = api::rest::create_invite(session.server(), family_id, &token).await?;
    print!("{}", qr::render_terminal(&invite.code)?);
    println!("Invite code: {}", invite.code);
    println!("Valid until {} (single use)", invite.expires_at.to_rfc3339());
    Ok(())
}

/// Resolves the family from the code itself, then joins it.
pub async fn join(session: &mut Session, code: &str) -> Result<(), AppError> {
    let token = session.token()?;
    let code = normalize_code(code);
    let found = api::rest::lookup_invite(session.server(), &code).await?;
    let parent = api::rest::join_family(session.server(), &found.family_id, &code, &token).await?;
    session.cfg.mode = AppMode::Parent;
    session.cfg.family_id = Some(found.family_id.clone());
    session.save()?;
    println!(
        "Joined family {} as {}",
        found.family_id, parent.principal_id
    );
    Ok(())
}

pub async fn add_child(session: &Session, name: &str) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    let child = api::rest::create_child(session.server(), family_id, &token, name).await?;
    println!("Added {} ({})", child.name, child.id);
    Ok(())
}

pub async fn children(session: &Session) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    let items = api::rest::list_children(session.server(), family_id, &token).await?;
    if items.is_empty() {
        println!("No children yet; add one with `add-child NAME`");
    }
    for c in items {
        println!(
            "{}  {:>10}  {}",
            c.id,
            format_minor_units(c.balance_minor_units),
            c.name
        );
    }
    Ok(())
}

pub async fn rename_child(session: &Session, child_id: &str, name: &str) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    api::rest::rename_child(session.server(), family_id, child_id, &token, name).await?;
    println!("Renamed {child_id} to {name}");
    Ok(())
}

pub async fn remove_child(session: &Session, child_id: &str) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    api::rest::delete_child(session.server(), family_id, child_id, &token).await?;
    println!("Removed {child_id}");
    Ok(())
}

pub async fn lookup_qr(
    session: &Session,
    child_id: &str,
    svg: Option<&Path>,
) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    let lookup = api::rest::mint_lookup_code(session.server(), family_id, child_id, &token).await?;
    print!("{}", qr::render_terminal(&lookup.code)?);
    println!("Lookup code: {}", lookup.code);
    println!("Valid until {}", lookup.expires_at.to_rfc3339());
    println!("On the kid's device run: fbop-client pair {}", lookup.code);
    if let Some(path) = svg {
        qr::write_svg(&lookup.code, path)?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

/// Signed amount in cents; withdrawals are stored negative.
fn signed_amount(amount: &str, withdraw: bool) -> Result<i64, AppError> {
    let cents = parse_minor_units(amount)
        .filter(|c| *c > 0)
        .ok_or_else(|| AppError::Config(format!("invalid amount: {amount}")))?;
    Ok(if withdraw { -cents } else { cents })
}

pub async fn record(
    session: &Session,
    args: TransactionArgs,
    withdraw: bool,
) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    let req = TransactionReq {
        amount_minor_units: signed_amount(&args.amount, withdraw)?,
        description: args.description,
        effective_date: args.date,
    };
    let tx =
        api::rest::create_transaction(session.server(), family_id, &args.child_id, &token, &req)
            .await?;
    println!(
        "Recorded {} on {} ({})",
        format_minor_units(tx.amount_minor_units),
        tx.effective_date,
        tx.id
    );
    Ok(())
}

/// Edits keep the sign the caller gives; zero is allowed.
pub fn edit_request(
    amount: &str,
    description: String,
    date: Option<NaiveDate>,
) -> Result<TransactionReq, AppError> {
    let cents = parse_minor_units(amount)
        .ok_or_else(|| AppError::Config(format!("invalid amount: {amount}")))?;
    Ok(TransactionReq {
        amount_minor_units: cents,
        description,
        effective_date: date,
    })
}

pub async fn edit_transaction(
    session: &Session,
    child_id: &str,
    tx_id: &str,
    req: &TransactionReq,
) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    api::rest::update_transaction(session.server(), family_id, child_id, tx_id, &token, req)
        .await?;
    println!("Updated {tx_id}");
    Ok(())
}

pub async fn delete_transaction(
    session: &Session,
    child_id: &str,
    tx_id: &str,
) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    api::rest::delete_transaction(session.server(), family_id, child_id, tx_id, &token).await?;
    println!("Deleted {tx_id}");
    Ok(())
}

pub async fn devices(session: &Session, child_id: &str, follow: bool) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    let items = api::rest::list_devices(session.server(), family_id, child_id, &token).await?;
    print!("{}", render_devices(&items));
    if !follow {
        return Ok(());
    }
    let url = api::endpoints::devices_watch(session.server(), family_id, child_id);
    let mut rx = sse::spawn_watch(url, token);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            ev = rx.recv() => match ev {
                Some(Ok(ServerEvent::Devices { items })) => {
                    println!("--");
                    print!("{}", render_devices(&items));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

fn render_devices(items: &[api::DeviceDto]) -> String {
    if items.is_empty() {
        return "No devices; show a code with `qr CHILD_ID`\n".into();
    }
    items
        .iter()
        .map(|d| {
            format!(
                "{}  {}  last seen {}\n",
                d.principal_id,
                d.device_name,
                d.last_accessed_at.format("%Y-%m-%d %H:%M")
            )
        })
        .collect()
}

pub async fn revoke(session: &Session, child_id: &str, principal_id: &str) -> Result<(), AppError> {
    let token = session.token()?;
    let family_id = session.cfg.family_id()?;
    api::rest::revoke_device(session.server(), family_id, child_id, principal_id, &token).await?;
    println!("Revoked {principal_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withdrawals_are_negative() {
        assert_eq!(signed_amount("5", false).unwrap(), 500);
        assert_eq!(signed_amount("$2.50", true).unwrap(), -250);
        assert!(signed_amount("0", false).is_err());
        assert!(signed_amount("-3", true).is_err());
        assert!(signed_amount("lots", false).is_err());
    }

    #[test]
    fn edits_keep_the_given_sign() {
        let req = edit_request("-$2.50", "candy".into(), None).unwrap();
        assert_eq!(req.amount_minor_units, -250);
        assert!(edit_request("abc", String::new(), None).is_err());
    }
}
