use fbop_shared::api::rest::RestError;

pub mod app;
pub mod cli;
pub mod config;
pub mod login;
pub mod qr;
pub mod sse;

pub use cli::{Cli, Command};
pub use config::{AppMode, ClientConfig, load_config, resolve_config_path};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("qr error: {0}")]
    Qr(String),
    #[error("{0}")]
    NotConfigured(String),
    #[error("this device no longer has access; ask a parent for a new code")]
    AccessRevoked,
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    error: String,
}

impl From<RestError> for AppError {
    fn from(e: RestError) -> Self {
        match e {
            // Server errors carry `{ "error": "..." }`; show just the message.
            RestError::Status { status, body } => {
                match serde_json::from_str::<ErrorBody>(&body) {
                    Ok(b) => AppError::Http(format!("{} ({status})", b.error)),
                    Err(_) => AppError::Http(format!("status {status}: {body}")),
                }
            }
            other => AppError::Http(other.to_string()),
        }
    }
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

pub async fn run(cli: Cli) -> Result<(), AppError> {
    init_tracing();
    let mut session = app::Session::open(cli.config, cli.server)?;
    tracing::debug!(path=?session.cfg_path, mode=?session.cfg.mode, "loaded config");

    match cli.command {
        Command::SignIn {
            anonymous,
            username,
        } => app::parent::sign_in(&mut session, anonymous, username).await,
        Command::SignOut => app::parent::sign_out(&mut session).await,
        Command::Whoami => app::parent::whoami(&session).await,
        Command::CreateFamily { name } => app::parent::create_family(&mut session, &name).await,
        Command::RenameFamily { name } => app::parent::rename_family(&session, &name).await,
        Command::DeleteFamily => app::parent::delete_family(&mut session).await,
        Command::Parents => app::parent::parents(&session).await,
        Command::RemoveParent { principal_id } => {
            app::parent::remove_parent(&session, &principal_id).await
        }
        Command::Invite => app::parent::invite(&session).await,
        Command::Join { code } => app::parent::join(&mut session, &code).await,
        Command::AddChild { name } => app::parent::add_child(&session, &name).await,
        Command::Children => app::parent::children(&session).await,
        Command::RenameChild { child_id, name } => {
            app::parent::rename_child(&session, &child_id, &name).await
        }
        Command::RemoveChild { child_id } => app::parent::remove_child(&session, &child_id).await,
        Command::Qr { child_id, svg } => {
            app::parent::lookup_qr(&session, &child_id, svg.as_deref()).await
        }
        Command::Pair { code, device_name } => {
            app::kid::pair(&mut session, &code, device_name).await
        }
        Command::Deposit(args) => app::parent::record(&session, args, false).await,
        Command::Withdraw(args) => app::parent::record(&session, args, true).await,
        Command::EditTx {
            child_id,
            tx_id,
            amount,
            description,
            date,
        } => {
            let req = app::parent::edit_request(&amount, description, date)?;
            app::parent::edit_transaction(&session, &child_id, &tx_id, &req).await
        }
        Command::DeleteTx { child_id, tx_id } => {
            app::parent::delete_transaction(&session, &child_id, &tx_id).await
        }
        Command::Balance { child_id } => app::balance(&session, child_id.as_deref()).await,
        Command::Devices { child_id, watch } => {
            app::parent::devices(&session, &child_id, watch).await
        }
        Command::Revoke {
            child_id,
            principal_id,
        } => app::parent::revoke(&session, &child_id, &principal_id).await,
        Command::Watch => app::kid::watch(&mut session).await,
        Command::Reset => {
            session.cfg.reset();
            session.save()?;
            println!("Local config cleared");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_bodies_are_unwrapped() {
        let e: AppError = RestError::Status {
            status: 404,
            body: r#"{"error":"invalid or expired code"}"#.into(),
        }
        .into();
        assert_eq!(e.to_string(), "http error: invalid or expired code (404)");

        let e: AppError = RestError::Status {
            status: 502,
            body: "bad gateway".into(),
        }
        .into();
        assert_eq!(e.to_string(), "http error: status 502: bad gateway");
    }
}
