//! Command handlers. Parent commands live in [`parent`], kid-device
//! commands in [`kid`].

use std::path::PathBuf;

use fbop_shared::api::{self, ChildDetailDto, TransactionDto};
use fbop_shared::money::format_minor_units;

use crate::config::{self, AppMode, ClientConfig};
use crate::{AppError, login};

pub mod kid;
pub mod parent;

/// Local config plus where it lives.
pub struct Session {
    pub cfg_path: PathBuf,
    pub cfg: ClientConfig,
}

impl Session {
    /// Loads the config; `server` overrides and is persisted.
    pub fn open(cfg_path: Option<PathBuf>, server: Option<String>) -> Result<Self, AppError> {
        let cfg_path = config::resolve_config_path(cfg_path)?;
        let cfg = config::load_or_default(&cfg_path)?;
        let mut session = Self { cfg_path, cfg };
        let mut dirty = false;
        if let Some(s) = server {
            let url = config::normalize_server_url(&s);
            if url != session.cfg.server_url {
                session.cfg.server_url = url;
                dirty = true;
            }
        }
        if session.cfg.server_url.is_empty() {
            let url = login::prompt("Server URL (e.g., 127.0.0.1:5151): ")?;
            session.cfg.server_url = config::normalize_server_url(&url);
            dirty = true;
        }
        if dirty {
            session.save()?;
        }
        Ok(session)
    }

    pub fn save(&self) -> Result<(), AppError> {
        config::save_config(&self.cfg_path, &self.cfg)
    }

    pub fn server(&self) -> &str {
        &self.cfg.server_url
    }

    pub fn token(&self) -> Result<String, AppError> {
        login::read_token(self.server())
    }
}

/// Parents name the child; kid devices use their pairing.
pub async fn balance(session: &Session, child_id: Option<&str>) -> Result<(), AppError> {
    let token = session.token()?;
    let (family_id, child_id) = match (session.cfg.mode, child_id) {
        (AppMode::Kid, None) => session.cfg.kid_binding()?,
        (_, Some(c)) => (session.cfg.family_id()?, c),
        (_, None) => {
            return Err(AppError::NotConfigured(
                "name a child: `balance CHILD_ID`".into(),
            ));
        }
    };
    let detail = api::rest::get_child(session.server(), family_id, child_id, &token).await?;
    print!("{}", render_detail(&detail));
    Ok(())
}

pub(crate) fn render_detail(detail: &ChildDetailDto) -> String {
    let mut out = format!(
        "{}: {}\n",
        detail.child.name,
        format_minor_units(detail.child.balance_minor_units)
    );
    out.push_str(&render_transactions(&detail.transactions));
    out
}

pub(crate) fn render_transactions(items: &[TransactionDto]) -> String {
    if items.is_empty() {
        return "  (no transactions)\n".into();
    }
    items
        .iter()
        .map(|t| {
            format!(
                "  {}  {:>10}  {}\n",
                t.effective_date,
                format_minor_units(t.amount_minor_units),
                t.description
            )
        })
        .collect()
}
