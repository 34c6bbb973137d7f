use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::AppError;

pub const ENV_CONFIG: &str = "FBOP_CONFIG";

/// What this device is set up as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
    #[default]
    NotConfigured,
    Parent,
    /// Bound to one child's ledger through a lookup code.
    Kid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub mode: AppMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl ClientConfig {
    pub fn family_id(&self) -> Result<&str, AppError> {
        self.family_id.as_deref().ok_or_else(|| {
            AppError::NotConfigured("no family yet; run `create-family` or `join` first".into())
        })
    }

    /// Family and child a kid device is bound to.
    pub fn kid_binding(&self) -> Result<(&str, &str), AppError> {
        match (self.mode, &self.family_id, &self.child_id) {
            (AppMode::Kid, Some(f), Some(c)) => Ok((f.as_str(), c.as_str())),
            _ => Err(AppError::NotConfigured(
                "this device is not paired; run `pair CODE` first".into(),
            )),
        }
    }

    /// Drops everything but the server address.
    pub fn reset(&mut self) {
        *self = ClientConfig {
            server_url: std::mem::take(&mut self.server_url),
            ..ClientConfig::default()
        };
    }
}

pub fn resolve_config_path(cli_value: Option<PathBuf>) -> Result<PathBuf, AppError> {
    if let Some(p) = cli_value {
        return Ok(p);
    }
    if let Ok(p) = std::env::var(ENV_CONFIG) {
        return Ok(PathBuf::from(p));
    }
    default_config_path().ok_or_else(|| AppError::Config("could not determine config dir".into()))
}

pub fn default_config_path() -> Option<PathBuf> {
    let pd = ProjectDirs::from("io.github", "fbop", "fbop")?;
    Some(pd.config_dir().join("client.yaml"))
}

pub fn load_config(path: &Path) -> Result<ClientConfig, AppError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("read {} failed: {e}", path.display())))?;
    let cfg: ClientConfig = serde_yaml::from_str(&data)
        .map_err(|e| AppError::Config(format!("parse {} failed: {e}", path.display())))?;
    Ok(cfg)
}

/// A missing file is an unconfigured device.
pub fn load_or_default(path: &Path) -> Result<ClientConfig, AppError> {
    if !path.exists() {
        return Ok(ClientConfig::default());
    }
    load_config(path)
}

pub fn save_config(path: &Path, cfg: &ClientConfig) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let data = serde_yaml::to_string(cfg)
        .map_err(|e| AppError::Config(format!("serialize config failed: {e}")))?;
    std::fs::write(path, data)
        .map_err(|e| AppError::Config(format!("write {} failed: {e}", path.display())))
}

pub fn normalize_server_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", trimmed.trim_end_matches('/'))
    }
}
