use serde::Deserialize;
use std::{env, fs, path::Path};

use crate::store::MAX_BATCH_OPS;

/// One year; longer intervals are a config mistake.
pub const MAX_SWEEP_INTERVAL_HOURS: u64 = 24 * 366;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub jwt_secret: String,
    /// Accounts for the federated sign-in path.
    #[serde(default)]
    pub users: Vec<UserConfig>,
    pub dev_cors_origin: Option<String>,
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default)]
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String, // bcrypt hash
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    /// Volatile; everything is lost on restart.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Run the sweeper inside the server process.
    pub enabled: bool,
    pub interval_hours: u64,
    pub batch_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24 * 7,
            batch_limit: MAX_BATCH_OPS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        Self::load_from_path(path)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(&path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.trim().len() < 16 {
            return Err(ConfigError::Invalid(
                "jwt_secret must be at least 16 characters".into(),
            ));
        }
        if self.sweep.interval_hours == 0 || self.sweep.interval_hours > MAX_SWEEP_INTERVAL_HOURS {
            return Err(ConfigError::Invalid(format!(
                "sweep.interval_hours must be between 1 and {MAX_SWEEP_INTERVAL_HOURS}"
            )));
        }
        if self.sweep.batch_limit == 0 || self.sweep.batch_limit > MAX_BATCH_OPS {
            return Err(ConfigError::Invalid(format!(
                "sweep.batch_limit must be between 1 and {MAX_BATCH_OPS}"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            if !seen.insert(user.username.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate user: {}",
                    user.username
                )));
            }
        }
        Ok(())
    }
}
