//! Configuration root, file layout, and token resolution.
//!
//! The config root defaults to `$HOME/.simple-secrets` and can be overridden
//! by `SIMPLE_SECRETS_CONFIG_DIR` at load time. Environment reads happen once
//! at construction; tests inject a root directly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{Result, StoreError};

/// Overrides the configuration root (used by tests and alternate deployments).
pub const CONFIG_DIR_ENV: &str = "SIMPLE_SECRETS_CONFIG_DIR";

/// Supplies the token for CLI invocations that do not pass one explicitly.
pub const TOKEN_ENV: &str = "SIMPLE_SECRETS_TOKEN";

/// Snapshots kept by the rotation retention policy when `config.json` does
/// not say otherwise.
pub const DEFAULT_ROTATION_BACKUP_COUNT: usize = 5;

// ---------------------------------------------------------------------------
// File layout
// ---------------------------------------------------------------------------

/// Every path the store touches, derived from one config root.
#[derive(Clone, Debug)]
pub struct Paths {
    pub root: PathBuf,
    pub master_key: PathBuf,
    pub secrets_db: PathBuf,
    pub users: PathBuf,
    pub roles: PathBuf,
    pub config: PathBuf,
    pub backups: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            master_key: root.join("master.key"),
            secrets_db: root.join("secrets.json"),
            users: root.join("users.json"),
            roles: root.join("roles.json"),
            config: root.join("config.json"),
            backups: root.join("backups"),
            root,
        }
    }

    /// Resolve the root from the environment: `SIMPLE_SECRETS_CONFIG_DIR`,
    /// else `$HOME/.simple-secrets`.
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(Self::new(PathBuf::from(dir)));
        }
        match std::env::var_os("HOME") {
            Some(home) => Ok(Self::new(PathBuf::from(home).join(".simple-secrets"))),
            None => Err(StoreError::Storage {
                path: PathBuf::from("~"),
                detail: format!("neither {} nor HOME is set", CONFIG_DIR_ENV),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// config.json
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_backup_count: Option<usize>,
}

impl ConfigFile {
    /// Load `config.json`; a missing file is an empty config.
    pub fn load(backend: &dyn Backend, path: &Path) -> Self {
        if !backend.exists(path) {
            return Self::default();
        }
        match backend
            .read(path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
        {
            Some(cfg) => cfg,
            None => {
                tracing::warn!(path = %path.display(), "unreadable config.json, using defaults");
                Self::default()
            }
        }
    }

    pub fn rotation_backup_count(&self) -> usize {
        self.rotation_backup_count
            .unwrap_or(DEFAULT_ROTATION_BACKUP_COUNT)
    }
}

// ---------------------------------------------------------------------------
// Token resolution
// ---------------------------------------------------------------------------

/// Precedence: explicit argument, then environment, then `config.json`.
pub fn resolve_token(
    explicit: Option<&str>,
    env_token: Option<&str>,
    config: &ConfigFile,
) -> Result<String> {
    if let Some(token) = explicit {
        return Ok(token.to_string());
    }
    if let Some(token) = env_token {
        return Ok(token.to_string());
    }
    if let Some(token) = &config.token {
        return Ok(token.clone());
    }
    Err(StoreError::AuthRequired)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
