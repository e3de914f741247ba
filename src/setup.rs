//! First-run detection and installation.
//!
//! A config root with no `users.json` and none of the other store files is
//! eligible for first-run setup. If other store files exist without
//! `users.json`, the installation is broken and loading refuses rather than
//! risking an overwrite.

use crate::auth::{self, default_role_permissions, Role};
use crate::backend::Backend;
use crate::config::Paths;
use crate::error::{Result, StoreError};
use crate::fsio::{SECRET_DIR_MODE, SECRET_FILE_MODE};

/// Installation status of a config root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallState {
    /// `users.json` exists; the store is usable.
    Installed,
    /// Nothing exists yet; first-run setup may proceed.
    FirstRun,
    /// Store files exist but `users.json` does not.
    Broken,
}

/// Classify the config root without touching anything.
pub fn install_state(backend: &dyn Backend, paths: &Paths) -> InstallState {
    if backend.exists(&paths.users) {
        return InstallState::Installed;
    }
    let any_store_file = backend.exists(&paths.roles)
        || backend.exists(&paths.master_key)
        || backend.exists(&paths.secrets_db)
        || backend.exists(&paths.backups);
    if any_store_file {
        InstallState::Broken
    } else {
        InstallState::FirstRun
    }
}

/// Require an installed store before serving any operation.
pub fn require_installed(backend: &dyn Backend, paths: &Paths) -> Result<()> {
    match install_state(backend, paths) {
        InstallState::Installed => Ok(()),
        InstallState::FirstRun => Err(StoreError::FirstRunRequired),
        InstallState::Broken => Err(StoreError::BrokenInstallation(paths.root.clone())),
    }
}

/// Perform first-run setup: create the config root, write the default role
/// mapping, and create the `admin` user.
///
/// Returns the admin's raw token. It is shown exactly once and never stored.
pub fn initialize(backend: &dyn Backend, paths: &Paths) -> Result<String> {
    match install_state(backend, paths) {
        InstallState::FirstRun => {}
        InstallState::Installed => {
            return Err(StoreError::AlreadyExists(paths.users.display().to_string()))
        }
        InstallState::Broken => return Err(StoreError::BrokenInstallation(paths.root.clone())),
    }

    backend.create_dir_all(&paths.root, SECRET_DIR_MODE)?;

    let roles = serde_json::to_string_pretty(&default_role_permissions()).map_err(|e| {
        StoreError::Storage {
            path: paths.roles.clone(),
            detail: e.to_string(),
        }
    })?;
    backend.atomic_write(&paths.roles, roles.as_bytes(), SECRET_FILE_MODE)?;

    let (admin, raw_token) = auth::new_user_record("admin", Role::Admin)?;
    auth::write_users(backend, &paths.users, &[admin])?;

    tracing::info!(root = %paths.root.display(), "initialized store");
    Ok(raw_token)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use crate::auth::AccessGate;
    use std::sync::Arc;

    #[test]
    fn fresh_root_is_first_run() {
        let be = MemBackend::new();
        let paths = Paths::new("/store");
        assert_eq!(install_state(&be, &paths), InstallState::FirstRun);
        assert!(matches!(
            require_installed(&be, &paths),
            Err(StoreError::FirstRunRequired)
        ));
    }

    #[test]
    fn initialize_creates_admin_and_roles() {
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new());
        let paths = Paths::new("/store");

        let token = initialize(backend.as_ref(), &paths).unwrap();
        assert_eq!(install_state(backend.as_ref(), &paths), InstallState::Installed);

        let gate = AccessGate::load(paths, Arc::clone(&backend)).unwrap();
        let admin = gate.lookup(&token).unwrap();
        assert_eq!(admin.username, "admin");
        assert_eq!(admin.role, Role::Admin);
    }

    #[test]
    fn initialize_twice_fails() {
        let be = MemBackend::new();
        let paths = Paths::new("/store");
        initialize(&be, &paths).unwrap();
        assert!(matches!(
            initialize(&be, &paths),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn stray_store_files_mean_broken() {
        let be = MemBackend::new();
        let paths = Paths::new("/store");
        be.write(&paths.master_key, b"whatever", 0o600).unwrap();

        assert_eq!(install_state(&be, &paths), InstallState::Broken);
        assert!(matches!(
            require_installed(&be, &paths),
            Err(StoreError::BrokenInstallation(_))
        ));
        assert!(matches!(
            initialize(&be, &paths),
            Err(StoreError::BrokenInstallation(_))
        ));
    }
}
