//! Access gate: token hashing, constant-time lookup, users, and roles.
//!
//! Raw tokens are never persisted; `users.json` stores only SHA-256 hashes,
//! and every presented token is compared hash-to-hash in constant time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::backend::Backend;
use crate::config::Paths;
use crate::error::{Result, StoreError};
use crate::fsio::SECRET_FILE_MODE;

/// Raw token entropy (base64-url encoded before display).
const TOKEN_BYTES: usize = 20;

// ---------------------------------------------------------------------------
// Roles and permissions
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Reader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Reader => "reader",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "reader" => Ok(Role::Reader),
            other => Err(StoreError::InvalidRole(other.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission strings recognized by the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    RotateTokens,
    ManageUsers,
    RotateOwnToken,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::RotateTokens => "rotate-tokens",
            Permission::ManageUsers => "manage-users",
            Permission::RotateOwnToken => "rotate-own-token",
        }
    }
}

/// Default role-to-permission mapping, written to `roles.json` at first run.
pub fn default_role_permissions() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        Role::Admin.as_str().to_string(),
        vec![
            Permission::Read.as_str().to_string(),
            Permission::Write.as_str().to_string(),
            Permission::RotateTokens.as_str().to_string(),
            Permission::ManageUsers.as_str().to_string(),
            Permission::RotateOwnToken.as_str().to_string(),
        ],
    );
    map.insert(
        Role::Reader.as_str().to_string(),
        vec![
            Permission::Read.as_str().to_string(),
            Permission::RotateOwnToken.as_str().to_string(),
        ],
    );
    map
}

// ---------------------------------------------------------------------------
// User records
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub token_hash: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_rotated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Token material
// ---------------------------------------------------------------------------

/// SHA-256 of the token's UTF-8 bytes, base64-url without padding.
pub fn hash_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Fresh raw token: 20 random bytes, base64-url without padding. The caller
/// must display it once; only the hash is ever stored.
fn generate_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes).map_err(|_| StoreError::RandomnessFailure)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

// ---------------------------------------------------------------------------
// Access gate
// ---------------------------------------------------------------------------

struct GateState {
    users: Vec<UserRecord>,
    roles: HashMap<String, Vec<String>>,
}

/// Token authentication and role-based authorization over `users.json` and
/// `roles.json`.
pub struct AccessGate {
    backend: Arc<dyn Backend>,
    paths: Paths,
    state: RwLock<GateState>,
}

impl AccessGate {
    /// Load the gate from disk. Fails with `NoAdmin` if the user database
    /// carries no admin record.
    pub fn load(paths: Paths, backend: Arc<dyn Backend>) -> Result<Self> {
        let users = read_users(backend.as_ref(), &paths.users)?;
        if !users.iter().any(|u| u.role == Role::Admin) {
            return Err(StoreError::NoAdmin);
        }

        let roles = if backend.exists(&paths.roles) {
            let data = backend.read(&paths.roles)?;
            serde_json::from_slice(&data).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "unreadable roles.json, using built-in defaults");
                default_role_permissions()
            })
        } else {
            tracing::warn!("roles.json missing, using built-in defaults");
            default_role_permissions()
        };

        Ok(Self {
            backend,
            paths,
            state: RwLock::new(GateState { users, roles }),
        })
    }

    // -----------------------------------------------------------------------
    // Authentication / authorization
    // -----------------------------------------------------------------------

    /// Resolve a presented token to its user record.
    pub fn lookup(&self, token: &str) -> Result<UserRecord> {
        if token.is_empty() {
            return Err(StoreError::EmptyToken);
        }
        let presented = hash_token(token);
        let state = self.state.read().unwrap();
        state
            .users
            .iter()
            .find(|u| {
                let stored = u.token_hash.as_bytes();
                let provided = presented.as_bytes();
                stored.len() == provided.len() && bool::from(stored.ct_eq(provided))
            })
            .cloned()
            .ok_or(StoreError::InvalidToken)
    }

    /// Whether `user`'s role carries `permission`.
    pub fn can(&self, user: &UserRecord, permission: Permission) -> bool {
        let state = self.state.read().unwrap();
        state
            .roles
            .get(user.role.as_str())
            .map(|perms| perms.iter().any(|p| p == permission.as_str()))
            .unwrap_or(false)
    }

    /// Authenticate and authorize in one step.
    pub fn require(&self, token: &str, permission: Permission) -> Result<UserRecord> {
        let user = self.lookup(token)?;
        if self.can(&user, permission) {
            Ok(user)
        } else {
            Err(StoreError::PermissionDeniedRole {
                role: user.role.to_string(),
                permission: permission.as_str().to_string(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // User management
    // -----------------------------------------------------------------------

    /// Create a user and return the raw token. Display it once; it cannot be
    /// recovered.
    pub fn create_user(&self, username: &str, role: Role) -> Result<String> {
        let mut state = self.state.write().unwrap();
        let _guard = self.backend.lock(&self.paths.users)?;
        state.users = read_users(self.backend.as_ref(), &self.paths.users)?;

        if state.users.iter().any(|u| u.username == username) {
            return Err(StoreError::DuplicateUsername(username.to_string()));
        }

        let raw = generate_token()?;
        state.users.push(UserRecord {
            username: username.to_string(),
            token_hash: hash_token(&raw),
            role,
            token_rotated_at: None,
        });
        self.persist(&state.users)?;
        tracing::info!(username, role = %role, "created user");
        Ok(raw)
    }

    /// Replace a user's token, returning the new raw token.
    pub fn rotate_token(&self, username: &str) -> Result<String> {
        let mut state = self.state.write().unwrap();
        let _guard = self.backend.lock(&self.paths.users)?;
        state.users = read_users(self.backend.as_ref(), &self.paths.users)?;

        let raw = generate_token()?;
        let user = state
            .users
            .iter_mut()
            .find(|u| u.username == username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        user.token_hash = hash_token(&raw);
        user.token_rotated_at = Some(Utc::now());
        self.persist(&state.users)?;
        tracing::info!(username, "rotated user token");
        Ok(raw)
    }

    /// Delete a user. The last admin cannot be deleted.
    pub fn delete_user(&self, username: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let _guard = self.backend.lock(&self.paths.users)?;
        state.users = read_users(self.backend.as_ref(), &self.paths.users)?;

        let target = state
            .users
            .iter()
            .find(|u| u.username == username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        if target.role == Role::Admin && count_admins(&state.users) == 1 {
            return Err(StoreError::LastAdminProtected(username.to_string()));
        }

        state.users.retain(|u| u.username != username);
        self.persist(&state.users)?;
        tracing::info!(username, "deleted user");
        Ok(())
    }

    /// Change a user's role. The last admin cannot be demoted.
    pub fn update_role(&self, username: &str, role: Role) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let _guard = self.backend.lock(&self.paths.users)?;
        state.users = read_users(self.backend.as_ref(), &self.paths.users)?;

        let is_last_admin = {
            let target = state
                .users
                .iter()
                .find(|u| u.username == username)
                .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
            target.role == Role::Admin && count_admins(&state.users) == 1
        };
        if is_last_admin && role != Role::Admin {
            return Err(StoreError::LastAdminProtected(username.to_string()));
        }

        let user = state
            .users
            .iter_mut()
            .find(|u| u.username == username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        user.role = role;
        self.persist(&state.users)?;
        tracing::info!(username, role = %role, "updated user role");
        Ok(())
    }

    /// Usernames, roles, and rotation instants. Token hashes stay private.
    pub fn list_users(&self) -> Vec<(String, Role, Option<DateTime<Utc>>)> {
        let state = self.state.read().unwrap();
        let mut users: Vec<_> = state
            .users
            .iter()
            .map(|u| (u.username.clone(), u.role, u.token_rotated_at))
            .collect();
        users.sort_by(|a, b| a.0.cmp(&b.0));
        users
    }

    fn persist(&self, users: &[UserRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(users).map_err(|e| StoreError::Storage {
            path: self.paths.users.clone(),
            detail: e.to_string(),
        })?;
        self.backend
            .atomic_write(&self.paths.users, json.as_bytes(), SECRET_FILE_MODE)
    }
}

fn count_admins(users: &[UserRecord]) -> usize {
    users.iter().filter(|u| u.role == Role::Admin).count()
}

fn read_users(backend: &dyn Backend, path: &Path) -> Result<Vec<UserRecord>> {
    let data = backend.read(path)?;
    serde_json::from_slice(&data).map_err(|e| StoreError::DatabaseCorrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Write a fresh user list (first-run installation path).
pub(crate) fn write_users(
    backend: &dyn Backend,
    path: &Path,
    users: &[UserRecord],
) -> Result<()> {
    let json = serde_json::to_string_pretty(users).map_err(|e| StoreError::Storage {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    backend.atomic_write(path, json.as_bytes(), SECRET_FILE_MODE)
}

/// Build a user record from a freshly generated token, returning both.
pub(crate) fn new_user_record(username: &str, role: Role) -> Result<(UserRecord, String)> {
    let raw = generate_token()?;
    Ok((
        UserRecord {
            username: username.to_string(),
            token_hash: hash_token(&raw),
            role,
            token_rotated_at: None,
        },
        raw,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    fn gate_with_admin() -> (AccessGate, String) {
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new());
        let paths = Paths::new("/store");
        let (admin, token) = new_user_record("admin", Role::Admin).unwrap();
        write_users(backend.as_ref(), &paths.users, &[admin]).unwrap();
        backend
            .atomic_write(
                &paths.roles,
                serde_json::to_vec(&default_role_permissions())
                    .unwrap()
                    .as_slice(),
                0o600,
            )
            .unwrap();
        (AccessGate::load(paths, backend).unwrap(), token)
    }

    #[test]
    fn token_hash_is_stable_and_padless() {
        let h1 = hash_token("some-token");
        let h2 = hash_token("some-token");
        assert_eq!(h1, h2);
        assert!(!h1.contains('='));
        assert_ne!(h1, hash_token("other-token"));
    }

    #[test]
    fn lookup_accepts_valid_and_rejects_invalid() {
        let (gate, token) = gate_with_admin();
        assert_eq!(gate.lookup(&token).unwrap().username, "admin");
        assert!(matches!(gate.lookup("wrong"), Err(StoreError::InvalidToken)));
        assert!(matches!(gate.lookup(""), Err(StoreError::EmptyToken)));
    }

    #[test]
    fn rbac_default_mapping() {
        let (gate, admin_token) = gate_with_admin();
        let reader_token = gate.create_user("alice", Role::Reader).unwrap();

        let admin = gate.lookup(&admin_token).unwrap();
        let reader = gate.lookup(&reader_token).unwrap();

        assert!(gate.can(&admin, Permission::Write));
        assert!(gate.can(&admin, Permission::ManageUsers));
        assert!(gate.can(&admin, Permission::Read));
        assert!(!gate.can(&reader, Permission::Write));
        assert!(!gate.can(&reader, Permission::ManageUsers));
        assert!(gate.can(&reader, Permission::Read));
        assert!(gate.can(&reader, Permission::RotateOwnToken));
    }

    #[test]
    fn require_reports_role_and_permission() {
        let (gate, _admin_token) = gate_with_admin();
        let reader_token = gate.create_user("bob", Role::Reader).unwrap();
        let err = gate.require(&reader_token, Permission::Write).unwrap_err();
        assert!(matches!(err, StoreError::PermissionDeniedRole { .. }));
    }

    #[test]
    fn duplicate_username_rejected() {
        let (gate, _token) = gate_with_admin();
        gate.create_user("alice", Role::Reader).unwrap();
        assert!(matches!(
            gate.create_user("alice", Role::Reader),
            Err(StoreError::DuplicateUsername(_))
        ));
    }

    #[test]
    fn last_admin_protected() {
        let (gate, _token) = gate_with_admin();
        assert!(matches!(
            gate.delete_user("admin"),
            Err(StoreError::LastAdminProtected(_))
        ));
        assert!(matches!(
            gate.update_role("admin", Role::Reader),
            Err(StoreError::LastAdminProtected(_))
        ));

        // A second admin lifts the protection.
        gate.create_user("root2", Role::Admin).unwrap();
        gate.update_role("admin", Role::Reader).unwrap();
        assert!(matches!(
            gate.delete_user("root2"),
            Err(StoreError::LastAdminProtected(_))
        ));
    }

    #[test]
    fn rotate_token_invalidates_old() {
        let (gate, admin_token) = gate_with_admin();
        let new_token = gate.rotate_token("admin").unwrap();
        assert_ne!(admin_token, new_token);
        assert!(matches!(
            gate.lookup(&admin_token),
            Err(StoreError::InvalidToken)
        ));
        let user = gate.lookup(&new_token).unwrap();
        assert!(user.token_rotated_at.is_some());
    }

    #[test]
    fn load_without_admin_fails() {
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new());
        let paths = Paths::new("/store");
        let (reader, _token) = new_user_record("alice", Role::Reader).unwrap();
        write_users(backend.as_ref(), &paths.users, &[reader]).unwrap();
        assert!(matches!(
            AccessGate::load(paths, backend),
            Err(StoreError::NoAdmin)
        ));
    }

    #[test]
    fn role_parsing() {
        assert_eq!(Role::parse("admin").unwrap(), Role::Admin);
        assert_eq!(Role::parse("reader").unwrap(), Role::Reader);
        assert!(matches!(
            Role::parse("superuser"),
            Err(StoreError::InvalidRole(_))
        ));
    }
}
