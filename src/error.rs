//! Error types for the secrets store.

use std::fmt;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Top-level store error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    // Crypto
    DecryptionFailed,
    RandomnessFailure,
    CorruptKeyFile(PathBuf),

    // Storage
    DatabaseCorrupt { path: PathBuf, detail: String },
    NotFound(String),
    AlreadyExists(String),
    AtomicWriteFailed { path: PathBuf, detail: String },
    LockTimeout(PathBuf),
    PermissionDenied(PathBuf),
    Storage { path: PathBuf, detail: String },
    UnsafeSecretKey(String),

    // Auth
    EmptyToken,
    InvalidToken,
    AuthRequired,
    PermissionDeniedRole { role: String, permission: String },

    // User management
    DuplicateUsername(String),
    NoAdmin,
    LastAdminProtected(String),
    InvalidRole(String),

    // Rotation / backup
    RotationPrecheckFailed { key: String },
    RotationSwapFailed(String),
    NoBackupAvailable,
    BackupNotFound(String),
    BackupMissingFiles(String),

    // Lifecycle
    FirstRunRequired,
    BrokenInstallation(PathBuf),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::RandomnessFailure => write!(f, "system randomness unavailable"),
            Self::CorruptKeyFile(path) => {
                write!(f, "master key file {} is corrupt", path.display())
            }
            Self::DatabaseCorrupt { path, detail } => write!(
                f,
                "secret database {} is corrupt ({}); restore it from a snapshot under backups/",
                path.display(),
                detail
            ),
            Self::NotFound(name) => write!(f, "not found: {}", name),
            Self::AlreadyExists(key) => write!(f, "secret already exists: {}", key),
            Self::AtomicWriteFailed { path, detail } => {
                write!(f, "atomic write to {} failed: {}", path.display(), detail)
            }
            Self::LockTimeout(path) => {
                write!(f, "timed out waiting for lock on {}", path.display())
            }
            Self::PermissionDenied(path) => {
                write!(f, "permission denied: {}", path.display())
            }
            Self::Storage { path, detail } => {
                write!(f, "storage error at {}: {}", path.display(), detail)
            }
            Self::UnsafeSecretKey(key) => write!(
                f,
                "secret key {:?} cannot be mapped to a safe backup filename",
                key
            ),
            Self::EmptyToken => write!(f, "empty token"),
            Self::InvalidToken => write!(f, "invalid token"),
            Self::AuthRequired => write!(
                f,
                "no token supplied; pass --token, set SIMPLE_SECRETS_TOKEN, or add \"token\" to config.json"
            ),
            Self::PermissionDeniedRole { role, permission } => {
                write!(f, "role {} lacks permission {}", role, permission)
            }
            Self::DuplicateUsername(name) => write!(f, "username already taken: {}", name),
            Self::NoAdmin => write!(f, "user database contains no admin user"),
            Self::LastAdminProtected(name) => {
                write!(f, "{} is the last admin and cannot be removed or demoted", name)
            }
            Self::InvalidRole(role) => write!(f, "unknown role: {}", role),
            Self::RotationPrecheckFailed { key } => write!(
                f,
                "rotation precheck failed: secret {} does not decrypt under the current master key",
                key
            ),
            Self::RotationSwapFailed(detail) => {
                write!(f, "rotation swap failed: {}", detail)
            }
            Self::NoBackupAvailable => write!(f, "no rotation backup available"),
            Self::BackupNotFound(name) => write!(f, "backup not found: {}", name),
            Self::BackupMissingFiles(name) => {
                write!(f, "backup {} is missing master.key or secrets.json", name)
            }
            Self::FirstRunRequired => {
                write!(f, "store is not initialized; run `simple-secrets init` first")
            }
            Self::BrokenInstallation(root) => write!(
                f,
                "{} holds store files but no users.json; refusing to overwrite a partial installation",
                root.display()
            ),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// Map an I/O failure on `path` into the storage taxonomy.
    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(path.to_path_buf())
        } else {
            Self::Storage {
                path: path.to_path_buf(),
                detail: err.to_string(),
            }
        }
    }
}
