//! # simple-secrets
//!
//! Encrypted, file-backed secrets store for a single host.
//!
//! Secrets are sealed one-by-one in AES-256-GCM envelopes and persisted as a
//! single JSON object next to the base64-encoded master key. Mutations are
//! crash-safe (temp file plus rename) and serialized across processes by an
//! advisory file lock. The master key can be rotated in place: a snapshot of
//! the key and database is taken first, every envelope is re-encrypted under
//! a fresh key, and the two files are swapped key-first with a best-effort
//! rollback. Access is gated by bearer tokens whose SHA-256 hashes map to
//! `admin`/`reader` roles.
//!
//! ## Quick Start
//!
//! ```no_run
//! use simple_secrets::{AccessGate, HostFs, Paths, Permission, SecretStore};
//! use std::sync::Arc;
//!
//! let paths = Paths::new("/var/lib/simple-secrets");
//! let backend = Arc::new(HostFs::new());
//!
//! let token = simple_secrets::initialize(backend.as_ref(), &paths).unwrap();
//! let gate = AccessGate::load(paths.clone(), backend.clone()).unwrap();
//! gate.require(&token, Permission::Write).unwrap();
//!
//! let store = SecretStore::open(paths, backend).unwrap();
//! store.put("db/password", "hunter2").unwrap();
//! assert_eq!(store.get("db/password").unwrap(), "hunter2");
//! ```
//!
//! ## What's NOT Provided
//!
//! - Multi-host replication or network protocols
//! - Secret versioning beyond the single most-recent backup per key
//! - HSM integration
//! - Streaming or large-object secrets

#![deny(unsafe_code)]

pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fsio;
pub mod keyfile;
pub mod rotation;
pub mod setup;
pub mod store;

// Re-export the main types for convenience
pub use auth::{default_role_permissions, AccessGate, Permission, Role, UserRecord};
pub use backend::{Backend, HostFs, MemBackend};
pub use config::{resolve_token, ConfigFile, Paths, CONFIG_DIR_ENV, TOKEN_ENV};
pub use error::{Result, StoreError};
pub use fsio::{atomic_write, FileLock};
pub use rotation::BackupInfo;
pub use setup::{initialize, install_state, InstallState};
pub use store::{SecretStore, DISABLED_PREFIX};
