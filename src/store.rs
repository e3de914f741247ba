//! Secret database: an encrypted key/value map persisted as one JSON object.
//!
//! Lock discipline for every mutation: take the in-process writer lock, then
//! the cross-process file lock, re-read the on-disk database and merge it in
//! (disk wins on conflicts), apply the change, persist atomically, release.
//! The in-process lock is always taken first to avoid deadlocks between
//! threads waiting on the file lock and threads holding it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::backend::Backend;
use crate::config::{ConfigFile, Paths};
use crate::envelope::{self, KEY_BYTES};
use crate::error::{Result, StoreError};
use crate::fsio::{SECRET_DIR_MODE, SECRET_FILE_MODE};
use crate::keyfile;

/// On-disk marker prefix for disabled secrets. The persistence schema has no
/// per-entry metadata column, so a disabled secret lives under a synthetic
/// key that encodes the original key and the disable time.
pub const DISABLED_PREFIX: &str = "__DISABLED_";

// ---------------------------------------------------------------------------
// Disabled markers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct DisabledMarker {
    timestamp: i64,
    key: String,
}

fn synthetic_key_for(key: &str) -> String {
    let marker = DisabledMarker {
        timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        key: key.to_string(),
    };
    // Serializing a two-field struct of primitives cannot fail.
    let json = serde_json::to_string(&marker).unwrap_or_default();
    format!("{}{}", DISABLED_PREFIX, json)
}

/// Extract the original key from a synthetic entry.
///
/// The primary form embeds compact JSON; the legacy form is
/// `<timestamp>_<original-key>`. Fresh installs write only the JSON form but
/// both are read to stay compatible with existing on-disk state.
pub(crate) fn parse_disabled(synthetic: &str) -> Option<String> {
    let rest = synthetic.strip_prefix(DISABLED_PREFIX)?;
    if let Ok(marker) = serde_json::from_str::<DisabledMarker>(rest) {
        return Some(marker.key);
    }
    rest.split_once('_').map(|(_, key)| key.to_string())
}

// ---------------------------------------------------------------------------
// Secret store
// ---------------------------------------------------------------------------

pub(crate) struct StoreState {
    pub(crate) master_key: Zeroizing<[u8; KEY_BYTES]>,
    pub(crate) entries: HashMap<String, String>,
}

/// The encrypted store: master key plus envelope map, file-backed.
pub struct SecretStore {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) paths: Paths,
    pub(crate) rotation_backup_count: usize,
    pub(crate) state: RwLock<StoreState>,
}

impl SecretStore {
    /// Open the store at `paths`, creating the config root and master key on
    /// first use.
    pub fn open(paths: Paths, backend: Arc<dyn Backend>) -> Result<Self> {
        backend.create_dir_all(&paths.root, SECRET_DIR_MODE)?;

        let master_key = keyfile::load_or_create(backend.as_ref(), &paths.master_key)?;
        let entries = load_db(backend.as_ref(), &paths)?;
        let config = ConfigFile::load(backend.as_ref(), &paths.config);

        Ok(Self {
            backend,
            paths,
            rotation_backup_count: config.rotation_backup_count(),
            state: RwLock::new(StoreState {
                master_key,
                entries,
            }),
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Decrypt and return the secret stored under `key`.
    pub fn get(&self, key: &str) -> Result<String> {
        let state = self.state.read().unwrap();
        let env = state
            .entries
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let plaintext = envelope::decrypt(&state.master_key, env)?;
        String::from_utf8(plaintext).map_err(|_| StoreError::DecryptionFailed)
    }

    /// Enabled keys, sorted lexicographically.
    pub fn list_keys(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| !k.starts_with(DISABLED_PREFIX))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Original keys of all disabled secrets, sorted.
    pub fn list_disabled(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(DISABLED_PREFIX))
            .filter_map(|k| parse_disabled(k))
            .collect();
        keys.sort();
        keys
    }

    /// True iff `key` is present in enabled form.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.state.read().unwrap().entries.contains_key(key)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Store `value` under `key`, backing up any previous envelope first.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        let mut state = self.state.write().unwrap();
        let env = envelope::encrypt(&state.master_key, value.as_bytes())?;

        let _guard = self.backend.lock(&self.paths.secrets_db)?;
        self.merge_from_disk(&mut state.entries)?;

        if let Some(prev) = state.entries.get(key) {
            self.write_bak(key, prev)?;
        }
        state.entries.insert(key.to_string(), env);
        self.persist(&state.entries)?;
        tracing::info!(key, "stored secret");
        Ok(())
    }

    /// Remove `key`, backing up its envelope.
    pub fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let mut state = self.state.write().unwrap();

        let _guard = self.backend.lock(&self.paths.secrets_db)?;
        self.merge_from_disk(&mut state.entries)?;

        let env = state
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        self.write_bak(key, &env)?;
        state.entries.remove(key);
        self.persist(&state.entries)?;
        tracing::info!(key, "deleted secret");
        Ok(())
    }

    /// Move `key` under its synthetic disabled marker. The envelope is
    /// unchanged; only the map key moves.
    pub fn disable(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let mut state = self.state.write().unwrap();

        let _guard = self.backend.lock(&self.paths.secrets_db)?;
        self.merge_from_disk(&mut state.entries)?;

        let env = state
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        self.write_bak(key, &env)?;
        state.entries.remove(key);
        state.entries.insert(synthetic_key_for(key), env);
        self.persist(&state.entries)?;
        tracing::info!(key, "disabled secret");
        Ok(())
    }

    /// Move a disabled secret back to its original key.
    pub fn enable(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let mut state = self.state.write().unwrap();

        let _guard = self.backend.lock(&self.paths.secrets_db)?;
        self.merge_from_disk(&mut state.entries)?;

        let synthetic = state
            .entries
            .keys()
            .filter(|k| k.starts_with(DISABLED_PREFIX))
            .find(|k| parse_disabled(k).as_deref() == Some(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let env = state.entries.remove(&synthetic).unwrap_or_default();
        state.entries.insert(key.to_string(), env);
        self.persist(&state.entries)?;
        tracing::info!(key, "enabled secret");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence helpers
    // -----------------------------------------------------------------------

    /// Fold the on-disk map into `entries`; disk wins on conflicting keys.
    /// This keeps a concurrent writer in another process from being silently
    /// overwritten by an older in-memory state.
    pub(crate) fn merge_from_disk(&self, entries: &mut HashMap<String, String>) -> Result<()> {
        let disk = load_db(self.backend.as_ref(), &self.paths)?;
        for (key, env) in disk {
            entries.insert(key, env);
        }
        Ok(())
    }

    pub(crate) fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries).map_err(|e| StoreError::Storage {
            path: self.paths.secrets_db.clone(),
            detail: e.to_string(),
        })?;
        self.backend
            .atomic_write(&self.paths.secrets_db, json.as_bytes(), SECRET_FILE_MODE)
    }

    /// Copy the pre-mutation envelope to `<backups>/<key>.bak`.
    fn write_bak(&self, key: &str, env: &str) -> Result<()> {
        self.backend
            .create_dir_all(&self.paths.backups, SECRET_DIR_MODE)?;
        let path = self.paths.backups.join(bak_file_name(key));
        self.backend.write(&path, env.as_bytes(), SECRET_FILE_MODE)
    }
}

// ---------------------------------------------------------------------------
// Key validation and .bak name derivation
// ---------------------------------------------------------------------------

/// Secrets may use almost any textual key (including `/`), but a few names
/// cannot exist in the map or be derived into a backup filename.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('\0') || key.starts_with(DISABLED_PREFIX) {
        return Err(StoreError::UnsafeSecretKey(key.to_string()));
    }
    Ok(())
}

/// Backup filename for a secret key. Path separators are percent-encoded so
/// a key like `../etc/passwd` can never escape the backup directory.
pub(crate) fn bak_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        match ch {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '\\' => name.push_str("%5C"),
            _ => name.push(ch),
        }
    }
    format!("{}.bak", name)
}

fn load_db(backend: &dyn Backend, paths: &Paths) -> Result<HashMap<String, String>> {
    if !backend.exists(&paths.secrets_db) {
        return Ok(HashMap::new());
    }
    let data = backend.read(&paths.secrets_db)?;
    serde_json::from_slice(&data).map_err(|e| StoreError::DatabaseCorrupt {
        path: paths.secrets_db.clone(),
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;
    use std::path::PathBuf;

    fn test_store() -> SecretStore {
        let backend = Arc::new(MemBackend::new());
        SecretStore::open(Paths::new("/store"), backend).unwrap()
    }

    fn bak_path(paths: &Paths, key: &str) -> PathBuf {
        paths.backups.join(bak_file_name(key))
    }

    // === Round trips ===

    #[test]
    fn put_get_roundtrip() {
        let store = test_store();
        store.put("db/pass", "p@ss").unwrap();
        assert_eq!(store.get("db/pass").unwrap(), "p@ss");
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(store.get("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn put_overwrites_and_backs_up_previous() {
        let store = test_store();
        store.put("api", "v1").unwrap();
        store.put("api", "v2").unwrap();
        assert_eq!(store.get("api").unwrap(), "v2");

        // The .bak holds the previous envelope, which still decrypts to v1.
        let bak = store
            .backend
            .read(&bak_path(&store.paths, "api"))
            .unwrap();
        let state = store.state.read().unwrap();
        let prev = envelope::decrypt(&state.master_key, &String::from_utf8(bak).unwrap()).unwrap();
        assert_eq!(prev, b"v1");
    }

    #[test]
    fn delete_removes_and_backs_up() {
        let store = test_store();
        store.put("gone", "soon").unwrap();
        store.delete("gone").unwrap();
        assert!(matches!(store.get("gone"), Err(StoreError::NotFound(_))));
        assert!(store.backend.exists(&bak_path(&store.paths, "gone")));
        assert!(matches!(store.delete("gone"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_keys_sorted_and_excludes_disabled() {
        let store = test_store();
        store.put("b", "2").unwrap();
        store.put("a", "1").unwrap();
        store.put("c", "3").unwrap();
        store.disable("b").unwrap();
        assert_eq!(store.list_keys(), vec!["a", "c"]);
    }

    // === Disable / enable ===

    #[test]
    fn disable_enable_roundtrip() {
        let store = test_store();
        store.put("k", "v").unwrap();

        store.disable("k").unwrap();
        assert!(matches!(store.get("k"), Err(StoreError::NotFound(_))));
        assert!(!store.is_enabled("k"));
        assert_eq!(store.list_disabled(), vec!["k"]);

        store.enable("k").unwrap();
        assert_eq!(store.get("k").unwrap(), "v");
        assert!(store.is_enabled("k"));
        assert!(store.list_disabled().is_empty());
    }

    #[test]
    fn disable_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(store.disable("x"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.enable("x"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn disabled_marker_is_compact_json() {
        let synthetic = synthetic_key_for("db/user");
        let rest = synthetic.strip_prefix(DISABLED_PREFIX).unwrap();
        let marker: DisabledMarker = serde_json::from_str(rest).unwrap();
        assert_eq!(marker.key, "db/user");
        assert!(marker.timestamp > 0);
    }

    #[test]
    fn parse_disabled_reads_legacy_form() {
        assert_eq!(
            parse_disabled("__DISABLED_1700000000000000000_db_user").as_deref(),
            Some("db_user")
        );
        assert_eq!(
            parse_disabled(&synthetic_key_for("json-form")).as_deref(),
            Some("json-form")
        );
        assert_eq!(parse_disabled("__DISABLED_garbage"), None);
        assert_eq!(parse_disabled("plain-key"), None);
    }

    // === Key validation and .bak derivation ===

    #[test]
    fn bak_names_never_escape_backup_dir() {
        for key in ["../etc/passwd", "a/b", "..\\windows", "%2F"] {
            let name = bak_file_name(key);
            assert!(!name.contains('/'), "{:?} escaped: {:?}", key, name);
            assert!(!name.contains('\\'), "{:?} escaped: {:?}", key, name);
        }
        // Encoding is injective for the separator set.
        assert_ne!(bak_file_name("a/b"), bak_file_name("a%2Fb"));
    }

    #[test]
    fn traversal_key_stays_inside_store() {
        let store = test_store();
        store.put("../etc/passwd", "x").unwrap();
        assert_eq!(store.get("../etc/passwd").unwrap(), "x");
        store.put("../etc/passwd", "y").unwrap();

        let bak = bak_path(&store.paths, "../etc/passwd");
        assert!(bak.starts_with(&store.paths.backups));
        assert!(store.backend.exists(&bak));
    }

    #[test]
    fn reserved_and_empty_keys_rejected() {
        let store = test_store();
        assert!(matches!(
            store.put("", "v"),
            Err(StoreError::UnsafeSecretKey(_))
        ));
        assert!(matches!(
            store.put("__DISABLED_sneaky", "v"),
            Err(StoreError::UnsafeSecretKey(_))
        ));
        assert!(matches!(
            store.put("nul\0key", "v"),
            Err(StoreError::UnsafeSecretKey(_))
        ));
    }

    // === Merge-on-write ===

    #[test]
    fn merge_prefers_disk_on_conflict() {
        let backend = Arc::new(MemBackend::new());
        let shared: Arc<dyn crate::backend::Backend> = backend;
        let store_a = SecretStore::open(Paths::new("/store"), Arc::clone(&shared)).unwrap();
        let store_b = SecretStore::open(Paths::new("/store"), shared).unwrap();

        store_a.put("shared", "from-a").unwrap();
        // B's stale in-memory state must not clobber A's persisted write.
        store_b.put("other", "from-b").unwrap();

        assert_eq!(store_b.get("shared").unwrap(), "from-a");
        assert_eq!(store_b.get("other").unwrap(), "from-b");
    }

    // === Corruption ===

    #[test]
    fn corrupt_db_fails_load() {
        let backend = Arc::new(MemBackend::new());
        let paths = Paths::new("/store");
        backend
            .write(&paths.secrets_db, b"{broken json", 0o600)
            .unwrap();
        let result = SecretStore::open(paths, backend);
        assert!(matches!(result, Err(StoreError::DatabaseCorrupt { .. })));
    }
}
