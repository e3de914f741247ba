//! Rotation and backup engine: snapshots, master-key rotation, restore, prune.
//!
//! Rotation re-encrypts every stored envelope under a freshly generated key.
//! A snapshot of the key file and database is taken before any cryptographic
//! work so the operator can always recover; the two-file swap itself renames
//! the key first and the database second, with a best-effort key rollback if
//! the second rename fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use zeroize::Zeroizing;

use crate::envelope;
use crate::error::{Result, StoreError};
use crate::fsio::{SECRET_DIR_MODE, SECRET_FILE_MODE};
use crate::keyfile;
use crate::store::SecretStore;

/// Snapshot directory prefixes.
pub const SNAPSHOT_ROTATE: &str = "rotate";
pub const SNAPSHOT_MANUAL: &str = "manual";
pub const SNAPSHOT_PRE_RESTORE: &str = "pre-restore";

const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

// ---------------------------------------------------------------------------
// Backup descriptors
// ---------------------------------------------------------------------------

/// A discovered snapshot directory.
#[derive(Clone, Debug)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
    /// True iff both `master.key` and `secrets.json` exist inside.
    pub intact: bool,
}

fn parse_snapshot_name(name: &str) -> Option<NaiveDateTime> {
    let suffix = [SNAPSHOT_ROTATE, SNAPSHOT_MANUAL, SNAPSHOT_PRE_RESTORE]
        .iter()
        .find_map(|prefix| name.strip_prefix(&format!("{}-", prefix)))?;
    NaiveDateTime::parse_from_str(suffix, SNAPSHOT_TIMESTAMP_FORMAT).ok()
}

fn snapshot_dir_name(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix,
        chrono::Local::now().format(SNAPSHOT_TIMESTAMP_FORMAT)
    )
}

impl SecretStore {
    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Copy the key file and database into `dir`. A missing source file is
    /// not an error; the snapshot simply omits it.
    fn take_snapshot(&self, dir: &Path) -> Result<()> {
        self.backend.create_dir_all(dir, SECRET_DIR_MODE)?;
        for source in [&self.paths.master_key, &self.paths.secrets_db] {
            if !self.backend.exists(source) {
                continue;
            }
            let data = self.backend.read(source)?;
            let name = source.file_name().unwrap_or_default();
            self.backend
                .write(&dir.join(name), &data, SECRET_FILE_MODE)?;
        }
        Ok(())
    }

    /// Operator-initiated snapshot (`manual-` prefix). Taken under the full
    /// write-lock discipline so the copied pair is consistent.
    pub fn snapshot_now(&self) -> Result<PathBuf> {
        let _state = self.state.write().unwrap();
        let _guard = self.backend.lock(&self.paths.secrets_db)?;

        let dir = self.paths.backups.join(snapshot_dir_name(SNAPSHOT_MANUAL));
        self.take_snapshot(&dir)?;
        tracing::info!(snapshot = %dir.display(), "took manual snapshot");
        Ok(dir)
    }

    /// Enumerate snapshot directories under `backups/`, newest first.
    /// Entries whose timestamp suffix does not parse are skipped.
    pub fn list_rotation_backups(&self) -> Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        for entry in self.backend.list_dir(&self.paths.backups)? {
            if !self.backend.is_dir(&entry) {
                continue;
            }
            let name = match entry.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let timestamp = match parse_snapshot_name(&name) {
                Some(ts) => ts,
                None => continue,
            };
            let intact = self.backend.exists(&entry.join("master.key"))
                && self.backend.exists(&entry.join("secrets.json"));
            backups.push(BackupInfo {
                name,
                path: entry,
                timestamp,
                intact,
            });
        }
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    // -----------------------------------------------------------------------
    // Master-key rotation
    // -----------------------------------------------------------------------

    /// Rotate the master key, re-encrypting every stored envelope.
    ///
    /// Returns the snapshot directory taken before any re-encryption. When
    /// `snapshot_dir` is supplied it is used verbatim; otherwise a fresh
    /// `rotate-` snapshot is generated under `backups/`.
    pub fn rotate_master_key(&self, snapshot_dir: Option<&Path>) -> Result<PathBuf> {
        let mut state = self.state.write().unwrap();
        let _guard = self.backend.lock(&self.paths.secrets_db)?;
        self.merge_from_disk(&mut state.entries)?;

        let snapshot = match snapshot_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.paths.backups.join(snapshot_dir_name(SNAPSHOT_ROTATE)),
        };
        self.take_snapshot(&snapshot)?;

        let old_key = state.master_key.clone();

        // Precheck: every envelope must open under the current key before
        // anything on disk changes.
        let mut plaintexts: HashMap<String, Zeroizing<Vec<u8>>> = HashMap::new();
        for (key, env) in &state.entries {
            let plaintext = envelope::decrypt(&old_key, env)
                .map_err(|_| StoreError::RotationPrecheckFailed { key: key.clone() })?;
            plaintexts.insert(key.clone(), Zeroizing::new(plaintext));
        }

        let new_key = Zeroizing::new(envelope::generate_key()?);

        let mut new_entries: HashMap<String, String> = HashMap::new();
        for (key, plaintext) in &plaintexts {
            new_entries.insert(key.clone(), envelope::encrypt(&new_key, plaintext)?);
        }

        let json =
            serde_json::to_string_pretty(&new_entries).map_err(|e| StoreError::Storage {
                path: self.paths.secrets_db.clone(),
                detail: e.to_string(),
            })?;

        // Two-file swap: stage both temps, rename key first, database second.
        let db_tmp = tmp_sibling(&self.paths.secrets_db);
        let key_tmp = tmp_sibling(&self.paths.master_key);

        let staged = self
            .backend
            .write(&db_tmp, json.as_bytes(), SECRET_FILE_MODE)
            .and_then(|_| {
                self.backend.write(
                    &key_tmp,
                    keyfile::encode_key(&new_key).as_bytes(),
                    SECRET_FILE_MODE,
                )
            });
        if let Err(err) = staged {
            let _ = self.backend.remove_file(&db_tmp);
            let _ = self.backend.remove_file(&key_tmp);
            return Err(err);
        }

        if let Err(err) = self.backend.rename(&key_tmp, &self.paths.master_key) {
            let _ = self.backend.remove_file(&key_tmp);
            let _ = self.backend.remove_file(&db_tmp);
            return Err(StoreError::RotationSwapFailed(format!(
                "key file swap: {}",
                err
            )));
        }

        if let Err(err) = self.backend.rename(&db_tmp, &self.paths.secrets_db) {
            // The key already changed on disk; put the old one back so the
            // pair stays consistent. The snapshot remains the authoritative
            // recovery source either way.
            if let Err(rollback) = self.backend.write(
                &self.paths.master_key,
                keyfile::encode_key(&old_key).as_bytes(),
                SECRET_FILE_MODE,
            ) {
                tracing::warn!(
                    error = %rollback,
                    snapshot = %snapshot.display(),
                    "key rollback failed; recover from snapshot"
                );
            }
            let _ = self.backend.remove_file(&db_tmp);
            return Err(StoreError::RotationSwapFailed(format!(
                "database swap: {}",
                err
            )));
        }

        state.master_key = new_key.clone();
        state.entries = new_entries;
        tracing::info!(snapshot = %snapshot.display(), "rotated master key");

        // Post-commit housekeeping is best-effort: failures are logged and
        // never fail the rotation.
        self.reencrypt_bak_files(&old_key, &new_key);
        self.prune_rotation_snapshots();

        Ok(snapshot)
    }

    /// Re-encrypt per-secret `.bak` files under the new key. Files that do
    /// not open under the old key belong to an older generation and are left
    /// untouched.
    fn reencrypt_bak_files(&self, old_key: &[u8; 32], new_key: &[u8; 32]) {
        let entries = match self.backend.list_dir(&self.paths.backups) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "could not scan backup dir after rotation");
                return;
            }
        };

        for path in entries {
            if self.backend.is_dir(&path)
                || path.extension().and_then(|e| e.to_str()) != Some("bak")
            {
                continue;
            }
            let env = match self
                .backend
                .read(&path)
                .ok()
                .and_then(|data| String::from_utf8(data).ok())
            {
                Some(env) => env,
                None => continue,
            };
            let plaintext = match envelope::decrypt(old_key, &env) {
                Ok(plaintext) => Zeroizing::new(plaintext),
                Err(_) => continue,
            };
            let rewrapped = match envelope::encrypt(new_key, &plaintext) {
                Ok(rewrapped) => rewrapped,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "bak re-encrypt failed");
                    continue;
                }
            };
            if let Err(err) = self
                .backend
                .write(&path, rewrapped.as_bytes(), SECRET_FILE_MODE)
            {
                tracing::warn!(path = %path.display(), error = %err, "bak rewrite failed");
            }
        }
    }

    /// Retention: keep the N newest `rotate-` snapshots, delete the rest.
    /// Manual and pre-restore snapshots are never pruned automatically.
    fn prune_rotation_snapshots(&self) {
        let backups = match self.list_rotation_backups() {
            Ok(backups) => backups,
            Err(err) => {
                tracing::warn!(error = %err, "could not enumerate snapshots for pruning");
                return;
            }
        };

        let stale = backups
            .iter()
            .filter(|b| b.name.starts_with(&format!("{}-", SNAPSHOT_ROTATE)))
            .skip(self.rotation_backup_count);
        for backup in stale {
            match self.backend.remove_dir_all(&backup.path) {
                Ok(()) => tracing::info!(snapshot = %backup.name, "pruned old snapshot"),
                Err(err) => {
                    tracing::warn!(snapshot = %backup.name, error = %err, "prune failed")
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    /// Restore the key file and database from a snapshot, taking a
    /// `pre-restore-` snapshot of the current state first. With no name the
    /// newest intact backup is chosen.
    pub fn restore_from_backup(&self, name: Option<&str>) -> Result<String> {
        let mut state = self.state.write().unwrap();
        let _guard = self.backend.lock(&self.paths.secrets_db)?;

        let chosen = match name.filter(|n| !n.is_empty()) {
            None => self
                .list_rotation_backups()?
                .into_iter()
                .find(|b| b.intact)
                .ok_or(StoreError::NoBackupAvailable)?,
            Some(name) => {
                let path = self.paths.backups.join(name);
                if !self.backend.is_dir(&path) {
                    return Err(StoreError::BackupNotFound(name.to_string()));
                }
                if !self.backend.exists(&path.join("master.key"))
                    || !self.backend.exists(&path.join("secrets.json"))
                {
                    return Err(StoreError::BackupMissingFiles(name.to_string()));
                }
                BackupInfo {
                    name: name.to_string(),
                    path,
                    timestamp: NaiveDateTime::default(),
                    intact: true,
                }
            }
        };

        let pre = self
            .paths
            .backups
            .join(snapshot_dir_name(SNAPSHOT_PRE_RESTORE));
        self.take_snapshot(&pre)?;

        let key_data = self.backend.read(&chosen.path.join("master.key"))?;
        let db_data = self.backend.read(&chosen.path.join("secrets.json"))?;
        self.backend
            .atomic_write(&self.paths.master_key, &key_data, SECRET_FILE_MODE)?;
        self.backend
            .atomic_write(&self.paths.secrets_db, &db_data, SECRET_FILE_MODE)?;

        // Reload in-memory state from what was just written.
        let text = String::from_utf8(key_data)
            .map_err(|_| StoreError::CorruptKeyFile(self.paths.master_key.clone()))?;
        state.master_key = keyfile::decode_key(&self.paths.master_key, &text)?;
        state.entries =
            serde_json::from_slice(&db_data).map_err(|e| StoreError::DatabaseCorrupt {
                path: self.paths.secrets_db.clone(),
                detail: e.to_string(),
            })?;

        tracing::info!(backup = %chosen.name, "restored from backup");
        Ok(chosen.name)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_parse() {
        assert!(parse_snapshot_name("rotate-20260801-093015").is_some());
        assert!(parse_snapshot_name("manual-20260801-093015").is_some());
        assert!(parse_snapshot_name("pre-restore-20260801-093015").is_some());
        assert!(parse_snapshot_name("rotate-garbage").is_none());
        assert!(parse_snapshot_name("other-20260801-093015").is_none());
        assert!(parse_snapshot_name("rotate-20261301-093015").is_none());
    }

    #[test]
    fn generated_names_roundtrip() {
        let name = snapshot_dir_name(SNAPSHOT_ROTATE);
        assert!(parse_snapshot_name(&name).is_some());
    }
}
