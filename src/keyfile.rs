//! Master key file: base64 of 32 raw bytes, created on first access.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use zeroize::Zeroizing;

use crate::backend::Backend;
use crate::envelope::{self, KEY_BYTES};
use crate::error::{Result, StoreError};
use crate::fsio::SECRET_FILE_MODE;

/// Text form written to disk: base64 of the raw key, no trailing whitespace.
pub fn encode_key(key: &[u8; KEY_BYTES]) -> String {
    BASE64.encode(key)
}

pub fn decode_key(path: &Path, text: &str) -> Result<Zeroizing<[u8; KEY_BYTES]>> {
    let raw = BASE64
        .decode(text.trim())
        .map_err(|_| StoreError::CorruptKeyFile(path.to_path_buf()))?;
    let bytes: [u8; KEY_BYTES] = raw
        .try_into()
        .map_err(|_| StoreError::CorruptKeyFile(path.to_path_buf()))?;
    Ok(Zeroizing::new(bytes))
}

/// Load the master key, generating and persisting a fresh one if the file
/// does not exist yet.
pub fn load_or_create(backend: &dyn Backend, path: &Path) -> Result<Zeroizing<[u8; KEY_BYTES]>> {
    if backend.exists(path) {
        let data = backend.read(path)?;
        let text =
            String::from_utf8(data).map_err(|_| StoreError::CorruptKeyFile(path.to_path_buf()))?;
        return decode_key(path, &text);
    }

    let key = Zeroizing::new(envelope::generate_key()?);
    backend.atomic_write(path, encode_key(&key).as_bytes(), SECRET_FILE_MODE)?;
    tracing::info!(path = %path.display(), "generated new master key");
    Ok(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    #[test]
    fn creates_then_reloads_same_key() {
        let be = MemBackend::new();
        let path = Path::new("/root/master.key");

        let first = load_or_create(&be, path).unwrap();
        let second = load_or_create(&be, path).unwrap();
        assert_eq!(*first, *second);

        // On-disk form is clean base64 with no trailing whitespace.
        let text = String::from_utf8(be.read(path).unwrap()).unwrap();
        assert_eq!(text, text.trim());
        assert_eq!(*decode_key(path, &text).unwrap(), *first);
    }

    #[test]
    fn rejects_garbage_key_file() {
        let be = MemBackend::new();
        let path = Path::new("/root/master.key");
        be.write(path, b"!!!not-base64!!!", 0o600).unwrap();
        assert!(matches!(
            load_or_create(&be, path),
            Err(StoreError::CorruptKeyFile(_))
        ));
    }

    #[test]
    fn rejects_wrong_length_key() {
        let be = MemBackend::new();
        let path = Path::new("/root/master.key");
        be.write(path, BASE64.encode([7u8; 16]).as_bytes(), 0o600)
            .unwrap();
        assert!(matches!(
            load_or_create(&be, path),
            Err(StoreError::CorruptKeyFile(_))
        ));
    }
}
