//! Crypto envelope: AES-256-GCM with a nonce-prefix wire form, base64 text encoding.
//!
//! The envelope is `base64(nonce || ciphertext-with-tag)`. Storing the nonce
//! as a prefix makes each envelope self-describing, and base64 keeps the
//! database a plain JSON string-to-string object.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use getrandom::getrandom;

use crate::error::{Result, StoreError};

/// Master key length (AES-256).
pub const KEY_BYTES: usize = 32;

/// Per-message nonce length (GCM).
pub const NONCE_BYTES: usize = 12;

/// Generate a fresh 32-byte master key.
pub fn generate_key() -> Result<[u8; KEY_BYTES]> {
    let mut key = [0u8; KEY_BYTES];
    getrandom(&mut key).map_err(|_| StoreError::RandomnessFailure)?;
    Ok(key)
}

/// Generate a random 12-byte nonce. Used during encryption only.
fn nonce() -> Result<[u8; NONCE_BYTES]> {
    let mut n = [0u8; NONCE_BYTES];
    getrandom(&mut n).map_err(|_| StoreError::RandomnessFailure)?;
    Ok(n)
}

/// Seal `plaintext` under `key` and return the text envelope.
pub fn encrypt(key: &[u8; KEY_BYTES], plaintext: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let n = nonce()?;
    let payload = Payload {
        msg: plaintext,
        aad: b"",
    };
    let ct = cipher
        .encrypt(Nonce::from_slice(&n), payload)
        .map_err(|_| StoreError::RandomnessFailure)?;

    let mut wire = Vec::with_capacity(NONCE_BYTES + ct.len());
    wire.extend_from_slice(&n);
    wire.extend_from_slice(&ct);
    Ok(BASE64.encode(wire))
}

/// Open a text envelope under `key`.
///
/// Any malformed input (bad base64, truncated wire form, flipped bits in the
/// nonce or ciphertext) fails with `DecryptionFailed`.
pub fn decrypt(key: &[u8; KEY_BYTES], envelope: &str) -> Result<Vec<u8>> {
    let wire = BASE64
        .decode(envelope.trim())
        .map_err(|_| StoreError::DecryptionFailed)?;
    if wire.len() < NONCE_BYTES {
        return Err(StoreError::DecryptionFailed);
    }
    let (n, ct) = wire.split_at(NONCE_BYTES);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let payload = Payload { msg: ct, aad: b"" };
    cipher
        .decrypt(Nonce::from_slice(n), payload)
        .map_err(|_| StoreError::DecryptionFailed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_basic() {
        let key = generate_key().unwrap();
        let env = encrypt(&key, b"hello secrets").unwrap();
        assert_eq!(decrypt(&key, &env).unwrap(), b"hello secrets");
    }

    #[test]
    fn roundtrip_empty_plaintext() {
        let key = generate_key().unwrap();
        let env = encrypt(&key, b"").unwrap();
        assert_eq!(decrypt(&key, &env).unwrap(), b"");
    }

    #[test]
    fn roundtrip_large_plaintext() {
        let key = generate_key().unwrap();
        let plaintext = vec![0xABu8; 1 << 20];
        let env = encrypt(&key, &plaintext).unwrap();
        assert_eq!(decrypt(&key, &env).unwrap(), plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let k1 = generate_key().unwrap();
        let k2 = generate_key().unwrap();
        let env = encrypt(&k1, b"data").unwrap();
        assert!(matches!(decrypt(&k2, &env), Err(StoreError::DecryptionFailed)));
    }

    #[test]
    fn bit_flip_anywhere_fails() {
        let key = generate_key().unwrap();
        let env = encrypt(&key, b"tamper target").unwrap();
        let wire = base64::engine::general_purpose::STANDARD.decode(&env).unwrap();

        for i in 0..wire.len() {
            let mut corrupted = wire.clone();
            corrupted[i] ^= 0x01;
            let text = base64::engine::general_purpose::STANDARD.encode(&corrupted);
            assert!(
                matches!(decrypt(&key, &text), Err(StoreError::DecryptionFailed)),
                "flip at byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn garbage_text_fails() {
        let key = generate_key().unwrap();
        assert!(matches!(
            decrypt(&key, "!!!not-base64!!!"),
            Err(StoreError::DecryptionFailed)
        ));
        assert!(matches!(decrypt(&key, "AAAA"), Err(StoreError::DecryptionFailed)));
    }

    #[test]
    fn envelopes_are_unique_per_call() {
        let key = generate_key().unwrap();
        let a = encrypt(&key, b"same plaintext").unwrap();
        let b = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(a, b); // fresh nonce every time
    }
}
