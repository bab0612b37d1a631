//! AES-256-GCM envelope: `"EYED1" (5B) | nonce (12B) | ciphertext+tag`.
//!
//! The key is read directly from `IRISREG_ENCRYPTION_KEY` (hex or base64),
//! never threaded through [`crate::config::Config`] — see the module doc on
//! `config` for why.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use zeroize::Zeroizing;

use super::CodecError;
use crate::config::ENCRYPTION_KEY_ENV;

const MAGIC: &[u8; 5] = b"EYED1";
const NONCE_LEN: usize = 12;

/// A 32-byte AES-256 key, zeroized on drop.
pub struct EnvelopeKey(Zeroizing<[u8; 32]>);

/// Reads and decodes the encryption key from the environment, if set.
/// Accepts either 64 hex characters or base64 (standard or URL-safe,
/// padded or not) decoding to exactly 32 bytes.
pub fn key_from_env() -> Result<Option<EnvelopeKey>, CodecError> {
    let raw = match std::env::var(ENCRYPTION_KEY_ENV) {
        Ok(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };
    let bytes = decode_key_material(&raw)?;
    Ok(Some(EnvelopeKey(Zeroizing::new(bytes))))
}

fn decode_key_material(raw: &str) -> Result<[u8; 32], CodecError> {
    use base64::Engine;

    let decoded = if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        hex_decode(raw)?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw.trim_end_matches('='))
            .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(raw))
            .map_err(|_| CodecError::WrongKeyLength(0))?
    };
    decoded
        .try_into()
        .map_err(|v: Vec<u8>| CodecError::WrongKeyLength(v.len()))
}

fn hex_decode(s: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16).ok_or(CodecError::WrongKeyLength(0))?;
        let lo = (pair[1] as char).to_digit(16).ok_or(CodecError::WrongKeyLength(0))?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

/// Encrypts `plaintext` under `key` with a fresh random nonce, returning
/// `EYED1 | nonce | ciphertext+tag`. Never reuses a nonce under a given key
/// (drawn fresh from the OS CSPRNG on every call).
pub fn encrypt(key: &EnvelopeKey, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key.0));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CodecError::AuthTagFail)?;

    let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// If `blob` starts with the EYED1 magic, decrypts it and returns the
/// plaintext payload. If there is no key configured, an EYED1 blob is an
/// error ([`CodecError::MissingKey`]) rather than silently skipped — only
/// *legacy* plain blobs may pass through unchanged. Non-EYED1 blobs pass
/// through unchanged regardless of key presence.
pub fn decrypt_if_enveloped(blob: &[u8]) -> Result<Vec<u8>, CodecError> {
    if blob.len() < MAGIC.len() || &blob[..MAGIC.len()] != MAGIC {
        return Ok(blob.to_vec());
    }
    let key = key_from_env()?.ok_or(CodecError::MissingKey)?;
    decrypt(&key, blob)
}

fn decrypt(key: &EnvelopeKey, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
    let body = &blob[MAGIC.len()..];
    if body.len() < NONCE_LEN {
        return Err(CodecError::Decode("EYED1 blob shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key.0));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CodecError::AuthTagFail)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Serializes env-var mutation across tests in this module; std::env is
    // process-global and these tests run in the same test binary.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_key<R>(f: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(ENCRYPTION_KEY_ENV, "01".repeat(32));
        let r = f();
        std::env::remove_var(ENCRYPTION_KEY_ENV);
        r
    }

    #[test]
    fn round_trips_under_key() {
        with_key(|| {
            let key = key_from_env().unwrap().unwrap();
            let plaintext = b"iris archive bytes";
            let blob = encrypt(&key, plaintext).unwrap();
            assert_eq!(&blob[..5], b"EYED1");
            let recovered = decrypt_if_enveloped(&blob).unwrap();
            assert_eq!(recovered, plaintext);
        });
    }

    #[test]
    fn two_encryptions_of_same_plaintext_differ() {
        with_key(|| {
            let key = key_from_env().unwrap().unwrap();
            let a = encrypt(&key, b"same plaintext").unwrap();
            let b = encrypt(&key, b"same plaintext").unwrap();
            assert_ne!(a, b);
        });
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        with_key(|| {
            let key = key_from_env().unwrap().unwrap();
            let mut blob = encrypt(&key, b"tamper me").unwrap();
            let last = blob.len() - 1;
            blob[last] ^= 0xFF;
            assert!(matches!(
                decrypt_if_enveloped(&blob),
                Err(CodecError::AuthTagFail)
            ));
        });
    }

    #[test]
    fn missing_key_on_enveloped_blob_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(ENCRYPTION_KEY_ENV);
        let mut blob = b"EYED1".to_vec();
        blob.extend_from_slice(&[0u8; 12]);
        blob.extend_from_slice(b"whatever");
        assert!(matches!(
            decrypt_if_enveloped(&blob),
            Err(CodecError::MissingKey)
        ));
    }

    #[test]
    fn non_enveloped_blob_passes_through() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(ENCRYPTION_KEY_ENV);
        let blob = vec![0x50, 0x4B, 0x03, 0x04, 1, 2, 3];
        assert_eq!(decrypt_if_enveloped(&blob).unwrap(), blob);
    }
}
