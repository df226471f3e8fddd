//! Artifact encryption.
//!
//! Symmetric, passphrase-derived protection for artifact payloads. The key
//! is derived with PBKDF2-HMAC-SHA256 from the passphrase and a random
//! per-artifact salt — no machine-bound key material is involved, so
//! protected artifacts stay portable across machines and key stores.
//!
//! Wire format: `SPK1` magic, 16-byte salt, 24-byte XChaCha20-Poly1305
//! nonce, ciphertext. The AEAD tag means a wrong passphrase or a corrupted
//! payload fails authentication and surfaces as
//! [`ResourceError::DecryptionFailed`], never as silently wrong plaintext.

use chacha20poly1305::aead::rand_core::RngCore as _;
use chacha20poly1305::aead::{Aead as _, KeyInit as _, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::error::ResourceError;

/// Format marker at the start of every protected payload.
const MAGIC: &[u8; 4] = b"SPK1";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// PBKDF2 iteration count for key derivation.
const PBKDF2_ROUNDS: u32 = 600_000;

/// Protect a payload with a passphrase.
///
/// # Errors
///
/// Fails only if the AEAD implementation rejects the input; with valid key
/// and nonce sizes this does not occur in practice.
pub fn protect(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, ResourceError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| ResourceError::Payload("encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(MAGIC.len() + SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Recover the payload protected by [`protect`].
///
/// # Errors
///
/// Returns [`ResourceError::DecryptionFailed`] when the passphrase is wrong
/// or the payload was truncated or tampered with.
pub fn unprotect(data: &[u8], passphrase: &str) -> Result<Vec<u8>, ResourceError> {
    let header = MAGIC.len() + SALT_LEN + NONCE_LEN;
    if data.len() < header || &data[..MAGIC.len()] != MAGIC {
        return Err(ResourceError::DecryptionFailed);
    }
    let salt = &data[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let nonce = &data[MAGIC.len() + SALT_LEN..header];
    let ciphertext = &data[header..];

    let key = derive_key(passphrase, salt);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| ResourceError::DecryptionFailed)
}

/// Whether a payload carries the protected-format marker.
#[must_use]
pub fn is_protected(data: &[u8]) -> bool {
    data.len() >= MAGIC.len() && &data[..MAGIC.len()] == MAGIC
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data = b"registry subtree payload";
        let protected = protect(data, "correct horse").unwrap();
        assert_ne!(&protected[..], &data[..]);
        let recovered = unprotect(&protected, "correct horse").unwrap();
        assert_eq!(recovered, data);
    }

    #[test]
    fn wrong_passphrase_is_decryption_failed_never_garbage() {
        let protected = protect(b"secret", "pw1").unwrap();
        let err = unprotect(&protected, "pw2").unwrap_err();
        assert!(matches!(err, ResourceError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut protected = protect(b"secret", "pw").unwrap();
        let last = protected.len() - 1;
        protected[last] ^= 0xFF;
        assert!(matches!(
            unprotect(&protected, "pw").unwrap_err(),
            ResourceError::DecryptionFailed
        ));
    }

    #[test]
    fn truncated_payload_fails() {
        assert!(matches!(
            unprotect(b"SPK1", "pw").unwrap_err(),
            ResourceError::DecryptionFailed
        ));
        assert!(matches!(
            unprotect(b"", "pw").unwrap_err(),
            ResourceError::DecryptionFailed
        ));
    }

    #[test]
    fn protected_payloads_differ_per_call() {
        // Fresh salt and nonce every time: identical inputs must not produce
        // identical ciphertext.
        let a = protect(b"same", "pw").unwrap();
        let b = protect(b"same", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn is_protected_detects_marker() {
        let protected = protect(b"x", "pw").unwrap();
        assert!(is_protected(&protected));
        assert!(!is_protected(b"plain json"));
    }

    #[test]
    fn empty_payload_round_trips() {
        let protected = protect(b"", "pw").unwrap();
        assert_eq!(unprotect(&protected, "pw").unwrap(), Vec::<u8>::new());
    }
}
