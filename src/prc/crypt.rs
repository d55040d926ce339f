//! Encrypted Page Payloads
//!
//! Pages matching the encrypted-pattern list are stored as a 12-byte nonce
//! followed by a ChaCha20 keystream-encrypted body. The cipher key is
//! derived from the configured passphrase with SHA-256.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use sha2::{Digest, Sha256};

use crate::errors::{Result, SagaError};

const NONCE_LEN: usize = 12;

fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

/// Encrypts prc text under a passphrase. The nonce is derived from the
/// passphrase and plaintext, so the helper is deterministic.
#[must_use]
pub fn encrypt_prc_data(plain: &str, passphrase: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"prc-nonce");
    hasher.update(passphrase.as_bytes());
    hasher.update(plain.as_bytes());
    let digest = hasher.finalize();

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);

    let key = derive_key(passphrase);
    let mut body = plain.as_bytes().to_vec();
    let mut cipher = ChaCha20::new(&key.into(), &nonce.into());
    cipher.apply_keystream(&mut body);

    let mut out = Vec::with_capacity(NONCE_LEN + body.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&body);
    out
}

/// Decrypts an encrypted prc payload. Fails if the payload is truncated or
/// the result is not valid UTF-8 (wrong key).
pub fn decrypt_prc_data(data: &[u8], passphrase: &str) -> Result<String> {
    if data.len() < NONCE_LEN {
        return Err(SagaError::DecryptError("payload shorter than nonce".to_string()));
    }
    let (nonce, body) = data.split_at(NONCE_LEN);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce);
    let key = derive_key(passphrase);
    let mut plain = body.to_vec();
    let mut cipher = ChaCha20::new(&key.into(), &nonce_bytes.into());
    cipher.apply_keystream(&mut plain);
    String::from_utf8(plain)
        .map_err(|_| SagaError::DecryptError("decrypted payload is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let text = "quality-level 9\n# comment\nstate-cache 1\n";
        let data = encrypt_prc_data(text, "hunter2");
        assert_ne!(&data[NONCE_LEN..], text.as_bytes());
        assert_eq!(decrypt_prc_data(&data, "hunter2").unwrap(), text);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert!(decrypt_prc_data(&[1, 2, 3], "key").is_err());
    }
}
