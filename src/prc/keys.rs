//! Trusted Key Registry
//!
//! A prc page may carry a signature block. Each signature is checked
//! against every key recorded here; the page's *trust level* is the number
//! of keys that validate it, and higher-trust pages shadow lower ones.
//!
//! Verification is a keyed SHA-256 digest over the page body: a signature
//! matches a key when it equals `sha256(body || key)` in lowercase hex.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

struct KeyRegistry {
    keys: Vec<(String, Vec<u8>)>,
}

static KEYS: Lazy<Mutex<KeyRegistry>> = Lazy::new(|| Mutex::new(KeyRegistry { keys: Vec::new() }));

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Records one trusted key under a label. Keys persist for the life of the
/// process.
pub fn record_key(label: &str, key: &[u8]) {
    KEYS.lock().keys.push((label.to_string(), key.to_vec()));
}

/// Records a batch of trusted keys.
pub fn record_keys(keys: &[(&str, &[u8])]) {
    let mut registry = KEYS.lock();
    for (label, key) in keys {
        registry.keys.push(((*label).to_string(), key.to_vec()));
    }
}

/// Number of recorded keys.
#[must_use]
pub fn num_keys() -> usize {
    KEYS.lock().keys.len()
}

/// Produces the signature for `body` under `key`, suitable for a page's
/// `##!` block.
#[must_use]
pub fn sign(body: &str, key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(key);
    hex(&hasher.finalize())
}

/// Counts how many recorded keys validate `signature` over `body`. This is
/// the page's trust level.
#[must_use]
pub(crate) fn count_matches(body: &str, signature: &str) -> u32 {
    let registry = KEYS.lock();
    registry
        .keys
        .iter()
        .filter(|(_, key)| sign(body, key) == signature)
        .count() as u32
}
