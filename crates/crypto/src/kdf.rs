//! HKDF-SHA256.
//!
//! Two shapes are used throughout the protocol: the generic
//! `(salt, ikm, info, len)` form, and the chaining form where the current
//! 32-byte chaining key is the salt, the input keying material is empty, and
//! the output is 64 bytes split into a new chaining key plus derived key.

use hkdf::Hkdf;
use sha2::Sha256;

/// Generic HKDF. `okm` receives exactly `okm.len()` bytes.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], okm: &mut [u8]) {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, okm)
        .expect("okm length within HKDF bounds");
}

/// HKDF returning a fixed-size array.
pub fn hkdf_n<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; N] {
    let mut okm = [0u8; N];
    hkdf(salt, ikm, info, &mut okm);
    okm
}

/// Chaining step: `HKDF(ck, ZEROLEN, info, 64)`. Session key schedules and
/// the tunnel build key ratchet advance through this repeatedly.
pub fn chain(ck: &[u8; 32], info: &[u8]) -> [u8; 64] {
    hkdf_n::<64>(ck, &[], info)
}

/// Chaining step that splits into `(new_ck, key)`.
pub fn chain_split(ck: &[u8; 32], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let okm = chain(ck, info);
    let mut new_ck = [0u8; 32];
    let mut key = [0u8; 32];
    new_ck.copy_from_slice(&okm[..32]);
    key.copy_from_slice(&okm[32..]);
    (new_ck, key)
}
