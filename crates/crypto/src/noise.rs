//! Noise symmetric state.
//!
//! One struct drives every Noise exchange in the router: XK for SSU2 and
//! NTCP2 session setup, N for tunnel build records. Only `mix_hash` /
//! `mix_key` and the pattern initializers live here; message flow belongs to
//! the transports.

use crate::{kdf, sha256};

/// Protocol name for SSU2 (XK with ChaCha header obfuscation).
pub const SSU2_PROTOCOL_NAME: &str = "Noise_XKchaobfse+hs1+hs2+hs3_25519_ChaChaPoly_SHA256";
/// Protocol name for NTCP2 (XK with AES length obfuscation).
pub const NTCP2_PROTOCOL_NAME: &str = "Noise_XKaesobfse+hs2+hs3_25519_ChaChaPoly_SHA256";
/// Protocol name for one-way tunnel build records.
pub const N_PROTOCOL_NAME: &str = "Noise_N_25519_ChaChaPoly_SHA256";

/// Chaining key + handshake hash + current cipher key.
#[derive(Clone)]
pub struct NoiseState {
    pub ck: [u8; 32],
    pub h: [u8; 32],
    pub k: [u8; 32],
}

impl NoiseState {
    /// InitializeSymmetric + empty prologue. Callers follow up with the
    /// pattern's pre-message `mix_hash` calls.
    fn initialize(protocol_name: &str) -> Self {
        let ck = sha256(&[protocol_name.as_bytes()]);
        let h = sha256(&[&ck]);
        Self {
            ck,
            h,
            k: [0u8; 32],
        }
    }

    /// XK: the responder's static key is known in advance and mixed into
    /// the pre-message hash.
    pub fn init_xk(protocol_name: &str, responder_static: &[u8; 32]) -> Self {
        let mut state = Self::initialize(protocol_name);
        state.mix_hash(responder_static);
        state
    }

    /// N: one-shot message to a known static key.
    pub fn init_n(recipient_static: &[u8; 32]) -> Self {
        let mut state = Self::initialize(N_PROTOCOL_NAME);
        state.mix_hash(recipient_static);
        state
    }

    /// `h = SHA256(h ‖ data)`
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.h = sha256(&[&self.h, data]);
    }

    /// `(ck, k) = HKDF(ck, ikm)`
    pub fn mix_key(&mut self, ikm: &[u8]) {
        let okm = kdf::hkdf_n::<64>(&self.ck, ikm, &[]);
        self.ck.copy_from_slice(&okm[..32]);
        self.k.copy_from_slice(&okm[32..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_deterministic() {
        let rs = [5u8; 32];
        let a = NoiseState::init_xk(SSU2_PROTOCOL_NAME, &rs);
        let b = NoiseState::init_xk(SSU2_PROTOCOL_NAME, &rs);
        assert_eq!(a.ck, b.ck);
        assert_eq!(a.h, b.h);
    }

    #[test]
    fn test_patterns_diverge() {
        let rs = [5u8; 32];
        let xk = NoiseState::init_xk(SSU2_PROTOCOL_NAME, &rs);
        let n = NoiseState::init_n(&rs);
        assert_ne!(xk.h, n.h);
        assert_ne!(xk.ck, n.ck);
    }

    #[test]
    fn test_mix_key_advances_chain() {
        let mut state = NoiseState::init_n(&[1u8; 32]);
        let ck0 = state.ck;
        state.mix_key(&[9u8; 32]);
        let ck1 = state.ck;
        let k1 = state.k;
        assert_ne!(ck0, ck1);
        state.mix_key(&[9u8; 32]);
        assert_ne!(state.ck, ck1);
        assert_ne!(state.k, k1);
    }

    #[test]
    fn test_mix_hash_tracks_transcript() {
        let mut a = NoiseState::init_n(&[1u8; 32]);
        let mut b = NoiseState::init_n(&[1u8; 32]);
        a.mix_hash(b"msg1");
        b.mix_hash(b"msg1");
        assert_eq!(a.h, b.h);
        b.mix_hash(b"msg2");
        assert_ne!(a.h, b.h);
    }
}
