//! Cryptographic primitives for the router core.
//!
//! Thin, explicit wrappers over the RustCrypto and dalek crates: AEAD framing,
//! raw ChaCha20, AES-256-CBC, HKDF, X25519 agreement, the signature-algorithm
//! dispatch used by identities, HMAC-MD5 for the legacy UDP transport, and the
//! Noise symmetric state driving session handshakes and tunnel build records.

pub mod aead;
pub mod aes;
pub mod chacha;
pub mod hmac_md5;
pub mod kdf;
pub mod noise;
pub mod sig;
pub mod x25519;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    /// Authenticated decryption failed. The bytes are garbage or tampered;
    /// callers drop them and never retry.
    #[error("AEAD verification failed")]
    Aead,
    #[error("Signature verification failed")]
    BadSignature,
    #[error("Signing failed")]
    SigningFailed,
    #[error("Invalid key material")]
    InvalidKey,
    #[error("Buffer length {0} is not a multiple of the cipher block size")]
    BlockAlignment(usize),
    #[error("Signature algorithm {0:?} is not supported")]
    UnsupportedSigType(sig::SigType),
    #[error("Unknown signature algorithm code {0}")]
    UnknownSigType(u16),
}

/// One-shot SHA-256 over a list of byte windows.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
