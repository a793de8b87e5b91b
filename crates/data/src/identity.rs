//! Router and destination identities.
//!
//! The standard identity is 387 bytes: a 256-byte encryption public key
//! field, a 128-byte signing public key field, and a 3-byte certificate
//! trailer. Modern identities use a key certificate whose body carries the
//! signing and crypto algorithm codes plus any signing-key bytes that do not
//! fit the 128-byte field. The identity hash is the SHA-256 of the full
//! serialization.

use std::sync::{Arc, Mutex};

use rand::RngCore;

use veil_core::IdentHash;
use veil_crypto::sig::{SigType, Verifier};
use veil_crypto::{sha256, CryptoError};

use crate::{DataError, Reader};

pub const DEFAULT_IDENTITY_SIZE: usize = 387;
pub const CERT_TYPE_NULL: u8 = 0;
pub const CERT_TYPE_KEY: u8 = 5;

/// Encryption algorithm codes carried in key certificates.
pub const CRYPTO_TYPE_ELGAMAL: u16 = 0;
pub const CRYPTO_TYPE_ECIES_X25519: u16 = 4;

pub struct Identity {
    /// Full serialization (387 bytes + certificate body).
    bytes: Vec<u8>,
    hash: IdentHash,
    sig_type: SigType,
    crypto_type: u16,
    /// Built on first use, then cached. The mutex stops two threads from
    /// constructing it twice.
    verifier: Mutex<Option<Arc<Verifier>>>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            hash: self.hash,
            sig_type: self.sig_type,
            crypto_type: self.crypto_type,
            verifier: Mutex::new(None),
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for Identity {}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.hash)
    }
}

impl Identity {
    /// Parse from a byte window, returning the identity and the number of
    /// bytes consumed.
    pub fn from_buffer(buf: &[u8]) -> Result<(Self, usize), DataError> {
        if buf.len() < DEFAULT_IDENTITY_SIZE {
            return Err(DataError::Truncated {
                need: DEFAULT_IDENTITY_SIZE - buf.len(),
            });
        }
        let cert_type = buf[384];
        let cert_len = u16::from_be_bytes([buf[385], buf[386]]) as usize;
        let full_len = DEFAULT_IDENTITY_SIZE + cert_len;
        if buf.len() < full_len {
            return Err(DataError::Truncated {
                need: full_len - buf.len(),
            });
        }

        let (sig_type, crypto_type) = if cert_type == CERT_TYPE_KEY && cert_len >= 4 {
            let mut r = Reader::new(&buf[DEFAULT_IDENTITY_SIZE..full_len]);
            let sig_code = r.u16()?;
            let crypto_code = r.u16()?;
            (SigType::from_code(sig_code)?, crypto_code)
        } else {
            (SigType::DsaSha1, CRYPTO_TYPE_ELGAMAL)
        };

        // RSA identities are rejected outright.
        if matches!(
            sig_type,
            SigType::RsaSha256_2048 | SigType::RsaSha384_3072 | SigType::RsaSha512_4096
        ) {
            return Err(DataError::Crypto(CryptoError::UnsupportedSigType(sig_type)));
        }

        let bytes = buf[..full_len].to_vec();
        let hash = IdentHash::new(sha256(&[&bytes]));
        Ok((
            Self {
                bytes,
                hash,
                sig_type,
                crypto_type,
                verifier: Mutex::new(None),
            },
            full_len,
        ))
    }

    /// Assemble a fresh identity from raw public keys. The signing key is
    /// right-aligned in its 128-byte field with random padding in front;
    /// the X25519 encryption key occupies the head of the 256-byte field.
    pub fn new_keys(
        sig_type: SigType,
        signing_pub: &[u8],
        crypto_type: u16,
        encryption_pub: &[u8; 32],
    ) -> Result<Self, DataError> {
        let key_len = sig_type.pubkey_len();
        if signing_pub.len() != key_len || key_len > 128 {
            return Err(DataError::Malformed("signing key length"));
        }
        let mut bytes = vec![0u8; DEFAULT_IDENTITY_SIZE + 4];
        rand::rngs::OsRng.fill_bytes(&mut bytes[..DEFAULT_IDENTITY_SIZE]);
        bytes[..32].copy_from_slice(encryption_pub);
        bytes[256 + (128 - key_len)..384].copy_from_slice(signing_pub);
        bytes[384] = CERT_TYPE_KEY;
        bytes[385..387].copy_from_slice(&4u16.to_be_bytes());
        bytes[387..389].copy_from_slice(&sig_type.code().to_be_bytes());
        bytes[389..391].copy_from_slice(&crypto_type.to_be_bytes());
        let hash = IdentHash::new(sha256(&[&bytes]));
        Ok(Self {
            bytes,
            hash,
            sig_type,
            crypto_type,
            verifier: Mutex::new(None),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash(&self) -> IdentHash {
        self.hash
    }

    pub fn sig_type(&self) -> SigType {
        self.sig_type
    }

    pub fn crypto_type(&self) -> u16 {
        self.crypto_type
    }

    pub fn sig_len(&self) -> usize {
        self.sig_type.sig_len()
    }

    /// The raw signing public key, reassembled from the 128-byte field and
    /// any excess bytes in the certificate body (P-521).
    pub fn signing_pubkey(&self) -> Vec<u8> {
        let key_len = self.sig_type.pubkey_len();
        if key_len <= 128 {
            self.bytes[256 + (128 - key_len)..384].to_vec()
        } else {
            let mut key = Vec::with_capacity(key_len);
            key.extend_from_slice(&self.bytes[256..384]);
            // excess sits right after the two algorithm codes
            let excess = key_len - 128;
            key.extend_from_slice(&self.bytes[DEFAULT_IDENTITY_SIZE + 4..DEFAULT_IDENTITY_SIZE + 4 + excess]);
            key
        }
    }

    /// The encryption public key field. For X25519 only the first 32 bytes
    /// are meaningful.
    pub fn encryption_pubkey(&self) -> &[u8] {
        &self.bytes[..256]
    }

    pub fn x25519_pubkey(&self) -> [u8; 32] {
        self.bytes[..32].try_into().expect("identity holds 256-byte key field")
    }

    fn verifier(&self) -> Result<Arc<Verifier>, DataError> {
        let mut guard = self.verifier.lock().expect("verifier lock");
        if let Some(v) = guard.as_ref() {
            return Ok(v.clone());
        }
        let v = Arc::new(Verifier::new(self.sig_type, &self.signing_pubkey())?);
        *guard = Some(v.clone());
        Ok(v)
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), DataError> {
        self.verifier()?
            .verify(msg, sig)
            .map_err(|_| DataError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    pub(crate) fn test_identity() -> (Identity, SigningKey) {
        let signing = SigningKey::from_bytes(&[11u8; 32]);
        let ident = Identity::new_keys(
            SigType::Ed25519,
            &signing.verifying_key().to_bytes(),
            CRYPTO_TYPE_ECIES_X25519,
            &[22u8; 32],
        )
        .unwrap();
        (ident, signing)
    }

    #[test]
    fn test_roundtrip() {
        let (ident, _) = test_identity();
        let bytes = ident.as_bytes().to_vec();
        let (parsed, consumed) = Identity::from_buffer(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.hash(), ident.hash());
        assert_eq!(parsed.sig_type(), SigType::Ed25519);
        assert_eq!(parsed.crypto_type(), CRYPTO_TYPE_ECIES_X25519);
        assert_eq!(parsed.x25519_pubkey(), [22u8; 32]);
    }

    #[test]
    fn test_hash_covers_full_serialization() {
        let (ident, _) = test_identity();
        assert_eq!(
            ident.hash().as_bytes(),
            &sha256(&[ident.as_bytes()])
        );
    }

    #[test]
    fn test_verify_dispatch() {
        use ed25519_dalek::Signer as _;
        let (ident, signing) = test_identity();
        let msg = b"descriptor";
        let sig = signing.sign(msg).to_bytes();
        ident.verify(msg, &sig).unwrap();
        assert!(ident.verify(b"not the descriptor", &sig).is_err());
    }

    #[test]
    fn test_truncated_buffer() {
        let (ident, _) = test_identity();
        let bytes = ident.as_bytes();
        assert!(Identity::from_buffer(&bytes[..386]).is_err());
        // certificate promises more bytes than present
        assert!(Identity::from_buffer(&bytes[..389]).is_err());
    }

    #[test]
    fn test_rsa_identity_rejected() {
        let mut bytes = vec![0u8; DEFAULT_IDENTITY_SIZE + 4];
        bytes[384] = CERT_TYPE_KEY;
        bytes[385..387].copy_from_slice(&4u16.to_be_bytes());
        bytes[387..389].copy_from_slice(&4u16.to_be_bytes()); // RSA_SHA256_2048
        bytes[389..391].copy_from_slice(&0u16.to_be_bytes());
        assert!(Identity::from_buffer(&bytes).is_err());
    }
}
