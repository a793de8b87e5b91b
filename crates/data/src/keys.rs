//! Private key bundles.
//!
//! Serialized as identity ‖ 256-byte encryption private key ‖ signing
//! private key. When the signing private key field is all zero, an offline
//! signature block follows: expiry, transient algorithm, transient public
//! key, a signature by the long-term key over that block, then the transient
//! private key. Signing then goes through the transient key only; the
//! long-term key never touches traffic again.

use rand::RngCore;

use veil_core::time;
use veil_crypto::sig::{SigType, Signer, Verifier};
use veil_crypto::x25519;

use crate::identity::{Identity, CRYPTO_TYPE_ECIES_X25519};
use crate::{DataError, Reader};

/// Offline-signature block: delegation from the long-term signing key to a
/// short-lived transient key.
#[derive(Clone)]
pub struct OfflineSignature {
    pub expires: u32,
    pub transient_sig_type: SigType,
    pub transient_pubkey: Vec<u8>,
    /// Long-term signature over `expires ‖ sig-type ‖ transient_pubkey`.
    pub signature: Vec<u8>,
}

impl OfflineSignature {
    pub fn serialized_len(&self) -> usize {
        6 + self.transient_pubkey.len() + self.signature.len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.expires.to_be_bytes());
        out.extend_from_slice(&self.transient_sig_type.code().to_be_bytes());
        out.extend_from_slice(&self.transient_pubkey);
        out.extend_from_slice(&self.signature);
    }
}

pub struct PrivateKeys {
    identity: Identity,
    encryption_priv: [u8; 256],
    signing_priv: Vec<u8>,
    offline: Option<OfflineSignature>,
    signer: Signer,
}

impl PrivateKeys {
    /// Generate a fresh Ed25519 + X25519 bundle.
    pub fn generate() -> Result<Self, DataError> {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        let enc = x25519::KeyPair::generate();

        let identity = Identity::new_keys(
            SigType::Ed25519,
            &signing.verifying_key().to_bytes(),
            CRYPTO_TYPE_ECIES_X25519,
            &enc.public_bytes(),
        )?;

        let mut encryption_priv = [0u8; 256];
        encryption_priv[..32].copy_from_slice(&enc.secret_bytes());
        let signer = Signer::new(SigType::Ed25519, &seed)?;
        Ok(Self {
            identity,
            encryption_priv,
            signing_priv: seed.to_vec(),
            offline: None,
            signer,
        })
    }

    pub fn from_buffer(buf: &[u8]) -> Result<(Self, usize), DataError> {
        let (identity, ident_len) = Identity::from_buffer(buf)?;
        let mut r = Reader::new(&buf[ident_len..]);

        let mut encryption_priv = [0u8; 256];
        encryption_priv.copy_from_slice(r.take(256)?);

        let signing_len = identity.sig_type().privkey_len();
        let signing_priv = r.take(signing_len)?.to_vec();

        if signing_priv.iter().any(|&b| b != 0) {
            let signer = Signer::new(identity.sig_type(), &signing_priv)?;
            let consumed = ident_len + r.position();
            return Ok((
                Self {
                    identity,
                    encryption_priv,
                    signing_priv,
                    offline: None,
                    signer,
                },
                consumed,
            ));
        }

        // Zeroed long-term key: an offline block follows.
        let block_start = r.position();
        let expires = r.u32()?;
        let transient_sig_type = SigType::from_code(r.u16()?)?;
        let transient_pubkey = r.take(transient_sig_type.pubkey_len())?.to_vec();
        let block_end = r.position();
        let signature = r.take(identity.sig_len())?.to_vec();

        identity.verify(
            &buf[ident_len + block_start..ident_len + block_end],
            &signature,
        )?;

        let transient_priv = r.take(transient_sig_type.privkey_len())?.to_vec();
        let signer = Signer::new(transient_sig_type, &transient_priv)?;
        let consumed = ident_len + r.position();
        Ok((
            Self {
                identity,
                encryption_priv,
                signing_priv: transient_priv,
                offline: Some(OfflineSignature {
                    expires,
                    transient_sig_type,
                    transient_pubkey,
                    signature,
                }),
                signer,
            },
            consumed,
        ))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.identity.as_bytes());
        out.extend_from_slice(&self.encryption_priv);
        match &self.offline {
            None => out.extend_from_slice(&self.signing_priv),
            Some(offline) => {
                // zeroed long-term field, then the offline block and the
                // transient private key
                out.extend_from_slice(&vec![0u8; self.identity.sig_type().privkey_len()]);
                offline.write(&mut out);
                out.extend_from_slice(&self.signing_priv);
            }
        }
        out
    }

    /// Derive a bundle whose traffic signatures come from a fresh transient
    /// key, keeping the long-term key offline.
    pub fn create_offline(
        &self,
        expires: u32,
        transient_sig_type: SigType,
    ) -> Result<Self, DataError> {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let transient_signer = Signer::new(transient_sig_type, &seed)?;
        let transient_pubkey = match &transient_signer {
            Signer::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
            Signer::RedDsa(key) => key.public_bytes().to_vec(),
        };

        let mut block = Vec::with_capacity(6 + transient_pubkey.len());
        block.extend_from_slice(&expires.to_be_bytes());
        block.extend_from_slice(&transient_sig_type.code().to_be_bytes());
        block.extend_from_slice(&transient_pubkey);
        let signature = self.signer.sign(&block)?;

        Ok(Self {
            identity: self.identity.clone(),
            encryption_priv: self.encryption_priv,
            signing_priv: seed.to_vec(),
            offline: Some(OfflineSignature {
                expires,
                transient_sig_type,
                transient_pubkey,
                signature,
            }),
            signer: transient_signer,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn offline_signature(&self) -> Option<&OfflineSignature> {
        self.offline.as_ref()
    }

    /// Signature length for signatures this bundle currently produces.
    pub fn signature_len(&self) -> usize {
        match &self.offline {
            Some(o) => o.transient_sig_type.sig_len(),
            None => self.identity.sig_len(),
        }
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, DataError> {
        Ok(self.signer.sign(msg)?)
    }

    /// X25519 encryption secret (first 32 bytes of the padded field).
    pub fn x25519_secret(&self) -> [u8; 32] {
        self.encryption_priv[..32].try_into().expect("256-byte field")
    }

    /// Ed25519 seed of the signing key currently in use.
    pub fn signing_seed(&self) -> &[u8] {
        &self.signing_priv
    }

    /// Verify that a message signed by this bundle checks out, chaining
    /// through the offline block when present.
    pub fn verify_own(&self, msg: &[u8], sig: &[u8]) -> Result<(), DataError> {
        match &self.offline {
            None => self.identity.verify(msg, sig),
            Some(offline) => {
                if (offline.expires as u64) < time::seconds_since_epoch() {
                    return Err(DataError::Expired(offline.expires as u64));
                }
                let verifier = Verifier::new(offline.transient_sig_type, &offline.transient_pubkey)?;
                verifier.verify(msg, sig).map_err(|_| DataError::BadSignature)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_roundtrip() {
        let keys = PrivateKeys::generate().unwrap();
        let bytes = keys.to_bytes();
        let (parsed, consumed) = PrivateKeys::from_buffer(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.identity().hash(), keys.identity().hash());
        assert_eq!(parsed.x25519_secret(), keys.x25519_secret());
    }

    #[test]
    fn test_sign_verify() {
        let keys = PrivateKeys::generate().unwrap();
        let sig = keys.sign(b"message").unwrap();
        keys.identity().verify(b"message", &sig).unwrap();
    }

    #[test]
    fn test_offline_bundle() {
        let keys = PrivateKeys::generate().unwrap();
        let expires = (veil_core::time::seconds_since_epoch() + 86400) as u32;
        let offline = keys.create_offline(expires, SigType::Ed25519).unwrap();

        // long-term field zeroed in serialization
        let bytes = offline.to_bytes();
        let ident_len = keys.identity().as_bytes().len();
        assert!(bytes[ident_len + 256..ident_len + 256 + 32].iter().all(|&b| b == 0));

        // roundtrips, and signatures verify through the transient key
        let (parsed, _) = PrivateKeys::from_buffer(&bytes).unwrap();
        assert!(parsed.offline_signature().is_some());
        let sig = parsed.sign(b"traffic").unwrap();
        parsed.verify_own(b"traffic", &sig).unwrap();
        // the long-term key did NOT make this signature
        assert!(keys.identity().verify(b"traffic", &sig).is_err());
    }

    #[test]
    fn test_tampered_offline_block_rejected() {
        let keys = PrivateKeys::generate().unwrap();
        let offline = keys
            .create_offline((veil_core::time::seconds_since_epoch() + 3600) as u32, SigType::Ed25519)
            .unwrap();
        let mut bytes = offline.to_bytes();
        let ident_len = keys.identity().as_bytes().len();
        // flip a bit inside the transient public key
        bytes[ident_len + 256 + 32 + 6] ^= 1;
        assert!(PrivateKeys::from_buffer(&bytes).is_err());
    }
}
