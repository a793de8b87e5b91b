//! Signature algorithm dispatch.
//!
//! Identities carry a 16-bit algorithm code; everything downstream goes
//! through [`Verifier`] and [`Signer`] so no caller ever matches on the code
//! itself. RSA codes are recognized and rejected outright; GOST codes are
//! recognized but no verifier can be built for them.

use ed25519_dalek::Verifier as _;
use sha1::{Digest, Sha1};
use signature::DigestVerifier;

use crate::CryptoError;

/// I2P signature algorithm codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigType {
    DsaSha1,
    EcdsaSha256P256,
    EcdsaSha384P384,
    EcdsaSha512P521,
    RsaSha256_2048,
    RsaSha384_3072,
    RsaSha512_4096,
    Ed25519,
    Ed25519ph,
    Gost256,
    Gost512,
    RedDsaEd25519,
}

impl SigType {
    pub fn from_code(code: u16) -> Result<Self, CryptoError> {
        Ok(match code {
            0 => Self::DsaSha1,
            1 => Self::EcdsaSha256P256,
            2 => Self::EcdsaSha384P384,
            3 => Self::EcdsaSha512P521,
            4 => Self::RsaSha256_2048,
            5 => Self::RsaSha384_3072,
            6 => Self::RsaSha512_4096,
            7 => Self::Ed25519,
            8 => Self::Ed25519ph,
            9 => Self::Gost256,
            10 => Self::Gost512,
            11 => Self::RedDsaEd25519,
            other => return Err(CryptoError::UnknownSigType(other)),
        })
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::DsaSha1 => 0,
            Self::EcdsaSha256P256 => 1,
            Self::EcdsaSha384P384 => 2,
            Self::EcdsaSha512P521 => 3,
            Self::RsaSha256_2048 => 4,
            Self::RsaSha384_3072 => 5,
            Self::RsaSha512_4096 => 6,
            Self::Ed25519 => 7,
            Self::Ed25519ph => 8,
            Self::Gost256 => 9,
            Self::Gost512 => 10,
            Self::RedDsaEd25519 => 11,
        }
    }

    pub fn pubkey_len(&self) -> usize {
        match self {
            Self::DsaSha1 => 128,
            Self::EcdsaSha256P256 => 64,
            Self::EcdsaSha384P384 => 96,
            Self::EcdsaSha512P521 => 132,
            Self::RsaSha256_2048 => 256,
            Self::RsaSha384_3072 => 384,
            Self::RsaSha512_4096 => 512,
            Self::Ed25519 | Self::Ed25519ph | Self::RedDsaEd25519 => 32,
            Self::Gost256 => 64,
            Self::Gost512 => 128,
        }
    }

    pub fn sig_len(&self) -> usize {
        match self {
            Self::DsaSha1 => 40,
            Self::EcdsaSha256P256 => 64,
            Self::EcdsaSha384P384 => 96,
            Self::EcdsaSha512P521 => 132,
            Self::RsaSha256_2048 => 256,
            Self::RsaSha384_3072 => 384,
            Self::RsaSha512_4096 => 512,
            Self::Ed25519 | Self::Ed25519ph | Self::RedDsaEd25519 => 64,
            Self::Gost256 => 64,
            Self::Gost512 => 128,
        }
    }

    pub fn privkey_len(&self) -> usize {
        match self {
            Self::DsaSha1 => 20,
            Self::EcdsaSha256P256 => 32,
            Self::EcdsaSha384P384 => 48,
            Self::EcdsaSha512P521 => 66,
            Self::RsaSha256_2048 => 512,
            Self::RsaSha384_3072 => 768,
            Self::RsaSha512_4096 => 1024,
            Self::Ed25519 | Self::Ed25519ph | Self::RedDsaEd25519 => 32,
            Self::Gost256 => 32,
            Self::Gost512 => 64,
        }
    }

    /// Only EdDSA-family identities can publish encrypted LeaseSets.
    pub fn supports_blinding(&self) -> bool {
        matches!(self, Self::Ed25519 | Self::RedDsaEd25519)
    }

    /// The algorithm the blinded key carries.
    pub fn blinded_sig_type(&self) -> SigType {
        SigType::RedDsaEd25519
    }
}

// 1024-bit DSA domain parameters shared by all I2P DSA-SHA1 identities.
const DSA_P: &str = "9C05B2AA960D9B97B8931963C9CC9E8C3026E9B8ED92FAD0A69CC886D5BF8015\
                     FCADAE31A0AD18FAB3F01B00A358DE237655C4964AFAA2B337E96AD316B9FB1C\
                     C564B5AEC5B69A9FF6C3E4548707FEF8503D91DD8602E867E6D35D2235C1869C\
                     E2479C3B9D5401DE04E0727FB33D6511285D4CF29538D9E3B6051F5B22CC1C93";
const DSA_Q: &str = "A5DFC28FEF4CA1E286744CD8EED9D29D684046B7";
const DSA_G: &str = "0C1F4D27D40093B429E962D7223824E0BBC47E7C832A39236FC683AF84889581\
                     075FF9082ED32353D4374D7301CDA1D23C431F4698599DDA02451824FF369752\
                     593647CC3DDC197DE985E43D136CDFFFC6EB541124A45E6F531F5B5254E0DC8D\
                     4126381D34F16EB1C3CB23DCE407860C299BFCB21284B0D63EB7E817C9EECCC8\
                     5F00B10341057FE7253D3369FF0CF9A0334DD04792B830ABB4B302DE6605F94E3";

fn dsa_uint(hex: &str) -> dsa::BigUint {
    dsa::BigUint::parse_bytes(hex.as_bytes(), 16).expect("valid DSA constant")
}

/// A ready-to-use verifier for one public key.
pub enum Verifier {
    Ed25519(ed25519_dalek::VerifyingKey),
    RedDsa(RedDsaVerifier),
    EcdsaP256(p256::ecdsa::VerifyingKey),
    EcdsaP384(p384::ecdsa::VerifyingKey),
    EcdsaP521(p521::ecdsa::VerifyingKey),
    Dsa(Box<dsa::VerifyingKey>),
}

fn sec1_uncompressed(raw_xy: &[u8]) -> Vec<u8> {
    let mut sec1 = Vec::with_capacity(1 + raw_xy.len());
    sec1.push(0x04);
    sec1.extend_from_slice(raw_xy);
    sec1
}

impl Verifier {
    /// Build a verifier for `sig_type` from the identity's raw public key
    /// bytes. Fails for RSA and GOST algorithms and for malformed keys.
    pub fn new(sig_type: SigType, pubkey: &[u8]) -> Result<Self, CryptoError> {
        if pubkey.len() != sig_type.pubkey_len() {
            return Err(CryptoError::InvalidKey);
        }
        match sig_type {
            SigType::Ed25519 | SigType::Ed25519ph => {
                let bytes: [u8; 32] = pubkey.try_into().map_err(|_| CryptoError::InvalidKey)?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map_err(|_| CryptoError::InvalidKey)?;
                Ok(Self::Ed25519(key))
            }
            SigType::RedDsaEd25519 => {
                let bytes: [u8; 32] = pubkey.try_into().map_err(|_| CryptoError::InvalidKey)?;
                Ok(Self::RedDsa(RedDsaVerifier::new(&bytes)?))
            }
            SigType::EcdsaSha256P256 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1_uncompressed(pubkey))
                    .map_err(|_| CryptoError::InvalidKey)?;
                Ok(Self::EcdsaP256(key))
            }
            SigType::EcdsaSha384P384 => {
                let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(&sec1_uncompressed(pubkey))
                    .map_err(|_| CryptoError::InvalidKey)?;
                Ok(Self::EcdsaP384(key))
            }
            SigType::EcdsaSha512P521 => {
                let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(&sec1_uncompressed(pubkey))
                    .map_err(|_| CryptoError::InvalidKey)?;
                Ok(Self::EcdsaP521(key))
            }
            SigType::DsaSha1 => {
                let components =
                    dsa::Components::from_components(dsa_uint(DSA_P), dsa_uint(DSA_Q), dsa_uint(DSA_G))
                        .map_err(|_| CryptoError::InvalidKey)?;
                let y = dsa::BigUint::from_bytes_be(pubkey);
                let key = dsa::VerifyingKey::from_components(components, y)
                    .map_err(|_| CryptoError::InvalidKey)?;
                Ok(Self::Dsa(Box::new(key)))
            }
            SigType::RsaSha256_2048 | SigType::RsaSha384_3072 | SigType::RsaSha512_4096 => {
                Err(CryptoError::UnsupportedSigType(sig_type))
            }
            SigType::Gost256 | SigType::Gost512 => Err(CryptoError::UnsupportedSigType(sig_type)),
        }
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        match self {
            Self::Ed25519(key) => {
                let sig =
                    ed25519_dalek::Signature::from_slice(sig).map_err(|_| CryptoError::BadSignature)?;
                key.verify(msg, &sig).map_err(|_| CryptoError::BadSignature)
            }
            Self::RedDsa(key) => key.verify(msg, sig),
            Self::EcdsaP256(key) => {
                let sig =
                    p256::ecdsa::Signature::from_slice(sig).map_err(|_| CryptoError::BadSignature)?;
                signature::Verifier::verify(key, msg, &sig).map_err(|_| CryptoError::BadSignature)
            }
            Self::EcdsaP384(key) => {
                let sig =
                    p384::ecdsa::Signature::from_slice(sig).map_err(|_| CryptoError::BadSignature)?;
                signature::Verifier::verify(key, msg, &sig).map_err(|_| CryptoError::BadSignature)
            }
            Self::EcdsaP521(key) => {
                let sig =
                    p521::ecdsa::Signature::from_slice(sig).map_err(|_| CryptoError::BadSignature)?;
                signature::Verifier::verify(key, msg, &sig).map_err(|_| CryptoError::BadSignature)
            }
            Self::Dsa(key) => {
                if sig.len() != 40 {
                    return Err(CryptoError::BadSignature);
                }
                let r = dsa::BigUint::from_bytes_be(&sig[..20]);
                let s = dsa::BigUint::from_bytes_be(&sig[20..]);
                let signature =
                    dsa::Signature::from_components(r, s).map_err(|_| CryptoError::BadSignature)?;
                key.verify_digest(Sha1::new_with_prefix(msg), &signature)
                    .map_err(|_| CryptoError::BadSignature)
            }
        }
    }
}

/// A ready-to-use signer for one private key. New identities are Ed25519;
/// RedDSA signs under blinded keys for encrypted LeaseSets.
pub enum Signer {
    Ed25519(Box<ed25519_dalek::SigningKey>),
    RedDsa(RedDsaSigner),
}

impl Signer {
    pub fn new(sig_type: SigType, privkey: &[u8]) -> Result<Self, CryptoError> {
        match sig_type {
            SigType::Ed25519 => {
                let bytes: [u8; 32] = privkey.try_into().map_err(|_| CryptoError::InvalidKey)?;
                Ok(Self::Ed25519(Box::new(ed25519_dalek::SigningKey::from_bytes(
                    &bytes,
                ))))
            }
            SigType::RedDsaEd25519 => {
                let bytes: [u8; 32] = privkey.try_into().map_err(|_| CryptoError::InvalidKey)?;
                Ok(Self::RedDsa(RedDsaSigner::new(&bytes)?))
            }
            other => Err(CryptoError::UnsupportedSigType(other)),
        }
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Ed25519(key) => {
                use ed25519_dalek::Signer as _;
                Ok(key.sign(msg).to_bytes().to_vec())
            }
            Self::RedDsa(key) => key.sign(msg),
        }
    }

    pub fn sig_type(&self) -> SigType {
        match self {
            Self::Ed25519(_) => SigType::Ed25519,
            Self::RedDsa(_) => SigType::RedDsaEd25519,
        }
    }
}

// RedDSA over Ed25519: the Schnorr scheme used for blinded LeaseSet keys.
// Same curve and equation as Ed25519 but the public key is an arbitrary
// point (not derived by key clamping) and the nonce is randomized.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;
use sha2::Sha512;

fn wide_scalar(h: Sha512) -> Scalar {
    let wide: [u8; 64] = h.finalize().into();
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn reddsa_challenge(r_bytes: &[u8; 32], a_bytes: &[u8; 32], msg: &[u8]) -> Scalar {
    let mut h = Sha512::new();
    Digest::update(&mut h, r_bytes);
    Digest::update(&mut h, a_bytes);
    Digest::update(&mut h, msg);
    wide_scalar(h)
}

pub struct RedDsaVerifier {
    point: curve25519_dalek::edwards::EdwardsPoint,
    compressed: [u8; 32],
}

impl RedDsaVerifier {
    pub fn new(pubkey: &[u8; 32]) -> Result<Self, CryptoError> {
        let point = CompressedEdwardsY(*pubkey)
            .decompress()
            .ok_or(CryptoError::InvalidKey)?;
        Ok(Self {
            point,
            compressed: *pubkey,
        })
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        if sig.len() != 64 {
            return Err(CryptoError::BadSignature);
        }
        let r_bytes: [u8; 32] = sig[..32].try_into().expect("length checked");
        let s_bytes: [u8; 32] = sig[32..].try_into().expect("length checked");
        let r_point = CompressedEdwardsY(r_bytes)
            .decompress()
            .ok_or(CryptoError::BadSignature)?;
        let s = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes))
            .ok_or(CryptoError::BadSignature)?;
        let c = reddsa_challenge(&r_bytes, &self.compressed, msg);
        // [s]B == R + [c]A
        let lhs = ED25519_BASEPOINT_TABLE * &s;
        let rhs = r_point + self.point * c;
        if lhs == rhs {
            Ok(())
        } else {
            Err(CryptoError::BadSignature)
        }
    }
}

pub struct RedDsaSigner {
    scalar: Scalar,
    public: [u8; 32],
}

impl RedDsaSigner {
    /// `privkey` is a scalar (a long-term key blinded by a date factor, or
    /// a freshly generated transient key); reduced mod the group order.
    pub fn new(privkey: &[u8; 32]) -> Result<Self, CryptoError> {
        let scalar = Scalar::from_bytes_mod_order(*privkey);
        if scalar == Scalar::ZERO {
            return Err(CryptoError::InvalidKey);
        }
        let public = (ED25519_BASEPOINT_TABLE * &scalar).compress().0;
        Ok(Self { scalar, public })
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use rand::RngCore;
        // Randomized nonce: r = H(random80 || msg)
        let mut seed = [0u8; 80];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let mut h = Sha512::new();
        Digest::update(&mut h, seed);
        Digest::update(&mut h, msg);
        let r = wide_scalar(h);
        let r_point = (ED25519_BASEPOINT_TABLE * &r).compress();
        let c = reddsa_challenge(&r_point.0, &self.public, msg);
        let s = r + c * self.scalar;
        let mut sig = Vec::with_capacity(64);
        sig.extend_from_slice(&r_point.0);
        sig.extend_from_slice(s.as_bytes());
        Ok(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_type_codes_roundtrip() {
        for code in 0..=11u16 {
            let t = SigType::from_code(code).unwrap();
            assert_eq!(t.code(), code);
        }
        assert!(matches!(
            SigType::from_code(12),
            Err(CryptoError::UnknownSigType(12))
        ));
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let signer = Signer::new(SigType::Ed25519, &[42u8; 32]).unwrap();
        let msg = b"router descriptor bytes";
        let sig = signer.sign(msg).unwrap();
        assert_eq!(sig.len(), 64);

        let signing = ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]);
        let pubkey = signing.verifying_key().to_bytes();
        let verifier = Verifier::new(SigType::Ed25519, &pubkey).unwrap();
        verifier.verify(msg, &sig).unwrap();
        assert!(verifier.verify(b"other bytes", &sig).is_err());
    }

    #[test]
    fn test_rsa_rejected() {
        assert!(matches!(
            Verifier::new(SigType::RsaSha256_2048, &[0u8; 256]),
            Err(CryptoError::UnsupportedSigType(_))
        ));
    }

    #[test]
    fn test_gost_rejected() {
        assert!(Verifier::new(SigType::Gost256, &[0u8; 64]).is_err());
    }

    #[test]
    fn test_wrong_pubkey_length() {
        assert!(matches!(
            Verifier::new(SigType::Ed25519, &[0u8; 31]),
            Err(CryptoError::InvalidKey)
        ));
    }

    #[test]
    fn test_reddsa_sign_verify() {
        // A canonical scalar: small value, well below the group order.
        let mut key = [0u8; 32];
        key[0] = 99;
        let signer = RedDsaSigner::new(&key).unwrap();
        let verifier = RedDsaVerifier::new(&signer.public_bytes()).unwrap();
        let msg = b"blinded lease set";
        let sig = signer.sign(msg).unwrap();
        verifier.verify(msg, &sig).unwrap();
        assert!(verifier.verify(b"tampered", &sig).is_err());

        let mut bad_sig = sig;
        bad_sig[10] ^= 1;
        assert!(verifier.verify(msg, &bad_sig).is_err());
    }

    #[test]
    fn test_reddsa_signatures_are_randomized() {
        let mut key = [0u8; 32];
        key[0] = 7;
        let signer = RedDsaSigner::new(&key).unwrap();
        let a = signer.sign(b"m").unwrap();
        let b = signer.sign(b"m").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_blinding_support() {
        assert!(SigType::Ed25519.supports_blinding());
        assert!(SigType::RedDsaEd25519.supports_blinding());
        assert!(!SigType::DsaSha1.supports_blinding());
        assert!(!SigType::EcdsaSha256P256.supports_blinding());
    }
}
