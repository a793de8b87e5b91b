//! Blinded destination keys for encrypted LeaseSets.
//!
//! The signing public key is blinded with a date-dependent factor so the
//! floodfill storing the LeaseSet learns neither the destination nor a
//! stable storage key. The factor rotates at UTC midnight:
//!
//! ```text
//! alpha   = HKDF(salt = SHA256("i2pblinding1"),
//!                ikm  = A ‖ sigtype ‖ blindedtype ‖ "YYYYMMDD", 64) mod l
//! A'      = A + [alpha]B
//! a'      = a + alpha  (signing side)
//! ```
//!
//! The subcredential binds the blinded key back to the real identity for
//! whoever already knows it:
//!
//! ```text
//! credential    = SHA256("credential" ‖ identity)
//! subcredential = SHA256("subcredential" ‖ credential ‖ A')
//! ```

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha512};

use veil_core::{time, IdentHash};
use veil_crypto::sig::SigType;
use veil_crypto::{kdf, sha256};

use crate::identity::Identity;
use crate::DataError;

/// A destination's blinded public key, bound to its signing algorithm.
#[derive(Clone)]
pub struct BlindedPublicKey {
    sig_type: SigType,
    blinded_sig_type: SigType,
    /// The unblinded signing public key A.
    pubkey: [u8; 32],
    credential: [u8; 32],
}

fn blinding_alpha(
    pubkey: &[u8; 32],
    sig_type: SigType,
    blinded_sig_type: SigType,
    date: &str,
) -> Scalar {
    let salt = sha256(&[b"i2pblinding1"]);
    let mut ikm = Vec::with_capacity(32 + 4 + 8);
    ikm.extend_from_slice(pubkey);
    ikm.extend_from_slice(&sig_type.code().to_be_bytes());
    ikm.extend_from_slice(&blinded_sig_type.code().to_be_bytes());
    ikm.extend_from_slice(date.as_bytes());
    let seed = kdf::hkdf_n::<64>(&salt, &ikm, b"");
    Scalar::from_bytes_mod_order_wide(&seed)
}

impl BlindedPublicKey {
    /// Fails when the identity's signing algorithm does not support
    /// blinding (anything outside the EdDSA family).
    pub fn from_identity(identity: &Identity) -> Result<Self, DataError> {
        let sig_type = identity.sig_type();
        if !sig_type.supports_blinding() {
            return Err(DataError::Malformed("signing algorithm cannot be blinded"));
        }
        let pubkey: [u8; 32] = identity
            .signing_pubkey()
            .try_into()
            .map_err(|_| DataError::Malformed("signing key length"))?;
        Ok(Self {
            sig_type,
            blinded_sig_type: sig_type.blinded_sig_type(),
            pubkey,
            credential: sha256(&[b"credential", identity.as_bytes()]),
        })
    }

    pub fn sig_type(&self) -> SigType {
        self.sig_type
    }

    pub fn blinded_sig_type(&self) -> SigType {
        self.blinded_sig_type
    }

    /// The blinded public key for a given `YYYYMMDD`.
    pub fn blinded_key(&self, date: &str) -> Result<[u8; 32], DataError> {
        let point = CompressedEdwardsY(self.pubkey)
            .decompress()
            .ok_or(DataError::Malformed("signing key not on curve"))?;
        let alpha = blinding_alpha(&self.pubkey, self.sig_type, self.blinded_sig_type, date);
        let blinded = point + ED25519_BASEPOINT_TABLE * &alpha;
        Ok(blinded.compress().0)
    }

    /// Today's blinded key.
    pub fn current_blinded_key(&self) -> Result<[u8; 32], DataError> {
        self.blinded_key(&time::today())
    }

    /// NetDb storage hash for a given date.
    pub fn store_hash(&self, date: &str) -> Result<IdentHash, DataError> {
        Ok(IdentHash::new(sha256(&[&self.blinded_key(date)?])))
    }

    /// 32-byte subcredential for a given blinded key. The codec appends the
    /// 4-byte published timestamp to form the 36-byte AEAD input.
    pub fn subcredential(&self, blinded_key: &[u8]) -> [u8; 32] {
        sha256(&[b"subcredential", &self.credential, blinded_key])
    }
}

/// Blind the matching private key for `date`. `seed` is the Ed25519 seed
/// (expanded and clamped first) or a raw RedDSA scalar.
pub fn blind_private_key(
    sig_type: SigType,
    seed: &[u8],
    pubkey: &[u8; 32],
    date: &str,
) -> Result<[u8; 32], DataError> {
    let scalar = match sig_type {
        SigType::Ed25519 => {
            let seed: [u8; 32] = seed.try_into().map_err(|_| DataError::Malformed("seed length"))?;
            let expanded: [u8; 64] = Sha512::digest(seed).into();
            let mut lo: [u8; 32] = expanded[..32].try_into().expect("64-byte digest");
            lo[0] &= 248;
            lo[31] &= 127;
            lo[31] |= 64;
            Scalar::from_bytes_mod_order(lo)
        }
        SigType::RedDsaEd25519 => {
            let raw: [u8; 32] = seed.try_into().map_err(|_| DataError::Malformed("seed length"))?;
            Scalar::from_bytes_mod_order(raw)
        }
        other => return Err(DataError::Crypto(veil_crypto::CryptoError::UnsupportedSigType(other))),
    };
    let alpha = blinding_alpha(pubkey, sig_type, sig_type.blinded_sig_type(), date);
    Ok((scalar + alpha).to_bytes())
}
