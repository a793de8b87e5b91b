//! Fixed-size byte tags and the identity hash.

use std::cmp::Ordering;
use std::fmt;

use data_encoding::{Encoding, Specification};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// I2P's base64 alphabet (`-` and `~` instead of `+` and `/`).
pub static I2P_BASE64: Lazy<Encoding> = Lazy::new(|| {
    let mut spec = Specification::new();
    spec.symbols
        .push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
    spec.padding = Some('=');
    spec.encoding().expect("valid base64 spec")
});

/// I2P's base32 alphabet (lowercase, no padding), used for `.b32.i2p` names
/// and on-disk file names.
pub static I2P_BASE32: Lazy<Encoding> = Lazy::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.encoding().expect("valid base32 spec")
});

/// A fixed-size byte string. Wire formats are full of 16/32-byte values that
/// must never be confused with each other; the const parameter keeps them
/// apart at compile time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag<const N: usize>(#[serde(with = "serde_bytes_array")] pub [u8; N]);

impl<const N: usize> Tag<N> {
    pub const LEN: usize = N;

    pub fn new(bytes: [u8; N]) -> Self {
        Tag(bytes)
    }

    pub fn zero() -> Self {
        Tag([0u8; N])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    /// Parse from a slice; errors if the length is wrong.
    pub fn from_slice(slice: &[u8]) -> Result<Self, crate::CoreError> {
        let bytes: [u8; N] = slice
            .try_into()
            .map_err(|_| crate::CoreError::BadLength {
                expected: N,
                actual: slice.len(),
            })?;
        Ok(Tag(bytes))
    }

    pub fn to_base64(&self) -> String {
        I2P_BASE64.encode(&self.0)
    }

    pub fn to_base32(&self) -> String {
        I2P_BASE32.encode(&self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, crate::CoreError> {
        let bytes = I2P_BASE64
            .decode(s.as_bytes())
            .map_err(|_| crate::CoreError::BadEncoding)?;
        Self::from_slice(&bytes)
    }
}

impl<const N: usize> Default for Tag<N> {
    fn default() -> Self {
        Tag::zero()
    }
}

impl<const N: usize> AsRef<[u8]> for Tag<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> From<[u8; N]> for Tag<N> {
    fn from(bytes: [u8; N]) -> Self {
        Tag(bytes)
    }
}

impl<const N: usize> fmt::Debug for Tag<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_base64()[..8.min(N * 2)])
    }
}

impl<const N: usize> fmt::Display for Tag<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 32-byte SHA-256 of a router's or destination's serialized identity.
pub type IdentHash = Tag<32>;

/// 32-byte symmetric key material.
pub type SessionKey = Tag<32>;

/// Tunnel identifier. Zero is reserved (never assigned).
pub type TunnelId = u32;

impl IdentHash {
    /// Bit `level` of the hash, most-significant first. Drives the Kademlia
    /// trie descent.
    pub fn bit(&self, level: usize) -> bool {
        let byte = level / 8;
        let bit = 7 - (level % 8);
        (self.0[byte] >> bit) & 1 == 1
    }

    /// XOR distance to another hash.
    pub fn xor(&self, other: &IdentHash) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Compare `a` and `b` by XOR distance to `self`.
    pub fn closer(&self, a: &IdentHash, b: &IdentHash) -> Ordering {
        self.xor(a).cmp(&self.xor(b))
    }
}

mod serde_bytes_array {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        de: D,
    ) -> Result<[u8; N], D::Error> {
        let v: Vec<u8> = Vec::deserialize(de)?;
        v.try_into().map_err(|_| D::Error::custom("bad tag length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_base64() {
        let tag: Tag<32> = Tag::new([7u8; 32]);
        let encoded = tag.to_base64();
        let decoded = Tag::<32>::from_base64(&encoded).unwrap();
        assert_eq!(tag, decoded);
    }

    #[test]
    fn test_tag_from_slice_wrong_length() {
        assert!(Tag::<32>::from_slice(&[0u8; 31]).is_err());
        assert!(Tag::<32>::from_slice(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_ident_hash_bits() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1010_0000;
        let h = IdentHash::new(bytes);
        assert!(h.bit(0));
        assert!(!h.bit(1));
        assert!(h.bit(2));
        assert!(!h.bit(3));
    }

    #[test]
    fn test_xor_distance_ordering() {
        let target = IdentHash::new([0u8; 32]);
        let near = IdentHash::new({
            let mut b = [0u8; 32];
            b[31] = 1;
            b
        });
        let far = IdentHash::new([0xffu8; 32]);
        assert_eq!(target.closer(&near, &far), Ordering::Less);
        assert_eq!(target.closer(&far, &near), Ordering::Greater);
    }

    #[test]
    fn test_i2p_base64_alphabet() {
        // 0xff bytes exercise the tail of the alphabet where I2P differs
        // from the standard one.
        let encoded = I2P_BASE64.encode(&[0xff, 0xff, 0xff]);
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(encoded, "~~~~");
    }

    #[test]
    fn test_base32_is_lowercase() {
        let tag: Tag<32> = Tag::new([0xabu8; 32]);
        let s = tag.to_base32();
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
