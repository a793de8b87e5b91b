//! HMAC-MD5 for the legacy UDP transport. Nothing else may use this.

use hmac::{Hmac, Mac};
use md5::Md5;

use crate::CryptoError;

pub const MAC_LEN: usize = 16;

/// MAC over `data` with a 32-byte session MAC key.
pub fn digest(key: &[u8; 32], data: &[u8]) -> [u8; 16] {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison against a received MAC.
pub fn verify(key: &[u8; 32], data: &[u8], expected: &[u8]) -> Result<(), CryptoError> {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(expected).map_err(|_| CryptoError::Aead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_verify() {
        let key = [3u8; 32];
        let mac = digest(&key, b"packet bytes");
        verify(&key, b"packet bytes", &mac).unwrap();
        assert!(verify(&key, b"other bytes", &mac).is_err());
        assert!(verify(&[4u8; 32], b"packet bytes", &mac).is_err());
    }
}
