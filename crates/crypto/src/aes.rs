//! AES-256-CBC with an explicit IV and no padding.
//!
//! The legacy UDP transport and tunnel layer encryption both work on
//! 16-byte-aligned buffers by construction, so padding never enters the
//! picture; a misaligned buffer is a caller bug reported as an error.

use aes::cipher::{
    block_padding::NoPadding, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    KeyInit, KeyIvInit,
};

use crate::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt one 16-byte block in place (ECB, used for tunnel IV whitening).
pub fn encrypt_block(key: &[u8; 32], block: &mut [u8; 16]) {
    let cipher = aes::Aes256::new(key.into());
    cipher.encrypt_block(block.into());
}

/// Decrypt one 16-byte block in place.
pub fn decrypt_block(key: &[u8; 32], block: &mut [u8; 16]) {
    let cipher = aes::Aes256::new(key.into());
    cipher.decrypt_block(block.into());
}

/// Encrypt in place. `data` must be a multiple of 16 bytes.
pub fn encrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    if data.len() % 16 != 0 {
        return Err(CryptoError::BlockAlignment(data.len()));
    }
    let len = data.len();
    Aes256CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| CryptoError::BlockAlignment(len))?;
    Ok(())
}

/// Decrypt in place. `data` must be a multiple of 16 bytes.
pub fn decrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
    if data.len() % 16 != 0 {
        return Err(CryptoError::BlockAlignment(data.len()));
    }
    let len = data.len();
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptoError::BlockAlignment(len))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut data = [7u8; 48];
        encrypt(&key, &iv, &mut data).unwrap();
        assert_ne!(data, [7u8; 48]);
        decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(data, [7u8; 48]);
    }

    #[test]
    fn test_misaligned_rejected() {
        let key = [0u8; 32];
        let iv = [0u8; 16];
        let mut data = [0u8; 17];
        assert!(matches!(
            encrypt(&key, &iv, &mut data),
            Err(CryptoError::BlockAlignment(17))
        ));
        assert!(decrypt(&key, &iv, &mut data).is_err());
    }

    #[test]
    fn test_iv_matters() {
        let key = [1u8; 32];
        let mut a = [9u8; 16];
        let mut b = [9u8; 16];
        encrypt(&key, &[0u8; 16], &mut a).unwrap();
        encrypt(&key, &[1u8; 16], &mut b).unwrap();
        assert_ne!(a, b);
    }
}
