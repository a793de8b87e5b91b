//! Raw ChaCha20.
//!
//! Used where the protocol wants a bare keystream: SSU2 header masking
//! (counter 0) and the encrypted-LeaseSet layer cipher (counter 1, matching
//! the AEAD payload convention).

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;

/// XOR `data` in place with the ChaCha20 keystream starting at block
/// `counter`.
pub fn xor(key: &[u8; 32], nonce: &[u8; 12], counter: u32, data: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.seek(counter as u64 * 64);
    cipher.apply_keystream(data);
}

/// First 8 keystream bytes for key/nonce at counter 0. SSU2 masks each half
/// of its 16-byte header with one of these.
pub fn header_mask(key: &[u8; 32], nonce: &[u8; 12]) -> [u8; 8] {
    let mut mask = [0u8; 8];
    xor(key, nonce, 0, &mut mask);
    mask
}
