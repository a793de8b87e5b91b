//! SSU2 packet envelope.
//!
//! Every packet starts with a 16-byte header: destination connection id,
//! packet number, type, three flag bytes. On the wire each 8-byte half of
//! the header is XORed with the first ChaCha20 keystream bytes keyed by the
//! intro or header key and nonced by the last 24 or 12 bytes of the packet.
//! Payloads are ChaCha20-Poly1305 with the header as AD and a nonce built
//! from the packet number.

use veil_crypto::{aead, chacha};

use crate::TransportError;

pub const HEADER_LEN: usize = 16;
/// Minimum bytes for header unmasking to be possible at all.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + 24;

pub const PROTOCOL_VERSION: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dest_conn_id: u64,
    pub packet_num: u32,
    pub msg_type: u8,
    pub flags: [u8; 3],
}

impl Header {
    pub fn new(dest_conn_id: u64, packet_num: u32, msg_type: u8) -> Self {
        Self {
            dest_conn_id,
            packet_num,
            msg_type,
            flags: [PROTOCOL_VERSION, veil_core::net_id() as u8, 0],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..8].copy_from_slice(&self.dest_conn_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.packet_num.to_be_bytes());
        buf[12] = self.msg_type;
        buf[13..16].copy_from_slice(&self.flags);
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            dest_conn_id: u64::from_le_bytes(buf[..8].try_into().expect("8 bytes")),
            packet_num: u32::from_be_bytes(buf[8..12].try_into().expect("4 bytes")),
            msg_type: buf[12],
            flags: [buf[13], buf[14], buf[15]],
        }
    }

    pub fn version(&self) -> u8 {
        self.flags[0]
    }

    pub fn net_id(&self) -> u8 {
        self.flags[1]
    }
}

/// AEAD nonce for a packet number: four zero bytes then the number
/// little-endian.
pub fn nonce(packet_num: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..].copy_from_slice(&packet_num.to_le_bytes());
    out
}

fn tail_nonce(packet: &[u8], from_end: usize) -> [u8; 12] {
    let start = packet.len() - from_end;
    packet[start..start + 12].try_into().expect("12 bytes")
}

/// Mask or unmask a wire header in place. `key1` covers the connection-id
/// half (nonce = last 24 bytes of the packet), `key2` the packet-number
/// half (nonce = last 12 bytes).
pub fn mask_header(header: &mut [u8; HEADER_LEN], key1: &[u8; 32], key2: &[u8; 32], packet: &[u8]) {
    debug_assert!(packet.len() >= 24);
    let mask1 = chacha::header_mask(key1, &tail_nonce(packet, 24));
    let mask2 = chacha::header_mask(key2, &tail_nonce(packet, 12));
    for i in 0..8 {
        header[i] ^= mask1[i];
        header[8 + i] ^= mask2[i];
    }
}

/// Seal a data-phase payload: AAD is the 16-byte header.
pub fn seal_payload(
    key: &[u8; 32],
    packet_num: u64,
    header: &[u8; HEADER_LEN],
    payload: &[u8],
) -> Result<Vec<u8>, TransportError> {
    Ok(aead::seal(key, &nonce(packet_num), header, payload)?)
}

pub fn open_payload(
    key: &[u8; 32],
    packet_num: u64,
    header: &[u8; HEADER_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, TransportError> {
    aead::open(key, &nonce(packet_num), header, ciphertext).map_err(|_| TransportError::Aead)
}

/// Encrypt the 48-byte handshake extension (source id, token, ephemeral)
/// that follows the header in SessionRequest/SessionCreated, or the 16-byte
/// one in TokenRequest/Retry.
pub fn mask_header_x(key: &[u8; 32], header_x: &mut [u8]) {
    chacha::xor(key, &[0u8; 12], 0, header_x);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header::new(0x1122334455667788, 42, 6);
        let bytes = header.to_bytes();
        assert_eq!(Header::from_bytes(&bytes), header);
        assert_eq!(header.version(), PROTOCOL_VERSION);
    }

    #[test]
    fn test_mask_is_involution() {
        let header = Header::new(7, 1, 6);
        let mut masked = header.to_bytes();
        let packet = vec![3u8; 64];
        let k1 = [1u8; 32];
        let k2 = [2u8; 32];
        mask_header(&mut masked, &k1, &k2, &packet);
        assert_ne!(masked, header.to_bytes());
        mask_header(&mut masked, &k1, &k2, &packet);
        assert_eq!(Header::from_bytes(&masked), header);
    }

    #[test]
    fn test_mask_depends_on_tail() {
        let header = Header::new(7, 1, 6);
        let k = [1u8; 32];
        let mut a = header.to_bytes();
        let mut b = header.to_bytes();
        mask_header(&mut a, &k, &k, &vec![3u8; 64]);
        mask_header(&mut b, &k, &k, &vec![4u8; 64]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_payload_roundtrip_and_tamper() {
        let key = [9u8; 32];
        let header = Header::new(1, 5, 6).to_bytes();
        let sealed = seal_payload(&key, 5, &header, b"blocks").unwrap();
        assert_eq!(open_payload(&key, 5, &header, &sealed).unwrap(), b"blocks");
        // wrong packet number: different nonce
        assert!(open_payload(&key, 6, &header, &sealed).is_err());
        // tampered AD
        let mut bad_header = header;
        bad_header[12] ^= 1;
        assert!(open_payload(&key, 5, &bad_header, &sealed).is_err());
    }

    #[test]
    fn test_nonce_layout() {
        let n = nonce(0x0102030405060708);
        assert_eq!(&n[..4], &[0, 0, 0, 0]);
        assert_eq!(&n[4..], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }
}
