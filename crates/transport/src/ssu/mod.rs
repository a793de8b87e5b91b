//! SSU, the legacy UDP transport.
//!
//! Kept only far enough to interoperate with routers that predate SSU2:
//! 2048-bit DH key agreement, AES-256-CBC packets authenticated with
//! HMAC-MD5 (the size word tweaked by the network id), signed session
//! setup, and a simple fragment/ack data layer. New sessions should always
//! prefer SSU2.

use rand::{Rng, RngCore};

use veil_core::time;
use veil_crypto::{aes, hmac_md5};

use crate::TransportError;

pub const SSU_MTU: usize = 1484;
pub const SSU_TERMINATION_TIMEOUT: u64 = 330; // seconds

pub const PAYLOAD_TYPE_SESSION_REQUEST: u8 = 0;
pub const PAYLOAD_TYPE_SESSION_CREATED: u8 = 1;
pub const PAYLOAD_TYPE_SESSION_CONFIRMED: u8 = 2;
pub const PAYLOAD_TYPE_RELAY_REQUEST: u8 = 3;
pub const PAYLOAD_TYPE_RELAY_RESPONSE: u8 = 4;
pub const PAYLOAD_TYPE_RELAY_INTRO: u8 = 5;
pub const PAYLOAD_TYPE_DATA: u8 = 6;
pub const PAYLOAD_TYPE_PEER_TEST: u8 = 7;
pub const PAYLOAD_TYPE_SESSION_DESTROYED: u8 = 8;

/// MAC(16) ‖ IV(16) ‖ flag(1) ‖ time(4); the encrypted region starts at the
/// flag byte.
pub const HEADER_SIZE: usize = 37;
const ENCRYPTED_OFFSET: usize = 32;

// 2048-bit MODP prime used for the legacy DH (RFC 3526 group 14), g = 2.
const DH_PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                            29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                            EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                            E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                            EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                            C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                            83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                            670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                            E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                            DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                            15728E5A8AACAA68FFFFFFFFFFFFFFFF";

fn dh_prime() -> dsa::BigUint {
    dsa::BigUint::parse_bytes(DH_PRIME_HEX.as_bytes(), 16).expect("valid prime constant")
}

/// Legacy DH keypair; 256-byte public values on the wire.
pub struct DhKeys {
    secret: dsa::BigUint,
    public: dsa::BigUint,
}

impl DhKeys {
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut secret_bytes);
        let secret = dsa::BigUint::from_bytes_be(&secret_bytes);
        let public = dsa::BigUint::from(2u8).modpow(&secret, &dh_prime());
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 256] {
        let mut out = [0u8; 256];
        let bytes = self.public.to_bytes_be();
        out[256 - bytes.len()..].copy_from_slice(&bytes);
        out
    }

    pub fn agree(&self, their_public: &[u8; 256]) -> [u8; 256] {
        let theirs = dsa::BigUint::from_bytes_be(their_public);
        let shared = theirs.modpow(&self.secret, &dh_prime());
        let mut out = [0u8; 256];
        let bytes = shared.to_bytes_be();
        out[256 - bytes.len()..].copy_from_slice(&bytes);
        out
    }
}

/// Split the DH shared secret into the session and MAC keys, preserving the
/// historical sign-byte quirk: a set high bit shifts the split by one.
pub fn derive_keys(shared: &[u8; 256]) -> ([u8; 32], [u8; 32]) {
    let mut session_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    if shared[0] & 0x80 != 0 {
        session_key[1..].copy_from_slice(&shared[..31]);
        mac_key.copy_from_slice(&shared[31..63]);
    } else {
        session_key.copy_from_slice(&shared[..32]);
        mac_key.copy_from_slice(&shared[32..64]);
    }
    (session_key, mac_key)
}

fn mac_input(encrypted: &[u8], iv: &[u8; 16]) -> Vec<u8> {
    let mut input = Vec::with_capacity(encrypted.len() + 18);
    input.extend_from_slice(encrypted);
    input.extend_from_slice(iv);
    let net_id = veil_core::net_id() as u16;
    let len = encrypted.len() as u16;
    let size_word = if net_id == 2 { len } else { len ^ ((net_id - 2) << 8) };
    input.extend_from_slice(&size_word.to_be_bytes());
    input
}

/// Assemble, encrypt and authenticate one packet.
pub fn seal_packet(
    payload_type: u8,
    payload: &[u8],
    session_key: &[u8; 32],
    mac_key: &[u8; 32],
) -> Result<Vec<u8>, TransportError> {
    let mut iv = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    // flag ‖ time ‖ payload, padded to the cipher block
    let mut clear = Vec::with_capacity(5 + payload.len() + 16);
    clear.push(payload_type << 4);
    clear.extend_from_slice(&(time::seconds_since_epoch() as u32).to_be_bytes());
    clear.extend_from_slice(payload);
    let padded = clear.len().div_ceil(16) * 16;
    while clear.len() < padded {
        clear.push(rand::rngs::OsRng.gen::<u8>());
    }

    aes::encrypt(session_key, &iv, &mut clear)?;
    let mac = hmac_md5::digest(mac_key, &mac_input(&clear, &iv));

    let mut out = Vec::with_capacity(HEADER_SIZE + clear.len());
    out.extend_from_slice(&mac);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&clear);
    Ok(out)
}

/// Verify and decrypt one packet; returns `(payload_type, timestamp,
/// payload)`.
pub fn open_packet(
    buf: &[u8],
    session_key: &[u8; 32],
    mac_key: &[u8; 32],
) -> Result<(u8, u32, Vec<u8>), TransportError> {
    if buf.len() < HEADER_SIZE || (buf.len() - ENCRYPTED_OFFSET) % 16 != 0 {
        return Err(TransportError::Malformed("ssu packet size"));
    }
    let mac = &buf[..16];
    let iv: [u8; 16] = buf[16..32].try_into().expect("16 bytes");
    let encrypted = &buf[ENCRYPTED_OFFSET..];
    hmac_md5::verify(mac_key, &mac_input(encrypted, &iv), mac)
        .map_err(|_| TransportError::Aead)?;

    let mut clear = encrypted.to_vec();
    aes::decrypt(session_key, &iv, &mut clear)?;
    let payload_type = clear[0] >> 4;
    let timestamp = u32::from_be_bytes(clear[1..5].try_into().expect("4 bytes"));
    Ok((payload_type, timestamp, clear[5..].to_vec()))
}

/// One fragment of the legacy reliable data layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragment {
    pub msg_id: u32,
    pub fragment_num: u8,
    pub is_last: bool,
    pub data: Vec<u8>,
}

pub const DATA_FLAG_EXPLICIT_ACKS: u8 = 0x80;
pub const DATA_FLAG_ACK_BITFIELDS: u8 = 0x40;

/// The data payload: optional explicit acks, optional ack bitfields, then
/// fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataPayload {
    pub acked_msg_ids: Vec<u32>,
    /// `(msg_id, bitfield)`: one bit per fragment received.
    pub ack_bitfields: Vec<(u32, u8)>,
    pub fragments: Vec<DataFragment>,
}

impl DataPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut flag = 0u8;
        if !self.acked_msg_ids.is_empty() {
            flag |= DATA_FLAG_EXPLICIT_ACKS;
        }
        if !self.ack_bitfields.is_empty() {
            flag |= DATA_FLAG_ACK_BITFIELDS;
        }
        out.push(flag);
        if !self.acked_msg_ids.is_empty() {
            out.push(self.acked_msg_ids.len() as u8);
            for id in &self.acked_msg_ids {
                out.extend_from_slice(&id.to_be_bytes());
            }
        }
        if !self.ack_bitfields.is_empty() {
            out.push(self.ack_bitfields.len() as u8);
            for (id, bits) in &self.ack_bitfields {
                out.extend_from_slice(&id.to_be_bytes());
                out.push(*bits);
            }
        }
        out.push(self.fragments.len() as u8);
        for fragment in &self.fragments {
            out.extend_from_slice(&fragment.msg_id.to_be_bytes());
            // 3-byte fragment info: number, last flag, 14-bit size
            let info: u32 = ((fragment.fragment_num as u32) << 17)
                | ((fragment.is_last as u32) << 16)
                | (fragment.data.len() as u32 & 0x3fff);
            out.extend_from_slice(&info.to_be_bytes()[1..]);
            out.extend_from_slice(&fragment.data);
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, TransportError> {
        let mut payload = DataPayload::default();
        let mut pos = 0;
        let flag = *buf.first().ok_or(TransportError::Malformed("data flag"))?;
        pos += 1;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8], TransportError> {
            if *pos + n > buf.len() {
                return Err(TransportError::Malformed("ssu data payload"));
            }
            let out = &buf[*pos..*pos + n];
            *pos += n;
            Ok(out)
        };
        if flag & DATA_FLAG_EXPLICIT_ACKS != 0 {
            let count = take(&mut pos, 1)?[0] as usize;
            for _ in 0..count {
                let id = u32::from_be_bytes(take(&mut pos, 4)?.try_into().expect("4 bytes"));
                payload.acked_msg_ids.push(id);
            }
        }
        if flag & DATA_FLAG_ACK_BITFIELDS != 0 {
            let count = take(&mut pos, 1)?[0] as usize;
            for _ in 0..count {
                let id = u32::from_be_bytes(take(&mut pos, 4)?.try_into().expect("4 bytes"));
                let bits = take(&mut pos, 1)?[0];
                payload.ack_bitfields.push((id, bits));
            }
        }
        let num_fragments = take(&mut pos, 1)?[0] as usize;
        for _ in 0..num_fragments {
            let msg_id = u32::from_be_bytes(take(&mut pos, 4)?.try_into().expect("4 bytes"));
            let info_bytes = take(&mut pos, 3)?;
            let info =
                u32::from_be_bytes([0, info_bytes[0], info_bytes[1], info_bytes[2]]);
            let size = (info & 0x3fff) as usize;
            let data = take(&mut pos, size)?.to_vec();
            payload.fragments.push(DataFragment {
                msg_id,
                fragment_num: (info >> 17) as u8,
                is_last: info & 0x10000 != 0,
                data,
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_agreement() {
        let alice = DhKeys::generate();
        let bob = DhKeys::generate();
        let shared_a = alice.agree(&bob.public_bytes());
        let shared_b = bob.agree(&alice.public_bytes());
        assert_eq!(shared_a[..], shared_b[..]);
        let (sk_a, mk_a) = derive_keys(&shared_a);
        let (sk_b, mk_b) = derive_keys(&shared_b);
        assert_eq!(sk_a, sk_b);
        assert_eq!(mk_a, mk_b);
        assert_ne!(sk_a, mk_a);
    }

    #[test]
    fn test_packet_roundtrip() {
        let session_key = [1u8; 32];
        let mac_key = [2u8; 32];
        let packet =
            seal_packet(PAYLOAD_TYPE_DATA, b"fragment bytes", &session_key, &mac_key).unwrap();
        let (payload_type, _, payload) = open_packet(&packet, &session_key, &mac_key).unwrap();
        assert_eq!(payload_type, PAYLOAD_TYPE_DATA);
        assert_eq!(&payload[..14], b"fragment bytes");
    }

    #[test]
    fn test_bad_mac_rejected() {
        let session_key = [1u8; 32];
        let mac_key = [2u8; 32];
        let mut packet =
            seal_packet(PAYLOAD_TYPE_DATA, b"payload", &session_key, &mac_key).unwrap();
        packet[40] ^= 1;
        assert!(matches!(
            open_packet(&packet, &session_key, &mac_key),
            Err(TransportError::Aead)
        ));
        // wrong MAC key fails too
        let good = seal_packet(PAYLOAD_TYPE_DATA, b"payload", &session_key, &mac_key).unwrap();
        assert!(open_packet(&good, &session_key, &[3u8; 32]).is_err());
    }

    #[test]
    fn test_data_payload_roundtrip() {
        let payload = DataPayload {
            acked_msg_ids: vec![10, 20],
            ack_bitfields: vec![(30, 0b0000_0111)],
            fragments: vec![
                DataFragment {
                    msg_id: 40,
                    fragment_num: 0,
                    is_last: false,
                    data: vec![1; 100],
                },
                DataFragment {
                    msg_id: 40,
                    fragment_num: 1,
                    is_last: true,
                    data: vec![2; 50],
                },
            ],
        };
        let bytes = payload.to_bytes();
        assert_eq!(DataPayload::from_bytes(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_truncated_data_payload() {
        let payload = DataPayload {
            fragments: vec![DataFragment {
                msg_id: 1,
                fragment_num: 0,
                is_last: true,
                data: vec![0; 64],
            }],
            ..DataPayload::default()
        };
        let mut bytes = payload.to_bytes();
        bytes.truncate(bytes.len() - 10);
        assert!(DataPayload::from_bytes(&bytes).is_err());
    }
}
