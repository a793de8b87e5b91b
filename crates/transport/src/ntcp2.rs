//! NTCP2: Noise XK over TCP.
//!
//! The TCP sibling of SSU2. Session setup runs the same XK pattern with
//! AES-based ephemeral obfuscation (keyed by the responder's router hash);
//! the data phase is a stream of AEAD frames whose 2-byte length prefix is
//! XORed with a keyed SipHash sequence.

use std::hash::Hasher;

use rand::{Rng, RngCore};
use siphasher::sip::SipHasher24;

use veil_crypto::{aead, aes, kdf, noise, x25519};

use crate::TransportError;

pub const NTCP2_TERMINATION_TIMEOUT: u64 = 330; // seconds
pub const NTCP2_MAX_FRAME_SIZE: usize = 65535;

/// Data-phase frame block types (subset shared with the SSU2 catalog).
pub const NTCP2_BLK_DATETIME: u8 = 0;
pub const NTCP2_BLK_ROUTER_INFO: u8 = 2;
pub const NTCP2_BLK_I2NP_MESSAGE: u8 = 3;
pub const NTCP2_BLK_TERMINATION: u8 = 4;
pub const NTCP2_BLK_PADDING: u8 = 254;

/// Obfuscate or clarify an ephemeral key with AES-256-CBC keyed by the
/// responder's identity hash and the IV from its published address.
pub fn obfuscate_key(
    key: &mut [u8; 32],
    router_hash: &[u8; 32],
    iv: &[u8; 16],
    encrypt: bool,
) -> Result<(), TransportError> {
    if encrypt {
        aes::encrypt(router_hash, iv, key)?;
    } else {
        aes::decrypt(router_hash, iv, key)?;
    }
    Ok(())
}

/// Length-prefix obfuscation: each frame's 2-byte length is XORed with the
/// next word of a keyed SipHash chain.
pub struct LengthObfuscator {
    k0: u64,
    k1: u64,
    iv: u64,
}

impl LengthObfuscator {
    /// `key` is 16 bytes of the data-phase KDF output; `iv` is 8 more.
    pub fn new(key: &[u8; 16], iv: &[u8; 8]) -> Self {
        Self {
            k0: u64::from_le_bytes(key[..8].try_into().expect("8 bytes")),
            k1: u64::from_le_bytes(key[8..].try_into().expect("8 bytes")),
            iv: u64::from_le_bytes(*iv),
        }
    }

    fn next_mask(&mut self) -> u16 {
        let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
        hasher.write_u64(self.iv);
        self.iv = hasher.finish();
        (self.iv & 0xffff) as u16
    }

    pub fn obfuscate(&mut self, len: u16) -> [u8; 2] {
        (len ^ self.next_mask()).to_be_bytes()
    }

    pub fn clarify(&mut self, bytes: [u8; 2]) -> u16 {
        u16::from_be_bytes(bytes) ^ self.next_mask()
    }
}

/// Established NTCP2 data phase: paired AEAD keys and length obfuscators.
pub struct DataPhase {
    key_send: [u8; 32],
    key_recv: [u8; 32],
    send_frame_num: u64,
    recv_frame_num: u64,
    length_send: LengthObfuscator,
    length_recv: LengthObfuscator,
}

fn frame_nonce(frame_num: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&frame_num.to_le_bytes());
    nonce
}

impl DataPhase {
    /// Split data keys off the final chaining key; `initiator` picks which
    /// direction is ours.
    pub fn new(ck: &[u8; 32], initiator: bool) -> Self {
        let keydata = kdf::chain(ck, b"");
        let ab: [u8; 32] = keydata[..32].try_into().expect("split");
        let ba: [u8; 32] = keydata[32..].try_into().expect("split");
        let (key_send, key_recv) = if initiator { (ab, ba) } else { (ba, ab) };

        // sip keys for each direction off their data key
        let sip_ab = kdf::chain(&ab, b"siphash");
        let sip_ba = kdf::chain(&ba, b"siphash");
        let (sip_send, sip_recv) = if initiator {
            (sip_ab, sip_ba)
        } else {
            (sip_ba, sip_ab)
        };
        let obfuscator = |okm: &[u8; 64]| {
            LengthObfuscator::new(
                &okm[..16].try_into().expect("16 bytes"),
                &okm[16..24].try_into().expect("8 bytes"),
            )
        };
        Self {
            key_send,
            key_recv,
            send_frame_num: 0,
            recv_frame_num: 0,
            length_send: obfuscator(&sip_send),
            length_recv: obfuscator(&sip_recv),
        }
    }

    /// Seal one frame: obfuscated length ‖ AEAD(frame).
    pub fn seal_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let sealed = aead::seal(&self.key_send, &frame_nonce(self.send_frame_num), &[], frame)?;
        self.send_frame_num += 1;
        debug_assert!(sealed.len() <= NTCP2_MAX_FRAME_SIZE);
        let mut out = Vec::with_capacity(2 + sealed.len());
        out.extend_from_slice(&self.length_send.obfuscate(sealed.len() as u16));
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Recover the frame length from an obfuscated prefix.
    pub fn frame_len(&mut self, prefix: [u8; 2]) -> usize {
        self.length_recv.clarify(prefix) as usize
    }

    /// Open one frame body (without the length prefix).
    pub fn open_frame(&mut self, sealed: &[u8]) -> Result<Vec<u8>, TransportError> {
        let frame = aead::open(
            &self.key_recv,
            &frame_nonce(self.recv_frame_num),
            &[],
            sealed,
        )
        .map_err(|_| TransportError::Aead)?;
        self.recv_frame_num += 1;
        Ok(frame)
    }
}

/// Handshake driver, sans-IO. Both sides advance through three messages
/// and end with [`DataPhase`] keys.
pub struct Handshake {
    noise: noise::NoiseState,
    ephemeral: x25519::KeyPair,
    local_static: x25519::KeyPair,
    initiator: bool,
    remote_ephemeral: [u8; 32],
}

impl Handshake {
    pub fn initiator(local_static: x25519::KeyPair, remote_static: &[u8; 32]) -> Self {
        Self {
            noise: noise::NoiseState::init_xk(noise::NTCP2_PROTOCOL_NAME, remote_static),
            ephemeral: x25519::KeyPair::generate(),
            local_static,
            initiator: true,
            remote_ephemeral: [0u8; 32],
        }
    }

    pub fn responder(local_static: x25519::KeyPair) -> Self {
        let static_pub = local_static.public_bytes();
        Self {
            noise: noise::NoiseState::init_xk(noise::NTCP2_PROTOCOL_NAME, &static_pub),
            ephemeral: x25519::KeyPair::generate(),
            local_static,
            initiator: false,
            remote_ephemeral: [0u8; 32],
        }
    }

    /// Message 1 (`e, es`): obfuscated ephemeral ‖ AEAD(options).
    pub fn write_session_request(
        &mut self,
        remote_static: &[u8; 32],
        router_hash: &[u8; 32],
        iv: &[u8; 16],
        options: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let mut x = self.ephemeral.public_bytes();
        self.noise.mix_hash(&x);
        self.noise.mix_key(&self.ephemeral.agree(remote_static));
        let sealed = aead::seal(&self.noise.k, &[0u8; 12], &self.noise.h, options)?;
        self.noise.mix_hash(&sealed);

        obfuscate_key(&mut x, router_hash, iv, true)?;
        let mut out = Vec::with_capacity(32 + sealed.len());
        out.extend_from_slice(&x);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn read_session_request(
        &mut self,
        router_hash: &[u8; 32],
        iv: &[u8; 16],
        msg: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        if msg.len() < 32 + aead::TAG_LEN {
            return Err(TransportError::Malformed("session request size"));
        }
        let mut x: [u8; 32] = msg[..32].try_into().expect("32 bytes");
        obfuscate_key(&mut x, router_hash, iv, false)?;
        self.remote_ephemeral = x;
        self.noise.mix_hash(&x);
        self.noise.mix_key(&self.local_static.agree(&x));
        let options = aead::open(&self.noise.k, &[0u8; 12], &self.noise.h, &msg[32..])
            .map_err(|_| TransportError::Aead)?;
        self.noise.mix_hash(&msg[32..]);
        Ok(options)
    }

    /// Message 2 (`e, ee`).
    pub fn write_session_created(&mut self, options: &[u8]) -> Result<Vec<u8>, TransportError> {
        let y = self.ephemeral.public_bytes();
        self.noise.mix_hash(&y);
        self.noise
            .mix_key(&self.ephemeral.agree(&self.remote_ephemeral));
        let sealed = aead::seal(&self.noise.k, &[0u8; 12], &self.noise.h, options)?;
        self.noise.mix_hash(&sealed);
        let mut out = Vec::with_capacity(32 + sealed.len());
        out.extend_from_slice(&y);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn read_session_created(&mut self, msg: &[u8]) -> Result<Vec<u8>, TransportError> {
        if msg.len() < 32 + aead::TAG_LEN {
            return Err(TransportError::Malformed("session created size"));
        }
        let y: [u8; 32] = msg[..32].try_into().expect("32 bytes");
        self.remote_ephemeral = y;
        self.noise.mix_hash(&y);
        self.noise.mix_key(&self.ephemeral.agree(&y));
        let options = aead::open(&self.noise.k, &[0u8; 12], &self.noise.h, &msg[32..])
            .map_err(|_| TransportError::Aead)?;
        self.noise.mix_hash(&msg[32..]);
        Ok(options)
    }

    /// Message 3 (`s, se`): static key frame then RouterInfo frame.
    pub fn write_session_confirmed(
        &mut self,
        router_info: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let part1 = aead::seal(
            &self.noise.k,
            &frame_nonce(1),
            &self.noise.h,
            &self.local_static.public_bytes(),
        )?;
        self.noise.mix_hash(&part1);
        self.noise
            .mix_key(&self.local_static.agree(&self.remote_ephemeral));
        let part2 = aead::seal(&self.noise.k, &[0u8; 12], &self.noise.h, router_info)?;
        self.noise.mix_hash(&part2);
        let mut out = part1;
        out.extend_from_slice(&part2);
        Ok(out)
    }

    /// Returns `(remote static key, router info)`.
    pub fn read_session_confirmed(
        &mut self,
        msg: &[u8],
    ) -> Result<([u8; 32], Vec<u8>), TransportError> {
        if msg.len() < 48 + aead::TAG_LEN {
            return Err(TransportError::Malformed("session confirmed size"));
        }
        let static_key = aead::open(&self.noise.k, &frame_nonce(1), &self.noise.h, &msg[..48])
            .map_err(|_| TransportError::Aead)?;
        self.noise.mix_hash(&msg[..48]);
        let remote_static: [u8; 32] = static_key.as_slice().try_into().expect("32 bytes");
        self.noise.mix_key(&self.ephemeral.agree(&remote_static));
        let router_info = aead::open(&self.noise.k, &[0u8; 12], &self.noise.h, &msg[48..])
            .map_err(|_| TransportError::Aead)?;
        self.noise.mix_hash(&msg[48..]);
        Ok((remote_static, router_info))
    }

    pub fn into_data_phase(self) -> DataPhase {
        DataPhase::new(&self.noise.ck, self.initiator)
    }
}

/// A random 16-byte IV for the published NTCP2 address.
pub fn random_iv() -> [u8; 16] {
    let mut iv = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Padding length for a frame, keeping traffic shape irregular.
pub fn padding_len() -> usize {
    rand::thread_rng().gen_range(0..64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (DataPhase, DataPhase) {
        let bob_static = x25519::KeyPair::generate();
        let bob_hash = [5u8; 32];
        let bob_iv = random_iv();

        let mut alice = Handshake::initiator(
            x25519::KeyPair::generate(),
            &bob_static.public_bytes(),
        );
        let mut bob = Handshake::responder(bob_static.clone());

        let msg1 = alice
            .write_session_request(&bob_static.public_bytes(), &bob_hash, &bob_iv, b"opts1")
            .unwrap();
        let opts1 = bob.read_session_request(&bob_hash, &bob_iv, &msg1).unwrap();
        assert_eq!(opts1, b"opts1");

        let msg2 = bob.write_session_created(b"opts2").unwrap();
        let opts2 = alice.read_session_created(&msg2).unwrap();
        assert_eq!(opts2, b"opts2");

        let msg3 = alice.write_session_confirmed(b"router info bytes").unwrap();
        let (_, router_info) = bob.read_session_confirmed(&msg3).unwrap();
        assert_eq!(router_info, b"router info bytes");

        (alice.into_data_phase(), bob.into_data_phase())
    }

    #[test]
    fn test_handshake_and_frames() {
        let (mut alice, mut bob) = run_handshake();
        let wire = alice.seal_frame(b"first frame").unwrap();
        let len = bob.frame_len(wire[..2].try_into().unwrap());
        assert_eq!(len, wire.len() - 2);
        assert_eq!(bob.open_frame(&wire[2..]).unwrap(), b"first frame");

        // frames are ordered: each uses the next nonce and mask
        let wire2 = alice.seal_frame(b"second").unwrap();
        let len2 = bob.frame_len(wire2[..2].try_into().unwrap());
        assert_eq!(len2, wire2.len() - 2);
        assert_eq!(bob.open_frame(&wire2[2..]).unwrap(), b"second");
    }

    #[test]
    fn test_frame_replay_fails() {
        let (mut alice, mut bob) = run_handshake();
        let wire = alice.seal_frame(b"data").unwrap();
        let _ = bob.frame_len(wire[..2].try_into().unwrap());
        bob.open_frame(&wire[2..]).unwrap();
        // same bytes again: nonce advanced, AEAD fails
        assert!(bob.open_frame(&wire[2..]).is_err());
    }

    #[test]
    fn test_length_obfuscation_symmetry() {
        let mut a = LengthObfuscator::new(&[1u8; 16], &[2u8; 8]);
        let mut b = LengthObfuscator::new(&[1u8; 16], &[2u8; 8]);
        for len in [0u16, 1, 500, 65000] {
            assert_eq!(b.clarify(a.obfuscate(len)), len);
        }
    }

    #[test]
    fn test_wrong_static_key_fails_request() {
        let bob_static = x25519::KeyPair::generate();
        let other = x25519::KeyPair::generate();
        let bob_hash = [5u8; 32];
        let bob_iv = random_iv();
        let mut alice =
            Handshake::initiator(x25519::KeyPair::generate(), &other.public_bytes());
        let mut bob = Handshake::responder(bob_static);
        let msg1 = alice
            .write_session_request(&other.public_bytes(), &bob_hash, &bob_iv, b"x")
            .unwrap();
        assert!(bob.read_session_request(&bob_hash, &bob_iv, &msg1).is_err());
    }
}
