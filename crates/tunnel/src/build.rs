//! Encrypted tunnel build records.
//!
//! Two wire forms. The short form (218 bytes per record) encrypts a 154-byte
//! cleartext to each hop with Noise-N and derives the hop's reply, layer,
//! and IV keys from the resulting chaining key; the long form (528 bytes)
//! carries all key material inside a 464-byte cleartext. In both forms every
//! hop, after handling its own record, re-encrypts all other records with
//! its reply key, and the creator pre-applies the inverse layers so each
//! record arrives at its hop clean.

use rand::RngCore;

use veil_core::TunnelId;
use veil_crypto::{aead, aes, chacha, kdf, noise, x25519};

use crate::hop::HopConfig;
use crate::TunnelError;

pub const SHORT_RECORD_SIZE: usize = 218;
pub const SHORT_CLEARTEXT_SIZE: usize = 154;
pub const SHORT_REPLY_CLEARTEXT_SIZE: usize = SHORT_RECORD_SIZE - aead::TAG_LEN; // 202

pub const LONG_RECORD_SIZE: usize = 528;
pub const LONG_CLEARTEXT_SIZE: usize = 464;

const TO_PEER_LEN: usize = 16;

pub const FLAG_GATEWAY: u8 = 0x80;
pub const FLAG_ENDPOINT: u8 = 0x40;

/// Reply codes. Everything other than accept is a reject whose range hints
/// at severity.
pub const REPLY_ACCEPT: u8 = 0;
pub const REPLY_PROBABILISTIC_REJECT: u8 = 30;
pub const REPLY_BANDWIDTH_REJECT: u8 = 40;
pub const REPLY_CRITICAL_REJECT: u8 = 50;

fn index_nonce(index: usize) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4] = index as u8;
    nonce
}

/// Derive the short-record key ratchet from the post-encryption chaining
/// key. Returns `(reply, layer, iv, garlic)`.
fn derive_short_keys(
    ck: &[u8; 32],
    is_endpoint: bool,
) -> ([u8; 32], [u8; 32], [u8; 32], Option<([u8; 32], u64)>) {
    let (ck, reply_key) = kdf::chain_split(ck, b"SMTunnelReplyKey");
    let (ck, layer_key) = kdf::chain_split(&ck, b"SMTunnelLayerKey");
    if is_endpoint {
        let (ck, iv_key) = kdf::chain_split(&ck, b"TunnelLayerIVKey");
        let (ck, garlic_key) = kdf::chain_split(&ck, b"RGarlicKeyAndTag");
        let tag = u64::from_le_bytes(ck[..8].try_into().expect("8 bytes"));
        (reply_key, layer_key, iv_key, Some((garlic_key, tag)))
    } else {
        // non-endpoint hops take the final chaining key as IV key
        (reply_key, layer_key, ck, None)
    }
}

fn short_cleartext(hop: &HopConfig, reply_msg_id: u32) -> [u8; SHORT_CLEARTEXT_SIZE] {
    let mut clear = [0u8; SHORT_CLEARTEXT_SIZE];
    clear[0..4].copy_from_slice(&hop.tunnel_id.to_be_bytes());
    clear[4..8].copy_from_slice(&hop.next_tunnel_id.to_be_bytes());
    clear[8..40].copy_from_slice(hop.next_ident.as_bytes());
    let mut flag = 0u8;
    if hop.is_gateway {
        flag |= FLAG_GATEWAY;
    }
    if hop.is_endpoint {
        flag |= FLAG_ENDPOINT;
    }
    clear[40] = flag;
    // more flags [41..43] zero; layer encryption type 0 = AES at [43]
    clear[44..48].copy_from_slice(&veil_core::time::minutes_since_epoch().to_be_bytes());
    clear[48..52].copy_from_slice(&600u32.to_be_bytes());
    clear[52..56].copy_from_slice(&reply_msg_id.to_be_bytes());
    clear
}

/// Creator side: encrypt one hop's short record and derive its keys.
pub fn encrypt_short_record(
    hop: &mut HopConfig,
    reply_msg_id: u32,
) -> Result<[u8; SHORT_RECORD_SIZE], TunnelError> {
    let peer_static = hop.ident.x25519_pubkey();
    let mut state = noise::NoiseState::init_n(&peer_static);
    let ephemeral = x25519::KeyPair::generate();
    state.mix_hash(&ephemeral.public_bytes());
    state.mix_key(&ephemeral.agree(&peer_static));

    let clear = short_cleartext(hop, reply_msg_id);
    let sealed = aead::seal(&state.k, &[0u8; 12], &state.h, &clear)?;
    state.mix_hash(&sealed);

    let mut record = [0u8; SHORT_RECORD_SIZE];
    record[..TO_PEER_LEN].copy_from_slice(&hop.ident.hash().as_bytes()[..TO_PEER_LEN]);
    record[TO_PEER_LEN..TO_PEER_LEN + 32].copy_from_slice(&ephemeral.public_bytes());
    record[TO_PEER_LEN + 32..].copy_from_slice(&sealed);

    let (reply_key, layer_key, iv_key, garlic) = derive_short_keys(&state.ck, hop.is_endpoint);
    hop.reply_key = reply_key;
    hop.layer_key = layer_key;
    hop.iv_key = iv_key;
    hop.garlic = garlic;
    hop.reply_ad = state.h;
    Ok(record)
}

/// What a participant learns from its own short record.
pub struct ParticipantRecord {
    pub receive_tunnel_id: TunnelId,
    pub next_tunnel_id: TunnelId,
    pub next_ident: [u8; 32],
    pub is_gateway: bool,
    pub is_endpoint: bool,
    pub reply_key: [u8; 32],
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub garlic: Option<([u8; 32], u64)>,
    pub request_time_minutes: u32,
    pub expiration_seconds: u32,
    pub send_msg_id: u32,
    /// AD for the reply record.
    reply_ad: [u8; 32],
}

/// Participant side: decrypt our own record with our static X25519 key.
pub fn decrypt_short_record(
    our_key: &x25519::KeyPair,
    record: &[u8],
) -> Result<ParticipantRecord, TunnelError> {
    if record.len() != SHORT_RECORD_SIZE {
        return Err(TunnelError::Malformed("short record size"));
    }
    let ephemeral: [u8; 32] = record[TO_PEER_LEN..TO_PEER_LEN + 32]
        .try_into()
        .expect("32 bytes");
    let mut state = noise::NoiseState::init_n(&our_key.public_bytes());
    state.mix_hash(&ephemeral);
    state.mix_key(&our_key.agree(&ephemeral));
    let sealed = &record[TO_PEER_LEN + 32..];
    let clear = aead::open(&state.k, &[0u8; 12], &state.h, sealed)
        .map_err(|_| TunnelError::RecordDecrypt(0))?;
    state.mix_hash(sealed);

    let is_endpoint = clear[40] & FLAG_ENDPOINT != 0;
    let (reply_key, layer_key, iv_key, garlic) = derive_short_keys(&state.ck, is_endpoint);
    Ok(ParticipantRecord {
        receive_tunnel_id: u32::from_be_bytes(clear[0..4].try_into().expect("4")),
        next_tunnel_id: u32::from_be_bytes(clear[4..8].try_into().expect("4")),
        next_ident: clear[8..40].try_into().expect("32"),
        is_gateway: clear[40] & FLAG_GATEWAY != 0,
        is_endpoint,
        reply_key,
        layer_key,
        iv_key,
        garlic,
        request_time_minutes: u32::from_be_bytes(clear[44..48].try_into().expect("4")),
        expiration_seconds: u32::from_be_bytes(clear[48..52].try_into().expect("4")),
        send_msg_id: u32::from_be_bytes(clear[52..56].try_into().expect("4")),
        reply_ad: state.h,
    })
}

/// Participant side: write the reply into our record slot.
pub fn build_short_reply(
    participant: &ParticipantRecord,
    index: usize,
    code: u8,
) -> Result<[u8; SHORT_RECORD_SIZE], TunnelError> {
    let mut clear = [0u8; SHORT_REPLY_CLEARTEXT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut clear);
    clear[0] = 0;
    clear[1] = 0; // empty options mapping
    clear[SHORT_REPLY_CLEARTEXT_SIZE - 1] = code;
    let sealed = aead::seal(
        &participant.reply_key,
        &index_nonce(index),
        &participant.reply_ad,
        &clear,
    )?;
    Ok(sealed.try_into().expect("cleartext + tag fills the record"))
}

/// Symmetric re-encryption of another record with a hop's reply key. Both
/// the participant's on-path layer and the creator's pre-applied inverse.
pub fn apply_short_layer(reply_key: &[u8; 32], index: usize, record: &mut [u8]) {
    chacha::xor(reply_key, &index_nonce(index), 1, record);
}

/// Creator side: pre-apply the inverse forward layers so each record
/// arrives at its hop clean. Records and hops are index-aligned.
pub fn preprocess_short_records(hops: &[HopConfig], records: &mut [[u8; SHORT_RECORD_SIZE]]) {
    for i in 0..hops.len() {
        for j in i + 1..records.len() {
            apply_short_layer(&hops[i].reply_key, j, &mut records[j]);
        }
    }
}

/// Creator side: unwrap the return layers and open hop `i`'s reply record.
/// Returns the hop's accept/reject code.
pub fn decrypt_short_reply(
    hops: &[HopConfig],
    i: usize,
    record: &[u8; SHORT_RECORD_SIZE],
) -> Result<u8, TunnelError> {
    let mut buf = *record;
    for hop in hops.iter().skip(i + 1) {
        apply_short_layer(&hop.reply_key, i, &mut buf);
    }
    let clear = aead::open(
        &hops[i].reply_key,
        &index_nonce(i),
        &hops[i].reply_ad,
        &buf,
    )
    .map_err(|_| TunnelError::RecordDecrypt(i))?;
    Ok(clear[SHORT_REPLY_CLEARTEXT_SIZE - 1])
}

// Long (ECIES) records: key material rides in the cleartext, other records
// are layered with AES-CBC instead of ChaCha20.

fn long_cleartext(hop: &HopConfig, reply_msg_id: u32) -> [u8; LONG_CLEARTEXT_SIZE] {
    let mut clear = [0u8; LONG_CLEARTEXT_SIZE];
    clear[0..4].copy_from_slice(&hop.tunnel_id.to_be_bytes());
    clear[4..8].copy_from_slice(&hop.next_tunnel_id.to_be_bytes());
    clear[8..40].copy_from_slice(hop.next_ident.as_bytes());
    clear[40..72].copy_from_slice(&hop.layer_key);
    clear[72..104].copy_from_slice(&hop.iv_key);
    clear[104..136].copy_from_slice(&hop.reply_key);
    clear[136..152].copy_from_slice(&hop.reply_iv);
    let mut flag = 0u8;
    if hop.is_gateway {
        flag |= FLAG_GATEWAY;
    }
    if hop.is_endpoint {
        flag |= FLAG_ENDPOINT;
    }
    clear[152] = flag;
    clear[156..160].copy_from_slice(&veil_core::time::minutes_since_epoch().to_be_bytes());
    clear[160..164].copy_from_slice(&600u32.to_be_bytes());
    clear[164..168].copy_from_slice(&reply_msg_id.to_be_bytes());
    clear
}

/// Creator side: generate hop keys and encrypt one long record.
pub fn encrypt_long_record(
    hop: &mut HopConfig,
    reply_msg_id: u32,
) -> Result<[u8; LONG_RECORD_SIZE], TunnelError> {
    let mut rng = rand::rngs::OsRng;
    rng.fill_bytes(&mut hop.layer_key);
    rng.fill_bytes(&mut hop.iv_key);
    rng.fill_bytes(&mut hop.reply_key);
    rng.fill_bytes(&mut hop.reply_iv);

    let peer_static = hop.ident.x25519_pubkey();
    let mut state = noise::NoiseState::init_n(&peer_static);
    let ephemeral = x25519::KeyPair::generate();
    state.mix_hash(&ephemeral.public_bytes());
    state.mix_key(&ephemeral.agree(&peer_static));

    let clear = long_cleartext(hop, reply_msg_id);
    let sealed = aead::seal(&state.k, &[0u8; 12], &state.h, &clear)?;
    state.mix_hash(&sealed);

    let mut record = [0u8; LONG_RECORD_SIZE];
    record[..TO_PEER_LEN].copy_from_slice(&hop.ident.hash().as_bytes()[..TO_PEER_LEN]);
    record[TO_PEER_LEN..TO_PEER_LEN + 32].copy_from_slice(&ephemeral.public_bytes());
    record[TO_PEER_LEN + 32..].copy_from_slice(&sealed);

    // response comes back AEAD-keyed on the chaining key
    hop.reply_ad = state.h;
    hop.garlic = None;
    // stash ck in place of the derived reply key schedule: the long form
    // keeps the random reply key for AES layering and uses ck for the AEAD
    hop.response_key = state.ck;
    Ok(record)
}

/// Participant's long-record view.
pub struct LongParticipantRecord {
    pub receive_tunnel_id: TunnelId,
    pub next_tunnel_id: TunnelId,
    pub next_ident: [u8; 32],
    pub is_gateway: bool,
    pub is_endpoint: bool,
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub reply_key: [u8; 32],
    pub reply_iv: [u8; 16],
    pub send_msg_id: u32,
    response_key: [u8; 32],
    reply_ad: [u8; 32],
}

pub fn decrypt_long_record(
    our_key: &x25519::KeyPair,
    record: &[u8],
) -> Result<LongParticipantRecord, TunnelError> {
    if record.len() != LONG_RECORD_SIZE {
        return Err(TunnelError::Malformed("long record size"));
    }
    let ephemeral: [u8; 32] = record[TO_PEER_LEN..TO_PEER_LEN + 32]
        .try_into()
        .expect("32 bytes");
    let mut state = noise::NoiseState::init_n(&our_key.public_bytes());
    state.mix_hash(&ephemeral);
    state.mix_key(&our_key.agree(&ephemeral));
    let sealed = &record[TO_PEER_LEN + 32..];
    let clear = aead::open(&state.k, &[0u8; 12], &state.h, sealed)
        .map_err(|_| TunnelError::RecordDecrypt(0))?;
    state.mix_hash(sealed);

    Ok(LongParticipantRecord {
        receive_tunnel_id: u32::from_be_bytes(clear[0..4].try_into().expect("4")),
        next_tunnel_id: u32::from_be_bytes(clear[4..8].try_into().expect("4")),
        next_ident: clear[8..40].try_into().expect("32"),
        is_gateway: clear[152] & FLAG_GATEWAY != 0,
        is_endpoint: clear[152] & FLAG_ENDPOINT != 0,
        layer_key: clear[40..72].try_into().expect("32"),
        iv_key: clear[72..104].try_into().expect("32"),
        reply_key: clear[104..136].try_into().expect("32"),
        reply_iv: clear[136..152].try_into().expect("16"),
        send_msg_id: u32::from_be_bytes(clear[164..168].try_into().expect("4")),
        response_key: state.ck,
        reply_ad: state.h,
    })
}

/// Participant side: build the long reply record (whole record is one AEAD
/// frame keyed on the chaining key).
pub fn build_long_reply(
    participant: &LongParticipantRecord,
    code: u8,
) -> Result<[u8; LONG_RECORD_SIZE], TunnelError> {
    let mut clear = [0u8; LONG_RECORD_SIZE - aead::TAG_LEN];
    rand::rngs::OsRng.fill_bytes(&mut clear);
    clear[LONG_RECORD_SIZE - aead::TAG_LEN - 1] = code;
    let sealed = aead::seal(
        &participant.response_key,
        &[0u8; 12],
        &participant.reply_ad,
        &clear,
    )?;
    Ok(sealed.try_into().expect("cleartext + tag fills the record"))
}

/// AES layering of other records: participants encrypt, the creator
/// pre-decrypts (forward) and post-decrypts (return).
pub fn long_layer_encrypt(reply_key: &[u8; 32], reply_iv: &[u8; 16], record: &mut [u8]) {
    aes::encrypt(reply_key, reply_iv, record).expect("record is block aligned");
}

pub fn long_layer_decrypt(reply_key: &[u8; 32], reply_iv: &[u8; 16], record: &mut [u8]) {
    aes::decrypt(reply_key, reply_iv, record).expect("record is block aligned");
}

pub fn preprocess_long_records(hops: &[HopConfig], records: &mut [[u8; LONG_RECORD_SIZE]]) {
    for i in 0..hops.len() {
        for j in i + 1..records.len() {
            long_layer_decrypt(&hops[i].reply_key, &hops[i].reply_iv, &mut records[j]);
        }
    }
}

pub fn decrypt_long_reply(
    hops: &[HopConfig],
    i: usize,
    record: &[u8; LONG_RECORD_SIZE],
) -> Result<u8, TunnelError> {
    let mut buf = *record;
    for hop in hops.iter().skip(i + 1) {
        long_layer_decrypt(&hop.reply_key, &hop.reply_iv, &mut buf);
    }
    let clear = aead::open(&hops[i].response_key, &[0u8; 12], &hops[i].reply_ad, &buf)
        .map_err(|_| TunnelError::RecordDecrypt(i))?;
    Ok(clear[LONG_RECORD_SIZE - aead::TAG_LEN - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::create_path;
    use std::sync::Arc;
    use veil_data::PrivateKeys;

    fn peers(n: usize) -> Vec<(PrivateKeys, x25519::KeyPair)> {
        (0..n)
            .map(|_| {
                let keys = PrivateKeys::generate().unwrap();
                let x = x25519::KeyPair::from_secret_bytes(&keys.x25519_secret());
                (keys, x)
            })
            .collect()
    }

    #[test]
    fn test_short_build_roundtrip_three_hops() {
        let routers = peers(3);
        let idents: Vec<_> = routers
            .iter()
            .map(|(k, _)| Arc::new(k.identity().clone()))
            .collect();
        let mut hops = create_path(&idents);
        for (i, hop) in hops.iter_mut().enumerate() {
            hop.record_index = i;
        }

        let mut records = Vec::new();
        for hop in hops.iter_mut() {
            records.push(encrypt_short_record(hop, 9999).unwrap());
        }
        let mut records: Vec<[u8; SHORT_RECORD_SIZE]> = records;
        preprocess_short_records(&hops, &mut records);

        // walk the message through the hops
        for i in 0..routers.len() {
            let participant = decrypt_short_record(&routers[i].1, &records[i]).unwrap();
            assert_eq!(participant.receive_tunnel_id, hops[i].tunnel_id);
            assert_ne!(participant.receive_tunnel_id, 0);
            assert_eq!(participant.next_tunnel_id, hops[i].next_tunnel_id);
            assert_eq!(participant.is_gateway, i == 0);
            assert_eq!(participant.is_endpoint, i == routers.len() - 1);
            if i + 1 < routers.len() {
                // next-tunnel-id chains to the next hop's receive id
                assert_eq!(participant.next_tunnel_id, hops[i + 1].tunnel_id);
            }
            // the hop derives the same keys the creator kept
            assert_eq!(participant.reply_key, hops[i].reply_key);
            assert_eq!(participant.layer_key, hops[i].layer_key);
            assert_eq!(participant.iv_key, hops[i].iv_key);

            records[i] = build_short_reply(&participant, i, REPLY_ACCEPT).unwrap();
            for j in 0..records.len() {
                if j != i {
                    apply_short_layer(&participant.reply_key, j, &mut records[j]);
                }
            }
        }

        // creator opens every reply
        for i in 0..routers.len() {
            let code = decrypt_short_reply(&hops, i, &records[i]).unwrap();
            assert_eq!(code, REPLY_ACCEPT);
        }

        // keys are distinct across hops
        assert_ne!(hops[0].layer_key, hops[1].layer_key);
        assert_ne!(hops[1].reply_key, hops[2].reply_key);
        // endpoint derives a garlic key for the wrapped reply
        assert!(hops[2].garlic.is_some());
        assert!(hops[0].garlic.is_none());
    }

    #[test]
    fn test_short_record_wrong_key_fails() {
        let routers = peers(1);
        let other = x25519::KeyPair::generate();
        let idents = vec![Arc::new(routers[0].0.identity().clone())];
        let mut hops = create_path(&idents);
        let record = encrypt_short_record(&mut hops[0], 1).unwrap();
        assert!(decrypt_short_record(&other, &record).is_err());
    }

    #[test]
    fn test_short_reply_reject_code() {
        let routers = peers(2);
        let idents: Vec<_> = routers
            .iter()
            .map(|(k, _)| Arc::new(k.identity().clone()))
            .collect();
        let mut hops = create_path(&idents);
        for (i, hop) in hops.iter_mut().enumerate() {
            hop.record_index = i;
        }
        let mut records: Vec<[u8; SHORT_RECORD_SIZE]> = hops
            .iter_mut()
            .map(|h| encrypt_short_record(h, 7).unwrap())
            .collect();
        preprocess_short_records(&hops, &mut records);

        for i in 0..routers.len() {
            let participant = decrypt_short_record(&routers[i].1, &records[i]).unwrap();
            let code = if i == 1 { REPLY_BANDWIDTH_REJECT } else { REPLY_ACCEPT };
            records[i] = build_short_reply(&participant, i, code).unwrap();
            for j in 0..records.len() {
                if j != i {
                    apply_short_layer(&participant.reply_key, j, &mut records[j]);
                }
            }
        }
        assert_eq!(decrypt_short_reply(&hops, 0, &records[0]).unwrap(), REPLY_ACCEPT);
        assert_eq!(
            decrypt_short_reply(&hops, 1, &records[1]).unwrap(),
            REPLY_BANDWIDTH_REJECT
        );
    }

    #[test]
    fn test_long_build_roundtrip() {
        let routers = peers(2);
        let idents: Vec<_> = routers
            .iter()
            .map(|(k, _)| Arc::new(k.identity().clone()))
            .collect();
        let mut hops = create_path(&idents);
        for (i, hop) in hops.iter_mut().enumerate() {
            hop.record_index = i;
        }
        let mut records: Vec<[u8; LONG_RECORD_SIZE]> = hops
            .iter_mut()
            .map(|h| encrypt_long_record(h, 3).unwrap())
            .collect();
        preprocess_long_records(&hops, &mut records);

        for i in 0..routers.len() {
            let participant = decrypt_long_record(&routers[i].1, &records[i]).unwrap();
            assert_eq!(participant.receive_tunnel_id, hops[i].tunnel_id);
            assert_eq!(participant.layer_key, hops[i].layer_key);
            assert_eq!(participant.reply_key, hops[i].reply_key);
            assert_eq!(participant.reply_iv, hops[i].reply_iv);
            records[i] = build_long_reply(&participant, REPLY_ACCEPT).unwrap();
            for j in 0..records.len() {
                if j != i {
                    long_layer_encrypt(&participant.reply_key, &participant.reply_iv, &mut records[j]);
                }
            }
        }

        for i in 0..routers.len() {
            assert_eq!(decrypt_long_reply(&hops, i, &records[i]).unwrap(), REPLY_ACCEPT);
        }
    }
}
