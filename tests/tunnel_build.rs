//! Build a three-hop tunnel end to end: every hop decrypts its record,
//! derives distinct keys, replies accept, and the creator verifies all
//! replies.

use std::sync::Arc;

use veil_crypto::x25519;
use veil_data::PrivateKeys;
use veil_tunnel::build::{
    self, apply_short_layer, decrypt_short_record, decrypt_short_reply, encrypt_short_record,
    preprocess_short_records, REPLY_ACCEPT, SHORT_RECORD_SIZE,
};
use veil_tunnel::hop::{create_path, set_reply_hop};

#[test]
fn three_hop_outbound_build() {
    let routers: Vec<(PrivateKeys, x25519::KeyPair)> = (0..3)
        .map(|_| {
            let keys = PrivateKeys::generate().unwrap();
            let x = x25519::KeyPair::from_secret_bytes(&keys.x25519_secret());
            (keys, x)
        })
        .collect();
    let idents: Vec<_> = routers
        .iter()
        .map(|(k, _)| Arc::new(k.identity().clone()))
        .collect();

    let mut hops = create_path(&idents);
    // outbound tunnel: the endpoint forwards replies to our inbound
    // gateway
    let reply_gateway = veil_core::IdentHash::new([0x42u8; 32]);
    set_reply_hop(&mut hops, 31337, reply_gateway);
    for (i, hop) in hops.iter_mut().enumerate() {
        hop.record_index = i;
    }

    let mut records: Vec<[u8; SHORT_RECORD_SIZE]> = hops
        .iter_mut()
        .map(|hop| encrypt_short_record(hop, 777).unwrap())
        .collect();
    preprocess_short_records(&hops, &mut records);

    let mut seen_keys: Vec<[u8; 32]> = Vec::new();
    for (i, (_, x25519_keys)) in routers.iter().enumerate() {
        let participant = decrypt_short_record(x25519_keys, &records[i]).unwrap();

        // receive tunnel id is never zero and chains forward
        assert_ne!(participant.receive_tunnel_id, 0);
        if i + 1 < hops.len() {
            assert_eq!(participant.next_tunnel_id, hops[i + 1].tunnel_id);
        } else {
            assert_eq!(participant.next_tunnel_id, 31337);
            assert_eq!(&participant.next_ident, reply_gateway.as_bytes());
        }

        // reply, layer and IV keys are pairwise distinct across hops
        for key in [
            participant.reply_key,
            participant.layer_key,
            participant.iv_key,
        ] {
            assert!(!seen_keys.contains(&key), "hop {i} repeated a key");
            seen_keys.push(key);
        }

        records[i] = build::build_short_reply(&participant, i, REPLY_ACCEPT).unwrap();
        for j in 0..records.len() {
            if j != i {
                apply_short_layer(&participant.reply_key, j, &mut records[j]);
            }
        }
    }

    for i in 0..hops.len() {
        assert_eq!(decrypt_short_reply(&hops, i, &records[i]).unwrap(), 0x00);
    }
}

#[test]
fn tampered_record_fails_exactly_that_hop() {
    let routers: Vec<(PrivateKeys, x25519::KeyPair)> = (0..2)
        .map(|_| {
            let keys = PrivateKeys::generate().unwrap();
            let x = x25519::KeyPair::from_secret_bytes(&keys.x25519_secret());
            (keys, x)
        })
        .collect();
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
        .map(|hop| encrypt_short_record(hop, 1).unwrap())
        .collect();
    preprocess_short_records(&hops, &mut records);

    records[0][100] ^= 1;
    assert!(decrypt_short_record(&routers[0].1, &records[0]).is_err());
    // the other hop's record is untouched
    assert!(decrypt_short_record(&routers[1].1, &records[1]).is_ok());
}
