//! SSU2 scenarios across two session state machines: the token-gated
//! handshake, relay tags, loss with selective acks, and retransmission.

use rand::{Rng, RngCore};

use veil_crypto::x25519;
use veil_data::i2np::{I2npMessage, MSG_TYPE_DATA};
use veil_data::local_router::LocalRouterInfo;
use veil_data::router_info::AddressCaps;
use veil_data::PrivateKeys;
use veil_transport::ssu2::session::{LocalContext, Session};
use veil_transport::ssu2::SessionState;

fn context() -> LocalContext {
    let keys = PrivateKeys::generate().unwrap();
    let mut local = LocalRouterInfo::new(&keys, 'O', false);
    local.add_ssu2_address(
        Some("127.0.0.1".parse().unwrap()),
        9000,
        [1u8; 32],
        [2u8; 32],
        AddressCaps::V4,
    );
    let mut intro_key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut intro_key);
    LocalContext {
        static_key: x25519::KeyPair::generate(),
        intro_key,
        router_info: local.to_signed_bytes(&keys).unwrap(),
        nettime_from_peers: false,
    }
}

fn establish_with_relay_tag() -> (Session, Session) {
    let alice_ctx = context();
    let bob_ctx = context();
    let mut alice = Session::client(
        alice_ctx,
        bob_ctx.static_key.public_bytes(),
        bob_ctx.intro_key,
        None,
    );
    alice.relay_tag_requested = true;
    let mut bob = Session::server(bob_ctx);
    bob.set_incoming_token(rand::thread_rng().gen_range(1..u64::MAX));

    // no token: TokenRequest first, Retry carries one
    let token_request = alice.connect().unwrap();
    assert_eq!(alice.state, SessionState::TokenRequestSent);
    let retry = bob.handle_packet(&token_request[0]).unwrap();

    let session_request = alice.handle_packet(&retry[0]).unwrap();
    assert_eq!(alice.state, SessionState::SessionRequestSent);

    let session_created = bob.handle_packet(&session_request[0]).unwrap();
    // Bob advertises the introducer role: a fresh non-zero tag comes back
    assert_ne!(bob.relay_tag_sent, 0);

    let confirmed = alice.handle_packet(&session_created[0]).unwrap();
    assert!(alice.is_established());
    assert_eq!(alice.relay_tag_received, bob.relay_tag_sent);

    let first_data = bob.handle_packet(&confirmed[0]).unwrap();
    assert!(bob.is_established());
    for pkt in first_data {
        alice.handle_packet(&pkt).unwrap();
    }
    (alice, bob)
}

#[test]
fn full_handshake_with_token_and_relay_tag() {
    let (alice, bob) = establish_with_relay_tag();
    assert!(alice.is_established());
    assert!(bob.is_established());
}

#[test]
fn packet_loss_selective_ack_and_retransmit() {
    let (mut alice, mut bob) = establish_with_relay_tag();

    // 32 messages, one packet each; drop two in the network
    let mut packets = Vec::new();
    for i in 0..32u8 {
        alice.send_i2np(I2npMessage::new(MSG_TYPE_DATA, vec![i; 64]), None);
        packets.extend(alice.flush().unwrap());
    }
    assert_eq!(packets.len(), 32);
    assert_eq!(alice.unacked_packets(), 32);

    let mut bob_replies = Vec::new();
    for (i, pkt) in packets.iter().enumerate() {
        if i == 9 || i == 19 {
            continue; // lost
        }
        bob_replies.extend(bob.handle_packet(pkt).unwrap());
    }
    assert_eq!(bob.drain_received().len(), 30);

    // Bob's acks tell Alice exactly which packets survived
    for pkt in bob_replies {
        alice.handle_packet(&pkt).unwrap();
    }
    assert_eq!(alice.unacked_packets(), 2);

    // wait past the RTO, then retransmission covers exactly the gap
    std::thread::sleep(std::time::Duration::from_millis(
        alice.rto() + 50,
    ));
    let resent = alice.tick().unwrap();
    assert_eq!(resent.len(), 2);

    let mut acks = Vec::new();
    for pkt in &resent {
        acks.extend(bob.handle_packet(pkt).unwrap());
    }
    assert_eq!(bob.drain_received().len(), 2);
    for pkt in acks {
        alice.handle_packet(&pkt).unwrap();
    }
    assert_eq!(alice.unacked_packets(), 0);
}

#[test]
fn window_halves_on_loss_and_recovers() {
    let (mut alice, mut bob) = establish_with_relay_tag();
    // grow the window first with a clean burst
    for _ in 0..8 {
        alice.send_i2np(I2npMessage::new(MSG_TYPE_DATA, vec![1; 32]), None);
    }
    let mut replies = Vec::new();
    for pkt in alice.flush().unwrap() {
        replies.extend(bob.handle_packet(&pkt).unwrap());
    }
    for pkt in replies {
        alice.handle_packet(&pkt).unwrap();
    }
    let grown = alice.window();

    // now lose a packet and let the retransmit timer fire
    alice.send_i2np(I2npMessage::new(MSG_TYPE_DATA, vec![2; 32]), None);
    let _lost = alice.flush().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(alice.rto() + 50));
    let resent = alice.tick().unwrap();
    assert!(!resent.is_empty());
    assert!(alice.window() <= grown / 2 || alice.window() == 16);
}

#[test]
fn session_replacement_and_idempotent_close() {
    let (mut alice, _bob) = establish_with_relay_tag();
    use veil_transport::ssu2::TerminationReason;
    alice
        .request_termination(TerminationReason::ReplacedByNewSession)
        .unwrap();
    let state = alice.state;
    // closing twice changes nothing
    alice
        .request_termination(TerminationReason::IdleTimeout)
        .unwrap();
    assert_eq!(alice.state, state);
    assert_eq!(
        alice.termination_reason,
        TerminationReason::ReplacedByNewSession
    );
}
