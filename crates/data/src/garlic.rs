//! Garlic wrapping for end-to-end and router-to-router messages.
//!
//! Two shapes:
//!
//! * **One-shot**: Noise-N to a recipient's static X25519 key: a fresh
//!   ephemeral key, one AEAD frame. NetDb lookups and stores travel to
//!   floodfills this way.
//! * **Tagged replies**: the sender pre-registers `(session key, 8-byte
//!   tag)` pairs; a reply arrives as `tag ‖ AEAD(payload)` and is matched
//!   against the registry without any handshake.

use std::collections::HashMap;

use rand::RngCore;

use veil_core::time;
use veil_crypto::{aead, noise, x25519};

use crate::DataError;

/// Seal `payload` to a static X25519 public key (Noise N).
/// Output: `ephemeral ‖ ciphertext ‖ tag`.
pub fn encrypt_to(recipient_static: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>, DataError> {
    let mut state = noise::NoiseState::init_n(recipient_static);
    let ephemeral = x25519::KeyPair::generate();
    state.mix_hash(&ephemeral.public_bytes());
    state.mix_key(&ephemeral.agree(recipient_static));
    let sealed = aead::seal(&state.k, &[0u8; 12], &state.h, payload)?;
    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(&ephemeral.public_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a one-shot garlic message addressed to our static key.
pub fn decrypt_from(our_static: &x25519::KeyPair, buf: &[u8]) -> Result<Vec<u8>, DataError> {
    if buf.len() < 32 + aead::TAG_LEN {
        return Err(DataError::Truncated {
            need: 32 + aead::TAG_LEN - buf.len(),
        });
    }
    let ephemeral: [u8; 32] = buf[..32].try_into().expect("32 bytes");
    let mut state = noise::NoiseState::init_n(&our_static.public_bytes());
    state.mix_hash(&ephemeral);
    state.mix_key(&our_static.agree(&ephemeral));
    Ok(aead::open(&state.k, &[0u8; 12], &state.h, &buf[32..])?)
}

/// One pre-registered reply session.
struct ReplyTag {
    key: [u8; 32],
    registered_at: u64,
}

/// Registry of outstanding reply tags. Lookup replies arrive tagged; each
/// tag is good for one message and expires with its request.
#[derive(Default)]
pub struct GarlicTagSet {
    tags: HashMap<[u8; 8], ReplyTag>,
}

/// Tags older than this are swept.
pub const TAG_EXPIRATION: u64 = 180; // seconds

impl GarlicTagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh `(session key, tag)` pair and remember it.
    pub fn register(&mut self) -> ([u8; 32], [u8; 8]) {
        let mut key = [0u8; 32];
        let mut tag = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut tag);
        self.tags.insert(
            tag,
            ReplyTag {
                key,
                registered_at: time::seconds_since_epoch(),
            },
        );
        (key, tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Try to open `tag ‖ AEAD(payload)`; consumes the tag on success.
    pub fn decrypt(&mut self, buf: &[u8]) -> Option<Vec<u8>> {
        if buf.len() < 8 + aead::TAG_LEN {
            return None;
        }
        let tag: [u8; 8] = buf[..8].try_into().expect("8 bytes");
        let entry = self.tags.get(&tag)?;
        let plain = aead::open(&entry.key, &[0u8; 12], &tag, &buf[8..]).ok()?;
        self.tags.remove(&tag);
        Some(plain)
    }

    /// Seal a reply for a tag taken from a lookup message.
    pub fn encrypt_reply(
        session_key: &[u8; 32],
        tag: &[u8; 8],
        payload: &[u8],
    ) -> Result<Vec<u8>, DataError> {
        let sealed = aead::seal(session_key, &[0u8; 12], tag, payload)?;
        let mut out = Vec::with_capacity(8 + sealed.len());
        out.extend_from_slice(tag);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn cleanup(&mut self, now_seconds: u64) {
        self.tags
            .retain(|_, t| t.registered_at + TAG_EXPIRATION > now_seconds);
    }
}
