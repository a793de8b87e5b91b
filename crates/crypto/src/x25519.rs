//! X25519 key agreement.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 keypair. Static keys live in router/destination identities;
/// ephemerals are generated per handshake or per build record.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        let secret = StaticSecret::from(*self.secret.as_bytes());
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*secret);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        *self.secret.as_bytes()
    }

    /// `x25519(our_secret, their_public)`.
    pub fn agree(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = PublicKey::from(*their_public);
        *self.secret.diffie_hellman(&their_public).as_bytes()
    }
}

/// One-shot agreement from raw secret bytes.
pub fn agree(secret: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
    KeyPair::from_secret_bytes(secret).agree(public)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_symmetry() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        assert_eq!(
            alice.agree(&bob.public_bytes()),
            bob.agree(&alice.public_bytes())
        );
    }

    #[test]
    fn test_restore_from_secret() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&kp.secret_bytes());
        assert_eq!(kp.public_bytes(), restored.public_bytes());
    }
}
