//! Tunnel state and layered cipher.
//!
//! A tunnel lives ten minutes from creation; the last minute is a safety
//! margin during which replacements are built. Participants apply one AES
//! layer per tunnel-data message (IV whitening, CBC payload, IV whitening
//! again); the creator composes or strips all layers at once.

use veil_core::{time, IdentHash, TunnelId};
use veil_crypto::aes;

use crate::build;
use crate::hop::HopConfig;
use crate::TunnelError;

/// Tunnel data messages carry a 16-byte IV and 1008 payload bytes.
pub const TUNNEL_DATA_ENCRYPTED_SIZE: usize = 1024;

pub const TUNNEL_EXPIRATION_TIMEOUT: u64 = 600; // seconds
pub const TUNNEL_EXPIRATION_THRESHOLD: u64 = 60; // seconds
pub const TUNNEL_CREATION_TIMEOUT: u64 = 30; // seconds

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Pending,
    Established,
    Expiring,
    Failed,
}

/// One AES layer, as a participant applies it.
pub fn layer_encrypt(layer_key: &[u8; 32], iv_key: &[u8; 32], buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), TUNNEL_DATA_ENCRYPTED_SIZE);
    let (iv, payload) = buf.split_at_mut(16);
    let iv: &mut [u8; 16] = iv.try_into().expect("16-byte IV");
    aes::encrypt_block(iv_key, iv);
    aes::encrypt(layer_key, iv, payload).expect("1008-byte payload");
    aes::encrypt_block(iv_key, iv);
}

/// Strip one AES layer.
pub fn layer_decrypt(layer_key: &[u8; 32], iv_key: &[u8; 32], buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), TUNNEL_DATA_ENCRYPTED_SIZE);
    let (iv, payload) = buf.split_at_mut(16);
    let iv: &mut [u8; 16] = iv.try_into().expect("16-byte IV");
    aes::decrypt_block(iv_key, iv);
    aes::decrypt(layer_key, iv, payload).expect("1008-byte payload");
    aes::decrypt_block(iv_key, iv);
}

pub struct Tunnel {
    pub id: TunnelId,
    pub is_inbound: bool,
    pub hops: Vec<HopConfig>,
    pub state: TunnelState,
    /// Seconds since epoch.
    pub creation_time: u64,
    latency_samples: Vec<u32>,
}

impl Tunnel {
    pub fn new(is_inbound: bool, hops: Vec<HopConfig>) -> Self {
        let id = if is_inbound {
            hops.last().map(|h| h.tunnel_id).unwrap_or(0)
        } else {
            hops.first().map(|h| h.tunnel_id).unwrap_or(0)
        };
        Self {
            id,
            is_inbound,
            hops,
            state: TunnelState::Pending,
            creation_time: time::seconds_since_epoch(),
            latency_samples: Vec::new(),
        }
    }

    /// Ordered peer hashes of the path.
    pub fn peers(&self) -> Vec<IdentHash> {
        self.hops.iter().map(|h| h.ident.hash()).collect()
    }

    /// For an inbound tunnel, the gateway a remote sender targets.
    pub fn gateway(&self) -> Option<(IdentHash, TunnelId)> {
        self.hops.first().map(|h| (h.ident.hash(), h.tunnel_id))
    }

    /// For an outbound tunnel, the endpoint hop handing traffic onward.
    pub fn endpoint(&self) -> Option<&HopConfig> {
        self.hops.last()
    }

    pub fn is_established(&self) -> bool {
        self.state == TunnelState::Established
    }

    pub fn is_expired(&self, now_seconds: u64) -> bool {
        now_seconds >= self.creation_time + TUNNEL_EXPIRATION_TIMEOUT
    }

    /// Expiration minus the safety threshold: time to build a replacement.
    pub fn is_expiring(&self, now_seconds: u64) -> bool {
        now_seconds + TUNNEL_EXPIRATION_THRESHOLD
            >= self.creation_time + TUNNEL_EXPIRATION_TIMEOUT
    }

    pub fn is_build_timed_out(&self, now_seconds: u64) -> bool {
        self.state == TunnelState::Pending
            && now_seconds >= self.creation_time + TUNNEL_CREATION_TIMEOUT
    }

    /// Process the hop reply records of a short build. All-accept moves the
    /// tunnel to Established; any reject fails it.
    pub fn handle_short_build_reply(
        &mut self,
        records: &[[u8; build::SHORT_RECORD_SIZE]],
    ) -> Result<(), TunnelError> {
        if records.len() < self.hops.len() {
            self.state = TunnelState::Failed;
            return Err(TunnelError::Malformed("reply record count"));
        }
        for i in 0..self.hops.len() {
            let code = build::decrypt_short_reply(&self.hops, i, &records[i])?;
            if code != build::REPLY_ACCEPT {
                self.state = TunnelState::Failed;
                return Err(TunnelError::Rejected(code));
            }
        }
        self.state = TunnelState::Established;
        Ok(())
    }

    pub fn mark_failed(&mut self) {
        self.state = TunnelState::Failed;
    }

    pub fn add_latency_sample(&mut self, rtt_ms: u32) {
        self.latency_samples.push(rtt_ms);
        if self.latency_samples.len() > 10 {
            self.latency_samples.remove(0);
        }
    }

    pub fn mean_latency(&self) -> Option<u32> {
        if self.latency_samples.is_empty() {
            return None;
        }
        Some(self.latency_samples.iter().sum::<u32>() / self.latency_samples.len() as u32)
    }

    /// Creator side, outbound: pre-strip every hop's layer so the payload
    /// emerges in the clear at the endpoint.
    pub fn wrap_outbound(&self, buf: &mut [u8]) {
        for hop in self.hops.iter().rev() {
            layer_decrypt(&hop.layer_key, &hop.iv_key, buf);
        }
    }

    /// Creator side, inbound: strip the layers the hops applied on the way
    /// here.
    pub fn unwrap_inbound(&self, buf: &mut [u8]) {
        for hop in self.hops.iter().rev() {
            layer_decrypt(&hop.layer_key, &hop.iv_key, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::create_path;
    use std::sync::Arc;
    use veil_data::PrivateKeys;

    fn make_hops(n: usize) -> Vec<HopConfig> {
        let idents: Vec<_> = (0..n)
            .map(|_| Arc::new(PrivateKeys::generate().unwrap().identity().clone()))
            .collect();
        let mut hops = create_path(&idents);
        for (i, hop) in hops.iter_mut().enumerate() {
            hop.record_index = i;
            hop.layer_key = [i as u8 + 1; 32];
            hop.iv_key = [i as u8 + 101; 32];
        }
        hops
    }

    #[test]
    fn test_layer_roundtrip() {
        let mut buf = vec![7u8; TUNNEL_DATA_ENCRYPTED_SIZE];
        let original = buf.clone();
        layer_encrypt(&[1u8; 32], &[2u8; 32], &mut buf);
        assert_ne!(buf, original);
        layer_decrypt(&[1u8; 32], &[2u8; 32], &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_outbound_wrap_cancels_hop_layers() {
        let tunnel = Tunnel::new(false, make_hops(3));
        let mut buf = vec![42u8; TUNNEL_DATA_ENCRYPTED_SIZE];
        let original = buf.clone();
        tunnel.wrap_outbound(&mut buf);
        // the message passes the hops in path order, each encrypting
        for hop in &tunnel.hops {
            layer_encrypt(&hop.layer_key, &hop.iv_key, &mut buf);
        }
        assert_eq!(buf, original);
    }

    #[test]
    fn test_inbound_unwrap() {
        let tunnel = Tunnel::new(true, make_hops(2));
        let mut buf = vec![9u8; TUNNEL_DATA_ENCRYPTED_SIZE];
        let original = buf.clone();
        for hop in &tunnel.hops {
            layer_encrypt(&hop.layer_key, &hop.iv_key, &mut buf);
        }
        tunnel.unwrap_inbound(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_expiration_schedule() {
        let mut tunnel = Tunnel::new(true, make_hops(1));
        tunnel.state = TunnelState::Established;
        let t0 = tunnel.creation_time;
        assert!(!tunnel.is_expiring(t0));
        assert!(tunnel.is_expiring(t0 + TUNNEL_EXPIRATION_TIMEOUT - TUNNEL_EXPIRATION_THRESHOLD));
        assert!(!tunnel.is_expired(t0 + TUNNEL_EXPIRATION_TIMEOUT - 1));
        assert!(tunnel.is_expired(t0 + TUNNEL_EXPIRATION_TIMEOUT));
    }

    #[test]
    fn test_inbound_gateway_is_first_hop() {
        let tunnel = Tunnel::new(true, make_hops(3));
        let (gw, id) = tunnel.gateway().unwrap();
        assert_eq!(gw, tunnel.hops[0].ident.hash());
        assert_eq!(id, tunnel.hops[0].tunnel_id);
        // the inbound tunnel's own id is the far (our) end
        assert_eq!(tunnel.id, tunnel.hops[2].tunnel_id);
    }
}
