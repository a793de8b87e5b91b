//! Per-hop tunnel configuration.
//!
//! A tunnel path is an ordered chain of hop records. Each hop learns only
//! its own receive tunnel id and where to forward next; the creator keeps
//! the whole chain plus the symmetric keys each hop derived.

use rand::Rng;

use veil_core::{IdentHash, TunnelId};
use veil_data::Identity;

use std::sync::Arc;

fn random_tunnel_id() -> TunnelId {
    // zero is reserved
    rand::thread_rng().gen_range(1..=u32::MAX)
}

pub struct HopConfig {
    pub ident: Arc<Identity>,
    /// Tunnel id this hop receives on.
    pub tunnel_id: TunnelId,
    /// Where this hop forwards: the next hop, or the reply destination for
    /// the endpoint.
    pub next_tunnel_id: TunnelId,
    pub next_ident: IdentHash,
    pub is_gateway: bool,
    pub is_endpoint: bool,
    pub record_index: usize,

    // filled during build-record encryption
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub reply_key: [u8; 32],
    pub reply_iv: [u8; 16],
    /// Handshake hash at reply time (AD for the response record).
    pub reply_ad: [u8; 32],
    /// AEAD key for the long-form response record (the final chaining key).
    pub response_key: [u8; 32],
    /// Garlic key and tag for the endpoint's wrapped reply.
    pub garlic: Option<([u8; 32], u64)>,
}

impl HopConfig {
    pub fn new(ident: Arc<Identity>) -> Self {
        Self {
            ident,
            tunnel_id: random_tunnel_id(),
            next_tunnel_id: 0,
            next_ident: IdentHash::zero(),
            is_gateway: true,
            is_endpoint: true,
            record_index: 0,
            layer_key: [0u8; 32],
            iv_key: [0u8; 32],
            reply_key: [0u8; 32],
            reply_iv: [0u8; 16],
            reply_ad: [0u8; 32],
            response_key: [0u8; 32],
            garlic: None,
        }
    }
}

/// Build the hop chain for a path of peer identities. For an inbound tunnel
/// the last hop is us; for outbound the reply hop is set separately.
pub fn create_path(peers: &[Arc<Identity>]) -> Vec<HopConfig> {
    let mut hops: Vec<HopConfig> = peers.iter().map(|p| HopConfig::new(p.clone())).collect();
    for i in 0..hops.len() {
        if i + 1 < hops.len() {
            let (next_ident, next_tunnel_id) = {
                let next = &hops[i + 1];
                (next.ident.hash(), next.tunnel_id)
            };
            let hop = &mut hops[i];
            hop.next_ident = next_ident;
            hop.next_tunnel_id = next_tunnel_id;
            hop.is_endpoint = false;
        }
        if i > 0 {
            hops[i].is_gateway = false;
        }
    }
    hops
}

/// Point the endpoint hop of an outbound tunnel back at a reply gateway
/// (one of our inbound tunnels).
pub fn set_reply_hop(hops: &mut [HopConfig], reply_tunnel_id: TunnelId, reply_ident: IdentHash) {
    if let Some(last) = hops.last_mut() {
        last.next_tunnel_id = reply_tunnel_id;
        last.next_ident = reply_ident;
        last.is_endpoint = true;
    }
}
