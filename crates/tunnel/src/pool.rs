//! Tunnel pools.
//!
//! Each destination (and the router's exploratory set) keeps a pool of
//! inbound and outbound tunnels, rebuilt as members age out. The pool picks
//! paths through a caller-supplied peer selector so netdb policy stays out
//! of this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use veil_core::time;
use veil_data::lease_set::Lease;
use veil_data::Identity;

use crate::hop::{create_path, set_reply_hop};
use crate::tunnel::{Tunnel, TunnelState};
use crate::TunnelError;

/// Chooses path peers. Implemented by the netdb layer.
pub trait PeerSelector: Send + Sync {
    /// Pick `count` distinct relay identities, excluding `exclude`.
    fn select_peers(&self, count: usize, exclude: &[veil_core::IdentHash]) -> Vec<Arc<Identity>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub inbound_length: u8,
    pub outbound_length: u8,
    pub inbound_quantity: u8,
    pub outbound_quantity: u8,
    pub inbound_length_variance: i8,
    pub outbound_length_variance: i8,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            inbound_length: 3,
            outbound_length: 3,
            inbound_quantity: 5,
            outbound_quantity: 5,
            inbound_length_variance: 0,
            outbound_length_variance: 0,
        }
    }
}

fn vary(len: u8, variance: i8) -> usize {
    if variance == 0 {
        return len as usize;
    }
    let spread = variance.unsigned_abs() as i16;
    let delta = rand::thread_rng().gen_range(-spread..=spread);
    (len as i16 + delta).clamp(0, 7) as usize
}

pub struct TunnelPool {
    config: PoolConfig,
    inbound: Vec<Tunnel>,
    outbound: Vec<Tunnel>,
    num_builds: u64,
    num_successes: u64,
    queued_messages: AtomicUsize,
}

impl TunnelPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inbound: Vec::new(),
            outbound: Vec::new(),
            num_builds: 0,
            num_successes: 0,
            queued_messages: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Apply a new configuration. Returns whether the pool shape changed.
    pub fn reconfigure(&mut self, config: PoolConfig) -> bool {
        if self.config == config {
            return false;
        }
        self.config = config;
        true
    }

    /// Tunnels still needed per direction: `(inbound, outbound)`.
    pub fn deficit(&self, now_seconds: u64) -> (usize, usize) {
        let usable = |tunnels: &[Tunnel]| {
            tunnels
                .iter()
                .filter(|t| {
                    matches!(t.state, TunnelState::Pending | TunnelState::Established)
                        && !t.is_expiring(now_seconds)
                })
                .count()
        };
        (
            (self.config.inbound_quantity as usize).saturating_sub(usable(&self.inbound)),
            (self.config.outbound_quantity as usize).saturating_sub(usable(&self.outbound)),
        )
    }

    /// Create a pending tunnel with a freshly selected path. The caller
    /// sends the build message and later resolves the pending state.
    pub fn create_tunnel(
        &mut self,
        selector: &dyn PeerSelector,
        inbound: bool,
        exclude: &[veil_core::IdentHash],
    ) -> Result<&mut Tunnel, TunnelError> {
        let (len, variance) = if inbound {
            (self.config.inbound_length, self.config.inbound_length_variance)
        } else {
            (self.config.outbound_length, self.config.outbound_length_variance)
        };
        let hop_count = vary(len, variance).max(1);
        let peers = selector.select_peers(hop_count, exclude);
        if peers.len() < hop_count {
            return Err(TunnelError::NoPeers);
        }
        let mut hops = create_path(&peers);
        for (i, hop) in hops.iter_mut().enumerate() {
            hop.record_index = i;
        }
        self.num_builds += 1;
        let tunnel = Tunnel::new(inbound, hops);
        debug!(
            "Pool: building {} tunnel {} with {} hops",
            if inbound { "inbound" } else { "outbound" },
            tunnel.id,
            hop_count
        );
        let list = if inbound { &mut self.inbound } else { &mut self.outbound };
        list.push(tunnel);
        Ok(list.last_mut().expect("just pushed"))
    }

    /// Point an outbound tunnel's endpoint at one of our inbound gateways.
    pub fn bind_reply_path(&mut self, outbound_id: u32) -> bool {
        let Some((gateway, tunnel_id)) = self
            .inbound
            .iter()
            .find(|t| t.is_established())
            .and_then(|t| t.gateway())
        else {
            return false;
        };
        if let Some(tunnel) = self.outbound.iter_mut().find(|t| t.id == outbound_id) {
            set_reply_hop(&mut tunnel.hops, tunnel_id, gateway);
            true
        } else {
            false
        }
    }

    pub fn tunnel_established(&mut self, id: u32) {
        for tunnel in self.inbound.iter_mut().chain(self.outbound.iter_mut()) {
            if tunnel.id == id {
                tunnel.state = TunnelState::Established;
                self.num_successes += 1;
                return;
            }
        }
    }

    pub fn tunnel_failed(&mut self, id: u32) {
        for tunnel in self.inbound.iter_mut().chain(self.outbound.iter_mut()) {
            if tunnel.id == id {
                tunnel.mark_failed();
                return;
            }
        }
    }

    /// Fail every tunnel whose path crosses a disconnected peer.
    pub fn peer_disconnected(&mut self, peer: &veil_core::IdentHash) {
        for tunnel in self.inbound.iter_mut().chain(self.outbound.iter_mut()) {
            if tunnel.peers().contains(peer) {
                tunnel.mark_failed();
            }
        }
    }

    pub fn select_outbound(&self) -> Option<&Tunnel> {
        let established: Vec<_> = self.outbound.iter().filter(|t| t.is_established()).collect();
        established.choose(&mut rand::thread_rng()).copied()
    }

    pub fn select_inbound(&self) -> Option<&Tunnel> {
        let established: Vec<_> = self.inbound.iter().filter(|t| t.is_established()).collect();
        established.choose(&mut rand::thread_rng()).copied()
    }

    pub fn inbound_tunnels(&self) -> &[Tunnel] {
        &self.inbound
    }

    pub fn outbound_tunnels(&self) -> &[Tunnel] {
        &self.outbound
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut Tunnel> {
        self.inbound
            .iter_mut()
            .chain(self.outbound.iter_mut())
            .find(|t| t.id == id)
    }

    /// Leases over the established inbound tunnels, newest-expiring first,
    /// capped at `max`.
    pub fn leases(&self, max: usize) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .inbound
            .iter()
            .filter(|t| t.is_established())
            .filter_map(|t| {
                let (gateway, tunnel_id) = t.gateway()?;
                Some(Lease {
                    gateway,
                    tunnel_id,
                    end_date: (t.creation_time + crate::tunnel::TUNNEL_EXPIRATION_TIMEOUT) * 1000,
                })
            })
            .collect();
        leases.sort_by(|a, b| b.end_date.cmp(&a.end_date));
        leases.truncate(max);
        leases
    }

    /// Drop expired and failed tunnels, mark expiring ones, time out stale
    /// pending builds. Returns how many tunnels were dropped.
    pub fn maintain(&mut self, now_seconds: u64) -> usize {
        let mut dropped = 0;
        for list in [&mut self.inbound, &mut self.outbound] {
            for tunnel in list.iter_mut() {
                if tunnel.is_build_timed_out(now_seconds) {
                    tunnel.mark_failed();
                } else if tunnel.is_established() && tunnel.is_expiring(now_seconds) {
                    tunnel.state = TunnelState::Expiring;
                }
            }
            let before = list.len();
            list.retain(|t| t.state != TunnelState::Failed && !t.is_expired(now_seconds));
            dropped += before - list.len();
        }
        dropped
    }

    /// Fraction of build attempts that succeeded; 1.0 before any attempt.
    pub fn creation_success_rate(&self) -> f64 {
        if self.num_builds == 0 {
            return 1.0;
        }
        self.num_successes as f64 / self.num_builds as f64
    }

    pub fn queue_size(&self) -> usize {
        self.queued_messages.load(Ordering::Relaxed)
    }

    pub fn note_queued(&self, delta: isize) {
        if delta >= 0 {
            self.queued_messages.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            self.queued_messages
                .fetch_sub((-delta) as usize, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_data::PrivateKeys;

    struct FixedSelector {
        peers: Vec<Arc<Identity>>,
    }

    impl PeerSelector for FixedSelector {
        fn select_peers(
            &self,
            count: usize,
            exclude: &[veil_core::IdentHash],
        ) -> Vec<Arc<Identity>> {
            self.peers
                .iter()
                .filter(|p| !exclude.contains(&p.hash()))
                .take(count)
                .cloned()
                .collect()
        }
    }

    fn selector(n: usize) -> FixedSelector {
        FixedSelector {
            peers: (0..n)
                .map(|_| Arc::new(PrivateKeys::generate().unwrap().identity().clone()))
                .collect(),
        }
    }

    #[test]
    fn test_deficit_and_build() {
        let mut pool = TunnelPool::new(PoolConfig {
            inbound_quantity: 2,
            outbound_quantity: 1,
            inbound_length: 2,
            outbound_length: 2,
            ..PoolConfig::default()
        });
        let sel = selector(4);
        let now = time::seconds_since_epoch();
        assert_eq!(pool.deficit(now), (2, 1));

        let id = pool.create_tunnel(&sel, true, &[]).unwrap().id;
        pool.tunnel_established(id);
        assert_eq!(pool.deficit(now), (1, 1));
        assert!(pool.select_inbound().is_some());
        assert!(pool.select_outbound().is_none());
    }

    #[test]
    fn test_no_peers_error() {
        let mut pool = TunnelPool::new(PoolConfig::default());
        let sel = selector(1);
        assert!(matches!(
            pool.create_tunnel(&sel, false, &[]),
            Err(TunnelError::NoPeers)
        ));
    }

    #[test]
    fn test_leases_from_established_inbound() {
        let mut pool = TunnelPool::new(PoolConfig {
            inbound_length: 1,
            ..PoolConfig::default()
        });
        let sel = selector(3);
        let ids: Vec<u32> = (0..3)
            .map(|_| pool.create_tunnel(&sel, true, &[]).unwrap().id)
            .collect();
        // only two get established
        pool.tunnel_established(ids[0]);
        pool.tunnel_established(ids[1]);
        let leases = pool.leases(16);
        assert_eq!(leases.len(), 2);
        assert!(leases.iter().all(|l| l.end_date > 0));
    }

    #[test]
    fn test_maintain_drops_failed_and_expired() {
        let mut pool = TunnelPool::new(PoolConfig {
            inbound_length: 1,
            ..PoolConfig::default()
        });
        let sel = selector(2);
        let id = pool.create_tunnel(&sel, true, &[]).unwrap().id;
        pool.tunnel_failed(id);
        assert_eq!(pool.maintain(time::seconds_since_epoch()), 1);
        assert!(pool.inbound_tunnels().is_empty());
    }

    #[test]
    fn test_peer_disconnect_fails_tunnels() {
        let mut pool = TunnelPool::new(PoolConfig {
            outbound_length: 2,
            ..PoolConfig::default()
        });
        let sel = selector(3);
        let id = pool.create_tunnel(&sel, false, &[]).unwrap().id;
        pool.tunnel_established(id);
        let peer = pool.outbound_tunnels()[0].peers()[0];
        pool.peer_disconnected(&peer);
        assert_eq!(pool.outbound_tunnels()[0].state, TunnelState::Failed);
    }

    #[test]
    fn test_reconfigure_reports_change() {
        let mut pool = TunnelPool::new(PoolConfig::default());
        assert!(!pool.reconfigure(PoolConfig::default()));
        assert!(pool.reconfigure(PoolConfig {
            inbound_length: 1,
            ..PoolConfig::default()
        }));
    }

    #[test]
    fn test_success_rate() {
        let mut pool = TunnelPool::new(PoolConfig {
            inbound_length: 1,
            ..PoolConfig::default()
        });
        let sel = selector(2);
        assert_eq!(pool.creation_success_rate(), 1.0);
        let a = pool.create_tunnel(&sel, true, &[]).unwrap().id;
        let _b = pool.create_tunnel(&sel, true, &[]).unwrap().id;
        pool.tunnel_established(a);
        assert_eq!(pool.creation_success_rate(), 0.5);
    }
}
