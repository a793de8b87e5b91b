//! The authoritative router and LeaseSet stores.
//!
//! One mutex guards each map; callers hold `Arc`s to entries and never the
//! locks. Floodfill membership is mirrored into the binary trie so closest-
//! floodfill queries run against routing keys without touching the maps.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use veil_core::{time, IdentHash};
use veil_data::lease_set::LeaseSet;
use veil_data::router_info::RouterInfo;
use veil_data::Identity;
use veil_tunnel::pool::PeerSelector;

use crate::dht::DhtTable;
use crate::persist::NetDbStorage;
use crate::routing_key::routing_key;
use crate::NetDbError;

pub const NETDB_MIN_ROUTERS: usize = 90;
pub const NETDB_MIN_FLOODFILLS: usize = 5;
pub const NETDB_TUNNEL_CREATION_RATE_THRESHOLD: f64 = 0.10;
pub const NETDB_FLOODFILL_EXPIRATION_TIMEOUT: u64 = 60 * 60; // seconds
pub const NETDB_MIN_EXPIRATION_TIMEOUT: u64 = 90 * 60; // seconds
pub const NETDB_MAX_EXPIRATION_TIMEOUT: u64 = 27 * 60 * 60; // seconds
pub const NETDB_MAX_EXPLORATORY_SELECTION_SIZE: usize = 500;
pub const NETDB_EXPLORATORY_SELECTION_UPDATE_INTERVAL: u64 = 82; // seconds
pub const NETDB_NUM_FLOODS: usize = 3;

/// Supplies fresh descriptors when the table runs dry. The HTTPS reseed
/// client lives outside the core.
pub trait ReseedProvider: Send + Sync {
    fn reseed(&self) -> Vec<Vec<u8>>;
}

/// Verifies family signatures against the trusted certificates. The
/// certificate store is external.
pub trait FamilyVerifier: Send + Sync {
    fn verify(&self, family: &str, member: &IdentHash, signature: &str) -> bool;
    /// The family of the local router, if any; members are excluded from
    /// exploratory selections.
    fn local_family(&self) -> Option<String>;
}

pub struct NetDb {
    routers: Mutex<HashMap<IdentHash, Arc<RouterInfo>>>,
    lease_sets: Mutex<HashMap<IdentHash, Arc<LeaseSet>>>,
    floodfills: Mutex<DhtTable>,
    exploratory_selection: Mutex<Vec<IdentHash>>,
    exploratory_selection_time: Mutex<u64>,
    storage: Option<NetDbStorage>,
    local_hash: IdentHash,
}

impl NetDb {
    pub fn new(local_hash: IdentHash, data_dir: Option<&Path>) -> Self {
        Self {
            routers: Mutex::new(HashMap::new()),
            lease_sets: Mutex::new(HashMap::new()),
            floodfills: Mutex::new(DhtTable::new()),
            exploratory_selection: Mutex::new(Vec::new()),
            exploratory_selection_time: Mutex::new(0),
            storage: data_dir.map(NetDbStorage::new),
            local_hash,
        }
    }

    /// Load persisted descriptors. Expired or malformed files are dropped
    /// on the floor.
    pub fn load(&self) {
        let Some(storage) = &self.storage else { return };
        let mut loaded = 0;
        for buf in storage.load_all() {
            if self.add_router_info(&buf).is_ok() {
                loaded += 1;
            }
        }
        info!("NetDb: loaded {loaded} router descriptors");
    }

    pub fn num_routers(&self) -> usize {
        self.routers.lock().expect("router map").len()
    }

    pub fn num_floodfills(&self) -> usize {
        self.floodfills.lock().expect("floodfill dht").len()
    }

    pub fn num_lease_sets(&self) -> usize {
        self.lease_sets.lock().expect("leaseset map").len()
    }

    /// Whether the table is too small to operate and a reseed is needed.
    pub fn needs_reseed(&self) -> bool {
        self.num_routers() < NETDB_MIN_ROUTERS
    }

    /// Import a reseed bundle. Returns newly added floodfills for chained
    /// exploration.
    pub fn import_reseed(&self, provider: &dyn ReseedProvider) -> Vec<IdentHash> {
        let mut new_floodfills = Vec::new();
        for buf in provider.reseed() {
            if let Ok(ri) = self.add_router_info(&buf) {
                if ri.is_floodfill() {
                    new_floodfills.push(ri.hash());
                }
            }
        }
        info!(
            "NetDb: reseed done, {} routers known, {} new floodfills",
            self.num_routers(),
            new_floodfills.len()
        );
        new_floodfills
    }

    /// Parse, validate and store a router descriptor. Stale and replayed
    /// copies are rejected; the freshest copy wins.
    pub fn add_router_info(&self, buf: &[u8]) -> Result<Arc<RouterInfo>, NetDbError> {
        let ri = RouterInfo::from_buffer(buf)?;
        if ri.hash() != self.local_hash && !ri.is_timestamp_acceptable(time::millis_since_epoch()) {
            return Err(NetDbError::Rejected("timestamp out of window"));
        }
        let hash = ri.hash();
        let ri = Arc::new(ri);
        {
            let mut routers = self.routers.lock().expect("router map");
            if let Some(existing) = routers.get(&hash) {
                if existing.timestamp() >= ri.timestamp() {
                    return Err(NetDbError::Stale(hash));
                }
            }
            routers.insert(hash, ri.clone());
        }
        {
            let mut floodfills = self.floodfills.lock().expect("floodfill dht");
            if ri.is_floodfill() {
                floodfills.insert(hash);
            } else {
                floodfills.remove(&hash);
            }
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_router(&hash, buf) {
                warn!("NetDb: persist failed for {hash}: {e}");
            }
        }
        Ok(ri)
    }

    /// Store a LeaseSet under its store key. Updates are monotonic by
    /// `(published, expiration)`; older copies are ignored.
    pub fn add_lease_set(&self, key: IdentHash, ls: LeaseSet) -> Result<Arc<LeaseSet>, NetDbError> {
        let now = time::millis_since_epoch();
        if ls.is_expired(now) || !ls.has_non_expired_lease(now) {
            return Err(NetDbError::Rejected("expired lease set"));
        }
        let mut lease_sets = self.lease_sets.lock().expect("leaseset map");
        if let Some(existing) = lease_sets.get(&key) {
            if !ls.is_newer_than(existing) {
                return Err(NetDbError::Stale(key));
            }
        }
        let ls = Arc::new(ls);
        lease_sets.insert(key, ls.clone());
        Ok(ls)
    }

    pub fn find_router(&self, hash: &IdentHash) -> Option<Arc<RouterInfo>> {
        self.routers.lock().expect("router map").get(hash).cloned()
    }

    pub fn find_lease_set(&self, key: &IdentHash) -> Option<Arc<LeaseSet>> {
        self.lease_sets.lock().expect("leaseset map").get(key).cloned()
    }

    /// Closest floodfill to `target`'s routing key, skipping `excluded`.
    pub fn closest_floodfill(
        &self,
        target: &IdentHash,
        excluded: &HashSet<IdentHash>,
        next_day: bool,
    ) -> Option<Arc<RouterInfo>> {
        let key = routing_key(target, next_day);
        let now = time::seconds_since_epoch();
        let hash = self.floodfills.lock().expect("floodfill dht").find_closest(&key, |h| {
            !excluded.contains(h)
                && *h != self.local_hash
                && self
                    .find_router(h)
                    .map(|r| !r.is_high_congestion(now))
                    .unwrap_or(false)
        })?;
        self.find_router(&hash)
    }

    /// Up to `num` closest floodfills in XOR order.
    pub fn closest_floodfills(
        &self,
        target: &IdentHash,
        num: usize,
        excluded: &HashSet<IdentHash>,
        next_day: bool,
    ) -> Vec<IdentHash> {
        let key = routing_key(target, next_day);
        self.floodfills
            .lock()
            .expect("floodfill dht")
            .find_closest_n(&key, num, |h| !excluded.contains(h) && *h != self.local_hash)
    }

    /// Floodfills a received store should be forwarded to, excluding the
    /// source. Near the rotation boundary callers also flood to tomorrow's
    /// set.
    pub fn flood_targets(
        &self,
        key: &IdentHash,
        source: &IdentHash,
        both_days: bool,
    ) -> Vec<IdentHash> {
        let mut excluded = HashSet::new();
        excluded.insert(*source);
        let mut targets = self.closest_floodfills(key, NETDB_NUM_FLOODS, &excluded, false);
        if both_days {
            for t in self.closest_floodfills(key, NETDB_NUM_FLOODS, &excluded, true) {
                if !targets.contains(&t) {
                    targets.push(t);
                }
            }
        }
        targets
    }

    /// Random reachable router for transit or path building.
    pub fn random_router<F>(&self, filter: F) -> Option<Arc<RouterInfo>>
    where
        F: Fn(&RouterInfo) -> bool,
    {
        let routers = self.routers.lock().expect("router map");
        let candidates: Vec<_> = routers
            .values()
            .filter(|r| r.hash() != self.local_hash && r.is_reachable() && filter(r))
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|r| (*r).clone())
    }

    /// Refresh the exploratory selection: up to 500 floodfills, excluding
    /// our own family, reshuffled every 82 seconds.
    pub fn refresh_exploratory_selection(&self, families: Option<&dyn FamilyVerifier>) {
        let now = time::seconds_since_epoch();
        {
            let last = self.exploratory_selection_time.lock().expect("selection time");
            if *last + NETDB_EXPLORATORY_SELECTION_UPDATE_INTERVAL > now {
                return;
            }
        }
        let local_family = families.and_then(|f| f.local_family());
        let routers = self.routers.lock().expect("router map");
        let mut selection: Vec<IdentHash> = routers
            .values()
            .filter(|r| r.is_floodfill())
            .filter(|r| match (&local_family, r.family()) {
                (Some(ours), Some(theirs)) => ours != theirs,
                _ => true,
            })
            .map(|r| r.hash())
            .collect();
        drop(routers);
        selection.shuffle(&mut rand::thread_rng());
        selection.truncate(NETDB_MAX_EXPLORATORY_SELECTION_SIZE);
        *self.exploratory_selection.lock().expect("selection") = selection;
        *self.exploratory_selection_time.lock().expect("selection time") = now;
    }

    pub fn exploratory_selection(&self) -> Vec<IdentHash> {
        self.exploratory_selection.lock().expect("selection").clone()
    }

    /// Drop expired routers, expire floodfill membership, persist nothing
    /// that has gone away. Returns the number of routers dropped.
    pub fn manage_router_infos(&self) -> usize {
        let now_ms = time::millis_since_epoch();
        let total = self.num_routers();
        let mut doomed = Vec::new();
        {
            let routers = self.routers.lock().expect("router map");
            for (hash, ri) in routers.iter() {
                if *hash == self.local_hash {
                    continue;
                }
                let age_ms = now_ms.saturating_sub(ri.timestamp());
                let expired = age_ms > NETDB_MAX_EXPIRATION_TIMEOUT * 1000
                    || (total > NETDB_MIN_ROUTERS
                        && !ri.is_reachable()
                        && age_ms > NETDB_MIN_EXPIRATION_TIMEOUT * 1000);
                if expired {
                    doomed.push(*hash);
                }
            }
        }
        {
            let mut routers = self.routers.lock().expect("router map");
            let mut floodfills = self.floodfills.lock().expect("floodfill dht");
            for hash in &doomed {
                routers.remove(hash);
                floodfills.remove(hash);
                if let Some(storage) = &self.storage {
                    storage.remove_router(hash);
                }
            }
            // floodfills with stale descriptors fall out of the DHT but
            // keep their RouterInfo until full expiration
            floodfills.cleanup(|h| {
                routers
                    .get(h)
                    .map(|r| {
                        now_ms.saturating_sub(r.timestamp())
                            <= NETDB_FLOODFILL_EXPIRATION_TIMEOUT * 1000
                    })
                    .unwrap_or(false)
            });
        }
        if !doomed.is_empty() {
            debug!("NetDb: dropped {} expired routers", doomed.len());
        }
        doomed.len()
    }

    /// Drop expired and leaseless LeaseSets.
    pub fn manage_lease_sets(&self) -> usize {
        let now = time::millis_since_epoch();
        let mut lease_sets = self.lease_sets.lock().expect("leaseset map");
        let before = lease_sets.len();
        lease_sets.retain(|_, ls| !ls.is_expired(now) && ls.has_non_expired_lease(now));
        before - lease_sets.len()
    }

    /// A random target for exploratory lookups.
    pub fn random_exploration_target(&self) -> IdentHash {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        IdentHash::new(bytes)
    }
}

impl PeerSelector for NetDb {
    fn select_peers(&self, count: usize, exclude: &[IdentHash]) -> Vec<Arc<Identity>> {
        let now = time::seconds_since_epoch();
        let routers = self.routers.lock().expect("router map");
        let mut candidates: Vec<_> = routers
            .values()
            .filter(|r| {
                r.hash() != self.local_hash
                    && r.is_reachable()
                    && !r.is_high_congestion(now)
                    && !exclude.contains(&r.hash())
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .take(count)
            .map(|r| Arc::new(r.identity().clone()))
            .collect()
    }
}
