//! Local destination lifecycle.
//!
//! A destination owns its keys, its tunnel pool, its current LeaseSet, a
//! cache of remote LeaseSets, and the reply-tag registry for lookups. It is
//! written sans-IO: publish and verification steps come out as value
//! objects the router wires through its tunnels.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use veil_core::config::{DestinationOptions, LeaseSetKind};
use veil_core::{time, IdentHash};
use veil_data::encrypted_ls2::{self, AuthScheme};
use veil_data::garlic::GarlicTagSet;
use veil_data::i2np::{self, DatabaseStore, I2npMessage};
use veil_data::lease_set::{self, LeaseSet, MAX_NUM_LEASES};
use veil_data::PrivateKeys;
use veil_netdb::requests::{CompletionCallback, NetDbRequests};
use veil_tunnel::pool::{PeerSelector, PoolConfig, TunnelPool};

use crate::DestinationError;

pub const PUBLISH_CONFIRMATION_TIMEOUT: u64 = 10; // seconds
pub const PUBLISH_MIN_INTERVAL: u64 = 20; // seconds
pub const PUBLISH_REGULAR_VERIFICATION_INTERVAL: u64 = 100; // seconds
pub const CLEANUP_INTERVAL: u64 = 300; // seconds
pub const LEASESET_EXPIRES_DELTA: u16 = 610; // seconds

/// Backup margin: build the LeaseSet only over tunnels that outlive the
/// freshest two by less than the margin, keeping spares out of publication.
pub const LEASE_BACKUP_MARGIN: usize = 2;

/// End-to-end protocol bytes.
pub const PROTOCOL_STREAMING: u8 = 6;
pub const PROTOCOL_DATAGRAM: u8 = 17;
pub const PROTOCOL_RAW: u8 = 18;

/// Registered by the streaming/datagram collaborators, keyed by protocol
/// and port.
pub type ProtocolHandler = Box<dyn Fn(u16, u16, &[u8]) + Send + Sync>;

/// A publish or verification step for the router to execute: send `message`
/// garlic-wrapped to `floodfill` through an outbound tunnel.
pub struct LeaseSetPublisher {
    pub floodfill: IdentHash,
    pub message: I2npMessage,
    pub reply_token: u32,
}

pub struct Destination {
    keys: PrivateKeys,
    options: DestinationOptions,
    pool: TunnelPool,
    data_dir: Option<PathBuf>,

    /// Current signed LeaseSet bytes and its store type.
    lease_set: Option<(u8, Vec<u8>)>,
    lease_set_updated: bool,

    remote_cache: HashMap<IdentHash, Arc<LeaseSet>>,
    requests: NetDbRequests,
    tags: GarlicTagSet,
    handlers: HashMap<(u8, u16), ProtocolHandler>,

    last_publish: u64,
    publish_token: u32,
    publish_confirmed: bool,
    publish_started: u64,
    last_verification: u64,
    excluded_floodfills: HashSet<IdentHash>,
    last_cleanup: u64,
}

impl Destination {
    pub fn new(
        keys: PrivateKeys,
        options: DestinationOptions,
        data_dir: Option<PathBuf>,
    ) -> Result<Self, DestinationError> {
        let pool = TunnelPool::new(PoolConfig {
            inbound_length: options.inbound_length,
            outbound_length: options.outbound_length,
            inbound_quantity: options.inbound_quantity,
            outbound_quantity: options.outbound_quantity,
            inbound_length_variance: options.inbound_length_variance,
            outbound_length_variance: options.outbound_length_variance,
        });
        let mut destination = Self {
            keys,
            options,
            pool,
            data_dir,
            lease_set: None,
            lease_set_updated: false,
            remote_cache: HashMap::new(),
            requests: NetDbRequests::new(),
            tags: GarlicTagSet::new(),
            handlers: HashMap::new(),
            last_publish: 0,
            publish_token: 0,
            publish_confirmed: true,
            publish_started: 0,
            last_verification: 0,
            excluded_floodfills: HashSet::new(),
            last_cleanup: time::seconds_since_epoch(),
        };
        destination.persist_keys()?;
        Ok(destination)
    }

    pub fn hash(&self) -> IdentHash {
        self.keys.identity().hash()
    }

    pub fn keys(&self) -> &PrivateKeys {
        &self.keys
    }

    pub fn pool(&self) -> &TunnelPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut TunnelPool {
        &mut self.pool
    }

    pub fn is_public(&self) -> bool {
        self.options.publish
    }

    /// Persist the transient encryption keys under
    /// `destinations/<b32>.<crypto-type>.dat` (256-byte public, 256-byte
    /// private, zero-padded).
    fn persist_keys(&self) -> Result<(), DestinationError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let destinations = dir.join("destinations");
        fs::create_dir_all(&destinations)?;
        for crypto_type in &self.options.lease_set_enc_types {
            let path = destinations.join(format!(
                "{}.{}.dat",
                self.hash().to_base32(),
                crypto_type
            ));
            if path.exists() {
                continue;
            }
            let mut blob = vec![0u8; 512];
            blob[..32].copy_from_slice(&self.keys.identity().x25519_pubkey());
            blob[256..288].copy_from_slice(&self.keys.x25519_secret());
            fs::write(path, blob)?;
        }
        Ok(())
    }

    /// Register a protocol handler for `(protocol, port)`. Port 0 catches
    /// all ports of the protocol.
    pub fn register_handler(&mut self, protocol: u8, port: u16, handler: ProtocolHandler) {
        self.handlers.insert((protocol, port), handler);
    }

    // ---- local LeaseSet ----

    /// The pool changed; rebuild the LeaseSet over current inbound
    /// gateways.
    pub fn set_lease_set_updated(&mut self) {
        self.lease_set_updated = true;
    }

    /// Build and sign the LeaseSet when marked dirty. Returns whether a new
    /// one was produced.
    pub fn update_lease_set(&mut self) -> Result<bool, DestinationError> {
        if !self.lease_set_updated {
            return Ok(false);
        }
        let leases = self.pool.leases(MAX_NUM_LEASES);
        if leases.is_empty() {
            return Err(DestinationError::NoTunnels);
        }
        // keep a backup margin: spares beyond the quantity stay out
        let publish_count = leases
            .len()
            .min(self.options.inbound_quantity as usize + LEASE_BACKUP_MARGIN)
            .min(MAX_NUM_LEASES);
        let leases = &leases[..publish_count];

        let published = time::seconds_since_epoch() as u32;
        let enc_keys: Vec<(u16, Vec<u8>)> = self
            .options
            .lease_set_enc_types
            .iter()
            .map(|t| (*t, self.keys.identity().x25519_pubkey().to_vec()))
            .collect();

        let (store_type, bytes) = match self.options.lease_set_kind {
            LeaseSetKind::Standard => (
                lease_set::STORE_TYPE_LEASESET,
                lease_set::build_standard_ls1(
                    &self.keys,
                    &{
                        let mut key = [0u8; 256];
                        key[..32].copy_from_slice(&self.keys.identity().x25519_pubkey());
                        key
                    },
                    leases,
                )?,
            ),
            LeaseSetKind::Standard2 => (
                lease_set::STORE_TYPE_STANDARD_LEASESET2,
                lease_set::build_standard_ls2(
                    &self.keys,
                    &enc_keys,
                    leases,
                    published,
                    LEASESET_EXPIRES_DELTA,
                    self.options.publish,
                )?,
            ),
            LeaseSetKind::Encrypted2 => {
                let inner = lease_set::build_standard_ls2(
                    &self.keys,
                    &enc_keys,
                    leases,
                    published,
                    LEASESET_EXPIRES_DELTA,
                    true,
                )?;
                let auth_dh: Vec<[u8; 32]> = decode_client_keys(&self.options.auth_dh_clients);
                let auth_psk: Vec<[u8; 32]> = decode_client_keys(&self.options.auth_psk_clients);
                let auth = match self.options.lease_set_auth {
                    veil_core::config::LeaseSetAuthKind::None => AuthScheme::None,
                    veil_core::config::LeaseSetAuthKind::Dh => AuthScheme::Dh(&auth_dh),
                    veil_core::config::LeaseSetAuthKind::Psk => AuthScheme::Psk(&auth_psk),
                };
                (
                    lease_set::STORE_TYPE_ENCRYPTED_LEASESET2,
                    encrypted_ls2::encrypt(
                        &self.keys,
                        &inner,
                        published,
                        LEASESET_EXPIRES_DELTA,
                        auth,
                    )?,
                )
            }
        };
        self.lease_set = Some((store_type, bytes));
        self.lease_set_updated = false;
        debug!("Destination {}: new LeaseSet with {} leases", self.hash(), publish_count);
        Ok(true)
    }

    pub fn lease_set(&self) -> Option<&(u8, Vec<u8>)> {
        self.lease_set.as_ref()
    }

    /// The key the LeaseSet is stored under: the identity hash, or the
    /// blinded store hash for encrypted publications.
    pub fn store_key(&self) -> Result<IdentHash, DestinationError> {
        if self.options.lease_set_kind == LeaseSetKind::Encrypted2 {
            let blinded = veil_data::blinding::BlindedPublicKey::from_identity(self.keys.identity())?;
            Ok(blinded.store_hash(&time::today())?)
        } else {
            Ok(self.hash())
        }
    }

    /// Produce the next publish step, if one is due and permitted.
    pub fn publish(
        &mut self,
        closest_floodfill: impl Fn(&IdentHash, &HashSet<IdentHash>) -> Option<IdentHash>,
    ) -> Result<Option<LeaseSetPublisher>, DestinationError> {
        if !self.options.publish {
            return Ok(None);
        }
        let now = time::seconds_since_epoch();
        if now < self.last_publish + PUBLISH_MIN_INTERVAL {
            return Err(DestinationError::RateLimited);
        }
        let Some((store_type, bytes)) = &self.lease_set else {
            return Ok(None);
        };
        let store_key = self.store_key()?;
        let Some(floodfill) = closest_floodfill(&store_key, &self.excluded_floodfills) else {
            return Err(DestinationError::NoFloodfill);
        };

        let token: u32 = rand::thread_rng().gen_range(1..u32::MAX);
        let message = DatabaseStore::build(&store_key, *store_type, bytes, token, None);
        self.publish_token = token;
        self.publish_confirmed = false;
        self.publish_started = now;
        self.last_publish = now;
        self.excluded_floodfills.insert(floodfill);
        info!("Destination {}: publishing LeaseSet to {floodfill}", self.hash());
        Ok(Some(LeaseSetPublisher {
            floodfill,
            message,
            reply_token: token,
        }))
    }

    /// DeliveryStatus confirming the publish token arrived. Clears the
    /// floodfill exclusion set: the cycle is complete.
    pub fn confirm_publish(&mut self, token: u32) -> bool {
        if token == self.publish_token && !self.publish_confirmed {
            self.publish_confirmed = true;
            self.excluded_floodfills.clear();
            debug!("Destination {}: publish confirmed", self.hash());
            true
        } else {
            false
        }
    }

    /// An unconfirmed publish past its timeout wants a retry.
    pub fn publish_timed_out(&self, now: u64) -> bool {
        !self.publish_confirmed && now >= self.publish_started + PUBLISH_CONFIRMATION_TIMEOUT
    }

    /// Regular re-verification is due: fetch the store key back from a
    /// floodfill other than the one published to.
    pub fn needs_verification(&self, now: u64) -> bool {
        self.publish_confirmed
            && self.options.publish
            && self.lease_set.is_some()
            && now >= self.last_verification + PUBLISH_REGULAR_VERIFICATION_INTERVAL
    }

    pub fn note_verification_started(&mut self) {
        self.last_verification = time::seconds_since_epoch();
    }

    /// Compare a fetched copy byte-wise; mismatch demands a republish.
    pub fn handle_verification_result(&mut self, fetched: Option<&[u8]>) -> bool {
        let matches = matches!(
            (&self.lease_set, fetched),
            (Some((_, ours)), Some(theirs)) if ours == theirs
        );
        if !matches {
            warn!("Destination {}: LeaseSet verification failed, republishing", self.hash());
            self.publish_confirmed = true; // allow the next publish cycle
            self.last_publish = 0;
        }
        matches
    }

    // ---- remote LeaseSets ----

    /// Resolve a destination: from cache when fresh, otherwise through a
    /// new or piggy-backed lookup. Returns the cached LeaseSet or None with
    /// the callback registered.
    pub fn request_destination(
        &mut self,
        dest: IdentHash,
        callback: CompletionCallback,
    ) -> Option<Arc<LeaseSet>> {
        let now = time::millis_since_epoch();
        if let Some(cached) = self.remote_cache.get(&dest) {
            if !cached.is_expired(now) && cached.has_non_expired_lease(now) {
                return Some(cached.clone());
            }
            self.remote_cache.remove(&dest);
        }
        self.requests.create_request(dest, false, Some(callback));
        None
    }

    pub fn requests(&self) -> &NetDbRequests {
        &self.requests
    }

    /// A LeaseSet arrived for an outstanding lookup.
    pub fn handle_lease_set_response(&mut self, key: IdentHash, ls: LeaseSet) {
        let buffer = ls.buffer().to_vec();
        let ls = Arc::new(ls);
        let now = time::millis_since_epoch();
        match self.remote_cache.get(&key) {
            Some(existing) if !ls.is_newer_than(existing) && !existing.is_expired(now) => {}
            _ => {
                self.remote_cache.insert(key, ls);
            }
        }
        self.requests.complete(&key, Some(buffer));
    }

    /// Register reply-path key material for a lookup message.
    pub fn register_reply_tag(&mut self) -> ([u8; 32], [u8; 8]) {
        self.tags.register()
    }

    pub fn decrypt_reply(&mut self, buf: &[u8]) -> Option<Vec<u8>> {
        self.tags.decrypt(buf)
    }

    // ---- inbound data ----

    /// Dispatch a received end-to-end Data message payload: 4-byte length,
    /// then the gzip-framed stream whose header carries ports and protocol.
    pub fn handle_data_message(&self, payload: &[u8]) -> Result<(), DestinationError> {
        if payload.len() < 13 {
            return Err(DestinationError::Data(veil_data::DataError::Truncated {
                need: 13 - payload.len(),
            }));
        }
        let length = u32::from_be_bytes(payload[..4].try_into().expect("4 bytes")) as usize;
        let framed = payload
            .get(4..4 + length)
            .ok_or(DestinationError::Data(veil_data::DataError::Malformed("data length")))?;
        // the I2CP gzip framing smuggles ports and protocol in the header
        let src_port = u16::from_be_bytes([framed[4], framed[5]]);
        let dest_port = u16::from_be_bytes([framed[6], framed[7]]);
        let protocol = framed[9];
        let data = i2np::gzip_decompress(framed)?;

        let handler = self
            .handlers
            .get(&(protocol, dest_port))
            .or_else(|| self.handlers.get(&(protocol, 0)))
            .ok_or(DestinationError::UnknownProtocol(protocol))?;
        handler(src_port, dest_port, &data);
        Ok(())
    }

    /// Frame an outbound payload the way `handle_data_message` expects.
    pub fn frame_data_message(src_port: u16, dest_port: u16, protocol: u8, data: &[u8]) -> Vec<u8> {
        let mut framed = i2np::gzip_compress(data);
        framed[4..6].copy_from_slice(&src_port.to_be_bytes());
        framed[6..8].copy_from_slice(&dest_port.to_be_bytes());
        framed[9] = protocol;
        let mut out = Vec::with_capacity(4 + framed.len());
        out.extend_from_slice(&(framed.len() as u32).to_be_bytes());
        out.extend_from_slice(&framed);
        out
    }

    /// Resolve and hand the remote's leases plus an outbound tunnel id to
    /// the streaming collaborator.
    pub fn create_stream(
        &mut self,
        dest: IdentHash,
        on_ready: Box<dyn FnOnce(Option<(Arc<LeaseSet>, Option<u32>)>) + Send>,
    ) {
        if let Some(ls) = self.remote_cache.get(&dest) {
            let now = time::millis_since_epoch();
            if !ls.is_expired(now) {
                let tunnel = self.pool.select_outbound().map(|t| t.id);
                on_ready(Some((ls.clone(), tunnel)));
                return;
            }
        }
        // the daemon resolves the raw bytes back into the cache, so the
        // callback only needs the signal
        self.requests.create_request(
            dest,
            false,
            Some(Box::new(move |result| {
                if result.is_none() {
                    on_ready(None);
                }
                // on success the daemon re-dispatches through the cache
            })),
        );
    }

    /// Apply new I2CP options. Returns whether the pool was reshaped.
    pub fn reconfigure(&mut self, options: DestinationOptions) -> bool {
        let reshaped = self.pool.reconfigure(PoolConfig {
            inbound_length: options.inbound_length,
            outbound_length: options.outbound_length,
            inbound_quantity: options.inbound_quantity,
            outbound_quantity: options.outbound_quantity,
            inbound_length_variance: options.inbound_length_variance,
            outbound_length_variance: options.outbound_length_variance,
        });
        self.options = options;
        if reshaped {
            self.lease_set_updated = true;
        }
        reshaped
    }

    /// Pool maintenance plus destination-level bookkeeping. Runs on the
    /// five-minute cleanup timer and cheap per-second ticks.
    pub fn maintain(&mut self, selector: &dyn PeerSelector) -> Result<(), DestinationError> {
        let now = time::seconds_since_epoch();
        let dropped = self.pool.maintain(now);
        if dropped > 0 {
            self.lease_set_updated = true;
        }
        let (need_in, need_out) = self.pool.deficit(now);
        for _ in 0..need_in {
            if self.pool.create_tunnel(selector, true, &[]).is_err() {
                break;
            }
        }
        for _ in 0..need_out {
            if self.pool.create_tunnel(selector, false, &[]).is_err() {
                break;
            }
        }
        if now >= self.last_cleanup + CLEANUP_INTERVAL {
            let now_ms = time::millis_since_epoch();
            self.remote_cache
                .retain(|_, ls| !ls.is_expired(now_ms) && ls.has_non_expired_lease(now_ms));
            self.tags.cleanup(now);
            self.last_cleanup = now;
        }
        for _retry in self.requests.manage() {
            // retries surface through requests(); the daemon reissues them
        }
        Ok(())
    }
}

fn decode_client_keys(encoded: &[String]) -> Vec<[u8; 32]> {
    encoded
        .iter()
        .filter_map(|s| {
            let bytes = veil_core::types::I2P_BASE64.decode(s.as_bytes()).ok()?;
            bytes.try_into().ok()
        })
        .collect()
}
