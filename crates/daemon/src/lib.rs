//! Router assembly.
//!
//! Wires the transports, the netdb, and the destinations together, owns the
//! periodic maintenance loops, and exposes the programmatic controls the
//! console and CLI layers call: start, stop, reload-config, reseed-now,
//! graceful-shutdown.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use veil_core::config::RouterOptions;
use veil_core::{time, IdentHash};
use veil_crypto::x25519;
use veil_data::i2np::{self, I2npMessage};
use veil_data::local_router::LocalRouterInfo;
use veil_data::router_info::AddressCaps;
use veil_data::PrivateKeys;
use veil_netdb::handlers::{self, LookupOutcome};
use veil_netdb::netdb::ReseedProvider;
use veil_netdb::{NetDb, NetDbRequests};
use veil_transport::ssu2::server::{Ssu2Server, TransportEvent};
use veil_transport::ssu2::session::LocalContext;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Fatal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Data(#[from] veil_data::DataError),
    #[error(transparent)]
    Transport(#[from] veil_transport::TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Stopped,
    Running,
    GracefulShutdown,
}

pub struct Router {
    options: Mutex<RouterOptions>,
    keys: PrivateKeys,
    data_dir: PathBuf,
    netdb: Arc<NetDb>,
    requests: Arc<NetDbRequests>,
    local_info: Mutex<LocalRouterInfo>,
    ssu2_static: x25519::KeyPair,
    ssu2_intro: [u8; 32],
    ssu2: Mutex<Option<Arc<Ssu2Server>>>,
    state: Mutex<RouterState>,
    accepting_tunnels: AtomicBool,
    reseeder: Mutex<Option<Box<dyn ReseedProvider>>>,
}

impl Router {
    /// Load or create the router identity and assemble the core. Fails
    /// with `Config` for bad options and `Io` for unusable storage.
    pub fn new(options: RouterOptions) -> Result<Self, RouterError> {
        if !"KLMNOPX".contains(options.bandwidth) {
            return Err(RouterError::Config(format!(
                "unknown bandwidth tier {}",
                options.bandwidth
            )));
        }
        veil_core::set_net_id(options.net_id);
        let data_dir = PathBuf::from(&options.data_dir);
        fs::create_dir_all(&data_dir)?;

        let keys = Self::load_or_create_keys(&data_dir)?;
        info!("Router: identity {}", keys.identity().hash());

        let mut ssu2_intro = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut ssu2_intro);
        let ssu2_static = x25519::KeyPair::generate();

        let mut local_info = LocalRouterInfo::new(&keys, options.bandwidth, options.floodfill);
        if options.ssu2.enabled && options.ssu2.published {
            let host: Option<IpAddr> = if options.host.is_empty() {
                None
            } else {
                options
                    .host
                    .parse()
                    .map(Some)
                    .map_err(|_| RouterError::Config(format!("bad host {}", options.host)))?
            };
            let port = if options.ssu2.port != 0 {
                options.ssu2.port
            } else {
                options.port
            };
            let mut caps = AddressCaps::empty();
            if options.ipv4 {
                caps |= AddressCaps::V4;
            }
            if options.ipv6 {
                caps |= AddressCaps::V6;
            }
            local_info.add_ssu2_address(host, port, ssu2_static.public_bytes(), ssu2_intro, caps);
        }

        let netdb = Arc::new(NetDb::new(keys.identity().hash(), Some(&data_dir)));
        netdb.load();

        let router = Self {
            options: Mutex::new(options),
            keys,
            data_dir,
            netdb,
            requests: Arc::new(NetDbRequests::new()),
            local_info: Mutex::new(local_info),
            ssu2_static,
            ssu2_intro,
            ssu2: Mutex::new(None),
            state: Mutex::new(RouterState::Stopped),
            accepting_tunnels: AtomicBool::new(true),
            reseeder: Mutex::new(None),
        };
        router.persist_router_info()?;
        Ok(router)
    }

    fn load_or_create_keys(data_dir: &Path) -> Result<PrivateKeys, RouterError> {
        let path = data_dir.join("router.keys");
        if let Ok(bytes) = fs::read(&path) {
            if let Ok((keys, _)) = PrivateKeys::from_buffer(&bytes) {
                return Ok(keys);
            }
            warn!("Router: unreadable router.keys, generating a new identity");
        }
        let keys = PrivateKeys::generate()?;
        fs::write(&path, keys.to_bytes())?;
        Ok(keys)
    }

    fn persist_router_info(&self) -> Result<(), RouterError> {
        let bytes = self
            .local_info
            .lock()
            .expect("local info")
            .to_signed_bytes(&self.keys)?;
        fs::write(self.data_dir.join("router.info"), &bytes)?;
        // our own descriptor also lives in the netdb
        let _ = self.netdb.add_router_info(&bytes);
        Ok(())
    }

    pub fn hash(&self) -> IdentHash {
        self.keys.identity().hash()
    }

    pub fn netdb(&self) -> &Arc<NetDb> {
        &self.netdb
    }

    pub fn state(&self) -> RouterState {
        *self.state.lock().expect("state")
    }

    pub fn is_accepting_tunnels(&self) -> bool {
        self.accepting_tunnels.load(Ordering::Relaxed)
    }

    pub fn set_reseeder(&self, reseeder: Box<dyn ReseedProvider>) {
        *self.reseeder.lock().expect("reseeder") = Some(reseeder);
    }

    /// Bind sockets and spawn the service loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), RouterError> {
        {
            let mut state = self.state.lock().expect("state");
            if *state == RouterState::Running {
                return Ok(());
            }
            *state = RouterState::Running;
        }
        let (ssu2_enabled, bind_addr, proxy) = {
            let options = self.options.lock().expect("options");
            let port = if options.ssu2.port != 0 {
                options.ssu2.port
            } else {
                options.port
            };
            let host: IpAddr = if options.host.is_empty() {
                "0.0.0.0".parse().expect("wildcard")
            } else {
                options
                    .host
                    .parse()
                    .map_err(|_| RouterError::Config(format!("bad host {}", options.host)))?
            };
            (
                options.ssu2.enabled,
                SocketAddr::new(host, port),
                options.ssu2.proxy.clone(),
            )
        };

        if ssu2_enabled {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let proxy_relay = if proxy.is_empty() {
                None
            } else {
                // the SOCKS handshake pins the relay endpoint at startup
                Some(
                    proxy
                        .parse()
                        .map_err(|_| RouterError::Config(format!("bad proxy {proxy}")))?,
                )
            };
            let context = LocalContext {
                static_key: self.ssu2_static.clone(),
                intro_key: self.ssu2_intro,
                router_info: fs::read(self.data_dir.join("router.info"))?,
                nettime_from_peers: self.options.lock().expect("options").nettime.from_peers,
            };
            let server =
                Arc::new(Ssu2Server::bind(bind_addr, context, proxy_relay, events_tx).await?);
            *self.ssu2.lock().expect("ssu2") = Some(server.clone());

            let runner = server.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.run().await {
                    warn!("SSU2: server loop ended: {e}");
                }
            });
            let router = self.clone();
            tokio::spawn(async move {
                router.event_loop(events_rx).await;
            });
        }

        let router = self.clone();
        tokio::spawn(async move {
            router.netdb_loop().await;
        });
        let router = self.clone();
        tokio::spawn(async move {
            router.time_loop().await;
        });
        info!("Router: started");
        Ok(())
    }

    /// Dispatch transport events into the core.
    async fn event_loop(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::RouterInfoReceived(bytes) => {
                    if let Err(e) = self.netdb.add_router_info(&bytes) {
                        debug!("Router: inbound descriptor rejected: {e}");
                    }
                }
                TransportEvent::Established(hash) => {
                    debug!("Router: session established with {hash}");
                }
                TransportEvent::Terminated(hash, reason) => {
                    debug!("Router: session with {hash} terminated ({reason:?})");
                    self.requests.complete(&hash, None);
                }
                TransportEvent::I2np(from, msg) => {
                    self.handle_i2np(from, msg).await;
                }
            }
            if self.state() == RouterState::Stopped {
                break;
            }
        }
    }

    async fn handle_i2np(&self, from: IdentHash, msg: I2npMessage) {
        let is_floodfill = self.options.lock().expect("options").floodfill;
        match msg.msg_type {
            i2np::MSG_TYPE_DATABASE_STORE => {
                match handlers::handle_database_store(
                    &self.netdb,
                    &self.requests,
                    &msg,
                    &from,
                    is_floodfill,
                ) {
                    Ok(outcome) => {
                        for floodfill in outcome.flood_to {
                            self.send_i2np(&floodfill, msg.clone()).await;
                        }
                        if let Some((token, tunnel, gateway)) = outcome.reply {
                            let status = i2np::build_delivery_status(token);
                            let wrapped = i2np::build_tunnel_gateway(tunnel, &status);
                            self.send_i2np(&gateway, wrapped).await;
                        }
                    }
                    Err(e) => debug!("Router: store rejected: {e}"),
                }
            }
            i2np::MSG_TYPE_DATABASE_LOOKUP => {
                match handlers::handle_database_lookup(&self.netdb, &self.hash(), &msg) {
                    Ok((lookup, outcome)) => {
                        let reply = match outcome {
                            LookupOutcome::Found(reply) => reply,
                            LookupOutcome::Closer(reply) => reply,
                        };
                        match lookup.reply_tunnel {
                            Some(tunnel) => {
                                let wrapped = i2np::build_tunnel_gateway(tunnel, &reply);
                                self.send_i2np(&lookup.from, wrapped).await;
                            }
                            None => self.send_i2np(&lookup.from, reply).await,
                        }
                    }
                    Err(e) => debug!("Router: lookup rejected: {e}"),
                }
            }
            i2np::MSG_TYPE_DATABASE_SEARCH_REPLY => {
                match handlers::handle_search_reply(&self.netdb, &self.requests, &msg) {
                    Ok(unknown) => {
                        for peer in unknown {
                            self.requests.create_request(peer, true, None);
                        }
                    }
                    Err(e) => debug!("Router: search reply rejected: {e}"),
                }
            }
            other => debug!("Router: unhandled I2NP type {other} from {from}"),
        }
    }

    async fn send_i2np(&self, to: &IdentHash, msg: I2npMessage) {
        let server = self.ssu2.lock().expect("ssu2").clone();
        let Some(server) = server else { return };
        if server.is_connected(to) {
            if let Err(e) = server.send_i2np(to, msg, None).await {
                debug!("Router: send to {to} failed: {e}");
            }
            return;
        }
        // connect first; the message goes out once established
        if let Some(router) = self.netdb.find_router(to) {
            if let Err(e) = server.connect(&router, true).await {
                debug!("Router: connect to {to} failed: {e}");
            }
        }
    }

    /// NetDb maintenance: expiration, exploratory scheduling, reseed.
    async fn netdb_loop(&self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        let mut next_exploration_due = 0u64;
        loop {
            ticker.tick().await;
            if self.state() == RouterState::Stopped {
                break;
            }
            self.netdb.manage_router_infos();
            self.netdb.manage_lease_sets();
            self.netdb.refresh_exploratory_selection(None);
            for _retry in self.requests.manage() {
                // retries are reissued through the lookup path
            }

            if self.netdb.needs_reseed() {
                self.reseed_now();
            }

            let now = time::seconds_since_epoch();
            if now >= next_exploration_due {
                next_exploration_due = now + veil_netdb::requests::next_exploratory_interval();
                let target = self.netdb.random_exploration_target();
                self.requests.create_request(target, true, None);
            }
        }
    }

    /// Periodic NTP synchronization per the configured interval.
    async fn time_loop(&self) {
        let (servers, interval_hours) = {
            let options = self.options.lock().expect("options");
            (
                options.nettime.ntp_servers.clone(),
                options.nettime.ntp_sync_interval,
            )
        };
        if servers.is_empty() || interval_hours == 0 {
            return;
        }
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_hours as u64 * 3600));
        loop {
            ticker.tick().await;
            if self.state() == RouterState::Stopped {
                break;
            }
            if let Err(e) = time::sync_with_ntp_servers(&servers).await {
                warn!("Router: NTP sync failed: {e}");
            }
        }
    }

    /// Pull a reseed bundle when the table is too small, then warm the
    /// table through one of the fresh floodfills.
    pub fn reseed_now(&self) {
        let reseeder = self.reseeder.lock().expect("reseeder");
        let Some(reseeder) = reseeder.as_ref() else {
            debug!("Router: reseed requested but no provider configured");
            return;
        };
        let new_floodfills = self.netdb.import_reseed(reseeder.as_ref());
        if !new_floodfills.is_empty() {
            let target = self.netdb.random_exploration_target();
            self.requests.create_request(target, true, None);
        }
    }

    /// Swap in new options; transport-level settings apply on next start.
    pub fn reload_config(&self, options: RouterOptions) -> Result<(), RouterError> {
        if !"KLMNOPX".contains(options.bandwidth) {
            return Err(RouterError::Config(format!(
                "unknown bandwidth tier {}",
                options.bandwidth
            )));
        }
        {
            let mut local_info = self.local_info.lock().expect("local info");
            local_info.set_floodfill(options.floodfill);
        }
        *self.options.lock().expect("options") = options;
        self.persist_router_info()?;
        info!("Router: configuration reloaded");
        Ok(())
    }

    /// Stop accepting new tunnels; terminate once participants drain.
    pub fn graceful_shutdown(&self) {
        self.accepting_tunnels.store(false, Ordering::Relaxed);
        *self.state.lock().expect("state") = RouterState::GracefulShutdown;
        info!("Router: graceful shutdown, draining tunnels");
    }

    pub async fn stop(&self) {
        *self.state.lock().expect("state") = RouterState::Stopped;
        if let Some(server) = self.ssu2.lock().expect("ssu2").clone() {
            server.shutdown().await;
        }
        self.requests.cancel_all();
        info!("Router: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(tag: &str) -> RouterOptions {
        RouterOptions {
            data_dir: std::env::temp_dir()
                .join(format!("veil-daemon-test-{}-{tag}", std::process::id()))
                .to_string_lossy()
                .into_owned(),
            ..RouterOptions::default()
        }
    }

    #[test]
    fn test_new_router_persists_identity() {
        let opts = options("persist");
        let data_dir = PathBuf::from(&opts.data_dir);
        let router = Router::new(opts.clone()).unwrap();
        let hash = router.hash();
        assert!(data_dir.join("router.keys").exists());
        assert!(data_dir.join("router.info").exists());

        // same identity on reload
        let router2 = Router::new(opts).unwrap();
        assert_eq!(router2.hash(), hash);
        let _ = fs::remove_dir_all(data_dir);
    }

    #[test]
    fn test_bad_bandwidth_is_config_error() {
        let mut opts = options("badbw");
        opts.bandwidth = 'Z';
        assert!(matches!(Router::new(opts.clone()), Err(RouterError::Config(_))));
        let _ = fs::remove_dir_all(PathBuf::from(&opts.data_dir));
    }

    #[test]
    fn test_graceful_shutdown_stops_accepting() {
        let opts = options("graceful");
        let router = Router::new(opts.clone()).unwrap();
        assert!(router.is_accepting_tunnels());
        router.graceful_shutdown();
        assert!(!router.is_accepting_tunnels());
        assert_eq!(router.state(), RouterState::GracefulShutdown);
        let _ = fs::remove_dir_all(PathBuf::from(&opts.data_dir));
    }

    #[test]
    fn test_reseed_via_provider() {
        struct FakeReseeder;
        impl ReseedProvider for FakeReseeder {
            fn reseed(&self) -> Vec<Vec<u8>> {
                (0..3)
                    .map(|_| {
                        let keys = PrivateKeys::generate().unwrap();
                        let mut local = LocalRouterInfo::new(&keys, 'O', true);
                        local.add_ssu2_address(
                            Some("10.9.9.9".parse().unwrap()),
                            9999,
                            [1u8; 32],
                            [2u8; 32],
                            AddressCaps::V4,
                        );
                        local.to_signed_bytes(&keys).unwrap()
                    })
                    .collect()
            }
        }
        let opts = options("reseed");
        let router = Router::new(opts.clone()).unwrap();
        assert!(router.netdb().needs_reseed());
        router.set_reseeder(Box::new(FakeReseeder));
        let before = router.netdb().num_routers();
        router.reseed_now();
        assert_eq!(router.netdb().num_routers(), before + 3);
        assert!(router.netdb().num_floodfills() >= 3);
        let _ = fs::remove_dir_all(PathBuf::from(&opts.data_dir));
    }
}
