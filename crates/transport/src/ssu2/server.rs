//! SSU2 server: sockets, session table, tokens.
//!
//! One UDP socket per address family. Incoming datagrams are routed by the
//! destination connection id recovered by unmasking the header with our
//! intro key; unknown ids with a handshake message type spawn responder
//! sessions. Sessions are owned by the table; everything else holds the
//! connection id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use veil_core::{time, IdentHash};
use veil_crypto::chacha;
use veil_data::i2np::I2npMessage;
use veil_data::router_info::RouterInfo;

use super::session::{LocalContext, Session};
use super::{
    MessageType, TerminationReason, SSU2_NEXT_TOKEN_EXPIRATION_TIMEOUT,
    SSU2_TOKEN_EXPIRATION_TIMEOUT,
};
use crate::socks5;
use crate::TransportError;

/// Address-bound anti-spoofing tokens.
#[derive(Default)]
pub struct TokenStore {
    /// Tokens we minted for peers connecting to us.
    incoming: HashMap<SocketAddr, (u64, u64)>,
    /// Tokens peers issued us for future connections.
    outgoing: HashMap<SocketAddr, (u64, u64)>,
}

impl TokenStore {
    /// Token for a Retry to `endpoint`; short-lived.
    pub fn incoming_token(&mut self, endpoint: SocketAddr, now: u64) -> u64 {
        match self.incoming.get(&endpoint) {
            Some((token, expires)) if *expires > now => *token,
            _ => {
                let token = rand::thread_rng().gen_range(1..u64::MAX);
                self.incoming
                    .insert(endpoint, (token, now + SSU2_TOKEN_EXPIRATION_TIMEOUT));
                token
            }
        }
    }

    /// Validate a token presented in a SessionRequest.
    pub fn check_incoming(&self, endpoint: &SocketAddr, token: u64, now: u64) -> bool {
        matches!(self.incoming.get(endpoint), Some((t, expires)) if *t == token && *expires > now)
    }

    /// Remember a NewToken block for later outbound connections.
    pub fn store_outgoing(&mut self, endpoint: SocketAddr, token: u64) {
        self.outgoing.insert(
            endpoint,
            (token, time::seconds_since_epoch() + SSU2_NEXT_TOKEN_EXPIRATION_TIMEOUT),
        );
    }

    pub fn outgoing_token(&self, endpoint: &SocketAddr, now: u64) -> Option<u64> {
        match self.outgoing.get(endpoint) {
            Some((token, expires)) if *expires > now => Some(*token),
            _ => None,
        }
    }

    pub fn cleanup(&mut self, now: u64) {
        self.incoming.retain(|_, (_, expires)| *expires > now);
        self.outgoing.retain(|_, (_, expires)| *expires > now);
    }
}

/// Messages surfaced to the router core.
pub enum TransportEvent {
    Established(IdentHash),
    Terminated(IdentHash, TerminationReason),
    I2np(IdentHash, I2npMessage),
    RouterInfoReceived(Vec<u8>),
}

struct SessionEntry {
    session: Session,
    endpoint: SocketAddr,
}

pub struct Ssu2Server {
    socket: UdpSocket,
    local: LocalContext,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    by_hash: Mutex<HashMap<IdentHash, u64>>,
    tokens: Mutex<TokenStore>,
    /// SOCKS5 relay endpoint when proxied.
    proxy_relay: Option<SocketAddr>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Ssu2Server {
    pub async fn bind(
        addr: SocketAddr,
        local: LocalContext,
        proxy_relay: Option<SocketAddr>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        info!("SSU2: listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            local,
            sessions: Mutex::new(HashMap::new()),
            by_hash: Mutex::new(HashMap::new()),
            tokens: Mutex::new(TokenStore::default()),
            proxy_relay,
            events,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    async fn send_datagrams(
        &self,
        to: SocketAddr,
        datagrams: Vec<Vec<u8>>,
    ) -> Result<(), TransportError> {
        for datagram in datagrams {
            match self.proxy_relay {
                Some(relay) => {
                    let wrapped = socks5::wrap_datagram(&to, &datagram);
                    self.socket.send_to(&wrapped, relay).await?;
                }
                None => {
                    self.socket.send_to(&datagram, to).await?;
                }
            }
        }
        Ok(())
    }

    /// Open a session to a published SSU2 address of `router`.
    pub async fn connect(&self, router: &RouterInfo, v4: bool) -> Result<(), TransportError> {
        let address = router
            .ssu2_address(v4)
            .ok_or(TransportError::Malformed("no ssu2 address"))?;
        let endpoint = SocketAddr::new(
            address.host.ok_or(TransportError::Malformed("unpublished address"))?,
            address.port,
        );
        let static_key = address.static_key.ok_or(TransportError::Malformed("no static key"))?;
        let intro_key = address.intro_key.ok_or(TransportError::Malformed("no intro key"))?;

        let token = self
            .tokens
            .lock()
            .expect("token store")
            .outgoing_token(&endpoint, time::seconds_since_epoch());
        let mut session = Session::client(self.local.clone(), static_key, intro_key, token);
        session.remote_router_hash = Some(router.hash());
        let datagrams = session.connect()?;
        let conn_id = session.src_conn_id;

        // a new session to the same router replaces the old one
        let old_entry = self
            .by_hash
            .lock()
            .expect("hash index")
            .insert(router.hash(), conn_id);
        if let Some(old_id) = old_entry {
            let removed = self.sessions.lock().expect("session table").remove(&old_id);
            if let Some(mut old) = removed {
                if let Ok(term) =
                    old.session.request_termination(TerminationReason::ReplacedByNewSession)
                {
                    let _ = self.send_datagrams(old.endpoint, vec![term]).await;
                }
            }
        }

        self.sessions
            .lock()
            .expect("session table")
            .insert(conn_id, SessionEntry { session, endpoint });
        self.send_datagrams(endpoint, datagrams).await
    }

    pub fn is_connected(&self, hash: &IdentHash) -> bool {
        let Some(conn_id) = self.by_hash.lock().expect("hash index").get(hash).copied() else {
            return false;
        };
        self.sessions
            .lock()
            .expect("session table")
            .get(&conn_id)
            .map(|e| e.session.is_established())
            .unwrap_or(false)
    }

    /// Queue an I2NP message for a connected router.
    pub async fn send_i2np(
        &self,
        hash: &IdentHash,
        msg: I2npMessage,
        on_drop: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), TransportError> {
        let conn_id = self
            .by_hash
            .lock()
            .expect("hash index")
            .get(hash)
            .copied()
            .ok_or(TransportError::Malformed("not connected"))?;
        let (endpoint, datagrams) = {
            let mut sessions = self.sessions.lock().expect("session table");
            let entry = sessions
                .get_mut(&conn_id)
                .ok_or(TransportError::Malformed("not connected"))?;
            entry.session.send_i2np(msg, on_drop);
            (entry.endpoint, entry.session.flush()?)
        };
        self.send_datagrams(endpoint, datagrams).await
    }

    /// Recover the destination connection id from a masked wire header.
    fn peek_conn_id(&self, datagram: &[u8]) -> Option<u64> {
        if datagram.len() < super::packet::MIN_PACKET_LEN {
            return None;
        }
        let tail: [u8; 12] = datagram[datagram.len() - 24..datagram.len() - 12]
            .try_into()
            .expect("12 bytes");
        let mask = chacha::header_mask(&self.local.intro_key, &tail);
        let mut id_bytes: [u8; 8] = datagram[..8].try_into().expect("8 bytes");
        for i in 0..8 {
            id_bytes[i] ^= mask[i];
        }
        Some(u64::from_le_bytes(id_bytes))
    }

    async fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let Some(conn_id) = self.peek_conn_id(datagram) else {
            return;
        };
        let known = self
            .sessions
            .lock()
            .expect("session table")
            .contains_key(&conn_id);
        if !known {
            // unmasked type byte is only meaningful after full unmasking;
            // let a fresh responder session try to make sense of it
            let mut session = Session::server(self.local.clone());
            session.src_conn_id = conn_id;
            session.remote_endpoint = Some(from);
            let token = self
                .tokens
                .lock()
                .expect("token store")
                .incoming_token(from, time::seconds_since_epoch());
            session.set_incoming_token(token);
            match session.handle_packet(datagram) {
                Ok(replies) => {
                    let _ = self.send_datagrams(from, replies).await;
                    self.sessions.lock().expect("session table").insert(
                        conn_id,
                        SessionEntry {
                            session,
                            endpoint: from,
                        },
                    );
                }
                Err(e) => debug!("SSU2: dropped first packet from {from}: {e}"),
            }
            return;
        }

        let result = {
            let mut sessions = self.sessions.lock().expect("session table");
            let Some(entry) = sessions.get_mut(&conn_id) else {
                return;
            };
            entry.session.handle_packet(datagram).map(|replies| {
                // connection migration: follow only authenticated traffic
                entry.endpoint = from;
                let events = Self::collect_events(&mut entry.session);
                (replies, events)
            })
        };
        match result {
            Ok((replies, events)) => {
                let _ = self.send_datagrams(from, replies).await;
                for event in events {
                    let _ = self.events.send(event);
                }
                self.finish_established(conn_id);
            }
            Err(e) => debug!("SSU2: packet error from {from}: {e}"),
        }
    }

    fn collect_events(session: &mut Session) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        for ri in session.drain_router_infos() {
            events.push(TransportEvent::RouterInfoReceived(ri));
        }
        if let Some(hash) = session.remote_router_hash {
            for msg in session.drain_received() {
                events.push(TransportEvent::I2np(hash, msg));
            }
        }
        events
    }

    fn finish_established(&self, conn_id: u64) {
        let mut sessions = self.sessions.lock().expect("session table");
        let Some(entry) = sessions.get_mut(&conn_id) else { return };
        if entry.session.is_established() {
            if let Some(hash) = entry.session.remote_router_hash {
                let mut by_hash = self.by_hash.lock().expect("hash index");
                if by_hash.insert(hash, conn_id) != Some(conn_id) {
                    let _ = self.events.send(TransportEvent::Established(hash));
                }
            }
        }
    }

    /// Identity hash confirmed by the core after parsing the RouterInfo
    /// from SessionConfirmed.
    pub fn set_remote_hash(&self, conn_id: u64, hash: IdentHash) {
        if let Some(entry) = self.sessions.lock().expect("session table").get_mut(&conn_id) {
            entry.session.remote_router_hash = Some(hash);
        }
        self.by_hash.lock().expect("hash index").insert(hash, conn_id);
    }

    async fn tick(&self) {
        let now = time::seconds_since_epoch();
        let mut to_send: Vec<(SocketAddr, Vec<Vec<u8>>)> = Vec::new();
        let mut dead: Vec<(u64, Option<IdentHash>, TerminationReason)> = Vec::new();
        {
            let mut sessions = self.sessions.lock().expect("session table");
            for (conn_id, entry) in sessions.iter_mut() {
                match entry.session.tick() {
                    Ok(datagrams) if !datagrams.is_empty() => {
                        to_send.push((entry.endpoint, datagrams));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("SSU2: tick error: {e}"),
                }
                if entry.session.is_terminated() {
                    dead.push((
                        *conn_id,
                        entry.session.remote_router_hash,
                        entry.session.termination_reason,
                    ));
                }
            }
            for (conn_id, hash, _) in &dead {
                sessions.remove(conn_id);
                if let Some(hash) = hash {
                    self.by_hash.lock().expect("hash index").remove(hash);
                }
            }
        }
        for (endpoint, datagrams) in to_send {
            let _ = self.send_datagrams(endpoint, datagrams).await;
        }
        for (_, hash, reason) in dead {
            if let Some(hash) = hash {
                let _ = self.events.send(TransportEvent::Terminated(hash, reason));
            }
        }
        self.tokens.lock().expect("token store").cleanup(now);
    }

    /// Socket loop; runs until the socket errors out.
    pub async fn run(&self) -> Result<(), TransportError> {
        let mut buf = vec![0u8; super::SSU2_MAX_PACKET_SIZE];
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, mut from) = received?;
                    let mut start = 0;
                    if self.proxy_relay.is_some() {
                        match socks5::unwrap_datagram(&buf[..len]) {
                            Ok((source, offset)) => {
                                from = source;
                                start = offset;
                            }
                            Err(_) => continue,
                        }
                    }
                    self.handle_datagram(from, &buf[start..len]).await;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Graceful shutdown: terminate every session.
    pub async fn shutdown(&self) {
        let mut to_send = Vec::new();
        {
            let mut sessions = self.sessions.lock().expect("session table");
            for entry in sessions.values_mut() {
                if let Ok(term) = entry
                    .session
                    .request_termination(TerminationReason::RouterShutdown)
                {
                    to_send.push((entry.endpoint, vec![term]));
                }
            }
            sessions.clear();
        }
        for (endpoint, datagrams) in to_send {
            let _ = self.send_datagrams(endpoint, datagrams).await;
        }
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().expect("session table").len()
    }
}

/// A handshake datagram carries its type at a fixed spot only after
/// unmasking; this helper is used by tests to assert on packet kinds.
pub fn is_handshake_type(msg_type: u8) -> bool {
    matches!(
        MessageType::from_u8(msg_type),
        Some(
            MessageType::TokenRequest
                | MessageType::SessionRequest
                | MessageType::SessionCreated
                | MessageType::SessionConfirmed
                | MessageType::Retry
        )
    )
}
