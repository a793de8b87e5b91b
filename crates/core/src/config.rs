//! Typed option records.
//!
//! The configuration frontend (file/CLI parsing) is an external collaborator;
//! it hands each subsystem one of these structs at startup. Per-destination
//! options additionally parse from the I2CP string map clients send, keeping
//! the historical parameter names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Router-wide options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterOptions {
    /// Explicit local address, empty to autodetect.
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub ipv4: bool,

    #[serde(default)]
    pub ipv6: bool,

    /// Refuse to participate in other routers' tunnels.
    #[serde(default)]
    pub notransit: bool,

    #[serde(default)]
    pub floodfill: bool,

    /// Bandwidth capability letter (K..N, O, P, X).
    #[serde(default = "default_bandwidth")]
    pub bandwidth: char,

    #[serde(default = "default_net_id")]
    pub net_id: u32,

    #[serde(default)]
    pub nettime: TimeOptions,

    #[serde(default)]
    pub ssu2: Ssu2Options,

    /// Data directory root (netDb/, destinations/, peerProfiles/).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_port() -> u16 {
    4567
}
fn default_true() -> bool {
    true
}
fn default_bandwidth() -> char {
    'O'
}
fn default_net_id() -> u32 {
    2
}
fn default_data_dir() -> String {
    ".veil".to_string()
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            ipv4: true,
            ipv6: false,
            notransit: false,
            floodfill: false,
            bandwidth: default_bandwidth(),
            net_id: default_net_id(),
            nettime: TimeOptions::default(),
            ssu2: Ssu2Options::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Clock synchronization options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeOptions {
    /// Accept clock corrections derived from peer handshakes.
    #[serde(default = "default_true")]
    pub from_peers: bool,

    /// NTP servers, queried in order.
    #[serde(default)]
    pub ntp_servers: Vec<String>,

    /// Hours between NTP queries; 0 disables.
    #[serde(default)]
    pub ntp_sync_interval: u32,
}

impl Default for TimeOptions {
    fn default() -> Self {
        Self {
            from_peers: true,
            ntp_servers: Vec::new(),
            ntp_sync_interval: 0,
        }
    }
}

/// SSU2 transport options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ssu2Options {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Overrides the router port when non-zero.
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub mtu4: u16,

    #[serde(default)]
    pub mtu6: u16,

    #[serde(default = "default_true")]
    pub published: bool,

    /// SOCKS5 proxy URL; when set, all SSU2 traffic goes through a
    /// UDP-associate relay.
    #[serde(default)]
    pub proxy: String,
}

impl Default for Ssu2Options {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 0,
            mtu4: 0,
            mtu6: 0,
            published: true,
            proxy: String::new(),
        }
    }
}

/// LeaseSet flavor a destination publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseSetKind {
    Standard,    // type 1
    Standard2,   // type 3
    Encrypted2,  // type 5
}

/// Client-auth scheme for encrypted LeaseSets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseSetAuthKind {
    None,
    Dh,
    Psk,
}

/// Per-destination options, parsed from the I2CP parameter map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationOptions {
    pub inbound_length: u8,
    pub outbound_length: u8,
    pub inbound_quantity: u8,
    pub outbound_quantity: u8,
    pub inbound_length_variance: i8,
    pub outbound_length_variance: i8,
    pub tags_to_send: u16,
    pub explicit_peers: Vec<String>,
    pub publish: bool,
    pub lease_set_kind: LeaseSetKind,
    pub lease_set_auth: LeaseSetAuthKind,
    pub lease_set_priv_key: Option<String>,
    /// Crypto type ids for the published encryption keys.
    pub lease_set_enc_types: Vec<u16>,
    /// base64 X25519 public keys of authorized DH clients.
    pub auth_dh_clients: Vec<String>,
    /// base64 pre-shared keys of authorized PSK clients.
    pub auth_psk_clients: Vec<String>,
    pub streaming_initial_ack_delay: u32,
    pub streaming_max_outbound_speed: u32,
    pub streaming_max_inbound_speed: u32,
    pub streaming_answer_pings: bool,
    /// 0 = bulk, 1 = interactive.
    pub streaming_profile: u8,
}

impl Default for DestinationOptions {
    fn default() -> Self {
        Self {
            inbound_length: 3,
            outbound_length: 3,
            inbound_quantity: 5,
            outbound_quantity: 5,
            inbound_length_variance: 0,
            outbound_length_variance: 0,
            tags_to_send: 40,
            explicit_peers: Vec::new(),
            publish: true,
            lease_set_kind: LeaseSetKind::Standard2,
            lease_set_auth: LeaseSetAuthKind::None,
            lease_set_priv_key: None,
            lease_set_enc_types: vec![4], // ECIES-X25519
            auth_dh_clients: Vec::new(),
            auth_psk_clients: Vec::new(),
            streaming_initial_ack_delay: 200,
            streaming_max_outbound_speed: 0,
            streaming_max_inbound_speed: 0,
            streaming_answer_pings: true,
            streaming_profile: 0,
        }
    }
}

impl DestinationOptions {
    /// Parse from I2CP parameters, keeping unrecognized keys untouched.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, CoreError> {
        let mut opts = Self::default();

        fn num<T: std::str::FromStr>(
            params: &HashMap<String, String>,
            key: &str,
            out: &mut T,
        ) -> Result<(), CoreError> {
            if let Some(v) = params.get(key) {
                *out = v.parse().map_err(|_| CoreError::BadOption {
                    key: key.to_string(),
                    value: v.clone(),
                })?;
            }
            Ok(())
        }

        num(params, "inbound.length", &mut opts.inbound_length)?;
        num(params, "outbound.length", &mut opts.outbound_length)?;
        num(params, "inbound.quantity", &mut opts.inbound_quantity)?;
        num(params, "outbound.quantity", &mut opts.outbound_quantity)?;
        num(params, "inbound.lengthVariance", &mut opts.inbound_length_variance)?;
        num(params, "outbound.lengthVariance", &mut opts.outbound_length_variance)?;
        num(params, "tagsToSend", &mut opts.tags_to_send)?;
        num(params, "i2cp.streaming.initialAckDelay", &mut opts.streaming_initial_ack_delay)?;
        num(params, "i2cp.streaming.maxOutboundSpeed", &mut opts.streaming_max_outbound_speed)?;
        num(params, "i2cp.streaming.maxInboundSpeed", &mut opts.streaming_max_inbound_speed)?;
        num(params, "streamingProfile", &mut opts.streaming_profile)?;

        if let Some(v) = params.get("explicitPeers") {
            opts.explicit_peers = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = params.get("i2cp.dontPublishLeaseSet") {
            opts.publish = v != "true";
        }
        if let Some(v) = params.get("i2cp.streaming.answerPings") {
            opts.streaming_answer_pings = v == "true";
        }
        if let Some(v) = params.get("i2cp.leaseSetType") {
            opts.lease_set_kind = match v.as_str() {
                "1" => LeaseSetKind::Standard,
                "3" => LeaseSetKind::Standard2,
                "5" => LeaseSetKind::Encrypted2,
                _ => {
                    return Err(CoreError::BadOption {
                        key: "i2cp.leaseSetType".into(),
                        value: v.clone(),
                    })
                }
            };
        }
        if let Some(v) = params.get("i2cp.leaseSetAuthType") {
            opts.lease_set_auth = match v.as_str() {
                "0" => LeaseSetAuthKind::None,
                "1" => LeaseSetAuthKind::Dh,
                "2" => LeaseSetAuthKind::Psk,
                _ => {
                    return Err(CoreError::BadOption {
                        key: "i2cp.leaseSetAuthType".into(),
                        value: v.clone(),
                    })
                }
            };
        }
        opts.lease_set_priv_key = params.get("i2cp.leaseSetPrivKey").cloned();
        if let Some(v) = params.get("i2cp.leaseSetEncType") {
            opts.lease_set_enc_types = v
                .split(',')
                .map(|s| {
                    s.trim().parse().map_err(|_| CoreError::BadOption {
                        key: "i2cp.leaseSetEncType".into(),
                        value: v.clone(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        // Numbered client entries: i2cp.leaseSetClient.dh.0, .1, ...
        for kind in ["dh", "psk"] {
            let mut n = 0;
            loop {
                let key = format!("i2cp.leaseSetClient.{kind}.{n}");
                match params.get(&key) {
                    Some(v) => {
                        if kind == "dh" {
                            opts.auth_dh_clients.push(v.clone());
                        } else {
                            opts.auth_psk_clients.push(v.clone());
                        }
                        n += 1;
                    }
                    None => break,
                }
            }
        }

        Ok(opts)
    }
}
