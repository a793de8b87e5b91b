//! Router descriptors.
//!
//! One-pass parse of the published RouterInfo format: identity, timestamp,
//! transport addresses, peer hashes (ignored), a property table, and the
//! trailing signature. Malformed addresses are skipped; malformed
//! descriptors are rejected; policy violations (wrong network id, failed
//! family signature, no usable transport) mark the descriptor unreachable
//! without rejecting it.

use std::collections::BTreeMap;
use std::net::IpAddr;

use bitflags::bitflags;
use tracing::warn;

use veil_core::types::I2P_BASE64;
use veil_core::{net_id, IdentHash};
use veil_crypto::sig::SigType;

use crate::identity::Identity;
use crate::{DataError, Reader};

/// Descriptors above this size are malformed.
pub const MAX_RI_BUFFER_SIZE: usize = 3072;

/// How long the `E` congestion flag stays meaningful after publication.
pub const HIGH_CONGESTION_INTERVAL: u64 = 15 * 60; // seconds

/// Remote descriptors must carry a timestamp within this window.
pub const TIMESTAMP_MAX_AGE: u64 = 27 * 3600 * 1000; // 27 hours, ms
pub const TIMESTAMP_MAX_SKEW: u64 = 2 * 60 * 1000; // 2 minutes ahead, ms

pub const PROPERTY_NETID: &str = "netId";
pub const PROPERTY_VERSION: &str = "router.version";
pub const PROPERTY_FAMILY: &str = "family";
pub const PROPERTY_FAMILY_SIG: &str = "family.sig";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u8 {
        const FLOODFILL       = 0x01;
        const HIGH_BANDWIDTH  = 0x02;
        const EXTRA_BANDWIDTH = 0x04;
        const REACHABLE       = 0x08;
        const UNREACHABLE     = 0x10;
        const HIDDEN          = 0x20;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AddressCaps: u8 {
        const V4             = 0x01;
        const V6             = 0x02;
        const SSU_TESTING    = 0x04;
        const SSU_INTRODUCER = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Congestion {
    #[default]
    Low,
    Medium,
    High,
    RejectAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStyle {
    Ntcp2,
    Ssu2,
    Unknown,
}

impl TransportStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ntcp2 => "NTCP2",
            Self::Ssu2 => "SSU2",
            Self::Unknown => "unknown",
        }
    }
}

/// `{tag, hash, expiration}` of one introducer on a firewalled SSU2 address.
#[derive(Debug, Clone, Default)]
pub struct Introducer {
    pub tag: u32,
    pub hash: IdentHash,
    pub expiration: u64,
}

#[derive(Debug, Clone)]
pub struct Address {
    pub transport: TransportStyle,
    pub cost: u8,
    pub date: u64,
    pub host: Option<IpAddr>,
    pub port: u16,
    pub caps: AddressCaps,
    /// X25519 static key (NTCP2 and SSU2).
    pub static_key: Option<[u8; 32]>,
    /// SSU2 intro key; for NTCP2 the 16-byte IV marks the address published.
    pub intro_key: Option<[u8; 32]>,
    pub mtu: u16,
    pub published: bool,
    pub introducers: Vec<Introducer>,
}

impl Address {
    fn new(transport: TransportStyle) -> Self {
        Self {
            transport,
            cost: 0,
            date: 0,
            host: None,
            port: 0,
            caps: AddressCaps::empty(),
            static_key: None,
            intro_key: None,
            mtu: 0,
            published: false,
            introducers: Vec::new(),
        }
    }

    /// An address is published only when both host and port are present.
    pub fn is_published(&self) -> bool {
        self.host.is_some() && self.port != 0
    }

    /// Whether the record is complete enough to connect through.
    pub fn is_usable(&self) -> bool {
        match self.transport {
            TransportStyle::Ntcp2 => self.static_key.is_some(),
            TransportStyle::Ssu2 => {
                self.static_key.is_some()
                    && self.intro_key.is_some()
                    && (self.is_published() || !self.introducers.is_empty())
            }
            TransportStyle::Unknown => false,
        }
    }

    pub fn is_v4(&self) -> bool {
        self.caps.contains(AddressCaps::V4) || matches!(self.host, Some(IpAddr::V4(_)))
    }

    pub fn is_v6(&self) -> bool {
        self.caps.contains(AddressCaps::V6) || matches!(self.host, Some(IpAddr::V6(_)))
    }
}

pub struct RouterInfo {
    identity: Identity,
    /// Milliseconds since epoch, big-endian on the wire.
    timestamp: u64,
    addresses: Vec<Address>,
    properties: BTreeMap<String, String>,
    caps: Caps,
    bandwidth_cap: char,
    congestion: Congestion,
    family: Option<String>,
    family_sig: Option<String>,
    version: String,
    buffer: Vec<u8>,
    unreachable: bool,
}

impl std::fmt::Debug for RouterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterInfo({}, ts={})", self.identity.hash(), self.timestamp)
    }
}

fn decode_key<const N: usize>(value: &str) -> Option<[u8; N]> {
    let bytes = I2P_BASE64.decode(value.as_bytes()).ok()?;
    bytes.try_into().ok()
}

fn parse_address_caps(value: &str) -> AddressCaps {
    let mut caps = AddressCaps::empty();
    for c in value.chars() {
        match c {
            '4' => caps |= AddressCaps::V4,
            '6' => caps |= AddressCaps::V6,
            'B' => caps |= AddressCaps::SSU_TESTING,
            'C' => caps |= AddressCaps::SSU_INTRODUCER,
            _ => {}
        }
    }
    caps
}

impl RouterInfo {
    pub fn from_buffer(buf: &[u8]) -> Result<Self, DataError> {
        if buf.len() > MAX_RI_BUFFER_SIZE {
            return Err(DataError::Oversized(buf.len()));
        }
        let (identity, ident_len) = Identity::from_buffer(buf)?;
        let mut r = Reader::new(&buf[ident_len..]);

        let timestamp = r.u64()?;

        let mut addresses = Vec::new();
        let num_addresses = r.u8()?;
        for _ in 0..num_addresses {
            if let Some(address) = Self::read_address(&mut r)? {
                addresses.push(address);
            }
        }

        // peer hashes: present in old descriptors, ignored
        let num_peers = r.u8()? as usize;
        r.take(num_peers * 32)?;

        let props_len = r.u16()? as usize;
        let props_buf = r.take(props_len)?;
        let mut props = Reader::new(props_buf);
        let mut properties = BTreeMap::new();
        while props.remaining() > 0 {
            let key = props.string()?;
            if props.u8()? != b'=' {
                return Err(DataError::Malformed("property separator"));
            }
            let value = props.string()?;
            if props.u8()? != b';' {
                return Err(DataError::Malformed("property terminator"));
            }
            properties.insert(key, value);
        }

        let signed_len = ident_len + r.position();
        let sig = r.take(identity.sig_len())?;
        identity.verify(&buf[..signed_len], sig)?;

        let mut info = Self {
            identity,
            timestamp,
            addresses,
            properties,
            caps: Caps::empty(),
            bandwidth_cap: 'L',
            congestion: Congestion::Low,
            family: None,
            family_sig: None,
            version: String::new(),
            buffer: buf.to_vec(),
            unreachable: false,
        };
        info.extract_properties();
        info.apply_policy();
        Ok(info)
    }

    fn read_address(r: &mut Reader<'_>) -> Result<Option<Address>, DataError> {
        let cost = r.u8()?;
        let date = r.u64()?;
        let style = r.string()?;
        let transport = if style.starts_with("NTCP") {
            TransportStyle::Ntcp2
        } else if style.starts_with("SSU") {
            TransportStyle::Ssu2
        } else {
            TransportStyle::Unknown
        };
        let block_len = r.u16()? as usize;
        let block = r.take(block_len)?;
        if transport == TransportStyle::Unknown {
            // unknown transport: the address is skipped, not the descriptor
            return Ok(None);
        }

        let mut address = Address::new(transport);
        address.cost = cost;
        address.date = date;
        let mut valid = true;

        let mut props = Reader::new(block);
        while props.remaining() > 0 {
            let key = props.string()?;
            if props.u8()? != b'=' {
                return Err(DataError::Malformed("address property separator"));
            }
            let value = props.string()?;
            if props.u8()? != b';' {
                return Err(DataError::Malformed("address property terminator"));
            }
            match key.as_str() {
                "host" => match value.parse::<IpAddr>() {
                    Ok(ip) if !ip.is_unspecified() => address.host = Some(ip),
                    _ => {}
                },
                "port" => address.port = value.parse().unwrap_or(0),
                "mtu" => address.mtu = value.parse().unwrap_or(0),
                "caps" => address.caps = parse_address_caps(&value),
                "s" => match decode_key::<32>(&value) {
                    // must look like an X25519 public key
                    Some(key) if key[31] & 0x80 == 0 => address.static_key = Some(key),
                    _ => valid = false,
                },
                "i" => {
                    match transport {
                        TransportStyle::Ntcp2 => {
                            // presence of a valid 16-byte IV means published
                            if decode_key::<16>(&value).is_some() {
                                address.published = true;
                            } else {
                                valid = false;
                            }
                        }
                        TransportStyle::Ssu2 => match decode_key::<32>(&value) {
                            Some(key) => address.intro_key = Some(key),
                            None => valid = false,
                        },
                        TransportStyle::Unknown => {}
                    }
                }
                "v" => {
                    if value != "2" {
                        valid = false;
                    }
                }
                _ if key.starts_with('i') && key.len() > 1 => {
                    // introducer fields: itag<N>, ih<N>, iexp<N>
                    let Some(index) = key.chars().last().and_then(|c| c.to_digit(10)) else {
                        continue;
                    };
                    let index = index as usize;
                    if index > 9 {
                        continue;
                    }
                    if address.introducers.len() <= index {
                        address.introducers.resize(index + 1, Introducer::default());
                    }
                    let intro = &mut address.introducers[index];
                    let field = &key[..key.len() - 1];
                    match field {
                        "itag" => intro.tag = value.parse().unwrap_or(0),
                        "ih" => {
                            if let Some(h) = decode_key::<32>(&value) {
                                intro.hash = IdentHash::new(h);
                            }
                        }
                        "iexp" => intro.expiration = value.parse().unwrap_or(0),
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        if !valid {
            return Ok(None);
        }
        if address.transport == TransportStyle::Ssu2 && address.host.is_some() {
            if matches!(address.host, Some(IpAddr::V4(_))) {
                address.caps |= AddressCaps::V4;
            } else {
                address.caps |= AddressCaps::V6;
            }
            address.published = address.is_published();
        }
        Ok(Some(address))
    }

    fn extract_properties(&mut self) {
        if let Some(caps) = self.properties.get("caps") {
            self.extract_caps(&caps.clone());
        }
        self.version = self
            .properties
            .get(PROPERTY_VERSION)
            .cloned()
            .unwrap_or_default();
        self.family = self.properties.get(PROPERTY_FAMILY).map(|f| f.to_lowercase());
        self.family_sig = self.properties.get(PROPERTY_FAMILY_SIG).cloned();
    }

    fn extract_caps(&mut self, value: &str) {
        for c in value.chars() {
            match c {
                'f' => self.caps |= Caps::FLOODFILL,
                'K' | 'L' | 'M' | 'N' | 'O' => {
                    self.bandwidth_cap = c;
                    if c == 'O' {
                        self.caps |= Caps::HIGH_BANDWIDTH;
                    }
                }
                'P' | 'X' => {
                    self.bandwidth_cap = c;
                    self.caps |= Caps::HIGH_BANDWIDTH | Caps::EXTRA_BANDWIDTH;
                }
                'H' => self.caps |= Caps::HIDDEN,
                'R' => self.caps |= Caps::REACHABLE,
                'U' => self.caps |= Caps::UNREACHABLE,
                'D' => self.congestion = Congestion::Medium,
                'E' => self.congestion = Congestion::High,
                'G' => self.congestion = Congestion::RejectAll,
                _ => {}
            }
        }
    }

    fn apply_policy(&mut self) {
        match self.properties.get(PROPERTY_NETID) {
            Some(id) if id.parse::<u32>().ok() == Some(net_id()) => {}
            _ => {
                warn!("RouterInfo: wrong netId for {}", self.identity.hash());
                self.unreachable = true;
            }
        }
        if !self.addresses.iter().any(|a| a.is_usable()) && !self.caps.contains(Caps::HIDDEN) {
            self.unreachable = true;
        }
        // new floodfills must not be DSA-signed
        if self.caps.contains(Caps::FLOODFILL) && self.identity.sig_type() == SigType::DsaSha1 {
            self.unreachable = true;
        }
    }

    /// Verify the family signature through the supplied resolver. Failing
    /// verification marks the descriptor unreachable, matching the netId
    /// policy.
    pub fn check_family<F>(&mut self, verify: F)
    where
        F: Fn(&str, &IdentHash, &str) -> bool,
    {
        if let (Some(family), Some(sig)) = (&self.family, &self.family_sig) {
            if !verify(family, &self.identity.hash(), sig) {
                warn!("RouterInfo: family {family} signature failed for {}", self.identity.hash());
                self.unreachable = true;
            }
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn hash(&self) -> IdentHash {
        self.identity.hash()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn caps(&self) -> Caps {
        self.caps
    }

    pub fn bandwidth_cap(&self) -> char {
        self.bandwidth_cap
    }

    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_floodfill(&self) -> bool {
        self.caps.contains(Caps::FLOODFILL) && !self.unreachable
    }

    pub fn is_reachable(&self) -> bool {
        !self.unreachable && !self.caps.contains(Caps::UNREACHABLE)
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    pub fn set_unreachable(&mut self) {
        self.unreachable = true;
    }

    pub fn congestion(&self) -> Congestion {
        self.congestion
    }

    /// `E` is time-bounded; `G` always refuses.
    pub fn is_high_congestion(&self, now_seconds: u64) -> bool {
        match self.congestion {
            Congestion::RejectAll => true,
            Congestion::High => now_seconds < self.timestamp / 1000 + HIGH_CONGESTION_INTERVAL,
            _ => false,
        }
    }

    /// Remote descriptors must be newer than 27 hours and at most 2 minutes
    /// in the future.
    pub fn is_timestamp_acceptable(&self, now_ms: u64) -> bool {
        self.timestamp + TIMESTAMP_MAX_AGE > now_ms && self.timestamp < now_ms + TIMESTAMP_MAX_SKEW
    }

    pub fn ssu2_address(&self, v4: bool) -> Option<&Address> {
        self.addresses.iter().find(|a| {
            a.transport == TransportStyle::Ssu2
                && a.is_usable()
                && if v4 { a.is_v4() } else { a.is_v6() }
        })
    }

    pub fn ntcp2_address(&self) -> Option<&Address> {
        self.addresses
            .iter()
            .find(|a| a.transport == TransportStyle::Ntcp2 && a.is_usable() && a.is_published())
    }

    /// Whether the router advertises SSU2 introducer service.
    pub fn is_ssu2_introducer(&self) -> bool {
        self.addresses.iter().any(|a| {
            a.transport == TransportStyle::Ssu2 && a.caps.contains(AddressCaps::SSU_INTRODUCER)
        })
    }

    pub fn is_ssu2_peer_tester(&self) -> bool {
        self.addresses.iter().any(|a| {
            a.transport == TransportStyle::Ssu2 && a.caps.contains(AddressCaps::SSU_TESTING)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_router::LocalRouterInfo;
    use crate::PrivateKeys;

    fn build_sample(floodfill: bool) -> (PrivateKeys, Vec<u8>) {
        let keys = PrivateKeys::generate().unwrap();
        let mut local = LocalRouterInfo::new(&keys, 'O', floodfill);
        local
            .add_ssu2_address(
                Some("10.0.0.1".parse().unwrap()),
                9000,
                [1u8; 32],
                [2u8; 32],
                AddressCaps::V4,
            );
        let buf = local.to_signed_bytes(&keys).unwrap();
        (keys, buf)
    }

    #[test]
    fn test_parse_roundtrip() {
        let (keys, buf) = build_sample(false);
        let ri = RouterInfo::from_buffer(&buf).unwrap();
        assert_eq!(ri.hash(), keys.identity().hash());
        assert!(!ri.is_floodfill());
        assert_eq!(ri.addresses().len(), 1);
        let addr = &ri.addresses()[0];
        assert_eq!(addr.transport, TransportStyle::Ssu2);
        assert_eq!(addr.port, 9000);
        assert_eq!(addr.static_key, Some([1u8; 32]));
        assert_eq!(addr.intro_key, Some([2u8; 32]));
        assert!(addr.is_published());
        assert!(!ri.is_unreachable());
    }

    #[test]
    fn test_floodfill_cap() {
        let (_, buf) = build_sample(true);
        let ri = RouterInfo::from_buffer(&buf).unwrap();
        assert!(ri.is_floodfill());
        assert_eq!(ri.bandwidth_cap(), 'O');
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let (_, mut buf) = build_sample(false);
        let n = buf.len();
        buf[n - 10] ^= 1;
        assert!(matches!(
            RouterInfo::from_buffer(&buf),
            Err(DataError::BadSignature)
        ));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (_, mut buf) = build_sample(false);
        buf[400] ^= 1;
        assert!(RouterInfo::from_buffer(&buf).is_err());
    }

    #[test]
    fn test_oversized_rejected() {
        let buf = vec![0u8; MAX_RI_BUFFER_SIZE + 1];
        assert!(matches!(
            RouterInfo::from_buffer(&buf),
            Err(DataError::Oversized(_))
        ));
    }

    #[test]
    fn test_wrong_net_id_marks_unreachable() {
        let keys = PrivateKeys::generate().unwrap();
        let mut local = LocalRouterInfo::new(&keys, 'O', false);
        local.set_property(PROPERTY_NETID, "9");
        local.add_ssu2_address(
            Some("10.0.0.1".parse().unwrap()),
            9000,
            [1u8; 32],
            [2u8; 32],
            AddressCaps::V4,
        );
        let buf = local.to_signed_bytes(&keys).unwrap();
        let ri = RouterInfo::from_buffer(&buf).unwrap();
        assert!(ri.is_unreachable());
    }

    #[test]
    fn test_no_usable_transport_marks_unreachable() {
        let keys = PrivateKeys::generate().unwrap();
        let local = LocalRouterInfo::new(&keys, 'O', false);
        let buf = local.to_signed_bytes(&keys).unwrap();
        let ri = RouterInfo::from_buffer(&buf).unwrap();
        assert!(ri.is_unreachable());
    }

    #[test]
    fn test_timestamp_window() {
        let (_, buf) = build_sample(false);
        let ri = RouterInfo::from_buffer(&buf).unwrap();
        let now = ri.timestamp();
        assert!(ri.is_timestamp_acceptable(now));
        assert!(!ri.is_timestamp_acceptable(now + TIMESTAMP_MAX_AGE + 1));
        assert!(!ri.is_timestamp_acceptable(now.saturating_sub(TIMESTAMP_MAX_SKEW + 1)));
    }

    #[test]
    fn test_congestion_window() {
        let keys = PrivateKeys::generate().unwrap();
        let mut local = LocalRouterInfo::new(&keys, 'O', false);
        local.set_congestion(Congestion::High);
        local.add_ssu2_address(
            Some("10.0.0.1".parse().unwrap()),
            9000,
            [1u8; 32],
            [2u8; 32],
            AddressCaps::V4,
        );
        let buf = local.to_signed_bytes(&keys).unwrap();
        let ri = RouterInfo::from_buffer(&buf).unwrap();
        let published = ri.timestamp() / 1000;
        assert!(ri.is_high_congestion(published + 60));
        assert!(!ri.is_high_congestion(published + HIGH_CONGESTION_INTERVAL + 1));
    }

    #[test]
    fn test_family_check() {
        let (_, buf) = build_sample(false);
        let mut ri = RouterInfo::from_buffer(&buf).unwrap();
        // no family present: nothing to verify
        ri.check_family(|_, _, _| false);
        assert!(!ri.is_unreachable());
    }
}
