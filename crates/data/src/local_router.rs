//! The local router's own descriptor.
//!
//! Unlike remote descriptors this one is mutable: transports add and remove
//! addresses and introducers as reachability changes, and the router
//! re-serializes and re-signs on demand. Mapping keys are written in sorted
//! order so the signature is deterministic.

use std::collections::BTreeMap;
use std::net::IpAddr;

use veil_core::time;
use veil_core::types::I2P_BASE64;

use crate::router_info::{AddressCaps, Congestion, Introducer, PROPERTY_NETID, PROPERTY_VERSION};
use crate::{put_string, DataError, PrivateKeys};

pub const ROUTER_VERSION: &str = "0.9.62";

#[derive(Clone)]
struct LocalAddress {
    style: &'static str,
    cost: u8,
    host: Option<IpAddr>,
    port: u16,
    static_key: [u8; 32],
    /// Intro key for SSU2, IV for NTCP2.
    intro_key: Option<[u8; 32]>,
    caps: AddressCaps,
    introducers: Vec<Introducer>,
    mtu: u16,
}

pub struct LocalRouterInfo {
    identity_bytes: Vec<u8>,
    bandwidth_cap: char,
    floodfill: bool,
    hidden: bool,
    reachable: bool,
    congestion: Congestion,
    addresses: Vec<LocalAddress>,
    extra_properties: BTreeMap<String, String>,
}

impl LocalRouterInfo {
    pub fn new(keys: &PrivateKeys, bandwidth_cap: char, floodfill: bool) -> Self {
        Self {
            identity_bytes: keys.identity().as_bytes().to_vec(),
            bandwidth_cap,
            floodfill,
            hidden: false,
            reachable: true,
            congestion: Congestion::Low,
            addresses: Vec::new(),
            extra_properties: BTreeMap::new(),
        }
    }

    pub fn set_floodfill(&mut self, floodfill: bool) {
        self.floodfill = floodfill;
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
    }

    pub fn set_congestion(&mut self, congestion: Congestion) {
        self.congestion = congestion;
    }

    pub fn set_property(&mut self, key: &str, value: &str) {
        self.extra_properties.insert(key.to_string(), value.to_string());
    }

    pub fn add_ssu2_address(
        &mut self,
        host: Option<IpAddr>,
        port: u16,
        static_key: [u8; 32],
        intro_key: [u8; 32],
        caps: AddressCaps,
    ) {
        self.addresses.push(LocalAddress {
            style: "SSU2",
            cost: if host.is_some() { 8 } else { 15 },
            host,
            port,
            static_key,
            intro_key: Some(intro_key),
            caps,
            introducers: Vec::new(),
            mtu: 0,
        });
    }

    pub fn add_ntcp2_address(
        &mut self,
        host: Option<IpAddr>,
        port: u16,
        static_key: [u8; 32],
        iv: Option<[u8; 32]>,
        caps: AddressCaps,
    ) {
        self.addresses.push(LocalAddress {
            style: "NTCP2",
            cost: if host.is_some() { 3 } else { 14 },
            host,
            port,
            static_key,
            intro_key: iv,
            caps,
            introducers: Vec::new(),
            mtu: 0,
        });
    }

    /// Drop addresses for one family (`v4` true removes IPv4 records).
    pub fn remove_addresses(&mut self, v4: bool) {
        self.addresses.retain(|a| {
            !matches!(
                (&a.host, v4),
                (Some(IpAddr::V4(_)), true) | (Some(IpAddr::V6(_)), false)
            )
        });
    }

    /// Register an introducer on every SSU2 address. Returns false when the
    /// tag is already present.
    pub fn add_introducer(&mut self, introducer: Introducer) -> bool {
        let mut added = false;
        for addr in self.addresses.iter_mut().filter(|a| a.style == "SSU2") {
            if addr.introducers.iter().any(|i| i.tag == introducer.tag) {
                continue;
            }
            if addr.introducers.len() < 3 {
                addr.introducers.push(introducer.clone());
                added = true;
            }
        }
        added
    }

    pub fn remove_introducer(&mut self, tag: u32) -> bool {
        let mut removed = false;
        for addr in self.addresses.iter_mut() {
            let before = addr.introducers.len();
            addr.introducers.retain(|i| i.tag != tag);
            removed |= addr.introducers.len() != before;
        }
        removed
    }

    /// Drop introducers whose registration has lapsed.
    pub fn expire_introducers(&mut self, now_seconds: u64) {
        for addr in self.addresses.iter_mut() {
            addr.introducers.retain(|i| i.expiration > now_seconds);
        }
    }

    fn caps_string(&self) -> String {
        let mut caps = String::new();
        caps.push(self.bandwidth_cap);
        if self.bandwidth_cap == 'P' || self.bandwidth_cap == 'X' {
            // extra tiers imply the high tier on the wire
            caps.insert(0, 'O');
        }
        if self.floodfill {
            caps.push('f');
        }
        if self.hidden {
            caps.push('H');
        } else if self.reachable {
            caps.push('R');
        } else {
            caps.push('U');
        }
        match self.congestion {
            Congestion::Low => {}
            Congestion::Medium => caps.push('D'),
            Congestion::High => caps.push('E'),
            Congestion::RejectAll => caps.push('G'),
        }
        caps
    }

    fn address_caps_string(caps: AddressCaps) -> String {
        let mut s = String::new();
        if caps.contains(AddressCaps::SSU_TESTING) {
            s.push('B');
        }
        if caps.contains(AddressCaps::SSU_INTRODUCER) {
            s.push('C');
        }
        if caps.contains(AddressCaps::V4) {
            s.push('4');
        }
        if caps.contains(AddressCaps::V6) {
            s.push('6');
        }
        s
    }

    fn write_mapping(out: &mut Vec<u8>, map: &BTreeMap<String, String>) {
        let mut body = Vec::new();
        for (key, value) in map {
            put_string(&mut body, key);
            body.push(b'=');
            put_string(&mut body, value);
            body.push(b';');
        }
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
    }

    /// Serialize and sign with the router's long-term key.
    pub fn to_signed_bytes(&self, keys: &PrivateKeys) -> Result<Vec<u8>, DataError> {
        let mut out = Vec::with_capacity(1024);
        out.extend_from_slice(&self.identity_bytes);
        out.extend_from_slice(&time::millis_since_epoch().to_be_bytes());

        out.push(self.addresses.len() as u8);
        for addr in &self.addresses {
            out.push(addr.cost);
            out.extend_from_slice(&0u64.to_be_bytes());
            put_string(&mut out, addr.style);

            let mut props = BTreeMap::new();
            let caps = Self::address_caps_string(addr.caps);
            if !caps.is_empty() {
                props.insert("caps".to_string(), caps);
            }
            if let Some(host) = &addr.host {
                props.insert("host".to_string(), host.to_string());
                props.insert("port".to_string(), addr.port.to_string());
            }
            if addr.mtu != 0 {
                props.insert("mtu".to_string(), addr.mtu.to_string());
            }
            props.insert("s".to_string(), I2P_BASE64.encode(&addr.static_key));
            if let Some(ik) = &addr.intro_key {
                let len = if addr.style == "NTCP2" { 16 } else { 32 };
                props.insert("i".to_string(), I2P_BASE64.encode(&ik[..len]));
            }
            for (n, intro) in addr.introducers.iter().enumerate() {
                props.insert(format!("itag{n}"), intro.tag.to_string());
                props.insert(format!("ih{n}"), I2P_BASE64.encode(intro.hash.as_bytes()));
                props.insert(format!("iexp{n}"), intro.expiration.to_string());
            }
            props.insert("v".to_string(), "2".to_string());
            Self::write_mapping(&mut out, &props);
        }

        out.push(0); // no peer hashes

        let mut props = self.extra_properties.clone();
        props.insert("caps".to_string(), self.caps_string());
        props
            .entry(PROPERTY_NETID.to_string())
            .or_insert_with(|| veil_core::net_id().to_string());
        props
            .entry(PROPERTY_VERSION.to_string())
            .or_insert_with(|| ROUTER_VERSION.to_string());
        Self::write_mapping(&mut out, &props);

        let sig = keys.sign(&out)?;
        out.extend_from_slice(&sig);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router_info::RouterInfo;

    #[test]
    fn test_introducer_lifecycle() {
        let keys = PrivateKeys::generate().unwrap();
        let mut local = LocalRouterInfo::new(&keys, 'O', false);
        local.add_ssu2_address(None, 9000, [1u8; 32], [2u8; 32], AddressCaps::V4);

        let intro = Introducer {
            tag: 77,
            hash: veil_core::IdentHash::new([9u8; 32]),
            expiration: time::seconds_since_epoch() + 600,
        };
        assert!(local.add_introducer(intro.clone()));
        assert!(!local.add_introducer(intro)); // duplicate tag

        let buf = local.to_signed_bytes(&keys).unwrap();
        let ri = RouterInfo::from_buffer(&buf).unwrap();
        let addr = ri.ssu2_address(true).expect("ssu2 address");
        assert_eq!(addr.introducers.len(), 1);
        assert_eq!(addr.introducers[0].tag, 77);

        let mut local = local;
        assert!(local.remove_introducer(77));
        assert!(!local.remove_introducer(77));
    }

    #[test]
    fn test_expire_introducers() {
        let keys = PrivateKeys::generate().unwrap();
        let mut local = LocalRouterInfo::new(&keys, 'O', false);
        local.add_ssu2_address(None, 9000, [1u8; 32], [2u8; 32], AddressCaps::V4);
        let now = time::seconds_since_epoch();
        local.add_introducer(Introducer {
            tag: 1,
            hash: veil_core::IdentHash::new([1u8; 32]),
            expiration: now + 100,
        });
        local.add_introducer(Introducer {
            tag: 2,
            hash: veil_core::IdentHash::new([2u8; 32]),
            expiration: now.saturating_sub(10),
        });
        local.expire_introducers(now);
        assert!(local.remove_introducer(1));
        assert!(!local.remove_introducer(2));
    }

    #[test]
    fn test_resign_after_mutation() {
        let keys = PrivateKeys::generate().unwrap();
        let mut local = LocalRouterInfo::new(&keys, 'P', false);
        local.add_ntcp2_address(
            Some("192.0.2.1".parse().unwrap()),
            4567,
            [7u8; 32],
            Some([8u8; 32]),
            AddressCaps::V4,
        );
        let ri = RouterInfo::from_buffer(&local.to_signed_bytes(&keys).unwrap()).unwrap();
        assert!(ri.ntcp2_address().is_some());
        assert_eq!(ri.bandwidth_cap(), 'P');

        local.set_congestion(Congestion::RejectAll);
        let ri2 = RouterInfo::from_buffer(&local.to_signed_bytes(&keys).unwrap()).unwrap();
        assert!(ri2.is_high_congestion(u64::MAX));
    }
}
