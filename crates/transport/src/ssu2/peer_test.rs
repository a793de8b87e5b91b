//! Peer test: reachability classification.
//!
//! Seven messages across three parties. Alice asks Bob (msg 1); Bob picks
//! Charlie (msg 2); Charlie answers Bob (msg 3) who relays to Alice
//! (msg 4); Charlie also sends msg 5 straight at Alice's claimed endpoint;
//! Alice echoes (msg 6) and Charlie confirms (msg 7). Receiving msg 5 at
//! the right port proves `Ok`; a wrong source port proves symmetric NAT
//! regardless of anything else; msg 4 alone leaves Alice firewalled.

use std::collections::HashMap;
use std::net::SocketAddr;

use veil_core::{time, IdentHash};

use super::SSU2_PEER_TEST_EXPIRATION_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestConclusion {
    Ok,
    Firewalled,
    SymmetricNat,
    Inconclusive,
}

struct PendingTest {
    started_at: u64,
    local_port: u16,
    /// Charlie accepted through Bob (msg 4 with code 0).
    got_msg4_accept: bool,
    /// Direct msg 5 observed, with the source port it came from.
    msg5_port: Option<u16>,
    concluded: Option<TestConclusion>,
}

/// Alice-side bookkeeping of outstanding tests, keyed by nonce.
#[derive(Default)]
pub struct PeerTestManager {
    tests: HashMap<u32, PendingTest>,
}

impl PeerTestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Start a test; `local_port` is the port our socket is bound to.
    pub fn start(&mut self, nonce: u32, local_port: u16) {
        self.tests.insert(
            nonce,
            PendingTest {
                started_at: time::seconds_since_epoch(),
                local_port,
                got_msg4_accept: false,
                msg5_port: None,
                concluded: None,
            },
        );
    }

    /// Msg 4 relayed by Bob: Charlie's verdict.
    pub fn handle_msg4(&mut self, nonce: u32, code: u8) -> Option<TestConclusion> {
        let test = self.tests.get_mut(&nonce)?;
        if code == 0 {
            test.got_msg4_accept = true;
        }
        self.evaluate(nonce)
    }

    /// Msg 5 direct from Charlie; `observed_port` is the destination port
    /// Charlie aimed at, as seen in our observed address.
    pub fn handle_msg5(&mut self, nonce: u32, observed_port: u16) -> Option<TestConclusion> {
        let test = self.tests.get_mut(&nonce)?;
        test.msg5_port = Some(observed_port);
        self.evaluate(nonce)
    }

    fn evaluate(&mut self, nonce: u32) -> Option<TestConclusion> {
        let test = self.tests.get_mut(&nonce)?;
        if test.concluded.is_some() {
            return test.concluded;
        }
        let conclusion = match test.msg5_port {
            // port mismatch wins over everything else
            Some(port) if port != test.local_port => Some(TestConclusion::SymmetricNat),
            Some(_) => Some(TestConclusion::Ok),
            None => None,
        };
        if let Some(c) = conclusion {
            test.concluded = Some(c);
        }
        conclusion
    }

    /// Expire stale tests. Tests that saw only msg 4 conclude Firewalled;
    /// tests that saw nothing are inconclusive.
    pub fn expire(&mut self, now_seconds: u64) -> Vec<(u32, TestConclusion)> {
        let mut concluded = Vec::new();
        self.tests.retain(|nonce, test| {
            if test.started_at + SSU2_PEER_TEST_EXPIRATION_TIMEOUT > now_seconds {
                return true;
            }
            let conclusion = test.concluded.unwrap_or(if test.got_msg4_accept {
                TestConclusion::Firewalled
            } else {
                TestConclusion::Inconclusive
            });
            concluded.push((*nonce, conclusion));
            false
        });
        concluded
    }
}

/// The signed portion every peer-test message carries: nonce, timestamp,
/// and Alice's claimed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTestData {
    pub nonce: u32,
    pub timestamp: u32,
    pub endpoint: Option<SocketAddr>,
}

impl PeerTestData {
    pub fn new(nonce: u32, endpoint: Option<SocketAddr>) -> Self {
        Self {
            nonce,
            timestamp: time::seconds_since_epoch() as u32,
            endpoint,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        match self.endpoint {
            None => out.push(0),
            Some(endpoint) => match endpoint {
                SocketAddr::V4(v4) => {
                    out.push(6);
                    out.extend_from_slice(&endpoint.port().to_be_bytes());
                    out.extend_from_slice(&v4.ip().octets());
                }
                SocketAddr::V6(v6) => {
                    out.push(18);
                    out.extend_from_slice(&endpoint.port().to_be_bytes());
                    out.extend_from_slice(&v6.ip().octets());
                }
            },
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 9 {
            return None;
        }
        let nonce = u32::from_be_bytes(buf[..4].try_into().ok()?);
        let timestamp = u32::from_be_bytes(buf[4..8].try_into().ok()?);
        let endpoint = match buf[8] {
            0 => None,
            6 if buf.len() >= 15 => {
                let port = u16::from_be_bytes([buf[9], buf[10]]);
                let ip: [u8; 4] = buf[11..15].try_into().ok()?;
                Some(SocketAddr::new(ip.into(), port))
            }
            18 if buf.len() >= 27 => {
                let port = u16::from_be_bytes([buf[9], buf[10]]);
                let ip: [u8; 16] = buf[11..27].try_into().ok()?;
                Some(SocketAddr::new(ip.into(), port))
            }
            _ => return None,
        };
        Some(Self {
            nonce,
            timestamp,
            endpoint,
        })
    }
}

/// Bob/Charlie-side record of a relayed test, so answers route back.
pub struct RelayedTest {
    pub nonce: u32,
    pub alice: IdentHash,
    pub charlie: IdentHash,
    pub started_at: u64,
}

#[derive(Default)]
pub struct RelayedTestTable {
    tests: HashMap<u32, RelayedTest>,
}

impl RelayedTestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, nonce: u32, alice: IdentHash, charlie: IdentHash) {
        self.tests.insert(
            nonce,
            RelayedTest {
                nonce,
                alice,
                charlie,
                started_at: time::seconds_since_epoch(),
            },
        );
    }

    pub fn get(&self, nonce: u32) -> Option<&RelayedTest> {
        self.tests.get(&nonce)
    }

    pub fn remove(&mut self, nonce: u32) -> Option<RelayedTest> {
        self.tests.remove(&nonce)
    }

    pub fn expire(&mut self, now_seconds: u64) {
        self.tests
            .retain(|_, t| t.started_at + SSU2_PEER_TEST_EXPIRATION_TIMEOUT > now_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_on_matching_msg5() {
        let mut manager = PeerTestManager::new();
        manager.start(1, 9000);
        assert_eq!(manager.handle_msg4(1, 0), None); // accept alone: no verdict yet
        assert_eq!(manager.handle_msg5(1, 9000), Some(TestConclusion::Ok));
    }

    #[test]
    fn test_symmetric_nat_on_port_mismatch() {
        let mut manager = PeerTestManager::new();
        manager.start(2, 9000);
        manager.handle_msg4(2, 0);
        assert_eq!(
            manager.handle_msg5(2, 9001),
            Some(TestConclusion::SymmetricNat)
        );
        // the verdict is sticky even if a matching msg 5 shows up later
        assert_eq!(
            manager.handle_msg5(2, 9000),
            Some(TestConclusion::SymmetricNat)
        );
    }

    #[test]
    fn test_firewalled_on_expiry_with_msg4_only() {
        let mut manager = PeerTestManager::new();
        manager.start(3, 9000);
        manager.handle_msg4(3, 0);
        let concluded =
            manager.expire(time::seconds_since_epoch() + SSU2_PEER_TEST_EXPIRATION_TIMEOUT + 1);
        assert_eq!(concluded, vec![(3, TestConclusion::Firewalled)]);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_inconclusive_on_silent_expiry() {
        let mut manager = PeerTestManager::new();
        manager.start(4, 9000);
        let concluded =
            manager.expire(time::seconds_since_epoch() + SSU2_PEER_TEST_EXPIRATION_TIMEOUT + 1);
        assert_eq!(concluded, vec![(4, TestConclusion::Inconclusive)]);
    }

    #[test]
    fn test_unknown_nonce_ignored() {
        let mut manager = PeerTestManager::new();
        assert_eq!(manager.handle_msg4(99, 0), None);
        assert_eq!(manager.handle_msg5(99, 1), None);
    }

    #[test]
    fn test_data_roundtrip() {
        let data = PeerTestData::new(7, Some("10.0.0.2:8887".parse().unwrap()));
        let parsed = PeerTestData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(parsed, data);
        let no_ep = PeerTestData::new(8, None);
        assert_eq!(
            PeerTestData::from_bytes(&no_ep.to_bytes()).unwrap().endpoint,
            None
        );
    }

    #[test]
    fn test_relayed_table_expiry() {
        let mut table = RelayedTestTable::new();
        table.insert(5, IdentHash::new([1u8; 32]), IdentHash::new([2u8; 32]));
        assert!(table.get(5).is_some());
        table.expire(time::seconds_since_epoch() + SSU2_PEER_TEST_EXPIRATION_TIMEOUT + 1);
        assert!(table.get(5).is_none());
    }
}
