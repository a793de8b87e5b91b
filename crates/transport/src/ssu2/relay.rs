//! Relay introduction (NAT traversal).
//!
//! Alice, firewalled, asks Bob (who holds Charlie's relay tag) to
//! introduce her. Bob forwards a RelayIntro with Alice's signed endpoint;
//! Charlie validates the signature against Alice's published identity,
//! fires a HolePunch straight at Alice's endpoint, and answers through Bob.
//! Alice, on HolePunch, connects directly with the token it carried.

use std::net::{IpAddr, SocketAddr};

use veil_core::{time, IdentHash};
use veil_data::{Identity, PrivateKeys};

use crate::TransportError;

pub const RELAY_VERSION: u8 = 2;

fn write_endpoint(out: &mut Vec<u8>, endpoint: &SocketAddr) {
    match endpoint.ip() {
        IpAddr::V4(ip) => {
            out.push(6); // asz: port + v4
            out.extend_from_slice(&endpoint.port().to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(18);
            out.extend_from_slice(&endpoint.port().to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
    }
}

fn read_endpoint(buf: &[u8]) -> Result<(SocketAddr, usize), TransportError> {
    let asz = *buf.first().ok_or(TransportError::Malformed("endpoint size"))? as usize;
    if buf.len() < 1 + asz {
        return Err(TransportError::Malformed("endpoint"));
    }
    let port = u16::from_be_bytes([buf[1], buf[2]]);
    let ip = match asz {
        6 => IpAddr::from(<[u8; 4]>::try_from(&buf[3..7]).expect("4 bytes")),
        18 => IpAddr::from(<[u8; 16]>::try_from(&buf[3..19]).expect("16 bytes")),
        _ => return Err(TransportError::Malformed("endpoint family")),
    };
    Ok((SocketAddr::new(ip, port), 1 + asz))
}

/// What Alice signs: her claimed endpoint bound to the introducer pair.
fn request_signed_data(
    bob: &IdentHash,
    charlie: &IdentHash,
    nonce: u32,
    timestamp: u32,
    endpoint_bytes: &[u8],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(96 + endpoint_bytes.len());
    data.extend_from_slice(b"RelayRequestData");
    data.extend_from_slice(bob.as_bytes());
    data.extend_from_slice(charlie.as_bytes());
    data.extend_from_slice(&nonce.to_be_bytes());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.push(RELAY_VERSION);
    data.extend_from_slice(endpoint_bytes);
    data
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub nonce: u32,
    pub relay_tag: u32,
    pub timestamp: u32,
    pub endpoint: SocketAddr,
    pub signature: Vec<u8>,
}

impl RelayRequest {
    /// Alice builds the request she sends to Bob.
    pub fn build(
        keys: &PrivateKeys,
        bob: &IdentHash,
        charlie: &IdentHash,
        relay_tag: u32,
        nonce: u32,
        endpoint: &SocketAddr,
    ) -> Result<Vec<u8>, TransportError> {
        let timestamp = time::seconds_since_epoch() as u32;
        let mut endpoint_bytes = Vec::new();
        write_endpoint(&mut endpoint_bytes, endpoint);
        let signature = keys
            .sign(&request_signed_data(bob, charlie, nonce, timestamp, &endpoint_bytes))
            .map_err(TransportError::Data)?;

        let mut out = Vec::with_capacity(16 + endpoint_bytes.len() + signature.len());
        out.push(0); // flag
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(&relay_tag.to_be_bytes());
        out.extend_from_slice(&timestamp.to_be_bytes());
        out.push(RELAY_VERSION);
        out.extend_from_slice(&endpoint_bytes);
        out.extend_from_slice(&signature);
        Ok(out)
    }

    pub fn parse(value: &[u8]) -> Result<Self, TransportError> {
        if value.len() < 14 {
            return Err(TransportError::Malformed("relay request"));
        }
        let nonce = u32::from_be_bytes(value[1..5].try_into().expect("4 bytes"));
        let relay_tag = u32::from_be_bytes(value[5..9].try_into().expect("4 bytes"));
        let timestamp = u32::from_be_bytes(value[9..13].try_into().expect("4 bytes"));
        if value[13] != RELAY_VERSION {
            return Err(TransportError::Malformed("relay version"));
        }
        let (endpoint, consumed) = read_endpoint(&value[14..])?;
        Ok(Self {
            nonce,
            relay_tag,
            timestamp,
            endpoint,
            signature: value[14 + consumed..].to_vec(),
        })
    }
}

/// Bob rewrites the request as a RelayIntro for Charlie: Alice's hash plus
/// her signed claim, unchanged.
pub fn build_relay_intro(alice: &IdentHash, request: &RelayRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(80);
    out.extend_from_slice(alice.as_bytes());
    out.push(0); // flag
    out.extend_from_slice(&request.nonce.to_be_bytes());
    out.extend_from_slice(&request.timestamp.to_be_bytes());
    out.push(RELAY_VERSION);
    write_endpoint(&mut out, &request.endpoint);
    out.extend_from_slice(&request.signature);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayIntro {
    pub alice: IdentHash,
    pub nonce: u32,
    pub timestamp: u32,
    pub endpoint: SocketAddr,
    pub signature: Vec<u8>,
}

impl RelayIntro {
    pub fn parse(value: &[u8]) -> Result<Self, TransportError> {
        if value.len() < 42 {
            return Err(TransportError::Malformed("relay intro"));
        }
        let alice = IdentHash::from_slice(&value[..32])
            .map_err(|_| TransportError::Malformed("relay intro hash"))?;
        let nonce = u32::from_be_bytes(value[33..37].try_into().expect("4 bytes"));
        let timestamp = u32::from_be_bytes(value[37..41].try_into().expect("4 bytes"));
        if value[41] != RELAY_VERSION {
            return Err(TransportError::Malformed("relay version"));
        }
        let (endpoint, consumed) = read_endpoint(&value[42..])?;
        Ok(Self {
            alice,
            nonce,
            timestamp,
            endpoint,
            signature: value[42 + consumed..].to_vec(),
        })
    }

    /// Charlie validates Alice's claim under her published identity.
    pub fn verify(
        &self,
        alice_identity: &Identity,
        bob: &IdentHash,
        charlie: &IdentHash,
    ) -> Result<(), TransportError> {
        let mut endpoint_bytes = Vec::new();
        write_endpoint(&mut endpoint_bytes, &self.endpoint);
        alice_identity
            .verify(
                &request_signed_data(bob, charlie, self.nonce, self.timestamp, &endpoint_bytes),
                &self.signature,
            )
            .map_err(|_| TransportError::Malformed("relay intro signature"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub code: u8,
    pub nonce: u32,
    pub timestamp: u32,
    /// Charlie's endpoint and connection token, present on accept.
    pub charlie_endpoint: Option<SocketAddr>,
    pub token: u64,
}

impl RelayResponse {
    pub fn build(
        code: u8,
        nonce: u32,
        charlie_endpoint: Option<&SocketAddr>,
        token: u64,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        out.push(code);
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(&(time::seconds_since_epoch() as u32).to_be_bytes());
        out.push(RELAY_VERSION);
        if let Some(endpoint) = charlie_endpoint {
            write_endpoint(&mut out, endpoint);
            out.extend_from_slice(&token.to_le_bytes());
        }
        out
    }

    pub fn parse(value: &[u8]) -> Result<Self, TransportError> {
        if value.len() < 10 {
            return Err(TransportError::Malformed("relay response"));
        }
        let code = value[0];
        let nonce = u32::from_be_bytes(value[1..5].try_into().expect("4 bytes"));
        let timestamp = u32::from_be_bytes(value[5..9].try_into().expect("4 bytes"));
        let mut charlie_endpoint = None;
        let mut token = 0;
        if code == 0 && value.len() > 10 {
            let (endpoint, consumed) = read_endpoint(&value[10..])?;
            charlie_endpoint = Some(endpoint);
            let rest = &value[10 + consumed..];
            if rest.len() >= 8 {
                token = u64::from_le_bytes(rest[..8].try_into().expect("8 bytes"));
            }
        }
        Ok(Self {
            code,
            nonce,
            timestamp,
            charlie_endpoint,
            token,
        })
    }
}
