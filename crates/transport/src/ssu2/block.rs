//! SSU2 payload blocks.
//!
//! A decrypted payload is a sequence of `{type, len(u16 BE), value}`
//! frames. Unknown types are skipped; a malformed length kills the packet.

use std::net::{IpAddr, SocketAddr};

use rand::RngCore;

use crate::TransportError;

pub const BLK_DATETIME: u8 = 0;
pub const BLK_OPTIONS: u8 = 1;
pub const BLK_ROUTER_INFO: u8 = 2;
pub const BLK_I2NP_MESSAGE: u8 = 3;
pub const BLK_FIRST_FRAGMENT: u8 = 4;
pub const BLK_FOLLOW_ON_FRAGMENT: u8 = 5;
pub const BLK_TERMINATION: u8 = 6;
pub const BLK_RELAY_REQUEST: u8 = 7;
pub const BLK_RELAY_RESPONSE: u8 = 8;
pub const BLK_RELAY_INTRO: u8 = 9;
pub const BLK_PEER_TEST: u8 = 10;
pub const BLK_ACK: u8 = 12;
pub const BLK_ADDRESS: u8 = 13;
pub const BLK_RELAY_TAG_REQUEST: u8 = 15;
pub const BLK_RELAY_TAG: u8 = 16;
pub const BLK_NEW_TOKEN: u8 = 17;
pub const BLK_PATH_CHALLENGE: u8 = 18;
pub const BLK_PATH_RESPONSE: u8 = 19;
pub const BLK_PADDING: u8 = 254;

pub const ROUTER_INFO_FLAG_REQUEST_FLOOD: u8 = 0x01;
pub const ROUTER_INFO_FLAG_GZIP: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Seconds since epoch, for skew detection.
    DateTime(u32),
    Options(Vec<u8>),
    RouterInfo {
        flags: u8,
        data: Vec<u8>,
    },
    /// One whole I2NP message in short-header form.
    I2npMessage(Vec<u8>),
    /// Short-header I2NP prefix of a fragmented message.
    FirstFragment(Vec<u8>),
    FollowOnFragment {
        msg_id: u32,
        fragment_num: u8,
        is_last: bool,
        data: Vec<u8>,
    },
    Termination {
        last_packet_num: u64,
        reason: u8,
    },
    RelayRequest(Vec<u8>),
    RelayResponse(Vec<u8>),
    RelayIntro(Vec<u8>),
    PeerTest {
        msg_num: u8,
        code: u8,
        data: Vec<u8>,
    },
    Ack {
        ack_through: u32,
        acnt: u8,
        ranges: Vec<(u8, u8)>,
    },
    Address(SocketAddr),
    RelayTagRequest,
    RelayTag(u32),
    NewToken {
        expires: u32,
        token: u64,
    },
    PathChallenge(Vec<u8>),
    PathResponse(Vec<u8>),
    Padding(usize),
}

impl Block {
    fn write_value(&self, out: &mut Vec<u8>) {
        match self {
            Block::DateTime(ts) => out.extend_from_slice(&ts.to_be_bytes()),
            Block::Options(v) => out.extend_from_slice(v),
            Block::RouterInfo { flags, data } => {
                out.push(*flags);
                out.push(1); // single fragment
                out.extend_from_slice(data);
            }
            Block::I2npMessage(v) | Block::FirstFragment(v) => out.extend_from_slice(v),
            Block::FollowOnFragment {
                msg_id,
                fragment_num,
                is_last,
                data,
            } => {
                out.push((fragment_num << 1) | (*is_last as u8));
                out.extend_from_slice(&msg_id.to_be_bytes());
                out.extend_from_slice(data);
            }
            Block::Termination {
                last_packet_num,
                reason,
            } => {
                out.extend_from_slice(&last_packet_num.to_be_bytes());
                out.push(*reason);
            }
            Block::RelayRequest(v) | Block::RelayResponse(v) | Block::RelayIntro(v) => {
                out.extend_from_slice(v)
            }
            Block::PeerTest { msg_num, code, data } => {
                out.push(*msg_num);
                out.push(*code);
                out.extend_from_slice(data);
            }
            Block::Ack {
                ack_through,
                acnt,
                ranges,
            } => {
                out.extend_from_slice(&ack_through.to_be_bytes());
                out.push(*acnt);
                for (nacks, acks) in ranges {
                    out.push(*nacks);
                    out.push(*acks);
                }
            }
            Block::Address(addr) => {
                out.extend_from_slice(&addr.port().to_be_bytes());
                match addr.ip() {
                    IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
                    IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
                }
            }
            Block::RelayTagRequest => {}
            Block::RelayTag(tag) => out.extend_from_slice(&tag.to_be_bytes()),
            Block::NewToken { expires, token } => {
                out.extend_from_slice(&expires.to_be_bytes());
                out.extend_from_slice(&token.to_le_bytes());
            }
            Block::PathChallenge(v) | Block::PathResponse(v) => out.extend_from_slice(v),
            Block::Padding(len) => {
                let start = out.len();
                out.resize(start + len, 0);
                rand::rngs::OsRng.fill_bytes(&mut out[start..]);
            }
        }
    }

    fn block_type(&self) -> u8 {
        match self {
            Block::DateTime(_) => BLK_DATETIME,
            Block::Options(_) => BLK_OPTIONS,
            Block::RouterInfo { .. } => BLK_ROUTER_INFO,
            Block::I2npMessage(_) => BLK_I2NP_MESSAGE,
            Block::FirstFragment(_) => BLK_FIRST_FRAGMENT,
            Block::FollowOnFragment { .. } => BLK_FOLLOW_ON_FRAGMENT,
            Block::Termination { .. } => BLK_TERMINATION,
            Block::RelayRequest(_) => BLK_RELAY_REQUEST,
            Block::RelayResponse(_) => BLK_RELAY_RESPONSE,
            Block::RelayIntro(_) => BLK_RELAY_INTRO,
            Block::PeerTest { .. } => BLK_PEER_TEST,
            Block::Ack { .. } => BLK_ACK,
            Block::Address(_) => BLK_ADDRESS,
            Block::RelayTagRequest => BLK_RELAY_TAG_REQUEST,
            Block::RelayTag(_) => BLK_RELAY_TAG,
            Block::NewToken { .. } => BLK_NEW_TOKEN,
            Block::PathChallenge(_) => BLK_PATH_CHALLENGE,
            Block::PathResponse(_) => BLK_PATH_RESPONSE,
            Block::Padding(_) => BLK_PADDING,
        }
    }
}

/// Serialize blocks into one payload.
pub fn write_blocks(blocks: &[Block]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        out.push(block.block_type());
        let len_pos = out.len();
        out.extend_from_slice(&[0, 0]);
        block.write_value(&mut out);
        let len = (out.len() - len_pos - 2) as u16;
        out[len_pos..len_pos + 2].copy_from_slice(&len.to_be_bytes());
    }
    out
}

/// Parse a decrypted payload. Unknown block types are skipped.
pub fn parse_blocks(payload: &[u8]) -> Result<Vec<Block>, TransportError> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    while pos + 3 <= payload.len() {
        let block_type = payload[pos];
        let len = u16::from_be_bytes([payload[pos + 1], payload[pos + 2]]) as usize;
        pos += 3;
        if pos + len > payload.len() {
            return Err(TransportError::Malformed("block length"));
        }
        let value = &payload[pos..pos + len];
        pos += len;
        let block = match block_type {
            BLK_DATETIME => {
                if len != 4 {
                    return Err(TransportError::Malformed("datetime block"));
                }
                Block::DateTime(u32::from_be_bytes(value.try_into().expect("4 bytes")))
            }
            BLK_OPTIONS => Block::Options(value.to_vec()),
            BLK_ROUTER_INFO => {
                if len < 2 {
                    return Err(TransportError::Malformed("router info block"));
                }
                Block::RouterInfo {
                    flags: value[0],
                    data: value[2..].to_vec(),
                }
            }
            BLK_I2NP_MESSAGE => Block::I2npMessage(value.to_vec()),
            BLK_FIRST_FRAGMENT => Block::FirstFragment(value.to_vec()),
            BLK_FOLLOW_ON_FRAGMENT => {
                if len < 5 {
                    return Err(TransportError::Malformed("follow-on fragment"));
                }
                Block::FollowOnFragment {
                    fragment_num: value[0] >> 1,
                    is_last: value[0] & 0x01 != 0,
                    msg_id: u32::from_be_bytes(value[1..5].try_into().expect("4 bytes")),
                    data: value[5..].to_vec(),
                }
            }
            BLK_TERMINATION => {
                if len < 9 {
                    return Err(TransportError::Malformed("termination block"));
                }
                Block::Termination {
                    last_packet_num: u64::from_be_bytes(value[..8].try_into().expect("8 bytes")),
                    reason: value[8],
                }
            }
            BLK_RELAY_REQUEST => Block::RelayRequest(value.to_vec()),
            BLK_RELAY_RESPONSE => Block::RelayResponse(value.to_vec()),
            BLK_RELAY_INTRO => Block::RelayIntro(value.to_vec()),
            BLK_PEER_TEST => {
                if len < 2 {
                    return Err(TransportError::Malformed("peer test block"));
                }
                Block::PeerTest {
                    msg_num: value[0],
                    code: value[1],
                    data: value[2..].to_vec(),
                }
            }
            BLK_ACK => {
                if len < 5 || (len - 5) % 2 != 0 {
                    return Err(TransportError::Malformed("ack block"));
                }
                let ranges = value[5..]
                    .chunks_exact(2)
                    .map(|c| (c[0], c[1]))
                    .collect();
                Block::Ack {
                    ack_through: u32::from_be_bytes(value[..4].try_into().expect("4 bytes")),
                    acnt: value[4],
                    ranges,
                }
            }
            BLK_ADDRESS => {
                let port = u16::from_be_bytes(
                    value
                        .get(..2)
                        .ok_or(TransportError::Malformed("address block"))?
                        .try_into()
                        .expect("2 bytes"),
                );
                let ip = match len - 2 {
                    4 => IpAddr::from(<[u8; 4]>::try_from(&value[2..]).expect("4 bytes")),
                    16 => IpAddr::from(<[u8; 16]>::try_from(&value[2..]).expect("16 bytes")),
                    _ => return Err(TransportError::Malformed("address block")),
                };
                Block::Address(SocketAddr::new(ip, port))
            }
            BLK_RELAY_TAG_REQUEST => Block::RelayTagRequest,
            BLK_RELAY_TAG => {
                if len != 4 {
                    return Err(TransportError::Malformed("relay tag block"));
                }
                Block::RelayTag(u32::from_be_bytes(value.try_into().expect("4 bytes")))
            }
            BLK_NEW_TOKEN => {
                if len != 12 {
                    return Err(TransportError::Malformed("new token block"));
                }
                Block::NewToken {
                    expires: u32::from_be_bytes(value[..4].try_into().expect("4 bytes")),
                    token: u64::from_le_bytes(value[4..].try_into().expect("8 bytes")),
                }
            }
            BLK_PATH_CHALLENGE => Block::PathChallenge(value.to_vec()),
            BLK_PATH_RESPONSE => Block::PathResponse(value.to_vec()),
            BLK_PADDING => Block::Padding(len),
            _ => continue, // reserved or unknown: skip
        };
        blocks.push(block);
    }
    Ok(blocks)
}

/// DateTime block for "now", rounded to the nearest second.
pub fn datetime_now() -> Block {
    Block::DateTime(((veil_core::time::millis_since_epoch() + 500) / 1000) as u32)
}
