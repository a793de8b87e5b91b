//! I2NP: the router-to-router message layer.
//!
//! Two envelope forms exist: the 16-byte standard header (type, id,
//! millisecond expiration, size, checksum) used inside tunnel messages, and
//! the short 9-byte header (type, id, second expiration) used by the modern
//! transports. The payload builders here cover the netdb messages; tunnel
//! build messages are assembled by the tunnel crate.

use rand::Rng;

use veil_core::{time, IdentHash, TunnelId};
use veil_crypto::sha256;

use crate::{DataError, Reader};

pub const MSG_TYPE_DATABASE_STORE: u8 = 1;
pub const MSG_TYPE_DATABASE_LOOKUP: u8 = 2;
pub const MSG_TYPE_DATABASE_SEARCH_REPLY: u8 = 3;
pub const MSG_TYPE_DELIVERY_STATUS: u8 = 10;
pub const MSG_TYPE_GARLIC: u8 = 11;
pub const MSG_TYPE_TUNNEL_DATA: u8 = 18;
pub const MSG_TYPE_TUNNEL_GATEWAY: u8 = 19;
pub const MSG_TYPE_DATA: u8 = 20;
pub const MSG_TYPE_VARIABLE_TUNNEL_BUILD: u8 = 23;
pub const MSG_TYPE_VARIABLE_TUNNEL_BUILD_REPLY: u8 = 24;
pub const MSG_TYPE_SHORT_TUNNEL_BUILD: u8 = 25;
pub const MSG_TYPE_OUTBOUND_TUNNEL_BUILD_REPLY: u8 = 26;

pub const SHORT_HEADER_LEN: usize = 9;

/// Default lifetime of a locally created message.
pub const MESSAGE_EXPIRATION_TIMEOUT: u64 = 8000; // ms

/// Database store types carried in a DatabaseStore message.
pub const STORE_KIND_ROUTER_INFO: u8 = 0;

#[derive(Debug, Clone)]
pub struct I2npMessage {
    pub msg_type: u8,
    pub msg_id: u32,
    /// Milliseconds since epoch.
    pub expiration: u64,
    pub payload: Vec<u8>,
}

impl I2npMessage {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            msg_id: rand::thread_rng().gen_range(1..u32::MAX),
            expiration: time::millis_since_epoch() + MESSAGE_EXPIRATION_TIMEOUT,
            payload,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration <= now_ms
    }

    /// Short form: type ‖ id ‖ expiration-seconds.
    pub fn to_short_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SHORT_HEADER_LEN + self.payload.len());
        out.push(self.msg_type);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&((self.expiration / 1000) as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_short_bytes(buf: &[u8]) -> Result<Self, DataError> {
        let mut r = Reader::new(buf);
        let msg_type = r.u8()?;
        let msg_id = r.u32()?;
        let expiration = r.u32()? as u64 * 1000;
        let payload = r.take(r.remaining())?.to_vec();
        Ok(Self {
            msg_type,
            msg_id,
            expiration,
            payload,
        })
    }

    /// Standard form: type ‖ id ‖ expiration-ms ‖ size ‖ checksum.
    pub fn to_standard_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        out.push(self.msg_type);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.push(sha256(&[&self.payload])[0]);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_standard_bytes(buf: &[u8]) -> Result<Self, DataError> {
        let mut r = Reader::new(buf);
        let msg_type = r.u8()?;
        let msg_id = r.u32()?;
        let expiration = r.u64()?;
        let size = r.u16()? as usize;
        let checksum = r.u8()?;
        let payload = r.take(size)?.to_vec();
        if sha256(&[&payload])[0] != checksum {
            return Err(DataError::Malformed("I2NP checksum"));
        }
        Ok(Self {
            msg_type,
            msg_id,
            expiration,
            payload,
        })
    }
}

/// Gzip for RouterInfo payloads inside DatabaseStore and transport blocks.
pub fn gzip_compress(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory gzip");
    encoder.finish().expect("in-memory gzip")
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, DataError> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| DataError::Malformed("gzip stream"))?;
    Ok(out)
}

/// A parsed DatabaseStore payload.
#[derive(Debug)]
pub struct DatabaseStore {
    pub key: IdentHash,
    pub store_kind: u8,
    pub reply_token: u32,
    pub reply_tunnel: Option<(TunnelId, IdentHash)>,
    pub data: Vec<u8>,
}

impl DatabaseStore {
    pub fn parse(payload: &[u8]) -> Result<Self, DataError> {
        let mut r = Reader::new(payload);
        let key = IdentHash::from_slice(r.take(32)?).map_err(|_| DataError::Malformed("store key"))?;
        let store_kind = r.u8()?;
        let reply_token = r.u32()?;
        let reply_tunnel = if reply_token != 0 {
            let tunnel_id = r.u32()?;
            let gateway =
                IdentHash::from_slice(r.take(32)?).map_err(|_| DataError::Malformed("gateway"))?;
            Some((tunnel_id, gateway))
        } else {
            None
        };
        let data = if store_kind == STORE_KIND_ROUTER_INFO {
            let len = r.u16()? as usize;
            gzip_decompress(r.take(len)?)?
        } else {
            r.take(r.remaining())?.to_vec()
        };
        Ok(Self {
            key,
            store_kind,
            reply_token,
            reply_tunnel,
            data,
        })
    }

    pub fn build(
        key: &IdentHash,
        store_kind: u8,
        data: &[u8],
        reply_token: u32,
        reply_tunnel: Option<(TunnelId, IdentHash)>,
    ) -> I2npMessage {
        let mut payload = Vec::with_capacity(64 + data.len());
        payload.extend_from_slice(key.as_bytes());
        payload.push(store_kind);
        payload.extend_from_slice(&reply_token.to_be_bytes());
        if reply_token != 0 {
            let (tunnel_id, gateway) = reply_tunnel.unwrap_or((0, IdentHash::zero()));
            payload.extend_from_slice(&tunnel_id.to_be_bytes());
            payload.extend_from_slice(gateway.as_bytes());
        }
        if store_kind == STORE_KIND_ROUTER_INFO {
            let compressed = gzip_compress(data);
            payload.extend_from_slice(&(compressed.len() as u16).to_be_bytes());
            payload.extend_from_slice(&compressed);
        } else {
            payload.extend_from_slice(data);
        }
        I2npMessage::new(MSG_TYPE_DATABASE_STORE, payload)
    }
}

pub const LOOKUP_FLAG_TUNNEL_REPLY: u8 = 0x01;
pub const LOOKUP_FLAG_ENCRYPTED_REPLY: u8 = 0x02;
pub const LOOKUP_TYPE_NORMAL: u8 = 0x00;
pub const LOOKUP_TYPE_LEASESET: u8 = 0x04;
pub const LOOKUP_TYPE_ROUTERINFO: u8 = 0x08;
pub const LOOKUP_TYPE_EXPLORATORY: u8 = 0x0c;

/// A parsed DatabaseLookup payload.
#[derive(Debug)]
pub struct DatabaseLookup {
    pub key: IdentHash,
    pub from: IdentHash,
    pub flags: u8,
    pub reply_tunnel: Option<TunnelId>,
    pub excluded: Vec<IdentHash>,
    /// `(session key, tag)` for an encrypted reply.
    pub reply_key: Option<([u8; 32], [u8; 8])>,
}

impl DatabaseLookup {
    pub fn lookup_type(&self) -> u8 {
        self.flags & 0x0c
    }

    pub fn parse(payload: &[u8]) -> Result<Self, DataError> {
        let mut r = Reader::new(payload);
        let key = IdentHash::from_slice(r.take(32)?).map_err(|_| DataError::Malformed("lookup key"))?;
        let from = IdentHash::from_slice(r.take(32)?).map_err(|_| DataError::Malformed("from"))?;
        let flags = r.u8()?;
        let reply_tunnel = if flags & LOOKUP_FLAG_TUNNEL_REPLY != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        let num_excluded = r.u16()? as usize;
        let mut excluded = Vec::with_capacity(num_excluded.min(512));
        for _ in 0..num_excluded {
            excluded.push(
                IdentHash::from_slice(r.take(32)?).map_err(|_| DataError::Malformed("excluded"))?,
            );
        }
        let reply_key = if flags & LOOKUP_FLAG_ENCRYPTED_REPLY != 0 {
            let key: [u8; 32] = r.take(32)?.try_into().expect("32 bytes");
            let num_tags = r.u8()?;
            if num_tags == 0 {
                return Err(DataError::Malformed("reply tag count"));
            }
            let tag: [u8; 8] = r.take(8)?.try_into().expect("8 bytes");
            // remaining tags ignored: one reply is expected
            r.take((num_tags as usize - 1) * 8)?;
            Some((key, tag))
        } else {
            None
        };
        Ok(Self {
            key,
            from,
            flags,
            reply_tunnel,
            excluded,
            reply_key,
        })
    }

    pub fn build(
        key: &IdentHash,
        from: &IdentHash,
        lookup_type: u8,
        reply_tunnel: Option<TunnelId>,
        excluded: &[IdentHash],
        reply_key: Option<([u8; 32], [u8; 8])>,
    ) -> I2npMessage {
        let mut flags = lookup_type;
        if reply_tunnel.is_some() {
            flags |= LOOKUP_FLAG_TUNNEL_REPLY;
        }
        if reply_key.is_some() {
            flags |= LOOKUP_FLAG_ENCRYPTED_REPLY;
        }
        let mut payload = Vec::with_capacity(80 + excluded.len() * 32);
        payload.extend_from_slice(key.as_bytes());
        payload.extend_from_slice(from.as_bytes());
        payload.push(flags);
        if let Some(tunnel) = reply_tunnel {
            payload.extend_from_slice(&tunnel.to_be_bytes());
        }
        payload.extend_from_slice(&(excluded.len() as u16).to_be_bytes());
        for hash in excluded {
            payload.extend_from_slice(hash.as_bytes());
        }
        if let Some((session_key, tag)) = reply_key {
            payload.extend_from_slice(&session_key);
            payload.push(1);
            payload.extend_from_slice(&tag);
        }
        I2npMessage::new(MSG_TYPE_DATABASE_LOOKUP, payload)
    }
}

/// A parsed DatabaseSearchReply payload: closer floodfills to try next.
#[derive(Debug)]
pub struct DatabaseSearchReply {
    pub key: IdentHash,
    pub peers: Vec<IdentHash>,
    pub from: IdentHash,
}

impl DatabaseSearchReply {
    pub fn parse(payload: &[u8]) -> Result<Self, DataError> {
        let mut r = Reader::new(payload);
        let key = IdentHash::from_slice(r.take(32)?).map_err(|_| DataError::Malformed("reply key"))?;
        let num = r.u8()? as usize;
        let mut peers = Vec::with_capacity(num);
        for _ in 0..num {
            peers.push(IdentHash::from_slice(r.take(32)?).map_err(|_| DataError::Malformed("peer"))?);
        }
        let from = IdentHash::from_slice(r.take(32)?).map_err(|_| DataError::Malformed("from"))?;
        Ok(Self { key, peers, from })
    }

    pub fn build(key: &IdentHash, peers: &[IdentHash], from: &IdentHash) -> I2npMessage {
        let mut payload = Vec::with_capacity(65 + peers.len() * 32);
        payload.extend_from_slice(key.as_bytes());
        payload.push(peers.len() as u8);
        for peer in peers {
            payload.extend_from_slice(peer.as_bytes());
        }
        payload.extend_from_slice(from.as_bytes());
        I2npMessage::new(MSG_TYPE_DATABASE_SEARCH_REPLY, payload)
    }
}

/// DeliveryStatus: publish confirmations and pings.
pub fn build_delivery_status(token: u32) -> I2npMessage {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&token.to_be_bytes());
    payload.extend_from_slice(&time::millis_since_epoch().to_be_bytes());
    I2npMessage::new(MSG_TYPE_DELIVERY_STATUS, payload)
}

/// TunnelGateway: wrap a message for injection at an inbound gateway.
pub fn build_tunnel_gateway(tunnel_id: TunnelId, inner: &I2npMessage) -> I2npMessage {
    let inner_bytes = inner.to_standard_bytes();
    let mut payload = Vec::with_capacity(6 + inner_bytes.len());
    payload.extend_from_slice(&tunnel_id.to_be_bytes());
    payload.extend_from_slice(&(inner_bytes.len() as u16).to_be_bytes());
    payload.extend_from_slice(&inner_bytes);
    I2npMessage::new(MSG_TYPE_TUNNEL_GATEWAY, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_header_roundtrip() {
        let msg = I2npMessage::new(MSG_TYPE_DATA, vec![1, 2, 3]);
        let bytes = msg.to_short_bytes();
        assert_eq!(bytes.len(), SHORT_HEADER_LEN + 3);
        let parsed = I2npMessage::from_short_bytes(&bytes).unwrap();
        assert_eq!(parsed.msg_type, MSG_TYPE_DATA);
        assert_eq!(parsed.msg_id, msg.msg_id);
        assert_eq!(parsed.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_standard_header_checksum() {
        let msg = I2npMessage::new(MSG_TYPE_DATA, vec![5; 100]);
        let mut bytes = msg.to_standard_bytes();
        I2npMessage::from_standard_bytes(&bytes).unwrap();
        bytes[20] ^= 1;
        assert!(I2npMessage::from_standard_bytes(&bytes).is_err());
    }

    #[test]
    fn test_database_store_roundtrip() {
        let key = IdentHash::new([7u8; 32]);
        let data = vec![9u8; 300];
        let msg = DatabaseStore::build(&key, STORE_KIND_ROUTER_INFO, &data, 42, Some((5, IdentHash::new([8u8; 32]))));
        let parsed = DatabaseStore::parse(&msg.payload).unwrap();
        assert_eq!(parsed.key, key);
        assert_eq!(parsed.reply_token, 42);
        assert_eq!(parsed.reply_tunnel, Some((5, IdentHash::new([8u8; 32]))));
        assert_eq!(parsed.data, data); // transparently gunzipped
    }

    #[test]
    fn test_database_lookup_roundtrip() {
        let key = IdentHash::new([1u8; 32]);
        let from = IdentHash::new([2u8; 32]);
        let excluded = vec![IdentHash::new([3u8; 32]), IdentHash::new([4u8; 32])];
        let msg = DatabaseLookup::build(
            &key,
            &from,
            LOOKUP_TYPE_LEASESET,
            Some(77),
            &excluded,
            Some(([6u8; 32], [7u8; 8])),
        );
        let parsed = DatabaseLookup::parse(&msg.payload).unwrap();
        assert_eq!(parsed.key, key);
        assert_eq!(parsed.lookup_type(), LOOKUP_TYPE_LEASESET);
        assert_eq!(parsed.reply_tunnel, Some(77));
        assert_eq!(parsed.excluded, excluded);
        assert_eq!(parsed.reply_key, Some(([6u8; 32], [7u8; 8])));
    }

    #[test]
    fn test_search_reply_roundtrip() {
        let key = IdentHash::new([1u8; 32]);
        let from = IdentHash::new([9u8; 32]);
        let peers = vec![IdentHash::new([2u8; 32]); 3];
        let msg = DatabaseSearchReply::build(&key, &peers, &from);
        let parsed = DatabaseSearchReply::parse(&msg.payload).unwrap();
        assert_eq!(parsed.peers.len(), 3);
        assert_eq!(parsed.from, from);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let data = vec![3u8; 1000];
        let compressed = gzip_compress(&data);
        assert!(compressed.len() < data.len());
        assert_eq!(gzip_decompress(&compressed).unwrap(), data);
        assert!(gzip_decompress(&[1, 2, 3]).is_err());
    }
}
