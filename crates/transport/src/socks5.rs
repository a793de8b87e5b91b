//! SOCKS5 UDP-associate for proxied SSU2.
//!
//! One TCP handshake obtains a UDP relay endpoint; the TCP connection then
//! stays open for the lifetime of the association. Every outbound datagram
//! gains a 10-byte (IPv4) or 22-byte (IPv6) request header, and the same is
//! stripped from inbound datagrams.

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::TransportError;

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_UDP_ASSOCIATE: u8 = 3;
const ATYP_IPV4: u8 = 1;
const ATYP_IPV6: u8 = 4;

/// Run the UDP-associate handshake. Returns the relay endpoint; the stream
/// must be kept alive by the caller.
pub async fn udp_associate(stream: &mut TcpStream) -> Result<SocketAddr, TransportError> {
    stream.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(TransportError::Socks("method negotiation failed"));
    }

    // UDP_ASSOCIATE with a wildcard local endpoint
    stream
        .write_all(&[
            SOCKS_VERSION,
            CMD_UDP_ASSOCIATE,
            0,
            ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
        .await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION || head[1] != 0 {
        return Err(TransportError::Socks("associate refused"));
    }
    let ip = match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            IpAddr::from(addr)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            IpAddr::from(addr)
        }
        _ => return Err(TransportError::Socks("unexpected address type")),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}

/// Prepend the SOCKS5 UDP request header for `target`.
pub fn wrap_datagram(target: &SocketAddr, payload: &[u8]) -> Vec<u8> {
    let header_len = match target {
        SocketAddr::V4(_) => 10,
        SocketAddr::V6(_) => 22,
    };
    let mut out = Vec::with_capacity(header_len + payload.len());
    out.extend_from_slice(&[0, 0, 0]); // RSV, FRAG
    match target {
        SocketAddr::V4(addr) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
        }
    }
    out.extend_from_slice(&target.port().to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Strip the SOCKS5 UDP header; returns the datagram source and payload
/// range start.
pub fn unwrap_datagram(buf: &[u8]) -> Result<(SocketAddr, usize), TransportError> {
    if buf.len() < 10 || buf[2] != 0 {
        return Err(TransportError::Malformed("socks5 udp header"));
    }
    match buf[3] {
        ATYP_IPV4 => {
            let ip: [u8; 4] = buf[4..8].try_into().expect("4 bytes");
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            Ok((SocketAddr::new(IpAddr::from(ip), port), 10))
        }
        ATYP_IPV6 => {
            if buf.len() < 22 {
                return Err(TransportError::Malformed("socks5 udp header"));
            }
            let ip: [u8; 16] = buf[4..20].try_into().expect("16 bytes");
            let port = u16::from_be_bytes([buf[20], buf[21]]);
            Ok((SocketAddr::new(IpAddr::from(ip), port), 22))
        }
        _ => Err(TransportError::Malformed("socks5 address type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_v4() {
        let target: SocketAddr = "192.0.2.7:9000".parse().unwrap();
        let wrapped = wrap_datagram(&target, b"datagram");
        assert_eq!(wrapped.len(), 10 + 8);
        let (addr, offset) = unwrap_datagram(&wrapped).unwrap();
        assert_eq!(addr, target);
        assert_eq!(&wrapped[offset..], b"datagram");
    }

    #[test]
    fn test_wrap_unwrap_v6() {
        let target: SocketAddr = "[2001:db8::1]:4567".parse().unwrap();
        let wrapped = wrap_datagram(&target, b"x");
        assert_eq!(wrapped.len(), 22 + 1);
        let (addr, offset) = unwrap_datagram(&wrapped).unwrap();
        assert_eq!(addr, target);
        assert_eq!(offset, 22);
    }

    #[test]
    fn test_unwrap_rejects_fragments() {
        let target: SocketAddr = "192.0.2.7:9000".parse().unwrap();
        let mut wrapped = wrap_datagram(&target, b"d");
        wrapped[2] = 1; // fragmented datagrams are not supported
        assert!(unwrap_datagram(&wrapped).is_err());
    }
}
