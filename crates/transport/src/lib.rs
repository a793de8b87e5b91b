//! Peer-to-peer link transports.
//!
//! SSU2 (Noise XK over UDP with per-packet AEAD) is the primary transport;
//! the legacy SSU and the TCP sibling NTCP2 are carried for interop. The
//! protocol state machines are written sans-IO, consuming and producing
//! datagrams, and the server modules drive them over tokio sockets.

pub mod ntcp2;
pub mod session;
pub mod socks5;
pub mod ssu;
pub mod ssu2;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
    #[error("Packet dropped: AEAD verification failed")]
    Aead,
    #[error("Unexpected message type {0} in state {1}")]
    UnexpectedMessage(u8, &'static str),
    #[error("Session terminated: reason {0}")]
    Terminated(u8),
    #[error("Clock skew {0} seconds exceeds limit")]
    ClockSkew(i64),
    #[error("Bad or expired token")]
    BadToken,
    #[error("Wrong network id {0}")]
    WrongNetId(u8),
    #[error("Version {0} is not supported")]
    BadVersion(u8),
    #[error("Outbound queue full")]
    QueueFull,
    #[error("SOCKS proxy error: {0}")]
    Socks(&'static str),
    #[error(transparent)]
    Crypto(#[from] veil_crypto::CryptoError),
    #[error(transparent)]
    Data(#[from] veil_data::DataError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
