//! Tunnel construction and maintenance: per-hop configuration chains,
//! encrypted build records (short Noise-N and long ECIES forms), the tunnel
//! state machine with its layered cipher, and the per-destination pool.

pub mod build;
pub mod hop;
pub mod pool;
pub mod tunnel;

pub use hop::HopConfig;
pub use pool::TunnelPool;
pub use tunnel::{Tunnel, TunnelState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Record for hop {0} failed to decrypt")]
    RecordDecrypt(usize),
    #[error("Malformed build record: {0}")]
    Malformed(&'static str),
    #[error("Hop rejected the tunnel with code {0}")]
    Rejected(u8),
    #[error("No peers available for tunnel path")]
    NoPeers,
    #[error(transparent)]
    Crypto(#[from] veil_crypto::CryptoError),
    #[error(transparent)]
    Data(#[from] veil_data::DataError),
}
