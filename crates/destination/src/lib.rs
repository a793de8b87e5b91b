//! Local destinations: endpoint identities that publish LeaseSets over
//! their inbound tunnels, resolve remote destinations on demand, and
//! dispatch end-to-end traffic to the registered protocol handlers.

pub mod destination;

pub use destination::{Destination, LeaseSetPublisher, ProtocolHandler};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DestinationError {
    #[error("No tunnels available")]
    NoTunnels,
    #[error("No floodfill available")]
    NoFloodfill,
    #[error("Publish rate limited")]
    RateLimited,
    #[error("Unknown protocol {0}")]
    UnknownProtocol(u8),
    #[error(transparent)]
    Data(#[from] veil_data::DataError),
    #[error(transparent)]
    Tunnel(#[from] veil_tunnel::TunnelError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
