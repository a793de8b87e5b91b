//! The network database: a Kademlia-indexed directory of router descriptors
//! and LeaseSets, with floodfill selection, daily routing-key rotation,
//! pending-lookup bookkeeping, and the on-disk descriptor store.

pub mod dht;
pub mod handlers;
pub mod netdb;
pub mod persist;
pub mod requests;
pub mod routing_key;

pub use dht::DhtTable;
pub use netdb::NetDb;
pub use requests::NetDbRequests;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetDbError {
    #[error("Descriptor rejected: {0}")]
    Rejected(&'static str),
    #[error("Stale descriptor for {0}")]
    Stale(veil_core::IdentHash),
    #[error(transparent)]
    Data(#[from] veil_data::DataError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
