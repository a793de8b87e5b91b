//! Core types shared across the router: identity hashes, tags, the I2P
//! base32/base64 alphabets, network time, and the typed option records the
//! external configuration frontend hands to each subsystem.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use error::CoreError;
pub use types::{IdentHash, Tag, TunnelId};

use std::sync::atomic::{AtomicU32, Ordering};

/// Network id this router participates in. The main I2P network is 2;
/// test networks pick other values. Process-wide, set once at startup.
static NET_ID: AtomicU32 = AtomicU32::new(2);

/// Set the process-wide network id. Called once by the daemon before any
/// descriptor is parsed.
pub fn set_net_id(id: u32) {
    NET_ID.store(id, Ordering::Relaxed);
}

/// The process-wide network id.
pub fn net_id() -> u32 {
    NET_ID.load(Ordering::Relaxed)
}
