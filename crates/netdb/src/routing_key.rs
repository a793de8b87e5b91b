//! Daily-rotating routing keys.
//!
//! Storage targets in the floodfill keyspace are `SHA-256(hash ‖ YYYYMMDD)`,
//! so the set of closest floodfills rotates at UTC midnight. Publishers near
//! the boundary may also address tomorrow's keyspace.

use veil_core::{time, IdentHash};
use veil_crypto::sha256;

/// Publishes this close to midnight also target tomorrow's key (minutes).
pub const NEXT_DAY_ROUTER_INFO_THRESHOLD: u64 = 45;
pub const NEXT_DAY_LEASESET_THRESHOLD: u64 = 10;

pub fn routing_key_for_date(hash: &IdentHash, date: &str) -> IdentHash {
    IdentHash::new(sha256(&[hash.as_bytes(), date.as_bytes()]))
}

pub fn routing_key(hash: &IdentHash, next_day: bool) -> IdentHash {
    let date = if next_day {
        time::next_day()
    } else {
        time::today()
    };
    routing_key_for_date(hash, &date)
}

/// Minutes remaining until UTC midnight.
pub fn minutes_to_midnight() -> u64 {
    let seconds_today = time::seconds_since_epoch() % 86400;
    (86400 - seconds_today) / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_changes_key() {
        let hash = IdentHash::new([7u8; 32]);
        let k1 = routing_key_for_date(&hash, "20240101");
        let k2 = routing_key_for_date(&hash, "20240102");
        assert_ne!(k1, k2);
        assert_eq!(k1, routing_key_for_date(&hash, "20240101"));
    }

    #[test]
    fn test_distinct_hashes_distinct_keys() {
        let a = routing_key_for_date(&IdentHash::new([1u8; 32]), "20240101");
        let b = routing_key_for_date(&IdentHash::new([2u8; 32]), "20240101");
        assert_ne!(a, b);
    }
}
