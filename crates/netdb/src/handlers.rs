//! Inbound netdb message processing.
//!
//! DatabaseStore feeds the stores and fans out to closer floodfills;
//! DatabaseLookup answers from the stores or with a DatabaseSearchReply of
//! closer peers; DatabaseSearchReply advances the matching pending lookup.

use std::collections::HashSet;

use tracing::{debug, warn};

use veil_core::IdentHash;
use veil_data::i2np::{
    DatabaseLookup, DatabaseSearchReply, DatabaseStore, I2npMessage, LOOKUP_TYPE_LEASESET,
    LOOKUP_TYPE_ROUTERINFO, STORE_KIND_ROUTER_INFO,
};
use veil_data::lease_set::{
    LeaseSet, STORE_TYPE_ENCRYPTED_LEASESET2, STORE_TYPE_LEASESET, STORE_TYPE_META_LEASESET2,
    STORE_TYPE_STANDARD_LEASESET2,
};

use crate::netdb::NetDb;
use crate::requests::NetDbRequests;
use crate::NetDbError;

/// Number of closer peers returned in a search reply.
pub const MAX_SEARCH_REPLY_PEERS: usize = 3;

/// What the caller must do after a store was accepted.
pub struct StoreOutcome {
    /// Forward the store to these floodfills (flooding).
    pub flood_to: Vec<IdentHash>,
    /// Confirm with a DeliveryStatus carrying this token through the reply
    /// path.
    pub reply: Option<(u32, veil_core::TunnelId, IdentHash)>,
}

/// Handle a DatabaseStore. `from` is the transport-level source, excluded
/// from flooding; `flood` enables forwarding (floodfill role only).
pub fn handle_database_store(
    netdb: &NetDb,
    requests: &NetDbRequests,
    msg: &I2npMessage,
    from: &IdentHash,
    flood: bool,
) -> Result<StoreOutcome, NetDbError> {
    let store = DatabaseStore::parse(&msg.payload)?;
    let both_days = crate::routing_key::minutes_to_midnight()
        < crate::routing_key::NEXT_DAY_LEASESET_THRESHOLD;

    if store.store_kind == STORE_KIND_ROUTER_INFO {
        let ri = netdb.add_router_info(&store.data)?;
        if ri.hash() != store.key {
            warn!("NetDb: store key does not match descriptor identity");
            return Err(NetDbError::Rejected("store key mismatch"));
        }
        requests.complete(&store.key, Some(store.data.clone()));
    } else {
        let ls = parse_lease_set(store.store_kind, &store.data)?;
        // for plain LeaseSets the store key must equal the identity hash;
        // encrypted publications are keyed by their blinded hash instead
        if store.store_kind != STORE_TYPE_ENCRYPTED_LEASESET2 {
            if let Some(ls) = &ls {
                if ls.hash() != store.key {
                    return Err(NetDbError::Rejected("store key mismatch"));
                }
            }
        }
        if let Some(ls) = ls {
            netdb.add_lease_set(store.key, ls)?;
        }
        requests.complete(&store.key, Some(store.data.clone()));
    }

    let flood_to = if flood {
        netdb.flood_targets(&store.key, from, both_days)
    } else {
        Vec::new()
    };
    let reply = store
        .reply_tunnel
        .map(|(tunnel, gateway)| (store.reply_token, tunnel, gateway));
    Ok(StoreOutcome { flood_to, reply })
}

fn parse_lease_set(store_kind: u8, data: &[u8]) -> Result<Option<LeaseSet>, NetDbError> {
    match store_kind {
        STORE_TYPE_LEASESET => Ok(Some(LeaseSet::from_buffer_v1(data)?)),
        STORE_TYPE_STANDARD_LEASESET2 | STORE_TYPE_META_LEASESET2 => {
            Ok(Some(LeaseSet::from_buffer_v2(store_kind, data)?))
        }
        // stored opaquely: only the destination's clients can decrypt
        STORE_TYPE_ENCRYPTED_LEASESET2 => Ok(None),
        _ => Err(NetDbError::Rejected("unknown store type")),
    }
}

/// The reply a lookup produces.
pub enum LookupOutcome {
    /// Found: send this DatabaseStore back.
    Found(I2npMessage),
    /// Not found: closer floodfills to try.
    Closer(I2npMessage),
}

pub fn handle_database_lookup(
    netdb: &NetDb,
    local: &IdentHash,
    msg: &I2npMessage,
) -> Result<(DatabaseLookup, LookupOutcome), NetDbError> {
    let lookup = DatabaseLookup::parse(&msg.payload)?;
    let lookup_type = lookup.lookup_type();

    if lookup_type != LOOKUP_TYPE_ROUTERINFO {
        if let Some(ls) = netdb.find_lease_set(&lookup.key) {
            let reply = DatabaseStore::build(&lookup.key, ls.store_type(), ls.buffer(), 0, None);
            return Ok((lookup, LookupOutcome::Found(reply)));
        }
    }
    if lookup_type != LOOKUP_TYPE_LEASESET {
        if let Some(ri) = netdb.find_router(&lookup.key) {
            let reply =
                DatabaseStore::build(&lookup.key, STORE_KIND_ROUTER_INFO, ri.buffer(), 0, None);
            return Ok((lookup, LookupOutcome::Found(reply)));
        }
    }

    let mut excluded: HashSet<IdentHash> = lookup.excluded.iter().copied().collect();
    excluded.insert(lookup.from);
    let closer = netdb.closest_floodfills(&lookup.key, MAX_SEARCH_REPLY_PEERS, &excluded, false);
    debug!(
        "NetDb: lookup for {} not satisfied, {} closer peers",
        lookup.key,
        closer.len()
    );
    let reply = DatabaseSearchReply::build(&lookup.key, &closer, local);
    Ok((lookup, LookupOutcome::Closer(reply)))
}

/// Handle a DatabaseSearchReply for one of our own lookups. Unknown closer
/// peers are returned so the caller can queue RouterInfo lookups for them.
pub fn handle_search_reply(
    netdb: &NetDb,
    requests: &NetDbRequests,
    msg: &I2npMessage,
) -> Result<Vec<IdentHash>, NetDbError> {
    let reply = DatabaseSearchReply::parse(&msg.payload)?;
    let candidates = requests.handle_search_reply(&reply.key, reply.from, &reply.peers);
    Ok(candidates
        .into_iter()
        .filter(|p| netdb.find_router(p).is_none())
        .collect())
}
