//! Outstanding destination lookups.
//!
//! Each lookup keeps the floodfills already tried, retries through fresh
//! ones up to the attempt cap, and fires every registered completion
//! callback exactly once, with the result or with `None` on failure,
//! timeout, or cancellation. Exploratory lookups share the machinery on a
//! slower clock.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rand::Rng;
use tracing::debug;

use veil_core::{time, IdentHash};

pub const MAX_NUM_REQUEST_ATTEMPTS: u32 = 5;
pub const MIN_REQUEST_TIME: u64 = 5; // seconds between attempts
pub const MAX_REQUEST_TIME: u64 = 40; // seconds until a lookup is abandoned
pub const MAX_EXPLORATORY_REQUEST_TIME: u64 = 30; // seconds
pub const EXPLORATORY_REQUEST_INTERVAL: u64 = 55; // seconds
pub const EXPLORATORY_REQUEST_INTERVAL_VARIANCE: u64 = 170; // seconds

pub type LookupResult = Option<Vec<u8>>;
pub type CompletionCallback = Box<dyn FnOnce(LookupResult) + Send>;

pub struct RequestedDestination {
    pub destination: IdentHash,
    pub is_exploratory: bool,
    pub excluded: HashSet<IdentHash>,
    pub num_attempts: u32,
    /// Seconds since epoch.
    pub creation_time: u64,
    pub last_request_time: u64,
    callbacks: Vec<CompletionCallback>,
}

impl RequestedDestination {
    fn new(destination: IdentHash, is_exploratory: bool) -> Self {
        Self {
            destination,
            is_exploratory,
            excluded: HashSet::new(),
            num_attempts: 0,
            creation_time: time::seconds_since_epoch(),
            last_request_time: 0,
            callbacks: Vec::new(),
        }
    }

    pub fn is_excluded(&self, hash: &IdentHash) -> bool {
        self.excluded.contains(hash)
    }

    /// Record an attempt through `floodfill`, excluding it from retries.
    pub fn attempt(&mut self, floodfill: IdentHash) {
        self.excluded.insert(floodfill);
        self.num_attempts += 1;
        self.last_request_time = time::seconds_since_epoch();
    }

    fn max_time(&self) -> u64 {
        if self.is_exploratory {
            MAX_EXPLORATORY_REQUEST_TIME
        } else {
            MAX_REQUEST_TIME
        }
    }

    fn is_exhausted(&self, now: u64) -> bool {
        self.num_attempts >= MAX_NUM_REQUEST_ATTEMPTS || now >= self.creation_time + self.max_time()
    }

    fn wants_retry(&self, now: u64) -> bool {
        !self.is_exhausted(now) && now >= self.last_request_time + MIN_REQUEST_TIME
    }

    fn complete(self, result: LookupResult) {
        for callback in self.callbacks {
            callback(result.clone());
        }
    }
}

/// A retry the manager wants issued: look `destination` up through the next
/// floodfill, skipping `excluded`.
pub struct PendingRetry {
    pub destination: IdentHash,
    pub is_exploratory: bool,
    pub excluded: HashSet<IdentHash>,
}

#[derive(Default)]
pub struct NetDbRequests {
    requests: Mutex<HashMap<IdentHash, RequestedDestination>>,
}

impl NetDbRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().expect("request map").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register interest in a destination. Returns true when this is a new
    /// lookup the caller should issue; an existing lookup just gains the
    /// callback.
    pub fn create_request(
        &self,
        destination: IdentHash,
        is_exploratory: bool,
        callback: Option<CompletionCallback>,
    ) -> bool {
        let mut requests = self.requests.lock().expect("request map");
        match requests.get_mut(&destination) {
            Some(existing) => {
                if let Some(cb) = callback {
                    existing.callbacks.push(cb);
                }
                false
            }
            None => {
                let mut request = RequestedDestination::new(destination, is_exploratory);
                if let Some(cb) = callback {
                    request.callbacks.push(cb);
                }
                requests.insert(destination, request);
                true
            }
        }
    }

    /// Note that an attempt went out through `floodfill`.
    pub fn note_attempt(&self, destination: &IdentHash, floodfill: IdentHash) {
        if let Some(request) = self
            .requests
            .lock()
            .expect("request map")
            .get_mut(destination)
        {
            request.attempt(floodfill);
        }
    }

    /// Resolve a lookup; every callback fires once with the result.
    pub fn complete(&self, destination: &IdentHash, result: LookupResult) {
        let request = self.requests.lock().expect("request map").remove(destination);
        if let Some(request) = request {
            debug!(
                "NetDbRequests: {} complete after {} attempts, found={}",
                destination,
                request.num_attempts,
                result.is_some()
            );
            request.complete(result);
        }
    }

    /// Process a DatabaseSearchReply for `destination`: the named floodfill
    /// answered without the data. Returns the not-yet-excluded peers worth
    /// exploring.
    pub fn handle_search_reply(
        &self,
        destination: &IdentHash,
        from: IdentHash,
        closer_peers: &[IdentHash],
    ) -> Vec<IdentHash> {
        let mut requests = self.requests.lock().expect("request map");
        let Some(request) = requests.get_mut(destination) else {
            return Vec::new();
        };
        request.excluded.insert(from);
        closer_peers
            .iter()
            .filter(|p| !request.is_excluded(p))
            .copied()
            .collect()
    }

    /// Expire exhausted lookups (their callbacks get `None`) and return the
    /// retries to issue now.
    pub fn manage(&self) -> Vec<PendingRetry> {
        let now = time::seconds_since_epoch();
        let mut expired = Vec::new();
        let mut retries = Vec::new();
        {
            let mut requests = self.requests.lock().expect("request map");
            let exhausted: Vec<IdentHash> = requests
                .values()
                .filter(|r| r.is_exhausted(now))
                .map(|r| r.destination)
                .collect();
            for hash in exhausted {
                if let Some(request) = requests.remove(&hash) {
                    expired.push(request);
                }
            }
            for request in requests.values_mut() {
                if request.wants_retry(now) {
                    request.last_request_time = now;
                    retries.push(PendingRetry {
                        destination: request.destination,
                        is_exploratory: request.is_exploratory,
                        excluded: request.excluded.clone(),
                    });
                }
            }
        }
        for request in expired {
            debug!("NetDbRequests: {} expired", request.destination);
            request.complete(None);
        }
        retries
    }

    /// Fail everything (shutdown): all callbacks get `None`.
    pub fn cancel_all(&self) {
        let drained: Vec<RequestedDestination> = {
            let mut requests = self.requests.lock().expect("request map");
            requests.drain().map(|(_, r)| r).collect()
        };
        for request in drained {
            request.complete(None);
        }
    }
}

/// The randomized pause before the next exploratory cycle.
pub fn next_exploratory_interval() -> u64 {
    EXPLORATORY_REQUEST_INTERVAL
        + rand::thread_rng().gen_range(0..=EXPLORATORY_REQUEST_INTERVAL_VARIANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn dest(n: u8) -> IdentHash {
        IdentHash::new([n; 32])
    }

    #[test]
    fn test_dedup_and_single_completion() {
        let requests = NetDbRequests::new();
        let calls = Arc::new(AtomicU32::new(0));

        let c1 = calls.clone();
        assert!(requests.create_request(
            dest(1),
            false,
            Some(Box::new(move |r| {
                assert!(r.is_some());
                c1.fetch_add(1, Ordering::SeqCst);
            }))
        ));
        // second interest in the same destination does not start a new
        // lookup
        let c2 = calls.clone();
        assert!(!requests.create_request(
            dest(1),
            false,
            Some(Box::new(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            }))
        ));
        assert_eq!(requests.len(), 1);

        requests.complete(&dest(1), Some(vec![1, 2, 3]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(requests.is_empty());
        // completing again is a no-op
        requests.complete(&dest(1), None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_attempt_cap_expires_with_none() {
        let requests = NetDbRequests::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        requests.create_request(
            dest(2),
            false,
            Some(Box::new(move |r| {
                assert!(r.is_none());
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        for i in 0..MAX_NUM_REQUEST_ATTEMPTS {
            requests.note_attempt(&dest(2), dest(100 + i as u8));
        }
        let retries = requests.manage();
        assert!(retries.is_empty());
        assert!(requests.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_search_reply_filters_excluded() {
        let requests = NetDbRequests::new();
        requests.create_request(dest(3), false, None);
        requests.note_attempt(&dest(3), dest(10));
        let peers = requests.handle_search_reply(&dest(3), dest(11), &[dest(10), dest(12)]);
        assert_eq!(peers, vec![dest(12)]);
        // the answering floodfill is now excluded too
        let peers = requests.handle_search_reply(&dest(3), dest(13), &[dest(11)]);
        assert!(peers.is_empty());
    }

    #[test]
    fn test_cancel_all_fires_none() {
        let requests = NetDbRequests::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        requests.create_request(
            dest(4),
            false,
            Some(Box::new(move |r| {
                assert!(r.is_none());
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        requests.cancel_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exploratory_interval_range() {
        for _ in 0..20 {
            let interval = next_exploratory_interval();
            assert!(interval >= EXPLORATORY_REQUEST_INTERVAL);
            assert!(
                interval <= EXPLORATORY_REQUEST_INTERVAL + EXPLORATORY_REQUEST_INTERVAL_VARIANCE
            );
        }
    }
}
