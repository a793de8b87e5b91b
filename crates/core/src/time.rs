//! Network time.
//!
//! The router keeps one process-wide clock offset, fed either by NTP or by
//! the timestamps peers report during handshakes. Everything that touches
//! the wire uses these functions, never the system clock directly, so a
//! skewed host still produces valid descriptors and tokens.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use crate::{CoreError, IdentHash};

/// Seconds between 1900-01-01 (NTP era 0) and the Unix epoch.
const NTP_UNIX_DELTA: u64 = 2_208_988_800;

/// Offset added to the local clock, in seconds.
static TIME_OFFSET: AtomicI64 = AtomicI64::new(0);

fn local_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

/// Network-adjusted milliseconds since the Unix epoch.
pub fn millis_since_epoch() -> u64 {
    (local_millis() as i64 + TIME_OFFSET.load(Ordering::Relaxed) * 1000) as u64
}

/// Network-adjusted seconds since the Unix epoch.
pub fn seconds_since_epoch() -> u64 {
    millis_since_epoch() / 1000
}

/// Network-adjusted whole minutes since the Unix epoch (tunnel build
/// request timestamps).
pub fn minutes_since_epoch() -> u32 {
    (seconds_since_epoch() / 60) as u32
}

/// Current clock offset in seconds.
pub fn offset() -> i64 {
    TIME_OFFSET.load(Ordering::Relaxed)
}

/// Overwrite the clock offset (NTP result).
pub fn set_offset(seconds: i64) {
    TIME_OFFSET.store(seconds, Ordering::Relaxed);
}

/// `YYYYMMDD` in UTC for the given seconds-since-epoch. Drives routing-key
/// and blinded-key rotation at UTC midnight.
pub fn date_string(seconds: u64) -> String {
    Utc.timestamp_opt(seconds as i64, 0)
        .single()
        .map(|t| t.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "19700101".to_string())
}

/// Today's `YYYYMMDD` (network-adjusted).
pub fn today() -> String {
    date_string(seconds_since_epoch())
}

/// Tomorrow's `YYYYMMDD` (network-adjusted).
pub fn next_day() -> String {
    date_string(seconds_since_epoch() + 86400)
}

/// One peer-reported clock sample. Two samples from distinct identities are
/// required before the offset moves; the median (for two, the bounded pick)
/// keeps one hostile peer from steering our clock.
struct PeerSample {
    ident: IdentHash,
    offset: i64,
}

static PEER_SAMPLES: Mutex<Vec<PeerSample>> = Mutex::new(Vec::new());

/// Record the skew a peer reported during a handshake. Once samples from two
/// distinct identities agree in sign, the smaller magnitude is applied.
/// Returns the applied offset, if any.
pub fn adjust_from_peer(ident: IdentHash, peer_offset: i64) -> Option<i64> {
    let mut samples = PEER_SAMPLES.lock().expect("peer sample lock");
    if let Some(prev) = samples.iter().find(|s| s.ident != ident) {
        if (prev.offset < 0) == (peer_offset < 0) {
            let applied = if prev.offset.abs() < peer_offset.abs() {
                prev.offset
            } else {
                peer_offset
            };
            TIME_OFFSET.fetch_add(applied, Ordering::Relaxed);
            samples.clear();
            info!("Time: adjusted clock by {applied} seconds from peer samples");
            return Some(applied);
        }
    }
    samples.retain(|s| s.ident != ident);
    samples.push(PeerSample {
        ident,
        offset: peer_offset,
    });
    None
}

#[cfg(test)]
pub fn clear_peer_samples() {
    PEER_SAMPLES.lock().expect("peer sample lock").clear();
}

/// One-shot SNTP query (RFC 4330). On success the global offset is replaced
/// with the measured skew.
pub async fn sync_with_ntp(server: &str) -> Result<i64, CoreError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((server, 123)).await?;

    let mut buf = [0u8; 48];
    // LI = 3 (unsynchronized), VN = 3, Mode = 3 (client)
    buf[0] = (3 << 6) | (3 << 3) | 3;
    socket.send(&buf).await?;

    let received = timeout(Duration::from_secs(10), socket.recv(&mut buf))
        .await
        .map_err(|_| CoreError::Ntp(format!("{server}: timed out")))??;
    if received < 48 {
        return Err(CoreError::Ntp(format!("{server}: short response")));
    }

    // Transmit timestamp, seconds field, at offset 40.
    let ntp_seconds = u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]) as u64;
    let unix_seconds = ntp_seconds
        .checked_sub(NTP_UNIX_DELTA)
        .ok_or_else(|| CoreError::Ntp(format!("{server}: timestamp before Unix epoch")))?;
    let new_offset = unix_seconds as i64 - (local_millis() / 1000) as i64;
    set_offset(new_offset);
    info!("Time: offset from {server} is {new_offset} seconds");
    Ok(new_offset)
}

/// Query servers in order until one answers.
pub async fn sync_with_ntp_servers(servers: &[String]) -> Result<i64, CoreError> {
    for server in servers {
        match sync_with_ntp(server).await {
            Ok(offset) => return Ok(offset),
            Err(e) => warn!("Time: {e}"),
        }
    }
    Err(CoreError::Ntp("all servers failed".into()))
}
