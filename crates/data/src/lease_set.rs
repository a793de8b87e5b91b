//! LeaseSets: the signed publications naming a destination's inbound tunnel
//! gateways and encryption keys.
//!
//! Three store types appear on the wire: the fixed-layout original (type 1),
//! LeaseSet2 (type 3, with a meta variant type 7), and the encrypted
//! LeaseSet2 envelope (type 5, handled in [`crate::encrypted_ls2`]).
//! LeaseSet2 signatures cover a one-byte store-type prefix plus the body.

use veil_core::IdentHash;
use veil_crypto::sig::SigType;

use crate::identity::Identity;
use crate::keys::{OfflineSignature, PrivateKeys};
use crate::{DataError, Reader};

pub const STORE_TYPE_LEASESET: u8 = 1;
pub const STORE_TYPE_STANDARD_LEASESET2: u8 = 3;
pub const STORE_TYPE_ENCRYPTED_LEASESET2: u8 = 5;
pub const STORE_TYPE_META_LEASESET2: u8 = 7;

pub const MAX_NUM_LEASES: usize = 16;

pub const LEASESET2_FLAG_OFFLINE_KEYS: u16 = 0x0001;
pub const LEASESET2_FLAG_UNPUBLISHED: u16 = 0x0002;
pub const LEASESET2_FLAG_PUBLISHED_ENCRYPTED: u16 = 0x0004;

/// One inbound gateway entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub gateway: IdentHash,
    pub tunnel_id: u32,
    /// Milliseconds since epoch.
    pub end_date: u64,
}

#[derive(Debug)]
pub struct LeaseSet {
    store_type: u8,
    identity: Identity,
    /// Seconds, LS2 only (zero for type 1).
    published: u32,
    /// Milliseconds since epoch.
    expiration: u64,
    /// Sorted by expiration, latest first.
    leases: Vec<Lease>,
    /// `(crypto type, key bytes)`, in publication order.
    enc_keys: Vec<(u16, Vec<u8>)>,
    is_public: bool,
    buffer: Vec<u8>,
}

fn sort_leases(leases: &mut [Lease]) {
    leases.sort_by(|a, b| b.end_date.cmp(&a.end_date));
}

/// Parse and verify an offline-signature block appearing inside a LS2
/// header; returns the transient key's type and bytes plus bytes consumed.
pub(crate) fn read_offline_block(
    identity_verify: impl Fn(&[u8], &[u8]) -> Result<(), DataError>,
    buf: &[u8],
    offset: usize,
    outer_sig_len: usize,
) -> Result<(SigType, Vec<u8>, usize), DataError> {
    let mut r = Reader::new(&buf[offset..]);
    let _expires = r.u32()?;
    let sig_type = SigType::from_code(r.u16()?)?;
    let pubkey = r.take(sig_type.pubkey_len())?.to_vec();
    let block_end = r.position();
    let sig = r.take(outer_sig_len)?;
    identity_verify(&buf[offset..offset + block_end], sig)?;
    Ok((sig_type, pubkey, r.position()))
}

impl LeaseSet {
    /// Parse a type-1 LeaseSet: identity, 256-byte encryption key, unused
    /// 128-byte signing key field, lease list, signature.
    pub fn from_buffer_v1(buf: &[u8]) -> Result<Self, DataError> {
        let (identity, ident_len) = Identity::from_buffer(buf)?;
        let mut r = Reader::new(&buf[ident_len..]);
        let enc_key = r.take(256)?.to_vec();
        r.take(128)?; // legacy signing key field, unused
        let num_leases = r.u8()? as usize;
        if num_leases == 0 || num_leases > MAX_NUM_LEASES {
            return Err(DataError::Malformed("lease count"));
        }
        let mut leases = Vec::with_capacity(num_leases);
        for _ in 0..num_leases {
            let gateway = IdentHash::from_slice(r.take(32)?)
                .map_err(|_| DataError::Malformed("lease gateway"))?;
            let tunnel_id = r.u32()?;
            let end_date = r.u64()?;
            leases.push(Lease {
                gateway,
                tunnel_id,
                end_date,
            });
        }
        let signed_len = ident_len + r.position();
        let sig = r.take(identity.sig_len())?;
        identity.verify(&buf[..signed_len], sig)?;

        sort_leases(&mut leases);
        let expiration = leases.first().map(|l| l.end_date).unwrap_or(0);
        Ok(Self {
            store_type: STORE_TYPE_LEASESET,
            identity,
            published: 0,
            expiration,
            leases,
            enc_keys: vec![(crate::identity::CRYPTO_TYPE_ELGAMAL, enc_key)],
            is_public: true,
            buffer: buf[..ident_len + r.position()].to_vec(),
        })
    }

    /// Parse a LeaseSet2 (standard or meta). The signature covers the
    /// store-type byte followed by the body.
    pub fn from_buffer_v2(store_type: u8, buf: &[u8]) -> Result<Self, DataError> {
        let (identity, ident_len) = Identity::from_buffer(buf)?;
        let mut r = Reader::new(&buf[ident_len..]);
        let published = r.u32()?;
        let expires_delta = r.u16()?;
        let flags = r.u16()?;

        let mut transient: Option<(SigType, Vec<u8>)> = None;
        if flags & LEASESET2_FLAG_OFFLINE_KEYS != 0 {
            let offset = ident_len + r.position();
            let (t, pubkey, consumed) = read_offline_block(
                |msg, sig| identity.verify(msg, sig),
                buf,
                offset,
                identity.sig_len(),
            )?;
            r.take(consumed)?;
            transient = Some((t, pubkey));
        }
        let is_public = flags & LEASESET2_FLAG_UNPUBLISHED == 0
            || flags & LEASESET2_FLAG_PUBLISHED_ENCRYPTED != 0;

        let mut enc_keys = Vec::new();
        let mut leases = Vec::new();
        match store_type {
            STORE_TYPE_STANDARD_LEASESET2 => {
                let props_len = r.u16()? as usize;
                r.take(props_len)?;
                let num_keys = r.u8()? as usize;
                for _ in 0..num_keys {
                    let key_type = r.u16()?;
                    let key_len = r.u16()? as usize;
                    enc_keys.push((key_type, r.take(key_len)?.to_vec()));
                }
                let num_leases = r.u8()? as usize;
                if num_leases > MAX_NUM_LEASES {
                    return Err(DataError::Malformed("lease count"));
                }
                for _ in 0..num_leases {
                    let gateway = IdentHash::from_slice(r.take(32)?)
                        .map_err(|_| DataError::Malformed("lease gateway"))?;
                    let tunnel_id = r.u32()?;
                    let end_date = r.u32()? as u64 * 1000;
                    leases.push(Lease {
                        gateway,
                        tunnel_id,
                        end_date,
                    });
                }
            }
            STORE_TYPE_META_LEASESET2 => {
                let props_len = r.u16()? as usize;
                r.take(props_len)?;
                let num_entries = r.u8()? as usize;
                r.take(num_entries * 40)?; // hash(32) flags(3) cost(1) expires(4)
                let num_revocations = r.u8()? as usize;
                r.take(num_revocations * 32)?;
            }
            other => {
                let _ = other;
                return Err(DataError::Malformed("store type"));
            }
        }

        let signed_len = ident_len + r.position();
        let (sig_len, sig_check): (usize, Box<dyn Fn(&[u8], &[u8]) -> Result<(), DataError>>) =
            match &transient {
                Some((t, pubkey)) => {
                    let verifier = veil_crypto::sig::Verifier::new(*t, pubkey)?;
                    (
                        t.sig_len(),
                        Box::new(move |msg, sig| {
                            verifier.verify(msg, sig).map_err(|_| DataError::BadSignature)
                        }),
                    )
                }
                None => {
                    let ident = identity.clone();
                    (
                        identity.sig_len(),
                        Box::new(move |msg, sig| ident.verify(msg, sig)),
                    )
                }
            };
        let sig = r.take(sig_len)?;
        let mut signed = Vec::with_capacity(1 + signed_len);
        signed.push(store_type);
        signed.extend_from_slice(&buf[..signed_len]);
        sig_check(&signed, sig)?;

        sort_leases(&mut leases);
        Ok(Self {
            store_type,
            identity,
            published,
            expiration: (published as u64 + expires_delta as u64) * 1000,
            leases,
            enc_keys,
            is_public,
            buffer: buf[..ident_len + r.position()].to_vec(),
        })
    }

    pub fn store_type(&self) -> u8 {
        self.store_type
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn hash(&self) -> IdentHash {
        self.identity.hash()
    }

    pub fn published(&self) -> u32 {
        self.published
    }

    /// Milliseconds since epoch.
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn enc_keys(&self) -> &[(u16, Vec<u8>)] {
        &self.enc_keys
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Preferred encryption key, falling back to the first one published.
    pub fn encryption_key(&self, preferred: u16) -> Option<&(u16, Vec<u8>)> {
        self.enc_keys
            .iter()
            .find(|(t, _)| *t == preferred)
            .or_else(|| self.enc_keys.first())
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration <= now_ms
    }

    pub fn has_non_expired_lease(&self, now_ms: u64) -> bool {
        self.leases.iter().any(|l| l.end_date > now_ms)
    }

    pub fn non_expired_leases(&self, now_ms: u64) -> Vec<&Lease> {
        self.leases.iter().filter(|l| l.end_date > now_ms).collect()
    }

    /// LeaseSet updates are monotonic by `(published, expiration)`.
    pub fn is_newer_than(&self, other: &LeaseSet) -> bool {
        (self.published, self.expiration) > (other.published, other.expiration)
    }

    #[cfg(any(test, feature = "testutil"))]
    pub fn for_tests(identity: Identity, leases: Vec<Lease>, published: u32, expiration: u64) -> Self {
        Self {
            store_type: STORE_TYPE_STANDARD_LEASESET2,
            identity,
            published,
            expiration,
            leases,
            enc_keys: Vec::new(),
            is_public: true,
            buffer: Vec::new(),
        }
    }
}

/// Build and sign a standard LeaseSet2 for a local destination.
pub fn build_standard_ls2(
    keys: &PrivateKeys,
    enc_keys: &[(u16, Vec<u8>)],
    leases: &[Lease],
    published: u32,
    expires_delta: u16,
    publish: bool,
) -> Result<Vec<u8>, DataError> {
    debug_assert!(leases.len() <= MAX_NUM_LEASES);
    let mut body = Vec::with_capacity(512);
    body.extend_from_slice(keys.identity().as_bytes());
    body.extend_from_slice(&published.to_be_bytes());
    body.extend_from_slice(&expires_delta.to_be_bytes());

    let mut flags = 0u16;
    if keys.offline_signature().is_some() {
        flags |= LEASESET2_FLAG_OFFLINE_KEYS;
    }
    if !publish {
        flags |= LEASESET2_FLAG_UNPUBLISHED;
    }
    body.extend_from_slice(&flags.to_be_bytes());
    if let Some(offline) = keys.offline_signature() {
        write_offline_block(&mut body, offline);
    }

    body.extend_from_slice(&0u16.to_be_bytes()); // no properties
    body.push(enc_keys.len() as u8);
    for (key_type, key) in enc_keys {
        body.extend_from_slice(&key_type.to_be_bytes());
        body.extend_from_slice(&(key.len() as u16).to_be_bytes());
        body.extend_from_slice(key);
    }
    body.push(leases.len() as u8);
    for lease in leases {
        body.extend_from_slice(lease.gateway.as_bytes());
        body.extend_from_slice(&lease.tunnel_id.to_be_bytes());
        body.extend_from_slice(&((lease.end_date / 1000) as u32).to_be_bytes());
    }

    let mut signed = Vec::with_capacity(1 + body.len());
    signed.push(STORE_TYPE_STANDARD_LEASESET2);
    signed.extend_from_slice(&body);
    let sig = keys.sign(&signed)?;
    body.extend_from_slice(&sig);
    Ok(body)
}

pub(crate) fn write_offline_block(out: &mut Vec<u8>, offline: &OfflineSignature) {
    out.extend_from_slice(&offline.expires.to_be_bytes());
    out.extend_from_slice(&offline.transient_sig_type.code().to_be_bytes());
    out.extend_from_slice(&offline.transient_pubkey);
    out.extend_from_slice(&offline.signature);
}

/// Build and sign a type-1 LeaseSet.
pub fn build_standard_ls1(
    keys: &PrivateKeys,
    enc_key: &[u8; 256],
    leases: &[Lease],
) -> Result<Vec<u8>, DataError> {
    debug_assert!(!leases.is_empty() && leases.len() <= MAX_NUM_LEASES);
    let mut body = Vec::with_capacity(512);
    body.extend_from_slice(keys.identity().as_bytes());
    body.extend_from_slice(enc_key);
    body.extend_from_slice(&[0u8; 128]);
    body.push(leases.len() as u8);
    for lease in leases {
        body.extend_from_slice(lease.gateway.as_bytes());
        body.extend_from_slice(&lease.tunnel_id.to_be_bytes());
        body.extend_from_slice(&lease.end_date.to_be_bytes());
    }
    let sig = keys.sign(&body)?;
    body.extend_from_slice(&sig);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    use veil_core::time;

    fn sample_leases(now_ms: u64) -> Vec<Lease> {
        vec![
            Lease {
                gateway: IdentHash::new([1u8; 32]),
                tunnel_id: 101,
                end_date: now_ms + 540_000,
            },
            Lease {
                gateway: IdentHash::new([2u8; 32]),
                tunnel_id: 102,
                end_date: now_ms + 600_000,
            },
        ]
    }

    #[test]
    fn test_ls1_roundtrip() {
        let keys = PrivateKeys::generate().unwrap();
        let now = time::millis_since_epoch();
        let buf = build_standard_ls1(&keys, &[3u8; 256], &sample_leases(now)).unwrap();
        let ls = LeaseSet::from_buffer_v1(&buf).unwrap();
        assert_eq!(ls.hash(), keys.identity().hash());
        assert_eq!(ls.leases().len(), 2);
        // sorted latest-first
        assert_eq!(ls.leases()[0].tunnel_id, 102);
        assert!(ls.has_non_expired_lease(now));
    }

    #[test]
    fn test_ls2_roundtrip() {
        let keys = PrivateKeys::generate().unwrap();
        let now = time::millis_since_epoch();
        let published = (now / 1000) as u32;
        let buf = build_standard_ls2(
            &keys,
            &[(4u16, vec![9u8; 32])],
            &sample_leases(now),
            published,
            600,
            true,
        )
        .unwrap();
        let ls = LeaseSet::from_buffer_v2(STORE_TYPE_STANDARD_LEASESET2, &buf).unwrap();
        assert_eq!(ls.published(), published);
        assert_eq!(ls.expiration(), (published as u64 + 600) * 1000);
        assert_eq!(ls.enc_keys().len(), 1);
        assert_eq!(ls.encryption_key(4).unwrap().1, vec![9u8; 32]);
        assert!(ls.is_public());
        assert!(!ls.is_expired(now));
    }

    #[test]
    fn test_ls2_signature_covers_store_type() {
        let keys = PrivateKeys::generate().unwrap();
        let now = time::millis_since_epoch();
        let buf = build_standard_ls2(
            &keys,
            &[(4u16, vec![9u8; 32])],
            &sample_leases(now),
            (now / 1000) as u32,
            600,
            true,
        )
        .unwrap();
        // parsing under the wrong store type must fail signature check
        assert!(LeaseSet::from_buffer_v2(STORE_TYPE_META_LEASESET2, &buf).is_err());
    }

    #[test]
    fn test_ls2_tampered_lease_rejected() {
        let keys = PrivateKeys::generate().unwrap();
        let now = time::millis_since_epoch();
        let mut buf = build_standard_ls2(
            &keys,
            &[(4u16, vec![9u8; 32])],
            &sample_leases(now),
            (now / 1000) as u32,
            600,
            true,
        )
        .unwrap();
        let n = buf.len();
        buf[n - 70] ^= 1;
        assert!(LeaseSet::from_buffer_v2(STORE_TYPE_STANDARD_LEASESET2, &buf).is_err());
    }

    #[test]
    fn test_ls2_offline_signed() {
        let keys = PrivateKeys::generate().unwrap();
        let offline = keys
            .create_offline(
                (time::seconds_since_epoch() + 3600) as u32,
                SigType::Ed25519,
            )
            .unwrap();
        let now = time::millis_since_epoch();
        let buf = build_standard_ls2(
            &offline,
            &[(4u16, vec![9u8; 32])],
            &sample_leases(now),
            (now / 1000) as u32,
            600,
            true,
        )
        .unwrap();
        let ls = LeaseSet::from_buffer_v2(STORE_TYPE_STANDARD_LEASESET2, &buf).unwrap();
        assert_eq!(ls.hash(), keys.identity().hash());
    }

    #[test]
    fn test_monotonic_ordering() {
        let keys = PrivateKeys::generate().unwrap();
        let now = time::millis_since_epoch();
        let make = |published: u32| {
            let buf = build_standard_ls2(
                &keys,
                &[(4u16, vec![9u8; 32])],
                &sample_leases(now),
                published,
                600,
                true,
            )
            .unwrap();
            LeaseSet::from_buffer_v2(STORE_TYPE_STANDARD_LEASESET2, &buf).unwrap()
        };
        let older = make(1000);
        let newer = make(2000);
        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
    }

    #[test]
    fn test_unpublished_flag() {
        let keys = PrivateKeys::generate().unwrap();
        let now = time::millis_since_epoch();
        let buf = build_standard_ls2(
            &keys,
            &[(4u16, vec![9u8; 32])],
            &sample_leases(now),
            (now / 1000) as u32,
            600,
            false,
        )
        .unwrap();
        let ls = LeaseSet::from_buffer_v2(STORE_TYPE_STANDARD_LEASESET2, &buf).unwrap();
        assert!(!ls.is_public());
    }
}
