//! Data-model layer: identities, key bundles, router descriptors, lease
//! sets, and the I2NP message envelope. Everything here is a byte-exact
//! codec over the I2P wire formats plus the local builders that produce
//! signed descriptors.

pub mod blinding;
pub mod encrypted_ls2;
pub mod garlic;
pub mod i2np;
pub mod identity;
pub mod keys;
pub mod lease_set;
pub mod local_router;
pub mod router_info;

pub use identity::Identity;
pub use keys::PrivateKeys;
pub use lease_set::{Lease, LeaseSet};
pub use router_info::RouterInfo;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Buffer too short: need {need} more bytes")]
    Truncated { need: usize },
    #[error("Malformed {0}")]
    Malformed(&'static str),
    #[error("Descriptor too large: {0} bytes")]
    Oversized(usize),
    #[error("Signature verification failed")]
    BadSignature,
    #[error("Expired at {0}")]
    Expired(u64),
    #[error(transparent)]
    Crypto(#[from] veil_crypto::CryptoError),
}

/// Cursor over a parse buffer. Every read checks remaining length so a
/// malformed descriptor can never index out of bounds.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DataError> {
        if self.remaining() < n {
            return Err(DataError::Truncated {
                need: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DataError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DataError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, DataError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, DataError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().expect("8 bytes")))
    }

    /// I2P length-prefixed string.
    pub fn string(&mut self) -> Result<String, DataError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DataError::Malformed("string"))
    }
}

/// Append an I2P length-prefixed string.
pub(crate) fn put_string(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= 255);
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_bounds() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 0x0203);
        assert!(matches!(r.u8(), Err(DataError::Truncated { need: 1 })));
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = Vec::new();
        put_string(&mut buf, "caps");
        let mut r = Reader::new(&buf);
        assert_eq!(r.string().unwrap(), "caps");
    }
}
