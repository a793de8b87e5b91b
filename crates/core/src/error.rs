//! Shared error kinds for the core crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Wrong length: expected {expected}, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("Invalid base32/base64 encoding")]
    BadEncoding,
    #[error("NTP query failed: {0}")]
    Ntp(String),
    #[error("Invalid option value for {key}: {value}")]
    BadOption { key: String, value: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
