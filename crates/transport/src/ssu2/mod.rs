//! SSU2: the UDP transport.
//!
//! Noise XK session setup, per-packet ChaCha20-Poly1305 with masked
//! headers, 64-bit connection ids, token-based anti-spoofing, a cumulative
//! ack scheme with ranges, relay introduction and peer testing.

pub mod ack;
pub mod block;
pub mod packet;
pub mod peer_test;
pub mod relay;
pub mod server;
pub mod session;

pub const SSU2_CONNECT_TIMEOUT: u64 = 5; // seconds
pub const SSU2_TERMINATION_TIMEOUT: u64 = 165; // seconds
pub const SSU2_CLOCK_SKEW: i64 = 60; // seconds
pub const SSU2_CLOCK_THRESHOLD: i64 = 15; // seconds; above this we adjust
pub const SSU2_TOKEN_EXPIRATION_TIMEOUT: u64 = 9; // seconds, Retry tokens
pub const SSU2_NEXT_TOKEN_EXPIRATION_TIMEOUT: u64 = 52 * 60; // seconds
pub const SSU2_TOKEN_EXPIRATION_THRESHOLD: u64 = 2; // seconds
pub const SSU2_RELAY_NONCE_EXPIRATION_TIMEOUT: u64 = 10; // seconds
pub const SSU2_PEER_TEST_EXPIRATION_TIMEOUT: u64 = 60; // seconds
pub const SSU2_MAX_PACKET_SIZE: usize = 1500;
pub const SSU2_MIN_PACKET_SIZE: usize = 1280;
pub const SSU2_HANDSHAKE_RESEND_INTERVAL: u64 = 1000; // milliseconds
pub const SSU2_MAX_NUM_RESENDS: u32 = 5;
pub const SSU2_INCOMPLETE_MESSAGES_CLEANUP_TIMEOUT: u64 = 30; // seconds
pub const SSU2_MAX_NUM_RECEIVED_I2NP_MSGIDS: usize = 5000;
pub const SSU2_RECEIVED_I2NP_MSGIDS_CLEANUP_TIMEOUT: u64 = 10; // seconds
pub const SSU2_MIN_WINDOW_SIZE: usize = 16; // packets
pub const SSU2_MAX_WINDOW_SIZE: usize = 256; // packets
pub const SSU2_MIN_RTO: u64 = 100; // milliseconds
pub const SSU2_INITIAL_RTO: u64 = 540; // milliseconds
pub const SSU2_MAX_RTO: u64 = 2500; // milliseconds
pub const SSU2_RTT_EWMA_ALPHA: f64 = 0.125;
pub const SSU2_KAPPA: f64 = 1.8;
pub const SSU2_MAX_NUM_ACNT: u32 = 255;
pub const SSU2_MAX_NUM_ACK_PACKETS: u32 = 511;
pub const SSU2_MAX_NUM_ACK_RANGES: usize = 32;
pub const SSU2_MAX_NUM_FRAGMENTS: u8 = 64;

pub const SSU2_FLAG_IMMEDIATE_ACK_REQUESTED: u8 = 0x01;

pub const IPV4_OVERHEAD: usize = 20 + 8; // IP + UDP headers
pub const IPV6_OVERHEAD: usize = 40 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    SessionRequest = 0,
    SessionCreated = 1,
    SessionConfirmed = 2,
    Data = 6,
    PeerTest = 7,
    Retry = 9,
    TokenRequest = 10,
    HolePunch = 11,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::SessionRequest,
            1 => Self::SessionCreated,
            2 => Self::SessionConfirmed,
            6 => Self::Data,
            7 => Self::PeerTest,
            9 => Self::Retry,
            10 => Self::TokenRequest,
            11 => Self::HolePunch,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    TokenRequestSent,
    TokenReceived,
    TokenRequestReceived,
    SessionRequestSent,
    SessionRequestReceived,
    SessionCreatedSent,
    SessionCreatedReceived,
    SessionConfirmedSent,
    SessionConfirmedReceived,
    Established,
    Closing,
    ClosingConfirmed,
    Terminated,
    Failed,
    Introduced,
    PeerTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminationReason {
    NormalClose = 0,
    TerminationReceived = 1,
    IdleTimeout = 2,
    RouterShutdown = 3,
    DataPhaseAeadFailure = 4,
    IncompatibleOptions = 5,
    IncompatibleSignatureType = 6,
    ClockSkew = 7,
    PaddingViolation = 8,
    AeadFramingError = 9,
    PayloadFormatError = 10,
    SessionRequestError = 11,
    SessionCreatedError = 12,
    SessionConfirmedError = 13,
    Timeout = 14,
    RouterInfoSignatureVerificationFail = 15,
    InvalidS = 16,
    Banned = 17,
    BadToken = 18,
    ConnectionLimits = 19,
    IncompatibleVersion = 20,
    WrongNetId = 21,
    ReplacedByNewSession = 22,
}

impl TerminationReason {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::TerminationReceived,
            2 => Self::IdleTimeout,
            3 => Self::RouterShutdown,
            4 => Self::DataPhaseAeadFailure,
            5 => Self::IncompatibleOptions,
            6 => Self::IncompatibleSignatureType,
            7 => Self::ClockSkew,
            8 => Self::PaddingViolation,
            9 => Self::AeadFramingError,
            10 => Self::PayloadFormatError,
            11 => Self::SessionRequestError,
            12 => Self::SessionCreatedError,
            13 => Self::SessionConfirmedError,
            14 => Self::Timeout,
            15 => Self::RouterInfoSignatureVerificationFail,
            16 => Self::InvalidS,
            17 => Self::Banned,
            18 => Self::BadToken,
            19 => Self::ConnectionLimits,
            20 => Self::IncompatibleVersion,
            21 => Self::WrongNetId,
            22 => Self::ReplacedByNewSession,
            _ => Self::NormalClose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayResponseCode {
    Accept = 0,
    BobRelayTagNotFound = 5,
    CharlieUnsupportedAddress = 65,
    CharlieSignatureFailure = 67,
    CharlieAliceIsUnknown = 70,
}

impl RelayResponseCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Accept,
            5 => Self::BobRelayTagNotFound,
            65 => Self::CharlieUnsupportedAddress,
            67 => Self::CharlieSignatureFailure,
            _ => Self::CharlieAliceIsUnknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerTestCode {
    Accept = 0,
    BobReasonUnspecified = 1,
    BobNoCharlieAvailable = 2,
    BobLimitExceeded = 3,
    BobSignatureFailure = 4,
    CharlieReasonUnspecified = 64,
    CharlieUnsupportedAddress = 65,
    CharlieLimitExceeded = 66,
    CharlieSignatureFailure = 67,
    CharlieAliceIsAlreadyConnected = 68,
    CharlieAliceIsBanned = 69,
    CharlieAliceIsUnknown = 70,
    Unspecified = 128,
}

impl PeerTestCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Accept,
            1 => Self::BobReasonUnspecified,
            2 => Self::BobNoCharlieAvailable,
            3 => Self::BobLimitExceeded,
            4 => Self::BobSignatureFailure,
            64 => Self::CharlieReasonUnspecified,
            65 => Self::CharlieUnsupportedAddress,
            66 => Self::CharlieLimitExceeded,
            67 => Self::CharlieSignatureFailure,
            68 => Self::CharlieAliceIsAlreadyConnected,
            69 => Self::CharlieAliceIsBanned,
            70 => Self::CharlieAliceIsUnknown,
            _ => Self::Unspecified,
        }
    }
}
