//! Error types for the Tor protocol engine
//!
//! This module provides the error taxonomy used across the crate:
//! - Typed variants for each failure mode (network, protocol, crypto,
//!   circuit, stream, directory, configuration)
//! - Error classification (fatal vs retryable)
//! - Reason-code constructors for DESTROY and RELAY_END cells

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Reasons an exit relay can end a stream (RELAY_END payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndReason {
    Misc = 1,
    ResolveFailed = 2,
    ConnectRefused = 3,
    ExitPolicy = 4,
    Destroy = 5,
    Done = 6,
    Timeout = 7,
    NoRoute = 8,
    Hibernating = 9,
    Internal = 10,
    ResourceLimit = 11,
    ConnReset = 12,
    TorProtocol = 13,
    NotDirectory = 14,
}

impl EndReason {
    /// Parse a RELAY_END reason byte. Unknown values map to `Misc`.
    pub fn from_u8(reason: u8) -> Self {
        match reason {
            2 => EndReason::ResolveFailed,
            3 => EndReason::ConnectRefused,
            4 => EndReason::ExitPolicy,
            5 => EndReason::Destroy,
            6 => EndReason::Done,
            7 => EndReason::Timeout,
            8 => EndReason::NoRoute,
            9 => EndReason::Hibernating,
            10 => EndReason::Internal,
            11 => EndReason::ResourceLimit,
            12 => EndReason::ConnReset,
            13 => EndReason::TorProtocol,
            14 => EndReason::NotDirectory,
            _ => EndReason::Misc,
        }
    }

    /// Symbolic name as used in the protocol documents.
    pub fn name(&self) -> &'static str {
        match self {
            EndReason::Misc => "MISC",
            EndReason::ResolveFailed => "RESOLVEFAILED",
            EndReason::ConnectRefused => "CONNECTREFUSED",
            EndReason::ExitPolicy => "EXITPOLICY",
            EndReason::Destroy => "DESTROY",
            EndReason::Done => "DONE",
            EndReason::Timeout => "TIMEOUT",
            EndReason::NoRoute => "NOROUTE",
            EndReason::Hibernating => "HIBERNATING",
            EndReason::Internal => "INTERNAL",
            EndReason::ResourceLimit => "RESOURCELIMIT",
            EndReason::ConnReset => "CONNRESET",
            EndReason::TorProtocol => "TORPROTOCOL",
            EndReason::NotDirectory => "NOTDIRECTORY",
        }
    }
}

/// Main error type for the protocol engine
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Network =====
    #[error("Connection timed out: {0}")]
    ConnectTimeout(String),

    #[error("Link dropped: {0}")]
    LinkDropped(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailure(String),

    // ===== Protocol =====
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Relay cell not recognised by any hop")]
    UnrecognisedCell,

    #[error("Relay cell digest mismatch")]
    BadDigest,

    #[error("Replay detected: {0}")]
    ReplayDetected(String),

    #[error("Unknown cell command: {0}")]
    UnknownCommand(u8),

    #[error("Bad cell length: {0}")]
    BadLength(usize),

    #[error("Short read while decoding cell")]
    ShortRead,

    #[error("Invalid cell payload: {0}")]
    InvalidPayload(String),

    #[error("Flow-control window exhausted: {0}")]
    WindowExhausted(String),

    // ===== Crypto =====
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Certificate chain invalid: {0}")]
    CertChainInvalid(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    // ===== Circuit =====
    #[error("Circuit build failed: {0}")]
    BuildFailed(String),

    #[error("Circuit extension timed out at hop {0}")]
    HopExtendTimeout(usize),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: &'static str },

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    // ===== Stream =====
    #[error("Stream ended by relay: {}", .0.name())]
    StreamEnd(EndReason),

    #[error("Stream open timed out")]
    StreamOpenTimeout,

    // ===== Directory / hidden service =====
    #[error("Descriptor fetch failed: {0}")]
    DescriptorFetchFailed(String),

    #[error("Descriptor invalid: {0}")]
    DescriptorInvalid(String),

    #[error("No introduction point reachable")]
    NoIntroPointReachable,

    #[error("No rendezvous point reachable")]
    NoRendezvousReachable,

    #[error("Invalid onion address: {0}")]
    InvalidOnionAddress(String),

    // ===== Path selection =====
    #[error("Not enough suitable relays: {0}")]
    InsufficientRelays(String),

    #[error("No exit allows port {0}")]
    NoExitForPort(u16),

    #[error("All entry guards failed")]
    AllGuardsFailed,

    // ===== Configuration =====
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Storage =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Generic =====
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// Whether this error is fatal for the object it was raised on.
    ///
    /// Fatal errors are never retried at the same site: protocol and crypto
    /// violations poison the link or circuit they occurred on, and
    /// configuration errors require operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::ProtocolViolation(_)
                | TorError::UnrecognisedCell
                | TorError::BadDigest
                | TorError::ReplayDetected(_)
                | TorError::UnknownCommand(_)
                | TorError::BadLength(_)
                | TorError::WindowExhausted(_)
                | TorError::HandshakeRejected(_)
                | TorError::SignatureInvalid(_)
                | TorError::CertChainInvalid(_)
                | TorError::InvalidConfig(_)
        )
    }

    /// Whether the caller may retry the operation along a different path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectTimeout(_)
                | TorError::LinkDropped(_)
                | TorError::BuildFailed(_)
                | TorError::HopExtendTimeout(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::CircuitClosed(_)
                | TorError::StreamOpenTimeout
                | TorError::DescriptorFetchFailed(_)
                | TorError::NoIntroPointReachable
                | TorError::NoRendezvousReachable
                | TorError::Timeout(_)
        ) || matches!(
            self,
            TorError::StreamEnd(
                EndReason::Misc
                    | EndReason::Timeout
                    | EndReason::NoRoute
                    | EndReason::Hibernating
                    | EndReason::ResourceLimit
                    | EndReason::ConnReset
            )
        )
    }

    /// Create a CircuitDestroyed error carrying the DESTROY reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        };

        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }
}
