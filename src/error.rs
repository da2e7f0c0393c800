//! Error types
//!
//! Failures in this crate are deliberately local: nothing propagates past
//! the flow that hit it. A flow worker absorbs its own relay errors by
//! tearing the flow down, and the DNS cache treats unparseable messages as
//! misses. The types here cover the places where a caller still sees a
//! `Result`: packet codec operations, flow setup, and configuration
//! validation.

use thiserror::Error;

/// Packet codec errors (IPv4/UDP parse and serialize).
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input shorter than the structure it should contain.
    #[error("packet truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// IP version nibble was not 4.
    #[error("unsupported IP version: {0}")]
    BadVersion(u8),

    /// IPv4 header length field below the 20-byte minimum.
    #[error("IPv4 header length out of range: {0} bytes")]
    BadHeaderLength(usize),

    /// IPv4 total length inconsistent with the buffer.
    #[error("IPv4 total length {total} exceeds captured bytes {have}")]
    BadTotalLength { total: usize, have: usize },

    /// UDP length field inconsistent with the buffer.
    #[error("UDP length {length} exceeds captured bytes {have}")]
    BadUdpLength { length: usize, have: usize },

    /// Destination slice too small for the serialized structure.
    #[error("destination too small: need {needed} bytes, have {have}")]
    NoRoom { needed: usize, have: usize },
}

impl CodecError {
    /// Create a truncation error.
    pub fn truncated(needed: usize, have: usize) -> Self {
        Self::Truncated { needed, have }
    }

    /// Create a no-room error.
    pub fn no_room(needed: usize, have: usize) -> Self {
        Self::NoRoom { needed, have }
    }
}

/// Result alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Flow setup errors. These never leave the worker; they exist so the
/// setup path can report *which* step failed in its teardown log line.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Relay dial failed or timed out.
    #[error("relay unreachable: {0}")]
    Dial(#[source] std::io::Error),

    /// Local UDP bind failed.
    #[error("local bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// Relay setup did not finish within the deadline.
    #[error("relay setup deadline elapsed")]
    SetupDeadline,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
