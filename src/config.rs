//! Gateway configuration and wire-format constants
//!
//! The wire-format numbers are fixed by the protocols themselves and live
//! here as documented constants. Everything operational (timeouts, queue
//! depths, the DNS port) is carried by [`GatewayConfig`] so deployments
//! (and tests, which cannot bind privileged ports) can tune them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// =============================================================================
// Wire-format constants
// =============================================================================

/// Maximum transmission unit of the TUN interface.
///
/// Synthesized response datagrams never exceed this size; payloads that
/// would are split into IPv4 fragments. Packet buffers in the pool are
/// exactly this large.
pub const MTU: usize = 1500;

/// IPv4 header length in bytes (no options on synthesized packets).
pub const IPV4_HEADER_LEN: usize = 20;

/// UDP header length in bytes.
pub const UDP_HEADER_LEN: usize = 8;

/// UDP pseudo-header length in bytes (src, dst, zero, protocol, length).
pub const PSEUDO_HEADER_LEN: usize = 12;

/// Combined IPv4 + UDP header overhead.
///
/// A UDP payload longer than `MTU - IP_UDP_OVERHEAD` does not fit a single
/// datagram and triggers fragmentation.
pub const IP_UDP_OVERHEAD: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Largest UDP datagram the relay reader accepts.
pub const MAX_DATAGRAM: usize = 65535;

// =============================================================================
// Defaults
// =============================================================================

/// Default destination port treated as DNS.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Default idle timeout: one second without traffic destroys a flow.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_000;

/// Default relay connect timeout.
pub const DEFAULT_RELAY_CONNECT_TIMEOUT_MS: u64 = 1_000;

/// Default deadline for post-connect relay setup (local bind + reader).
pub const DEFAULT_RELAY_SETUP_DEADLINE_MS: u64 = 10_000;

/// Default per-flow inbound queue depth (packets from TUN awaiting relay).
pub const DEFAULT_INBOUND_QUEUE_DEPTH: usize = 100;

/// Default IPv4 TTL stamped on synthesized response packets.
pub const DEFAULT_SYNTHESIZED_TTL: u8 = 64;

/// Default packet buffer pool capacity.
pub const DEFAULT_POOL_CAPACITY: usize = 512;

/// Default TUN write channel depth (batches, not packets).
pub const DEFAULT_TUN_CHANNEL_DEPTH: usize = 256;

/// Gateway tunables.
///
/// All fields have sensible defaults; a zero-value field that would stall
/// the data path is rejected by [`GatewayConfig::validate`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Destination port classified as DNS (cache lookup + one-shot flows).
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,

    /// Whether DNS answers are cached and served without a relay round-trip.
    #[serde(default = "default_true")]
    pub dns_cache_enabled: bool,

    /// Flow idle timeout in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Relay connect timeout in milliseconds.
    #[serde(default = "default_relay_connect_timeout_ms")]
    pub relay_connect_timeout_ms: u64,

    /// Deadline for relay setup after a successful connect, in milliseconds.
    #[serde(default = "default_relay_setup_deadline_ms")]
    pub relay_setup_deadline_ms: u64,

    /// Per-flow inbound queue depth.
    #[serde(default = "default_inbound_queue_depth")]
    pub inbound_queue_depth: usize,

    /// IPv4 TTL on synthesized packets.
    #[serde(default = "default_synthesized_ttl")]
    pub synthesized_ttl: u8,

    /// Packet buffer pool capacity (buffers, each [`MTU`] bytes).
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// TUN write channel depth.
    #[serde(default = "default_tun_channel_depth")]
    pub tun_channel_depth: usize,
}

fn default_dns_port() -> u16 {
    DEFAULT_DNS_PORT
}
fn default_true() -> bool {
    true
}
fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}
fn default_relay_connect_timeout_ms() -> u64 {
    DEFAULT_RELAY_CONNECT_TIMEOUT_MS
}
fn default_relay_setup_deadline_ms() -> u64 {
    DEFAULT_RELAY_SETUP_DEADLINE_MS
}
fn default_inbound_queue_depth() -> usize {
    DEFAULT_INBOUND_QUEUE_DEPTH
}
fn default_synthesized_ttl() -> u8 {
    DEFAULT_SYNTHESIZED_TTL
}
fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}
fn default_tun_channel_depth() -> usize {
    DEFAULT_TUN_CHANNEL_DEPTH
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dns_port: DEFAULT_DNS_PORT,
            dns_cache_enabled: true,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            relay_connect_timeout_ms: DEFAULT_RELAY_CONNECT_TIMEOUT_MS,
            relay_setup_deadline_ms: DEFAULT_RELAY_SETUP_DEADLINE_MS,
            inbound_queue_depth: DEFAULT_INBOUND_QUEUE_DEPTH,
            synthesized_ttl: DEFAULT_SYNTHESIZED_TTL,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            tun_channel_depth: DEFAULT_TUN_CHANNEL_DEPTH,
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` when a field would stall or break
    /// the data path (zero queue depth, zero timeouts, zero TTL).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inbound_queue_depth == 0 {
            return Err(ConfigError::validation("inbound_queue_depth must be > 0"));
        }
        if self.tun_channel_depth == 0 {
            return Err(ConfigError::validation("tun_channel_depth must be > 0"));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::validation("idle_timeout_ms must be > 0"));
        }
        if self.relay_connect_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "relay_connect_timeout_ms must be > 0",
            ));
        }
        if self.synthesized_ttl == 0 {
            return Err(ConfigError::validation("synthesized_ttl must be > 0"));
        }
        Ok(())
    }

    /// Flow idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Relay connect timeout as a [`Duration`].
    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_connect_timeout_ms)
    }

    /// Relay setup deadline as a [`Duration`].
    pub fn relay_setup_deadline(&self) -> Duration {
        Duration::from_millis(self.relay_setup_deadline_ms)
    }
}
