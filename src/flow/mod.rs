//! UDP flow tracking and forwarding
//!
//! A *flow* is one UDP conversation observed on the TUN side, identified
//! by its `src|sport|dst|dport` fingerprint. The [`tracker`] maps
//! fingerprints to live flow records, the [`worker`] owns the relay
//! socket pair for one flow, and [`ingress`] is the per-datagram entry
//! point that ties them to the DNS cache and the TUN write channel.
//!
//! # Termination
//!
//! A flow has several independent reasons to die: the relay side closed,
//! the idle timer fired, a peer asked it to quit, the whole gateway is
//! stopping. They all collapse into a single cancellation token carrying
//! a [`FlowEnd`] reason tag (first signal wins), plus a separate token
//! that stops the relay reader task. The reason matters in exactly one
//! place: a [`FlowEnd::PeerQuit`] teardown must not clear the tracker
//! entry, because the peer that signaled owns that cleanup.

pub mod ingress;
pub mod tracker;
pub(crate) mod worker;

use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;

use crate::packet::ipv4::Ipv4Header;
use crate::packet::udp::UdpHeader;

pub use ingress::UdpGateway;
pub use tracker::{Flow, FlowTracker, TrackerStats, TrackerStatsSnapshot};

/// Render the flow fingerprint for a TUN-observed packet.
pub fn fingerprint(ip: &Ipv4Header, udp: &UdpHeader) -> String {
    format!("{}|{}|{}|{}", ip.src, udp.src_port, ip.dst, udp.dst_port)
}

/// Why a flow terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEnd {
    /// The worker ended the flow itself (relay closed, idle, write error,
    /// DNS one-shot complete).
    SelfQuit = 0,
    /// Another component ended the flow and owns the tracker cleanup.
    PeerQuit = 1,
    /// The upstream relay connection is gone (dial or setup failure, or
    /// an external relay monitor).
    SocksClosed = 2,
}

impl FlowEnd {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::SelfQuit),
            1 => Some(Self::PeerQuit),
            2 => Some(Self::SocksClosed),
            _ => None,
        }
    }
}

const REASON_UNSET: u8 = u8::MAX;

/// A flow's termination signal: one cancellation source, tagged with the
/// first reason that fired.
#[derive(Debug)]
pub struct FlowShutdown {
    token: CancellationToken,
    reason: AtomicU8,
}

impl Default for FlowShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowShutdown {
    /// Create an unfired signal.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: AtomicU8::new(REASON_UNSET),
        }
    }

    /// Fire the signal. The first caller's reason sticks; later calls are
    /// no-ops apart from the (idempotent) cancellation.
    pub fn signal(&self, end: FlowEnd) {
        let _ = self.reason.compare_exchange(
            REASON_UNSET,
            end as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.token.cancel();
    }

    /// Whether the signal has fired.
    pub fn is_signaled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded reason, if the signal has fired.
    pub fn reason(&self) -> Option<FlowEnd> {
        FlowEnd::from_u8(self.reason.load(Ordering::Acquire))
    }

    /// Wait for the signal and return its reason.
    pub async fn signaled(&self) -> FlowEnd {
        self.token.cancelled().await;
        // signal() stores the reason before cancelling.
        self.reason().unwrap_or(FlowEnd::SelfQuit)
    }
}
