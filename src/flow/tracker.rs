//! Flow records and the connection-tracking table
//!
//! The tracker is a single coarse mutex over a fingerprint → flow map.
//! That is deliberate: lookups are rare relative to per-packet work, and
//! one lock keeps the create/destroy lifecycle trivially atomic: at most
//! one live record per fingerprint, and a destroyed record is removed
//! under the same lock that marked it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::flow::ingress::UdpGateway;
use crate::flow::{worker, FlowShutdown};
use crate::packet::envelope::Envelope;
use crate::packet::ipv4::Ipv4Header;
use crate::packet::udp::UdpHeader;

/// One live UDP flow.
///
/// Addresses are copied out of the packet that created the flow, never
/// aliased. The record is shared between the tracker, the ingress path,
/// and the flow's worker task.
#[derive(Debug)]
pub struct Flow {
    fingerprint: String,
    local_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
    local_port: u16,
    remote_port: u16,
    from_tun: mpsc::Sender<Envelope>,
    shutdown: FlowShutdown,
    reader_quit: CancellationToken,
    destroyed: AtomicBool,
}

impl Flow {
    fn new(
        fingerprint: String,
        ip: &Ipv4Header,
        udp: &UdpHeader,
        from_tun: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            fingerprint,
            local_ip: ip.src,
            remote_ip: ip.dst,
            local_port: udp.src_port,
            remote_port: udp.dst_port,
            from_tun,
            shutdown: FlowShutdown::new(),
            reader_quit: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    /// The flow fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// TUN-side (application) address.
    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Remote peer address.
    pub fn remote_ip(&self) -> Ipv4Addr {
        self.remote_ip
    }

    /// TUN-side (application) port.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote peer port.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// The flow's termination signal.
    pub fn shutdown(&self) -> &FlowShutdown {
        &self.shutdown
    }

    pub(crate) fn reader_quit(&self) -> &CancellationToken {
        &self.reader_quit
    }

    /// Whether this record has been destroyed and must not be reused.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    /// Hand an inbound TUN packet to the flow's worker.
    ///
    /// If the flow's termination signal has already fired, the envelope is
    /// dropped (releasing its buffer) instead of enqueued. Otherwise this
    /// waits for queue space, so TUN-arrival order is preserved.
    pub async fn submit(&self, packet: Envelope) {
        if self.shutdown.is_signaled() {
            trace!(flow = %self.fingerprint, "flow terminating; dropping packet");
            drop(packet);
            return;
        }
        tokio::select! {
            _ = self.shutdown.signaled() => {
                trace!(flow = %self.fingerprint, "flow terminating; dropping packet");
                drop(packet);
            }
            permit = self.from_tun.reserve() => match permit {
                Ok(permit) => permit.send(packet),
                Err(_) => drop(packet),
            },
        }
    }
}

/// Tracker lifecycle counters.
#[derive(Debug, Default)]
pub struct TrackerStats {
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl TrackerStats {
    /// Flows created.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Flows destroyed.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Get a snapshot of the counters.
    pub fn snapshot(&self) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            created: self.created(),
            destroyed: self.destroyed(),
        }
    }
}

/// Snapshot of tracker counters for serialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackerStatsSnapshot {
    /// Flows created.
    pub created: u64,
    /// Flows destroyed.
    pub destroyed: u64,
}

/// The connection-tracking table: fingerprint → live flow.
#[derive(Debug, Default)]
pub struct FlowTracker {
    flows: Mutex<HashMap<String, Arc<Flow>>>,
    stats: TrackerStats,
}

impl FlowTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the flow for `fingerprint`, creating it (and spawning its
    /// worker) if there is none, or if the tracked record is destroyed.
    pub fn get_or_create(
        &self,
        gateway: &Arc<UdpGateway>,
        fingerprint: &str,
        ip: &Ipv4Header,
        udp: &UdpHeader,
    ) -> Arc<Flow> {
        let mut flows = self.flows.lock();

        if let Some(existing) = flows.get(fingerprint) {
            if !existing.is_destroyed() {
                return Arc::clone(existing);
            }
            flows.remove(fingerprint);
        }

        let (tx, rx) = mpsc::channel(gateway.config().inbound_queue_depth);
        let flow = Arc::new(Flow::new(fingerprint.to_string(), ip, udp, tx));
        flows.insert(fingerprint.to_string(), Arc::clone(&flow));
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        trace!(flow = %fingerprint, "flow created");

        tokio::spawn(worker::run(Arc::clone(gateway), Arc::clone(&flow), rx));
        flow
    }

    /// Destroy `flow`'s tracker entry.
    ///
    /// Safe to call when the entry is already gone, and it never removes a
    /// newer flow that reused the fingerprint, only the exact record it
    /// was handed.
    pub fn clear(&self, flow: &Arc<Flow>) {
        let mut flows = self.flows.lock();
        flow.mark_destroyed();
        if let Some(current) = flows.get(flow.fingerprint()) {
            if Arc::ptr_eq(current, flow) {
                flows.remove(flow.fingerprint());
                self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Signal peer-quit on every tracked flow and drain the table.
    ///
    /// The tracker owns the cleanup here, so workers woken by this signal
    /// must not (and do not) clear their entries themselves.
    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<Flow>> = {
            let mut flows = self.flows.lock();
            flows.drain().map(|(_, flow)| flow).collect()
        };
        for flow in drained {
            flow.mark_destroyed();
            self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
            flow.shutdown().signal(super::FlowEnd::PeerQuit);
        }
    }

    /// Number of tracked (live) flows.
    pub fn live_count(&self) -> usize {
        self.flows.lock().len()
    }

    /// Get the tracked flow for `fingerprint`, if any.
    pub fn get(&self, fingerprint: &str) -> Option<Arc<Flow>> {
        self.flows.lock().get(fingerprint).cloned()
    }

    /// Tracker lifecycle counters.
    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }
}
