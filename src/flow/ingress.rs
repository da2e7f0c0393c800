//! UDP ingress: the per-datagram entry point
//!
//! [`UdpGateway`] owns everything the UDP path shares (configuration,
//! the buffer pool, the response synthesizer, the DNS answer cache, the
//! flow tracker, and the TUN write channel) and exposes
//! [`UdpGateway::handle_udp`], called once per inbound UDP datagram read
//! from the TUN device.
//!
//! # Dispatch
//!
//! 1. DNS destination with a cached answer: serialize the answer (already
//!    rewritten to the querier's transaction id), synthesize the response
//!    datagram(s), and enqueue them on the TUN channel from a background
//!    task. No flow is created.
//! 2. Non-DNS destination: dropped. Only DNS rides the UDP relay path;
//!    everything else is discarded at ingress.
//! 3. Otherwise: deep-copy the packet into an envelope, look up or create
//!    the flow, and submit the envelope to its worker. If the flow's
//!    termination signal has fired, the envelope is dropped instead and
//!    its buffer released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::dns::DnsAnswerCache;
use crate::flow::{fingerprint, FlowTracker};
use crate::io::PacketBufferPool;
use crate::packet::envelope::Envelope;
use crate::packet::ipv4::Ipv4Header;
use crate::packet::synth::ResponseSynthesizer;
use crate::packet::udp::UdpHeader;
use crate::tun::TunBatch;

/// Shared state of the UDP forwarding path.
#[derive(Debug)]
pub struct UdpGateway {
    config: GatewayConfig,
    pool: Arc<PacketBufferPool>,
    synthesizer: ResponseSynthesizer,
    dns_cache: Option<Arc<DnsAnswerCache>>,
    tracker: FlowTracker,
    tun_tx: mpsc::Sender<TunBatch>,
    stopped: AtomicBool,
}

impl UdpGateway {
    /// Create a gateway writing response batches to `tun_tx`.
    ///
    /// The DNS cache is created unless disabled in `config`.
    pub fn new(config: GatewayConfig, tun_tx: mpsc::Sender<TunBatch>) -> Arc<Self> {
        let pool = Arc::new(PacketBufferPool::new(config.pool_capacity));
        let synthesizer = ResponseSynthesizer::new(Arc::clone(&pool), config.synthesized_ttl);
        let dns_cache = config
            .dns_cache_enabled
            .then(|| Arc::new(DnsAnswerCache::new()));

        Arc::new(Self {
            config,
            pool,
            synthesizer,
            dns_cache,
            tracker: FlowTracker::new(),
            tun_tx,
            stopped: AtomicBool::new(false),
        })
    }

    /// Handle one inbound UDP datagram from the TUN device.
    ///
    /// `raw` is the full IPv4 wire image; `ip` and `udp` are its parsed
    /// headers and `payload` the UDP payload within `raw`.
    pub async fn handle_udp(
        self: &Arc<Self>,
        raw: &[u8],
        ip: &Ipv4Header,
        udp: &UdpHeader,
        payload: &[u8],
    ) {
        let mut done = false;

        if udp.dst_port == self.config.dns_port {
            if let Some(cache) = &self.dns_cache {
                if let Some(answer) = cache.query(payload) {
                    if let Ok(data) = answer.to_vec() {
                        debug!(src = %ip.src, sport = udp.src_port, "udp: dns cache hit");
                        match self.synthesizer.response(
                            ip.src,
                            ip.dst,
                            udp.src_port,
                            udp.dst_port,
                            &data,
                        ) {
                            Ok((primary, fragments)) => {
                                let mut batch = Vec::with_capacity(1 + fragments.len());
                                batch.push(primary);
                                batch.extend(fragments);
                                let tun_tx = self.tun_tx.clone();
                                tokio::spawn(async move {
                                    let _ = tun_tx.send(batch).await;
                                });
                                done = true;
                            }
                            Err(err) => {
                                warn!(%err, "failed to synthesize cached dns response");
                            }
                        }
                    }
                }
            }
        } else {
            // Only DNS is forwarded over the UDP relay path; all other
            // UDP is dropped at ingress.
            done = true;
        }
        if done {
            return;
        }

        let id = fingerprint(ip, udp);
        let packet = match Envelope::from_wire(&self.pool, raw) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%err, "dropping unparseable udp packet");
                return;
            }
        };
        let flow = self.tracker.get_or_create(self, &id, ip, udp);
        flow.submit(packet).await;
    }

    /// Stop the gateway: set the global stop flag (workers exit at the
    /// top of their loop) and signal peer-quit on every tracked flow.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.tracker.shutdown_all();
    }

    /// Whether [`UdpGateway::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The packet buffer pool.
    pub fn pool(&self) -> &Arc<PacketBufferPool> {
        &self.pool
    }

    /// The response synthesizer.
    pub fn synthesizer(&self) -> &ResponseSynthesizer {
        &self.synthesizer
    }

    /// The DNS answer cache, unless disabled.
    pub fn dns_cache(&self) -> Option<&Arc<DnsAnswerCache>> {
        self.dns_cache.as_ref()
    }

    /// The flow tracker.
    pub fn tracker(&self) -> &FlowTracker {
        &self.tracker
    }

    /// The TUN write channel.
    pub fn tun_tx(&self) -> &mpsc::Sender<TunBatch> {
        &self.tun_tx
    }
}
