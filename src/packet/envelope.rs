//! Packet envelopes
//!
//! An [`Envelope`] bundles parsed headers, the buffer that owns the packet
//! bytes, and the wire range within that buffer. Two construction modes:
//!
//! - *parsed from wire* ([`Envelope::from_wire`]): the raw bytes are
//!   deep-copied into a pool buffer (or a plain heap buffer when they
//!   exceed the MTU) and re-parsed from the copy;
//! - *synthesized* (by the response synthesizer): the buffer is laid out
//!   backwards so the wire image starts mid-buffer.
//!
//! The buffer variants stay distinguishable so that dropping an envelope
//! returns pool buffers to the pool and simply frees heap buffers. An
//! envelope is the sole owner of its buffer, which is what makes the
//! release-exactly-once invariant hold by construction.

use std::ops::Range;
use std::sync::Arc;

use crate::config::MTU;
use crate::error::CodecResult;
use crate::io::{PacketBufferPool, PooledBuf};
use crate::packet::ipv4::Ipv4Header;
use crate::packet::udp::UdpHeader;

/// Owned packet storage: recycled pool buffer or one-off heap buffer.
#[derive(Debug)]
pub enum EnvelopeBuf {
    /// MTU buffer from the pool, returned on drop.
    Pooled(PooledBuf),
    /// Heap buffer for packets larger than the MTU, freed on drop.
    Heap(Vec<u8>),
}

impl EnvelopeBuf {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Pooled(buf) => buf,
            Self::Heap(buf) => buf,
        }
    }
}

/// A packet in memory: headers, owning buffer, wire view.
#[derive(Debug)]
pub struct Envelope {
    ipv4: Ipv4Header,
    udp: Option<UdpHeader>,
    buf: EnvelopeBuf,
    wire: Range<usize>,
    udp_payload: Range<usize>,
}

impl Envelope {
    pub(crate) fn new(
        ipv4: Ipv4Header,
        udp: Option<UdpHeader>,
        buf: EnvelopeBuf,
        wire: Range<usize>,
        udp_payload: Range<usize>,
    ) -> Self {
        Self {
            ipv4,
            udp,
            buf,
            wire,
            udp_payload,
        }
    }

    /// Deep-copy a raw UDP-in-IPv4 packet into an owned envelope.
    ///
    /// Wire images that fit the MTU land in a pool buffer; larger ones get
    /// a heap buffer. The headers are re-parsed from the copy so the
    /// envelope never aliases the caller's memory.
    pub fn from_wire(pool: &Arc<PacketBufferPool>, raw: &[u8]) -> CodecResult<Self> {
        let buf = if raw.len() <= MTU {
            let mut pooled = pool.acquire();
            pooled[..raw.len()].copy_from_slice(raw);
            EnvelopeBuf::Pooled(pooled)
        } else {
            EnvelopeBuf::Heap(raw.to_vec())
        };

        let wire = 0..raw.len();
        let (ipv4, ip_payload) = Ipv4Header::parse(&buf.as_slice()[wire.clone()])?;
        let (udp, body) = UdpHeader::parse(&buf.as_slice()[ip_payload.clone()])?;
        let udp_payload = ip_payload.start + body.start..ip_payload.start + body.end;

        Ok(Self {
            ipv4,
            udp: Some(udp),
            buf,
            wire,
            udp_payload,
        })
    }

    /// The IPv4 header record.
    pub fn ipv4(&self) -> &Ipv4Header {
        &self.ipv4
    }

    /// The UDP header record; `None` for trailing IPv4 fragments.
    pub fn udp(&self) -> Option<&UdpHeader> {
        self.udp.as_ref()
    }

    /// The wire-ready datagram bytes.
    pub fn wire(&self) -> &[u8] {
        &self.buf.as_slice()[self.wire.clone()]
    }

    /// The UDP payload bytes carried in this envelope's buffer.
    ///
    /// For a fragmented synthesized datagram this is only the portion
    /// transmitted with the primary; trailing fragments report an empty
    /// payload.
    pub fn udp_payload(&self) -> &[u8] {
        &self.buf.as_slice()[self.udp_payload.clone()]
    }

    /// Whether the backing buffer came from the pool.
    pub fn is_pooled(&self) -> bool {
        matches!(self.buf, EnvelopeBuf::Pooled(_))
    }
}
