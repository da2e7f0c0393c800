//! Response packet synthesizer
//!
//! Builds wire-ready IPv4/UDP response datagrams for a flow, reversing the
//! direction observed on the TUN side (source becomes the remote peer,
//! destination the local application).
//!
//! # Layout
//!
//! The packet is written *backwards* into an MTU buffer so long payloads
//! avoid a second copy: the payload start offset is `MTU - payload_len`
//! when the whole payload fits, otherwise 28 (IPv4 + UDP header room) with
//! the more-fragments flag set. The UDP header goes immediately before the
//! payload, the pseudo-header into scratch bytes before that, and the IPv4
//! header immediately before the UDP header. The wire view is everything
//! from the IPv4 header to the end of the transmitted payload.
//!
//! # Fragmentation
//!
//! Payloads longer than `MTU - 28` produce a full-MTU primary datagram
//! (UDP header + first `MTU - 28` payload bytes, MF set) followed by
//! fragments of `(MTU - 20) / 8 * 8` bytes each. Every fragment shares the
//! primary's IP identification; the last clears MF. The caller must submit
//! primary and fragments to the TUN device in order.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::config::{IPV4_HEADER_LEN, IP_UDP_OVERHEAD, MTU, PSEUDO_HEADER_LEN, UDP_HEADER_LEN};
use crate::error::CodecResult;
use crate::io::PacketBufferPool;
use crate::packet::envelope::{Envelope, EnvelopeBuf};
use crate::packet::ipv4::{next_ip_id, Ipv4Header, IPPROTO_UDP};
use crate::packet::udp::UdpHeader;

/// Builds response datagrams out of pool buffers.
#[derive(Debug, Clone)]
pub struct ResponseSynthesizer {
    pool: Arc<PacketBufferPool>,
    ttl: u8,
}

impl ResponseSynthesizer {
    /// Create a synthesizer stamping `ttl` on every packet it builds.
    pub fn new(pool: Arc<PacketBufferPool>, ttl: u8) -> Self {
        Self { pool, ttl }
    }

    /// Synthesize the response datagram(s) for `payload`.
    ///
    /// `local`/`local_port` identify the TUN-side application and become
    /// the destination; `remote`/`remote_port` become the source. Returns
    /// the primary envelope plus trailing fragments, each independently
    /// wire-ready, to be written in order.
    pub fn response(
        &self,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        local_port: u16,
        remote_port: u16,
        payload: &[u8],
    ) -> CodecResult<(Envelope, Vec<Envelope>)> {
        let mut ip = Ipv4Header {
            id: next_ip_id(),
            ttl: self.ttl,
            protocol: IPPROTO_UDP,
            src: remote,
            dst: local,
            ..Ipv4Header::default()
        };
        let udp = UdpHeader {
            src_port: remote_port,
            dst_port: local_port,
        };

        let payload_len = payload.len();
        let fragmented = payload_len > MTU - IP_UDP_OVERHEAD;
        let payload_start = if fragmented {
            ip.more_fragments = true;
            IP_UDP_OVERHEAD
        } else {
            MTU - payload_len
        };
        let udp_start = payload_start - UDP_HEADER_LEN;
        let pseudo_start = udp_start - PSEUDO_HEADER_LEN;
        let ip_start = udp_start - IPV4_HEADER_LEN;

        let mut buf = self.pool.acquire();

        // UDP length and checksum cover the full payload, even when only
        // part of it rides in this datagram.
        ip.write_pseudo_header(
            &mut buf[pseudo_start..udp_start],
            IPPROTO_UDP,
            UDP_HEADER_LEN + payload_len,
        )?;
        {
            let head = &mut buf[..payload_start];
            let (scratch, udp_dst) = head.split_at_mut(udp_start);
            udp.serialize(udp_dst, &scratch[pseudo_start..], payload)?;
        }

        let transmitted = payload_len.min(MTU - payload_start);
        buf[payload_start..payload_start + transmitted].copy_from_slice(&payload[..transmitted]);

        // IPv4 length and checksum cover only the transmitted bytes.
        ip.serialize(&mut buf[ip_start..udp_start], UDP_HEADER_LEN + transmitted)?;

        let wire = ip_start..payload_start + transmitted;
        let body = payload_start..payload_start + transmitted;
        let primary = Envelope::new(ip.clone(), Some(udp), EnvelopeBuf::Pooled(buf), wire, body);

        if !fragmented {
            return Ok((primary, Vec::new()));
        }
        let fragments = self.fragments(&ip, &payload[MTU - IP_UDP_OVERHEAD..])?;
        Ok((primary, fragments))
    }

    /// Build the trailing fragments for `rest`, the payload bytes that did
    /// not fit the primary datagram.
    fn fragments(&self, primary: &Ipv4Header, rest: &[u8]) -> CodecResult<Vec<Envelope>> {
        // Offsets count 8-byte units of the reassembled datagram; the
        // primary already carried (MTU - 20) bytes of IP payload.
        let unit_bytes = (MTU - IPV4_HEADER_LEN) / 8 * 8;
        let mut offset = ((MTU - IPV4_HEADER_LEN) / 8) as u16;

        let chunks: Vec<&[u8]> = rest.chunks(unit_bytes).collect();
        let mut out = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let mut ip = primary.clone();
            ip.more_fragments = i + 1 < chunks.len();
            ip.fragment_offset = offset;

            let mut buf = self.pool.acquire();
            ip.serialize(&mut buf[..IPV4_HEADER_LEN], chunk.len())?;
            buf[IPV4_HEADER_LEN..IPV4_HEADER_LEN + chunk.len()].copy_from_slice(chunk);

            let wire = 0..IPV4_HEADER_LEN + chunk.len();
            out.push(Envelope::new(ip, None, EnvelopeBuf::Pooled(buf), wire, 0..0));

            offset += (unit_bytes / 8) as u16;
        }
        Ok(out)
    }
}
