//! IPv4 header record
//!
//! Parse and serialize option-less IPv4 headers. Fragmentation state lives
//! in named fields (`dont_fragment`, `more_fragments`, `fragment_offset`)
//! and is packed into the flags word only at serialize time.

use std::net::Ipv4Addr;
use std::ops::Range;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::config::{IPV4_HEADER_LEN, PSEUDO_HEADER_LEN};
use crate::error::{CodecError, CodecResult};
use crate::packet::checksum;

/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const OFFSET_MASK: u16 = 0x1FFF;

static IP_ID: AtomicU16 = AtomicU16::new(0);

/// Next IPv4 identification value.
///
/// Process-wide, advances by one per call, wraps at `u16::MAX`. All
/// fragments of one datagram must share a single value drawn here.
pub fn next_ip_id() -> u16 {
    IP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Parsed IPv4 header.
///
/// Version is fixed at 4 and the header length at 20 bytes (options on
/// inbound packets are skipped, not retained). Total length and checksum
/// are derived at serialize time from the payload actually transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Type-of-service byte.
    pub tos: u8,
    /// Identification, shared by all fragments of a datagram.
    pub id: u16,
    /// Don't-fragment flag.
    pub dont_fragment: bool,
    /// More-fragments flag.
    pub more_fragments: bool,
    /// Fragment offset in 8-byte units.
    pub fragment_offset: u16,
    /// Time to live.
    pub ttl: u8,
    /// Payload protocol number.
    pub protocol: u8,
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Self {
            tos: 0,
            id: 0,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: IPPROTO_UDP,
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl Ipv4Header {
    /// Serialized header length in bytes.
    pub const LEN: usize = IPV4_HEADER_LEN;

    /// Parse an IPv4 header from the front of `data`.
    ///
    /// Returns the header record and the payload range within `data`
    /// (header-length to total-length). Options are skipped.
    pub fn parse(data: &[u8]) -> CodecResult<(Self, Range<usize>)> {
        if data.len() < Self::LEN {
            return Err(CodecError::truncated(Self::LEN, data.len()));
        }
        let version = data[0] >> 4;
        if version != 4 {
            return Err(CodecError::BadVersion(version));
        }
        let header_len = usize::from(data[0] & 0x0F) * 4;
        if header_len < Self::LEN {
            return Err(CodecError::BadHeaderLength(header_len));
        }
        if data.len() < header_len {
            return Err(CodecError::truncated(header_len, data.len()));
        }
        let total = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if total < header_len || total > data.len() {
            return Err(CodecError::BadTotalLength {
                total,
                have: data.len(),
            });
        }
        let flags_offset = u16::from_be_bytes([data[6], data[7]]);

        let header = Self {
            tos: data[1],
            id: u16::from_be_bytes([data[4], data[5]]),
            dont_fragment: flags_offset & FLAG_DF != 0,
            more_fragments: flags_offset & FLAG_MF != 0,
            fragment_offset: flags_offset & OFFSET_MASK,
            ttl: data[8],
            protocol: data[9],
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        };
        Ok((header, header_len..total))
    }

    /// Serialize this header into the first 20 bytes of `dst`.
    ///
    /// `contained_len` is the number of payload bytes transmitted in this
    /// datagram; the total-length field and the header checksum cover
    /// exactly `20 + contained_len`; for a fragment that is the fragment
    /// body, not the full reassembled payload.
    pub fn serialize(&self, dst: &mut [u8], contained_len: usize) -> CodecResult<()> {
        if dst.len() < Self::LEN {
            return Err(CodecError::no_room(Self::LEN, dst.len()));
        }
        let total = Self::LEN + contained_len;
        if total > usize::from(u16::MAX) {
            return Err(CodecError::BadTotalLength {
                total,
                have: usize::from(u16::MAX),
            });
        }

        let dst = &mut dst[..Self::LEN];
        dst[0] = 0x45; // version 4, header length 5 words
        dst[1] = self.tos;
        dst[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        dst[4..6].copy_from_slice(&self.id.to_be_bytes());

        let mut flags_offset = self.fragment_offset & OFFSET_MASK;
        if self.dont_fragment {
            flags_offset |= FLAG_DF;
        }
        if self.more_fragments {
            flags_offset |= FLAG_MF;
        }
        dst[6..8].copy_from_slice(&flags_offset.to_be_bytes());

        dst[8] = self.ttl;
        dst[9] = self.protocol;
        dst[10..12].fill(0);
        dst[12..16].copy_from_slice(&self.src.octets());
        dst[16..20].copy_from_slice(&self.dst.octets());

        let ck = checksum::checksum(&[&dst[..]]);
        dst[10..12].copy_from_slice(&ck.to_be_bytes());
        Ok(())
    }

    /// Write the 12-byte UDP/TCP pseudo-header into `dst`.
    ///
    /// `length` is the transport length (header plus full payload) the
    /// transport checksum covers.
    pub fn write_pseudo_header(
        &self,
        dst: &mut [u8],
        protocol: u8,
        length: usize,
    ) -> CodecResult<()> {
        if dst.len() < PSEUDO_HEADER_LEN {
            return Err(CodecError::no_room(PSEUDO_HEADER_LEN, dst.len()));
        }
        if length > usize::from(u16::MAX) {
            return Err(CodecError::BadUdpLength {
                length,
                have: usize::from(u16::MAX),
            });
        }
        dst[0..4].copy_from_slice(&self.src.octets());
        dst[4..8].copy_from_slice(&self.dst.octets());
        dst[8] = 0;
        dst[9] = protocol;
        dst[10..12].copy_from_slice(&(length as u16).to_be_bytes());
        Ok(())
    }
}
