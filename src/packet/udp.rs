//! UDP header record
//!
//! Length and checksum are derived at serialize time. The checksum covers
//! the pseudo-header, the UDP header, and the *full* datagram payload,
//! even when the enclosing IPv4 packet is about to be fragmented and only
//! carries part of that payload. Fragments reassemble into a datagram
//! whose checksum must hold over the whole.

use std::ops::Range;

use crate::config::UDP_HEADER_LEN;
use crate::error::{CodecError, CodecResult};
use crate::packet::checksum;

/// Parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
}

impl UdpHeader {
    /// Serialized header length in bytes.
    pub const LEN: usize = UDP_HEADER_LEN;

    /// Parse a UDP header from the front of `data`.
    ///
    /// Returns the header record and the payload range within `data`.
    pub fn parse(data: &[u8]) -> CodecResult<(Self, Range<usize>)> {
        if data.len() < Self::LEN {
            return Err(CodecError::truncated(Self::LEN, data.len()));
        }
        let length = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if length < Self::LEN || length > data.len() {
            return Err(CodecError::BadUdpLength {
                length,
                have: data.len(),
            });
        }
        let header = Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
        };
        Ok((header, Self::LEN..length))
    }

    /// Serialize this header into the first 8 bytes of `dst`.
    ///
    /// `pseudo` is the 12-byte pseudo-header already written for this
    /// datagram; `payload` is the full datagram payload, which need not
    /// live in `dst`'s buffer. Length and checksum cover all of `payload`
    /// regardless of how much of it the caller will transmit alongside
    /// this header.
    pub fn serialize(&self, dst: &mut [u8], pseudo: &[u8], payload: &[u8]) -> CodecResult<()> {
        if dst.len() < Self::LEN {
            return Err(CodecError::no_room(Self::LEN, dst.len()));
        }
        let length = Self::LEN + payload.len();
        if length > usize::from(u16::MAX) {
            return Err(CodecError::BadUdpLength {
                length,
                have: usize::from(u16::MAX),
            });
        }

        let dst = &mut dst[..Self::LEN];
        dst[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        dst[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        dst[4..6].copy_from_slice(&(length as u16).to_be_bytes());
        dst[6..8].fill(0);

        let mut ck = checksum::checksum(&[pseudo, &dst[..], payload]);
        if ck == 0 {
            // An all-zero checksum field means "no checksum" on the wire.
            ck = 0xFFFF;
        }
        dst[6..8].copy_from_slice(&ck.to_be_bytes());
        Ok(())
    }
}
