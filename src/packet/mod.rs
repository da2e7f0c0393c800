//! IPv4/UDP packet codec, envelopes, and the response synthesizer
//!
//! The codec works on header *records* with named fields; fragmentation
//! flags are booleans on the record and are only packed into the wire
//! encoding at serialize time. All serializers compute and write checksums
//! over the exact byte ranges they are given.
//!
//! One deliberate asymmetry, inherited from how UDP-over-IPv4
//! fragmentation works: the UDP length and checksum always cover the full
//! datagram payload, while each IPv4 header's total-length and checksum
//! cover only the bytes transmitted in that fragment.

pub mod checksum;
pub mod envelope;
pub mod ipv4;
pub mod synth;
pub mod udp;

pub use envelope::{Envelope, EnvelopeBuf};
pub use ipv4::{next_ip_id, Ipv4Header, IPPROTO_UDP};
pub use synth::ResponseSynthesizer;
pub use udp::UdpHeader;
