//! Internet checksum (RFC 1071)
//!
//! One's-complement sum of big-endian 16-bit words, folded and inverted.
//! The multi-part form exists so the UDP checksum can cover the
//! pseudo-header, the header, and a payload that lives in a different
//! buffer without first concatenating them.

/// Sum the big-endian 16-bit words of `data` without folding.
///
/// An odd trailing byte is padded with a zero low byte, per RFC 1071.
fn sum_be_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

/// Compute the internet checksum over the concatenation of `parts`.
///
/// Only the final part may have odd length; an odd-length part in the
/// middle would shift the word alignment of everything after it.
pub fn checksum(parts: &[&[u8]]) -> u16 {
    debug_assert!(parts
        .iter()
        .rev()
        .skip(1)
        .all(|part| part.len() % 2 == 0));

    let mut sum: u32 = parts.iter().map(|part| sum_be_words(part)).sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Verify a checksummed region: a valid region sums to zero.
pub fn verify(parts: &[&[u8]]) -> bool {
    checksum(parts) == 0
}
