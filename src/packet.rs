//! Probe datagram codec.
//!
//! Every probe datagram has the same size so the receiver can size its buffer
//! exactly. Only the sequence timestamp carries information.
//!
//! # Layout
//!
//! - `[0-9]`     Timestamp: 10 ASCII digits, zero padded, modulo 10^10
//! - `[10-11]`   Filler: "aa"
//! - `[12-1261]` Payload: 1250 x "b"

use anyhow::{anyhow, Result};

/// Payload bytes per datagram (10 kbit). Rates are counted on payload only.
pub const PAYLOAD_SIZE: usize = 1250;

/// Width of the decimal timestamp field.
pub const TIMESTAMP_SIZE: usize = 10;

/// Timestamp field plus the 2-byte filler.
pub const HEADER_SIZE: usize = TIMESTAMP_SIZE + 2;

/// Total datagram size on the wire.
pub const PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Timestamps wrap at 10^10 so they always fit the decimal field.
pub const TIMESTAMP_MODULUS: u64 = 10_000_000_000;

/// Payload kilobits carried by one datagram.
pub const PAYLOAD_KBITS: u64 = (PAYLOAD_SIZE as u64) * 8 / 1000;

const FILLER: u8 = b'a';
const PAYLOAD_FILL: u8 = b'b';

/// Reusable probe datagram. The filler and payload are written once and only
/// the timestamp digits change between sends.
pub struct ProbePacket {
    buf: [u8; PACKET_SIZE],
}

impl ProbePacket {
    pub fn new() -> Self {
        let mut buf = [PAYLOAD_FILL; PACKET_SIZE];
        buf[TIMESTAMP_SIZE..HEADER_SIZE].fill(FILLER);
        let mut packet = ProbePacket { buf };
        packet.set_timestamp(0);
        packet
    }

    /// Rewrites the timestamp field in place.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        let mut value = timestamp % TIMESTAMP_MODULUS;
        for digit in self.buf[..TIMESTAMP_SIZE].iter_mut().rev() {
            *digit = b'0' + (value % 10) as u8;
            value /= 10;
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for ProbePacket {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a complete datagram for `timestamp`.
pub fn encode(timestamp: u64) -> Vec<u8> {
    let mut packet = ProbePacket::new();
    packet.set_timestamp(timestamp);
    packet.as_bytes().to_vec()
}

/// Reads the timestamp from the first 10 bytes of a datagram.
pub fn decode(data: &[u8]) -> Result<u64> {
    if data.len() < TIMESTAMP_SIZE {
        return Err(anyhow!("Datagram too short for timestamp ({} bytes)", data.len()));
    }
    let field = &data[..TIMESTAMP_SIZE];
    if !field.iter().all(u8::is_ascii_digit) {
        return Err(anyhow!("Timestamp field is not decimal"));
    }
    Ok(field
        .iter()
        .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_size_constants() {
        assert_eq!(PAYLOAD_SIZE, 1250);
        assert_eq!(HEADER_SIZE, 12);
        assert_eq!(PACKET_SIZE, 1262);
        assert_eq!(PAYLOAD_KBITS, 10);
    }

    #[test]
    fn test_encode_layout() {
        let data = encode(42);
        assert_eq!(data.len(), PACKET_SIZE);
        assert_eq!(&data[..TIMESTAMP_SIZE], b"0000000042");
        assert_eq!(&data[TIMESTAMP_SIZE..HEADER_SIZE], b"aa");
        assert!(data[HEADER_SIZE..].iter().all(|&b| b == b'b'));
    }

    #[test]
    fn test_decode_sample_timestamps() {
        for t in [0u64, 1, 9, 10, 1_234_567, 9_999_999_999] {
            assert_eq!(decode(&encode(t)).unwrap(), t);
        }
    }

    #[test]
    fn test_timestamp_wraps_at_modulus() {
        assert_eq!(decode(&encode(TIMESTAMP_MODULUS)).unwrap(), 0);
        assert_eq!(decode(&encode(TIMESTAMP_MODULUS + 17)).unwrap(), 17);
    }

    #[test]
    fn test_reused_packet_overwrites_digits() {
        let mut packet = ProbePacket::new();
        packet.set_timestamp(987_654);
        packet.set_timestamp(3);
        assert_eq!(&packet.as_bytes()[..TIMESTAMP_SIZE], b"0000000003");
    }

    #[test]
    fn test_decode_rejects_short_datagram() {
        assert!(decode(b"12345").is_err());
    }

    #[test]
    fn test_decode_rejects_non_digits() {
        let mut data = encode(5);
        data[3] = b'x';
        assert!(decode(&data).is_err());
    }
}
