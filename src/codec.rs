//! Wire codec: fixed 20-byte header, big-endian fields, sum-mod-2^32 checksum.

use bitflags::bitflags;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 20;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const ACK = 0x10;
    }
}

/// A single transport-layer packet: fixed header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub flags: Flags,
    pub conn_id: u16,
    pub seq: u32,
    pub ack: u32,
    pub recv_win: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub const CURRENT_VERSION: u8 = 1;

    pub fn new(flags: Flags, conn_id: u16, seq: u32, ack: u32, recv_win: u16) -> Self {
        Packet {
            version: Self::CURRENT_VERSION,
            flags,
            conn_id,
            seq,
            ack,
            recv_win,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_data(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Serializes header-with-checksum-zeroed || payload, computes the
    /// checksum over that buffer, then patches it into the checksum field.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.version);
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.conn_id.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.extend_from_slice(&self.recv_win.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // checksum placeholder
        buf.extend_from_slice(&self.payload);

        let checksum = checksum(&buf);
        buf[16..20].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Strict decode: rejects short input, a `length` mismatch, and a
    /// checksum disagreement.
    pub fn unpack(data: &[u8]) -> Result<Self, MalformedPacket> {
        if data.len() < HEADER_LEN {
            return Err(MalformedPacket::TooShort(data.len()));
        }

        let version = data[0];
        let flags = Flags::from_bits_truncate(data[1]);
        let conn_id = u16::from_be_bytes([data[2], data[3]]);
        let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let recv_win = u16::from_be_bytes([data[12], data[13]]);
        let length = u16::from_be_bytes([data[14], data[15]]) as usize;
        let checksum_field = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        let payload = &data[HEADER_LEN..];

        if length != payload.len() {
            return Err(MalformedPacket::LengthMismatch {
                declared: length,
                actual: payload.len(),
            });
        }

        let mut zeroed = data.to_vec();
        zeroed[16..20].fill(0);
        let computed = checksum(&zeroed);
        if computed != checksum_field {
            return Err(MalformedPacket::ChecksumMismatch {
                expected: checksum_field,
                computed,
            });
        }

        Ok(Packet {
            version,
            flags,
            conn_id,
            seq,
            ack,
            recv_win,
            payload: payload.to_vec(),
        })
    }
}

/// Unsigned 32-bit sum of all bytes, modulo 2^32. Detects single-byte
/// corruption and most multi-byte corruption; not a cryptographic MAC.
/// Both peers must agree on this exact algorithm bit-for-bit.
fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("packet shorter than header: {0} bytes")]
    TooShort(usize),
    #[error("declared length {declared} does not match actual payload {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch: expected {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_empty_payload() {
        let pkt = Packet::new(Flags::SYN, 42, 0, 0, 10);
        let bytes = pkt.pack();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = Packet::unpack(&bytes).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn round_trip_with_payload() {
        let pkt = Packet::new(Flags::empty(), 7, 3, 0, 10).with_payload(b"hello".to_vec());
        let bytes = pkt.pack();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        let decoded = Packet::unpack(&bytes).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn single_byte_corruption_is_detected() {
        let pkt = Packet::new(Flags::ACK, 1, 5, 2, 10).with_payload(b"abc".to_vec());
        let mut bytes = pkt.pack();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Packet::unpack(&bytes),
            Err(MalformedPacket::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn short_input_is_rejected() {
        let bytes = [0u8; 4];
        assert!(matches!(
            Packet::unpack(&bytes),
            Err(MalformedPacket::TooShort(4))
        ));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let pkt = Packet::new(Flags::empty(), 1, 0, 0, 10).with_payload(b"abc".to_vec());
        let mut bytes = pkt.pack();
        // Declare a longer payload than is actually present.
        bytes[14..16].copy_from_slice(&10u16.to_be_bytes());
        assert!(matches!(
            Packet::unpack(&bytes),
            Err(MalformedPacket::LengthMismatch { .. })
        ));
    }

    #[test]
    fn flags_are_combinable() {
        let both = Flags::SYN | Flags::ACK;
        assert!(both.contains(Flags::SYN));
        assert!(both.contains(Flags::ACK));
        assert!(!both.contains(Flags::FIN));
    }
}
