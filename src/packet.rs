//! The PTCP wire format: a fixed 23-byte header followed by payload bytes,
//! trailed by nothing (the checksum lives in the header, covering the
//! payload).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Source Pseudo-Port    |        Dest Pseudo-Port       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Acknowledgment Number                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Window                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |                 CRC-32 Checksum              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        (cont.)               |         Data Length           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Payload ...                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Fixed header layout: 2 + 2 + 4 + 4 + 4 + 1 + 4 + 2 = 23 bytes. The
//! wire format carries an explicit data-length field separate from the
//! datagram's own size, so that a payload delivered short of what the
//! header declares is distinguishable from one delivered intact. That is
//! what lets [`Packet::decode`] recognize a truncated segment and answer
//! with an STB advisory, rather than trusting the datagram layer to never
//! clip anything.
//!
//! (An earlier header layout folded `dlen` away and shrank `window` to a
//! single byte, reaching a tidy 19 bytes; that layout made truncation
//! structurally undetectable, since whatever arrived silently became the
//! whole truth. Dropping MTU-shrink-on-truncation was not on the table, so
//! the header carries its declared length explicitly.)

use crate::{error::PacketError, message::Message};
use std::fmt;

/// The fixed header length in bytes, not counting payload.
pub const HEADER_LEN: usize = 23;

/// The largest payload a single packet may carry, chosen so that a
/// maximum-size packet plus the lower-layer (UDP/IP) headers stays under a
/// conservative Ethernet MTU. Connections negotiate a smaller effective MTU
/// via the STB flag; this is the hard ceiling.
pub const MAX_SEGMENT_SIZE: usize = 1024;

bitflags::bitflags! {
    /// Control bits carried in the packet header.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Flags: u8 {
        const SYN = 0b0000_0001;
        const ACK = 0b0000_0010;
        const FIN = 0b0000_0100;
        const RST = 0b0000_1000;
        /// "Shrink the buffer": an MTU-lowering advisory, not an RFC 793 bit.
        const STB = 0b0001_0000;
    }
}

impl Flags {
    pub fn syn(self) -> bool {
        self.contains(Flags::SYN)
    }
    pub fn ack(self) -> bool {
        self.contains(Flags::ACK)
    }
    pub fn fin(self) -> bool {
        self.contains(Flags::FIN)
    }
    pub fn rst(self) -> bool {
        self.contains(Flags::RST)
    }
    pub fn stb(self) -> bool {
        self.contains(Flags::STB)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bit, ch) in [
            (Flags::SYN, 'S'),
            (Flags::ACK, 'A'),
            (Flags::FIN, 'F'),
            (Flags::RST, 'R'),
            (Flags::STB, 'T'),
        ] {
            write!(f, "{}", if self.contains(bit) { ch } else { '.' })?;
        }
        Ok(())
    }
}

/// A decoded PTCP packet: header fields plus payload.
#[derive(Clone)]
pub struct Packet {
    pub source_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u32,
    pub payload: Message,
}

impl Packet {
    /// Build a packet, computing its checksum lazily at [`Packet::encode`]
    /// time rather than storing it redundantly on the struct.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_port: u16,
        dest_port: u16,
        seq: u32,
        ack: u32,
        flags: Flags,
        window: u32,
        payload: Message,
    ) -> Self {
        Self {
            source_port,
            dest_port,
            seq,
            ack,
            flags,
            window,
            payload,
        }
    }

    /// The segment length as used by the acceptability tests in
    /// [`crate::seq`]: payload bytes, plus one each for SYN/FIN since both
    /// consume a sequence number.
    pub fn segment_length(&self) -> u32 {
        self.payload.len() as u32 + self.flags.syn() as u32 + self.flags.fin() as u32
    }

    /// Whether this packet carries anything that would be lost if dropped:
    /// data, or a SYN/FIN control bit. Pure ACKs are not retransmitted.
    pub fn must_retransmit(&self) -> bool {
        !self.payload.is_empty() || self.flags.syn() || self.flags.fin()
    }

    /// CRC-32 over the payload only, matching the reference checksum's
    /// scope; header fields are covered by the datagram layer's own
    /// integrity (and by `dlen`'s truncation/garbage checks), not by this.
    fn checksum(payload: &Message) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for byte in payload.iter() {
            hasher.update(&[byte]);
        }
        hasher.finalize()
    }

    /// Serialize this packet to bytes suitable for handing to a
    /// [`crate::transport::DatagramTransport`].
    pub fn encode(&self) -> Message {
        let checksum = Self::checksum(&self.payload);
        let dlen = self.payload.len() as u16;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&self.source_port.to_be_bytes());
        header.extend_from_slice(&self.dest_port.to_be_bytes());
        header.extend_from_slice(&self.seq.to_be_bytes());
        header.extend_from_slice(&self.ack.to_be_bytes());
        header.extend_from_slice(&self.window.to_be_bytes());
        header.push(self.flags.bits());
        header.extend_from_slice(&checksum.to_be_bytes());
        header.extend_from_slice(&dlen.to_be_bytes());

        let mut message = self.payload.clone();
        message.header(header);
        message
    }

    /// Parse a datagram's worth of bytes into a `Packet`, validating its
    /// declared length and checksum.
    ///
    /// A datagram shorter than the header is unparseable and dropped
    /// silently by the caller. A datagram whose trailing bytes don't match
    /// the header's declared `dlen` is [`PacketError::Truncated`] (fewer
    /// bytes arrived than declared, and the caller should answer with an STB
    /// advisory) or [`PacketError::Garbage`] (more arrived than declared).
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::HeaderTooShort {
                len: bytes.len(),
                header_len: HEADER_LEN,
            });
        }

        let source_port = u16::from_be_bytes([bytes[0], bytes[1]]);
        let dest_port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let seq = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let ack = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let window = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let flags = Flags::from_bits_truncate(bytes[16]);
        let expected = u32::from_be_bytes([bytes[17], bytes[18], bytes[19], bytes[20]]);
        let dlen = u16::from_be_bytes([bytes[21], bytes[22]]) as usize;

        if dlen > MAX_SEGMENT_SIZE {
            return Err(PacketError::TooLarge {
                len: dlen,
                max: MAX_SEGMENT_SIZE,
            });
        }

        let actual = bytes.len() - HEADER_LEN;
        if actual < dlen {
            return Err(PacketError::Truncated { declared: dlen, actual });
        }
        if actual > dlen {
            return Err(PacketError::Garbage { declared: dlen, actual });
        }

        let payload = Message::new(&bytes[HEADER_LEN..]);
        let computed = Self::checksum(&payload);
        if computed != expected {
            return Err(PacketError::ChecksumMismatch {
                expected,
                actual: computed,
            });
        }

        Ok(Self {
            source_port,
            dest_port,
            seq,
            ack,
            flags,
            window,
            payload,
        })
    }

    /// Split a packet whose payload is larger than `mtu` into sequential
    /// fragments, each carrying a contiguous slice of the payload and
    /// advancing sequence numbers appropriately. Only the final fragment
    /// carries a FIN, if the original packet had one.
    ///
    /// `mtu` is a payload budget, not a full-datagram budget. It's the
    /// same unit as [`crate::config::Config::initial_mtu`] and the value
    /// an STB advisory shrinks, matching the reference implementation's
    /// `Connection.mtu` (already `512 - headerSize`, not `512`).
    pub fn fragment(self, mtu: usize) -> Vec<Packet> {
        let max_payload = mtu.max(1);
        if self.payload.len() <= max_payload {
            return vec![self];
        }

        let mut remaining = self.payload;
        let mut seq = self.seq;
        let mut fragments = Vec::new();
        while !remaining.is_empty() {
            let take = remaining.len().min(max_payload);
            let chunk = remaining.cut(take);
            let is_last = remaining.is_empty();
            fragments.push(Packet {
                source_port: self.source_port,
                dest_port: self.dest_port,
                seq,
                ack: self.ack,
                flags: if is_last {
                    self.flags
                } else {
                    self.flags.difference(Flags::FIN)
                },
                window: self.window,
                payload: chunk,
            });
            seq = seq.wrapping_add(take as u32);
        }
        fragments
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.payload.to_vec();
        let short = if bytes.len() > 13 {
            format!(
                "{:02x?}...{:02x?} ({} bytes)",
                &bytes[..5],
                &bytes[bytes.len() - 5..],
                bytes.len()
            )
        } else {
            format!("{bytes:02x?}")
        };
        f.debug_struct("Packet")
            .field("flags", &self.flags)
            .field("src", &self.source_port)
            .field("dst", &self.dest_port)
            .field("seq", &self.seq)
            .field("ack", &self.ack)
            .field("window", &self.window)
            .field("payload", &short)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: &[u8]) -> Packet {
        Packet::new(10, 1, 1000, 2000, Flags::ACK, 4096, Message::new(payload))
    }

    #[test]
    fn round_trips_empty_payload() {
        let packet = sample(b"");
        let encoded = packet.encode().to_vec();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.source_port, packet.source_port);
        assert_eq!(decoded.seq, packet.seq);
        assert_eq!(decoded.flags, packet.flags);
        assert_eq!(decoded.window, packet.window);
        assert_eq!(decoded.payload.to_vec(), Vec::<u8>::new());
    }

    #[test]
    fn round_trips_with_payload() {
        let packet = sample(b"hello, ptcp");
        let encoded = packet.encode().to_vec();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.payload.to_vec(), b"hello, ptcp");
    }

    #[test]
    fn rejects_datagram_shorter_than_header() {
        let err = Packet::decode(&[0; 4]).unwrap_err();
        assert!(matches!(err, PacketError::HeaderTooShort { .. }));
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let packet = sample(b"data");
        let mut encoded = packet.encode().to_vec();
        encoded[17] ^= 0xff;
        let err = Packet::decode(&encoded).unwrap_err();
        assert!(matches!(err, PacketError::ChecksumMismatch { .. }));
    }

    #[test]
    fn truncated_payload_is_distinguished_from_garbage() {
        let packet = sample(b"hello");
        let mut encoded = packet.encode().to_vec();

        let mut short = encoded.clone();
        short.truncate(HEADER_LEN + 2);
        assert!(matches!(
            Packet::decode(&short).unwrap_err(),
            PacketError::Truncated { declared: 5, actual: 2 }
        ));

        encoded.extend_from_slice(b"!!!");
        assert!(matches!(
            Packet::decode(&encoded).unwrap_err(),
            PacketError::Garbage { declared: 5, actual: 8 }
        ));
    }

    #[test]
    fn fragments_oversized_payload() {
        let payload = vec![7u8; 1000];
        let packet = Packet::new(1, 2, 0, 0, Flags::ACK | Flags::FIN, 4096, Message::new(payload.clone()));
        let fragments = packet.fragment(400);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].seq, 0);
        assert_eq!(fragments[1].seq, 400);
        assert_eq!(fragments[2].seq, 800);
        assert!(!fragments[0].flags.fin());
        assert!(fragments[2].flags.fin());
        let total: usize = fragments.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, payload.len());
    }

    #[test]
    fn must_retransmit_matches_content() {
        assert!(!sample(b"").must_retransmit());
        assert!(sample(b"x").must_retransmit());
        let fin_only = Packet::new(1, 2, 0, 0, Flags::FIN, 0, Message::new(b""));
        assert!(fin_only.must_retransmit());
    }
}
