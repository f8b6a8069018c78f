//! Datagram framing: the bit-packed header, ACK/NAK carriers and the
//! frame list of data datagrams.

use crate::error::{NetError, Result};
use crate::protocol::ack::AckSet;
use crate::protocol::frame::Frame;
use crate::protocol::number::U24;
use bytes::Bytes;
use garnet_binary::BitStream;
use std::time::Instant;

/// Header + 24-bit datagram number.
pub const DATAGRAM_HEADER_BITS: usize = 8 + 24;
/// Data datagrams additionally carry a 32-bit send timestamp.
pub const DATA_HEADER_BITS: usize = DATAGRAM_HEADER_BITS + 32;
/// Bytes of datagram overhead to subtract from the MTU when packing.
pub const DATA_HEADER_BYTES: usize = DATA_HEADER_BITS / 8;
/// Smallest legal frame: 3 bits reliability, split bit, 6-bit compressed
/// length, empty payload. Fewer remaining bits than this is padding.
const MIN_FRAME_BITS: usize = 3 + 1 + 6;

/// Bit-packed first word of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub is_ack: bool,
    /// Congestion telemetry (bandwidth + arrival rate) follows the
    /// header. Never set by this implementation; skipped on receive.
    pub has_b_and_as: bool,
    pub is_packet_pair: bool,
    pub is_continuous_send: bool,
    pub number: U24,
}

impl DatagramHeader {
    pub fn data(number: U24) -> Self {
        Self {
            is_ack: false,
            has_b_and_as: false,
            is_packet_pair: false,
            is_continuous_send: false,
            number,
        }
    }

    pub fn ack(number: U24) -> Self {
        Self {
            is_ack: true,
            ..Self::data(number)
        }
    }

    pub fn encode(&self, out: &mut BitStream) -> Result<()> {
        out.write_bit(true)?; // isValid
        out.write_bit(self.is_ack)?;
        out.write_bit(self.has_b_and_as)?;
        out.write_bit(self.is_packet_pair)?;
        out.write_bit(self.is_continuous_send)?;
        out.write_bits(&[0], 3, true)?; // reserved
        out.write_u24(self.number.get())?;
        Ok(())
    }

    pub fn decode(input: &mut BitStream) -> Result<Self> {
        if !input.read_bit()? {
            return Err(NetError::MalformedPacket("valid bit not set".into()));
        }
        let is_ack = input.read_bit()?;
        let has_b_and_as = input.read_bit()?;
        let is_packet_pair = input.read_bit()?;
        let is_continuous_send = input.read_bit()?;
        let _reserved = input.read_bits(3, true)?;
        let number = U24::new(input.read_u24()?);
        Ok(Self {
            is_ack,
            has_b_and_as,
            is_packet_pair,
            is_continuous_send,
            number,
        })
    }
}

/// One parsed wire datagram.
#[derive(Debug)]
pub enum Datagram {
    /// Acknowledgement carrier. `is_nak` selects negative semantics; the
    /// datagram number field is informational and not sequenced.
    Ack {
        header: DatagramHeader,
        is_nak: bool,
        set: AckSet,
    },
    /// Data carrier: send timestamp (microseconds, peer-relative) and at
    /// least one frame.
    Data {
        header: DatagramHeader,
        timestamp: u32,
        frames: Vec<Frame>,
    },
}

impl Datagram {
    /// Encodes an ACK or NAK datagram, consuming as much of `set` as the
    /// wire budget allows. Leftover intervals stay in `set`.
    pub fn encode_ack(
        number: U24,
        is_nak: bool,
        set: &mut AckSet,
        max_bytes: usize,
    ) -> Result<Bytes> {
        let mut out = BitStream::with_capacity(64);
        DatagramHeader::ack(number).encode(&mut out)?;
        out.write_bit(is_nak)?;
        set.serialize_limited(&mut out, max_bytes.saturating_sub(DATAGRAM_HEADER_BITS / 8 + 1))?;
        Ok(out.into_bytes())
    }

    /// Encodes a data datagram from already-numbered frames.
    pub fn encode_data(number: U24, timestamp: u32, frames: &[Frame]) -> Result<Bytes> {
        debug_assert!(!frames.is_empty());
        let payload_bits: usize = frames.iter().map(Frame::encoded_bits).sum();
        let mut out = BitStream::with_capacity((DATA_HEADER_BITS + payload_bits).div_ceil(8));
        DatagramHeader::data(number).encode(&mut out)?;
        out.write_u32(timestamp)?;
        for frame in frames {
            frame.encode(&mut out)?;
        }
        Ok(out.into_bytes())
    }

    /// Parses one datagram. Any violation drops the whole datagram.
    pub fn decode(bytes: Bytes, now: Instant) -> Result<Self> {
        let mut input = BitStream::from_bytes(bytes);
        let header = DatagramHeader::decode(&mut input)?;

        if header.is_ack {
            let is_nak = input.read_bit()?;
            let set = AckSet::deserialize(&mut input)?;
            return Ok(Datagram::Ack {
                header,
                is_nak,
                set,
            });
        }

        if header.has_b_and_as {
            // Bandwidth + arrival-rate telemetry from congestion modes we
            // do not run; skip.
            let _b = input.read_f32()?;
            let _as = input.read_f32()?;
        }
        let timestamp = input.read_u32()?;

        let mut frames = Vec::new();
        while input.remaining_bits() >= MIN_FRAME_BITS {
            frames.push(Frame::decode(&mut input, now)?);
        }
        if frames.is_empty() {
            return Err(NetError::MalformedPacket("data datagram with no frames".into()));
        }
        Ok(Datagram::Data {
            header,
            timestamp,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::reliability::{Priority, Reliability};

    #[test]
    fn header_round_trip() {
        let header = DatagramHeader {
            is_ack: false,
            has_b_and_as: false,
            is_packet_pair: true,
            is_continuous_send: true,
            number: U24::new(0x00AB_CDEF & 0x00FF_FFFF),
        };
        let mut stream = BitStream::new();
        header.encode(&mut stream).unwrap();
        assert_eq!(stream.bits_used(), DATAGRAM_HEADER_BITS);
        assert_eq!(DatagramHeader::decode(&mut stream).unwrap(), header);
    }

    #[test]
    fn data_datagram_round_trip() {
        let now = Instant::now();
        let mut a = Frame::new(
            Reliability::ReliableOrdered,
            2,
            Bytes::from_static(b"first"),
            Priority::Medium,
            None,
            now,
        );
        a.message_number = Some(U24::new(10));
        a.ordering_index = Some(U24::new(0));
        let b = Frame::new(
            Reliability::Unreliable,
            0,
            Bytes::from_static(b"second"),
            Priority::Medium,
            None,
            now,
        );

        let bytes = Datagram::encode_data(U24::new(77), 123_456, &[a, b]).unwrap();
        match Datagram::decode(bytes, now).unwrap() {
            Datagram::Data {
                header,
                timestamp,
                frames,
            } => {
                assert_eq!(header.number, U24::new(77));
                assert!(!header.is_ack);
                assert_eq!(timestamp, 123_456);
                assert_eq!(frames.len(), 2);
                assert_eq!(frames[0].payload.as_ref(), b"first");
                assert_eq!(frames[1].payload.as_ref(), b"second");
            }
            other => panic!("expected data datagram, got {other:?}"),
        }
    }

    #[test]
    fn ack_datagram_round_trip() {
        let mut set = AckSet::new();
        for n in [1u32, 2, 3, 9] {
            set.insert(n);
        }
        let bytes = Datagram::encode_ack(U24::new(5), false, &mut set, 1200).unwrap();
        assert!(set.is_empty());
        match Datagram::decode(bytes, Instant::now()).unwrap() {
            Datagram::Ack { is_nak, set, .. } => {
                assert!(!is_nak);
                assert_eq!(set.intervals(), &[(1, 3), (9, 9)]);
            }
            other => panic!("expected ack datagram, got {other:?}"),
        }
    }

    #[test]
    fn nak_flag_survives() {
        let mut set = AckSet::new();
        set.insert(4);
        let bytes = Datagram::encode_ack(U24::new(0), true, &mut set, 1200).unwrap();
        match Datagram::decode(bytes, Instant::now()).unwrap() {
            Datagram::Ack { is_nak, set, .. } => {
                assert!(is_nak);
                assert_eq!(set.intervals(), &[(4, 4)]);
            }
            other => panic!("expected nak datagram, got {other:?}"),
        }
    }

    #[test]
    fn truncated_datagram_is_malformed() {
        let now = Instant::now();
        let mut frame = Frame::new(
            Reliability::Reliable,
            0,
            Bytes::from_static(b"some payload here"),
            Priority::Medium,
            None,
            now,
        );
        frame.message_number = Some(U24::new(3));
        let bytes = Datagram::encode_data(U24::new(1), 0, &[frame]).unwrap();
        let cut = bytes.slice(..bytes.len() - 6);
        assert!(Datagram::decode(cut, now).is_err());
    }

    #[test]
    fn offline_bytes_are_not_valid_datagrams() {
        // Offline messages start with an id byte < 0x80, so the valid bit
        // is clear.
        let bytes = Bytes::from_static(&[0x05, 0, 0, 0, 0]);
        assert!(Datagram::decode(bytes, Instant::now()).is_err());
    }
}
