//! The internal packet: one unit of application data inside a datagram,
//! carrying its reliability header bits, counters and payload bits.

use crate::error::{NetError, Result};
use crate::protocol::number::U24;
use crate::protocol::reliability::{Priority, Reliability};
use bytes::Bytes;
use garnet_binary::BitStream;
use std::time::Instant;

/// Fragment linkage for one piece of a split message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    /// Sender-chosen id shared by all fragments of one logical message.
    pub id: u16,
    /// Total number of fragments.
    pub count: u32,
    /// This fragment's position, `0..count`.
    pub index: u32,
}

/// Local bookkeeping a frame carries while queued or in flight. Never
/// serialized.
#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub priority: Priority,
    /// Application receipt tag for `_WITH_ACK_RECEIPT` modes.
    pub receipt: Option<u32>,
    pub created: Instant,
    /// When the resend logic should look at this frame again.
    pub next_action: Option<Instant>,
    pub send_attempts: u32,
}

impl FrameMeta {
    pub fn new(priority: Priority, receipt: Option<u32>, now: Instant) -> Self {
        Self {
            priority,
            receipt,
            created: now,
            next_action: None,
            send_attempts: 0,
        }
    }
}

/// One internal packet.
#[derive(Debug, Clone)]
pub struct Frame {
    pub reliability: Reliability,
    /// Ordering channel, meaningful when ordered or sequenced.
    pub channel: u8,
    /// Monotonic per-peer number, present for reliable modes.
    pub message_number: Option<U24>,
    /// Per-channel ordering position, present when ordered or sequenced.
    pub ordering_index: Option<U24>,
    /// Per-channel newest-wins position, present when sequenced.
    pub sequencing_index: Option<U24>,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
    /// Payload length in bits; sub-byte precision is preserved across
    /// the wire and across reassembly.
    pub payload_bits: usize,
    pub meta: FrameMeta,
}

/// Cost in bits of a compressed u16 as the bit stream writes it.
fn compressed_u16_bits(v: u16) -> usize {
    if v > 0xFF {
        1 + 16
    } else if v & 0xF0 == 0 {
        1 + 1 + 4
    } else {
        1 + 1 + 8
    }
}

impl Frame {
    pub fn new(
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
        priority: Priority,
        receipt: Option<u32>,
        now: Instant,
    ) -> Self {
        let payload_bits = payload.len() * 8;
        Self {
            reliability,
            channel,
            message_number: None,
            ordering_index: None,
            sequencing_index: None,
            split: None,
            payload,
            payload_bits,
            meta: FrameMeta::new(priority, receipt, now),
        }
    }

    /// Exact encoded size in bits, used when packing frames to the MTU.
    pub fn encoded_bits(&self) -> usize {
        let mut bits = 3 + 1; // reliability + has-split
        if self.reliability.is_ordered_or_sequenced() {
            bits += 5; // channel
        }
        bits += compressed_u16_bits(self.payload_bits as u16);
        if self.reliability.is_reliable() {
            bits += 24;
        }
        if self.reliability.is_ordered_or_sequenced() {
            bits += 24;
        }
        if self.reliability.is_sequenced() {
            bits += 24;
        }
        if self.split.is_some() {
            bits += 16 + 32 + 32;
        }
        bits + self.payload_bits
    }

    pub fn encoded_bytes(&self) -> usize {
        self.encoded_bits().div_ceil(8)
    }

    pub fn encode(&self, out: &mut BitStream) -> Result<()> {
        out.write_bits(&[self.reliability as u8], 3, true)?;
        if self.reliability.is_ordered_or_sequenced() {
            out.write_bits(&[self.channel], 5, true)?;
        }
        out.write_bit(self.split.is_some())?;
        out.write_compressed_u16(self.payload_bits as u16)?;
        if self.reliability.is_reliable() {
            out.write_u24(self.message_number.unwrap_or_default().get())?;
        }
        if self.reliability.is_ordered_or_sequenced() {
            out.write_u24(self.ordering_index.unwrap_or_default().get())?;
        }
        if self.reliability.is_sequenced() {
            out.write_u24(self.sequencing_index.unwrap_or_default().get())?;
        }
        if let Some(split) = &self.split {
            out.write_u16(split.id)?;
            out.write_u32(split.count)?;
            out.write_u32(split.index)?;
        }
        out.write_bits(&self.payload, self.payload_bits, true)?;
        Ok(())
    }

    pub fn decode(input: &mut BitStream, now: Instant) -> Result<Self> {
        let reliability_raw = input.read_bits(3, true)?[0];
        let reliability = Reliability::from_u8(reliability_raw).ok_or_else(|| {
            NetError::MalformedPacket(format!("invalid reliability {reliability_raw}"))
        })?;
        let channel = if reliability.is_ordered_or_sequenced() {
            input.read_bits(5, true)?[0]
        } else {
            0
        };
        let has_split = input.read_bit()?;
        let payload_bits = input.read_compressed_u16()? as usize;

        let message_number = if reliability.is_reliable() {
            Some(U24::new(input.read_u24()?))
        } else {
            None
        };
        let ordering_index = if reliability.is_ordered_or_sequenced() {
            Some(U24::new(input.read_u24()?))
        } else {
            None
        };
        let sequencing_index = if reliability.is_sequenced() {
            Some(U24::new(input.read_u24()?))
        } else {
            None
        };
        let split = if has_split {
            let id = input.read_u16()?;
            let count = input.read_u32()?;
            let index = input.read_u32()?;
            if count == 0 || index >= count {
                return Err(NetError::MalformedPacket(format!(
                    "split fragment {index} of {count}"
                )));
            }
            Some(SplitInfo { id, count, index })
        } else {
            None
        };

        if payload_bits > input.remaining_bits() {
            return Err(NetError::MalformedPacket(format!(
                "payload bit length {payload_bits} exceeds datagram ({} bits left)",
                input.remaining_bits()
            )));
        }
        let payload = Bytes::from(input.read_bits(payload_bits, true)?);

        Ok(Self {
            reliability,
            channel,
            message_number,
            ordering_index,
            sequencing_index,
            split,
            payload,
            payload_bits,
            meta: FrameMeta::new(Priority::Medium, None, now),
        })
    }
}
