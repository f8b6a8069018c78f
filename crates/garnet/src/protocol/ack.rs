//! Acknowledgement set: a sorted list of disjoint closed intervals of
//! received datagram numbers, serialized as run-length pairs with a
//! single-value bit for size-1 intervals.

use crate::error::{NetError, Result};
use garnet_binary::BitStream;

/// Upper bound on intervals decoded from one datagram. A hostile peer
/// declaring more is cut off and the datagram rejected.
const MAX_WIRE_INTERVALS: u16 = 4096;
/// Upper bound on the span of a single decoded interval.
const MAX_INTERVAL_SPAN: u32 = 65_536;

/// Sorted interval set over raw 24-bit datagram numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSet {
    /// Disjoint, non-touching `[min, max]` pairs, ascending by `min`.
    intervals: Vec<(u32, u32)>,
}

impl AckSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn intervals(&self) -> &[(u32, u32)] {
        &self.intervals
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    /// Inserts one datagram number, merging touching or overlapping
    /// neighbours. Any permutation of the same inserts yields the same
    /// interval list.
    pub fn insert(&mut self, n: u32) {
        let idx = match self.intervals.binary_search_by(|&(min, max)| {
            if n < min {
                std::cmp::Ordering::Greater
            } else if n > max {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(_) => return, // already covered
            Err(idx) => idx,
        };

        let touches_prev = idx > 0 && self.intervals[idx - 1].1.wrapping_add(1) == n;
        let touches_next =
            idx < self.intervals.len() && n.wrapping_add(1) == self.intervals[idx].0;
        match (touches_prev, touches_next) {
            (true, true) => {
                self.intervals[idx - 1].1 = self.intervals[idx].1;
                self.intervals.remove(idx);
            }
            (true, false) => self.intervals[idx - 1].1 = n,
            (false, true) => self.intervals[idx].0 = n,
            (false, false) => self.intervals.insert(idx, (n, n)),
        }
    }

    /// Iterates every number covered by the set.
    pub fn iter_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.intervals.iter().flat_map(|&(min, max)| min..=max)
    }

    /// Serializes the lowest intervals into `out`, bounded by
    /// `max_bytes` of wire budget; serialized intervals are removed and
    /// the rest retained for the next datagram. Returns how many
    /// intervals were written.
    pub fn serialize_limited(&mut self, out: &mut BitStream, max_bytes: usize) -> Result<usize> {
        let budget_bits = max_bytes.saturating_mul(8);
        // Reserve for the worst-case compressed u16 count prefix.
        let mut used_bits = 20usize;
        let mut count = 0usize;
        for &(min, max) in &self.intervals {
            let cost = if min == max { 1 + 24 } else { 1 + 48 };
            if used_bits + cost > budget_bits || count == u16::MAX as usize {
                break;
            }
            used_bits += cost;
            count += 1;
        }

        out.write_compressed_u16(count as u16)?;
        for &(min, max) in self.intervals.iter().take(count) {
            if min == max {
                out.write_bit(true)?;
                out.write_u24(min)?;
            } else {
                out.write_bit(false)?;
                out.write_u24(min)?;
                out.write_u24(max)?;
            }
        }
        self.intervals.drain(..count);
        Ok(count)
    }

    /// Serializes the whole set (tests and small sets).
    pub fn serialize(&mut self, out: &mut BitStream) -> Result<usize> {
        self.serialize_limited(out, usize::MAX / 16)
    }

    /// Decodes an interval list, rejecting impossible (`min > max`),
    /// non-monotonic or oversized encodings.
    pub fn deserialize(input: &mut BitStream) -> Result<Self> {
        let count = input.read_compressed_u16()?;
        if count > MAX_WIRE_INTERVALS {
            return Err(NetError::MalformedPacket(format!(
                "ack set declares {count} intervals"
            )));
        }
        let mut intervals = Vec::with_capacity(count as usize);
        let mut prev_max: Option<u32> = None;
        for _ in 0..count {
            let single = input.read_bit()?;
            let min = input.read_u24()?;
            let max = if single { min } else { input.read_u24()? };
            if min > max {
                return Err(NetError::MalformedPacket(format!(
                    "ack interval min {min} > max {max}"
                )));
            }
            if max - min > MAX_INTERVAL_SPAN {
                return Err(NetError::MalformedPacket(format!(
                    "ack interval span {} too large",
                    max - min
                )));
            }
            if let Some(prev) = prev_max {
                if min <= prev {
                    return Err(NetError::MalformedPacket(
                        "ack intervals not monotonic".into(),
                    ));
                }
            }
            prev_max = Some(max);
            intervals.push((min, max));
        }
        Ok(Self { intervals })
    }
}
