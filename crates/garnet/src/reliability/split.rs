//! Split-packet reassembly: per-peer records accumulating the fragments
//! of one logical message, bounded in count and in memory so a remote
//! cannot force unbounded allocation.

use crate::error::{NetError, Result};
use crate::protocol::frame::Frame;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Hard cap on fragments in one logical message, independent of config.
pub const MAX_FRAGMENTS_PER_MESSAGE: u32 = 4096;
/// Incomplete records older than this are swept.
const STALE_RECORD_AGE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct SplitRecord {
    count: u32,
    received: u32,
    /// Payload and bit length per fragment slot.
    parts: Vec<Option<(Bytes, usize)>>,
    started: Instant,
    /// Metadata of the logical message, taken from the first fragment.
    prototype: Frame,
}

/// Per-peer reassembly table keyed by split-packet id.
#[derive(Debug)]
pub struct SplitTable {
    records: HashMap<u16, SplitRecord>,
    max_records: usize,
    max_bytes: usize,
    bytes_used: usize,
}

impl SplitTable {
    pub fn new(max_records: usize, max_bytes: usize) -> Self {
        Self {
            records: HashMap::new(),
            max_records,
            max_bytes,
            bytes_used: 0,
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Inserts one fragment. `Ok(Some(frame))` is the reassembled
    /// logical message; `Ok(None)` means more fragments are needed.
    /// Budget violations fail without allocating.
    pub fn insert(&mut self, frame: Frame, now: Instant) -> Result<Option<Frame>> {
        let split = frame
            .split
            .ok_or_else(|| NetError::MalformedPacket("fragment without split info".into()))?;
        if split.count > MAX_FRAGMENTS_PER_MESSAGE {
            return Err(NetError::ReassemblyBudgetExceeded(format!(
                "fragment count {} over cap {MAX_FRAGMENTS_PER_MESSAGE}",
                split.count
            )));
        }

        if let Some(existing) = self.records.get(&split.id) {
            if existing.count != split.count {
                // Same id reused with a different geometry; the old
                // record can never complete.
                let dropped = self.records.remove(&split.id).expect("present");
                self.bytes_used -= dropped.stored_bytes();
                return Err(NetError::MalformedPacket(format!(
                    "split id {} count changed {} -> {}",
                    split.id, dropped.count, split.count
                )));
            }
        } else {
            if self.records.len() >= self.max_records {
                return Err(NetError::ReassemblyBudgetExceeded(format!(
                    "{} concurrent split records",
                    self.records.len()
                )));
            }
            trace!(split_id = split.id, count = split.count, "new split record");
            self.records.insert(
                split.id,
                SplitRecord {
                    count: split.count,
                    received: 0,
                    parts: vec![None; split.count as usize],
                    started: now,
                    prototype: Frame {
                        payload: Bytes::new(),
                        payload_bits: 0,
                        split: None,
                        ..frame.clone()
                    },
                },
            );
        }
        let record = self.records.get_mut(&split.id).expect("just checked");

        let slot = split.index as usize;
        if record.parts[slot].is_some() {
            // Duplicate fragment; free the repeat without overwriting.
            trace!(split_id = split.id, index = split.index, "duplicate fragment");
            return Ok(None);
        }
        if self.bytes_used + frame.payload.len() > self.max_bytes {
            return Err(NetError::ReassemblyBudgetExceeded(format!(
                "{} + {} bytes over reassembly cap {}",
                self.bytes_used,
                frame.payload.len(),
                self.max_bytes
            )));
        }
        self.bytes_used += frame.payload.len();
        record.parts[slot] = Some((frame.payload, frame.payload_bits));
        record.received += 1;

        if record.received < record.count {
            return Ok(None);
        }

        // Complete: concatenate payloads, sum bit lengths.
        let record = self.records.remove(&split.id).expect("present");
        self.bytes_used -= record.stored_bytes();
        let total_bytes: usize = record
            .parts
            .iter()
            .map(|p| p.as_ref().expect("complete").0.len())
            .sum();
        let mut payload = BytesMut::with_capacity(total_bytes);
        let mut payload_bits = 0usize;
        for part in record.parts {
            let (bytes, bits) = part.expect("complete");
            payload.extend_from_slice(&bytes);
            payload_bits += bits;
        }
        debug!(
            split_id = split.id,
            fragments = record.count,
            bytes = total_bytes,
            "split message reassembled"
        );
        let mut assembled = record.prototype;
        assembled.payload = payload.freeze();
        assembled.payload_bits = payload_bits;
        Ok(Some(assembled))
    }

    /// Drops incomplete records that have been waiting too long.
    pub fn sweep_stale(&mut self, now: Instant) {
        let before = self.records.len();
        let mut freed = 0usize;
        self.records.retain(|id, record| {
            let keep = now.saturating_duration_since(record.started) <= STALE_RECORD_AGE;
            if !keep {
                debug!(split_id = id, "dropping stale split record");
                freed += record.stored_bytes();
            }
            keep
        });
        self.bytes_used -= freed;
        if before != self.records.len() {
            trace!(removed = before - self.records.len(), "split table sweep");
        }
    }
}

impl SplitRecord {
    fn stored_bytes(&self) -> usize {
        self.parts
            .iter()
            .flatten()
            .map(|(bytes, _)| bytes.len())
            .sum()
    }
}
