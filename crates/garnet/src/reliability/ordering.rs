//! Per-channel delivery buffers: ordered channels hold out-of-order
//! arrivals until the run is contiguous; sequenced channels deliver only
//! forward progress and silently drop stale arrivals.

use crate::protocol::frame::Frame;
use crate::protocol::number::U24;
use std::collections::BTreeMap;
use tracing::warn;

/// Number of independent ordering channels per connection.
pub const CHANNEL_COUNT: usize = 32;

/// Out-of-order frames an ordered channel will hold before shedding new
/// arrivals.
const MAX_HELD_PER_CHANNEL: usize = 512;

#[derive(Debug, Default)]
struct OrderedChannel {
    /// Next ordering index to deliver.
    expected: U24,
    /// Parked arrivals keyed by raw ordering index.
    held: BTreeMap<u32, Frame>,
}

#[derive(Debug, Default)]
struct SequencedChannel {
    /// Most recent sequencing index delivered.
    latest: Option<U24>,
}

/// All 32 channels' worth of ordering and sequencing state.
#[derive(Debug)]
pub struct DeliveryBuffers {
    ordered: Vec<OrderedChannel>,
    sequenced: Vec<SequencedChannel>,
}

impl Default for DeliveryBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryBuffers {
    pub fn new() -> Self {
        Self {
            ordered: (0..CHANNEL_COUNT).map(|_| OrderedChannel::default()).collect(),
            sequenced: (0..CHANNEL_COUNT)
                .map(|_| SequencedChannel::default())
                .collect(),
        }
    }

    /// Offers an ordered frame. Returns every frame now deliverable, in
    /// channel order; empty when the frame was parked or was stale.
    pub fn on_ordered(&mut self, frame: Frame) -> Vec<Frame> {
        let channel = (frame.channel as usize) % CHANNEL_COUNT;
        let Some(index) = frame.ordering_index else {
            warn!(channel, "ordered frame without ordering index dropped");
            return Vec::new();
        };
        let state = &mut self.ordered[channel];

        if index == state.expected {
            let mut ready = vec![frame];
            state.expected = state.expected.wrapping_add(1);
            while let Some(next) = state.held.remove(&state.expected.get()) {
                ready.push(next);
                state.expected = state.expected.wrapping_add(1);
            }
            return ready;
        }

        if index.after(state.expected) {
            if state.held.len() >= MAX_HELD_PER_CHANNEL {
                warn!(
                    channel,
                    index = index.get(),
                    "ordering buffer full, shedding out-of-order frame"
                );
                return Vec::new();
            }
            state.held.entry(index.get()).or_insert(frame);
            return Vec::new();
        }

        // Behind the expected index: an ordered duplicate.
        Vec::new()
    }

    /// Offers a sequenced frame. Returns it when it advances the
    /// channel's high-water mark, `None` when stale.
    pub fn on_sequenced(&mut self, frame: Frame) -> Option<Frame> {
        let channel = (frame.channel as usize) % CHANNEL_COUNT;
        let Some(index) = frame.sequencing_index else {
            warn!(channel, "sequenced frame without sequencing index dropped");
            return None;
        };
        let state = &mut self.sequenced[channel];
        match state.latest {
            Some(latest) if !index.after(latest) => None,
            _ => {
                state.latest = Some(index);
                Some(frame)
            }
        }
    }

    /// Frames currently parked across all ordered channels.
    pub fn held_count(&self) -> usize {
        self.ordered.iter().map(|c| c.held.len()).sum()
    }
}
