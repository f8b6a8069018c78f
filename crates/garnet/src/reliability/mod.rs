//! The per-peer reliability layer: packetization, retransmission, ACK
//! scheduling, duplicate suppression, fragmentation and ordered delivery,
//! composed from the submodules here. The layer performs no I/O; it
//! consumes inbound datagram bytes and produces outbound datagram bytes
//! for its owner to put on the socket.

pub mod congestion;
pub mod dedup;
pub mod ordering;
pub mod split;

use crate::error::{NetError, Result};
use crate::protocol::datagram::{Datagram, DATA_HEADER_BYTES};
use crate::protocol::frame::{Frame, SplitInfo};
use crate::protocol::number::U24;
use crate::protocol::reliability::{Priority, Reliability};
use crate::protocol::AckSet;
use bytes::Bytes;
use congestion::CongestionControl;
use dedup::{DedupWindow, Offer};
use ordering::{DeliveryBuffers, CHANNEL_COUNT};
use split::{SplitTable, MAX_FRAGMENTS_PER_MESSAGE};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Worst-case frame header: reliability + channel + split flag +
/// compressed length + three 24-bit counters + split triple.
const FRAME_OVERHEAD_BYTES: usize = 23;
/// Smallest useful frame for budget checks.
const MIN_FRAME_BYTES: usize = 3;
/// Datagram numbers tracked on the receive side.
const RECEIVE_WINDOW: usize = 4096;
/// Reliable message numbers tracked for duplicate suppression.
const DEDUP_WINDOW: usize = 4096;
/// Outbound frames queued across all priorities before sends fail.
const SEND_QUEUE_HIGH_WATERMARK: usize = 65_536;

/// Tuning knobs the session distills from the peer [`crate::Config`].
#[derive(Debug, Clone)]
pub struct LayerConfig {
    pub mtu: usize,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub ack_delay: Duration,
    pub max_send_attempts: u32,
    pub max_split_records: usize,
    pub max_reassembly_bytes: usize,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            mtu: 1492,
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_millis(3000),
            ack_delay: Duration::from_millis(5),
            max_send_attempts: 10,
            max_split_records: 64,
            max_reassembly_bytes: 8 * 1024 * 1024,
        }
    }
}

/// What the layer surfaces to its owner.
#[derive(Debug)]
pub enum LayerEvent {
    /// A deliverable message (reassembled and order-resolved).
    Message(Frame),
    /// A with-receipt send was acknowledged end to end.
    ReceiptAcked(u32),
    /// A with-receipt send is gone: datagram lost without retransmission,
    /// or the connection died first.
    ReceiptLoss(u32),
}

/// One peer's reliability state machine.
#[derive(Debug)]
pub struct ReliabilityLayer {
    cfg: LayerConfig,

    // Outbound.
    queues: [VecDeque<Frame>; Priority::COUNT],
    queued_frames: usize,
    next_message_number: U24,
    next_ordering: [U24; CHANNEL_COUNT],
    next_sequencing: [U24; CHANNEL_COUNT],
    next_split_id: u16,
    next_datagram: U24,
    /// In-flight reliable frames keyed by message number, iterable in
    /// number order.
    resend: BTreeMap<u32, Frame>,
    /// Message numbers due for retransmission, oldest first.
    retransmit_queue: VecDeque<u32>,
    /// Reliable message numbers carried by each sent datagram.
    datagram_messages: HashMap<u32, Vec<u32>>,
    /// Receipt tags of unreliable-with-receipt frames per datagram.
    datagram_unreliable_receipts: HashMap<u32, Vec<u32>>,
    /// Outstanding fragment count per reliable receipt tag.
    reliable_receipts: HashMap<u32, usize>,
    congestion: CongestionControl,

    // Inbound.
    datagram_window: DedupWindow,
    highest_datagram_seen: Option<U24>,
    acks: AckSet,
    ack_pending_since: Option<Instant>,
    naks: AckSet,
    dedup: DedupWindow,
    buffers: DeliveryBuffers,
    splits: SplitTable,

    // Liveness.
    last_send: Instant,
    last_recv: Instant,
    events: VecDeque<LayerEvent>,
    dead: bool,
}

impl ReliabilityLayer {
    pub fn new(cfg: LayerConfig, now: Instant) -> Self {
        let congestion = CongestionControl::new(cfg.mtu, cfg.min_rto, cfg.max_rto);
        let splits = SplitTable::new(cfg.max_split_records, cfg.max_reassembly_bytes);
        Self {
            cfg,
            queues: Default::default(),
            queued_frames: 0,
            next_message_number: U24::ZERO,
            next_ordering: [U24::ZERO; CHANNEL_COUNT],
            next_sequencing: [U24::ZERO; CHANNEL_COUNT],
            next_split_id: 0,
            next_datagram: U24::ZERO,
            resend: BTreeMap::new(),
            retransmit_queue: VecDeque::new(),
            datagram_messages: HashMap::new(),
            datagram_unreliable_receipts: HashMap::new(),
            reliable_receipts: HashMap::new(),
            congestion,
            datagram_window: DedupWindow::new(RECEIVE_WINDOW),
            highest_datagram_seen: None,
            acks: AckSet::new(),
            ack_pending_since: None,
            naks: AckSet::new(),
            dedup: DedupWindow::new(DEDUP_WINDOW),
            buffers: DeliveryBuffers::new(),
            splits,
            last_send: now,
            last_recv: now,
            events: VecDeque::new(),
            dead: false,
        }
    }

    /// Largest single-frame payload; anything bigger is fragmented.
    pub fn fragment_payload_len(&self) -> usize {
        self.cfg.mtu - DATA_HEADER_BYTES - FRAME_OVERHEAD_BYTES
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Whether every queued and in-flight reliable frame has been
    /// resolved; gates graceful disconnect.
    pub fn is_drained(&self) -> bool {
        self.queued_frames == 0 && self.resend.is_empty() && self.retransmit_queue.is_empty()
    }

    pub fn idle_send(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_send)
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_recv)
    }

    pub fn poll_event(&mut self) -> Option<LayerEvent> {
        self.events.pop_front()
    }

    // --- Send path ---

    /// Queues one application message, fragmenting when it exceeds the
    /// per-frame payload budget.
    pub fn send(
        &mut self,
        payload: Bytes,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        receipt: Option<u32>,
        now: Instant,
    ) -> Result<()> {
        if self.dead {
            return Err(NetError::Shutdown);
        }
        if channel as usize >= CHANNEL_COUNT {
            return Err(NetError::InvalidChannel(channel));
        }
        if self.queued_frames >= SEND_QUEUE_HIGH_WATERMARK {
            return Err(NetError::QueueFull);
        }
        if receipt.is_some() != reliability.wants_receipt() {
            return Err(NetError::InvalidParameter(
                "receipt tag requires a WithAckReceipt reliability mode, and vice versa".into(),
            ));
        }

        let fragment_payload = self.fragment_payload_len();
        if payload.len() <= fragment_payload {
            let mut frame = Frame::new(reliability, channel, payload, priority, receipt, now);
            self.stamp_indices(&mut frame);
            if let (true, Some(r)) = (reliability.is_reliable() && reliability.wants_receipt(), receipt)
            {
                *self.reliable_receipts.entry(r).or_insert(0) += 1;
            }
            self.enqueue(frame);
            return Ok(());
        }

        // Fragmented: every piece must arrive, so unreliable modes are
        // promoted to their reliable counterparts.
        let reliability = reliability.promoted_for_split();
        let count = payload.len().div_ceil(fragment_payload);
        if count as u32 > MAX_FRAGMENTS_PER_MESSAGE {
            return Err(NetError::InvalidParameter(format!(
                "payload of {} bytes needs {count} fragments (cap {MAX_FRAGMENTS_PER_MESSAGE})",
                payload.len()
            )));
        }
        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);

        let (ordering_index, sequencing_index) = self.logical_indices(reliability, channel);
        if let (true, Some(r)) = (reliability.wants_receipt(), receipt) {
            *self.reliable_receipts.entry(r).or_insert(0) += count;
        }
        for index in 0..count {
            let start = index * fragment_payload;
            let end = (start + fragment_payload).min(payload.len());
            let mut frame = Frame::new(
                reliability,
                channel,
                payload.slice(start..end),
                priority,
                receipt,
                now,
            );
            frame.message_number = Some(self.next_message_number.fetch_inc());
            frame.ordering_index = ordering_index;
            frame.sequencing_index = sequencing_index;
            frame.split = Some(SplitInfo {
                id: split_id,
                count: count as u32,
                index: index as u32,
            });
            self.enqueue(frame);
        }
        Ok(())
    }

    fn enqueue(&mut self, frame: Frame) {
        self.queued_frames += 1;
        self.queues[frame.meta.priority.index()].push_back(frame);
    }

    /// Assigns the counters one logical (possibly fragmented) message
    /// consumes for its reliability mode.
    fn logical_indices(
        &mut self,
        reliability: Reliability,
        channel: u8,
    ) -> (Option<U24>, Option<U24>) {
        let ch = channel as usize;
        if reliability.is_ordered() {
            (Some(self.next_ordering[ch].fetch_inc()), None)
        } else if reliability.is_sequenced() {
            // Sequenced messages ride the current ordering generation
            // without advancing it.
            (
                Some(self.next_ordering[ch]),
                Some(self.next_sequencing[ch].fetch_inc()),
            )
        } else {
            (None, None)
        }
    }

    fn stamp_indices(&mut self, frame: &mut Frame) {
        if frame.reliability.is_reliable() {
            frame.message_number = Some(self.next_message_number.fetch_inc());
        }
        let (ordering, sequencing) = self.logical_indices(frame.reliability, frame.channel);
        frame.ordering_index = ordering;
        frame.sequencing_index = sequencing;
    }

    // --- Receive path ---

    /// Feeds one inbound datagram. Wire-format violations return
    /// `MalformedPacket`; resource refusals return
    /// `ReassemblyBudgetExceeded`; both leave the connection up.
    pub fn on_datagram(&mut self, bytes: Bytes, now: Instant) -> Result<()> {
        self.last_recv = now;
        match Datagram::decode(bytes, now)? {
            Datagram::Ack { is_nak, set, .. } => {
                if is_nak {
                    self.on_nak_set(&set);
                } else {
                    self.on_ack_set(&set, now);
                }
                Ok(())
            }
            Datagram::Data { header, frames, .. } => {
                match self.datagram_window.offer(header.number) {
                    Offer::Duplicate => {
                        // Re-acknowledge so a lost ACK cannot cause an
                        // endless retransmission cycle.
                        self.acks.insert(header.number.get());
                        self.note_ack_pending(now);
                        return Ok(());
                    }
                    Offer::BeyondWindow => {
                        warn!(
                            number = header.number.get(),
                            "datagram beyond receive window, dropped"
                        );
                        return Ok(());
                    }
                    Offer::Fresh => {}
                }
                self.acks.insert(header.number.get());
                self.note_ack_pending(now);

                // Gap between the highest seen and this arrival: record
                // NAKs so the sender retransmits without waiting out the
                // full RTO.
                let next_expected = self
                    .highest_datagram_seen
                    .map(|h| h.wrapping_add(1))
                    .unwrap_or(U24::ZERO);
                if header.number.after(next_expected) {
                    let mut missing = next_expected;
                    while missing != header.number {
                        self.naks.insert(missing.get());
                        missing = missing.wrapping_add(1);
                    }
                }
                if self
                    .highest_datagram_seen
                    .is_none_or(|h| header.number.after(h))
                {
                    self.highest_datagram_seen = Some(header.number);
                }

                for frame in frames {
                    self.process_frame(frame, now)?;
                }
                Ok(())
            }
        }
    }

    fn process_frame(&mut self, frame: Frame, now: Instant) -> Result<()> {
        if frame.reliability.is_reliable() {
            let Some(message_number) = frame.message_number else {
                return Err(NetError::MalformedPacket(
                    "reliable frame without message number".into(),
                ));
            };
            match self.dedup.offer(message_number) {
                Offer::Duplicate => {
                    trace!(number = message_number.get(), "duplicate reliable frame");
                    return Ok(());
                }
                Offer::BeyondWindow => {
                    warn!(
                        number = message_number.get(),
                        "reliable frame beyond dedup window, dropped"
                    );
                    return Ok(());
                }
                Offer::Fresh => {}
            }
        }

        let frame = if frame.split.is_some() {
            match self.splits.insert(frame, now)? {
                Some(whole) => whole,
                None => return Ok(()),
            }
        } else {
            frame
        };

        if frame.reliability.is_sequenced() {
            if let Some(ready) = self.buffers.on_sequenced(frame) {
                self.events.push_back(LayerEvent::Message(ready));
            }
        } else if frame.reliability.is_ordered() {
            for ready in self.buffers.on_ordered(frame) {
                self.events.push_back(LayerEvent::Message(ready));
            }
        } else {
            self.events.push_back(LayerEvent::Message(frame));
        }
        Ok(())
    }

    fn note_ack_pending(&mut self, now: Instant) {
        if self.ack_pending_since.is_none() {
            self.ack_pending_since = Some(now);
        }
    }

    fn on_ack_set(&mut self, set: &AckSet, now: Instant) {
        for number in set.iter_numbers() {
            self.congestion.on_ack(number, now);
            if let Some(messages) = self.datagram_messages.remove(&number) {
                for message in messages {
                    if let Some(frame) = self.resend.remove(&message) {
                        if let Some(receipt) = frame.meta.receipt {
                            self.credit_reliable_receipt(receipt);
                        }
                    }
                }
            }
            if let Some(receipts) = self.datagram_unreliable_receipts.remove(&number) {
                for receipt in receipts {
                    self.events.push_back(LayerEvent::ReceiptAcked(receipt));
                }
            }
        }
    }

    fn credit_reliable_receipt(&mut self, receipt: u32) {
        if let Some(outstanding) = self.reliable_receipts.get_mut(&receipt) {
            *outstanding -= 1;
            if *outstanding == 0 {
                self.reliable_receipts.remove(&receipt);
                self.events.push_back(LayerEvent::ReceiptAcked(receipt));
            }
        }
    }

    fn on_nak_set(&mut self, set: &AckSet) {
        let mut lost_any = false;
        for number in set.iter_numbers() {
            self.congestion.forget(number);
            if let Some(messages) = self.datagram_messages.remove(&number) {
                for message in messages {
                    if self.resend.contains_key(&message)
                        && !self.retransmit_queue.contains(&message)
                    {
                        self.retransmit_queue.push_back(message);
                        lost_any = true;
                    }
                }
            }
            if let Some(receipts) = self.datagram_unreliable_receipts.remove(&number) {
                for receipt in receipts {
                    self.events.push_back(LayerEvent::ReceiptLoss(receipt));
                }
            }
        }
        if lost_any {
            self.congestion.on_loss();
        }
    }

    // --- Framing and send ticking ---

    /// Drives timers and produces the datagrams that should leave now:
    /// NAKs immediately, retransmissions and new data within the
    /// congestion budget, then coalesced ACKs after `ack_delay`.
    pub fn update(&mut self, now: Instant, now_micros: u32) -> Result<Vec<Bytes>> {
        let mut wire = Vec::new();
        self.handle_rto(now);
        self.splits.sweep_stale(now);

        while !self.naks.is_empty() {
            wire.push(Datagram::encode_ack(
                self.next_datagram,
                true,
                &mut self.naks,
                self.cfg.mtu,
            )?);
        }

        while !self.dead {
            if self.congestion.may_send_bytes() < DATA_HEADER_BYTES + MIN_FRAME_BYTES {
                break;
            }
            let frames = self.gather_frames(now);
            if frames.is_empty() {
                break;
            }
            let number = self.next_datagram.fetch_inc();
            let mut reliable_messages = Vec::new();
            let mut unreliable_receipts = Vec::new();
            for frame in &frames {
                if frame.reliability.is_reliable() {
                    if let Some(message) = frame.message_number {
                        reliable_messages.push(message.get());
                    }
                } else if let Some(receipt) = frame.meta.receipt {
                    unreliable_receipts.push(receipt);
                }
            }
            let bytes = Datagram::encode_data(number, now_micros, &frames)?;
            self.congestion.on_datagram_sent(number, bytes.len(), now);
            if !reliable_messages.is_empty() {
                self.datagram_messages.insert(number.get(), reliable_messages);
            }
            if !unreliable_receipts.is_empty() {
                self.datagram_unreliable_receipts
                    .insert(number.get(), unreliable_receipts);
            }
            self.last_send = now;
            wire.push(bytes);
        }

        if !self.acks.is_empty() {
            let due = self
                .ack_pending_since
                .is_none_or(|since| now.saturating_duration_since(since) >= self.cfg.ack_delay);
            if due {
                while !self.acks.is_empty() {
                    wire.push(Datagram::encode_ack(
                        self.next_datagram,
                        false,
                        &mut self.acks,
                        self.cfg.mtu,
                    )?);
                }
                self.ack_pending_since = None;
            }
        }
        Ok(wire)
    }

    /// Immediately flushes pending ACKs regardless of the coalescing
    /// delay; used when the owner is about to go quiet.
    pub fn flush_acks(&mut self) -> Result<Vec<Bytes>> {
        let mut wire = Vec::new();
        while !self.acks.is_empty() {
            wire.push(Datagram::encode_ack(
                self.next_datagram,
                false,
                &mut self.acks,
                self.cfg.mtu,
            )?);
        }
        self.ack_pending_since = None;
        Ok(wire)
    }

    fn handle_rto(&mut self, now: Instant) {
        let expired = self.congestion.timed_out(now);
        if expired.is_empty() {
            return;
        }
        self.congestion.on_loss();
        self.congestion.backoff_rto();
        for number in expired {
            self.congestion.forget(number);
            if let Some(messages) = self.datagram_messages.remove(&number) {
                for message in messages {
                    if self.resend.contains_key(&message)
                        && !self.retransmit_queue.contains(&message)
                    {
                        trace!(message, "retransmission due after RTO");
                        self.retransmit_queue.push_back(message);
                    }
                }
            }
            if let Some(receipts) = self.datagram_unreliable_receipts.remove(&number) {
                for receipt in receipts {
                    self.events.push_back(LayerEvent::ReceiptLoss(receipt));
                }
            }
        }
    }

    /// Packs one datagram's worth of frames: due retransmissions first,
    /// then new frames from the highest non-empty priority class.
    fn gather_frames(&mut self, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        let cap_bits = self.cfg.mtu.saturating_sub(DATA_HEADER_BYTES) * 8;
        let mut bits = 0usize;
        let rto = self.congestion.rto();

        while let Some(&message) = self.retransmit_queue.front() {
            let Some(entry) = self.resend.get_mut(&message) else {
                // Acked between scheduling and sending.
                self.retransmit_queue.pop_front();
                continue;
            };
            let frame_bits = entry.encoded_bits();
            if !frames.is_empty() && bits + frame_bits > cap_bits {
                return frames;
            }
            self.retransmit_queue.pop_front();
            entry.meta.send_attempts += 1;
            entry.meta.next_action = Some(now + rto);
            if entry.meta.send_attempts > self.cfg.max_send_attempts {
                warn!(message, attempts = entry.meta.send_attempts, "send attempts exhausted");
                self.declare_dead();
                return Vec::new();
            }
            bits += frame_bits;
            frames.push(entry.clone());
        }

        'priorities: for queue in self.queues.iter_mut() {
            while let Some(front) = queue.front() {
                let frame_bits = front.encoded_bits();
                if !frames.is_empty() && bits + frame_bits > cap_bits {
                    break 'priorities;
                }
                let mut frame = queue.pop_front().expect("front checked");
                self.queued_frames -= 1;
                frame.meta.send_attempts = 1;
                frame.meta.next_action = Some(now + rto);
                bits += frame_bits;
                if frame.reliability.is_reliable() {
                    if let Some(message) = frame.message_number {
                        self.resend.insert(message.get(), frame.clone());
                    }
                }
                frames.push(frame);
            }
        }
        frames
    }

    /// Terminal transition: the connection is gone. Every unresolved
    /// receipt reports exactly one loss; all outbound state is dropped.
    pub fn declare_dead(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;
        for (receipt, _) in self.reliable_receipts.drain() {
            self.events.push_back(LayerEvent::ReceiptLoss(receipt));
        }
        for (_, receipts) in self.datagram_unreliable_receipts.drain() {
            for receipt in receipts {
                self.events.push_back(LayerEvent::ReceiptLoss(receipt));
            }
        }
        for queue in self.queues.iter_mut() {
            for frame in queue.drain(..) {
                if !frame.reliability.is_reliable() {
                    if let Some(receipt) = frame.meta.receipt {
                        self.events.push_back(LayerEvent::ReceiptLoss(receipt));
                    }
                }
            }
        }
        self.queued_frames = 0;
        self.resend.clear();
        self.retransmit_queue.clear();
        self.datagram_messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn test_config() -> LayerConfig {
        LayerConfig {
            mtu: 1200,
            min_rto: Duration::from_millis(5),
            max_rto: Duration::from_millis(50),
            ack_delay: Duration::ZERO,
            ..LayerConfig::default()
        }
    }

    fn pair() -> (ReliabilityLayer, ReliabilityLayer) {
        let now = Instant::now();
        (
            ReliabilityLayer::new(test_config(), now),
            ReliabilityLayer::new(test_config(), now),
        )
    }

    /// Feeds every datagram from `from` into `to`, returning how many
    /// were transferred.
    fn pump(from: &mut ReliabilityLayer, to: &mut ReliabilityLayer) -> usize {
        let now = Instant::now();
        let datagrams = from.update(now, 0).unwrap();
        let n = datagrams.len();
        for d in datagrams {
            to.on_datagram(d, now).unwrap();
        }
        n
    }

    fn messages(layer: &mut ReliabilityLayer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(event) = layer.poll_event() {
            if let LayerEvent::Message(frame) = event {
                out.push(frame.payload.to_vec());
            }
        }
        out
    }

    #[test]
    fn simple_reliable_delivery() {
        let (mut a, mut b) = pair();
        a.send(
            Bytes::from_static(b"hello"),
            Priority::Medium,
            Reliability::ReliableOrdered,
            0,
            None,
            Instant::now(),
        )
        .unwrap();
        pump(&mut a, &mut b);
        assert_eq!(messages(&mut b), vec![b"hello".to_vec()]);
        // ACK travels back and clears the resend table.
        pump(&mut b, &mut a);
        assert!(a.is_drained());
    }

    #[test]
    fn several_messages_pack_into_one_datagram() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        for i in 0..10u8 {
            a.send(
                Bytes::copy_from_slice(&[i]),
                Priority::Medium,
                Reliability::ReliableOrdered,
                0,
                None,
                now,
            )
            .unwrap();
        }
        let sent = pump(&mut a, &mut b);
        assert_eq!(sent, 1);
        let got = messages(&mut b);
        assert_eq!(got.len(), 10);
        assert_eq!(got[3], vec![3]);
    }

    #[test]
    fn duplicate_datagram_is_suppressed_but_reacked() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        a.send(
            Bytes::from_static(b"once"),
            Priority::Medium,
            Reliability::Reliable,
            0,
            None,
            now,
        )
        .unwrap();
        let datagrams = a.update(now, 0).unwrap();
        assert_eq!(datagrams.len(), 1);
        b.on_datagram(datagrams[0].clone(), now).unwrap();
        b.on_datagram(datagrams[0].clone(), now).unwrap();
        assert_eq!(messages(&mut b).len(), 1);
        // The duplicate still generates an acknowledgement.
        let acks = b.update(Instant::now(), 0).unwrap();
        assert!(!acks.is_empty());
    }

    #[test]
    fn lost_datagram_retransmits_on_rto() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        a.send(
            Bytes::from_static(b"persist"),
            Priority::Medium,
            Reliability::Reliable,
            0,
            None,
            now,
        )
        .unwrap();
        // First transmission is dropped on the floor.
        let lost = a.update(now, 0).unwrap();
        assert_eq!(lost.len(), 1);

        // After the (max-clamped) RTO the frame goes out again.
        sleep(Duration::from_millis(60));
        let retry = a.update(Instant::now(), 0).unwrap();
        assert_eq!(retry.len(), 1);
        b.on_datagram(retry[0].clone(), Instant::now()).unwrap();
        assert_eq!(messages(&mut b), vec![b"persist".to_vec()]);
    }

    #[test]
    fn nak_triggers_fast_retransmit() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        for tag in [b'x', b'y'] {
            a.send(
                Bytes::copy_from_slice(&[tag]),
                Priority::Medium,
                Reliability::Reliable,
                0,
                None,
                now,
            )
            .unwrap();
        }
        // Force two datagrams by sending, pumping, sending.
        let first = a.update(now, 0).unwrap();
        assert_eq!(first.len(), 1);
        a.send(
            Bytes::from_static(b"z"),
            Priority::Medium,
            Reliability::Reliable,
            0,
            None,
            now,
        )
        .unwrap();
        let second = a.update(now, 0).unwrap();
        assert_eq!(second.len(), 1);

        // Deliver only the second; the receiver NAKs the gap.
        b.on_datagram(second[0].clone(), now).unwrap();
        let replies = b.update(now, 0).unwrap();
        // NAK for datagram 0 plus the ACK for datagram 1.
        assert_eq!(replies.len(), 2);
        for r in replies {
            a.on_datagram(r, now).unwrap();
        }
        // The NAK queued the first datagram's frames for retransmission.
        let retry = a.update(now, 0).unwrap();
        assert_eq!(retry.len(), 1);
        b.on_datagram(retry[0].clone(), now).unwrap();
        let mut got = messages(&mut b);
        got.sort();
        assert_eq!(got, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn large_payload_fragments_and_reassembles() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        a.send(
            Bytes::from(payload.clone()),
            Priority::Medium,
            Reliability::ReliableOrdered,
            0,
            None,
            now,
        )
        .unwrap();

        // Pump until everything arrives; ACKs flow back to open the
        // congestion window.
        for _ in 0..64 {
            pump(&mut a, &mut b);
            pump(&mut b, &mut a);
            if a.is_drained() {
                break;
            }
        }
        let got = messages(&mut b);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], payload);
    }

    #[test]
    fn reliable_receipt_acked_exactly_once() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        a.send(
            Bytes::from_static(b"tracked"),
            Priority::Medium,
            Reliability::ReliableWithAckReceipt,
            0,
            Some(42),
            now,
        )
        .unwrap();
        pump(&mut a, &mut b);
        pump(&mut b, &mut a);

        let mut acked = Vec::new();
        while let Some(event) = a.poll_event() {
            if let LayerEvent::ReceiptAcked(r) = event {
                acked.push(r);
            }
        }
        assert_eq!(acked, vec![42]);
        // Nothing further on later updates.
        assert!(a.poll_event().is_none());
    }

    #[test]
    fn receipts_lost_on_death() {
        let (mut a, _b) = pair();
        let now = Instant::now();
        for receipt in 1..=5u32 {
            a.send(
                Bytes::from_static(b"doomed"),
                Priority::Medium,
                Reliability::ReliableWithAckReceipt,
                0,
                Some(receipt),
                now,
            )
            .unwrap();
        }
        a.declare_dead();
        let mut lost = Vec::new();
        while let Some(event) = a.poll_event() {
            match event {
                LayerEvent::ReceiptLoss(r) => lost.push(r),
                LayerEvent::ReceiptAcked(_) => panic!("no acks expected"),
                LayerEvent::Message(_) => {}
            }
        }
        lost.sort_unstable();
        assert_eq!(lost, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn send_after_death_fails() {
        let (mut a, _b) = pair();
        a.declare_dead();
        assert!(matches!(
            a.send(
                Bytes::from_static(b"late"),
                Priority::Medium,
                Reliability::Reliable,
                0,
                None,
                Instant::now(),
            ),
            Err(NetError::Shutdown)
        ));
    }

    #[test]
    fn invalid_channel_rejected() {
        let (mut a, _b) = pair();
        assert!(matches!(
            a.send(
                Bytes::from_static(b"nope"),
                Priority::Medium,
                Reliability::ReliableOrdered,
                32,
                None,
                Instant::now(),
            ),
            Err(NetError::InvalidChannel(32))
        ));
    }

    #[test]
    fn unreliable_is_fire_and_forget() {
        let (mut a, mut b) = pair();
        a.send(
            Bytes::from_static(b"blip"),
            Priority::Medium,
            Reliability::Unreliable,
            0,
            None,
            Instant::now(),
        )
        .unwrap();
        pump(&mut a, &mut b);
        assert_eq!(messages(&mut b), vec![b"blip".to_vec()]);
        assert!(a.is_drained());
        assert!(a.resend.is_empty());
    }
}
