//! Sliding-window congestion controller: RTT estimation per
//! Jacobson/Karels, a byte-budget congestion window with slow start and
//! additive increase, and head-of-line loss detection against the RTO.

use crate::protocol::number::U24;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const RTT_ALPHA: f64 = 0.125; // SRTT smoothing weight
const RTT_BETA: f64 = 0.25; // RTTVAR smoothing weight
const INITIAL_RTO: Duration = Duration::from_millis(500);
const INITIAL_CWND_PACKETS: usize = 2;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sent_at: Instant,
    bytes: usize,
}

/// Per-peer congestion state. The reliability layer records every sent
/// data datagram here and credits ACKs back; the controller answers "how
/// many bytes may leave right now" and "which datagrams look lost".
#[derive(Debug)]
pub struct CongestionControl {
    mtu: usize,
    min_rto: Duration,
    max_rto: Duration,
    /// Sent-but-unacked datagrams, ordered by datagram number.
    in_flight: BTreeMap<u32, InFlight>,
    bytes_in_flight: usize,
    srtt: Option<Duration>,
    rtt_var: Duration,
    rto: Duration,
    /// Congestion window in bytes.
    cwnd: usize,
    slow_start: bool,
    /// Bytes acked since the last additive window bump.
    avoidance_acc: usize,
    last_ack_at: Option<Instant>,
}

impl CongestionControl {
    pub fn new(mtu: usize, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            mtu,
            min_rto,
            max_rto,
            in_flight: BTreeMap::new(),
            bytes_in_flight: 0,
            srtt: None,
            rtt_var: Duration::ZERO,
            rto: INITIAL_RTO.clamp(min_rto, max_rto),
            cwnd: INITIAL_CWND_PACKETS * mtu,
            slow_start: true,
            avoidance_acc: 0,
            last_ack_at: None,
        }
    }

    /// Byte budget allowed to leave at this instant.
    pub fn may_send_bytes(&self) -> usize {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    /// Records a sent data datagram.
    pub fn on_datagram_sent(&mut self, number: U24, bytes: usize, now: Instant) {
        self.bytes_in_flight += bytes;
        self.in_flight.insert(
            number.get(),
            InFlight {
                sent_at: now,
                bytes,
            },
        );
    }

    /// Credits one acked datagram number. Returns `true` when the number
    /// was still in the in-flight history (duplicate ACKs return false).
    pub fn on_ack(&mut self, number: u32, now: Instant) -> bool {
        let Some(entry) = self.in_flight.remove(&number) else {
            return false;
        };
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(entry.bytes);
        self.update_rtt(now.saturating_duration_since(entry.sent_at));
        self.grow_window(entry.bytes);
        self.last_ack_at = Some(now);
        true
    }

    /// Drops a datagram from the history without crediting it (the
    /// datagram was declared lost and its frames rescheduled).
    pub fn forget(&mut self, number: u32) {
        if let Some(entry) = self.in_flight.remove(&number) {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(entry.bytes);
        }
    }

    /// Loss signal: halve the byte budget and leave slow start.
    pub fn on_loss(&mut self) {
        self.cwnd = (self.cwnd / 2).max(self.mtu);
        self.slow_start = false;
        self.avoidance_acc = 0;
    }

    /// Backs the RTO off exponentially after a timeout-detected loss.
    pub fn backoff_rto(&mut self) {
        self.rto = (self.rto * 2).clamp(self.min_rto, self.max_rto);
    }

    /// Datagram numbers whose head-of-line age exceeds the RTO.
    pub fn timed_out(&self, now: Instant) -> Vec<u32> {
        self.in_flight
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.sent_at) >= self.rto)
            .map(|(&n, _)| n)
            .collect()
    }

    fn grow_window(&mut self, acked_bytes: usize) {
        if self.slow_start {
            // Exponential growth: every acked byte widens the window by a
            // byte, doubling it roughly once per round trip.
            self.cwnd = self.cwnd.saturating_add(acked_bytes);
        } else {
            // Additive increase: one MSS per window's worth of ACKs.
            self.avoidance_acc += acked_bytes;
            if self.avoidance_acc >= self.cwnd {
                self.avoidance_acc -= self.cwnd;
                self.cwnd = self.cwnd.saturating_add(self.mtu);
            }
        }
    }

    fn update_rtt(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rtt_var = sample / 2;
            }
            Some(srtt) => {
                let sample_s = sample.as_secs_f64();
                let srtt_s = srtt.as_secs_f64();
                let var_s = (1.0 - RTT_BETA) * self.rtt_var.as_secs_f64()
                    + RTT_BETA * (srtt_s - sample_s).abs();
                let new_srtt_s = (1.0 - RTT_ALPHA) * srtt_s + RTT_ALPHA * sample_s;
                self.srtt = Some(Duration::from_secs_f64(new_srtt_s));
                self.rtt_var = Duration::from_secs_f64(var_s);
            }
        }
        let candidate = self.srtt.expect("just set") + self.rtt_var * 4;
        self.rto = candidate.clamp(self.min_rto, self.max_rto);
    }
}
