//! Per-peer connection state: the handshake-completion and teardown
//! machine wrapped around one [`ReliabilityLayer`], plus the connected
//! control messages (keepalive ping/pong, disconnect notice) and the
//! user-payload envelope.

use crate::config::Config;
use crate::error::{NetError, Result};
use crate::event::Event;
use crate::protocol::{MessageId, Priority, Reliability};
use crate::reliability::{LayerEvent, ReliabilityLayer};
use bytes::Bytes;
use garnet_binary::BitStream;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Wire-format violations tolerated before the connection is closed.
const MALFORMED_THRESHOLD: u32 = 16;

/// Which end of the handshake created this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSide {
    /// We sent the open request.
    Client,
    /// We answered one.
    Server,
}

/// Connection phase. `Requesting` is the pre-cookie phase the peer
/// manager tracks before a session object exists; sessions are created
/// in `Handshaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requesting,
    Handshaking,
    Connected,
    /// Voluntary close: drain the outbound queue, then die.
    DisconnectingGraceful,
    Dead,
}

/// One connected (or connecting) remote peer.
pub struct Session {
    addr: SocketAddr,
    /// Remote identity token from the handshake.
    guid: u64,
    mtu: u16,
    side: SessionSide,
    state: SessionState,
    layer: ReliabilityLayer,
    malformed: u32,
    ping_interval: std::time::Duration,
    timeout: std::time::Duration,
    /// Most recent keepalive round trip, in microseconds.
    last_ping_rtt_micros: Option<u64>,
    events: VecDeque<Event>,
    /// Datagrams ready for the socket, drained by `update`. Lets the
    /// receive path emit (e.g. the final ACK of a disconnect notice)
    /// even after the session dies.
    outbox: VecDeque<Bytes>,
}

impl Session {
    /// Server side: created on a valid cookie echo. Queues the
    /// connection-accepted message as the session's first reliable send.
    pub fn new_server(
        addr: SocketAddr,
        remote_guid: u64,
        local_guid: u64,
        mtu: u16,
        config: &Config,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(addr, remote_guid, mtu, SessionSide::Server, config, now);
        debug!(%addr, guid = remote_guid, mtu, "incoming session handshaking");
        let mut payload = BitStream::with_capacity(16);
        let _ = payload.write_u8(MessageId::ConnectionAccepted as u8);
        let _ = payload.write_u64(local_guid);
        session.send_control(payload.into_bytes(), Reliability::ReliableOrdered, now);
        session
    }

    /// Client side: created when the open response is sent, waiting for
    /// the server's connection-accepted message.
    pub fn new_client(
        addr: SocketAddr,
        remote_guid: u64,
        mtu: u16,
        config: &Config,
        now: Instant,
    ) -> Self {
        debug!(%addr, guid = remote_guid, mtu, "outgoing session handshaking");
        Self::new(addr, remote_guid, mtu, SessionSide::Client, config, now)
    }

    fn new(
        addr: SocketAddr,
        guid: u64,
        mtu: u16,
        side: SessionSide,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            guid,
            mtu,
            side,
            state: SessionState::Handshaking,
            layer: ReliabilityLayer::new(config.layer_config(mtu), now),
            malformed: 0,
            ping_interval: config.ping_interval(),
            timeout: config.timeout(),
            last_ping_rtt_micros: None,
            events: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_dead(&self) -> bool {
        self.state == SessionState::Dead
    }

    pub fn last_ping_rtt_micros(&self) -> Option<u64> {
        self.last_ping_rtt_micros
    }

    /// Pops the next application-visible event produced by this session.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // --- Sending ---

    /// Queues an application message. Only connected sessions accept
    /// sends; the payload is wrapped in the user-message envelope so
    /// control traffic and user bytes can never collide.
    pub fn send(
        &mut self,
        payload: Bytes,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        receipt: Option<u32>,
        now: Instant,
    ) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(NetError::NotConnected);
        }
        let mut wrapped = BitStream::with_capacity(payload.len() + 1);
        wrapped.write_u8(MessageId::UserMessage as u8)?;
        wrapped.write_bytes(&payload)?;
        self.layer
            .send(wrapped.into_bytes(), priority, reliability, channel, receipt, now)
    }

    fn send_control(&mut self, payload: Bytes, reliability: Reliability, now: Instant) {
        if let Err(e) = self
            .layer
            .send(payload, Priority::High, reliability, 0, None, now)
        {
            warn!(addr = %self.addr, error = %e, "failed to queue control message");
        }
    }

    // --- Receiving ---

    /// Feeds one inbound datagram and handles everything it unlocks.
    pub fn handle_datagram(&mut self, bytes: Bytes, now: Instant, now_micros: u64) {
        if self.state == SessionState::Dead {
            return;
        }
        match self.layer.on_datagram(bytes, now) {
            Ok(()) => {}
            Err(NetError::ReassemblyBudgetExceeded(reason)) => {
                // Resource refusal: the offending message is dropped but
                // the connection survives.
                warn!(addr = %self.addr, %reason, "reassembly refused");
            }
            Err(e) => {
                self.malformed += 1;
                warn!(
                    addr = %self.addr,
                    error = %e,
                    strikes = self.malformed,
                    "malformed datagram dropped"
                );
                if self.malformed >= MALFORMED_THRESHOLD {
                    warn!(addr = %self.addr, "malformed threshold reached, closing");
                    self.die();
                }
                return;
            }
        }
        self.drain_layer(now, now_micros);
    }

    fn drain_layer(&mut self, now: Instant, now_micros: u64) {
        while let Some(event) = self.layer.poll_event() {
            match event {
                LayerEvent::Message(frame) => {
                    self.dispatch_message(frame.channel, frame.payload, now, now_micros);
                }
                LayerEvent::ReceiptAcked(receipt) => self.events.push_back(Event::ReceiptAcked {
                    addr: self.addr,
                    receipt,
                }),
                LayerEvent::ReceiptLoss(receipt) => self.events.push_back(Event::ReceiptLoss {
                    addr: self.addr,
                    receipt,
                }),
            }
        }
    }

    fn dispatch_message(&mut self, channel: u8, payload: Bytes, now: Instant, now_micros: u64) {
        let Some(&first) = payload.first() else {
            trace!(addr = %self.addr, "empty frame payload dropped");
            return;
        };
        match MessageId::from_u8(first) {
            Some(MessageId::UserMessage) => {
                // User data rides its own ordering channel, so it can
                // overtake the handshake-completion message. The remote
                // only sends data once connected, so data implies the
                // handshake finished.
                if self.state == SessionState::Handshaking {
                    self.complete_handshake(now);
                }
                if self.state == SessionState::Connected {
                    self.events.push_back(Event::Message {
                        addr: self.addr,
                        channel,
                        payload: payload.slice(1..),
                    });
                }
            }
            Some(MessageId::ConnectedPing) => {
                let ping_time = read_u64_after_id(&payload).unwrap_or(0);
                let mut pong = BitStream::with_capacity(24);
                let _ = pong.write_u8(MessageId::ConnectedPong as u8);
                let _ = pong.write_u64(ping_time);
                let _ = pong.write_u64(now_micros);
                self.send_control(pong.into_bytes(), Reliability::Unreliable, now);
            }
            Some(MessageId::ConnectedPong) => {
                if let Some(ping_time) = read_u64_after_id(&payload) {
                    self.last_ping_rtt_micros = Some(now_micros.wrapping_sub(ping_time));
                }
            }
            Some(MessageId::ConnectionAccepted) => {
                if self.side == SessionSide::Client && self.state == SessionState::Handshaking {
                    self.complete_handshake(now);
                }
            }
            Some(MessageId::NewIncomingConnection) => {
                if self.side == SessionSide::Server && self.state == SessionState::Handshaking {
                    self.complete_handshake(now);
                }
            }
            Some(MessageId::DisconnectNotification) => {
                debug!(addr = %self.addr, "remote disconnected gracefully");
                // Acknowledge the notice before dying, or the remote
                // keeps retransmitting it until its own timeout.
                if let Ok(acks) = self.layer.flush_acks() {
                    self.outbox.extend(acks);
                }
                self.die();
                self.events
                    .push_back(Event::DisconnectionNotification { addr: self.addr });
            }
            _ => {
                trace!(addr = %self.addr, id = first, "unknown control message dropped");
            }
        }
    }

    /// Transitions `Handshaking → Connected`, surfaces the side's
    /// completion event, and (client side) sends the reliable
    /// confirmation.
    fn complete_handshake(&mut self, now: Instant) {
        self.state = SessionState::Connected;
        match self.side {
            SessionSide::Client => {
                debug!(addr = %self.addr, "connection accepted");
                let mut confirm = BitStream::with_capacity(16);
                let _ = confirm.write_u8(MessageId::NewIncomingConnection as u8);
                let _ = confirm.write_u64(self.guid);
                self.send_control(confirm.into_bytes(), Reliability::ReliableOrdered, now);
                self.events.push_back(Event::ConnectionRequestAccepted {
                    addr: self.addr,
                    guid: self.guid,
                });
            }
            SessionSide::Server => {
                debug!(addr = %self.addr, "incoming connection established");
                self.events.push_back(Event::NewIncomingConnection {
                    addr: self.addr,
                    guid: self.guid,
                });
            }
        }
    }

    // --- Ticking ---

    /// Periodic drive: keepalive, timeout detection, reliability-layer
    /// timers. Returns the datagrams to put on the socket.
    pub fn update(&mut self, now: Instant, now_micros: u64) -> Vec<Bytes> {
        if self.state == SessionState::Dead {
            return self.outbox.drain(..).collect();
        }

        // Dead-peer detection: prolonged receive silence.
        if self.layer.silence(now) >= self.timeout {
            warn!(addr = %self.addr, state = ?self.state, "connection timed out");
            let event = if self.side == SessionSide::Client
                && self.state == SessionState::Handshaking
            {
                // The handshake never completed; this is a failed
                // attempt, not a lost connection.
                Event::ConnectionAttemptFailed { addr: self.addr }
            } else {
                Event::ConnectionLost { addr: self.addr }
            };
            self.die();
            self.events.push_back(event);
            self.drain_layer(now, now_micros);
            return self.outbox.drain(..).collect();
        }

        // Keepalive while otherwise idle.
        if self.state == SessionState::Connected && self.layer.idle_send(now) >= self.ping_interval
        {
            let mut ping = BitStream::with_capacity(16);
            let _ = ping.write_u8(MessageId::ConnectedPing as u8);
            let _ = ping.write_u64(now_micros);
            self.send_control(ping.into_bytes(), Reliability::Unreliable, now);
        }

        match self.layer.update(now, now_micros as u32) {
            Ok(wire) => self.outbox.extend(wire),
            Err(e) => warn!(addr = %self.addr, error = %e, "reliability update failed"),
        }

        // Send-attempt exhaustion inside the layer is a lost connection.
        if self.layer.is_dead() && self.state != SessionState::Dead {
            self.state = SessionState::Dead;
            self.events.push_back(Event::ConnectionLost { addr: self.addr });
        }

        // A graceful close completes once everything reliable is acked.
        if self.state == SessionState::DisconnectingGraceful && self.layer.is_drained() {
            debug!(addr = %self.addr, "graceful disconnect drained");
            self.die();
        }

        self.drain_layer(now, now_micros);
        self.outbox.drain(..).collect()
    }

    /// Begins teardown. With `notify` the disconnect notice is sent
    /// reliably and the outbound queue drains first; without it the
    /// session dies immediately and unresolved receipts report losses.
    pub fn close(&mut self, notify: bool, now: Instant) {
        match self.state {
            SessionState::Dead => {}
            SessionState::DisconnectingGraceful => {}
            _ if notify => {
                let mut notice = BitStream::with_capacity(4);
                let _ = notice.write_u8(MessageId::DisconnectNotification as u8);
                self.send_control(notice.into_bytes(), Reliability::ReliableOrdered, now);
                self.state = SessionState::DisconnectingGraceful;
            }
            _ => {
                self.die();
                self.drain_layer(now, 0);
            }
        }
    }

    fn die(&mut self) {
        self.layer.declare_dead();
        self.state = SessionState::Dead;
    }
}

fn read_u64_after_id(payload: &Bytes) -> Option<u64> {
    let mut input = BitStream::from_bytes(payload.clone());
    input.set_read_offset(8);
    input.read_u64().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            mtu: 1200,
            min_rto_ms: 5,
            max_rto_ms: 50,
            ack_delay_ms: 0,
            timeout_ms: 10_000,
            ..Config::default()
        }
    }

    fn pump(from: &mut Session, to: &mut Session, now: Instant) {
        for datagram in from.update(now, 0) {
            to.handle_datagram(datagram, now, 0);
        }
    }

    fn connected_pair() -> (Session, Session) {
        let config = test_config();
        let now = Instant::now();
        let client_addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut server = Session::new_server(client_addr, 111, 222, 1200, &config, now);
        let mut client = Session::new_client(server_addr, 222, 1200, &config, now);

        // Server's ConnectionAccepted reaches the client...
        pump(&mut server, &mut client, now);
        // ...and the client's confirmation reaches the server.
        pump(&mut client, &mut server, now);
        (client, server)
    }

    #[test]
    fn handshake_completion_events() {
        let (mut client, mut server) = connected_pair();
        assert!(client.is_connected());
        assert!(server.is_connected());
        assert!(matches!(
            client.poll_event(),
            Some(Event::ConnectionRequestAccepted { guid: 222, .. })
        ));
        assert!(matches!(
            server.poll_event(),
            Some(Event::NewIncomingConnection { guid: 111, .. })
        ));
    }

    #[test]
    fn user_payload_round_trip() {
        let (mut client, mut server) = connected_pair();
        while client.poll_event().is_some() {}
        while server.poll_event().is_some() {}

        let now = Instant::now();
        client
            .send(
                Bytes::from_static(b"game state"),
                Priority::Medium,
                Reliability::ReliableOrdered,
                3,
                None,
                now,
            )
            .unwrap();
        pump(&mut client, &mut server, now);

        match server.poll_event() {
            Some(Event::Message {
                channel, payload, ..
            }) => {
                assert_eq!(channel, 3);
                assert_eq!(payload.as_ref(), b"game state");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn send_before_connected_is_rejected() {
        let config = test_config();
        let now = Instant::now();
        let addr: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let mut client = Session::new_client(addr, 1, 1200, &config, now);
        assert!(matches!(
            client.send(
                Bytes::from_static(b"early"),
                Priority::Medium,
                Reliability::Reliable,
                0,
                None,
                now,
            ),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn ping_pong_updates_rtt() {
        let (mut client, mut server) = connected_pair();
        let now = Instant::now();

        // A zero ping interval forces a keepalive on the next update.
        client.ping_interval = Duration::ZERO;
        for datagram in client.update(now, 1_000) {
            server.handle_datagram(datagram, now, 1_500);
        }
        for datagram in server.update(now, 1_500) {
            client.handle_datagram(datagram, now, 1_900);
        }
        assert_eq!(client.last_ping_rtt_micros(), Some(900));
    }

    #[test]
    fn remote_disconnect_notification() {
        let (mut client, mut server) = connected_pair();
        let now = Instant::now();
        client.close(true, now);
        // The notice, its ACK and the drain take a few pumps.
        for _ in 0..4 {
            pump(&mut client, &mut server, now);
            pump(&mut server, &mut client, now);
        }
        assert!(client.is_dead());
        assert!(server.is_dead());
        let mut saw_notice = false;
        while let Some(event) = server.poll_event() {
            if matches!(event, Event::DisconnectionNotification { .. }) {
                saw_notice = true;
            }
        }
        assert!(saw_notice);
    }

    #[test]
    fn forced_close_reports_receipt_losses() {
        let (mut client, mut server) = connected_pair();
        while client.poll_event().is_some() {}
        let now = Instant::now();
        for receipt in 1..=5u32 {
            client
                .send(
                    Bytes::from_static(b"inflight"),
                    Priority::Medium,
                    Reliability::ReliableWithAckReceipt,
                    0,
                    Some(receipt),
                    now,
                )
                .unwrap();
        }
        // Close before any ACK can return.
        client.close(false, now);
        let mut lost = Vec::new();
        while let Some(event) = client.poll_event() {
            match event {
                Event::ReceiptLoss { receipt, .. } => lost.push(receipt),
                Event::ReceiptAcked { .. } => panic!("nothing was acked"),
                _ => {}
            }
        }
        lost.sort_unstable();
        assert_eq!(lost, vec![1, 2, 3, 4, 5]);
        let _ = server;
    }

    #[test]
    fn timeout_surfaces_connection_lost() {
        let config = Config {
            timeout_ms: 1,
            ..test_config()
        };
        let now = Instant::now();
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let mut session = Session::new_server(addr, 9, 10, 1200, &config, now);
        std::thread::sleep(Duration::from_millis(5));
        session.update(Instant::now(), 0);
        assert!(session.is_dead());
        assert!(session
            .events
            .iter()
            .any(|e| matches!(e, Event::ConnectionLost { .. })));
    }

    #[test]
    fn stalled_client_handshake_fails_the_attempt() {
        let config = Config {
            timeout_ms: 1,
            ..test_config()
        };
        let now = Instant::now();
        let addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let mut session = Session::new_client(addr, 9, 1200, &config, now);
        std::thread::sleep(Duration::from_millis(5));
        let wire = session.update(Instant::now(), 0);
        assert!(wire.is_empty());
        assert!(session.is_dead());
        assert!(session
            .events
            .iter()
            .any(|e| matches!(e, Event::ConnectionAttemptFailed { .. })));
    }
}
