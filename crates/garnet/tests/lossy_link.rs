//! Reliability scenarios over a simulated lossy wire: no sockets, a
//! seeded RNG deciding drops and jitter, and real (short) RTO timers.

use bytes::Bytes;
use garnet::config::Config;
use garnet::event::Event;
use garnet::protocol::{Datagram, Priority, Reliability};
use garnet::reliability::{LayerConfig, LayerEvent, ReliabilityLayer};
use garnet::session::Session;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

fn fast_config() -> Config {
    Config {
        mtu: 1200,
        min_rto_ms: 5,
        max_rto_ms: 40,
        ack_delay_ms: 0,
        ..Config::default()
    }
}

fn fast_layer_config() -> LayerConfig {
    LayerConfig {
        mtu: 1200,
        min_rto: Duration::from_millis(5),
        max_rto: Duration::from_millis(40),
        ack_delay: Duration::ZERO,
        ..LayerConfig::default()
    }
}

fn connected_sessions() -> (Session, Session) {
    let config = fast_config();
    let now = Instant::now();
    let client_addr: SocketAddr = "10.0.0.1:40000".parse().unwrap();
    let server_addr: SocketAddr = "10.0.0.2:40000".parse().unwrap();
    let mut server = Session::new_server(client_addr, 1, 2, 1200, &config, now);
    let mut client = Session::new_client(server_addr, 2, 1200, &config, now);
    for datagram in server.update(now, 0) {
        client.handle_datagram(datagram, now, 0);
    }
    for datagram in client.update(now, 0) {
        server.handle_datagram(datagram, now, 0);
    }
    assert!(client.is_connected());
    assert!(server.is_connected());
    while client.poll_event().is_some() {}
    while server.poll_event().is_some() {}
    (client, server)
}

/// A datagram in flight on the simulated wire.
struct InFlight {
    deliver_at: Instant,
    bytes: Bytes,
    to_server: bool,
}

/// 100 reliable-ordered messages on one channel survive 20% loss with
/// delivery jitter, and arrive complete and in order.
#[test]
fn ordered_delivery_across_loss_and_jitter() {
    let (mut client, mut server) = connected_sessions();
    let mut rng = StdRng::seed_from_u64(0xA11CE);
    let now = Instant::now();

    let total = 100u16;
    for i in 0..total {
        client
            .send(
                Bytes::copy_from_slice(&i.to_be_bytes()),
                Priority::Medium,
                Reliability::ReliableOrdered,
                0,
                None,
                now,
            )
            .unwrap();
    }

    let mut wire: Vec<InFlight> = Vec::new();
    let mut received: Vec<u16> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);

    while received.len() < total as usize {
        assert!(Instant::now() < deadline, "did not converge in time");
        let now = Instant::now();

        for bytes in client.update(now, 0) {
            if rng.random_bool(0.2) {
                continue; // lost
            }
            let jitter = Duration::from_millis(rng.random_range(2..8));
            wire.push(InFlight {
                deliver_at: now + jitter,
                bytes,
                to_server: true,
            });
        }
        for bytes in server.update(now, 0) {
            if rng.random_bool(0.2) {
                continue;
            }
            let jitter = Duration::from_millis(rng.random_range(2..8));
            wire.push(InFlight {
                deliver_at: now + jitter,
                bytes,
                to_server: false,
            });
        }

        let mut still_flying = Vec::new();
        for packet in wire.drain(..) {
            if packet.deliver_at <= now {
                if packet.to_server {
                    server.handle_datagram(packet.bytes, now, 0);
                } else {
                    client.handle_datagram(packet.bytes, now, 0);
                }
            } else {
                still_flying.push(packet);
            }
        }
        wire = still_flying;

        while let Some(event) = server.poll_event() {
            if let Event::Message { payload, channel, .. } = event {
                assert_eq!(channel, 0);
                received.push(u16::from_be_bytes([payload[0], payload[1]]));
            }
        }

        std::thread::sleep(Duration::from_millis(2));
    }

    let expected: Vec<u16> = (0..total).collect();
    assert_eq!(received, expected, "ordered channel delivered out of order");
}

/// A 20 000-byte payload fragments, survives reverse-order delivery and
/// a fragment dropped twice, and reassembles byte-identically once the
/// sender retransmits on RTO.
#[test]
fn reassembly_survives_reversal_and_fragment_loss() {
    let now = Instant::now();
    let mut a = ReliabilityLayer::new(fast_layer_config(), now);
    let mut b = ReliabilityLayer::new(fast_layer_config(), now);

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

    let mut drops_of_seven = 0;
    let mut deliveries_of_seven = 0;
    let mut assembled: Option<Vec<u8>> = None;
    let deadline = Instant::now() + Duration::from_secs(10);

    while assembled.is_none() {
        assert!(Instant::now() < deadline, "did not converge in time");
        let now = Instant::now();

        // Deliver each batch in reverse order, dropping the datagram
        // that carries fragment 7 the first two times it appears.
        let mut batch = a.update(now, 0).unwrap();
        batch.reverse();
        for bytes in batch {
            let carries_seven = match Datagram::decode(bytes.clone(), now).unwrap() {
                Datagram::Data { frames, .. } => frames
                    .iter()
                    .any(|f| f.split.map(|s| s.index == 7).unwrap_or(false)),
                Datagram::Ack { .. } => false,
            };
            if carries_seven {
                if drops_of_seven < 2 {
                    drops_of_seven += 1;
                    continue;
                }
                deliveries_of_seven += 1;
            }
            b.on_datagram(bytes, now).unwrap();
        }

        for bytes in b.update(now, 0).unwrap() {
            a.on_datagram(bytes, now).unwrap();
        }

        while let Some(event) = b.poll_event() {
            if let LayerEvent::Message(frame) = event {
                assembled = Some(frame.payload.to_vec());
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(drops_of_seven, 2, "fragment 7 should have been dropped twice");
    assert!(
        deliveries_of_seven >= 1,
        "fragment 7 must be retransmitted after its losses"
    );
    assert_eq!(assembled.unwrap(), payload);
}

/// Sequenced traffic under adversarial reorder: with wire order
/// 2,0,4,1,3 only 2 and 4 reach the application.
#[test]
fn sequenced_delivery_under_reorder() {
    let now = Instant::now();
    let mut a = ReliabilityLayer::new(fast_layer_config(), now);
    let mut b = ReliabilityLayer::new(fast_layer_config(), now);

    // One datagram per message: send, then collect.
    let mut datagrams = Vec::new();
    for i in 0..5u8 {
        a.send(
            Bytes::copy_from_slice(&[i]),
            Priority::Medium,
            Reliability::UnreliableSequenced,
            0,
            None,
            now,
        )
        .unwrap();
        let mut wire = a.update(now, 0).unwrap();
        assert_eq!(wire.len(), 1);
        datagrams.push(wire.remove(0));
    }

    for index in [2usize, 0, 4, 1, 3] {
        b.on_datagram(datagrams[index].clone(), now).unwrap();
    }

    let mut delivered = Vec::new();
    while let Some(event) = b.poll_event() {
        if let LayerEvent::Message(frame) = event {
            delivered.push(frame.payload[0]);
        }
    }
    assert_eq!(delivered, vec![2, 4]);
}

/// Receipts resolve exactly once even when the connection is torn down
/// before any acknowledgement: five sends, five losses, no acks.
#[test]
fn receipts_on_forced_disconnect() {
    let (mut client, mut server) = connected_sessions();
    let now = Instant::now();
    for receipt in 10..15u32 {
        client
            .send(
                Bytes::from_static(b"never acked"),
                Priority::Medium,
                Reliability::ReliableOrderedWithAckReceipt,
                0,
                Some(receipt),
                now,
            )
            .unwrap();
    }
    client.close(false, now);

    let mut losses = Vec::new();
    while let Some(event) = client.poll_event() {
        match event {
            Event::ReceiptLoss { receipt, .. } => losses.push(receipt),
            Event::ReceiptAcked { .. } => panic!("no receipt can be acked"),
            _ => {}
        }
    }
    losses.sort_unstable();
    assert_eq!(losses, vec![10, 11, 12, 13, 14]);
    let _ = server.update(now, 0);
}
