//! Application-visible events, popped from the peer manager's receive
//! queue.

use bytes::Bytes;
use std::net::SocketAddr;

/// Everything the application can observe from the network. Per-peer
/// per-channel message order is preserved; cross-peer order is arbitrary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Application payload from a connected peer, exactly as sent.
    Message {
        addr: SocketAddr,
        channel: u8,
        payload: Bytes,
    },
    /// Our outgoing `connect` completed; the session is usable.
    ConnectionRequestAccepted { addr: SocketAddr, guid: u64 },
    /// A remote peer completed its handshake with us.
    NewIncomingConnection { addr: SocketAddr, guid: u64 },
    /// The remote side closed gracefully.
    DisconnectionNotification { addr: SocketAddr },
    /// The remote side went silent past the timeout, or exhausted
    /// retransmission attempts.
    ConnectionLost { addr: SocketAddr },
    /// Our outgoing `connect` gave up (no reply, or rejected).
    ConnectionAttemptFailed { addr: SocketAddr },
    /// Connect refused: a session for this address already exists.
    AlreadyConnected { addr: SocketAddr },
    /// Connect refused: the remote peer table is full.
    NoFreeIncomingConnections { addr: SocketAddr },
    /// Connect refused: password mismatch.
    InvalidPassword { addr: SocketAddr },
    /// A reliable-with-receipt send was acknowledged end to end.
    ReceiptAcked { addr: SocketAddr, receipt: u32 },
    /// A with-receipt send was lost: the connection died or the queue
    /// was flushed at disconnect before acknowledgement.
    ReceiptLoss { addr: SocketAddr, receipt: u32 },
    /// An unconnected pong arrived, carrying the remote advertisement.
    AdvertiseSystem {
        addr: SocketAddr,
        guid: u64,
        payload: Bytes,
    },
}

impl Event {
    /// The remote address this event concerns.
    pub fn addr(&self) -> SocketAddr {
        match self {
            Event::Message { addr, .. }
            | Event::ConnectionRequestAccepted { addr, .. }
            | Event::NewIncomingConnection { addr, .. }
            | Event::DisconnectionNotification { addr }
            | Event::ConnectionLost { addr }
            | Event::ConnectionAttemptFailed { addr }
            | Event::AlreadyConnected { addr }
            | Event::NoFreeIncomingConnections { addr }
            | Event::InvalidPassword { addr }
            | Event::ReceiptAcked { addr, .. }
            | Event::ReceiptLoss { addr, .. }
            | Event::AdvertiseSystem { addr, .. } => *addr,
        }
    }
}
