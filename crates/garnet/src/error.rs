use garnet_binary::BinaryError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the public API and by internal wire handling.
#[derive(Error, Debug)]
pub enum NetError {
    /// An I/O error on the underlying UDP socket.
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    /// A bit-stream serialization failure.
    #[error("binary handling error: {0}")]
    Binary(#[from] BinaryError),

    /// The peer manager has not been started, or was shut down.
    #[error("peer manager is not started")]
    NotStarted,

    /// Channel index outside the valid 0..=31 range.
    #[error("invalid ordering channel {0} (valid range 0..=31)")]
    InvalidChannel(u8),

    /// A public-API argument failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The peer table is at `max_connections`.
    #[error("peer table full")]
    PeerTableFull,

    /// No session exists for the given address.
    #[error("no session for address {0}")]
    SessionNotFound(SocketAddr),

    /// The session exists but has not finished its handshake (or is
    /// tearing down); only connected sessions accept application sends.
    #[error("session is not connected")]
    NotConnected,

    /// A bounded queue refused the operation at its high-watermark.
    #[error("queue over high-watermark")]
    QueueFull,

    /// The service is draining for shutdown and refuses new work.
    #[error("shutting down")]
    Shutdown,

    /// An inbound datagram violated the wire format. The datagram is
    /// dropped and the session's malformed-packet counter incremented.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A split-packet record would exceed the per-peer reassembly caps.
    #[error("reassembly budget exceeded: {0}")]
    ReassemblyBudgetExceeded(String),
}

/// Result type alias for garnet operations.
pub type Result<T> = std::result::Result<T, NetError>;
