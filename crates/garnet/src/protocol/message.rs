//! Wire message identifiers. Offline (sessionless) messages and
//! in-session control messages are tagged by their first byte; all ids
//! stay below 0x80 so the datagram header's valid bit distinguishes
//! connected traffic, except the user-data tag which only ever appears
//! inside a frame payload.

/// First byte of offline messages and of control payloads inside frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    /// Keepalive inside a session; carries the sender's send time.
    ConnectedPing = 0x00,
    /// Sessionless ping, answered with [`MessageId::UnconnectedPong`].
    UnconnectedPing = 0x01,
    /// Keepalive reply echoing the ping time.
    ConnectedPong = 0x03,
    /// Handshake 1/3 (client): protocol version + MTU probe padding.
    OpenRequest = 0x05,
    /// Handshake 2/3 (server): cookie + server identity, no state kept.
    OpenChallenge = 0x06,
    /// Handshake 3/3 (client): cookie echo + identity + agreed MTU.
    OpenResponse = 0x07,
    /// First reliable message of a server session; completes connect.
    ConnectionAccepted = 0x10,
    /// Offline rejection: the address already has a live session.
    AlreadyConnected = 0x12,
    /// Client's reliable confirmation after `ConnectionAccepted`.
    NewIncomingConnection = 0x13,
    /// Offline rejection: peer table at capacity.
    NoFreeIncomingConnections = 0x14,
    /// Graceful teardown notice, sent reliably when requested.
    DisconnectNotification = 0x15,
    /// Offline rejection carrying the server's protocol version.
    IncompatibleProtocol = 0x19,
    /// Offline rejection: password check failed.
    InvalidPassword = 0x1a,
    /// Sessionless ping reply carrying the advertisement payload.
    UnconnectedPong = 0x1c,
    /// Application payload wrapper inside a frame.
    UserMessage = 0x7f,
}

impl MessageId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(MessageId::ConnectedPing),
            0x01 => Some(MessageId::UnconnectedPing),
            0x03 => Some(MessageId::ConnectedPong),
            0x05 => Some(MessageId::OpenRequest),
            0x06 => Some(MessageId::OpenChallenge),
            0x07 => Some(MessageId::OpenResponse),
            0x10 => Some(MessageId::ConnectionAccepted),
            0x12 => Some(MessageId::AlreadyConnected),
            0x13 => Some(MessageId::NewIncomingConnection),
            0x14 => Some(MessageId::NoFreeIncomingConnections),
            0x15 => Some(MessageId::DisconnectNotification),
            0x19 => Some(MessageId::IncompatibleProtocol),
            0x1a => Some(MessageId::InvalidPassword),
            0x1c => Some(MessageId::UnconnectedPong),
            0x7f => Some(MessageId::UserMessage),
            _ => None,
        }
    }
}

/// Offline messages open with this fixed byte string so stray UDP
/// traffic cannot be mistaken for handshake attempts.
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56,
    0x78,
];
