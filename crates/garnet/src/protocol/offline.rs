//! Sessionless wire messages: the unconnected ping service and the
//! three-message connection handshake with its rejection replies.

use crate::error::{NetError, Result};
use crate::protocol::message::{MessageId, OFFLINE_MAGIC};
use bytes::Bytes;
use garnet_binary::BitStream;

/// MTU range accepted from probes, matching the config bounds.
pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 1500;
/// IP + UDP header estimate added to a probe datagram's length when
/// deriving the usable MTU (v4 figure; v6 probes just end up slightly
/// conservative).
pub const UDP_OVERHEAD: usize = 28;

/// One parsed offline message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineMessage {
    UnconnectedPing {
        time: u64,
        client_guid: u64,
    },
    UnconnectedPong {
        time: u64,
        server_guid: u64,
        advertisement: Bytes,
    },
    OpenRequest {
        protocol_version: u8,
        /// MTU the padded probe datagram implies, wire headers included.
        mtu_probe: u16,
    },
    OpenChallenge {
        server_guid: u64,
        cookie: u32,
        mtu: u16,
    },
    OpenResponse {
        cookie: u32,
        client_guid: u64,
        mtu: u16,
        password: Bytes,
    },
    IncompatibleProtocol {
        server_version: u8,
        server_guid: u64,
    },
    AlreadyConnected {
        server_guid: u64,
    },
    NoFreeIncomingConnections {
        server_guid: u64,
    },
    InvalidPassword {
        server_guid: u64,
    },
}

fn expect_magic(input: &mut BitStream) -> Result<()> {
    let magic = input.read_bytes(OFFLINE_MAGIC.len())?;
    if magic != OFFLINE_MAGIC {
        return Err(NetError::MalformedPacket("bad offline magic".into()));
    }
    Ok(())
}

impl OfflineMessage {
    /// Parses an offline message from a whole UDP datagram. `None` when
    /// the first byte is not an offline id (the caller then tries the
    /// connected path).
    pub fn decode(bytes: &Bytes) -> Result<Option<Self>> {
        let Some(&first) = bytes.first() else {
            return Err(NetError::MalformedPacket("empty datagram".into()));
        };
        let Some(id) = MessageId::from_u8(first) else {
            return Ok(None);
        };
        let datagram_len = bytes.len();
        let mut input = BitStream::from_bytes(bytes.clone());
        input.set_read_offset(8); // past the id byte

        let message = match id {
            MessageId::UnconnectedPing => {
                expect_magic(&mut input)?;
                OfflineMessage::UnconnectedPing {
                    time: input.read_u64()?,
                    client_guid: input.read_u64()?,
                }
            }
            MessageId::UnconnectedPong => {
                expect_magic(&mut input)?;
                let time = input.read_u64()?;
                let server_guid = input.read_u64()?;
                let len = input.read_u16()? as usize;
                if len > input.remaining_bits() / 8 {
                    return Err(NetError::MalformedPacket(
                        "advertisement length exceeds datagram".into(),
                    ));
                }
                OfflineMessage::UnconnectedPong {
                    time,
                    server_guid,
                    advertisement: Bytes::from(input.read_bytes(len)?),
                }
            }
            MessageId::OpenRequest => {
                expect_magic(&mut input)?;
                let protocol_version = input.read_u8()?;
                // The rest of the datagram is padding; its on-wire size is
                // the MTU the client can reach us with.
                let mtu_probe = (datagram_len + UDP_OVERHEAD)
                    .clamp(MIN_MTU as usize, MAX_MTU as usize) as u16;
                OfflineMessage::OpenRequest {
                    protocol_version,
                    mtu_probe,
                }
            }
            MessageId::OpenChallenge => {
                expect_magic(&mut input)?;
                OfflineMessage::OpenChallenge {
                    server_guid: input.read_u64()?,
                    cookie: input.read_u32()?,
                    mtu: input.read_u16()?,
                }
            }
            MessageId::OpenResponse => {
                expect_magic(&mut input)?;
                let cookie = input.read_u32()?;
                let client_guid = input.read_u64()?;
                let mtu = input.read_u16()?;
                let pw_len = input.read_u8()? as usize;
                if pw_len > input.remaining_bits() / 8 {
                    return Err(NetError::MalformedPacket(
                        "password length exceeds datagram".into(),
                    ));
                }
                OfflineMessage::OpenResponse {
                    cookie,
                    client_guid,
                    mtu,
                    password: Bytes::from(input.read_bytes(pw_len)?),
                }
            }
            MessageId::IncompatibleProtocol => {
                expect_magic(&mut input)?;
                OfflineMessage::IncompatibleProtocol {
                    server_version: input.read_u8()?,
                    server_guid: input.read_u64()?,
                }
            }
            MessageId::AlreadyConnected => {
                expect_magic(&mut input)?;
                OfflineMessage::AlreadyConnected {
                    server_guid: input.read_u64()?,
                }
            }
            MessageId::NoFreeIncomingConnections => {
                expect_magic(&mut input)?;
                OfflineMessage::NoFreeIncomingConnections {
                    server_guid: input.read_u64()?,
                }
            }
            MessageId::InvalidPassword => {
                expect_magic(&mut input)?;
                OfflineMessage::InvalidPassword {
                    server_guid: input.read_u64()?,
                }
            }
            // In-session ids never arrive as offline datagrams.
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    /// Encodes this message as a complete UDP datagram. `OpenRequest` is
    /// padded with zeros out to `mtu_probe` minus wire overhead.
    pub fn encode(&self) -> Result<Bytes> {
        let mut out = BitStream::with_capacity(64);
        match self {
            OfflineMessage::UnconnectedPing { time, client_guid } => {
                out.write_u8(MessageId::UnconnectedPing as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u64(*time)?;
                out.write_u64(*client_guid)?;
            }
            OfflineMessage::UnconnectedPong {
                time,
                server_guid,
                advertisement,
            } => {
                out.write_u8(MessageId::UnconnectedPong as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u64(*time)?;
                out.write_u64(*server_guid)?;
                out.write_u16(advertisement.len().min(u16::MAX as usize) as u16)?;
                out.write_bytes(&advertisement[..advertisement.len().min(u16::MAX as usize)])?;
            }
            OfflineMessage::OpenRequest {
                protocol_version,
                mtu_probe,
            } => {
                out.write_u8(MessageId::OpenRequest as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u8(*protocol_version)?;
                let target = (*mtu_probe as usize).saturating_sub(UDP_OVERHEAD);
                while out.bytes_used() < target {
                    out.write_u8(0)?;
                }
            }
            OfflineMessage::OpenChallenge {
                server_guid,
                cookie,
                mtu,
            } => {
                out.write_u8(MessageId::OpenChallenge as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u64(*server_guid)?;
                out.write_u32(*cookie)?;
                out.write_u16(*mtu)?;
            }
            OfflineMessage::OpenResponse {
                cookie,
                client_guid,
                mtu,
                password,
            } => {
                out.write_u8(MessageId::OpenResponse as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u32(*cookie)?;
                out.write_u64(*client_guid)?;
                out.write_u16(*mtu)?;
                out.write_u8(password.len().min(u8::MAX as usize) as u8)?;
                out.write_bytes(&password[..password.len().min(u8::MAX as usize)])?;
            }
            OfflineMessage::IncompatibleProtocol {
                server_version,
                server_guid,
            } => {
                out.write_u8(MessageId::IncompatibleProtocol as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u8(*server_version)?;
                out.write_u64(*server_guid)?;
            }
            OfflineMessage::AlreadyConnected { server_guid } => {
                out.write_u8(MessageId::AlreadyConnected as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u64(*server_guid)?;
            }
            OfflineMessage::NoFreeIncomingConnections { server_guid } => {
                out.write_u8(MessageId::NoFreeIncomingConnections as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u64(*server_guid)?;
            }
            OfflineMessage::InvalidPassword { server_guid } => {
                out.write_u8(MessageId::InvalidPassword as u8)?;
                out.write_bytes(&OFFLINE_MAGIC)?;
                out.write_u64(*server_guid)?;
            }
        }
        Ok(out.into_bytes())
    }
}
