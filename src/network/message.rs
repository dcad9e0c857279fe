//! Network message types for P2P communication
//!
//! Defines the commands of the gossip protocol and their payload encodings.

use bytes::BufMut;
use std::io::Cursor;

use super::connection::NetworkError;
use crate::core::encoding::{
    put_var_int, put_var_int_list, put_var_str, read_array, read_i64, read_length, read_remaining,
    read_u32, read_u64, read_var_int_list, read_var_str, DecodeError,
};
use crate::core::{InventoryVector, NetworkAddress, ObjectMessage, Services};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest protocol version we talk to
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Magic bytes for message framing
pub const MAGIC: u32 = 0xE9BE_B4D9;

/// Size of the frame header: magic, command, length and checksum
pub const HEADER_SIZE: usize = 24;

/// Commands are NUL padded to this length
pub const COMMAND_SIZE: usize = 12;

/// Largest accepted frame payload
pub const MAX_PAYLOAD_SIZE: usize = 1_600_003;

/// Maximum vectors in one `inv` or `getdata`
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Maximum entries in one `addr`
pub const MAX_ADDR_ENTRIES: usize = 1_000;

const MAX_USER_AGENT_SIZE: usize = 5_000;
const MAX_STREAMS: usize = 160_000;
const MAX_CUSTOM_COMMAND_SIZE: usize = 255;

/// Version message exchanged during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: Services,
    pub timestamp: i64,
    /// Address of the receiving node as seen by the sender
    pub addr_recv: NetworkAddress,
    /// Listening address of the sender
    pub addr_from: NetworkAddress,
    /// Random per-node value detecting connections to ourselves
    pub nonce: u64,
    pub user_agent: String,
    pub streams: Vec<u64>,
}

/// Extension message: a sub-command and opaque data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMessage {
    pub command: String,
    pub data: Vec<u8>,
}

impl CustomMessage {
    pub fn new(command: &str, data: Vec<u8>) -> Self {
        Self {
            command: command.to_string(),
            data,
        }
    }
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake opener carrying protocol version and streams
    Version(VersionMessage),

    /// Handshake acknowledgement
    Verack,

    /// Announce objects by inventory vector
    Inv(Vec<InventoryVector>),

    /// Request announced objects
    GetData(Vec<InventoryVector>),

    /// A full object
    Object(ObjectMessage),

    /// Known peer addresses
    Addr(Vec<NetworkAddress>),

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong response
    Pong,

    /// Extension transport
    Custom(CustomMessage),
}

impl Message {
    /// Command name on the wire
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Object(_) => "object",
            Message::Addr(_) => "addr",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Custom(_) => "custom",
        }
    }

    pub fn write_payload(&self, buf: &mut impl BufMut) {
        match self {
            Message::Version(version) => {
                buf.put_u32(version.version);
                buf.put_u64(version.services.bits());
                buf.put_i64(version.timestamp);
                version.addr_recv.write_short(buf);
                version.addr_from.write_short(buf);
                buf.put_u64(version.nonce);
                put_var_str(buf, &version.user_agent);
                put_var_int_list(buf, &version.streams);
            }
            Message::Verack | Message::Ping | Message::Pong => {}
            Message::Inv(vectors) | Message::GetData(vectors) => {
                put_var_int(buf, vectors.len() as u64);
                for vector in vectors {
                    buf.put_slice(vector.as_bytes());
                }
            }
            Message::Object(object) => object.write(buf),
            Message::Addr(addresses) => {
                put_var_int(buf, addresses.len() as u64);
                for address in addresses {
                    address.write(buf);
                }
            }
            Message::Custom(custom) => {
                put_var_str(buf, &custom.command);
                buf.put_slice(&custom.data);
            }
        }
    }

    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_payload(&mut buf);
        buf
    }

    /// Decode a payload for a known command
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, NetworkError> {
        let mut cursor = Cursor::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage {
                version: read_u32(&mut cursor)?,
                services: Services::from_bits_retain(read_u64(&mut cursor)?),
                timestamp: read_i64(&mut cursor)?,
                addr_recv: NetworkAddress::read_short(&mut cursor)?,
                addr_from: NetworkAddress::read_short(&mut cursor)?,
                nonce: read_u64(&mut cursor)?,
                user_agent: read_var_str(&mut cursor, MAX_USER_AGENT_SIZE)?,
                streams: read_var_int_list(&mut cursor, MAX_STREAMS)?,
            }),
            "verack" => Message::Verack,
            "inv" => Message::Inv(read_vectors(&mut cursor)?),
            "getdata" => Message::GetData(read_vectors(&mut cursor)?),
            "object" => Message::Object(ObjectMessage::read(payload)?),
            "addr" => {
                let count = read_length(&mut cursor, MAX_ADDR_ENTRIES)?;
                let addresses = (0..count)
                    .map(|_| NetworkAddress::read(&mut cursor))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::Addr(addresses)
            }
            "ping" => Message::Ping,
            "pong" => Message::Pong,
            "custom" => {
                let command = read_var_str(&mut cursor, MAX_CUSTOM_COMMAND_SIZE)?;
                let data = read_remaining(&mut cursor)?;
                Message::Custom(CustomMessage { command, data })
            }
            other => return Err(NetworkError::UnknownCommand(other.to_string())),
        };

        // Objects consume their whole payload by construction
        let consumed = cursor.position() as usize;
        if !matches!(message, Message::Object(_)) && consumed < payload.len() {
            return Err(DecodeError::InvalidData(format!(
                "{} trailing bytes after {}",
                payload.len() - consumed,
                command
            ))
            .into());
        }
        Ok(message)
    }
}

fn read_vectors(cursor: &mut Cursor<&[u8]>) -> Result<Vec<InventoryVector>, DecodeError> {
    let count = read_length(cursor, MAX_INV_ENTRIES)?;
    (0..count)
        .map(|_| read_array::<32>(cursor).map(InventoryVector::new))
        .collect()
}
