//! Frame codec
//!
//! Frame layout: magic (4) + NUL-padded command (12) + payload length (4) +
//! checksum (4) + payload. The checksum is the first four bytes of the
//! payload's SHA-512.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::connection::NetworkError;
use super::message::{Message, COMMAND_SIZE, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE};
use crate::crypto::checksum;

/// Message codec for checksummed, command-tagged framing
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload_bytes();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::PayloadTooLarge(payload.len()));
        }

        let mut command = [0u8; COMMAND_SIZE];
        command[..item.command().len()].copy_from_slice(item.command().as_bytes());

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32(MAGIC);
        dst.put_slice(&command);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if magic != MAGIC {
            return Err(NetworkError::BadMagic(magic));
        }

        let len = u32::from_be_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::PayloadTooLarge(len));
        }

        // Check if we have full message
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let command = parse_command(&src[4..4 + COMMAND_SIZE])?;
        let expected = [src[20], src[21], src[22], src[23]];

        // Skip header
        src.advance(HEADER_SIZE);
        let payload = src.split_to(len);

        if checksum(&payload) != expected {
            return Err(NetworkError::ChecksumMismatch);
        }

        Message::decode(&command, &payload).map(Some)
    }
}

/// ASCII command followed only by NUL padding
fn parse_command(raw: &[u8]) -> Result<String, NetworkError> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let (name, padding) = raw.split_at(end);
    if padding.iter().any(|b| *b != 0) || !name.is_ascii() {
        return Err(NetworkError::UnknownCommand(
            String::from_utf8_lossy(raw).into_owned(),
        ));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InventoryVector, ObjectMessage};

    fn encode(message: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec.encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_message_codec() {
        let message = Message::Inv(vec![InventoryVector::new([5u8; 32])]);
        let mut buf = encode(message.clone());

        assert_eq!(&buf[..4], &[0xE9, 0xBE, 0xB4, 0xD9]);
        assert_eq!(&buf[4..16], b"inv\0\0\0\0\0\0\0\0\0");

        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        let object = ObjectMessage::new(1_700_000_000, 42, 1, 1, vec![9u8; 100]);
        let full = encode(Message::Object(object.clone()));

        let mut buf = BytesMut::from(&full[..HEADER_SIZE - 1]);
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[HEADER_SIZE - 1..full.len() - 1]);
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap(),
            Some(Message::Object(object))
        );
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = encode(Message::Ping);
        buf.extend_from_slice(&encode(Message::Pong));

        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Ping));
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Pong));
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = encode(Message::Ping);
        buf[0] = 0;
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(NetworkError::BadMagic(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut buf = encode(Message::Inv(vec![InventoryVector::new([1u8; 32])]));
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(NetworkError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_oversized_payload_rejected_from_header() {
        let mut buf = encode(Message::Ping);
        buf[16..20].copy_from_slice(&((MAX_PAYLOAD_SIZE + 1) as u32).to_be_bytes());
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(NetworkError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_command() {
        let mut buf = encode(Message::Ping);
        buf[4..8].copy_from_slice(b"gimm");
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(NetworkError::UnknownCommand(_))
        ));

        let mut buf = encode(Message::Ping);
        // Garbage after the NUL padding starts
        buf[15] = b'x';
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(NetworkError::UnknownCommand(_))
        ));
    }
}
