//! Typed object bodies
//!
//! The body of an object is decoded according to its `(type, version)` pair.
//! Unknown combinations are kept as opaque bytes so they can still be relayed.

use bytes::BufMut;
use std::io::Cursor;

use super::encoding::{
    put_var_bytes, put_var_int, read_array, read_remaining, read_u32, read_var_bytes,
    read_var_int, DecodeError,
};
use super::object::ObjectType;
use crate::crypto::CryptoBox;

/// Upper bound for an embedded signature
pub const MAX_SIGNATURE_SIZE: usize = 80;

/// Request for the public key behind an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetPubkey {
    /// Address versions 2 and 3 ask by RIPE hash
    Ripe { version: u64, ripe: [u8; 20] },
    /// Version 4 asks by tag, hiding the address
    Tag([u8; 32]),
}

/// Published public keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubkeyPayload {
    V2 {
        behavior: u32,
        signing_key: [u8; 64],
        encryption_key: [u8; 64],
    },
    V3 {
        behavior: u32,
        signing_key: [u8; 64],
        encryption_key: [u8; 64],
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
        signature: Vec<u8>,
    },
    /// Encrypted with a key derived from the address itself
    V4 { tag: [u8; 32], encrypted: CryptoBox },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastPayload {
    V4 { encrypted: CryptoBox },
    V5 { tag: [u8; 32], encrypted: CryptoBox },
}

/// Decoded object body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectPayload {
    GetPubkey(GetPubkey),
    Pubkey(PubkeyPayload),
    Msg { encrypted: CryptoBox },
    Broadcast(BroadcastPayload),
    Generic {
        object_type: u32,
        version: u64,
        data: Vec<u8>,
    },
}

impl ObjectPayload {
    pub fn decode(object_type: u32, version: u64, body: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(body);
        let payload = match (ObjectType::from_number(object_type), version) {
            (Some(ObjectType::GetPubkey), 2 | 3) => ObjectPayload::GetPubkey(GetPubkey::Ripe {
                version,
                ripe: read_array::<20>(&mut cursor)?,
            }),
            (Some(ObjectType::GetPubkey), 4) => {
                ObjectPayload::GetPubkey(GetPubkey::Tag(read_array::<32>(&mut cursor)?))
            }
            (Some(ObjectType::Pubkey), 2) => ObjectPayload::Pubkey(PubkeyPayload::V2 {
                behavior: read_u32(&mut cursor)?,
                signing_key: read_array::<64>(&mut cursor)?,
                encryption_key: read_array::<64>(&mut cursor)?,
            }),
            (Some(ObjectType::Pubkey), 3) => ObjectPayload::Pubkey(PubkeyPayload::V3 {
                behavior: read_u32(&mut cursor)?,
                signing_key: read_array::<64>(&mut cursor)?,
                encryption_key: read_array::<64>(&mut cursor)?,
                nonce_trials_per_byte: read_var_int(&mut cursor)?,
                extra_bytes: read_var_int(&mut cursor)?,
                signature: read_var_bytes(&mut cursor, MAX_SIGNATURE_SIZE)?,
            }),
            (Some(ObjectType::Pubkey), 4) => {
                let tag = read_array::<32>(&mut cursor)?;
                let encrypted = CryptoBox::from_bytes(&read_remaining(&mut cursor)?)?;
                ObjectPayload::Pubkey(PubkeyPayload::V4 { tag, encrypted })
            }
            (Some(ObjectType::Msg), 1) => ObjectPayload::Msg {
                encrypted: CryptoBox::from_bytes(&read_remaining(&mut cursor)?)?,
            },
            (Some(ObjectType::Broadcast), 4) => ObjectPayload::Broadcast(BroadcastPayload::V4 {
                encrypted: CryptoBox::from_bytes(&read_remaining(&mut cursor)?)?,
            }),
            (Some(ObjectType::Broadcast), 5) => {
                let tag = read_array::<32>(&mut cursor)?;
                let encrypted = CryptoBox::from_bytes(&read_remaining(&mut cursor)?)?;
                ObjectPayload::Broadcast(BroadcastPayload::V5 { tag, encrypted })
            }
            _ => ObjectPayload::Generic {
                object_type,
                version,
                data: read_remaining(&mut cursor)?,
            },
        };

        if (cursor.position() as usize) < body.len() {
            return Err(DecodeError::InvalidData(format!(
                "{} trailing bytes in object type {} v{}",
                body.len() - cursor.position() as usize,
                object_type,
                version
            )));
        }
        Ok(payload)
    }

    pub fn object_type(&self) -> u32 {
        match self {
            ObjectPayload::GetPubkey(_) => ObjectType::GetPubkey.number(),
            ObjectPayload::Pubkey(_) => ObjectType::Pubkey.number(),
            ObjectPayload::Msg { .. } => ObjectType::Msg.number(),
            ObjectPayload::Broadcast(_) => ObjectType::Broadcast.number(),
            ObjectPayload::Generic { object_type, .. } => *object_type,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            ObjectPayload::GetPubkey(GetPubkey::Ripe { version, .. }) => *version,
            ObjectPayload::GetPubkey(GetPubkey::Tag(_)) => 4,
            ObjectPayload::Pubkey(PubkeyPayload::V2 { .. }) => 2,
            ObjectPayload::Pubkey(PubkeyPayload::V3 { .. }) => 3,
            ObjectPayload::Pubkey(PubkeyPayload::V4 { .. }) => 4,
            ObjectPayload::Msg { .. } => 1,
            ObjectPayload::Broadcast(BroadcastPayload::V4 { .. }) => 4,
            ObjectPayload::Broadcast(BroadcastPayload::V5 { .. }) => 5,
            ObjectPayload::Generic { version, .. } => *version,
        }
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        match self {
            ObjectPayload::GetPubkey(GetPubkey::Ripe { ripe, .. }) => buf.put_slice(ripe),
            ObjectPayload::GetPubkey(GetPubkey::Tag(tag)) => buf.put_slice(tag),
            ObjectPayload::Pubkey(PubkeyPayload::V2 {
                behavior,
                signing_key,
                encryption_key,
            }) => {
                buf.put_u32(*behavior);
                buf.put_slice(signing_key);
                buf.put_slice(encryption_key);
            }
            ObjectPayload::Pubkey(PubkeyPayload::V3 {
                behavior,
                signing_key,
                encryption_key,
                nonce_trials_per_byte,
                extra_bytes,
                signature,
            }) => {
                buf.put_u32(*behavior);
                buf.put_slice(signing_key);
                buf.put_slice(encryption_key);
                put_var_int(buf, *nonce_trials_per_byte);
                put_var_int(buf, *extra_bytes);
                put_var_bytes(buf, signature);
            }
            ObjectPayload::Pubkey(PubkeyPayload::V4 { tag, encrypted })
            | ObjectPayload::Broadcast(BroadcastPayload::V5 { tag, encrypted }) => {
                buf.put_slice(tag);
                encrypted.write(buf);
            }
            ObjectPayload::Msg { encrypted }
            | ObjectPayload::Broadcast(BroadcastPayload::V4 { encrypted }) => encrypted.write(buf),
            ObjectPayload::Generic { data, .. } => buf.put_slice(data),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_secret_key, public_key_of};

    fn sample_box() -> CryptoBox {
        CryptoBox::encrypt(b"payload", &public_key_of(&generate_secret_key())).unwrap()
    }

    #[test]
    fn test_getpubkey_dispatch() {
        let ripe = ObjectPayload::decode(0, 3, &[9u8; 20]).unwrap();
        assert_eq!(
            ripe,
            ObjectPayload::GetPubkey(GetPubkey::Ripe { version: 3, ripe: [9u8; 20] })
        );

        let tag = ObjectPayload::decode(0, 4, &[7u8; 32]).unwrap();
        assert_eq!(tag, ObjectPayload::GetPubkey(GetPubkey::Tag([7u8; 32])));
        assert_eq!(tag.to_bytes(), vec![7u8; 32]);
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        assert!(ObjectPayload::decode(0, 4, &[7u8; 31]).is_err());
        assert!(ObjectPayload::decode(0, 4, &[7u8; 33]).is_err());
    }

    #[test]
    fn test_pubkey_v3_layout() {
        let payload = ObjectPayload::Pubkey(PubkeyPayload::V3 {
            behavior: 1,
            signing_key: [1u8; 64],
            encryption_key: [2u8; 64],
            nonce_trials_per_byte: 1000,
            extra_bytes: 1000,
            signature: vec![0x30, 0x01, 0x02],
        });
        let bytes = payload.to_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(ObjectPayload::decode(1, 3, &bytes).unwrap(), payload);
    }

    #[test]
    fn test_encrypted_payloads() {
        let msg = ObjectPayload::Msg { encrypted: sample_box() };
        assert_eq!(ObjectPayload::decode(2, 1, &msg.to_bytes()).unwrap(), msg);

        let broadcast = ObjectPayload::Broadcast(BroadcastPayload::V5 {
            tag: [3u8; 32],
            encrypted: sample_box(),
        });
        assert_eq!(broadcast.version(), 5);
        assert_eq!(ObjectPayload::decode(3, 5, &broadcast.to_bytes()).unwrap(), broadcast);

        // Random bytes are not a valid box
        assert!(ObjectPayload::decode(2, 1, &[0u8; 40]).is_err());
    }

    #[test]
    fn test_unknown_kinds_stay_opaque() {
        let payload = ObjectPayload::decode(42, 1, b"anything").unwrap();
        assert_eq!(payload.object_type(), 42);
        assert_eq!(payload.to_bytes(), b"anything");

        // Known type, unknown version
        assert!(matches!(
            ObjectPayload::decode(1, 9, &[1, 2]).unwrap(),
            ObjectPayload::Generic { version: 9, .. }
        ));
    }
}
