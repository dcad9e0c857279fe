//! Proof-of-work stamped objects, the unit of gossip
//!
//! Wire layout: `nonce(8) ‖ expires(8) ‖ type(4) ‖ var_int version ‖
//! var_int stream ‖ body`.

use bytes::BufMut;
use chrono::Utc;
use std::io::Cursor;
use thiserror::Error;

use super::encoding::{
    put_var_int, read_array, read_i64, read_remaining, read_u32, read_var_int, DecodeError,
};
use super::inventory_vector::InventoryVector;
use super::payload::ObjectPayload;
use crate::crypto::sha512;
use crate::pow;

// =============================================================================
// Object Constants
// =============================================================================

pub const MINUTE: i64 = 60;
pub const HOUR: i64 = 60 * MINUTE;
pub const DAY: i64 = 24 * HOUR;

/// Largest object accepted from the network
pub const MAX_OBJECT_SIZE: usize = 1 << 18;

/// Objects may live at most 28 days, plus three hours of clock skew
pub const MAX_TTL: i64 = 28 * DAY + 3 * HOUR;

/// Objects expired for longer than this are no longer relayed
pub const EXPIRY_GRACE: i64 = HOUR;

/// Lower bound applied to the TTL in the target formula
pub const MIN_POW_TTL: i64 = 300;

/// Network minimum for nonce trials per byte
pub const NETWORK_NONCE_TRIALS_PER_BYTE: u64 = 1000;

/// Network minimum for extra payload bytes
pub const NETWORK_EXTRA_BYTES: u64 = 1000;

/// Current unix time in seconds
pub fn unix_time() -> i64 {
    Utc::now().timestamp()
}

/// Object validation failures; the object is dropped, the peer is kept
#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("Insufficient proof of work")]
    InsufficientProofOfWork,
    #[error("Object expired at {0}")]
    Expired(i64),
    #[error("Object expires too far in the future ({0})")]
    TooFarInFuture(i64),
    #[error("Object belongs to stream {0}")]
    WrongStream(u64),
    #[error("Object too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
    #[error("Malformed object: {0}")]
    Malformed(#[from] DecodeError),
}

/// Known object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    GetPubkey,
    Pubkey,
    Msg,
    Broadcast,
}

impl ObjectType {
    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            0 => Some(ObjectType::GetPubkey),
            1 => Some(ObjectType::Pubkey),
            2 => Some(ObjectType::Msg),
            3 => Some(ObjectType::Broadcast),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            ObjectType::GetPubkey => 0,
            ObjectType::Pubkey => 1,
            ObjectType::Msg => 2,
            ObjectType::Broadcast => 3,
        }
    }
}

/// A gossiped object with its opaque body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMessage {
    pub nonce: [u8; 8],
    pub expires_time: i64,
    pub object_type: u32,
    pub version: u64,
    pub stream: u64,
    pub body: Vec<u8>,
}

impl ObjectMessage {
    /// Create an unstamped object (nonce zero)
    pub fn new(expires_time: i64, object_type: u32, version: u64, stream: u64, body: Vec<u8>) -> Self {
        Self {
            nonce: [0u8; 8],
            expires_time,
            object_type,
            version,
            stream,
            body,
        }
    }

    /// Create an unstamped object carrying a typed payload
    pub fn with_payload(expires_time: i64, stream: u64, payload: &ObjectPayload) -> Self {
        Self::new(
            expires_time,
            payload.object_type(),
            payload.version(),
            stream,
            payload.to_bytes(),
        )
    }

    pub fn kind(&self) -> Option<ObjectType> {
        ObjectType::from_number(self.object_type)
    }

    /// Decode the body according to `(object_type, version)`
    pub fn payload(&self) -> Result<ObjectPayload, DecodeError> {
        ObjectPayload::decode(self.object_type, self.version, &self.body)
    }

    /// Header fields covered by signatures: everything but the nonce and body
    pub fn write_header(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.expires_time);
        buf.put_u32(self.object_type);
        put_var_int(buf, self.version);
        put_var_int(buf, self.stream);
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(22);
        self.write_header(&mut buf);
        buf
    }

    pub fn bytes_without_nonce(&self) -> Vec<u8> {
        let mut buf = self.header_bytes();
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.nonce);
        self.write_header(buf);
        buf.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 22 + self.body.len());
        self.write(&mut buf);
        buf
    }

    pub fn read(data: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(data);
        let nonce = read_array::<8>(&mut cursor)?;
        let expires_time = read_i64(&mut cursor)?;
        let object_type = read_u32(&mut cursor)?;
        let version = read_var_int(&mut cursor)?;
        let stream = read_var_int(&mut cursor)?;
        let body = read_remaining(&mut cursor)?;
        Ok(Self {
            nonce,
            expires_time,
            object_type,
            version,
            stream,
            body,
        })
    }

    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }

    pub fn inventory_vector(&self) -> InventoryVector {
        InventoryVector::of_object_bytes(&self.to_bytes())
    }

    /// SHA-512 of the object without its nonce; the proof-of-work input
    pub fn initial_hash(&self) -> [u8; 64] {
        sha512(&self.bytes_without_nonce())
    }

    /// Target this object's nonce must fall under at time `now`
    pub fn target(&self, nonce_trials_per_byte: u64, extra_bytes: u64, now: i64) -> [u8; 8] {
        pow_target(
            self.bytes_without_nonce().len(),
            self.expires_time - now,
            nonce_trials_per_byte,
            extra_bytes,
        )
    }

    pub fn is_pow_valid(&self, nonce_trials_per_byte: u64, extra_bytes: u64, now: i64) -> bool {
        let target = self.target(nonce_trials_per_byte, extra_bytes, now);
        pow::is_valid_nonce(&self.nonce, &self.initial_hash(), &target)
    }

    /// Structural and proof-of-work checks applied to every received object
    pub fn validate(
        &self,
        streams: &[u64],
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
        now: i64,
    ) -> Result<(), ObjectError> {
        let size = self.size();
        if size > MAX_OBJECT_SIZE {
            return Err(ObjectError::TooLarge(size, MAX_OBJECT_SIZE));
        }
        if self.expires_time - now > MAX_TTL {
            return Err(ObjectError::TooFarInFuture(self.expires_time));
        }
        if now - self.expires_time > EXPIRY_GRACE {
            return Err(ObjectError::Expired(self.expires_time));
        }
        if !streams.contains(&self.stream) {
            return Err(ObjectError::WrongStream(self.stream));
        }
        self.payload()?;
        if !self.is_pow_valid(nonce_trials_per_byte, extra_bytes, now) {
            return Err(ObjectError::InsufficientProofOfWork);
        }
        Ok(())
    }
}

/// Network proof-of-work target:
/// `2^64 / (ntpb · (len + extra + ttl · (len + extra) / 2^16))`
/// where `len` is the payload length without nonce plus eight.
pub fn pow_target(
    payload_length: usize,
    ttl: i64,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
) -> [u8; 8] {
    let ttl = ttl.max(MIN_POW_TTL) as u128;
    let length = payload_length as u128 + 8 + extra_bytes as u128;
    let denominator = nonce_trials_per_byte.max(1) as u128 * (length + ttl * length / (1 << 16));
    let target = (1u128 << 64) / denominator;
    u64::try_from(target).unwrap_or(u64::MAX).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::SimplePowEngine;

    fn sample_object(now: i64) -> ObjectMessage {
        ObjectMessage::new(now + 10 * MINUTE, 42, 1, 1, b"opaque body".to_vec())
    }

    fn stamp(object: &mut ObjectMessage, now: i64) {
        let target = object.target(1, 1, now);
        object.nonce = SimplePowEngine::search(&object.initial_hash(), &target);
    }

    #[test]
    fn test_wire_roundtrip_preserves_inventory_vector() {
        let object = sample_object(1_700_000_000);
        let parsed = ObjectMessage::read(&object.to_bytes()).unwrap();
        assert_eq!(parsed, object);
        assert_eq!(parsed.inventory_vector(), object.inventory_vector());
    }

    #[test]
    fn test_target_matches_reference_formula() {
        // 100 byte payload, 4 days, network defaults
        let ttl = 4 * DAY;
        let length: u128 = 100 + 8 + 1000;
        let expected = (1u128 << 64) / (1000 * (length + ttl as u128 * length / 65536));
        assert_eq!(
            u64::from_be_bytes(pow_target(100, ttl, 1000, 1000)) as u128,
            expected
        );
    }

    #[test]
    fn test_target_clamps_short_ttl() {
        assert_eq!(pow_target(50, -100, 1000, 1000), pow_target(50, MIN_POW_TTL, 1000, 1000));
    }

    #[test]
    fn test_higher_difficulty_lowers_target() {
        let easy = u64::from_be_bytes(pow_target(100, DAY, 1000, 1000));
        let hard = u64::from_be_bytes(pow_target(100, DAY, 2000, 1000));
        assert!(hard < easy);
    }

    #[test]
    fn test_validate_accepts_stamped_object() {
        let now = 1_700_000_000;
        let mut object = sample_object(now);
        stamp(&mut object, now);
        assert!(object.validate(&[1], 1, 1, now).is_ok());
    }

    #[test]
    fn test_validate_rejects_insufficient_pow() {
        let now = 1_700_000_000;
        let mut object = sample_object(now);
        stamp(&mut object, now);
        // Far harder than what the nonce was computed for
        assert!(matches!(
            object.validate(&[1], u64::MAX / 4, 1000, now),
            Err(ObjectError::InsufficientProofOfWork)
        ));
    }

    #[test]
    fn test_validate_rejects_expired_and_future_objects() {
        let now = 1_700_000_000;
        let mut expired = ObjectMessage::new(now - 2 * HOUR, 42, 1, 1, vec![1]);
        stamp(&mut expired, now);
        assert!(matches!(
            expired.validate(&[1], 1, 1, now),
            Err(ObjectError::Expired(_))
        ));

        let future = ObjectMessage::new(now + 29 * DAY, 42, 1, 1, vec![1]);
        assert!(matches!(
            future.validate(&[1], 1, 1, now),
            Err(ObjectError::TooFarInFuture(_))
        ));
    }

    #[test]
    fn test_validate_rejects_foreign_stream() {
        let now = 1_700_000_000;
        let mut object = sample_object(now);
        stamp(&mut object, now);
        assert!(matches!(
            object.validate(&[2], 1, 1, now),
            Err(ObjectError::WrongStream(1))
        ));
    }

    #[test]
    fn test_validate_rejects_malformed_payload() {
        let now = 1_700_000_000;
        // A getpubkey v4 must carry exactly a 32-byte tag
        let mut object = ObjectMessage::new(now + HOUR, 0, 4, 1, vec![1, 2, 3]);
        stamp(&mut object, now);
        assert!(matches!(
            object.validate(&[1], 1, 1, now),
            Err(ObjectError::Malformed(_))
        ));
    }
}
