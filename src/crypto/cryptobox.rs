//! ECIES container used for every encrypted payload
//!
//! Layout: `IV(16) ‖ curve(2) ‖ len(2) ‖ X ‖ len(2) ‖ Y ‖ ciphertext ‖ MAC(32)`.
//! The shared secret is the X coordinate of `r·K`; its SHA-512 is split into an
//! AES-256-CBC key and an HMAC-SHA256 key.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::BufMut;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{ecdh, PublicKey, SecretKey};
use sha2::Sha256;
use std::io::{Cursor, Read};

use super::hash::sha512;
use super::keys::{generate_secret_key, public_key_from_bytes, public_key_of, CryptoError};
use crate::core::encoding::{read_array, read_bytes, read_u16, DecodeError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Curve identifier for secp256k1
pub const CURVE_SECP256K1: u16 = 0x02CA;

const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const BLOCK_SIZE: usize = 16;

/// An encrypted, authenticated blob addressed to one public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoBox {
    iv: [u8; IV_SIZE],
    curve_type: u16,
    r: PublicKey,
    encrypted: Vec<u8>,
    mac: [u8; MAC_SIZE],
}

/// Encryption and MAC keys derived from the ECDH shared point
struct SessionKeys {
    encryption: [u8; 32],
    mac: [u8; 32],
}

impl SessionKeys {
    fn derive(point: &PublicKey, scalar: &SecretKey) -> Self {
        let shared = ecdh::shared_secret_point(point, scalar);
        let hash = sha512(&shared[..32]);
        let mut encryption = [0u8; 32];
        let mut mac = [0u8; 32];
        encryption.copy_from_slice(&hash[..32]);
        mac.copy_from_slice(&hash[32..]);
        Self { encryption, mac }
    }
}

impl CryptoBox {
    /// Encrypt data for the owner of `recipient`
    pub fn encrypt(data: &[u8], recipient: &PublicKey) -> Result<Self, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ephemeral = generate_secret_key();
        let r = public_key_of(&ephemeral);
        let keys = SessionKeys::derive(recipient, &ephemeral);

        let encrypted = Aes256CbcEnc::new_from_slices(&keys.encryption, &iv)
            .map_err(|_| CryptoError::InvalidPrivateKey)?
            .encrypt_padded_vec_mut::<Pkcs7>(data);

        let mut container = Self {
            iv,
            curve_type: CURVE_SECP256K1,
            r,
            encrypted,
            mac: [0u8; MAC_SIZE],
        };
        container.mac = container.compute_mac(&keys.mac)?;
        Ok(container)
    }

    /// Verify the MAC and decrypt with the recipient's private encryption key
    pub fn decrypt(&self, private_key: &SecretKey) -> Result<Vec<u8>, CryptoError> {
        let keys = SessionKeys::derive(&self.r, private_key);

        let mut mac = HmacSha256::new_from_slice(&keys.mac)
            .map_err(|_| CryptoError::InvalidPrivateKey)?;
        mac.update(&self.authenticated_prefix());
        mac.verify_slice(&self.mac)
            .map_err(|_| CryptoError::MacMismatch)?;

        Aes256CbcDec::new_from_slices(&keys.encryption, &self.iv)
            .map_err(|_| CryptoError::InvalidPrivateKey)?
            .decrypt_padded_vec_mut::<Pkcs7>(&self.encrypted)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn compute_mac(&self, key: &[u8]) -> Result<[u8; MAC_SIZE], CryptoError> {
        let mut mac =
            HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidPrivateKey)?;
        mac.update(&self.authenticated_prefix());
        Ok(mac.finalize().into_bytes().into())
    }

    /// IV, encoded ephemeral key and ciphertext: everything the MAC covers
    fn authenticated_prefix(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IV_SIZE + 70 + self.encrypted.len());
        buf.put_slice(&self.iv);
        self.write_public_key(&mut buf);
        buf.put_slice(&self.encrypted);
        buf
    }

    fn write_public_key(&self, buf: &mut impl BufMut) {
        let point = self.r.serialize_uncompressed();
        buf.put_u16(self.curve_type);
        buf.put_u16(32);
        buf.put_slice(&point[1..33]);
        buf.put_u16(32);
        buf.put_slice(&point[33..65]);
    }

    /// Serialize the container
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.iv);
        self.write_public_key(buf);
        buf.put_slice(&self.encrypted);
        buf.put_slice(&self.mac);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf);
        buf
    }

    /// Parse a container occupying the whole of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(data);
        let iv = read_array::<IV_SIZE>(&mut cursor)?;
        let curve_type = read_u16(&mut cursor)?;
        if curve_type != CURVE_SECP256K1 {
            return Err(DecodeError::InvalidData(format!(
                "unsupported curve {curve_type:#06x}"
            )));
        }
        let x = read_coordinate(&mut cursor)?;
        let y = read_coordinate(&mut cursor)?;

        let mut coordinates = [0u8; 64];
        coordinates[..32].copy_from_slice(&x);
        coordinates[32..].copy_from_slice(&y);
        let r = public_key_from_bytes(&coordinates)
            .map_err(|_| DecodeError::InvalidData("invalid ephemeral key".to_string()))?;

        let header_len = cursor.position() as usize;
        let remaining = data.len() - header_len;
        if remaining < MAC_SIZE + BLOCK_SIZE || (remaining - MAC_SIZE) % BLOCK_SIZE != 0 {
            return Err(DecodeError::InvalidData(format!(
                "ciphertext of {} bytes is not block aligned",
                remaining.saturating_sub(MAC_SIZE)
            )));
        }
        let encrypted = read_bytes(&mut cursor, remaining - MAC_SIZE)?;
        let mac = read_array::<MAC_SIZE>(&mut cursor)?;

        Ok(Self {
            iv,
            curve_type,
            r,
            encrypted,
            mac,
        })
    }
}

/// Coordinates may be sent with leading zero bytes stripped
fn read_coordinate(r: &mut impl Read) -> Result<[u8; 32], DecodeError> {
    let len = read_u16(r)? as usize;
    if len > 32 {
        return Err(DecodeError::TooLong(len as u64, 32));
    }
    let bytes = read_bytes(r, len)?;
    let mut out = [0u8; 32];
    out[32 - len..].copy_from_slice(&bytes);
    Ok(out)
}
