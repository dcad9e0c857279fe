//! Signed and encrypted extension messages
//!
//! Plaintext layout before encryption:
//!
//! ```text
//! var_int version | var_int stream | pubkey (behaviour, keys, difficulty) | data | var_bytes signature
//! ```
//!
//! The signature covers everything before it. On decryption every byte the
//! header and data readers consume is recorded, so the signature is checked
//! against exactly what was parsed.

use secp256k1::{PublicKey, SecretKey};
use std::io::{self, Cursor, Read};
use thiserror::Error;

use crate::core::encoding::{put_var_bytes, put_var_int, read_var_bytes, read_var_int};
use crate::core::payload::MAX_SIGNATURE_SIZE;
use crate::core::{BitmessageAddress, DecodeError, Pubkey};
use crate::crypto::{sign, verify, CryptoBox, CryptoError};
use crate::network::CustomMessage;

/// Sub-command of the `custom` message carrying an envelope
pub const COMMAND: &str = "ENCRYPTED";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Identity has no private key")]
    NotAnIdentity,
    #[error("Signature check failed")]
    SignatureInvalid,
    #[error("Not an encrypted message: {0}")]
    WrongCommand(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Data that can be placed inside an envelope
pub trait Streamable {
    fn write(&self, buf: &mut Vec<u8>);
}

impl Streamable for Vec<u8> {
    fn write(&self, buf: &mut Vec<u8>) {
        put_var_bytes(buf, self);
    }
}

impl Streamable for String {
    fn write(&self, buf: &mut Vec<u8>) {
        put_var_bytes(buf, self.as_bytes());
    }
}

/// Decrypted data along with the authenticated sender
#[derive(Debug)]
pub struct Decrypted<T> {
    pub sender: BitmessageAddress,
    pub data: T,
}

/// Reader that remembers every byte read through it
pub struct SignatureCheckingReader<R> {
    inner: R,
    consumed: Vec<u8>,
}

impl<R: Read> SignatureCheckingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            consumed: Vec::new(),
        }
    }

    /// Bytes read so far
    pub fn consumed(&self) -> &[u8] {
        &self.consumed
    }

    /// Read the trailing signature, bypassing the recording, and check it
    /// against everything consumed so far
    pub fn check_signature(mut self, signer: &PublicKey) -> Result<(), EnvelopeError> {
        let signature = read_var_bytes(&mut self.inner, MAX_SIGNATURE_SIZE)?;
        if verify(signer, &self.consumed, &signature) {
            Ok(())
        } else {
            Err(EnvelopeError::SignatureInvalid)
        }
    }
}

impl<R: Read> Read for SignatureCheckingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.consumed.extend_from_slice(&buf[..read]);
        Ok(read)
    }
}

/// Reader over a decrypted envelope
pub type PlainReader = SignatureCheckingReader<Cursor<Vec<u8>>>;

/// An envelope: the sender's public key, the data and a signature, encrypted
/// for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    container: CryptoBox,
}

impl SignedEnvelope {
    /// Sign `data` as `identity` and encrypt it for `recipient`
    pub fn sign_and_encrypt<T: Streamable>(
        data: &T,
        identity: &BitmessageAddress,
        recipient: &PublicKey,
    ) -> Result<Self, EnvelopeError> {
        let private_key = identity.private_key().ok_or(EnvelopeError::NotAnIdentity)?;
        let pubkey = identity.pubkey().ok_or(EnvelopeError::NotAnIdentity)?;

        let mut plain = Vec::new();
        put_var_int(&mut plain, identity.version());
        put_var_int(&mut plain, identity.stream());
        pubkey.write(&mut plain);
        data.write(&mut plain);

        let signature = sign(private_key.signing_key(), &plain);
        put_var_bytes(&mut plain, &signature);

        Ok(Self {
            container: CryptoBox::encrypt(&plain, recipient)?,
        })
    }

    /// Decrypt, parse the sender and the data (with `reader`), then verify the
    /// signature. Nothing is returned unless the signature is valid.
    pub fn decrypt<T, F>(
        &self,
        private_key: &SecretKey,
        reader: F,
    ) -> Result<Decrypted<T>, EnvelopeError>
    where
        F: FnOnce(&BitmessageAddress, &mut PlainReader) -> Result<T, DecodeError>,
    {
        let plain = self.container.decrypt(private_key)?;
        let mut input = SignatureCheckingReader::new(Cursor::new(plain));

        let version = read_var_int(&mut input)?;
        let stream = read_var_int(&mut input)?;
        let pubkey = Pubkey::read(version, stream, &mut input)?;
        let signing_key = pubkey.signing_key;
        let sender = BitmessageAddress::from_pubkey(pubkey);

        let data = reader(&sender, &mut input)?;
        input.check_signature(&signing_key)?;
        Ok(Decrypted { sender, data })
    }

    pub fn container(&self) -> &CryptoBox {
        &self.container
    }

    pub fn to_custom(&self) -> CustomMessage {
        CustomMessage::new(COMMAND, self.container.to_bytes())
    }

    pub fn from_custom(message: &CustomMessage) -> Result<Self, EnvelopeError> {
        if message.command != COMMAND {
            return Err(EnvelopeError::WrongCommand(message.command.clone()));
        }
        Ok(Self {
            container: CryptoBox::from_bytes(&message.data)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Behavior;
    use crate::crypto::{generate_secret_key, public_key_of};

    fn identity() -> BitmessageAddress {
        BitmessageAddress::new_identity(1, Behavior::DOES_ACK, false, 1000, 1000)
    }

    fn read_text(_: &BitmessageAddress, r: &mut PlainReader) -> Result<String, DecodeError> {
        let bytes = read_var_bytes(r, 1024)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidString)
    }

    #[test]
    fn test_sign_encrypt_decrypt() {
        let sender = identity();
        let recipient = generate_secret_key();
        let message = "status request".to_string();

        let envelope =
            SignedEnvelope::sign_and_encrypt(&message, &sender, &public_key_of(&recipient))
                .unwrap();
        let decrypted = envelope.decrypt(&recipient, read_text).unwrap();

        assert_eq!(decrypted.data, message);
        assert_eq!(decrypted.sender, sender);
        assert_eq!(decrypted.sender.to_string(), sender.to_string());
    }

    #[test]
    fn test_travels_as_custom_message() {
        let sender = identity();
        let recipient = generate_secret_key();
        let envelope = SignedEnvelope::sign_and_encrypt(
            &vec![1u8, 2, 3],
            &sender,
            &public_key_of(&recipient),
        )
        .unwrap();

        let custom = envelope.to_custom();
        assert_eq!(custom.command, COMMAND);
        let received = SignedEnvelope::from_custom(&custom).unwrap();
        assert_eq!(received, envelope);

        let decrypted = received
            .decrypt(&recipient, |_, r| read_var_bytes(r, 16))
            .unwrap();
        assert_eq!(decrypted.data, vec![1, 2, 3]);

        let other = CustomMessage::new("PLAIN", custom.data);
        assert!(matches!(
            SignedEnvelope::from_custom(&other),
            Err(EnvelopeError::WrongCommand(_))
        ));
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let sender = identity();
        let recipient = generate_secret_key();
        let recipient_public = public_key_of(&recipient);

        // Sign with one identity but claim to be another
        let impostor = identity();
        let private_key = sender.private_key().unwrap();
        let pubkey = impostor.pubkey().unwrap();
        let mut plain = Vec::new();
        put_var_int(&mut plain, impostor.version());
        put_var_int(&mut plain, impostor.stream());
        pubkey.write(&mut plain);
        "forged".to_string().write(&mut plain);
        let signature = sign(private_key.signing_key(), &plain);
        put_var_bytes(&mut plain, &signature);

        let envelope = SignedEnvelope {
            container: CryptoBox::encrypt(&plain, &recipient_public).unwrap(),
        };
        assert!(matches!(
            envelope.decrypt(&recipient, read_text),
            Err(EnvelopeError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_data_is_rejected() {
        let sender = identity();
        let recipient = generate_secret_key();
        let recipient_public = public_key_of(&recipient);

        let mut plain = Vec::new();
        put_var_int(&mut plain, sender.version());
        put_var_int(&mut plain, sender.stream());
        sender.pubkey().unwrap().write(&mut plain);
        "original".to_string().write(&mut plain);
        let signature = sign(sender.private_key().unwrap().signing_key(), &plain);

        // Flip one byte of the data after signing
        let last = plain.len() - 1;
        plain[last] ^= 0x01;
        put_var_bytes(&mut plain, &signature);

        let envelope = SignedEnvelope {
            container: CryptoBox::encrypt(&plain, &recipient_public).unwrap(),
        };
        assert!(matches!(
            envelope.decrypt(&recipient, read_text),
            Err(EnvelopeError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_recipient_key_fails() {
        let sender = identity();
        let recipient = generate_secret_key();
        let envelope = SignedEnvelope::sign_and_encrypt(
            &"secret".to_string(),
            &sender,
            &public_key_of(&recipient),
        )
        .unwrap();

        let result = envelope.decrypt(&generate_secret_key(), read_text);
        assert!(matches!(result, Err(EnvelopeError::Crypto(_))));
    }

    #[test]
    fn test_signing_requires_private_key() {
        let sender = identity();
        let public_only = BitmessageAddress::from_pubkey(sender.pubkey().unwrap().clone());
        let result = SignedEnvelope::sign_and_encrypt(
            &"hello".to_string(),
            &public_only,
            &public_key_of(&generate_secret_key()),
        );
        assert!(matches!(result, Err(EnvelopeError::NotAnIdentity)));
    }

    #[test]
    fn test_reader_records_consumed_bytes() {
        let mut reader = SignatureCheckingReader::new(Cursor::new(vec![1u8, 2, 3, 4]));
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.consumed(), &[1, 2, 3]);
    }
}
