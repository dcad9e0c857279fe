//! ECDSA key management
//!
//! Provides key generation, signing, and verification using the secp256k1
//! elliptic curve. Public keys travel on the wire as 64 raw bytes (X ‖ Y),
//! without the uncompressed-point prefix.

use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::sha256;

/// Errors that can occur during key and box operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Message authentication failed")]
    MacMismatch,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Public key does not belong to the expected address")]
    AddressMismatch,
    #[error("Decode error: {0}")]
    Decode(#[from] crate::core::DecodeError),
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// Generate a fresh random secret key
pub fn generate_secret_key() -> SecretKey {
    let secp = Secp256k1::new();
    let (secret_key, _) = secp.generate_keypair(&mut OsRng);
    secret_key
}

/// Derive the public key of a secret key
pub fn public_key_of(secret_key: &SecretKey) -> PublicKey {
    let secp = Secp256k1::new();
    PublicKey::from_secret_key(&secp, secret_key)
}

/// Encode a public key as its 64 raw coordinate bytes
pub fn public_key_to_bytes(public_key: &PublicKey) -> [u8; 64] {
    let uncompressed = public_key.serialize_uncompressed();
    let mut out = [0u8; 64];
    out.copy_from_slice(&uncompressed[1..]);
    out
}

/// Parse a public key from its 64 raw coordinate bytes
pub fn public_key_from_bytes(bytes: &[u8; 64]) -> Result<PublicKey, CryptoError> {
    let mut uncompressed = [0u8; 65];
    uncompressed[0] = 0x04;
    uncompressed[1..].copy_from_slice(bytes);
    PublicKey::from_slice(&uncompressed).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Parse a secret key from 32 bytes
pub fn secret_key_from_bytes(bytes: &[u8]) -> Result<SecretKey, CryptoError> {
    SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)
}

/// Sign data with a secret key (ECDSA over SHA-256, DER encoded)
pub fn sign(secret_key: &SecretKey, data: &[u8]) -> Vec<u8> {
    let secp = Secp256k1::new();
    let message = Message::from_digest(sha256(data));
    secp.sign_ecdsa(&message, secret_key).serialize_der().to_vec()
}

/// Verify a DER encoded signature over data
pub fn verify(public_key: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
    let secp = Secp256k1::new();
    let message = Message::from_digest(sha256(data));

    let mut sig = match Signature::from_der(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    // Signatures from other implementations may carry a high S value
    sig.normalize_s();

    secp.verify_ecdsa(&message, &sig, public_key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_bytes_roundtrip() {
        let secret = generate_secret_key();
        let public = public_key_of(&secret);
        let bytes = public_key_to_bytes(&public);
        assert_eq!(public_key_from_bytes(&bytes).unwrap(), public);
    }

    #[test]
    fn test_sign_and_verify() {
        let secret = generate_secret_key();
        let public = public_key_of(&secret);
        let signature = sign(&secret, b"Hello, network!");

        assert!(verify(&public, b"Hello, network!", &signature));
        assert!(!verify(&public, b"Hello, network?", &signature));
    }

    #[test]
    fn test_verify_with_other_key_fails() {
        let signature = sign(&generate_secret_key(), b"data");
        let other = public_key_of(&generate_secret_key());
        assert!(!verify(&other, b"data", &signature));
    }

    #[test]
    fn test_garbage_signature_is_rejected() {
        let public = public_key_of(&generate_secret_key());
        assert!(!verify(&public, b"data", &[0x30, 0x01, 0x02]));
    }

    #[test]
    fn test_invalid_point_rejected() {
        assert!(public_key_from_bytes(&[0u8; 64]).is_err());
    }
}
