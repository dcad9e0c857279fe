//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-512 / SHA-256 / RIPEMD-160 hashing
//! - ECDSA key management (secp256k1)
//! - The ECIES container used for encrypted payloads

pub mod cryptobox;
pub mod hash;
pub mod keys;

pub use cryptobox::{CryptoBox, CURVE_SECP256K1};
pub use hash::{checksum, double_sha512, ripemd160_sha512, sha256, sha512, sha512_concat};
pub use keys::{
    generate_secret_key, public_key_from_bytes, public_key_of, public_key_to_bytes,
    secret_key_from_bytes, sign, verify, CryptoError,
};
