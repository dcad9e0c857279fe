//! Protocol extensions
//!
//! Messages carried in `custom` frames on top of the core protocol.

pub mod crypto_message;

pub use crypto_message::{
    Decrypted, EnvelopeError, PlainReader, SignatureCheckingReader, SignedEnvelope, Streamable,
    COMMAND as ENCRYPTED_COMMAND,
};
