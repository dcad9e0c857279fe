//! Proof of work
//!
//! This module provides:
//! - The `ProofOfWorkEngine` interface with sequential and parallel engines
//! - Big-endian byte arithmetic for nonce iteration
//! - The serialized send queue stamping outgoing objects

pub mod bytes;
pub mod engine;
pub mod multithreaded;
pub mod queue;

pub use engine::{
    is_valid_nonce, nonce, trial_value, PowCallback, PowError, ProofOfWorkEngine, SimplePowEngine,
};
pub use multithreaded::MultiThreadedPowEngine;
pub use queue::{JobEvent, JobId, JobStatus, ObjectBuilder, PowQueue};
