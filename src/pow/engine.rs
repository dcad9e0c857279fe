//! Proof-of-work engine interface and the sequential reference engine

use log::debug;
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;

use super::bytes::{inc, lt};
use crate::crypto::{sha512, sha512_concat, CryptoError};

/// Receives `(initial_hash, nonce)` once a nonce is found
pub type PowCallback = Box<dyn FnOnce([u8; 64], [u8; 8]) + Send + 'static>;

/// Proof-of-work errors
#[derive(Error, Debug)]
pub enum PowError {
    #[error("Engine finished without reporting a nonce")]
    Abandoned,
    #[error("Proof of work queue is closed")]
    QueueClosed,
    #[error("Could not build object: {0}")]
    Build(#[from] CryptoError),
}

/// Searches for a nonce whose trial value falls below a target.
///
/// Implementations must return immediately and invoke `callback` exactly
/// once, from any thread, when a nonce is found.
pub trait ProofOfWorkEngine: Send + Sync {
    fn calculate_nonce(&self, initial_hash: [u8; 64], target: [u8; 8], callback: PowCallback);
}

/// Leading eight bytes of `SHA-512(SHA-512(nonce ‖ initial_hash))`
pub fn trial_value(nonce: &[u8; 8], initial_hash: &[u8; 64]) -> [u8; 8] {
    let hash = sha512(&sha512_concat(&[&nonce[..], &initial_hash[..]]));
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

/// A nonce is accepted when its trial value is strictly below the target
pub fn is_valid_nonce(nonce: &[u8; 8], initial_hash: &[u8; 64], target: &[u8; 8]) -> bool {
    lt(&trial_value(nonce, initial_hash), target)
}

/// Await a nonce from any engine
pub async fn nonce(
    engine: &dyn ProofOfWorkEngine,
    initial_hash: [u8; 64],
    target: [u8; 8],
) -> Result<[u8; 8], PowError> {
    let (tx, rx) = oneshot::channel();
    engine.calculate_nonce(
        initial_hash,
        target,
        Box::new(move |_: [u8; 64], nonce: [u8; 8]| {
            let _ = tx.send(nonce);
        }),
    );
    rx.await.map_err(|_| PowError::Abandoned)
}

/// Sequential search with a single incrementing counter
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePowEngine;

impl SimplePowEngine {
    pub fn new() -> Self {
        Self
    }

    /// Blocking search starting at nonce 1
    pub fn search(initial_hash: &[u8; 64], target: &[u8; 8]) -> [u8; 8] {
        let mut nonce = [0u8; 8];
        loop {
            inc(&mut nonce);
            if is_valid_nonce(&nonce, initial_hash, target) {
                return nonce;
            }
        }
    }
}

impl ProofOfWorkEngine for SimplePowEngine {
    fn calculate_nonce(&self, initial_hash: [u8; 64], target: [u8; 8], callback: PowCallback) {
        thread::spawn(move || {
            let start = Instant::now();
            let nonce = Self::search(&initial_hash, &target);
            debug!(
                "Sequential proof of work found nonce {} in {:?}",
                u64::from_be_bytes(nonce),
                start.elapsed()
            );
            callback(initial_hash, nonce);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pow_target;

    fn easy_target() -> [u8; 8] {
        pow_target(100, 300, 1, 1)
    }

    #[test]
    fn test_search_finds_valid_nonce() {
        let initial_hash = sha512(b"some object");
        let target = easy_target();
        let nonce = SimplePowEngine::search(&initial_hash, &target);

        assert!(is_valid_nonce(&nonce, &initial_hash, &target));
        assert!(u64::from_be_bytes(nonce) >= 1);
    }

    #[test]
    fn test_zero_target_accepts_nothing() {
        let initial_hash = sha512(b"some object");
        assert!(!is_valid_nonce(&[0, 0, 0, 0, 0, 0, 0, 1], &initial_hash, &[0u8; 8]));
    }

    #[tokio::test]
    async fn test_async_helper_matches_oracle() {
        let initial_hash = sha512(b"async object");
        let target = easy_target();

        let nonce = nonce(&SimplePowEngine::new(), initial_hash, target)
            .await
            .unwrap();
        assert_eq!(nonce, SimplePowEngine::search(&initial_hash, &target));
    }
}
