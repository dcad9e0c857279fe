//! Parallel nonce search across OS threads
//!
//! Worker `i` of `n` starts at nonce `i + 1` and advances by `n`, so the
//! workers partition the nonce space without coordination. A shared stop flag
//! is polled on every trial; the first worker to find a nonce takes the
//! callback out of its slot, later finders see an empty slot and return.

use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use super::bytes::inc_by;
use super::engine::{is_valid_nonce, PowCallback, ProofOfWorkEngine};

/// Strides must fit the single-byte increment
const MAX_WORKERS: usize = u8::MAX as usize;

/// Parallel engine, one worker per CPU by default
#[derive(Debug, Clone)]
pub struct MultiThreadedPowEngine {
    workers: usize,
}

impl MultiThreadedPowEngine {
    pub fn new() -> Self {
        Self::with_workers(num_cpus::get())
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.clamp(1, MAX_WORKERS),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Default for MultiThreadedPowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProofOfWorkEngine for MultiThreadedPowEngine {
    fn calculate_nonce(&self, initial_hash: [u8; 64], target: [u8; 8], callback: PowCallback) {
        let stop = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(Mutex::new(Some(callback)));
        let start = Instant::now();

        for index in 0..self.workers {
            let worker = Worker {
                index,
                stride: self.workers as u8,
                initial_hash,
                target,
                stop: Arc::clone(&stop),
                slot: Arc::clone(&slot),
                start,
            };
            thread::Builder::new()
                .name(format!("pow-worker-{index}"))
                .spawn(move || worker.run())
                .unwrap_or_else(|e| panic!("cannot spawn proof of work thread: {e}"));
        }
    }
}

struct Worker {
    index: usize,
    stride: u8,
    initial_hash: [u8; 64],
    target: [u8; 8],
    stop: Arc<AtomicBool>,
    slot: Arc<Mutex<Option<PowCallback>>>,
    start: Instant,
}

impl Worker {
    fn run(self) {
        let mut nonce = [0u8; 8];
        inc_by(&mut nonce, self.index as u8 + 1);

        while !self.stop.load(Ordering::Relaxed) {
            if is_valid_nonce(&nonce, &self.initial_hash, &self.target) {
                self.stop.store(true, Ordering::SeqCst);
                let callback = self.slot.lock().ok().and_then(|mut slot| slot.take());
                if let Some(callback) = callback {
                    debug!(
                        "Worker {} found nonce {} in {:?}",
                        self.index,
                        u64::from_be_bytes(nonce),
                        self.start.elapsed()
                    );
                    callback(self.initial_hash, nonce);
                }
                return;
            }
            inc_by(&mut nonce, self.stride);
        }
    }
}
