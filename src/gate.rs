//! Process-wide accelerator gate.
//!
//! The accelerator context is bound to the process that initialized it:
//! concurrent use, or use from a forked child, is undefined behavior. Every
//! accelerator-bound call (transcription, in-process hardware encode) must
//! therefore hold this single exclusive lock, no matter which lane invoked
//! it. Subprocess encoders run their own process and are exempt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{error, info};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

use crate::error::StageError;

pub struct AcceleratorGate {
    lock: Mutex<()>,
    wait_bound: Duration,
    acquisitions: AtomicU64,
    in_flight: AtomicBool,
    overlap: AtomicBool,
}

/// Scoped acquisition token. The gate is released on every exit path when
/// the guard drops.
pub struct GateGuard<'a> {
    gate: &'a AcceleratorGate,
    _permit: MutexGuard<'a, ()>,
}

impl AcceleratorGate {
    pub fn new(wait_bound: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            wait_bound,
            acquisitions: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            overlap: AtomicBool::new(false),
        }
    }

    /// Acquires the gate, waiting at most the configured bound. A timeout
    /// fails the calling stage, not the process.
    pub async fn acquire(&self, task_id: &str) -> Result<GateGuard<'_>, StageError> {
        let permit = timeout(self.wait_bound, self.lock.lock())
            .await
            .map_err(|_| StageError::GateTimeout(self.wait_bound))?;
        if self.in_flight.swap(true, Ordering::SeqCst) {
            // The mutex makes this unreachable; record it loudly if it
            // ever happens instead of corrupting the accelerator context.
            self.overlap.store(true, Ordering::SeqCst);
            error!("[{task_id}] accelerator gate overlap detected");
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        info!("[{task_id}] accelerator gate acquired");
        Ok(GateGuard {
            gate: self,
            _permit: permit,
        })
    }

    /// Total successful acquisitions since startup.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Sticky flag: true if two holders were ever observed at once.
    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // Cleared before the mutex releases, so the next holder always
        // observes in_flight == false.
        self.gate.in_flight.store(false, Ordering::SeqCst);
    }
}
