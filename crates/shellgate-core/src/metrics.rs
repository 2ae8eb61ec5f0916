//! Global atomic counters.
//!
//! Incremented at the call site; [`Metrics::flush`] emits them as one
//! `info!` event at the end of a plan.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    steps_classified: AtomicU64,
    steps_executed: AtomicU64,
    steps_failed: AtomicU64,
    confirmations: AtomicU64,
    declines: AtomicU64,
    rollbacks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            steps_classified: AtomicU64::new(0),
            steps_executed: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            confirmations: AtomicU64::new(0),
            declines: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn inc_classified(&self) {
        self.steps_classified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executed(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_confirmations(&self) {
        self.confirmations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_declines(&self) {
        self.declines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            steps_classified = self.steps_classified(),
            steps_executed = self.steps_executed(),
            steps_failed = self.steps_failed(),
            confirmations = self.confirmations(),
            declines = self.declines(),
            rollbacks = self.rollbacks(),
        );
    }

    pub fn steps_classified(&self) -> u64 {
        self.steps_classified.load(Ordering::Relaxed)
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps_executed.load(Ordering::Relaxed)
    }

    pub fn steps_failed(&self) -> u64 {
        self.steps_failed.load(Ordering::Relaxed)
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmations.load(Ordering::Relaxed)
    }

    pub fn declines(&self) -> u64 {
        self.declines.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Reset all counters (tests).
    pub fn reset(&self) {
        for counter in [
            &self.steps_classified,
            &self.steps_executed,
            &self.steps_failed,
            &self.confirmations,
            &self.declines,
            &self.rollbacks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_classified();
        m.inc_classified();
        m.inc_declines();
        assert_eq!(m.steps_classified(), 2);
        assert_eq!(m.declines(), 1);
        assert_eq!(m.rollbacks(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_executed();
        m.inc_failed();
        m.inc_rollbacks();
        m.reset();
        assert_eq!(m.steps_executed(), 0);
        assert_eq!(m.steps_failed(), 0);
        assert_eq!(m.rollbacks(), 0);
    }
}
