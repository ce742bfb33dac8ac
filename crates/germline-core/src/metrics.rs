//! Global atomic counters for the lifecycle orchestrator.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on shutdown or a status tick).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_ingested: u64,
    pub buffers_sealed: u64,
    pub jobs_submitted: u64,
    pub jobs_throttled: u64,
    pub training_attempts_failed: u64,
    pub jobs_failed: u64,
    pub artifacts_registered: u64,
    pub entries_evicted: u64,
    pub exploit_selections: u64,
    pub explore_selections: u64,
    pub candidates_specialized: u64,
    pub candidates_culled: u64,
}

/// Lightweight atomic counters; no allocations, no locking.
pub struct Metrics {
    chunks_ingested: AtomicU64,
    buffers_sealed: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_throttled: AtomicU64,
    training_attempts_failed: AtomicU64,
    jobs_failed: AtomicU64,
    artifacts_registered: AtomicU64,
    entries_evicted: AtomicU64,
    exploit_selections: AtomicU64,
    explore_selections: AtomicU64,
    candidates_specialized: AtomicU64,
    candidates_culled: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            chunks_ingested: AtomicU64::new(0),
            buffers_sealed: AtomicU64::new(0),
            jobs_submitted: AtomicU64::new(0),
            jobs_throttled: AtomicU64::new(0),
            training_attempts_failed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            artifacts_registered: AtomicU64::new(0),
            entries_evicted: AtomicU64::new(0),
            exploit_selections: AtomicU64::new(0),
            explore_selections: AtomicU64::new(0),
            candidates_specialized: AtomicU64::new(0),
            candidates_culled: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    /// Count one of: chunks accepted into a buffer.
    pub fn inc_chunks_ingested(&self) {
        Self::bump(&self.chunks_ingested, "chunks_ingested");
    }

    /// Count one of: buffers sealed for training.
    pub fn inc_buffers_sealed(&self) {
        Self::bump(&self.buffers_sealed, "buffers_sealed");
    }

    /// Count one of: training jobs admitted.
    pub fn inc_jobs_submitted(&self) {
        Self::bump(&self.jobs_submitted, "jobs_submitted");
    }

    /// Count one of: submissions refused at queue depth.
    pub fn inc_jobs_throttled(&self) {
        Self::bump(&self.jobs_throttled, "jobs_throttled");
    }

    /// Count one of: individual attempts that failed or timed out.
    pub fn inc_training_attempts_failed(&self) {
        Self::bump(&self.training_attempts_failed, "training_attempts_failed");
    }

    /// Count one of: jobs that exhausted their retries.
    pub fn inc_jobs_failed(&self) {
        Self::bump(&self.jobs_failed, "jobs_failed");
    }

    /// Count one of: artifacts added to the registry.
    pub fn inc_artifacts_registered(&self) {
        Self::bump(&self.artifacts_registered, "artifacts_registered");
    }

    /// Count one of: registry entries retired.
    pub fn inc_entries_evicted(&self) {
        Self::bump(&self.entries_evicted, "entries_evicted");
    }

    /// Count one of: selections of the top-ranked entry.
    pub fn inc_exploit_selections(&self) {
        Self::bump(&self.exploit_selections, "exploit_selections");
    }

    /// Count one of: uniform exploratory selections.
    pub fn inc_explore_selections(&self) {
        Self::bump(&self.explore_selections, "explore_selections");
    }

    /// Count one of: descriptors emitted.
    pub fn inc_candidates_specialized(&self) {
        Self::bump(&self.candidates_specialized, "candidates_specialized");
    }

    /// Count one of: candidates removed by natural selection.
    pub fn inc_candidates_culled(&self) {
        Self::bump(&self.candidates_culled, "candidates_culled");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_ingested: self.chunks_ingested.load(Ordering::Relaxed),
            buffers_sealed: self.buffers_sealed.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_throttled: self.jobs_throttled.load(Ordering::Relaxed),
            training_attempts_failed: self.training_attempts_failed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            artifacts_registered: self.artifacts_registered.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
            exploit_selections: self.exploit_selections.load(Ordering::Relaxed),
            explore_selections: self.explore_selections.load(Ordering::Relaxed),
            candidates_specialized: self.candidates_specialized.load(Ordering::Relaxed),
            candidates_culled: self.candidates_culled.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            chunks_ingested = s.chunks_ingested,
            buffers_sealed = s.buffers_sealed,
            jobs_submitted = s.jobs_submitted,
            jobs_throttled = s.jobs_throttled,
            training_attempts_failed = s.training_attempts_failed,
            jobs_failed = s.jobs_failed,
            artifacts_registered = s.artifacts_registered,
            entries_evicted = s.entries_evicted,
            exploit_selections = s.exploit_selections,
            explore_selections = s.explore_selections,
            candidates_specialized = s.candidates_specialized,
            candidates_culled = s.candidates_culled,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.chunks_ingested.store(0, Ordering::Relaxed);
        self.buffers_sealed.store(0, Ordering::Relaxed);
        self.jobs_submitted.store(0, Ordering::Relaxed);
        self.jobs_throttled.store(0, Ordering::Relaxed);
        self.training_attempts_failed.store(0, Ordering::Relaxed);
        self.jobs_failed.store(0, Ordering::Relaxed);
        self.artifacts_registered.store(0, Ordering::Relaxed);
        self.entries_evicted.store(0, Ordering::Relaxed);
        self.exploit_selections.store(0, Ordering::Relaxed);
        self.explore_selections.store(0, Ordering::Relaxed);
        self.candidates_specialized.store(0, Ordering::Relaxed);
        self.candidates_culled.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
        m.inc_chunks_ingested();
        m.inc_chunks_ingested();
        m.inc_buffers_sealed();
        m.inc_explore_selections();

        let s = m.snapshot();
        assert_eq!(s.chunks_ingested, 2);
        assert_eq!(s.buffers_sealed, 1);
        assert_eq!(s.explore_selections, 1);
        assert_eq!(s.exploit_selections, 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_jobs_submitted();
        m.inc_jobs_failed();
        m.inc_candidates_specialized();
        m.inc_candidates_culled();
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
