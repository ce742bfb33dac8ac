//! Structured observability hooks for candidate lifecycle events.
//!
//! Events are emitted at `info!` level with a stable `event` field so log
//! pipelines can filter on it. Failures go out at `warn!`.

use tracing::{info, warn};

use crate::domain::{CandidateId, EntryId, JobId, LifecycleState};

/// RAII guard that enters a candidate-scoped span.
///
/// ```ignore
/// let _span = CandidateSpan::enter(candidate_id);
/// // everything logged here carries candidate = "c3.1"
/// ```
pub struct CandidateSpan {
    _span: tracing::span::EnteredSpan,
}

impl CandidateSpan {
    pub fn enter(candidate: CandidateId) -> Self {
        let span = tracing::info_span!("germline.candidate", candidate = %candidate);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_state_changed(candidate: CandidateId, from: LifecycleState, to: LifecycleState) {
    info!(event = "candidate.state_changed", candidate = %candidate, from = %from, to = %to);
}

pub fn emit_buffer_sealed(candidate: CandidateId, cycle: u64, total_bytes: u64, chunks: usize) {
    info!(
        event = "buffer.sealed",
        candidate = %candidate,
        cycle = cycle,
        total_bytes = total_bytes,
        chunks = chunks,
    );
}

pub fn emit_job_submitted(job: JobId, candidate: CandidateId, queue_depth: usize) {
    info!(event = "job.submitted", job = %job, candidate = %candidate, queue_depth = queue_depth);
}

pub fn emit_attempt_failed(job: JobId, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(event = "job.attempt_failed", job = %job, attempt = attempt, error = %error);
}

/// Emit event: job reached a terminal status.
pub fn emit_job_finished(job: JobId, candidate: CandidateId, attempts: u32, success: bool) {
    info!(
        event = "job.finished",
        job = %job,
        candidate = %candidate,
        attempts = attempts,
        success = success,
    );
}

pub fn emit_artifact_registered(entry: EntryId, candidate: CandidateId, offline_quality: f64) {
    info!(
        event = "registry.registered",
        entry = %entry,
        candidate = %candidate,
        offline_quality = offline_quality,
    );
}

pub fn emit_entry_promoted(entry: EntryId, active: usize) {
    info!(event = "registry.promoted", entry = %entry, active = active);
}

pub fn emit_entry_evicted(entry: EntryId, blended_score: f64) {
    info!(event = "registry.evicted", entry = %entry, blended_score = blended_score);
}

pub fn emit_candidate_culled(candidate: CandidateId, fitness: f64, threshold: f64) {
    info!(
        event = "candidate.culled",
        candidate = %candidate,
        fitness = fitness,
        threshold = threshold,
    );
}

pub fn emit_candidate_specialized(candidate: CandidateId, domain: &str, capabilities: usize) {
    info!(
        event = "candidate.specialized",
        candidate = %candidate,
        domain = %domain,
        capabilities = capabilities,
    );
}

/// Emit event: a lifecycle step failed and the candidate fell back (warning level).
pub fn emit_lifecycle_error(candidate: CandidateId, stage: &str, error: &dyn std::fmt::Display) {
    warn!(event = "candidate.error", candidate = %candidate, stage = %stage, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_span_enters() {
        let _span = CandidateSpan::enter(CandidateId::new(0, 0));
        emit_state_changed(
            CandidateId::new(0, 0),
            LifecycleState::Observing,
            LifecycleState::Buffering,
        );
    }
}
