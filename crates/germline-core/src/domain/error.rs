//! Error taxonomy for the lifecycle orchestrator.

use crate::domain::candidate::LifecycleState;
use crate::domain::ids::{CandidateId, EntryId};

/// Lifecycle orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Chunk can never fit a buffer without being split. Caller error.
    #[error("chunk of {chunk_bytes} bytes exceeds the {budget_bytes}-byte budget of candidate {candidate}")]
    CapacityExceeded {
        candidate: CandidateId,
        chunk_bytes: u64,
        budget_bytes: u64,
    },

    /// Training queue is at its admission depth; retry later.
    #[error("training queue throttled at depth {queue_depth}")]
    Throttled { queue_depth: usize },

    /// Candidate already holds its maximum number of unconsumed sealed buffers.
    #[error("candidate {candidate} has {outstanding} sealed buffers awaiting training; pause capture")]
    Backpressure {
        candidate: CandidateId,
        outstanding: usize,
    },

    #[error("training failed: {0}")]
    TrainingFailure(String),

    #[error("offline evaluation failed: {0}")]
    EvaluationFailure(String),

    #[error("specialization failed: {0}")]
    SpecializationFailure(String),

    /// No Active registry entry exists yet; fall back to default behaviour.
    #[error("model pool is empty")]
    PoolEmpty,

    #[error("candidate not found: {0}")]
    CandidateNotFound(CandidateId),

    #[error("registry entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("candidate {candidate} cannot move from {from} to {to}")]
    InvalidTransition {
        candidate: CandidateId,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("registry entry {0} is already retired")]
    EntryRetired(EntryId),

    #[error("entry {0} is the last active entry and cannot be evicted")]
    LastActiveEntry(EntryId),

    #[error("candidate {0} has no evaluated artifact to specialize from")]
    NotMatured(CandidateId),

    #[error("all {0} candidate slots are occupied")]
    SlotsExhausted(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(#[from] germline_state::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LifecycleError {
    /// Whether the caller should retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LifecycleError::Throttled { .. } | LifecycleError::Backpressure { .. }
        )
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_exceeded_display() {
        let err = LifecycleError::CapacityExceeded {
            candidate: CandidateId::new(2, 0),
            chunk_bytes: 1200,
            budget_bytes: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("1200"));
        assert!(msg.contains("1000"));
        assert!(msg.contains("c2.0"));
    }

    #[test]
    fn transient_classification() {
        assert!(LifecycleError::Throttled { queue_depth: 4 }.is_transient());
        assert!(LifecycleError::Backpressure {
            candidate: CandidateId::new(0, 0),
            outstanding: 2
        }
        .is_transient());
        assert!(!LifecycleError::PoolEmpty.is_transient());
        assert!(!LifecycleError::TrainingFailure("boom".into()).is_transient());
    }

    #[test]
    fn invalid_transition_names_states() {
        let err = LifecycleError::InvalidTransition {
            candidate: CandidateId::new(1, 3),
            from: LifecycleState::Retired,
            to: LifecycleState::Buffering,
        };
        let msg = err.to_string();
        assert!(msg.contains("retired"));
        assert!(msg.contains("buffering"));
    }
}
