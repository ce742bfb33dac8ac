//! Lifecycle events broadcast to observers and the agent runtime.

use serde::{Deserialize, Serialize};

use crate::domain::{AgentDescriptor, ArtifactId, CandidateId, EntryId, JobId, LifecycleState};
use crate::registry::EntryStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    CandidateSpawned {
        candidate: CandidateId,
    },
    StateChanged {
        candidate: CandidateId,
        from: LifecycleState,
        to: LifecycleState,
    },
    BufferSealed {
        candidate: CandidateId,
        cycle: u64,
        total_bytes: u64,
    },
    TrainingSubmitted {
        candidate: CandidateId,
        job: JobId,
    },
    SubmissionThrottled {
        candidate: CandidateId,
        queue_depth: usize,
    },
    TrainingFailed {
        candidate: CandidateId,
        job: JobId,
        reason: String,
    },
    EvaluationFailed {
        candidate: CandidateId,
        reason: String,
    },
    ArtifactRegistered {
        candidate: CandidateId,
        entry: EntryId,
        status: EntryStatus,
        offline_quality: f64,
    },
    EntryRetired {
        entry: EntryId,
        artifact: ArtifactId,
    },
    /// Handoff to the agent runtime.
    Specialized {
        descriptor: Box<AgentDescriptor>,
    },
    SpecializationFailed {
        candidate: CandidateId,
        reason: String,
    },
    /// Removed by natural selection; followed by `CandidateRetired`.
    CandidateCulled {
        candidate: CandidateId,
        fitness: f64,
    },
    CandidateRetired {
        candidate: CandidateId,
    },
}

impl LifecycleEvent {
    /// Candidate the event concerns, if any.
    pub fn candidate(&self) -> Option<CandidateId> {
        use LifecycleEvent::*;
        match self {
            CandidateSpawned { candidate }
            | StateChanged { candidate, .. }
            | BufferSealed { candidate, .. }
            | TrainingSubmitted { candidate, .. }
            | SubmissionThrottled { candidate, .. }
            | TrainingFailed { candidate, .. }
            | EvaluationFailed { candidate, .. }
            | ArtifactRegistered { candidate, .. }
            | SpecializationFailed { candidate, .. }
            | CandidateCulled { candidate, .. }
            | CandidateRetired { candidate } => Some(*candidate),
            Specialized { descriptor } => Some(descriptor.lineage.candidate_id),
            EntryRetired { .. } => None,
        }
    }
}
