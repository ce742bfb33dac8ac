//! Trained artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ids::{ArtifactId, CandidateId};

/// Opaque handle to trained weights/state owned by the training runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle(pub String);

impl std::fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of one successful training invocation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub artifact_id: ArtifactId,
    pub candidate_id: CandidateId,
    /// Artifact this one was fine-tuned from, if any.
    pub parent_artifact: Option<ArtifactId>,
    /// Training cycle of the sealed buffer that produced it.
    pub cycle: u64,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub handle: ArtifactHandle,
}
