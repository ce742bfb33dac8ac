//! Domain models for germline.
//!
//! Canonical definitions for the core entities:
//! - `Candidate`: one unit of continual learning and its lifecycle state
//! - `DataChunk` / `SealedBuffer`: captured data and training snapshots
//! - `ModelArtifact`: output of one training invocation
//! - `EvaluationScore`: offline quality blended with live feedback
//! - `AgentDescriptor`: output of specialization

pub mod artifact;
pub mod candidate;
pub mod chunk;
pub mod descriptor;
pub mod error;
pub mod ids;
pub mod score;

// Re-export main types and errors
pub use artifact::{ArtifactHandle, ModelArtifact};
pub use candidate::{Candidate, EvaluatedArtifact, LifecycleState};
pub use chunk::{ChunkMetadata, DataChunk, PatternSignal, PatternSummary, SealedBuffer};
pub use descriptor::{AgentDescriptor, AutonomyLevel, BehaviorProfile, Lineage, Specialization};
pub use error::{LifecycleError, Result};
pub use ids::{ArtifactId, CandidateId, DescriptorId, EntryId, JobId};
pub use score::{EvaluationScore, FeedbackOutcome};
