//! Agent descriptors emitted on specialization.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ids::{ArtifactId, CandidateId, DescriptorId, EntryId};

/// How much the agent may act without confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Low,
    Medium,
    High,
}

/// Numeric behaviour parameters. No prompt or persona text lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    /// Trait name → weight in [0, 1] (e.g. "proactiveness").
    pub traits: BTreeMap<String, f64>,
    /// Minimum confidence before the agent acts on a prediction.
    pub confidence_threshold: f64,
}

/// Where a descriptor came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub candidate_id: CandidateId,
    /// Artifact with a completed offline evaluation backing this agent.
    pub artifact_id: ArtifactId,
    pub entry_id: EntryId,
    pub parent_artifact: Option<ArtifactId>,
    pub cycles_completed: u32,
}

/// Analyzer verdict, before lineage is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specialization {
    pub domain: String,
    pub profile: BehaviorProfile,
    pub capabilities: BTreeSet<String>,
    pub autonomy: AutonomyLevel,
}

/// Immutable description of a specialized agent. Re-specialization creates
/// a new descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub descriptor_id: DescriptorId,
    pub domain: String,
    pub profile: BehaviorProfile,
    pub capabilities: BTreeSet<String>,
    pub autonomy: AutonomyLevel,
    pub lineage: Lineage,
    pub created_at: DateTime<Utc>,
}

impl AgentDescriptor {
    pub fn new(specialization: Specialization, lineage: Lineage) -> Self {
        Self {
            descriptor_id: DescriptorId::new(),
            domain: specialization.domain,
            profile: specialization.profile,
            capabilities: specialization.capabilities,
            autonomy: specialization.autonomy,
            lineage,
            created_at: Utc::now(),
        }
    }
}
