//! Candidate records and the lifecycle state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::chunk::{sanitize_unit, PatternSummary};
use crate::domain::error::{LifecycleError, Result};
use crate::domain::ids::{ArtifactId, CandidateId, EntryId};

/// Lifecycle state of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Fresh; no data accepted yet.
    Observing,
    /// Accumulating chunks toward the next seal.
    Buffering,
    /// Sealed buffer waiting for scheduler admission.
    TrainingReady,
    /// Training job in flight.
    Training,
    /// Awaiting offline score for the freshly trained artifact.
    Evaluating,
    /// Handed to the specialization analyzer.
    Specializing,
    /// Terminal.
    Retired,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Retired, _) => false,
            (_, Retired) => true,
            (Observing, Buffering | TrainingReady) => true,
            (Buffering, TrainingReady | Specializing) => true,
            (TrainingReady, Training | Specializing) => true,
            (Training, Evaluating | Buffering | TrainingReady) => true,
            (Evaluating, Buffering | TrainingReady | Specializing) => true,
            (Specializing, Buffering | TrainingReady) => true,
            _ => false,
        }
    }

    /// States in which a restart must discard in-flight work.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            LifecycleState::TrainingReady
                | LifecycleState::Training
                | LifecycleState::Evaluating
                | LifecycleState::Specializing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Observing => "observing",
            LifecycleState::Buffering => "buffering",
            LifecycleState::TrainingReady => "training_ready",
            LifecycleState::Training => "training",
            LifecycleState::Evaluating => "evaluating",
            LifecycleState::Specializing => "specializing",
            LifecycleState::Retired => "retired",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The latest artifact a candidate produced that passed offline evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatedArtifact {
    pub artifact_id: ArtifactId,
    pub entry_id: EntryId,
}

/// One unit of continual learning ("embryo").
///
/// Owned by the lifecycle supervisor; every state change goes through
/// [`Candidate::transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub state: LifecycleState,
    /// Bytes in the buffer currently being filled.
    pub accumulated_bytes: u64,
    pub byte_budget: u64,
    /// Domain → running affinity score in [0, 1].
    pub specialization: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time capture delivered a chunk.
    #[serde(default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
    /// Training cycles whose artifact passed offline evaluation.
    pub cycles_completed: u32,
    /// Jobs that failed permanently since the last success.
    pub failed_cycles: u32,
    /// Pattern-tagged chunks folded in across all evaluated cycles.
    #[serde(default)]
    pub patterns_detected: u64,
    pub latest_artifact: Option<EvaluatedArtifact>,
}

impl Candidate {
    pub fn new(id: CandidateId, byte_budget: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: LifecycleState::Observing,
            accumulated_bytes: 0,
            byte_budget,
            specialization: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            last_activity: now,
            cycles_completed: 0,
            failed_cycles: 0,
            patterns_detected: 0,
            latest_artifact: None,
        }
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: LifecycleState) -> Result<LifecycleState> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                candidate: self.id,
                from: self.state,
                to: next,
            });
        }
        let previous = std::mem::replace(&mut self.state, next);
        self.updated_at = Utc::now();
        Ok(previous)
    }

    /// Fold one cycle's pattern summary into the specialization map with an
    /// exponential moving average. Domains absent from the summary decay.
    pub fn fold_pattern_summary(&mut self, summary: &PatternSummary, learning_rate: f64) {
        let alpha = sanitize_unit(learning_rate);
        for score in self.specialization.values_mut() {
            *score *= 1.0 - alpha;
        }
        for (domain, share) in &summary.domain_shares {
            *self.specialization.entry(domain.clone()).or_insert(0.0) +=
                alpha * sanitize_unit(*share);
        }
        self.patterns_detected += summary.tagged_chunks;
        self.updated_at = Utc::now();
    }

    /// Strongest domain affinity; ties resolve to the lexically first domain.
    pub fn dominant_domain(&self) -> Option<(&str, f64)> {
        self.specialization
            .iter()
            .fold(None, |best: Option<(&str, f64)>, (d, s)| match best {
                Some((_, bs)) if bs >= *s => best,
                _ => Some((d.as_str(), *s)),
            })
    }

    /// Natural-selection fitness at `now`.
    ///
    /// Rewards pattern volume (saturating at 100 tagged chunks), a strong
    /// niche and patterns per MiB of budget; idle time costs 0.1 per hour,
    /// at most 0.8. Never negative.
    pub fn fitness(&self, now: DateTime<Utc>) -> f64 {
        let patterns = self.patterns_detected as f64;
        let detection = (patterns / 100.0).min(1.0);
        let niche = self.dominant_domain().map_or(0.0, |(_, score)| score) * 0.5;
        let budget_mib = self.byte_budget as f64 / (1024.0 * 1024.0);
        let efficiency = if budget_mib > 0.0 {
            (patterns / budget_mib / 10.0).min(0.3)
        } else {
            0.0
        };
        let idle_hours = (now - self.last_activity).num_seconds().max(0) as f64 / 3600.0;
        let idle_penalty = (idle_hours * 0.1).min(0.8);
        (detection + niche + efficiency - idle_penalty).max(0.0)
    }

    /// Whether the candidate has found a stable niche.
    pub fn is_mature(&self, confidence_threshold: f64, min_cycles: u32) -> bool {
        self.latest_artifact.is_some()
            && self.cycles_completed >= min_cycles
            && self
                .dominant_domain()
                .is_some_and(|(_, score)| score >= confidence_threshold)
    }
}
