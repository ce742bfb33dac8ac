//! Bounded pool of live model artifacts.
//!
//! All mutations take the write half of a single `RwLock`, so promotions and
//! evictions are serialized; readers get cloned snapshots in which no entry
//! is ever both Active and Retired.
//!
//! Invariants maintained by every mutating call:
//! - at most `pool_cap_k` entries are Active;
//! - eviction only runs while the Active count exceeds the cap, so once an
//!   entry has been activated the pool never drops to zero through eviction;
//! - score-driven eviction only considers entries past the grace period.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::OrchestratorConfig;
use crate::domain::{
    ArtifactId, EntryId, EvaluationScore, FeedbackOutcome, LifecycleError, ModelArtifact, Result,
};
use crate::metrics::METRICS;
use crate::obs;

/// Time source, injectable for tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Candidate,
    Active,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub entry_id: EntryId,
    pub artifact: Arc<ModelArtifact>,
    pub score: EvaluationScore,
    pub status: EntryStatus,
    pub registered_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Promotion was deferred because no Active entry was old enough to evict.
    pub pending_activation: bool,
}

impl RegistryEntry {
    pub fn blended(&self, prior_weight: f64) -> f64 {
        self.score.blended(prior_weight)
    }
}

/// Serializable copy of the whole registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub entries: Vec<RegistryEntry>,
    pub next_entry_id: u64,
}

/// An entry that just left the pool.
#[derive(Debug, Clone)]
pub struct Retired {
    pub entry_id: EntryId,
    /// The caller releases its storage.
    pub artifact: Arc<ModelArtifact>,
}

/// Result of a promotion attempt.
#[derive(Debug, Clone)]
pub struct Promotion {
    /// `Active`, or `Candidate` when activation was deferred.
    pub status: EntryStatus,
    pub retired: Vec<Retired>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<EntryId, RegistryEntry>,
    next_entry_id: u64,
}

impl State {
    fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == EntryStatus::Active)
            .count()
    }

    fn get_mut(&mut self, id: EntryId) -> Result<&mut RegistryEntry> {
        self.entries
            .get_mut(&id)
            .ok_or(LifecycleError::EntryNotFound(id))
    }

    fn retire(&mut self, id: EntryId, now: DateTime<Utc>, prior: f64) -> Option<Retired> {
        let entry = self.entries.get_mut(&id)?;
        entry.status = EntryStatus::Retired;
        entry.retired_at = Some(now);
        entry.pending_activation = false;
        METRICS.inc_entries_evicted();
        obs::emit_entry_evicted(id, entry.blended(prior));
        Some(Retired {
            entry_id: id,
            artifact: Arc::clone(&entry.artifact),
        })
    }

    /// Lowest-scoring Active entry satisfying `eligible`. Ties go to the
    /// entry promoted longest ago.
    fn eviction_victim(
        &self,
        prior: f64,
        eligible: impl Fn(&RegistryEntry) -> bool,
    ) -> Option<EntryId> {
        self.entries
            .values()
            .filter(|e| e.status == EntryStatus::Active && eligible(e))
            .min_by(|a, b| {
                a.blended(prior)
                    .total_cmp(&b.blended(prior))
                    .then_with(|| a.promoted_at.cmp(&b.promoted_at))
            })
            .map(|e| e.entry_id)
    }
}

pub struct ModelRegistry {
    state: RwLock<State>,
    pool_cap: usize,
    grace: chrono::Duration,
    prior_weight: f64,
    clock: Clock,
}

impl ModelRegistry {
    pub fn new(pool_cap: usize, grace: std::time::Duration, prior_weight: f64) -> Self {
        Self {
            state: RwLock::new(State::default()),
            pool_cap: pool_cap.max(1),
            grace: chrono::Duration::from_std(grace)
                .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
            prior_weight,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.pool_cap_k,
            config.eviction_grace_period(),
            config.feedback_prior_weight,
        )
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool_cap(&self) -> usize {
        self.pool_cap
    }

    pub fn prior_weight(&self) -> f64 {
        self.prior_weight
    }

    fn past_grace(&self, entry: &RegistryEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.registered_at) >= self.grace
    }

    /// Add an evaluated artifact with status `Candidate`.
    pub async fn register(&self, artifact: Arc<ModelArtifact>, score: EvaluationScore) -> EntryId {
        let now = (self.clock)();
        let mut state = self.state.write().await;
        state.next_entry_id += 1;
        let entry_id = EntryId(state.next_entry_id);
        obs::emit_artifact_registered(entry_id, artifact.candidate_id, score.offline_quality);
        state.entries.insert(
            entry_id,
            RegistryEntry {
                entry_id,
                artifact,
                score,
                status: EntryStatus::Candidate,
                registered_at: now,
                promoted_at: None,
                retired_at: None,
                last_used_at: None,
                pending_activation: false,
            },
        );
        METRICS.inc_artifacts_registered();
        entry_id
    }

    /// Activate a registered entry, evicting the weakest eligible Active
    /// entries while the pool is over its cap.
    ///
    /// If the pool is full and nothing is past the grace period, the entry
    /// stays `Candidate` with `pending_activation` set and is retried by
    /// [`ModelRegistry::rebalance`].
    pub async fn promote(&self, entry_id: EntryId) -> Result<Promotion> {
        let now = (self.clock)();
        let mut state = self.state.write().await;
        let entry = state.get_mut(entry_id)?;
        match entry.status {
            EntryStatus::Retired => return Err(LifecycleError::EntryRetired(entry_id)),
            EntryStatus::Active => {
                return Ok(Promotion {
                    status: EntryStatus::Active,
                    retired: Vec::new(),
                })
            }
            EntryStatus::Candidate => {}
        }
        Ok(self.activate(&mut state, entry_id, now))
    }

    fn activate(&self, state: &mut State, entry_id: EntryId, now: DateTime<Utc>) -> Promotion {
        if let Some(entry) = state.entries.get_mut(&entry_id) {
            entry.status = EntryStatus::Active;
            entry.promoted_at = Some(now);
            entry.pending_activation = false;
        }

        let mut retired = Vec::new();
        while state.active_count() > self.pool_cap {
            let victim = state.eviction_victim(self.prior_weight, |e| self.past_grace(e, now));
            match victim {
                Some(victim) => retired.extend(state.retire(victim, now, self.prior_weight)),
                None => {
                    if let Some(entry) = state.entries.get_mut(&entry_id) {
                        entry.status = EntryStatus::Candidate;
                        entry.promoted_at = None;
                        entry.pending_activation = true;
                    }
                    tracing::debug!(
                        entry = %entry_id,
                        "pool full of young entries; promotion deferred"
                    );
                    return Promotion {
                        status: EntryStatus::Candidate,
                        retired,
                    };
                }
            }
        }

        let status = state
            .entries
            .get(&entry_id)
            .map(|e| e.status)
            .unwrap_or(EntryStatus::Retired);
        if status == EntryStatus::Active {
            obs::emit_entry_promoted(entry_id, state.active_count());
        }
        Promotion { status, retired }
    }

    /// Retry deferred promotions in registration order.
    pub async fn rebalance(&self) -> Vec<Retired> {
        let now = (self.clock)();
        let mut state = self.state.write().await;
        let pending: Vec<EntryId> = state
            .entries
            .values()
            .filter(|e| e.pending_activation)
            .map(|e| e.entry_id)
            .collect();

        let mut retired = Vec::new();
        for id in pending {
            retired.extend(self.activate(&mut state, id, now).retired);
        }
        retired
    }

    /// Retire weakest eligible Active entries until the pool is within its cap.
    pub async fn evict(&self) -> Vec<Retired> {
        let now = (self.clock)();
        let mut state = self.state.write().await;
        let mut retired = Vec::new();
        while state.active_count() > self.pool_cap {
            match state.eviction_victim(self.prior_weight, |e| self.past_grace(e, now)) {
                Some(victim) => retired.extend(state.retire(victim, now, self.prior_weight)),
                None => break,
            }
        }
        retired
    }

    /// Administrative activation ignoring the grace period. The incoming
    /// entry is never the one evicted.
    pub async fn force_promote(&self, entry_id: EntryId) -> Result<Vec<Retired>> {
        let now = (self.clock)();
        let mut state = self.state.write().await;
        let entry = state.get_mut(entry_id)?;
        if entry.status == EntryStatus::Retired {
            return Err(LifecycleError::EntryRetired(entry_id));
        }
        entry.status = EntryStatus::Active;
        entry.promoted_at = Some(now);
        entry.pending_activation = false;

        let mut retired = Vec::new();
        while state.active_count() > self.pool_cap {
            match state.eviction_victim(self.prior_weight, |e| e.entry_id != entry_id) {
                Some(victim) => retired.extend(state.retire(victim, now, self.prior_weight)),
                None => break,
            }
        }
        obs::emit_entry_promoted(entry_id, state.active_count());
        Ok(retired)
    }

    /// Administrative retirement. Refuses to remove the last Active entry.
    pub async fn force_evict(&self, entry_id: EntryId) -> Result<Retired> {
        let now = (self.clock)();
        let mut state = self.state.write().await;
        let status = state.get_mut(entry_id)?.status;
        match status {
            EntryStatus::Retired => Err(LifecycleError::EntryRetired(entry_id)),
            EntryStatus::Active if state.active_count() <= 1 => {
                Err(LifecycleError::LastActiveEntry(entry_id))
            }
            _ => state
                .retire(entry_id, now, self.prior_weight)
                .ok_or(LifecycleError::EntryNotFound(entry_id)),
        }
    }

    /// Fold one feedback outcome into an entry's running score.
    pub async fn record_feedback(
        &self,
        entry_id: EntryId,
        outcome: FeedbackOutcome,
    ) -> Result<EvaluationScore> {
        let mut state = self.state.write().await;
        let entry = state.get_mut(entry_id)?;
        entry.score.observe(outcome);
        Ok(entry.score.clone())
    }

    pub async fn mark_used(&self, entry_id: EntryId) -> Result<()> {
        let now = (self.clock)();
        let mut state = self.state.write().await;
        state.get_mut(entry_id)?.last_used_at = Some(now);
        Ok(())
    }

    /// Active entries, best blended score first; ties prefer the more
    /// recently promoted entry.
    pub async fn get_active_pool(&self) -> Vec<RegistryEntry> {
        let state = self.state.read().await;
        let mut pool: Vec<RegistryEntry> = state
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Active)
            .cloned()
            .collect();
        let prior = self.prior_weight;
        pool.sort_by(|a, b| {
            b.blended(prior)
                .total_cmp(&a.blended(prior))
                .then_with(|| b.promoted_at.cmp(&a.promoted_at))
        });
        pool
    }

    pub async fn entry(&self, entry_id: EntryId) -> Option<RegistryEntry> {
        self.state.read().await.entries.get(&entry_id).cloned()
    }

    pub async fn entry_for_artifact(&self, artifact_id: ArtifactId) -> Option<RegistryEntry> {
        self.state
            .read()
            .await
            .entries
            .values()
            .find(|e| e.artifact.artifact_id == artifact_id)
            .cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.state.read().await.active_count()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read().await;
        RegistrySnapshot {
            entries: state.entries.values().cloned().collect(),
            next_entry_id: state.next_entry_id,
        }
    }

    /// Replace the registry contents with a snapshot.
    pub async fn restore(&self, snapshot: RegistrySnapshot) {
        let mut state = self.state.write().await;
        let max_id = snapshot
            .entries
            .iter()
            .map(|e| e.entry_id.0)
            .max()
            .unwrap_or(0);
        state.next_entry_id = snapshot.next_entry_id.max(max_id);
        state.entries = snapshot
            .entries
            .into_iter()
            .map(|e| (e.entry_id, e))
            .collect();
    }
}
