//! Epsilon-greedy routing over the active pool.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{EpsilonDecay, OrchestratorConfig};
use crate::domain::{ArtifactId, EntryId, EvaluationScore, FeedbackOutcome, LifecycleError, Result};
use crate::evaluator::Evaluator;
use crate::metrics::METRICS;
use crate::registry::ModelRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Top blended score.
    Exploit,
    /// Uniform draw over the pool.
    Explore,
}

/// One routing decision; hand it back to [`SelectionPolicy::report_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub entry_id: EntryId,
    pub artifact_id: ArtifactId,
    pub mode: SelectionMode,
    /// Exploration rate in force when the decision was made.
    pub epsilon: f64,
}

pub struct SelectionPolicy {
    registry: Arc<ModelRegistry>,
    evaluator: Arc<Evaluator>,
    epsilon: f64,
    decay: Option<EpsilonDecay>,
    rng: Mutex<StdRng>,
}

impl SelectionPolicy {
    pub fn new(
        registry: Arc<ModelRegistry>,
        evaluator: Arc<Evaluator>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            evaluator,
            epsilon: config.exploration_rate_epsilon,
            decay: config.epsilon_decay.clone(),
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Replace the entropy-seeded generator with a deterministic one.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// ε after `samples` feedback observations across the active pool.
    pub fn epsilon_at(&self, samples: u64) -> f64 {
        match &self.decay {
            None => self.epsilon,
            Some(decay) => {
                let halvings = samples as f64 / decay.half_life_samples.max(1) as f64;
                (self.epsilon * 0.5f64.powf(halvings)).max(decay.floor)
            }
        }
    }

    /// Route one request. Fails with `PoolEmpty` until an artifact has been
    /// promoted; callers fall back to default behaviour.
    pub async fn select_for_request(&self) -> Result<Selection> {
        let pool = self.registry.get_active_pool().await;
        if pool.is_empty() {
            return Err(LifecycleError::PoolEmpty);
        }

        let samples: u64 = pool.iter().map(|e| e.score.feedback_count).sum();
        let epsilon = self.epsilon_at(samples);
        let (index, mode) = {
            let mut rng = self.rng.lock();
            if rng.random::<f64>() < epsilon {
                (rng.random_range(0..pool.len()), SelectionMode::Explore)
            } else {
                (0, SelectionMode::Exploit)
            }
        };

        match mode {
            SelectionMode::Exploit => METRICS.inc_exploit_selections(),
            SelectionMode::Explore => METRICS.inc_explore_selections(),
        }

        let chosen = &pool[index];
        if let Err(e) = self.registry.mark_used(chosen.entry_id).await {
            tracing::debug!(entry = %chosen.entry_id, error = %e, "could not stamp last use");
        }
        Ok(Selection {
            entry_id: chosen.entry_id,
            artifact_id: chosen.artifact.artifact_id,
            mode,
            epsilon,
        })
    }

    /// Close the loop for a previous selection.
    pub async fn report_outcome(
        &self,
        selection: &Selection,
        outcome: FeedbackOutcome,
    ) -> Result<EvaluationScore> {
        self.evaluator
            .record_entry_feedback(selection.entry_id, outcome)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactHandle, CandidateId, ModelArtifact};
    use crate::fakes::ScriptedRuntime;
    use chrono::Utc;

    fn config(epsilon: f64) -> OrchestratorConfig {
        OrchestratorConfig {
            exploration_rate_epsilon: epsilon,
            eviction_grace_period_secs: 0,
            pool_cap_k: 8,
            ..Default::default()
        }
    }

    fn policy(config: &OrchestratorConfig) -> (SelectionPolicy, Arc<ModelRegistry>) {
        let registry = Arc::new(ModelRegistry::from_config(config));
        let evaluator = Arc::new(Evaluator::new(
            Arc::new(ScriptedRuntime::new()),
            Arc::clone(&registry),
            config,
        ));
        (
            SelectionPolicy::new(Arc::clone(&registry), evaluator, config).with_seed(7),
            registry,
        )
    }

    async fn add(registry: &ModelRegistry, quality: f64) -> EntryId {
        let artifact = Arc::new(ModelArtifact {
            artifact_id: ArtifactId::new(),
            candidate_id: CandidateId::new(0, 0),
            parent_artifact: None,
            cycle: 1,
            created_at: Utc::now(),
            size_bytes: 1,
            handle: ArtifactHandle("h".into()),
        });
        let id = registry.register(artifact, EvaluationScore::new(quality)).await;
        registry.promote(id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn empty_pool_reports_pool_empty() {
        let (policy, _) = policy(&config(0.1));
        assert!(matches!(
            policy.select_for_request().await.unwrap_err(),
            LifecycleError::PoolEmpty
        ));
    }

    #[tokio::test]
    async fn greedy_single_entry_is_stable() {
        let (policy, registry) = policy(&config(0.0));
        let only = add(&registry, 0.4).await;
        for _ in 0..100 {
            let selection = policy.select_for_request().await.unwrap();
            assert_eq!(selection.entry_id, only);
            assert_eq!(selection.mode, SelectionMode::Exploit);
        }
    }

    #[tokio::test]
    async fn top_entry_share_matches_epsilon() {
        let (policy, registry) = policy(&config(0.2));
        let top = add(&registry, 0.95).await;
        for q in [0.5, 0.6, 0.7] {
            add(&registry, q).await;
        }

        let draws = 20_000;
        let mut top_hits = 0;
        for _ in 0..draws {
            if policy.select_for_request().await.unwrap().entry_id == top {
                top_hits += 1;
            }
        }
        let share = top_hits as f64 / draws as f64;
        // (1 - 0.2) + 0.2 / 4
        assert!((share - 0.85).abs() < 0.02, "share was {share}");
    }

    #[tokio::test]
    async fn epsilon_halves_per_half_life_down_to_floor() {
        let mut cfg = config(0.4);
        cfg.epsilon_decay = Some(EpsilonDecay {
            half_life_samples: 100,
            floor: 0.01,
        });
        let (policy, _) = policy(&cfg);
        assert!((policy.epsilon_at(0) - 0.4).abs() < 1e-12);
        assert!((policy.epsilon_at(100) - 0.2).abs() < 1e-12);
        assert_eq!(policy.epsilon_at(10_000), 0.01);
    }

    #[tokio::test]
    async fn reported_outcomes_reach_the_registry() {
        let (policy, registry) = policy(&config(0.0));
        let id = add(&registry, 0.5).await;
        let selection = policy.select_for_request().await.unwrap();
        policy
            .report_outcome(&selection, FeedbackOutcome::Positive)
            .await
            .unwrap();
        let entry = registry.entry(id).await.unwrap();
        assert_eq!(entry.score.feedback_count, 1);
        assert!(entry.last_used_at.is_some());
    }
}
