//! Offline scoring of fresh artifacts and live feedback accumulation.

use std::sync::Arc;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::domain::{
    ArtifactId, EntryId, EvaluationScore, FeedbackOutcome, LifecycleError, ModelArtifact, Result,
};
use crate::registry::ModelRegistry;
use crate::runtime::TrainingRuntime;

pub struct Evaluator {
    runtime: Arc<dyn TrainingRuntime>,
    registry: Arc<ModelRegistry>,
    timeout: Duration,
}

impl Evaluator {
    pub fn new(
        runtime: Arc<dyn TrainingRuntime>,
        registry: Arc<ModelRegistry>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            timeout: config.evaluation_timeout(),
        }
    }

    /// Run the runtime's held-out check. Out-of-range results are clamped;
    /// NaN, errors and timeouts are `EvaluationFailure`.
    pub async fn score_offline(&self, artifact: &ModelArtifact) -> Result<f64> {
        let pending = self.runtime.evaluate_offline(&artifact.handle);
        let quality = tokio::time::timeout(self.timeout, pending)
            .await
            .map_err(|_| {
                LifecycleError::EvaluationFailure(format!(
                    "offline evaluation of {} timed out after {:?}",
                    artifact.artifact_id, self.timeout
                ))
            })?
            .map_err(|e| LifecycleError::EvaluationFailure(e.to_string()))?;

        if quality.is_nan() {
            return Err(LifecycleError::EvaluationFailure(format!(
                "runtime returned NaN quality for {}",
                artifact.artifact_id
            )));
        }
        Ok(quality.clamp(0.0, 1.0))
    }

    /// Score a fresh artifact into its initial running aggregate.
    pub async fn evaluate(&self, artifact: &ModelArtifact) -> Result<EvaluationScore> {
        let quality = self.score_offline(artifact).await?;
        tracing::debug!(artifact = %artifact.artifact_id, quality, "offline evaluation complete");
        Ok(EvaluationScore::new(quality))
    }

    /// Record a live outcome against the registry entry holding `artifact_id`.
    pub async fn record_feedback(
        &self,
        artifact_id: ArtifactId,
        outcome: FeedbackOutcome,
    ) -> Result<EvaluationScore> {
        let entry = self.registry.entry_for_artifact(artifact_id).await.ok_or_else(|| {
            LifecycleError::EvaluationFailure(format!("artifact {artifact_id} is not registered"))
        })?;
        self.record_entry_feedback(entry.entry_id, outcome).await
    }

    pub async fn record_entry_feedback(
        &self,
        entry_id: EntryId,
        outcome: FeedbackOutcome,
    ) -> Result<EvaluationScore> {
        let score = self.registry.record_feedback(entry_id, outcome).await?;
        tracing::trace!(
            entry = %entry_id,
            samples = score.feedback_count,
            mean = score.feedback_mean,
            "feedback recorded"
        );
        Ok(score)
    }

    /// Current blended score of an entry.
    pub async fn blended_score(&self, entry_id: EntryId) -> Result<f64> {
        let entry = self
            .registry
            .entry(entry_id)
            .await
            .ok_or(LifecycleError::EntryNotFound(entry_id))?;
        Ok(entry.blended(self.registry.prior_weight()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactHandle, CandidateId};
    use crate::fakes::ScriptedRuntime;
    use chrono::Utc;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            artifact_id: ArtifactId::new(),
            candidate_id: CandidateId::new(0, 0),
            parent_artifact: None,
            cycle: 1,
            created_at: Utc::now(),
            size_bytes: 1,
            handle: ArtifactHandle("h".into()),
        }
    }

    fn evaluator(runtime: ScriptedRuntime) -> (Evaluator, Arc<ModelRegistry>) {
        let config = OrchestratorConfig {
            evaluation_timeout_secs: 2,
            feedback_prior_weight: 4.0,
            eviction_grace_period_secs: 0,
            ..Default::default()
        };
        let registry = Arc::new(ModelRegistry::from_config(&config));
        (
            Evaluator::new(Arc::new(runtime), Arc::clone(&registry), &config),
            registry,
        )
    }

    #[tokio::test]
    async fn offline_score_is_clamped() {
        let (ev, _) = evaluator(ScriptedRuntime::new().with_qualities([1.4, -0.3]));
        assert_eq!(ev.score_offline(&artifact()).await.unwrap(), 1.0);
        assert_eq!(ev.score_offline(&artifact()).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn nan_quality_is_an_evaluation_failure() {
        let (ev, _) = evaluator(ScriptedRuntime::new().with_qualities([f64::NAN]));
        let err = ev.evaluate(&artifact()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::EvaluationFailure(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_evaluation_times_out() {
        let (ev, _) = evaluator(ScriptedRuntime::new().with_eval_delay(Duration::from_secs(10)));
        let err = ev.score_offline(&artifact()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn feedback_shifts_blend_toward_online_mean() {
        let (ev, registry) = evaluator(ScriptedRuntime::new().with_default_quality(0.9));
        let artifact = Arc::new(artifact());
        let score = ev.evaluate(&artifact).await.unwrap();
        let entry = registry.register(Arc::clone(&artifact), score).await;
        registry.promote(entry).await.unwrap();

        assert!((ev.blended_score(entry).await.unwrap() - 0.9).abs() < 1e-12);
        for _ in 0..4 {
            ev.record_feedback(artifact.artifact_id, FeedbackOutcome::Negative)
                .await
                .unwrap();
        }
        // confidence 4 / (4 + 4) = 0.5 → 0.5 * 0.9 + 0.5 * 0.0
        assert!((ev.blended_score(entry).await.unwrap() - 0.45).abs() < 1e-12);
    }

    #[tokio::test]
    async fn feedback_for_unknown_artifact_fails() {
        let (ev, _) = evaluator(ScriptedRuntime::new());
        assert!(ev
            .record_feedback(ArtifactId::new(), FeedbackOutcome::Positive)
            .await
            .is_err());
    }
}
