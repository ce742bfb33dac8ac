//! Stand-in collaborators for tests, demos and the CLI.
//!
//! - [`ScriptedRuntime`]: in-memory runtime whose `train` outcomes are
//!   scripted call by call, for retry, timeout and cancellation scenarios.
//! - [`SimulatedRuntime`]: persists fake weights in any [`CasStore`] and
//!   derives a deterministic offline quality from their content address.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use germline_state::{CasStore, ContentDigest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactHandle, SealedBuffer};
use crate::runtime::{RuntimeError, TrainedArtifact, TrainingRuntime};

/// Scripted behaviour of one `train` call.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainStep {
    Succeed,
    Fail(String),
    /// Never completes; only a timeout or cancellation ends the attempt.
    Hang,
}

/// Runtime whose `train` calls follow a script; once the script runs out
/// every call succeeds.
pub struct ScriptedRuntime {
    steps: Mutex<VecDeque<TrainStep>>,
    qualities: Mutex<VecDeque<f64>>,
    default_quality: f64,
    train_delay: Duration,
    eval_delay: Duration,
    train_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    released: Mutex<Vec<ArtifactHandle>>,
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            qualities: Mutex::new(VecDeque::new()),
            default_quality: 0.8,
            train_delay: Duration::ZERO,
            eval_delay: Duration::ZERO,
            train_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = TrainStep>) -> Self {
        self.steps.lock().extend(steps);
        self
    }

    /// Offline scores handed out in order; `default_quality` afterwards.
    pub fn with_qualities(self, qualities: impl IntoIterator<Item = f64>) -> Self {
        self.qualities.lock().extend(qualities);
        self
    }

    pub fn with_default_quality(mut self, quality: f64) -> Self {
        self.default_quality = quality;
        self
    }

    /// Simulated work per successful `train` call.
    pub fn with_train_delay(mut self, delay: Duration) -> Self {
        self.train_delay = delay;
        self
    }

    /// Simulated work per `evaluate_offline` call.
    pub fn with_eval_delay(mut self, delay: Duration) -> Self {
        self.eval_delay = delay;
        self
    }

    pub fn push_step(&self, step: TrainStep) {
        self.steps.lock().push_back(step);
    }

    pub fn train_calls(&self) -> usize {
        self.train_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `train` calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<ArtifactHandle> {
        self.released.lock().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrainingRuntime for ScriptedRuntime {
    async fn train(
        &self,
        _parent: Option<&ArtifactHandle>,
        data: &SealedBuffer,
    ) -> Result<TrainedArtifact, RuntimeError> {
        let call = self.train_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let step = self.steps.lock().pop_front().unwrap_or(TrainStep::Succeed);
        match step {
            TrainStep::Succeed => {
                if !self.train_delay.is_zero() {
                    tokio::time::sleep(self.train_delay).await;
                }
                Ok(TrainedArtifact {
                    handle: ArtifactHandle(format!("scripted-{call}")),
                    size_bytes: data.total_bytes,
                })
            }
            TrainStep::Fail(reason) => Err(RuntimeError::Backend(reason)),
            TrainStep::Hang => std::future::pending().await,
        }
    }

    async fn evaluate_offline(&self, _artifact: &ArtifactHandle) -> Result<f64, RuntimeError> {
        if !self.eval_delay.is_zero() {
            tokio::time::sleep(self.eval_delay).await;
        }
        Ok(self
            .qualities
            .lock()
            .pop_front()
            .unwrap_or(self.default_quality))
    }

    async fn release(&self, artifact: &ArtifactHandle) -> Result<(), RuntimeError> {
        self.released.lock().push(artifact.clone());
        Ok(())
    }
}

/// Fake weights stored by [`SimulatedRuntime`].
#[derive(Debug, Serialize, Deserialize)]
struct SimulatedWeights {
    candidate: String,
    parent: Option<String>,
    buffer_digest: ContentDigest,
    cycle: u64,
    trained_bytes: u64,
}

/// CAS-backed runtime used by the CLI demo.
pub struct SimulatedRuntime<C> {
    cas: Arc<C>,
    train_delay: Duration,
}

impl<C: CasStore> SimulatedRuntime<C> {
    pub fn new(cas: Arc<C>) -> Self {
        Self {
            cas,
            train_delay: Duration::ZERO,
        }
    }

    pub fn with_train_delay(mut self, delay: Duration) -> Self {
        self.train_delay = delay;
        self
    }

    fn digest_of(handle: &ArtifactHandle) -> Result<ContentDigest, RuntimeError> {
        ContentDigest::try_from(handle.0.clone())
            .map_err(|_| RuntimeError::UnknownArtifact(handle.clone()))
    }
}

#[async_trait]
impl<C: CasStore + 'static> TrainingRuntime for SimulatedRuntime<C> {
    async fn train(
        &self,
        parent: Option<&ArtifactHandle>,
        data: &SealedBuffer,
    ) -> Result<TrainedArtifact, RuntimeError> {
        if data.chunks.is_empty() {
            return Err(RuntimeError::InvalidInput("empty buffer".into()));
        }
        if !self.train_delay.is_zero() {
            tokio::time::sleep(self.train_delay).await;
        }
        let weights = SimulatedWeights {
            candidate: data.candidate_id.to_string(),
            parent: parent.map(|p| p.0.clone()),
            buffer_digest: data.digest.clone(),
            cycle: data.cycle,
            trained_bytes: data.total_bytes,
        };
        let bytes =
            serde_json::to_vec(&weights).map_err(|e| RuntimeError::Backend(e.to_string()))?;
        let size_bytes = bytes.len() as u64;
        let digest = self
            .cas
            .put(&bytes)
            .await
            .map_err(|e| RuntimeError::Backend(e.to_string()))?;
        Ok(TrainedArtifact {
            handle: ArtifactHandle(digest.as_str().to_string()),
            size_bytes,
        })
    }

    async fn evaluate_offline(&self, artifact: &ArtifactHandle) -> Result<f64, RuntimeError> {
        let digest = Self::digest_of(artifact)?;
        let bytes = self
            .cas
            .get(&digest)
            .await
            .map_err(|_| RuntimeError::UnknownArtifact(artifact.clone()))?;
        let weights: SimulatedWeights =
            serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Backend(e.to_string()))?;

        // Deterministic pseudo-quality in [0.4, 1.0) from the weight digest,
        // nudged up for fine-tuned artifacts.
        let seed = u16::from_str_radix(&digest.as_str()[..4], 16).unwrap_or(0);
        let base = 0.4 + 0.55 * f64::from(seed) / f64::from(u16::MAX);
        let lineage_bonus = if weights.parent.is_some() { 0.05 } else { 0.0 };
        Ok((base + lineage_bonus).min(1.0))
    }

    async fn release(&self, artifact: &ArtifactHandle) -> Result<(), RuntimeError> {
        let digest = Self::digest_of(artifact)?;
        self.cas
            .delete(&digest)
            .await
            .map_err(|e| RuntimeError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateId, ChunkMetadata, DataChunk};
    use germline_state::MemoryCasStore;

    fn sealed(bytes: &[u8]) -> SealedBuffer {
        SealedBuffer::seal(
            CandidateId::new(0, 0),
            1,
            vec![DataChunk::new(bytes.to_vec(), ChunkMetadata::default())],
        )
    }

    #[tokio::test]
    async fn scripted_runtime_follows_script_then_succeeds() {
        let rt = ScriptedRuntime::new().with_steps([TrainStep::Fail("boom".into())]);
        let data = sealed(b"abc");
        assert!(rt.train(None, &data).await.is_err());
        let ok = rt.train(None, &data).await.unwrap();
        assert_eq!(ok.size_bytes, 3);
        assert_eq!(rt.train_calls(), 2);
    }

    #[tokio::test]
    async fn simulated_runtime_round_trips_through_cas() {
        let cas = Arc::new(MemoryCasStore::new());
        let rt = SimulatedRuntime::new(cas.clone());
        let trained = rt.train(None, &sealed(b"payload")).await.unwrap();
        assert_eq!(cas.len(), 1);

        let q1 = rt.evaluate_offline(&trained.handle).await.unwrap();
        let q2 = rt.evaluate_offline(&trained.handle).await.unwrap();
        assert_eq!(q1, q2);
        assert!((0.4..=1.0).contains(&q1));

        rt.release(&trained.handle).await.unwrap();
        assert!(cas.is_empty());
        assert!(rt.evaluate_offline(&trained.handle).await.is_err());
    }

    #[tokio::test]
    async fn simulated_runtime_rejects_garbage_handles() {
        let rt = SimulatedRuntime::new(Arc::new(MemoryCasStore::new()));
        let err = rt
            .evaluate_offline(&ArtifactHandle("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownArtifact(_)));
    }
}
