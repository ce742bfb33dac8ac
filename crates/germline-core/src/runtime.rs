//! Boundary to the external training/inference runtime.

use async_trait::async_trait;

use crate::domain::{ArtifactHandle, SealedBuffer};

/// Failure reported by the external runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime rejected input: {0}")]
    InvalidInput(String),

    #[error("runtime backend error: {0}")]
    Backend(String),

    #[error("unknown artifact handle: {0}")]
    UnknownArtifact(ArtifactHandle),
}

/// What a successful `train` call hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainedArtifact {
    pub handle: ArtifactHandle,
    pub size_bytes: u64,
}

/// Opaque training capability.
///
/// Implementations must be safe to call concurrently; the scheduler bounds
/// how many `train` calls are in flight.
#[async_trait]
pub trait TrainingRuntime: Send + Sync {
    /// Fine-tune `parent` (or start fresh) on one sealed buffer.
    async fn train(
        &self,
        parent: Option<&ArtifactHandle>,
        data: &SealedBuffer,
    ) -> Result<TrainedArtifact, RuntimeError>;

    /// Held-out quality check, in [0, 1].
    async fn evaluate_offline(&self, artifact: &ArtifactHandle) -> Result<f64, RuntimeError>;

    /// Free storage behind an artifact that left the pool. Best effort.
    async fn release(&self, artifact: &ArtifactHandle) -> Result<(), RuntimeError>;
}
