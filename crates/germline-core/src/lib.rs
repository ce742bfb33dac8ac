//! Germline Core Library
//!
//! Continual, resource-bounded model lifecycle: per-candidate data buffers,
//! bounded-concurrency incremental training, offline plus live scoring, a
//! capped model pool with epsilon-greedy routing, and promotion of matured
//! candidates into agent descriptors.

pub mod analyzer;
pub mod buffer;
pub mod config;
pub mod domain;
pub mod evaluator;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod persistence;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod selection;
pub mod supervisor;
pub mod telemetry;

pub use domain::{
    AgentDescriptor, ArtifactHandle, ArtifactId, AutonomyLevel, BehaviorProfile, Candidate,
    CandidateId, ChunkMetadata, DataChunk, DescriptorId, EntryId, EvaluatedArtifact,
    EvaluationScore, FeedbackOutcome, JobId, LifecycleError, LifecycleState, Lineage,
    ModelArtifact, PatternSignal, PatternSummary, Result, SealedBuffer, Specialization,
};

pub use analyzer::{HeuristicAnalyzer, SpecializationAnalyzer, SpecializationSummary};
pub use buffer::{BufferManager, ReadyState};
pub use config::{ConfigError, EpsilonDecay, OrchestratorConfig};
pub use evaluator::Evaluator;
pub use fakes::{ScriptedRuntime, SimulatedRuntime, TrainStep};
pub use persistence::LifecycleStore;
pub use registry::{EntryStatus, ModelRegistry, RegistryEntry, RegistrySnapshot};
pub use runtime::{RuntimeError, TrainedArtifact, TrainingRuntime};
pub use scheduler::{JobOutcome, JobResult, JobStatus, TrainingJob, TrainingScheduler};
pub use selection::{Selection, SelectionMode, SelectionPolicy};
pub use supervisor::{LifecycleEvent, PoolStatus, Supervisor, SupervisorBuilder};

pub use metrics::{MetricsSnapshot, METRICS};
pub use obs::CandidateSpan;
pub use telemetry::init_tracing;

/// Germline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
