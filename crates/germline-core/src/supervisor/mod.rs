//! Candidate lifecycle supervisor.
//!
//! Owns the candidate arena and wires the buffer manager, scheduler,
//! evaluator, registry and analyzer together. One driver task reacts to
//! sealed buffers, finished jobs, a retry tick and the natural-selection
//! tick; evaluations (and the specializations they trigger) run as tasks the
//! driver reaps.
//!
//! Candidate state sits behind a single `parking_lot` mutex that is never
//! held across an await. Persistence happens after the lock is released and
//! is best-effort: a failed write is logged and retried on the next change.

mod arena;
mod events;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use events::LifecycleEvent;

use crate::analyzer::{HeuristicAnalyzer, SpecializationAnalyzer, SpecializationSummary};
use crate::buffer::{BufferManager, ReadyState};
use crate::config::OrchestratorConfig;
use crate::domain::{
    AgentDescriptor, Candidate, CandidateId, ChunkMetadata, DataChunk, EntryId, EvaluatedArtifact,
    EvaluationScore, FeedbackOutcome, LifecycleError, LifecycleState, Lineage, ModelArtifact,
    Result, SealedBuffer,
};
use crate::evaluator::Evaluator;
use crate::metrics::{MetricsSnapshot, METRICS};
use crate::obs::{self, CandidateSpan};
use crate::persistence::LifecycleStore;
use crate::registry::{EntryStatus, ModelRegistry, RegistryEntry, Retired};
use crate::runtime::TrainingRuntime;
use crate::scheduler::{JobOutcome, JobResult, TrainingJob, TrainingScheduler};
use crate::selection::{Selection, SelectionPolicy};
use arena::{CandidateArena, CandidateRecord};

const EVENT_CAPACITY: usize = 1024;

/// Point-in-time view of the whole orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub live_candidates: usize,
    pub free_slots: usize,
    /// Lifecycle state name → number of candidates in it.
    pub candidates_by_state: BTreeMap<String, usize>,
    /// Dominant domain → number of candidates leaning that way.
    pub dominant_domains: BTreeMap<String, usize>,
    pub active_entries: usize,
    pub pending_activations: usize,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub descriptors_emitted: usize,
    pub metrics: MetricsSnapshot,
}

/// Configures and starts a [`Supervisor`].
pub struct SupervisorBuilder {
    config: OrchestratorConfig,
    runtime: Option<Arc<dyn TrainingRuntime>>,
    analyzer: Option<Arc<dyn SpecializationAnalyzer>>,
    store: Option<LifecycleStore>,
    seed: Option<u64>,
}

impl SupervisorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            runtime: None,
            analyzer: None,
            store: None,
            seed: None,
        }
    }

    /// Required.
    pub fn runtime(mut self, runtime: Arc<dyn TrainingRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Defaults to [`HeuristicAnalyzer`].
    pub fn analyzer(mut self, analyzer: Arc<dyn SpecializationAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Persist lifecycle state and recover it on start.
    pub fn store(mut self, store: LifecycleStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Seed the selection policy's generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate the configuration, recover persisted state, fill empty
    /// slots with fresh candidates and spawn the driver.
    pub async fn start(self) -> Result<Supervisor> {
        self.config
            .validate()
            .map_err(|e| LifecycleError::InvalidConfig(e.to_string()))?;
        let runtime = self.runtime.ok_or_else(|| {
            LifecycleError::InvalidConfig("no training runtime configured".to_string())
        })?;
        let analyzer = self
            .analyzer
            .unwrap_or_else(|| Arc::new(HeuristicAnalyzer::new()));
        let config = self.config;

        let (buffers, sealed_rx) = BufferManager::from_config(&config);
        let (scheduler, outcome_rx) = TrainingScheduler::new(Arc::clone(&runtime), &config);
        let registry = Arc::new(ModelRegistry::from_config(&config));
        let evaluator = Arc::new(Evaluator::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            &config,
        ));
        let mut selection =
            SelectionPolicy::new(Arc::clone(&registry), Arc::clone(&evaluator), &config);
        if let Some(seed) = self.seed {
            selection = selection.with_seed(seed);
        }

        let mut arena =
            CandidateArena::new(config.candidate_slots, config.byte_budget_per_candidate);
        let mut descriptors = Vec::new();
        if let Some(store) = &self.store {
            if let Some(snapshot) = store.load_registry().await? {
                info!(entries = snapshot.entries.len(), "restoring model registry");
                registry.restore(snapshot).await;
            }
            descriptors = store.load_descriptors().await?;
            for candidate in store.load_candidates().await? {
                let record = recover_candidate(candidate, &registry).await;
                if record.candidate.state == LifecycleState::Retired {
                    arena.vacate(record.candidate.id);
                } else if let Err(e) = arena.restore(record) {
                    warn!(error = %e, "skipping persisted candidate");
                }
            }
        }

        let recovered = arena.capacity() - arena.free_slots();
        let mut spawned = Vec::new();
        while arena.free_slots() > 0 {
            spawned.push(arena.spawn()?);
        }
        for record in arena.records() {
            buffers.register(record.candidate.id, u64::from(record.candidate.cycles_completed));
        }
        info!(
            recovered,
            spawned = spawned.len(),
            slots = arena.capacity(),
            descriptors = descriptors.len(),
            "supervisor starting"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            buffers,
            scheduler,
            registry,
            evaluator,
            selection,
            analyzer,
            runtime,
            store: self.store,
            arena: Mutex::new(arena),
            descriptors: Mutex::new(descriptors),
            events,
            shutdown: CancellationToken::new(),
        });

        for id in &spawned {
            inner.emit(LifecycleEvent::CandidateSpawned { candidate: *id });
        }
        inner.persist_candidates(inner.candidates()).await;

        let driver = tokio::spawn(drive(Arc::clone(&inner), sealed_rx, outcome_rx));
        Ok(Supervisor {
            inner,
            driver: tokio::sync::Mutex::new(Some(driver)),
        })
    }
}

/// Bring a persisted candidate back to a consistent resting state. Work that
/// was in flight when the process stopped is abandoned, so those candidates
/// resume collecting data.
async fn recover_candidate(
    mut candidate: Candidate,
    registry: &ModelRegistry,
) -> CandidateRecord {
    if candidate.state.is_in_flight() {
        debug!(
            candidate = %candidate.id,
            state = %candidate.state,
            "resetting interrupted candidate to buffering"
        );
        candidate.state = LifecycleState::Buffering;
    }
    candidate.accumulated_bytes = 0;
    let parent = match candidate.latest_artifact {
        Some(latest) => registry.entry(latest.entry_id).await.map(|e| e.artifact),
        None => None,
    };
    let mut record = CandidateRecord::new(candidate);
    record.parent = parent;
    record
}

/// Handle to a running orchestrator.
pub struct Supervisor {
    inner: Arc<Inner>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn builder(config: OrchestratorConfig) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Receive every lifecycle event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Append a chunk to the candidate's buffer.
    ///
    /// Never waits on training: a full buffer is sealed and handed to the
    /// driver, and the call returns immediately.
    pub fn ingest(&self, id: CandidateId, chunk: DataChunk) -> Result<ReadyState> {
        self.inner.ingest(id, chunk)
    }

    pub fn ingest_bytes(
        &self,
        id: CandidateId,
        bytes: impl Into<Vec<u8>>,
        metadata: ChunkMetadata,
    ) -> Result<ReadyState> {
        self.inner.ingest(id, DataChunk::new(bytes, metadata))
    }

    /// Pick an artifact for one incoming request.
    pub async fn select_for_request(&self) -> Result<Selection> {
        self.inner.selection.select_for_request().await
    }

    pub async fn report_outcome(
        &self,
        selection: &Selection,
        outcome: FeedbackOutcome,
    ) -> Result<EvaluationScore> {
        self.inner.selection.report_outcome(selection, outcome).await
    }

    /// Live candidates in slot order.
    pub fn list_candidates(&self) -> Vec<Candidate> {
        self.inner.candidates()
    }

    pub fn candidate(&self, id: CandidateId) -> Option<Candidate> {
        self.inner.arena.lock().get(id).map(|r| r.candidate.clone())
    }

    /// Active pool, best first.
    pub async fn active_entries(&self) -> Vec<RegistryEntry> {
        self.inner.registry.get_active_pool().await
    }

    pub async fn entry(&self, entry_id: EntryId) -> Option<RegistryEntry> {
        self.inner.registry.entry(entry_id).await
    }

    pub fn active_jobs(&self) -> Vec<TrainingJob> {
        self.inner.scheduler.active_jobs()
    }

    /// Descriptors emitted so far, oldest first.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.inner.descriptors.lock().clone()
    }

    /// Activate an entry regardless of the grace period. Returns the entries
    /// evicted to make room.
    pub async fn force_promote(&self, entry_id: EntryId) -> Result<Vec<EntryId>> {
        let retired = self.inner.registry.force_promote(entry_id).await?;
        let ids = retired.iter().map(|r| r.entry_id).collect();
        self.inner.release_retired(retired).await;
        self.inner.persist_registry().await;
        Ok(ids)
    }

    /// Retire an entry. Refuses to remove the last Active one.
    pub async fn force_evict(&self, entry_id: EntryId) -> Result<()> {
        let retired = self.inner.registry.force_evict(entry_id).await?;
        self.inner.release_retired(vec![retired]).await;
        self.inner.persist_registry().await;
        Ok(())
    }

    /// Specialize a candidate now instead of waiting for it to mature.
    ///
    /// The candidate needs an evaluated artifact and must be at rest:
    /// observing, buffering or waiting for admission, with no job in flight.
    pub async fn force_specialize(&self, id: CandidateId) -> Result<AgentDescriptor> {
        let latest = {
            let arena = self.inner.arena.lock();
            let record = arena.get(id).ok_or(LifecycleError::CandidateNotFound(id))?;
            record
                .candidate
                .latest_artifact
                .ok_or(LifecycleError::NotMatured(id))?
        };
        let offline_quality = self
            .inner
            .registry
            .entry(latest.entry_id)
            .await
            .map(|e| e.score.offline_quality)
            .ok_or(LifecycleError::EntryNotFound(latest.entry_id))?;

        let (request, snapshot) = {
            let mut arena = self.inner.arena.lock();
            let record = arena
                .get_mut(id)
                .ok_or(LifecycleError::CandidateNotFound(id))?;
            let at_rest = matches!(
                record.candidate.state,
                LifecycleState::Observing
                    | LifecycleState::Buffering
                    | LifecycleState::TrainingReady
            );
            if !at_rest || record.in_flight.is_some() {
                return Err(LifecycleError::InvalidTransition {
                    candidate: id,
                    from: record.candidate.state,
                    to: LifecycleState::Specializing,
                });
            }
            self.inner
                .transition(&mut record.candidate, LifecycleState::Specializing)?;
            (
                SpecializationRequest::new(record, latest, offline_quality),
                record.candidate.clone(),
            )
        };
        self.inner.persist_candidates(vec![snapshot]).await;
        self.inner.specialize(request).await
    }

    /// Retire a candidate, cancelling its work and dropping its buffer.
    pub async fn force_retire(&self, id: CandidateId) -> Result<Option<CandidateId>> {
        self.inner.retire_candidate(id).await
    }

    /// Cull candidates below the survival fitness now, keeping at least
    /// `min_population` live. Returns the culled candidates with their
    /// fitness, weakest first.
    pub async fn run_natural_selection(&self) -> Vec<(CandidateId, f64)> {
        self.inner.natural_selection().await
    }

    /// Fill a free slot with a fresh candidate.
    pub async fn spawn_candidate(&self) -> Result<CandidateId> {
        let candidate = {
            let mut arena = self.inner.arena.lock();
            let id = arena.spawn()?;
            arena
                .get(id)
                .map(|r| r.candidate.clone())
                .ok_or(LifecycleError::CandidateNotFound(id))?
        };
        self.inner.buffers.register(candidate.id, 0);
        self.inner.emit(LifecycleEvent::CandidateSpawned {
            candidate: candidate.id,
        });
        let id = candidate.id;
        self.inner.persist_candidates(vec![candidate]).await;
        Ok(id)
    }

    pub async fn status(&self) -> PoolStatus {
        self.inner.status().await
    }

    /// Write every candidate and the registry to the store, if any.
    pub async fn persist(&self) {
        self.inner.persist_candidates(self.inner.candidates()).await;
        self.inner.persist_registry().await;
    }

    /// Stop the driver, cancel training and persist final state.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.scheduler.shutdown();
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.await {
                warn!(error = %e, "supervisor driver ended abnormally");
            }
        }
        self.persist().await;
        METRICS.flush();
        info!("supervisor stopped");
    }
}

/// Evidence and lineage captured when a candidate enters `Specializing`.
struct SpecializationRequest {
    summary: SpecializationSummary,
    lineage: Lineage,
}

impl SpecializationRequest {
    fn new(record: &CandidateRecord, latest: EvaluatedArtifact, offline_quality: f64) -> Self {
        let candidate = &record.candidate;
        Self {
            summary: SpecializationSummary::from_candidate(candidate, offline_quality),
            lineage: Lineage {
                candidate_id: candidate.id,
                artifact_id: latest.artifact_id,
                entry_id: latest.entry_id,
                parent_artifact: record.parent.as_ref().and_then(|a| a.parent_artifact),
                cycles_completed: candidate.cycles_completed,
            },
        }
    }
}

/// A trained artifact waiting for offline evaluation.
struct EvaluationWork {
    candidate: CandidateId,
    artifact: Arc<ModelArtifact>,
    buffer: Arc<SealedBuffer>,
}

struct Inner {
    config: OrchestratorConfig,
    buffers: BufferManager,
    scheduler: TrainingScheduler,
    registry: Arc<ModelRegistry>,
    evaluator: Arc<Evaluator>,
    selection: SelectionPolicy,
    analyzer: Arc<dyn SpecializationAnalyzer>,
    runtime: Arc<dyn TrainingRuntime>,
    store: Option<LifecycleStore>,
    arena: Mutex<CandidateArena>,
    descriptors: Mutex<Vec<AgentDescriptor>>,
    events: broadcast::Sender<LifecycleEvent>,
    shutdown: CancellationToken,
}

impl Inner {
    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn transition(&self, candidate: &mut Candidate, to: LifecycleState) -> Result<()> {
        let from = candidate.transition(to)?;
        obs::emit_state_changed(candidate.id, from, to);
        self.emit(LifecycleEvent::StateChanged {
            candidate: candidate.id,
            from,
            to,
        });
        Ok(())
    }

    /// Transition that cannot fail on a consistent record; logs if it does.
    fn settle(&self, candidate: &mut Candidate, to: LifecycleState) {
        if let Err(e) = self.transition(candidate, to) {
            warn!(candidate = %candidate.id, error = %e, "unexpected lifecycle transition");
        }
    }

    fn candidates(&self) -> Vec<Candidate> {
        self.arena
            .lock()
            .records()
            .map(|r| r.candidate.clone())
            .collect()
    }

    fn ingest(&self, id: CandidateId, chunk: DataChunk) -> Result<ReadyState> {
        let _span = CandidateSpan::enter(id);
        if self.arena.lock().get(id).is_none() {
            return Err(LifecycleError::CandidateNotFound(id));
        }
        let ready = self.buffers.ingest(id, chunk)?;

        let mut arena = self.arena.lock();
        if let Some(record) = arena.get_mut(id) {
            record.candidate.last_activity = Utc::now();
            match ready {
                ReadyState::NotReady { accumulated_bytes } => {
                    record.candidate.accumulated_bytes = accumulated_bytes;
                    if record.candidate.state == LifecycleState::Observing {
                        self.settle(&mut record.candidate, LifecycleState::Buffering);
                    }
                }
                ReadyState::ReadyForTraining { .. } => record.candidate.accumulated_bytes = 0,
            }
        }
        Ok(ready)
    }

    async fn on_sealed(&self, sealed: SealedBuffer) {
        let id = sealed.candidate_id;
        let (cycle, total_bytes) = (sealed.cycle, sealed.total_bytes);
        {
            let mut arena = self.arena.lock();
            let Some(record) = arena.get_mut(id) else {
                debug!(candidate = %id, cycle, "dropping sealed buffer of retired candidate");
                return;
            };
            record.pending.push_back(Arc::new(sealed));
        }
        self.emit(LifecycleEvent::BufferSealed {
            candidate: id,
            cycle,
            total_bytes,
        });
        if let Some(candidate) = self.try_submit(id) {
            self.persist_candidates(vec![candidate]).await;
        }
    }

    /// Hand the candidate's oldest sealed buffer to the scheduler if it is
    /// free to train. Returns the candidate when its state changed.
    fn try_submit(&self, id: CandidateId) -> Option<Candidate> {
        let _span = CandidateSpan::enter(id);
        let mut arena = self.arena.lock();
        let record = arena.get_mut(id)?;
        if record.in_flight.is_some() {
            return None;
        }
        let buffer = record.pending.front().cloned()?;

        let mut changed = false;
        match record.candidate.state {
            LifecycleState::Observing | LifecycleState::Buffering => {
                self.transition(&mut record.candidate, LifecycleState::TrainingReady)
                    .ok()?;
                changed = true;
            }
            LifecycleState::TrainingReady => {}
            // Evaluating or Specializing: picked up once that settles.
            _ => return None,
        }

        match self.scheduler.submit(buffer, record.parent.clone()) {
            Ok(job) => {
                record.pending.pop_front();
                record.in_flight = Some(job);
                record.throttled = false;
                self.buffers.release_sealed(id);
                self.settle(&mut record.candidate, LifecycleState::Training);
                self.emit(LifecycleEvent::TrainingSubmitted { candidate: id, job });
                changed = true;
            }
            Err(LifecycleError::Throttled { queue_depth }) => {
                if !record.throttled {
                    record.throttled = true;
                    debug!(queue_depth, "training submission throttled; will retry");
                    self.emit(LifecycleEvent::SubmissionThrottled {
                        candidate: id,
                        queue_depth,
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, "training submission rejected");
            }
        }
        changed.then(|| record.candidate.clone())
    }

    /// Returns evaluation work when training produced an artifact.
    async fn on_job_outcome(&self, outcome: JobOutcome) -> Option<EvaluationWork> {
        let id = outcome.job.candidate_id;
        let job_id = outcome.job.job_id;
        let mut orphan = None;
        let mut work = None;
        let snapshot = {
            let mut arena = self.arena.lock();
            match arena.get_mut(id) {
                Some(record) if record.in_flight == Some(job_id) => {
                    record.in_flight = None;
                    match outcome.result {
                        JobResult::Succeeded(artifact) => {
                            self.settle(&mut record.candidate, LifecycleState::Evaluating);
                            work = Some(EvaluationWork {
                                candidate: id,
                                artifact,
                                buffer: outcome.buffer,
                            });
                        }
                        JobResult::Failed(reason) => {
                            record.candidate.failed_cycles += 1;
                            obs::emit_lifecycle_error(id, "training", &reason);
                            self.settle(&mut record.candidate, LifecycleState::Buffering);
                            self.emit(LifecycleEvent::TrainingFailed {
                                candidate: id,
                                job: job_id,
                                reason,
                            });
                        }
                        JobResult::Cancelled => {
                            self.settle(&mut record.candidate, LifecycleState::Buffering);
                        }
                    }
                    Some(record.candidate.clone())
                }
                _ => {
                    debug!(candidate = %id, job = %job_id, "outcome for a job no longer tracked");
                    if let JobResult::Succeeded(artifact) = outcome.result {
                        orphan = Some(artifact);
                    }
                    None
                }
            }
        };

        if let Some(artifact) = orphan {
            self.release_artifact(&artifact).await;
        }
        if let Some(candidate) = snapshot {
            self.persist_candidates(vec![candidate]).await;
        }
        if work.is_none() {
            if let Some(candidate) = self.try_submit(id) {
                self.persist_candidates(vec![candidate]).await;
            }
        }
        work
    }

    async fn evaluate(self: Arc<Self>, work: EvaluationWork) {
        let EvaluationWork {
            candidate: id,
            artifact,
            buffer,
        } = work;

        let score = match self.evaluator.evaluate(&artifact).await {
            Ok(score) => score,
            Err(e) => {
                obs::emit_lifecycle_error(id, "evaluation", &e);
                self.release_artifact(&artifact).await;
                self.return_to_buffering(id);
                self.emit(LifecycleEvent::EvaluationFailed {
                    candidate: id,
                    reason: e.to_string(),
                });
                self.resume(id).await;
                return;
            }
        };

        let offline_quality = score.offline_quality;
        let entry_id = self.registry.register(Arc::clone(&artifact), score).await;
        let status = match self.registry.promote(entry_id).await {
            Ok(promotion) => {
                self.release_retired(promotion.retired).await;
                promotion.status
            }
            Err(e) => {
                warn!(entry = %entry_id, error = %e, "promotion failed");
                EntryStatus::Candidate
            }
        };
        self.emit(LifecycleEvent::ArtifactRegistered {
            candidate: id,
            entry: entry_id,
            status,
            offline_quality,
        });
        self.persist_registry().await;

        let latest = EvaluatedArtifact {
            artifact_id: artifact.artifact_id,
            entry_id,
        };
        let (request, snapshot) = {
            let mut arena = self.arena.lock();
            let Some(record) = arena.get_mut(id) else {
                return;
            };
            if record.candidate.state != LifecycleState::Evaluating {
                // The entry stays registered; the candidate has moved on.
                debug!(
                    candidate = %id,
                    state = %record.candidate.state,
                    entry = %entry_id,
                    "stale evaluation result not applied to candidate"
                );
                return;
            }
            let candidate = &mut record.candidate;
            let rate = self.config.specialization_learning_rate;
            candidate.fold_pattern_summary(&buffer.summary, rate);
            candidate.cycles_completed += 1;
            candidate.failed_cycles = 0;
            candidate.latest_artifact = Some(latest);
            record.parent = Some(Arc::clone(&artifact));

            let mature = record.candidate.is_mature(
                self.config.specialization_confidence_threshold,
                self.config.specialization_min_cycles,
            );
            let request = if mature {
                self.settle(&mut record.candidate, LifecycleState::Specializing);
                Some(SpecializationRequest::new(record, latest, offline_quality))
            } else {
                self.settle(&mut record.candidate, LifecycleState::Buffering);
                None
            };
            (request, record.candidate.clone())
        };
        self.persist_candidates(vec![snapshot]).await;

        match request {
            Some(request) => match self.specialize(request).await {
                Ok(descriptor) => {
                    debug!(candidate = %id, descriptor = %descriptor.descriptor_id, "specialized")
                }
                // Already reported through events and logs.
                Err(e) => debug!(candidate = %id, error = %e, "specialization did not complete"),
            },
            None => self.resume(id).await,
        }
    }

    /// Run the analyzer for a candidate already in `Specializing`.
    async fn specialize(&self, request: SpecializationRequest) -> Result<AgentDescriptor> {
        let id = request.lineage.candidate_id;
        let specialization = match self.analyzer.analyze(&request.summary).await {
            Ok(specialization) => specialization,
            Err(e) => {
                let e = match e {
                    LifecycleError::SpecializationFailure(_) => e,
                    other => LifecycleError::SpecializationFailure(other.to_string()),
                };
                obs::emit_lifecycle_error(id, "specialization", &e);
                self.return_to_buffering(id);
                self.emit(LifecycleEvent::SpecializationFailed {
                    candidate: id,
                    reason: e.to_string(),
                });
                self.resume(id).await;
                return Err(e);
            }
        };

        let descriptor = AgentDescriptor::new(specialization, request.lineage);
        self.descriptors.lock().push(descriptor.clone());
        METRICS.inc_candidates_specialized();
        obs::emit_candidate_specialized(id, &descriptor.domain, descriptor.capabilities.len());
        if let Some(store) = &self.store {
            if let Err(e) = store.save_descriptor(&descriptor).await {
                warn!(
                    descriptor = %descriptor.descriptor_id,
                    error = %e,
                    "failed to persist descriptor"
                );
            }
        }
        self.emit(LifecycleEvent::Specialized {
            descriptor: Box::new(descriptor.clone()),
        });

        self.retire_candidate(id).await?;
        Ok(descriptor)
    }

    /// Retire `id` and, if configured, respawn into its slot.
    async fn retire_candidate(&self, id: CandidateId) -> Result<Option<CandidateId>> {
        let (retired, spawned) = {
            let mut arena = self.arena.lock();
            let record = arena
                .get_mut(id)
                .ok_or(LifecycleError::CandidateNotFound(id))?;
            self.transition(&mut record.candidate, LifecycleState::Retired)?;
            let retired = arena
                .remove(id)
                .map(|r| r.candidate)
                .ok_or(LifecycleError::CandidateNotFound(id))?;
            let spawned = if self.config.respawn_retired {
                arena
                    .respawn(id)
                    .and_then(|new_id| arena.get(new_id))
                    .map(|r| r.candidate.clone())
            } else {
                None
            };
            (retired, spawned)
        };

        let cancelled = self.scheduler.cancel_candidate(id);
        let discarded = self.buffers.remove(id).unwrap_or(0);
        info!(
            event = "candidate.retired",
            candidate = %id,
            cancelled_jobs = cancelled,
            discarded_bytes = discarded,
        );
        self.emit(LifecycleEvent::CandidateRetired { candidate: id });

        let spawned_id = spawned.as_ref().map(|c| c.id);
        match spawned {
            Some(fresh) => {
                self.buffers.register(fresh.id, 0);
                self.emit(LifecycleEvent::CandidateSpawned {
                    candidate: fresh.id,
                });
                // Same slot key, so this replaces the retired record.
                self.persist_candidates(vec![fresh]).await;
            }
            None => self.persist_candidates(vec![retired]).await,
        }
        Ok(spawned_id)
    }

    fn return_to_buffering(&self, id: CandidateId) {
        let mut arena = self.arena.lock();
        if let Some(record) = arena.get_mut(id) {
            self.settle(&mut record.candidate, LifecycleState::Buffering);
        }
    }

    /// Persist the candidate and submit any buffer that piled up meanwhile.
    async fn resume(&self, id: CandidateId) {
        let snapshot = self.try_submit(id).or_else(|| {
            self.arena
                .lock()
                .get(id)
                .map(|r| r.candidate.clone())
        });
        if let Some(candidate) = snapshot {
            self.persist_candidates(vec![candidate]).await;
        }
    }

    async fn on_tick(&self) {
        let ids = self.arena.lock().ids();
        let changed: Vec<Candidate> = ids
            .into_iter()
            .filter_map(|id| self.try_submit(id))
            .collect();
        if !changed.is_empty() {
            self.persist_candidates(changed).await;
        }

        let retired = self.registry.rebalance().await;
        if !retired.is_empty() {
            self.release_retired(retired).await;
            self.persist_registry().await;
        }
    }

    /// Candidates younger than one selection period are left alone.
    async fn natural_selection(&self) -> Vec<(CandidateId, f64)> {
        let now = Utc::now();
        let threshold = self.config.min_survival_fitness;
        let min_age = self.config.selection_interval().unwrap_or_default();
        let (live, victims) = {
            let arena = self.arena.lock();
            let live = arena.records().count();
            let mut weak: Vec<(CandidateId, f64)> = arena
                .records()
                .map(|r| &r.candidate)
                .filter(|c| c.state != LifecycleState::Specializing)
                .filter(|c| (now - c.created_at).to_std().unwrap_or_default() >= min_age)
                .map(|c| (c.id, c.fitness(now)))
                .filter(|(_, fitness)| *fitness < threshold)
                .collect();
            weak.sort_by(|a, b| a.1.total_cmp(&b.1));
            weak.truncate(live.saturating_sub(self.config.min_population));
            (live, weak)
        };

        for &(id, fitness) in &victims {
            METRICS.inc_candidates_culled();
            obs::emit_candidate_culled(id, fitness, threshold);
            self.emit(LifecycleEvent::CandidateCulled {
                candidate: id,
                fitness,
            });
            if let Err(e) = self.retire_candidate(id).await {
                warn!(candidate = %id, error = %e, "failed to cull candidate");
            }
        }
        debug!(
            live,
            culled = victims.len(),
            min_population = self.config.min_population,
            "natural selection pass"
        );
        victims
    }

    async fn release_retired(&self, retired: Vec<Retired>) {
        for Retired { entry_id, artifact } in retired {
            self.emit(LifecycleEvent::EntryRetired {
                entry: entry_id,
                artifact: artifact.artifact_id,
            });
            self.release_artifact(&artifact).await;
        }
    }

    async fn release_artifact(&self, artifact: &ModelArtifact) {
        if let Err(e) = self.runtime.release(&artifact.handle).await {
            warn!(artifact = %artifact.artifact_id, error = %e, "failed to release artifact");
        }
    }

    async fn persist_candidates(&self, candidates: Vec<Candidate>) {
        let Some(store) = &self.store else {
            return;
        };
        for candidate in candidates {
            if let Err(e) = store.save_candidate(&candidate).await {
                warn!(candidate = %candidate.id, error = %e, "failed to persist candidate");
            }
        }
    }

    async fn persist_registry(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.registry.snapshot().await;
        if let Err(e) = store.save_registry(&snapshot).await {
            warn!(error = %e, "failed to persist registry");
        }
    }

    async fn status(&self) -> PoolStatus {
        let mut candidates_by_state = BTreeMap::new();
        let mut dominant_domains = BTreeMap::new();
        let (live_candidates, free_slots) = {
            let arena = self.arena.lock();
            for record in arena.records() {
                *candidates_by_state
                    .entry(record.candidate.state.as_str().to_string())
                    .or_insert(0) += 1;
                if let Some((domain, _)) = record.candidate.dominant_domain() {
                    *dominant_domains.entry(domain.to_string()).or_insert(0) += 1;
                }
            }
            (arena.capacity() - arena.free_slots(), arena.free_slots())
        };
        let snapshot = self.registry.snapshot().await;
        PoolStatus {
            live_candidates,
            free_slots,
            candidates_by_state,
            dominant_domains,
            active_entries: snapshot
                .entries
                .iter()
                .filter(|e| e.status == EntryStatus::Active)
                .count(),
            pending_activations: snapshot
                .entries
                .iter()
                .filter(|e| e.pending_activation)
                .count(),
            queued_jobs: self.scheduler.queue_depth(),
            running_jobs: self.scheduler.running(),
            descriptors_emitted: self.descriptors.lock().len(),
            metrics: METRICS.snapshot(),
        }
    }
}

async fn drive(
    inner: Arc<Inner>,
    mut sealed_rx: mpsc::UnboundedReceiver<SealedBuffer>,
    mut outcome_rx: mpsc::UnboundedReceiver<JobOutcome>,
) {
    let mut evaluations = JoinSet::new();
    let mut tick = tokio::time::interval(inner.config.submit_retry_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let selection_period = inner.config.selection_interval();
    let period = selection_period.unwrap_or(Duration::from_secs(3600));
    let mut selection = tokio::time::interval_at(Instant::now() + period, period);
    selection.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            Some(sealed) = sealed_rx.recv() => inner.on_sealed(sealed).await,
            Some(outcome) = outcome_rx.recv() => {
                if let Some(work) = inner.on_job_outcome(outcome).await {
                    evaluations.spawn(Arc::clone(&inner).evaluate(work));
                }
            }
            Some(joined) = evaluations.join_next(), if !evaluations.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "evaluation task ended abnormally");
                }
            }
            _ = tick.tick() => inner.on_tick().await,
            _ = selection.tick(), if selection_period.is_some() => {
                inner.natural_selection().await;
            }
        }
    }
    evaluations.shutdown().await;
    debug!("supervisor driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedRuntime;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            byte_budget_per_candidate: 100,
            ready_threshold_fraction: 1.0,
            candidate_slots: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_requires_a_runtime() {
        let err = Supervisor::builder(config()).start().await.err().unwrap();
        assert!(matches!(err, LifecycleError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let mut bad = config();
        bad.exploration_rate_epsilon = 1.5;
        let err = Supervisor::builder(bad)
            .runtime(Arc::new(ScriptedRuntime::new()))
            .start()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LifecycleError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn start_fills_every_slot() {
        let supervisor = Supervisor::builder(config())
            .runtime(Arc::new(ScriptedRuntime::new()))
            .start()
            .await
            .unwrap();
        let candidates = supervisor.list_candidates();
        assert_eq!(candidates.len(), 3);
        assert!(candidates
            .iter()
            .all(|c| c.state == LifecycleState::Observing));
        assert!(matches!(
            supervisor.spawn_candidate().await,
            Err(LifecycleError::SlotsExhausted(3))
        ));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn first_chunk_moves_candidate_to_buffering() {
        let supervisor = Supervisor::builder(config())
            .runtime(Arc::new(ScriptedRuntime::new()))
            .start()
            .await
            .unwrap();
        let id = supervisor.list_candidates()[0].id;
        let ready = supervisor
            .ingest_bytes(id, vec![0u8; 10], ChunkMetadata::new("test"))
            .unwrap();
        assert!(!ready.is_ready());

        let candidate = supervisor.candidate(id).unwrap();
        assert_eq!(candidate.state, LifecycleState::Buffering);
        assert_eq!(candidate.accumulated_bytes, 10);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn ingest_for_unknown_candidate_fails() {
        let supervisor = Supervisor::builder(config())
            .runtime(Arc::new(ScriptedRuntime::new()))
            .start()
            .await
            .unwrap();
        let err = supervisor
            .ingest_bytes(CandidateId::new(1, 9), vec![1u8], ChunkMetadata::new("test"))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::CandidateNotFound(_)));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn natural_selection_spares_young_candidates() {
        let supervisor = Supervisor::builder(OrchestratorConfig {
            min_population: 0,
            selection_interval_secs: 3_600,
            ..config()
        })
        .runtime(Arc::new(ScriptedRuntime::new()))
        .start()
        .await
        .unwrap();
        assert!(supervisor.run_natural_selection().await.is_empty());
        assert_eq!(supervisor.list_candidates().len(), 3);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn natural_selection_keeps_min_population() {
        let supervisor = Supervisor::builder(OrchestratorConfig {
            min_population: 3,
            selection_interval_secs: 0,
            ..config()
        })
        .runtime(Arc::new(ScriptedRuntime::new()))
        .start()
        .await
        .unwrap();
        let before = supervisor.list_candidates();
        assert!(supervisor.run_natural_selection().await.is_empty());
        assert_eq!(supervisor.list_candidates(), before);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn force_specialize_needs_an_evaluated_artifact() {
        let supervisor = Supervisor::builder(config())
            .runtime(Arc::new(ScriptedRuntime::new()))
            .start()
            .await
            .unwrap();
        let id = supervisor.list_candidates()[0].id;
        assert!(matches!(
            supervisor.force_specialize(id).await,
            Err(LifecycleError::NotMatured(_))
        ));
        supervisor.shutdown().await;
    }
}
