//! Bounded-concurrency training scheduler.
//!
//! Admitted jobs go onto one queue drained by a dispatcher task. The
//! dispatcher takes a worker permit for the head of the queue before it
//! spawns that job, so jobs start strictly in submission order whatever the
//! executor's polling order. Each worker calls the runtime with per-attempt
//! timeouts and exponential backoff between attempts. Terminal outcomes are
//! delivered over an mpsc channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use germline_state::ContentDigest;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::domain::{
    ArtifactId, CandidateId, JobId, LifecycleError, ModelArtifact, Result, SealedBuffer,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::runtime::TrainingRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Record of one training invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub job_id: JobId,
    pub candidate_id: CandidateId,
    pub cycle: u64,
    /// Content address of the sealed buffer being trained on.
    pub buffer_digest: ContentDigest,
    pub parent_artifact: Option<ArtifactId>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub attempts: u32,
    pub artifact: Option<ArtifactId>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone)]
pub enum JobResult {
    Succeeded(Arc<ModelArtifact>),
    /// Every attempt failed or timed out; carries the last error.
    Failed(String),
    /// Cancelled before producing an artifact.
    Cancelled,
}

/// Terminal report for one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: TrainingJob,
    pub buffer: Arc<SealedBuffer>,
    pub result: JobResult,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_concurrent: usize,
    max_queue_depth: usize,
    retry_limit: u32,
    backoff: Duration,
    timeout: Duration,
}

struct ActiveJob {
    record: TrainingJob,
    cancel: CancellationToken,
}

type JobTable = Arc<Mutex<HashMap<JobId, ActiveJob>>>;

pub struct TrainingScheduler {
    runtime: Arc<dyn TrainingRuntime>,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    jobs: JobTable,
    outcome_tx: mpsc::UnboundedSender<JobOutcome>,
    dispatch_tx: mpsc::UnboundedSender<JobWorker>,
    shutdown: CancellationToken,
    limits: Limits,
}

impl TrainingScheduler {
    /// Must be called from within a tokio runtime: spawns the dispatcher.
    pub fn new(
        runtime: Arc<dyn TrainingRuntime>,
        config: &OrchestratorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<JobOutcome>) {
        let limits = Limits {
            max_concurrent: config.max_concurrent_training_jobs.max(1),
            max_queue_depth: config.max_queue_depth,
            retry_limit: config.training_retry_limit.max(1),
            backoff: config.retry_backoff(),
            timeout: config.training_timeout(),
        };
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(limits.max_concurrent));
        let queued = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher {
            queue: dispatch_rx,
            permits: Arc::clone(&permits),
            queued: Arc::clone(&queued),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(dispatcher.run());

        let scheduler = Self {
            runtime,
            permits,
            queued,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            outcome_tx,
            dispatch_tx,
            shutdown,
            limits,
        };
        (scheduler, outcome_rx)
    }

    /// Admit a training job for `buffer` without waiting for a worker.
    ///
    /// Returns `Throttled` when every worker is taken and the wait queue is
    /// at `max_queue_depth`; the caller keeps the buffer and retries later.
    pub fn submit(
        &self,
        buffer: Arc<SealedBuffer>,
        parent: Option<Arc<ModelArtifact>>,
    ) -> Result<JobId> {
        let limit = self.limits.max_queue_depth + self.permits.available_permits();
        if let Err(depth) = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
                (q < limit).then_some(q + 1)
            })
        {
            METRICS.inc_jobs_throttled();
            return Err(LifecycleError::Throttled { queue_depth: depth });
        }

        let job_id = JobId::new();
        let record = TrainingJob {
            job_id,
            candidate_id: buffer.candidate_id,
            cycle: buffer.cycle,
            buffer_digest: buffer.digest.clone(),
            parent_artifact: parent.as_ref().map(|p| p.artifact_id),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: JobStatus::Queued,
            attempts: 0,
            artifact: None,
            failure: None,
        };
        let cancel = self.shutdown.child_token();
        self.jobs.lock().insert(
            job_id,
            ActiveJob {
                record,
                cancel: cancel.clone(),
            },
        );

        METRICS.inc_jobs_submitted();
        obs::emit_job_submitted(job_id, buffer.candidate_id, self.queued.load(Ordering::SeqCst));

        let worker = JobWorker {
            job_id,
            buffer,
            parent,
            runtime: Arc::clone(&self.runtime),
            jobs: Arc::clone(&self.jobs),
            outcome_tx: self.outcome_tx.clone(),
            cancel,
            limits: self.limits,
        };
        if let Err(mpsc::error::SendError(worker)) = self.dispatch_tx.send(worker) {
            // Dispatcher gone: the scheduler was shut down.
            self.queued.fetch_sub(1, Ordering::SeqCst);
            worker.finish(JobResult::Cancelled, 0);
        }
        Ok(job_id)
    }

    /// Cancel one job. Returns false if it is unknown or already finished.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.jobs.lock().get(&job_id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every job belonging to `candidate`; returns how many were signalled.
    pub fn cancel_candidate(&self, candidate: CandidateId) -> usize {
        let jobs = self.jobs.lock();
        let mut n = 0;
        for job in jobs.values().filter(|j| j.record.candidate_id == candidate) {
            job.cancel.cancel();
            n += 1;
        }
        n
    }

    /// Snapshot of all jobs not yet finished.
    pub fn active_jobs(&self) -> Vec<TrainingJob> {
        let mut jobs: Vec<_> = self.jobs.lock().values().map(|j| j.record.clone()).collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    pub fn job(&self, job_id: JobId) -> Option<TrainingJob> {
        self.jobs.lock().get(&job_id).map(|j| j.record.clone())
    }

    /// Jobs admitted but still waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.limits.max_concurrent - self.permits.available_permits()
    }

    /// Cancel everything in flight and refuse further work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.permits.close();
    }
}

/// Single consumer of the admission queue.
struct Dispatcher {
    queue: mpsc::UnboundedReceiver<JobWorker>,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            let worker = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.queue.recv() => match next {
                    Some(worker) => worker,
                    None => break,
                },
            };
            // A job cancelled while queued is finished here without a permit.
            let acquired = tokio::select! {
                biased;
                _ = worker.cancel.cancelled() => None,
                permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            };
            self.queued.fetch_sub(1, Ordering::SeqCst);
            match acquired {
                Some(permit) => {
                    tokio::spawn(worker.run(permit));
                }
                None => worker.finish(JobResult::Cancelled, 0),
            }
        }

        self.queue.close();
        while let Ok(worker) = self.queue.try_recv() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            worker.finish(JobResult::Cancelled, 0);
        }
        tracing::debug!("training dispatcher stopped");
    }
}

struct JobWorker {
    job_id: JobId,
    buffer: Arc<SealedBuffer>,
    parent: Option<Arc<ModelArtifact>>,
    runtime: Arc<dyn TrainingRuntime>,
    jobs: JobTable,
    outcome_tx: mpsc::UnboundedSender<JobOutcome>,
    cancel: CancellationToken,
    limits: Limits,
}

enum Attempt<T> {
    Done(T),
    Cancelled,
}

impl JobWorker {
    /// Runs with a worker permit held until the job finishes.
    async fn run(self, _permit: OwnedSemaphorePermit) {
        let parent_handle = self.parent.as_ref().map(|p| &p.handle);
        let mut last_error = String::new();

        for attempt in 1..=self.limits.retry_limit {
            self.mark_running(attempt);
            let train = tokio::time::timeout(
                self.limits.timeout,
                self.runtime.train(parent_handle, &self.buffer),
            );
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Attempt::Cancelled,
                r = train => Attempt::Done(r),
            };

            match result {
                Attempt::Cancelled => {
                    self.finish(JobResult::Cancelled, attempt);
                    return;
                }
                Attempt::Done(Ok(Ok(trained))) => {
                    let artifact = ModelArtifact {
                        artifact_id: ArtifactId::new(),
                        candidate_id: self.buffer.candidate_id,
                        parent_artifact: self.parent.as_ref().map(|p| p.artifact_id),
                        cycle: self.buffer.cycle,
                        created_at: Utc::now(),
                        size_bytes: trained.size_bytes,
                        handle: trained.handle,
                    };
                    self.finish(JobResult::Succeeded(Arc::new(artifact)), attempt);
                    return;
                }
                Attempt::Done(Ok(Err(e))) => last_error = e.to_string(),
                Attempt::Done(Err(_)) => {
                    last_error = format!("attempt timed out after {:?}", self.limits.timeout)
                }
            }

            METRICS.inc_training_attempts_failed();
            obs::emit_attempt_failed(self.job_id, attempt, &last_error);

            if attempt < self.limits.retry_limit {
                let delay = self
                    .limits
                    .backoff
                    .saturating_mul(1u32 << (attempt - 1).min(16));
                let slept = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Attempt::Cancelled,
                    _ = tokio::time::sleep(delay) => Attempt::Done(()),
                };
                if let Attempt::Cancelled = slept {
                    self.finish(JobResult::Cancelled, attempt);
                    return;
                }
            }
        }

        METRICS.inc_jobs_failed();
        self.finish(JobResult::Failed(last_error), self.limits.retry_limit);
    }

    fn mark_running(&self, attempt: u32) {
        if let Some(job) = self.jobs.lock().get_mut(&self.job_id) {
            job.record.status = JobStatus::Running;
            job.record.attempts = attempt;
            job.record.started_at.get_or_insert_with(Utc::now);
        }
    }

    fn finish(&self, result: JobResult, attempts: u32) {
        let Some(active) = self.jobs.lock().remove(&self.job_id) else {
            return;
        };
        let mut job = active.record;
        job.attempts = attempts;
        job.finished_at = Some(Utc::now());
        match &result {
            JobResult::Succeeded(artifact) => {
                job.status = JobStatus::Succeeded;
                job.artifact = Some(artifact.artifact_id);
            }
            JobResult::Failed(reason) => {
                job.status = JobStatus::Failed;
                job.failure = Some(reason.clone());
            }
            JobResult::Cancelled => job.status = JobStatus::Cancelled,
        }
        obs::emit_job_finished(
            self.job_id,
            job.candidate_id,
            attempts,
            job.status == JobStatus::Succeeded,
        );

        let outcome = JobOutcome {
            job,
            buffer: Arc::clone(&self.buffer),
            result,
        };
        if self.outcome_tx.send(outcome).is_err() {
            tracing::debug!(job = %self.job_id, "job outcome receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChunkMetadata, DataChunk};
    use crate::fakes::{ScriptedRuntime, TrainStep};

    fn config(max_concurrent: usize, depth: usize, retries: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_training_jobs: max_concurrent,
            max_queue_depth: depth,
            training_retry_limit: retries,
            retry_backoff_ms: 100,
            training_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn buffer(slot: u32) -> Arc<SealedBuffer> {
        Arc::new(SealedBuffer::seal(
            CandidateId::new(slot, 0),
            1,
            vec![DataChunk::new(vec![slot as u8; 64], ChunkMetadata::new("test"))],
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn worker_pool_bounds_concurrency() {
        let runtime = Arc::new(ScriptedRuntime::new().with_train_delay(Duration::from_secs(1)));
        let (scheduler, mut outcomes) = TrainingScheduler::new(runtime.clone(), &config(2, 8, 1));

        for slot in 0..5 {
            scheduler.submit(buffer(slot), None).unwrap();
        }
        for _ in 0..5 {
            let outcome = outcomes.recv().await.unwrap();
            assert_eq!(outcome.job.status, JobStatus::Succeeded);
        }
        assert_eq!(runtime.max_in_flight(), 2);
        assert!(scheduler.active_jobs().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn jobs_start_in_submission_order() {
        let runtime = Arc::new(ScriptedRuntime::new().with_train_delay(Duration::from_millis(10)));
        let (scheduler, mut outcomes) = TrainingScheduler::new(runtime, &config(1, 8, 1));
        let scheduler = Arc::new(scheduler);

        // Submitting from a spawned task puts the newest job in the LIFO slot.
        let submitter = Arc::clone(&scheduler);
        tokio::spawn(async move {
            for slot in 0..4 {
                submitter.submit(buffer(slot), None).unwrap();
            }
        })
        .await
        .unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(outcomes.recv().await.unwrap().job.candidate_id.slot);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_job_cancelled_before_it_starts() {
        let runtime = Arc::new(ScriptedRuntime::new().with_steps([TrainStep::Hang]));
        let (scheduler, mut outcomes) = TrainingScheduler::new(runtime, &config(1, 4, 1));

        let hung = scheduler.submit(buffer(0), None).unwrap();
        let waiting = scheduler.submit(buffer(1), None).unwrap();
        tokio::task::yield_now().await;
        assert!(scheduler.cancel(waiting));
        assert!(scheduler.cancel(hung));

        let mut cancelled = Vec::new();
        for _ in 0..2 {
            let outcome = outcomes.recv().await.unwrap();
            assert!(matches!(outcome.result, JobResult::Cancelled));
            cancelled.push(outcome.job.job_id);
        }
        assert!(cancelled.contains(&waiting));
        assert_eq!(scheduler.queue_depth(), 0);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_throttles() {
        let runtime =
            Arc::new(ScriptedRuntime::new().with_steps([TrainStep::Hang, TrainStep::Hang]));
        let (scheduler, _outcomes) = TrainingScheduler::new(runtime, &config(1, 1, 1));

        scheduler.submit(buffer(0), None).unwrap();
        scheduler.submit(buffer(1), None).unwrap();
        let err = scheduler.submit(buffer(2), None).unwrap_err();
        assert!(matches!(err, LifecycleError::Throttled { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let runtime = Arc::new(ScriptedRuntime::new().with_steps([
            TrainStep::Fail("oom".into()),
            TrainStep::Fail("oom".into()),
        ]));
        let (scheduler, mut outcomes) = TrainingScheduler::new(runtime.clone(), &config(1, 4, 3));

        scheduler.submit(buffer(0), None).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome.result, JobResult::Succeeded(_)));
        assert_eq!(outcome.job.attempts, 3);
        assert_eq!(runtime.train_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_permanently() {
        let runtime = Arc::new(ScriptedRuntime::new().with_steps([
            TrainStep::Fail("a".into()),
            TrainStep::Fail("b".into()),
            TrainStep::Fail("c".into()),
        ]));
        let (scheduler, mut outcomes) = TrainingScheduler::new(runtime.clone(), &config(1, 4, 3));

        scheduler.submit(buffer(0), None).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.job.status, JobStatus::Failed);
        assert!(outcome.job.failure.unwrap().contains('c'));
        assert_eq!(runtime.train_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let runtime = Arc::new(ScriptedRuntime::new().with_steps([TrainStep::Hang]));
        let (scheduler, mut outcomes) = TrainingScheduler::new(runtime, &config(1, 4, 1));

        scheduler.submit(buffer(0), None).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        match outcome.result {
            JobResult::Failed(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_frees_the_worker() {
        let runtime = Arc::new(ScriptedRuntime::new().with_steps([TrainStep::Hang]));
        let (scheduler, mut outcomes) = TrainingScheduler::new(runtime, &config(1, 4, 1));

        let hung = scheduler.submit(buffer(0), None).unwrap();
        let next = scheduler.submit(buffer(1), None).unwrap();
        tokio::task::yield_now().await;
        assert!(scheduler.cancel(hung));

        let first = outcomes.recv().await.unwrap();
        assert_eq!(first.job.job_id, hung);
        assert!(matches!(first.result, JobResult::Cancelled));
        assert!(first.job.artifact.is_none());

        let second = outcomes.recv().await.unwrap();
        assert_eq!(second.job.job_id, next);
        assert_eq!(second.job.status, JobStatus::Succeeded);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn artifact_records_parent_lineage() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (scheduler, mut outcomes) = TrainingScheduler::new(runtime, &config(1, 4, 1));

        scheduler.submit(buffer(0), None).unwrap();
        let JobResult::Succeeded(parent) = outcomes.recv().await.unwrap().result else {
            panic!("first job should succeed");
        };
        scheduler.submit(buffer(0), Some(parent.clone())).unwrap();
        let JobResult::Succeeded(child) = outcomes.recv().await.unwrap().result else {
            panic!("second job should succeed");
        };
        assert_eq!(child.parent_artifact, Some(parent.artifact_id));
    }
}
