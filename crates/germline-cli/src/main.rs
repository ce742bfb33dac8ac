//! Germline CLI
//!
//! The `germline` command runs the continual model-lifecycle orchestrator
//! against simulated collaborators and inspects what it persisted.
//!
//! ## Commands
//!
//! - `run`: feed synthetic capture data, route requests, print a report
//! - `config`: print the effective configuration
//! - `status`: print persisted candidates, registry entries and descriptors

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use germline_core::{
    AgentDescriptor, Candidate, CandidateId, ChunkMetadata, DataChunk, FeedbackOutcome,
    LifecycleError, LifecycleEvent, LifecycleState, LifecycleStore, OrchestratorConfig,
    PoolStatus, RegistryEntry, RegistrySnapshot, SelectionMode, SimulatedRuntime, Supervisor,
    TrainingRuntime,
};
use germline_state::{FsCasStore, FsKvStore, MemoryCasStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};

/// Lifecycle records under the state directory.
const STATE_SUBDIR: &str = "state";
/// Simulated artifact blobs under the state directory.
const ARTIFACTS_SUBDIR: &str = "artifacts";

/// Capture domains the synthetic feed draws from.
const DOMAINS: [&str; 7] = [
    "file_operations",
    "development",
    "communication",
    "web_browsing",
    "creative_work",
    "app_launches",
    "temporal_patterns",
];

/// How often a backpressured chunk is offered again before it is dropped.
const MAX_INGEST_ATTEMPTS: usize = 600;
const IDLE_WAIT_LIMIT: Duration = Duration::from_secs(120);
const MAX_DEFAULT_CHUNK_BYTES: u64 = 64 * 1024;

#[derive(Parser)]
#[command(name = "germline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Continual, resource-bounded model-lifecycle orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Orchestrator configuration file (TOML)
    #[arg(short, long, global = true, env = "GERMLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator on a synthetic capture feed
    Run {
        /// Persist lifecycle state and artifacts here (in-memory if omitted)
        #[arg(long, env = "GERMLINE_STATE_DIR")]
        state_dir: Option<PathBuf>,

        /// Number of chunks to capture
        #[arg(long, default_value_t = 400)]
        chunks: usize,

        /// Bytes per chunk (default: a quarter of the seal threshold, at most 64 KiB)
        #[arg(long)]
        chunk_bytes: Option<u64>,

        /// Override the per-candidate byte budget
        #[arg(long)]
        byte_budget: Option<u64>,

        /// Number of inference requests to route
        #[arg(long, default_value_t = 200)]
        requests: usize,

        /// Seed for the capture feed, feedback and selection policy
        #[arg(long)]
        seed: Option<u64>,

        /// Simulated training time per job, in milliseconds
        #[arg(long, default_value_t = 0)]
        train_delay_ms: u64,
    },

    /// Print the effective configuration (defaults, file, environment) as TOML
    Config,

    /// Print persisted candidates, registry entries and descriptors
    Status {
        /// State directory written by `germline run --state-dir`
        #[arg(long, env = "GERMLINE_STATE_DIR")]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    germline_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            state_dir,
            chunks,
            chunk_bytes,
            byte_budget,
            requests,
            seed,
            train_delay_ms,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(budget) = byte_budget {
                config.byte_budget_per_candidate = budget;
                config
                    .validate()
                    .context("Invalid --byte-budget override")?;
            }
            let options = RunOptions {
                state_dir,
                chunks,
                chunk_bytes,
                requests,
                seed: seed.unwrap_or_else(rand::random),
                train_delay: Duration::from_millis(train_delay_ms),
            };
            let report = cmd_run(config, options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {
            print!("{}", cmd_config(cli.config.as_deref())?);
        }
        Commands::Status { state_dir } => {
            let report = cmd_status(&state_dir).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    germline_core::METRICS.flush();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    OrchestratorConfig::resolve(path).with_context(|| match path {
        Some(p) => format!("Failed to load configuration from {:?}", p),
        None => "Failed to resolve default configuration".to_string(),
    })
}

fn cmd_config(path: Option<&Path>) -> Result<String> {
    let config = load_config(path)?;
    Ok(config.to_toml_string()?)
}

struct RunOptions {
    state_dir: Option<PathBuf>,
    chunks: usize,
    chunk_bytes: Option<u64>,
    requests: usize,
    seed: u64,
    train_delay: Duration,
}

#[derive(Debug, Default, Serialize)]
struct RequestTally {
    exploit: u64,
    explore: u64,
    /// Requests served by default behaviour because the pool was empty.
    fallback: u64,
    positive: u64,
    negative: u64,
}

#[derive(Serialize)]
struct RunReport {
    seed: u64,
    chunk_bytes: u64,
    chunks_ingested: usize,
    chunks_dropped: usize,
    requests: RequestTally,
    status: PoolStatus,
    candidates: Vec<Candidate>,
    active_pool: Vec<RegistryEntry>,
    descriptors: Vec<AgentDescriptor>,
}

#[derive(Serialize)]
struct StatusReport {
    candidates: Vec<Candidate>,
    registry: RegistrySnapshot,
    descriptors: Vec<AgentDescriptor>,
}

/// Capture stand-in: every candidate leans toward a home domain picked by
/// its slot, with some cross-domain noise and untagged chunks.
struct SyntheticCapture {
    rng: StdRng,
    chunk_bytes: usize,
}

impl SyntheticCapture {
    fn new(seed: u64, chunk_bytes: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            chunk_bytes: chunk_bytes as usize,
        }
    }

    fn next_chunk(&mut self, candidate: CandidateId) -> DataChunk {
        let mut payload = vec![0u8; self.chunk_bytes];
        self.rng.fill(&mut payload[..]);
        let metadata = ChunkMetadata::new("synthetic");

        if self.rng.random_bool(0.1) {
            return DataChunk::new(payload, metadata);
        }
        let home = DOMAINS[candidate.slot as usize % DOMAINS.len()];
        let domain = if self.rng.random_bool(0.8) {
            home
        } else {
            DOMAINS[self.rng.random_range(0..DOMAINS.len())]
        };
        let confidence = self.rng.random_range(0.5..1.0);
        DataChunk::new(payload, metadata.with_pattern(domain, confidence))
    }
}

async fn cmd_run(config: OrchestratorConfig, options: RunOptions) -> Result<RunReport> {
    let threshold = config.ready_threshold_bytes();
    let chunk_bytes = options
        .chunk_bytes
        .unwrap_or_else(|| threshold.div_ceil(4).clamp(1, MAX_DEFAULT_CHUNK_BYTES));
    let seals_possible = (options.chunks as u64 * chunk_bytes) / threshold.max(1);
    if seals_possible == 0 {
        warn!(
            chunks = options.chunks,
            chunk_bytes,
            threshold,
            "feed too small to seal any buffer; lower --byte-budget or raise --chunks"
        );
    }
    let pause = config.submit_retry_interval();

    let runtime: Arc<dyn TrainingRuntime>;
    let mut store = None;
    match &options.state_dir {
        Some(dir) => {
            let cas = FsCasStore::new(dir.join(ARTIFACTS_SUBDIR))
                .with_context(|| format!("Failed to open artifact store in {:?}", dir))?;
            let kv = FsKvStore::new(dir.join(STATE_SUBDIR))
                .with_context(|| format!("Failed to open state store in {:?}", dir))?;
            runtime = Arc::new(
                SimulatedRuntime::new(Arc::new(cas)).with_train_delay(options.train_delay),
            );
            store = Some(LifecycleStore::new(Arc::new(kv)));
        }
        None => {
            runtime = Arc::new(
                SimulatedRuntime::new(Arc::new(MemoryCasStore::new()))
                    .with_train_delay(options.train_delay),
            );
        }
    }

    let mut builder = Supervisor::builder(config)
        .runtime(runtime)
        .seed(options.seed);
    if let Some(store) = store {
        builder = builder.store(store);
    }
    let supervisor = builder.start().await.context("Failed to start supervisor")?;
    info!(
        seed = options.seed,
        chunks = options.chunks,
        chunk_bytes,
        requests = options.requests,
        "starting synthetic run"
    );

    let mut events = supervisor.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::Specialized { descriptor }) => info!(
                    descriptor = %descriptor.descriptor_id,
                    domain = %descriptor.domain,
                    autonomy = ?descriptor.autonomy,
                    "agent specialized"
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event watcher lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut capture = SyntheticCapture::new(options.seed, chunk_bytes);
    let mut feedback = StdRng::seed_from_u64(options.seed.rotate_left(32));
    let mut tally = RequestTally::default();
    let (mut ingested, mut dropped, mut routed) = (0usize, 0usize, 0usize);

    for i in 0..options.chunks {
        let live = supervisor.list_candidates();
        let Some(candidate) = live.get(i % live.len().max(1)) else {
            warn!("no live candidates left to feed");
            break;
        };
        let chunk = capture.next_chunk(candidate.id);
        if ingest_with_retry(&supervisor, candidate.id, chunk, pause).await? {
            ingested += 1;
        } else {
            dropped += 1;
        }

        let due = (i + 1) * options.requests / options.chunks;
        while routed < due {
            route_request(&supervisor, &mut feedback, &mut tally).await?;
            routed += 1;
        }
        tokio::task::yield_now().await;
    }

    if !wait_until_idle(&supervisor, pause).await {
        warn!("training still in flight when the report was taken");
    }
    while routed < options.requests {
        route_request(&supervisor, &mut feedback, &mut tally).await?;
        routed += 1;
    }

    let report = RunReport {
        seed: options.seed,
        chunk_bytes,
        chunks_ingested: ingested,
        chunks_dropped: dropped,
        requests: tally,
        status: supervisor.status().await,
        candidates: supervisor.list_candidates(),
        active_pool: supervisor.active_entries().await,
        descriptors: supervisor.descriptors(),
    };
    supervisor.shutdown().await;
    watcher.abort();
    Ok(report)
}

/// Offer a chunk until it is accepted. Returns false if the candidate was
/// retired meanwhile or backpressure never cleared.
async fn ingest_with_retry(
    supervisor: &Supervisor,
    id: CandidateId,
    chunk: DataChunk,
    pause: Duration,
) -> Result<bool> {
    for _ in 0..MAX_INGEST_ATTEMPTS {
        match supervisor.ingest(id, chunk.clone()) {
            Ok(_) => return Ok(true),
            Err(e) if e.is_transient() => tokio::time::sleep(pause).await,
            Err(LifecycleError::CandidateNotFound(_)) => return Ok(false),
            Err(e) => return Err(e).context("Ingest failed"),
        }
    }
    warn!(candidate = %id, "dropping chunk after persistent backpressure");
    Ok(false)
}

/// Route one request and feed back a synthetic outcome that is positive
/// with probability equal to the chosen artifact's offline quality.
async fn route_request(
    supervisor: &Supervisor,
    rng: &mut StdRng,
    tally: &mut RequestTally,
) -> Result<()> {
    let selection = match supervisor.select_for_request().await {
        Ok(selection) => selection,
        Err(LifecycleError::PoolEmpty) => {
            tally.fallback += 1;
            return Ok(());
        }
        Err(e) => return Err(e).context("Selection failed"),
    };
    match selection.mode {
        SelectionMode::Exploit => tally.exploit += 1,
        SelectionMode::Explore => tally.explore += 1,
    }

    let quality = supervisor
        .entry(selection.entry_id)
        .await
        .map(|e| e.score.offline_quality)
        .unwrap_or(0.5);
    let outcome = if rng.random_bool(quality.clamp(0.0, 1.0)) {
        tally.positive += 1;
        FeedbackOutcome::Positive
    } else {
        tally.negative += 1;
        FeedbackOutcome::Negative
    };
    if let Err(e) = supervisor.report_outcome(&selection, outcome).await {
        debug!(entry = %selection.entry_id, error = %e, "feedback not recorded");
    }
    Ok(())
}

/// Poll until no candidate has training, evaluation or specialization in
/// flight. Returns false on timeout.
async fn wait_until_idle(supervisor: &Supervisor, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + IDLE_WAIT_LIMIT;
    loop {
        // Give the driver a chance to pick up buffers sealed just now.
        tokio::time::sleep(poll).await;
        let busy = supervisor.list_candidates().iter().any(|c| {
            matches!(
                c.state,
                LifecycleState::TrainingReady
                    | LifecycleState::Training
                    | LifecycleState::Evaluating
                    | LifecycleState::Specializing
            )
        });
        if !busy && supervisor.active_jobs().is_empty() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
    }
}

async fn cmd_status(state_dir: &Path) -> Result<StatusReport> {
    let state = state_dir.join(STATE_SUBDIR);
    if !state.is_dir() {
        bail!("No germline state found at {:?}", state);
    }
    let kv = FsKvStore::new(&state)
        .with_context(|| format!("Failed to open state store in {:?}", state))?;
    let store = LifecycleStore::new(Arc::new(kv));

    let candidates = store.load_candidates().await?;
    let registry = store.load_registry().await?.unwrap_or_default();
    let descriptors = store.load_descriptors().await?;
    info!(
        candidates = candidates.len(),
        entries = registry.entries.len(),
        descriptors = descriptors.len(),
        "loaded persisted state"
    );
    Ok(StatusReport {
        candidates,
        registry,
        descriptors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use germline_core::EntryStatus;

    fn small_config() -> OrchestratorConfig {
        OrchestratorConfig {
            byte_budget_per_candidate: 4_096,
            candidate_slots: 3,
            pool_cap_k: 2,
            eviction_grace_period_secs: 0,
            submit_retry_interval_ms: 10,
            specialization_min_cycles: 2,
            specialization_confidence_threshold: 0.5,
            specialization_learning_rate: 0.5,
            ..Default::default()
        }
    }

    fn options(state_dir: Option<PathBuf>) -> RunOptions {
        RunOptions {
            state_dir,
            chunks: 60,
            chunk_bytes: Some(1_024),
            requests: 40,
            seed: 7,
            train_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "germline", "--json", "run", "--chunks", "10", "--requests", "5", "--seed", "3",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                chunks,
                requests,
                seed,
                ..
            } => {
                assert_eq!(chunks, 10);
                assert_eq!(requests, 5);
                assert_eq!(seed, Some(3));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cmd_config_prints_defaults_as_toml() {
        let rendered = cmd_config(None).unwrap();
        let parsed = OrchestratorConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.pool_cap_k, OrchestratorConfig::default().pool_cap_k);
        assert!(rendered.contains("exploration_rate_epsilon"));
    }

    #[test]
    fn test_synthetic_capture_is_deterministic_per_seed() {
        let id = CandidateId::new(1, 0);
        let mut a = SyntheticCapture::new(9, 32);
        let mut b = SyntheticCapture::new(9, 32);
        for _ in 0..20 {
            let (x, y) = (a.next_chunk(id), b.next_chunk(id));
            assert_eq!(x.payload, y.payload);
            assert_eq!(x.metadata.pattern, y.metadata.pattern);
            assert_eq!(x.size_bytes(), 32);
        }
    }

    #[tokio::test]
    async fn test_cmd_run_in_memory_trains_and_routes() {
        let report = cmd_run(small_config(), options(None)).await.unwrap();

        assert_eq!(report.chunks_ingested + report.chunks_dropped, 60);
        assert!(report.status.metrics.buffers_sealed > 0);
        assert!(!report.active_pool.is_empty());
        assert!(report.active_pool.len() <= 2);
        assert!(report
            .active_pool
            .iter()
            .all(|e| e.status == EntryStatus::Active));
        let t = &report.requests;
        assert_eq!(t.exploit + t.explore + t.fallback, 40);
        assert_eq!(t.positive + t.negative, t.exploit + t.explore);
    }

    #[tokio::test]
    async fn test_cmd_status_reads_run_state() {
        let dir = tempfile::tempdir().unwrap();
        let report = cmd_run(small_config(), options(Some(dir.path().to_path_buf())))
            .await
            .unwrap();

        let status = cmd_status(dir.path()).await.unwrap();
        assert_eq!(status.candidates.len(), 3);
        assert_eq!(status.descriptors.len(), report.descriptors.len());
        let active = status
            .registry
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Active)
            .count();
        assert_eq!(active, report.active_pool.len());
    }

    #[tokio::test]
    async fn test_cmd_status_without_state_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_status(dir.path()).await.is_err());
    }
}
