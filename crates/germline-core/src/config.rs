//! Orchestrator configuration.
//!
//! Resolution order: built-in defaults, then a TOML file, then `GERMLINE_*`
//! environment variables. Call [`OrchestratorConfig::validate`] last.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("environment variable {var} has invalid value {value:?}")]
    Env { var: String, value: String },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Exploration-rate decay as the active pool accumulates feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsilonDecay {
    /// Feedback samples (across the active pool) that halve ε.
    pub half_life_samples: u64,
    /// ε never decays below this.
    pub floor: f64,
}

/// Every tunable of the lifecycle orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Byte budget of one candidate buffer.
    pub byte_budget_per_candidate: u64,
    /// Fraction of the budget at which a buffer seals.
    pub ready_threshold_fraction: f64,
    /// Maximum number of Active registry entries.
    pub pool_cap_k: usize,
    /// Global training worker-pool size.
    pub max_concurrent_training_jobs: usize,
    /// Jobs allowed to wait for a worker before submissions are throttled.
    pub max_queue_depth: usize,
    /// Total training attempts per job.
    pub training_retry_limit: u32,
    /// Backoff before the second attempt; doubles after each failure.
    pub retry_backoff_ms: u64,
    /// Hard wall-clock ceiling per training attempt.
    pub training_timeout_secs: u64,
    /// Hard wall-clock ceiling for one offline evaluation.
    pub evaluation_timeout_secs: u64,
    pub exploration_rate_epsilon: f64,
    pub epsilon_decay: Option<EpsilonDecay>,
    /// Entries younger than this are never evicted on score.
    pub eviction_grace_period_secs: u64,
    /// Pseudo-sample weight of the offline score in the blended score.
    pub feedback_prior_weight: f64,
    pub specialization_confidence_threshold: f64,
    pub specialization_min_cycles: u32,
    /// EMA rate for folding a cycle's pattern summary into the score map.
    pub specialization_learning_rate: f64,
    /// Number of concurrently live candidates.
    pub candidate_slots: usize,
    /// Sealed buffers a candidate may hold before capture must pause.
    pub max_sealed_backlog: usize,
    /// How often throttled submissions are retried.
    pub submit_retry_interval_ms: u64,
    /// Spawn a fresh candidate into a slot freed by retirement.
    pub respawn_retired: bool,
    /// Period of the natural-selection pass; 0 disables it. Candidates
    /// younger than one period are never culled.
    pub selection_interval_secs: u64,
    /// Candidates below this fitness are culled by natural selection.
    pub min_survival_fitness: f64,
    /// Natural selection never shrinks the live population below this.
    pub min_population: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            byte_budget_per_candidate: 16 * 1024 * 1024,
            ready_threshold_fraction: 0.9,
            pool_cap_k: 5,
            max_concurrent_training_jobs: 2,
            max_queue_depth: 8,
            training_retry_limit: 3,
            retry_backoff_ms: 250,
            training_timeout_secs: 600,
            evaluation_timeout_secs: 60,
            exploration_rate_epsilon: 0.1,
            epsilon_decay: None,
            eviction_grace_period_secs: 300,
            feedback_prior_weight: 10.0,
            specialization_confidence_threshold: 0.6,
            specialization_min_cycles: 3,
            specialization_learning_rate: 0.3,
            candidate_slots: 15,
            max_sealed_backlog: 2,
            submit_retry_interval_ms: 200,
            respawn_retired: true,
            selection_interval_secs: 3600,
            min_survival_fitness: 0.3,
            min_population: 5,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a (possibly partial) TOML document over the defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults, overlaid by an optional file, overlaid by the environment, validated.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Override fields from `GERMLINE_<FIELD>` variables (upper-cased field names).
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Override fields from an arbitrary lookup; `apply_env_overrides` passes the process env.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }

        macro_rules! overlay {
            ($($field:ident => $var:literal),* $(,)?) => {
                $(
                    if let Some(value) = lookup($var) {
                        self.$field = parse($var, value)?;
                    }
                )*
            };
        }

        overlay! {
            byte_budget_per_candidate => "GERMLINE_BYTE_BUDGET_PER_CANDIDATE",
            ready_threshold_fraction => "GERMLINE_READY_THRESHOLD_FRACTION",
            pool_cap_k => "GERMLINE_POOL_CAP_K",
            max_concurrent_training_jobs => "GERMLINE_MAX_CONCURRENT_TRAINING_JOBS",
            max_queue_depth => "GERMLINE_MAX_QUEUE_DEPTH",
            training_retry_limit => "GERMLINE_TRAINING_RETRY_LIMIT",
            retry_backoff_ms => "GERMLINE_RETRY_BACKOFF_MS",
            training_timeout_secs => "GERMLINE_TRAINING_TIMEOUT_SECS",
            evaluation_timeout_secs => "GERMLINE_EVALUATION_TIMEOUT_SECS",
            exploration_rate_epsilon => "GERMLINE_EXPLORATION_RATE_EPSILON",
            eviction_grace_period_secs => "GERMLINE_EVICTION_GRACE_PERIOD_SECS",
            feedback_prior_weight => "GERMLINE_FEEDBACK_PRIOR_WEIGHT",
            specialization_confidence_threshold => "GERMLINE_SPECIALIZATION_CONFIDENCE_THRESHOLD",
            specialization_min_cycles => "GERMLINE_SPECIALIZATION_MIN_CYCLES",
            specialization_learning_rate => "GERMLINE_SPECIALIZATION_LEARNING_RATE",
            candidate_slots => "GERMLINE_CANDIDATE_SLOTS",
            max_sealed_backlog => "GERMLINE_MAX_SEALED_BACKLOG",
            submit_retry_interval_ms => "GERMLINE_SUBMIT_RETRY_INTERVAL_MS",
            respawn_retired => "GERMLINE_RESPAWN_RETIRED",
            selection_interval_secs => "GERMLINE_SELECTION_INTERVAL_SECS",
            min_survival_fitness => "GERMLINE_MIN_SURVIVAL_FITNESS",
            min_population => "GERMLINE_MIN_POPULATION",
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }
        fn unit(field: &'static str, v: f64) -> Result<(), ConfigError> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(invalid(field, format!("must be within [0, 1], got {v}")))
            }
        }

        if self.byte_budget_per_candidate == 0 {
            return Err(invalid("byte_budget_per_candidate", "must be positive"));
        }
        if !(self.ready_threshold_fraction > 0.0 && self.ready_threshold_fraction <= 1.0) {
            return Err(invalid(
                "ready_threshold_fraction",
                format!("must be within (0, 1], got {}", self.ready_threshold_fraction),
            ));
        }
        if self.pool_cap_k == 0 {
            return Err(invalid("pool_cap_k", "must be at least 1"));
        }
        if self.max_concurrent_training_jobs == 0 {
            return Err(invalid("max_concurrent_training_jobs", "must be at least 1"));
        }
        if self.training_retry_limit == 0 {
            return Err(invalid("training_retry_limit", "must be at least 1"));
        }
        if self.training_timeout_secs == 0 {
            return Err(invalid("training_timeout_secs", "must be positive"));
        }
        if self.evaluation_timeout_secs == 0 {
            return Err(invalid("evaluation_timeout_secs", "must be positive"));
        }
        unit("exploration_rate_epsilon", self.exploration_rate_epsilon)?;
        if let Some(decay) = &self.epsilon_decay {
            if decay.half_life_samples == 0 {
                return Err(invalid("epsilon_decay.half_life_samples", "must be positive"));
            }
            unit("epsilon_decay.floor", decay.floor)?;
        }
        if !(self.feedback_prior_weight >= 0.0 && self.feedback_prior_weight.is_finite()) {
            return Err(invalid("feedback_prior_weight", "must be a finite non-negative number"));
        }
        unit(
            "specialization_confidence_threshold",
            self.specialization_confidence_threshold,
        )?;
        unit("specialization_learning_rate", self.specialization_learning_rate)?;
        if self.candidate_slots == 0 {
            return Err(invalid("candidate_slots", "must be at least 1"));
        }
        if self.max_sealed_backlog == 0 {
            return Err(invalid("max_sealed_backlog", "must be at least 1"));
        }
        if self.submit_retry_interval_ms == 0 {
            return Err(invalid("submit_retry_interval_ms", "must be positive"));
        }
        if !(self.min_survival_fitness >= 0.0 && self.min_survival_fitness.is_finite()) {
            return Err(invalid("min_survival_fitness", "must be a finite non-negative number"));
        }
        Ok(())
    }

    /// Bytes at which a buffer seals: `ceil(fraction × budget)`, at least 1.
    pub fn ready_threshold_bytes(&self) -> u64 {
        let raw = (self.ready_threshold_fraction * self.byte_budget_per_candidate as f64).ceil();
        (raw as u64).clamp(1, self.byte_budget_per_candidate.max(1))
    }

    pub fn training_timeout(&self) -> Duration {
        Duration::from_secs(self.training_timeout_secs)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn eviction_grace_period(&self) -> Duration {
        Duration::from_secs(self.eviction_grace_period_secs)
    }

    pub fn submit_retry_interval(&self) -> Duration {
        Duration::from_millis(self.submit_retry_interval_ms)
    }

    /// `None` when periodic natural selection is disabled.
    pub fn selection_interval(&self) -> Option<Duration> {
        let secs = self.selection_interval_secs;
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}
