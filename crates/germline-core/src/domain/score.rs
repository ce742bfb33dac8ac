//! Running evaluation scores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::chunk::sanitize_unit;

/// Live feedback outcome for one routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Positive,
    Neutral,
    Negative,
}

impl FeedbackOutcome {
    pub fn value(self) -> f64 {
        match self {
            FeedbackOutcome::Positive => 1.0,
            FeedbackOutcome::Neutral => 0.5,
            FeedbackOutcome::Negative => 0.0,
        }
    }
}

impl std::str::FromStr for FeedbackOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "positive" | "+" => Ok(FeedbackOutcome::Positive),
            "neutral" | "0" => Ok(FeedbackOutcome::Neutral),
            "negative" | "-" => Ok(FeedbackOutcome::Negative),
            other => Err(format!("unknown feedback outcome: {other}")),
        }
    }
}

/// Running aggregate for one artifact: offline quality plus online feedback.
///
/// The online mean and variance are maintained with Welford's algorithm so
/// updates are O(1) and numerically stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationScore {
    /// Held-out quality in [0, 1].
    pub offline_quality: f64,
    pub feedback_count: u64,
    pub feedback_mean: f64,
    /// Sum of squared deviations from the running mean.
    feedback_m2: f64,
    pub updated_at: DateTime<Utc>,
}

impl EvaluationScore {
    pub fn new(offline_quality: f64) -> Self {
        Self {
            offline_quality: sanitize_unit(offline_quality),
            feedback_count: 0,
            feedback_mean: 0.0,
            feedback_m2: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn observe(&mut self, outcome: FeedbackOutcome) {
        let x = outcome.value();
        self.feedback_count += 1;
        let delta = x - self.feedback_mean;
        self.feedback_mean += delta / self.feedback_count as f64;
        self.feedback_m2 += delta * (x - self.feedback_mean);
        self.updated_at = Utc::now();
    }

    /// Sample variance of the feedback values; 0 below two samples.
    pub fn feedback_variance(&self) -> f64 {
        if self.feedback_count < 2 {
            0.0
        } else {
            self.feedback_m2 / (self.feedback_count - 1) as f64
        }
    }

    /// Weight given to the online mean: `n / (n + prior_weight)`.
    pub fn confidence(&self, prior_weight: f64) -> f64 {
        if self.feedback_count == 0 {
            return 0.0;
        }
        let n = self.feedback_count as f64;
        n / (n + prior_weight.max(0.0))
    }

    /// Confidence-weighted blend of offline quality and online mean.
    pub fn blended(&self, prior_weight: f64) -> f64 {
        let c = self.confidence(prior_weight);
        (1.0 - c) * self.offline_quality + c * self.feedback_mean
    }
}
