//! Specialization analysis: matured candidate → agent specialization.
//!
//! The supervisor only depends on [`SpecializationAnalyzer`]; the
//! [`HeuristicAnalyzer`] is a table-driven default.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AutonomyLevel, BehaviorProfile, Candidate, CandidateId, LifecycleError, Result, Specialization,
};

/// Evidence handed to an analyzer when a candidate matures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecializationSummary {
    pub candidate_id: CandidateId,
    /// Domain → running affinity score.
    pub scores: BTreeMap<String, f64>,
    pub cycles_completed: u32,
    /// Pattern-tagged chunks seen across all evaluated cycles.
    pub patterns_detected: u64,
    /// Offline quality of the artifact backing the specialization.
    pub offline_quality: f64,
}

impl SpecializationSummary {
    pub fn from_candidate(candidate: &Candidate, offline_quality: f64) -> Self {
        Self {
            candidate_id: candidate.id,
            scores: candidate.specialization.clone(),
            cycles_completed: candidate.cycles_completed,
            patterns_detected: candidate.patterns_detected,
            offline_quality,
        }
    }

    /// Strongest positive domain; ties resolve to the lexically first.
    pub fn dominant(&self) -> Option<(&str, f64)> {
        self.scores
            .iter()
            .filter(|(_, s)| **s > 0.0)
            .fold(None, |best: Option<(&str, f64)>, (d, s)| match best {
                Some((_, bs)) if bs >= *s => best,
                _ => Some((d.as_str(), *s)),
            })
    }
}

/// Converts a matured candidate's summary into a specialization.
#[async_trait]
pub trait SpecializationAnalyzer: Send + Sync {
    /// Fails with `SpecializationFailure`; the candidate then keeps learning.
    async fn analyze(&self, summary: &SpecializationSummary) -> Result<Specialization>;
}

const BASE_CAPABILITIES: [&str; 3] = ["pattern_recognition", "user_communication", "learning"];

const TRAITS: [&str; 8] = [
    "adaptability",
    "creativity",
    "curiosity",
    "friendliness",
    "patience",
    "precision",
    "proactiveness",
    "thoroughness",
];

fn domain_capabilities(domain: &str) -> &'static [&'static str] {
    match domain {
        "file_operations" => &["file_operations", "folder_organization", "duplicate_detection"],
        "development" => &["code_analysis", "git_operations", "project_management"],
        "communication" => &["email_management", "calendar_integration", "contact_management"],
        "web_browsing" => &["web_search", "information_extraction", "bookmark_management"],
        "creative_work" => &["media_management", "design_assistance", "asset_organization"],
        "app_launches" => &["app_launching", "workflow_automation", "shortcut_creation"],
        "temporal_patterns" => &["routine_analysis", "time_management", "reminder_system"],
        _ => &["performance_monitoring", "cleanup_operations", "security_checks"],
    }
}

fn domain_trait_boosts(domain: &str) -> &'static [(&'static str, f64)] {
    match domain {
        "development" => &[("precision", 0.2), ("thoroughness", 0.2), ("patience", 0.1)],
        "creative_work" => &[("creativity", 0.3), ("curiosity", 0.2), ("friendliness", 0.1)],
        "communication" => &[("friendliness", 0.3), ("proactiveness", 0.2), ("adaptability", 0.1)],
        "file_operations" => &[("thoroughness", 0.3), ("precision", 0.2), ("patience", 0.2)],
        "web_browsing" => &[("curiosity", 0.3), ("adaptability", 0.2), ("thoroughness", 0.1)],
        "temporal_patterns" => &[("patience", 0.3), ("thoroughness", 0.2), ("proactiveness", 0.2)],
        _ => &[],
    }
}

/// Table-driven analyzer.
///
/// Capabilities are a fixed base set plus the dominant domain's set, with
/// `proactive_suggestions` above 50 detected patterns and
/// `advanced_prediction` above 100. Traits start at 0.5 and are boosted by
/// pattern volume, offline quality, breadth of interests and domain.
#[derive(Debug, Clone, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn traits(summary: &SpecializationSummary, domain: &str) -> BTreeMap<String, f64> {
        let mut traits: BTreeMap<String, f64> =
            TRAITS.iter().map(|t| (t.to_string(), 0.5)).collect();
        let mut boost = |name: &str, by: f64, cap: f64| {
            if let Some(v) = traits.get_mut(name) {
                *v = (*v + by).min(cap);
            }
        };

        if summary.patterns_detected > 50 {
            boost("curiosity", 0.3, 0.9);
            boost("thoroughness", 0.2, 0.9);
        }
        if summary.offline_quality > 0.7 {
            boost("adaptability", 0.3, 0.9);
            boost("precision", 0.3, 0.9);
        }
        let interests = summary.scores.values().filter(|s| **s > 0.2).count();
        if interests > 3 {
            boost("adaptability", 0.2, 0.9);
            boost("creativity", 0.2, 0.9);
        }
        for (name, by) in domain_trait_boosts(domain) {
            boost(name, *by, 0.95);
        }
        traits
    }

    fn autonomy(traits: &BTreeMap<String, f64>, patterns: u64) -> AutonomyLevel {
        let trait_of = |name: &str| traits.get(name).copied().unwrap_or(0.5);
        let mut score = (trait_of("proactiveness") + trait_of("precision")) / 2.0;
        if patterns > 100 {
            score += 0.2;
        } else if patterns < 20 {
            score -= 0.2;
        }
        if score > 0.7 {
            AutonomyLevel::High
        } else if score > 0.4 {
            AutonomyLevel::Medium
        } else {
            AutonomyLevel::Low
        }
    }

    fn confidence_threshold(traits: &BTreeMap<String, f64>) -> f64 {
        let precision = traits.get("precision").copied().unwrap_or(0.5);
        let patience = traits.get("patience").copied().unwrap_or(0.5);
        (0.3 + precision * 0.4 + patience * 0.2).clamp(0.1, 0.9)
    }
}

#[async_trait]
impl SpecializationAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, summary: &SpecializationSummary) -> Result<Specialization> {
        let (domain, _) = summary.dominant().ok_or_else(|| {
            LifecycleError::SpecializationFailure(format!(
                "candidate {} has no dominant domain",
                summary.candidate_id
            ))
        })?;

        let mut capabilities: BTreeSet<String> =
            BASE_CAPABILITIES.iter().map(|c| c.to_string()).collect();
        capabilities.extend(domain_capabilities(domain).iter().map(|c| c.to_string()));
        if summary.patterns_detected > 100 {
            capabilities.insert("advanced_prediction".to_string());
        }
        if summary.patterns_detected > 50 {
            capabilities.insert("proactive_suggestions".to_string());
        }

        let traits = Self::traits(summary, domain);
        let autonomy = Self::autonomy(&traits, summary.patterns_detected);
        let confidence_threshold = Self::confidence_threshold(&traits);

        Ok(Specialization {
            domain: domain.to_string(),
            profile: BehaviorProfile {
                traits,
                confidence_threshold,
            },
            capabilities,
            autonomy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(scores: &[(&str, f64)], patterns: u64, quality: f64) -> SpecializationSummary {
        SpecializationSummary {
            candidate_id: CandidateId::new(0, 0),
            scores: scores.iter().map(|(d, s)| (d.to_string(), *s)).collect(),
            cycles_completed: 3,
            patterns_detected: patterns,
            offline_quality: quality,
        }
    }

    #[tokio::test]
    async fn development_specialist_with_strong_evidence() {
        let specialization = HeuristicAnalyzer::new()
            .analyze(&summary(&[("development", 0.8), ("web_browsing", 0.1)], 150, 0.9))
            .await
            .unwrap();

        assert_eq!(specialization.domain, "development");
        for cap in ["pattern_recognition", "code_analysis", "git_operations"] {
            assert!(specialization.capabilities.contains(cap), "missing {cap}");
        }
        assert!(specialization.capabilities.contains("advanced_prediction"));
        assert!(specialization.capabilities.contains("proactive_suggestions"));
        // precision 0.5 + 0.3 (cap 0.9) + 0.2 (cap 0.95) = 0.95
        assert!((specialization.profile.traits["precision"] - 0.95).abs() < 1e-12);
        // (0.5 + 0.95) / 2 + 0.2 = 0.925
        assert_eq!(specialization.autonomy, AutonomyLevel::High);
        // 0.3 + 0.95 * 0.4 + 0.6 * 0.2 = 0.8
        assert!((specialization.profile.confidence_threshold - 0.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn weak_evidence_yields_low_autonomy() {
        let specialization = HeuristicAnalyzer::new()
            .analyze(&summary(&[("mystery", 0.7)], 5, 0.3))
            .await
            .unwrap();
        assert!(specialization.capabilities.contains("performance_monitoring"));
        assert!(!specialization.capabilities.contains("proactive_suggestions"));
        // (0.5 + 0.5) / 2 - 0.2 = 0.3
        assert_eq!(specialization.autonomy, AutonomyLevel::Low);
    }

    #[tokio::test]
    async fn moderate_evidence_is_medium_autonomy() {
        let specialization = HeuristicAnalyzer::new()
            .analyze(&summary(&[("communication", 0.7)], 60, 0.5))
            .await
            .unwrap();
        assert!(specialization.capabilities.contains("proactive_suggestions"));
        assert!(!specialization.capabilities.contains("advanced_prediction"));
        // (0.7 + 0.5) / 2 = 0.6
        assert_eq!(specialization.autonomy, AutonomyLevel::Medium);
    }

    #[tokio::test]
    async fn no_dominant_domain_fails() {
        let err = HeuristicAnalyzer::new()
            .analyze(&summary(&[], 0, 0.9))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::SpecializationFailure(_)));
    }
}
