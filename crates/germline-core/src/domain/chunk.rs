//! Captured data chunks and sealed buffer snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use germline_state::ContentDigest;
use serde::{Deserialize, Serialize};

use crate::domain::ids::CandidateId;

/// Pattern hint attached by the capture collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSignal {
    /// Behavioural domain the chunk was classified into (e.g. "development").
    pub domain: String,

    /// Classifier confidence, clamped to [0, 1] when aggregated.
    pub confidence: f64,
}

/// Metadata travelling with a chunk. Opaque to the orchestrator apart from
/// the optional pattern signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Capture source label (e.g. "file_events").
    pub source: String,

    pub pattern: Option<PatternSignal>,
}

impl ChunkMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pattern: None,
        }
    }

    pub fn with_pattern(mut self, domain: impl Into<String>, confidence: f64) -> Self {
        self.pattern = Some(PatternSignal {
            domain: domain.into(),
            confidence,
        });
        self
    }
}

/// One bounded unit of captured content. Never split or truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChunk {
    pub payload: Vec<u8>,
    pub metadata: ChunkMetadata,
    pub arrived_at: DateTime<Utc>,
}

impl DataChunk {
    pub fn new(payload: impl Into<Vec<u8>>, metadata: ChunkMetadata) -> Self {
        Self {
            payload: payload.into(),
            metadata,
            arrived_at: Utc::now(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Aggregated pattern evidence over one sealed buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    /// Confidence-weighted byte share per domain; sums to 1 when any tagged
    /// chunk carried weight, empty otherwise.
    pub domain_shares: BTreeMap<String, f64>,
    pub tagged_chunks: u64,
    pub untagged_chunks: u64,
    /// Mean confidence over tagged chunks.
    pub mean_confidence: f64,
}

impl PatternSummary {
    pub fn from_chunks(chunks: &[DataChunk]) -> Self {
        let mut weights: BTreeMap<String, f64> = BTreeMap::new();
        let mut tagged = 0u64;
        let mut untagged = 0u64;
        let mut confidence_sum = 0.0;

        for chunk in chunks {
            match &chunk.metadata.pattern {
                Some(signal) => {
                    let confidence = sanitize_unit(signal.confidence);
                    tagged += 1;
                    confidence_sum += confidence;
                    *weights.entry(signal.domain.clone()).or_insert(0.0) +=
                        confidence * chunk.size_bytes() as f64;
                }
                None => untagged += 1,
            }
        }

        let total: f64 = weights.values().sum();
        let domain_shares = if total > 0.0 {
            weights
                .into_iter()
                .filter(|(_, w)| *w > 0.0)
                .map(|(d, w)| (d, w / total))
                .collect()
        } else {
            BTreeMap::new()
        };

        Self {
            domain_shares,
            tagged_chunks: tagged,
            untagged_chunks: untagged,
            mean_confidence: if tagged > 0 {
                confidence_sum / tagged as f64
            } else {
                0.0
            },
        }
    }

    /// Domain with the largest share; ties resolve to the lexically first.
    pub fn dominant(&self) -> Option<(&str, f64)> {
        self.domain_shares
            .iter()
            .fold(None, |best: Option<(&str, f64)>, (d, s)| match best {
                Some((_, bs)) if bs >= *s => best,
                _ => Some((d.as_str(), *s)),
            })
    }
}

/// Clamp to [0, 1], mapping NaN to 0.
pub(crate) fn sanitize_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Immutable snapshot of a candidate's buffer, handed to training.
///
/// Created once when the buffer crosses its ready threshold; consumed by
/// value when the training job is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedBuffer {
    pub candidate_id: CandidateId,
    /// 1-based seal counter for the candidate.
    pub cycle: u64,
    pub chunks: Vec<DataChunk>,
    pub total_bytes: u64,
    pub sealed_at: DateTime<Utc>,
    /// Content address over the chunk payloads, in arrival order.
    pub digest: ContentDigest,
    pub summary: PatternSummary,
}

impl SealedBuffer {
    pub fn seal(candidate_id: CandidateId, cycle: u64, chunks: Vec<DataChunk>) -> Self {
        let total_bytes = chunks.iter().map(DataChunk::size_bytes).sum();
        let digest = ContentDigest::from_parts(chunks.iter().map(|c| c.payload.as_slice()));
        let summary = PatternSummary::from_chunks(&chunks);
        Self {
            candidate_id,
            cycle,
            chunks,
            total_bytes,
            sealed_at: Utc::now(),
            digest,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(bytes: usize, domain: &str, confidence: f64) -> DataChunk {
        DataChunk::new(
            vec![0u8; bytes],
            ChunkMetadata::new("test").with_pattern(domain, confidence),
        )
    }

    #[test]
    fn summary_weights_by_bytes_and_confidence() {
        let chunks = vec![
            tagged(300, "development", 1.0),
            tagged(100, "web_browsing", 1.0),
            DataChunk::new(vec![0u8; 50], ChunkMetadata::new("raw")),
        ];
        let summary = PatternSummary::from_chunks(&chunks);

        assert_eq!(summary.tagged_chunks, 2);
        assert_eq!(summary.untagged_chunks, 1);
        assert!((summary.domain_shares["development"] - 0.75).abs() < 1e-9);
        assert!((summary.domain_shares["web_browsing"] - 0.25).abs() < 1e-9);
        assert_eq!(summary.dominant().unwrap().0, "development");
    }

    #[test]
    fn summary_without_signals_is_empty() {
        let chunks = vec![DataChunk::new(vec![1, 2, 3], ChunkMetadata::new("raw"))];
        let summary = PatternSummary::from_chunks(&chunks);
        assert!(summary.domain_shares.is_empty());
        assert!(summary.dominant().is_none());
        assert_eq!(summary.mean_confidence, 0.0);
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let chunks = vec![tagged(10, "a", 7.0), tagged(10, "b", f64::NAN)];
        let summary = PatternSummary::from_chunks(&chunks);
        assert_eq!(summary.domain_shares.len(), 1);
        assert!((summary.domain_shares["a"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn seal_digest_is_order_sensitive() {
        let id = CandidateId::new(0, 0);
        let a = DataChunk::new(b"first".to_vec(), ChunkMetadata::default());
        let b = DataChunk::new(b"second".to_vec(), ChunkMetadata::default());

        let ab = SealedBuffer::seal(id, 1, vec![a.clone(), b.clone()]);
        let ba = SealedBuffer::seal(id, 1, vec![b, a]);
        assert_ne!(ab.digest, ba.digest);
        assert_eq!(ab.total_bytes, 11);
    }
}
