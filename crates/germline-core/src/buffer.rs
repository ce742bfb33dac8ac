//! Per-candidate bounded capture buffers.
//!
//! `ingest` is synchronous and never waits on training: when a buffer
//! crosses its ready threshold it is swapped for an empty one under the same
//! lock, and the sealed snapshot is handed to the supervisor over a channel.

use std::collections::HashMap;

use germline_state::ContentDigest;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::OrchestratorConfig;
use crate::domain::{CandidateId, DataChunk, LifecycleError, Result, SealedBuffer};
use crate::metrics::METRICS;
use crate::obs;

/// Outcome of a successful `ingest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    NotReady {
        accumulated_bytes: u64,
    },
    /// The buffer was sealed; the snapshot has been sent to the sealed-buffer
    /// receiver and a fresh buffer is already accepting data.
    ReadyForTraining {
        cycle: u64,
        total_bytes: u64,
        digest: ContentDigest,
    },
}

impl ReadyState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadyState::ReadyForTraining { .. })
    }
}

#[derive(Debug, Default)]
struct CandidateBuffer {
    chunks: Vec<DataChunk>,
    bytes: u64,
    /// Seals performed so far.
    cycle: u64,
    /// Sealed buffers not yet consumed by a training submission.
    outstanding: usize,
}

/// Owns the live buffer of every registered candidate.
pub struct BufferManager {
    budget: u64,
    threshold: u64,
    max_backlog: usize,
    buffers: Mutex<HashMap<CandidateId, CandidateBuffer>>,
    sealed_tx: mpsc::UnboundedSender<SealedBuffer>,
}

impl BufferManager {
    /// Create a manager and the receiver on which sealed buffers arrive.
    pub fn new(
        budget: u64,
        threshold: u64,
        max_backlog: usize,
    ) -> (Self, mpsc::UnboundedReceiver<SealedBuffer>) {
        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();
        let manager = Self {
            budget,
            threshold: threshold.clamp(1, budget.max(1)),
            max_backlog: max_backlog.max(1),
            buffers: Mutex::new(HashMap::new()),
            sealed_tx,
        };
        (manager, sealed_rx)
    }

    pub fn from_config(
        config: &OrchestratorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SealedBuffer>) {
        Self::new(
            config.byte_budget_per_candidate,
            config.ready_threshold_bytes(),
            config.max_sealed_backlog,
        )
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Install an empty buffer for `id`. Re-registering keeps the seal counter
    /// at `starting_cycle` so digests and cycles stay monotonic across restarts.
    pub fn register(&self, id: CandidateId, starting_cycle: u64) {
        self.buffers.lock().insert(
            id,
            CandidateBuffer {
                cycle: starting_cycle,
                ..Default::default()
            },
        );
    }

    /// Drop the candidate's buffer, returning the unsealed bytes discarded.
    pub fn remove(&self, id: CandidateId) -> Option<u64> {
        self.buffers.lock().remove(&id).map(|b| b.bytes)
    }

    pub fn accumulated_bytes(&self, id: CandidateId) -> Option<u64> {
        self.buffers.lock().get(&id).map(|b| b.bytes)
    }

    pub fn outstanding(&self, id: CandidateId) -> Option<usize> {
        self.buffers.lock().get(&id).map(|b| b.outstanding)
    }

    /// Append `chunk` to the candidate's buffer, sealing it when the ready
    /// threshold is reached.
    ///
    /// Fails with `CapacityExceeded` when the chunk is larger than the whole
    /// budget and with `Backpressure` when sealing would exceed the
    /// candidate's sealed backlog. In both cases nothing is appended.
    pub fn ingest(&self, id: CandidateId, chunk: DataChunk) -> Result<ReadyState> {
        let size = chunk.size_bytes();
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .get_mut(&id)
            .ok_or(LifecycleError::CandidateNotFound(id))?;

        if size > self.budget {
            return Err(LifecycleError::CapacityExceeded {
                candidate: id,
                chunk_bytes: size,
                budget_bytes: self.budget,
            });
        }

        let would_seal = buffer.bytes + size >= self.threshold;
        if would_seal && buffer.outstanding >= self.max_backlog {
            return Err(LifecycleError::Backpressure {
                candidate: id,
                outstanding: buffer.outstanding,
            });
        }

        buffer.bytes += size;
        buffer.chunks.push(chunk);
        METRICS.inc_chunks_ingested();

        if !would_seal {
            return Ok(ReadyState::NotReady {
                accumulated_bytes: buffer.bytes,
            });
        }

        buffer.cycle += 1;
        buffer.outstanding += 1;
        buffer.bytes = 0;
        let chunks = std::mem::take(&mut buffer.chunks);
        let sealed = SealedBuffer::seal(id, buffer.cycle, chunks);
        drop(buffers);

        METRICS.inc_buffers_sealed();
        obs::emit_buffer_sealed(id, sealed.cycle, sealed.total_bytes, sealed.chunks.len());

        let ready = ReadyState::ReadyForTraining {
            cycle: sealed.cycle,
            total_bytes: sealed.total_bytes,
            digest: sealed.digest.clone(),
        };
        if self.sealed_tx.send(sealed).is_err() {
            tracing::debug!(candidate = %id, "sealed-buffer receiver dropped");
        }
        Ok(ready)
    }

    /// Mark one sealed buffer of `id` as consumed by training, freeing a
    /// backlog slot.
    pub fn release_sealed(&self, id: CandidateId) {
        if let Some(buffer) = self.buffers.lock().get_mut(&id) {
            buffer.outstanding = buffer.outstanding.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChunkMetadata;
    use proptest::prelude::*;

    fn chunk(bytes: usize) -> DataChunk {
        DataChunk::new(vec![7u8; bytes], ChunkMetadata::new("test"))
    }

    fn manager(
        budget: u64,
        fraction: f64,
        backlog: usize,
    ) -> (
        BufferManager,
        mpsc::UnboundedReceiver<SealedBuffer>,
        CandidateId,
    ) {
        let config = OrchestratorConfig {
            byte_budget_per_candidate: budget,
            ready_threshold_fraction: fraction,
            max_sealed_backlog: backlog,
            ..Default::default()
        };
        let (m, rx) = BufferManager::from_config(&config);
        let id = CandidateId::new(0, 0);
        m.register(id, 0);
        (m, rx, id)
    }

    #[test]
    fn seals_at_ninety_percent() {
        let (m, mut rx, id) = manager(1000, 0.9, 2);
        assert_eq!(
            m.ingest(id, chunk(500)).unwrap(),
            ReadyState::NotReady { accumulated_bytes: 500 }
        );
        assert!(!m.ingest(id, chunk(399)).unwrap().is_ready());
        assert!(m.ingest(id, chunk(1)).unwrap().is_ready());

        let sealed = rx.try_recv().unwrap();
        assert_eq!(sealed.total_bytes, 900);
        assert_eq!(sealed.chunks.len(), 3);
        assert_eq!(sealed.cycle, 1);
    }

    #[test]
    fn single_large_chunk_seals_immediately() {
        let (m, mut rx, id) = manager(1000, 0.9, 2);
        let state = m.ingest(id, chunk(950)).unwrap();
        assert!(matches!(
            state,
            ReadyState::ReadyForTraining { total_bytes: 950, cycle: 1, .. }
        ));
        assert_eq!(rx.try_recv().unwrap().total_bytes, 950);
        assert_eq!(m.accumulated_bytes(id), Some(0));
    }

    #[test]
    fn oversized_chunk_is_rejected_without_side_effects() {
        let (m, _rx, id) = manager(1000, 0.9, 2);
        m.ingest(id, chunk(100)).unwrap();
        let err = m.ingest(id, chunk(1001)).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::CapacityExceeded { chunk_bytes: 1001, budget_bytes: 1000, .. }
        ));
        assert_eq!(m.accumulated_bytes(id), Some(100));
    }

    #[test]
    fn ingest_continues_into_fresh_buffer_after_seal() {
        let (m, mut rx, id) = manager(1000, 0.9, 2);
        m.ingest(id, chunk(950)).unwrap();
        // The sealed buffer is not consumed; capture still proceeds.
        for _ in 0..4 {
            assert!(!m.ingest(id, chunk(100)).unwrap().is_ready());
        }
        assert_eq!(m.accumulated_bytes(id), Some(400));
        let sealed = rx.try_recv().unwrap();
        assert_eq!(sealed.total_bytes, 950);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn backlog_limit_applies_backpressure() {
        let (m, mut rx, id) = manager(100, 0.5, 1);
        assert!(m.ingest(id, chunk(60)).unwrap().is_ready());
        assert!(!m.ingest(id, chunk(10)).unwrap().is_ready());

        let err = m.ingest(id, chunk(60)).unwrap_err();
        assert!(matches!(err, LifecycleError::Backpressure { outstanding: 1, .. }));
        assert_eq!(m.accumulated_bytes(id), Some(10), "rejected chunk not appended");

        rx.try_recv().unwrap();
        m.release_sealed(id);
        assert!(m.ingest(id, chunk(60)).unwrap().is_ready());
        assert_eq!(rx.try_recv().unwrap().total_bytes, 70);
    }

    #[test]
    fn unknown_candidate_is_rejected() {
        let (m, _rx, _) = manager(100, 0.9, 1);
        let err = m.ingest(CandidateId::new(9, 0), chunk(1)).unwrap_err();
        assert!(matches!(err, LifecycleError::CandidateNotFound(_)));
    }

    #[test]
    fn zero_byte_chunks_never_seal() {
        let (m, _rx, id) = manager(100, 0.9, 1);
        for _ in 0..10 {
            assert!(!m.ingest(id, chunk(0)).unwrap().is_ready());
        }
    }

    proptest! {
        #[test]
        fn accumulated_never_exceeds_budget_by_more_than_one_chunk(
            sizes in proptest::collection::vec(0usize..1200, 1..200),
            fraction in 0.05f64..=1.0,
        ) {
            let budget = 1000u64;
            let (m, mut rx, id) = manager(budget, fraction, 1);
            for size in sizes {
                match m.ingest(id, chunk(size)) {
                    Ok(ReadyState::NotReady { accumulated_bytes }) => {
                        prop_assert!(accumulated_bytes < m.threshold());
                    }
                    Ok(ReadyState::ReadyForTraining { total_bytes, .. }) => {
                        prop_assert!(total_bytes <= budget + size as u64);
                        let sealed = rx.try_recv().unwrap();
                        prop_assert_eq!(sealed.total_bytes, total_bytes);
                        m.release_sealed(id);
                    }
                    Err(LifecycleError::CapacityExceeded { .. }) => {
                        prop_assert!(size as u64 > budget);
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {other}"),
                }
                prop_assert!(m.accumulated_bytes(id).unwrap() <= budget);
            }
        }
    }
}
