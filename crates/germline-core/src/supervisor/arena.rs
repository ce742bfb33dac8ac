//! Fixed-capacity candidate slots with generation-tagged reuse.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain::{
    Candidate, CandidateId, JobId, LifecycleError, ModelArtifact, Result, SealedBuffer,
};

/// Supervisor-side bookkeeping for one live candidate.
#[derive(Debug)]
pub(crate) struct CandidateRecord {
    pub candidate: Candidate,
    /// Sealed buffers waiting for scheduler admission, oldest first.
    pub pending: VecDeque<Arc<SealedBuffer>>,
    pub in_flight: Option<JobId>,
    /// The head of `pending` was refused admission and is being retried.
    pub throttled: bool,
    /// Latest evaluated artifact; the next job fine-tunes from it.
    pub parent: Option<Arc<ModelArtifact>>,
}

impl CandidateRecord {
    pub fn new(candidate: Candidate) -> Self {
        Self {
            candidate,
            pending: VecDeque::new(),
            in_flight: None,
            throttled: false,
            parent: None,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    /// Generation the next (or current) occupant carries.
    generation: u32,
    occupant: Option<CandidateRecord>,
}

/// Arena of `capacity` candidate slots.
///
/// Retiring a candidate bumps its slot's generation, so a stale
/// [`CandidateId`] never resolves to the slot's next occupant.
#[derive(Debug)]
pub(crate) struct CandidateArena {
    slots: Vec<Slot>,
    byte_budget: u64,
}

impl CandidateArena {
    pub fn new(capacity: usize, byte_budget: u64) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            byte_budget,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Place a fresh candidate in the first free slot.
    pub fn spawn(&mut self) -> Result<CandidateId> {
        let index = self
            .slots
            .iter()
            .position(|s| s.occupant.is_none())
            .ok_or(LifecycleError::SlotsExhausted(self.slots.len()))?;
        Ok(self.spawn_at(index))
    }

    fn spawn_at(&mut self, index: usize) -> CandidateId {
        let slot = &mut self.slots[index];
        let id = CandidateId::new(index as u32, slot.generation);
        slot.occupant = Some(CandidateRecord::new(Candidate::new(id, self.byte_budget)));
        id
    }

    /// Reinstate a persisted candidate in its recorded slot.
    pub fn restore(&mut self, record: CandidateRecord) -> Result<()> {
        let id = record.candidate.id;
        let capacity = self.slots.len();
        let slot = self.slots.get_mut(id.slot as usize).ok_or_else(|| {
            LifecycleError::InvalidConfig(format!(
                "persisted candidate {id} does not fit in {capacity} slots"
            ))
        })?;
        slot.generation = id.generation;
        slot.occupant = Some(record);
        Ok(())
    }

    /// Mark a persisted, already retired candidate's slot as free so its
    /// next occupant gets a newer generation.
    pub fn vacate(&mut self, id: CandidateId) {
        if let Some(slot) = self.slots.get_mut(id.slot as usize) {
            if slot.occupant.is_none() {
                slot.generation = slot.generation.max(id.generation.wrapping_add(1));
            }
        }
    }

    pub fn get(&self, id: CandidateId) -> Option<&CandidateRecord> {
        let slot = self.slots.get(id.slot as usize)?;
        slot.occupant
            .as_ref()
            .filter(|r| r.candidate.id.generation == id.generation)
    }

    pub fn get_mut(&mut self, id: CandidateId) -> Option<&mut CandidateRecord> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        slot.occupant
            .as_mut()
            .filter(|r| r.candidate.id.generation == id.generation)
    }

    /// Vacate the candidate's slot, returning its record.
    pub fn remove(&mut self, id: CandidateId) -> Option<CandidateRecord> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot
            .occupant
            .as_ref()
            .is_some_and(|r| r.candidate.id.generation == id.generation)
        {
            slot.generation = slot.generation.wrapping_add(1);
            slot.occupant.take()
        } else {
            None
        }
    }

    /// Spawn a fresh occupant into the slot `id` used to hold.
    pub fn respawn(&mut self, id: CandidateId) -> Option<CandidateId> {
        let index = id.slot as usize;
        let free = self.slots.get(index).is_some_and(|s| s.occupant.is_none());
        free.then(|| self.spawn_at(index))
    }

    pub fn records(&self) -> impl Iterator<Item = &CandidateRecord> {
        self.slots.iter().filter_map(|s| s.occupant.as_ref())
    }

    pub fn ids(&self) -> Vec<CandidateId> {
        self.records().map(|r| r.candidate.id).collect()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.occupant.is_none()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_fills_slots_then_exhausts() {
        let mut arena = CandidateArena::new(2, 100);
        assert_eq!(arena.spawn().unwrap(), CandidateId::new(0, 0));
        assert_eq!(arena.spawn().unwrap(), CandidateId::new(1, 0));
        assert!(matches!(arena.spawn(), Err(LifecycleError::SlotsExhausted(2))));
    }

    #[test]
    fn retired_slot_is_reused_with_new_generation() {
        let mut arena = CandidateArena::new(1, 100);
        let first = arena.spawn().unwrap();
        assert!(arena.remove(first).is_some());
        let second = arena.respawn(first).unwrap();

        assert_eq!(second, CandidateId::new(0, 1));
        assert!(arena.get(first).is_none(), "stale id must not resolve");
        assert!(arena.get(second).is_some());
        assert!(arena.remove(first).is_none());
    }

    #[test]
    fn restore_places_candidate_in_recorded_slot() {
        let mut arena = CandidateArena::new(4, 100);
        let id = CandidateId::new(2, 5);
        arena
            .restore(CandidateRecord::new(Candidate::new(id, 100)))
            .unwrap();
        assert!(arena.get(id).is_some());
        assert_eq!(arena.free_slots(), 3);
        assert_eq!(arena.spawn().unwrap(), CandidateId::new(0, 0));

        arena.vacate(CandidateId::new(1, 3));
        assert_eq!(arena.spawn().unwrap(), CandidateId::new(1, 4));

        let out_of_range = CandidateId::new(9, 0);
        assert!(arena
            .restore(CandidateRecord::new(Candidate::new(out_of_range, 100)))
            .is_err());
    }
}
