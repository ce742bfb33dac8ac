//! Durable lifecycle state on top of a [`KvStore`].
//!
//! Layout (JSON values):
//! - `candidates/<slot>`: latest [`Candidate`] record per arena slot
//! - `registry/snapshot`: [`RegistrySnapshot`]
//! - `descriptors/<descriptor id>`: emitted [`AgentDescriptor`]s

use std::sync::Arc;

use germline_state::KvStore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{AgentDescriptor, Candidate, Result};
use crate::registry::RegistrySnapshot;

const CANDIDATES: &str = "candidates/";
const REGISTRY: &str = "registry/snapshot";
const DESCRIPTORS: &str = "descriptors/";

#[derive(Clone)]
pub struct LifecycleStore {
    kv: Arc<dyn KvStore>,
}

impl LifecycleStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn candidate_key(slot: u32) -> String {
        format!("{CANDIDATES}{slot:06}")
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.kv.put(key, &bytes).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for key in self.kv.list(prefix).await? {
            if let Some(value) = self.get_json(&key).await? {
                values.push(value);
            }
        }
        Ok(values)
    }

    pub async fn save_candidate(&self, candidate: &Candidate) -> Result<()> {
        self.put_json(&Self::candidate_key(candidate.id.slot), candidate)
            .await
    }

    /// Candidates in slot order.
    pub async fn load_candidates(&self) -> Result<Vec<Candidate>> {
        self.list_json(CANDIDATES).await
    }

    pub async fn save_registry(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        self.put_json(REGISTRY, snapshot).await
    }

    pub async fn load_registry(&self) -> Result<Option<RegistrySnapshot>> {
        self.get_json(REGISTRY).await
    }

    pub async fn save_descriptor(&self, descriptor: &AgentDescriptor) -> Result<()> {
        let key = format!("{DESCRIPTORS}{}", descriptor.descriptor_id);
        self.put_json(&key, descriptor).await
    }

    /// Descriptors, oldest first.
    pub async fn load_descriptors(&self) -> Result<Vec<AgentDescriptor>> {
        let mut descriptors: Vec<AgentDescriptor> = self.list_json(DESCRIPTORS).await?;
        descriptors.sort_by_key(|d| d.created_at);
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateId, LifecycleState};
    use germline_state::{FsKvStore, MemoryKvStore};

    #[tokio::test]
    async fn candidates_round_trip_in_slot_order() {
        let store = LifecycleStore::new(Arc::new(MemoryKvStore::new()));
        for slot in [11, 2, 7] {
            let mut c = Candidate::new(CandidateId::new(slot, 1), 1000);
            c.transition(LifecycleState::Buffering).unwrap();
            store.save_candidate(&c).await.unwrap();
        }
        let loaded = store.load_candidates().await.unwrap();
        let slots: Vec<u32> = loaded.iter().map(|c| c.id.slot).collect();
        assert_eq!(slots, vec![2, 7, 11]);
        assert!(loaded.iter().all(|c| c.state == LifecycleState::Buffering));
    }

    #[tokio::test]
    async fn later_save_replaces_slot() {
        let store = LifecycleStore::new(Arc::new(MemoryKvStore::new()));
        store
            .save_candidate(&Candidate::new(CandidateId::new(3, 0), 10))
            .await
            .unwrap();
        store
            .save_candidate(&Candidate::new(CandidateId::new(3, 1), 10))
            .await
            .unwrap();
        let loaded = store.load_candidates().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id.generation, 1);
    }

    #[tokio::test]
    async fn registry_snapshot_survives_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::new(Arc::new(FsKvStore::new(dir.path()).unwrap()));
        assert!(store.load_registry().await.unwrap().is_none());

        let snapshot = RegistrySnapshot {
            entries: Vec::new(),
            next_entry_id: 42,
        };
        store.save_registry(&snapshot).await.unwrap();

        let reopened = LifecycleStore::new(Arc::new(FsKvStore::new(dir.path()).unwrap()));
        assert_eq!(reopened.load_registry().await.unwrap(), Some(snapshot));
    }
}
