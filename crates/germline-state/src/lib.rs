//! Germline-State: storage layer for the germline orchestrator
//!
//! This crate provides the persistence layer for lifecycle records and
//! trained-artifact blobs. The orchestrator only ever talks to the traits;
//! which backend sits behind them is a deployment choice.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: atomic writes, content addressing, restart safety.
//!
//! ## Key Components
//!
//! - `CasStore` / `KvStore`: async storage contracts
//! - `MemoryCasStore` / `MemoryKvStore`: in-process backends (`fakes`)
//! - `FsCasStore` / `FsKvStore`: filesystem backends with atomic rename

mod error;
pub mod fakes;
pub mod fs;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::{MemoryCasStore, MemoryKvStore};
pub use fs::{FsCasStore, FsKvStore};
pub use storage_traits::{validate_key, CasStore, ContentDigest, KvStore, StorageResult};
