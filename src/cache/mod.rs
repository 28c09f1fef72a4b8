//! Client-side entity cache.
//!
//! This module provides the kind-agnostic pieces of the offline cache:
//! - Dirty-overlay entities with tiered serialization
//! - Per-kind max-heaps ranking entities by last write
//! - Three-way text merge for pushed changes
//! - A durable key-value store holding one compressed blob per kind

mod codec;
mod entity;
mod heap;
mod manager;
mod merge;
mod policy;
mod storage;
mod traits;

pub use entity::{Cacheable, ServerRecord, Tracked};
pub use heap::{HeapArena, PriorityIndex, RecordId};
pub use manager::{CacheManager, Callback, Hydrated, KindError, StorageRecord, Subscriptions};
pub use merge::merge;
pub use policy::PersistencePolicy;
pub use storage::{DurableStore, NoopStore, SqliteStore, StoredBlob};
pub use traits::{ClientId, EntityKind, Field, FieldValue, Record, Tier};
