//! Generic caching layer for remotely fetched entities.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Keeps the last known value per key in memory with a TTL
//! - Mirrors entries into durable storage so a restart can skip the network
//! - Runs at most one fetch per key at a time (single-flight)
//! - Throttles unforced refetches of recently fetched keys
//! - Invalidates on explicit refresh, realtime pushes and identity changes

mod clock;
mod coordinator;
mod invalidator;
mod layer;
mod memory;
mod storage;
mod traits;

pub use clock::{is_fresh, Clock, ManualClock, SystemClock};
pub use coordinator::{FetchCoordinator, FetchError, Fetcher};
pub use invalidator::Invalidator;
pub use layer::{CacheLayer, LayerOptions};
pub use memory::{CacheEntry, CacheEvent, EntityCache, WriteToken};
pub use storage::{
  inspect_slots, remove_slots, DurableStore, MemoryStore, NoopStore, PersistedEntry,
  PersistenceMirror, SlotSummary, SqliteStore, RECORD_VERSION,
};
pub use traits::{CacheResult, CacheSource, Cacheable};
