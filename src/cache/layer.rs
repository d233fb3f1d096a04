//! Cache layer that orchestrates caching logic with network fetching.

use chrono::Duration;
use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::clock::{is_fresh, Clock, SystemClock};
use super::coordinator::{FetchCoordinator, FetchError, Fetcher};
use super::memory::{CacheEntry, CacheEvent, EntityCache};
use super::storage::{DurableStore, NoopStore, PersistenceMirror};
use super::traits::{CacheResult, Cacheable};
use crate::identity::Identity;

/// Construction options for a [`CacheLayer`].
#[derive(Clone)]
pub struct LayerOptions {
  /// How long before cached data is considered stale
  pub ttl: Duration,
  /// Unforced fetches of a key attempted more recently than this are
  /// answered from memory
  pub min_refetch_interval: Duration,
  /// Namespace prefix for durable slots
  pub prefix: String,
  pub store: Arc<dyn DurableStore>,
  pub clock: Arc<dyn Clock>,
}

impl Default for LayerOptions {
  fn default() -> Self {
    Self {
      ttl: Duration::minutes(5),
      min_refetch_interval: Duration::seconds(60),
      prefix: "studio:".to_string(),
      store: Arc::new(NoopStore),
      clock: Arc::new(SystemClock),
    }
  }
}

impl LayerOptions {
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_min_refetch_interval(mut self, interval: Duration) -> Self {
    self.min_refetch_interval = interval;
    self
  }

  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
    self.store = store;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }
}

/// Cache layer for one entity type.
///
/// Reads go memory, then the durable mirror, then the network through the
/// single-flight coordinator. One instance is meant to be shared (behind an
/// `Arc`) by every consumer of that entity type.
pub struct CacheLayer<V: Cacheable> {
  cache: Arc<EntityCache<V>>,
  coordinator: FetchCoordinator<V>,
  fetcher: Arc<dyn Fetcher<V>>,
  ttl: Duration,
}

impl<V: Cacheable> CacheLayer<V> {
  pub fn new(fetcher: impl Fetcher<V> + 'static, options: LayerOptions) -> Self {
    let mirror = PersistenceMirror::new(options.store, &options.prefix, options.clock.clone());
    let cache = Arc::new(EntityCache::new(mirror, options.clock));
    let coordinator = FetchCoordinator::new(cache.clone(), options.min_refetch_interval);
    Self {
      cache,
      coordinator,
      fetcher: Arc::new(fetcher),
      ttl: options.ttl,
    }
  }

  /// Prepare the durable mirror, dropping records that can never be served.
  pub fn init(&self) {
    let pruned = self.cache.mirror().prune(self.ttl);
    debug!(entity = V::entity_type(), pruned, "cache layer initialized");
  }

  /// Release in-memory state. Persisted records are kept for the next run.
  pub fn dispose(&self) {
    self.coordinator.reset();
    self.cache.evict_memory();
    debug!(entity = V::entity_type(), "cache layer disposed");
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  pub fn cache(&self) -> &EntityCache<V> {
    &self.cache
  }

  pub fn coordinator(&self) -> &FetchCoordinator<V> {
    &self.coordinator
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.cache.subscribe()
  }

  /// Active identity; entries stored under any other identity are invisible.
  pub fn identity(&self) -> Option<Identity> {
    self.cache.scope()
  }

  /// Move to another identity, discarding everything it does not own.
  /// Fetches started for the previous identity can no longer be joined.
  pub fn switch_identity(&self, next: Option<Identity>) {
    self.cache.rescope(next);
    self.coordinator.reset();
  }

  /// Fresh cached value without touching the network.
  pub fn get(&self, key: &str) -> Option<CacheResult<Option<V>>> {
    if let Some(entry) = self.cache.peek(key) {
      if self.is_fresh(&entry) {
        return Some(CacheResult::from_memory(entry.value, entry.cached_at));
      }
    }

    let entry = self.cache.hydrate(key, self.ttl)?;
    debug!(key, entity = V::entity_type(), "hydrated from durable mirror");
    Some(CacheResult::from_persisted(entry.value, entry.cached_at))
  }

  /// Last known entry, however old.
  pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
    self.cache.peek(key)
  }

  pub fn is_fresh(&self, entry: &CacheEntry<V>) -> bool {
    is_fresh(entry.cached_at, self.cache.now(), self.ttl)
  }

  /// Cache-first read: fresh cache, else a (deduplicated) network fetch.
  pub async fn fetch(&self, key: &str) -> Result<CacheResult<Option<V>>, FetchError> {
    if let Some(cached) = self.get(key) {
      return Ok(cached);
    }
    self.coordinator.fetch(key, &*self.fetcher, false).await
  }

  /// Fetch from the network regardless of TTL and the refetch throttle.
  /// Joins a fetch that is already running instead of starting another.
  pub async fn refresh(&self, key: &str) -> Result<CacheResult<Option<V>>, FetchError> {
    info!(key, entity = V::entity_type(), "explicit refresh");
    self.coordinator.fetch(key, &*self.fetcher, true).await
  }

  /// Store a value directly, e.g. from a realtime push.
  pub fn set(&self, key: &str, value: Option<V>) {
    self.cache.set(key, value);
  }

  /// Remove one key (or all keys) from memory and disk without refetching.
  pub fn clear(&self, key: Option<&str>) {
    self.cache.clear(key);
    self.coordinator.forget(key);
  }

  /// Apply `tentative` right away, then run `write`.
  ///
  /// If the write fails, the authoritative value is fetched and replaces the
  /// tentative one; if that fetch fails too, the previous entry is put back.
  /// The write error is returned either way.
  pub async fn update_optimistic<F>(&self, key: &str, tentative: V, write: F) -> Result<()>
  where
    F: Future<Output = Result<()>>,
  {
    let previous = self.cache.peek(key);
    self.cache.set(key, Some(tentative));

    let err = match write.await {
      Ok(()) => return Ok(()),
      Err(e) => e,
    };
    warn!(key, entity = V::entity_type(), error = %err, "optimistic write failed, rolling back");

    match self.refresh(key).await {
      // A refresh that joined an older in-flight fetch won't have written
      // over the tentative value, so store the result explicitly.
      Ok(result) => self.cache.set(key, result.data),
      Err(refetch_err) => {
        warn!(key, error = %refetch_err, "rollback refetch failed, restoring previous value");
        match previous {
          Some(entry) => self.cache.restore(entry),
          None => self.cache.clear(Some(key)),
        }
      }
    }

    Err(err)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::storage::MemoryStore;
  use crate::cache::traits::CacheSource;
  use color_eyre::eyre::eyre;
  use futures::future::{BoxFuture, FutureExt};
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Org {
    name: String,
  }

  impl Cacheable for Org {
    fn entity_type() -> &'static str {
      "org"
    }
  }

  fn org(name: &str) -> Org {
    Org {
      name: name.to_string(),
    }
  }

  /// Fetcher that counts calls and can be switched into failure mode.
  #[derive(Clone, Default)]
  struct Backend {
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
  }

  impl Backend {
    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self, failing: bool) {
      self.failing.store(failing, Ordering::SeqCst);
    }
  }

  impl Fetcher<Org> for Backend {
    fn fetch(&self, key: &str) -> BoxFuture<'static, Result<Option<Org>>> {
      let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      let failing = self.failing.load(Ordering::SeqCst);
      let key = key.to_string();
      async move {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        if failing {
          Err(eyre!("backend unavailable"))
        } else {
          Ok(Some(org(&format!("{} v{}", key, n))))
        }
      }
      .boxed()
    }
  }

  fn layer(backend: Backend, store: Arc<dyn DurableStore>, clock: Arc<ManualClock>) -> CacheLayer<Org> {
    CacheLayer::new(
      backend,
      LayerOptions::default()
        .with_ttl(Duration::seconds(60))
        .with_store(store)
        .with_clock(clock),
    )
  }

  #[tokio::test]
  async fn test_fetch_is_cache_first() {
    let backend = Backend::default();
    let clock = Arc::new(ManualClock::default());
    let layer = layer(backend.clone(), Arc::new(MemoryStore::new()), clock.clone());

    let first = layer.fetch("org-1").await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    clock.advance(Duration::seconds(10));
    let second = layer.fetch("org-1").await.unwrap();
    assert_eq!(second.source, CacheSource::Memory);
    assert_eq!(second.data, first.data);
    assert_eq!(backend.calls(), 1);
  }

  #[tokio::test]
  async fn test_reload_is_served_from_mirror() {
    let backend = Backend::default();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());

    layer(backend.clone(), store.clone(), clock.clone())
      .fetch("org-1")
      .await
      .unwrap();

    clock.advance(Duration::seconds(20));
    let reloaded = layer(backend.clone(), store, clock);
    let result = reloaded.fetch("org-1").await.unwrap();

    assert_eq!(result.source, CacheSource::Persisted);
    assert_eq!(result.data, Some(org("org-1 v1")));
    assert_eq!(backend.calls(), 1);
  }

  #[tokio::test]
  async fn test_refresh_bypasses_throttle() {
    let backend = Backend::default();
    let layer = layer(
      backend.clone(),
      Arc::new(MemoryStore::new()),
      Arc::new(ManualClock::default()),
    );

    layer.fetch("org-1").await.unwrap();
    let refreshed = layer.refresh("org-1").await.unwrap();

    assert_eq!(refreshed.source, CacheSource::Network);
    assert_eq!(refreshed.data, Some(org("org-1 v2")));
    assert_eq!(backend.calls(), 2);
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_make_one_call() {
    let backend = Backend::default();
    let layer = layer(
      backend.clone(),
      Arc::new(MemoryStore::new()),
      Arc::new(ManualClock::default()),
    );

    let (a, b) = tokio::join!(layer.refresh("org-1"), layer.refresh("org-1"));
    assert_eq!(a.unwrap().data, b.unwrap().data);
    assert_eq!(backend.calls(), 1);
  }

  #[tokio::test]
  async fn test_clear_does_not_refetch() {
    let backend = Backend::default();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let layer = layer(backend.clone(), store, Arc::new(ManualClock::default()));

    layer.fetch("org-1").await.unwrap();
    layer.clear(Some("org-1"));

    assert!(layer.get("org-1").is_none());
    assert!(layer.cache().mirror().keys().is_empty());
    assert_eq!(backend.calls(), 1);
  }

  #[tokio::test]
  async fn test_optimistic_update_kept_on_success() {
    let backend = Backend::default();
    let layer = layer(
      backend.clone(),
      Arc::new(MemoryStore::new()),
      Arc::new(ManualClock::default()),
    );
    layer.fetch("org-1").await.unwrap();

    layer
      .update_optimistic("org-1", org("Renamed"), async { Ok(()) })
      .await
      .unwrap();

    assert_eq!(layer.get("org-1").unwrap().data, Some(org("Renamed")));
    assert_eq!(backend.calls(), 1);
  }

  #[tokio::test]
  async fn test_optimistic_update_replaced_by_authoritative_value_on_failure() {
    let backend = Backend::default();
    let layer = layer(
      backend.clone(),
      Arc::new(MemoryStore::new()),
      Arc::new(ManualClock::default()),
    );
    layer.fetch("org-1").await.unwrap();

    let result = layer
      .update_optimistic("org-1", org("Renamed"), async { Err(eyre!("write rejected")) })
      .await;

    assert!(result.is_err());
    assert_eq!(layer.get("org-1").unwrap().data, Some(org("org-1 v2")));
  }

  #[tokio::test]
  async fn test_optimistic_update_restores_previous_when_refetch_fails() {
    let backend = Backend::default();
    let layer = layer(
      backend.clone(),
      Arc::new(MemoryStore::new()),
      Arc::new(ManualClock::default()),
    );
    layer.fetch("org-1").await.unwrap();
    backend.fail(true);

    let result = layer
      .update_optimistic("org-1", org("Renamed"), async { Err(eyre!("write rejected")) })
      .await;

    assert!(result.is_err());
    assert_eq!(layer.peek("org-1").unwrap().value, Some(org("org-1 v1")));
  }

  #[tokio::test]
  async fn test_optimistic_update_without_prior_value_is_removed() {
    let backend = Backend::default();
    backend.fail(true);
    let layer = layer(
      backend.clone(),
      Arc::new(MemoryStore::new()),
      Arc::new(ManualClock::default()),
    );

    let _ = layer
      .update_optimistic("org-1", org("Renamed"), async { Err(eyre!("write rejected")) })
      .await;

    assert!(layer.peek("org-1").is_none());
  }

  #[tokio::test]
  async fn test_identity_switch_starts_a_new_fetch() {
    let backend = Backend::default();
    let layer = Arc::new(layer(
      backend.clone(),
      Arc::new(MemoryStore::new()),
      Arc::new(ManualClock::default()),
    ));
    layer.switch_identity(Some(Identity::from("user-a")));

    let pending = tokio::spawn({
      let layer = layer.clone();
      async move { layer.fetch("org-1").await }
    });
    tokio::task::yield_now().await;
    assert!(layer.coordinator().is_in_flight("org-1"));

    layer.switch_identity(Some(Identity::from("user-b")));
    assert!(!layer.coordinator().is_in_flight("org-1"));

    let result = layer.fetch("org-1").await.unwrap();
    assert_eq!(result.data, Some(org("org-1 v2")));
    assert_eq!(backend.calls(), 2);

    // The first identity's result never lands in the second one's cache
    let _ = pending.await;
    let entry = layer.peek("org-1").unwrap();
    assert_eq!(entry.value, Some(org("org-1 v2")));
    assert_eq!(entry.owner, Some(Identity::from("user-b")));
  }

  #[tokio::test]
  async fn test_init_prunes_and_dispose_keeps_mirror() {
    let backend = Backend::default();
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let layer = layer(backend.clone(), store.clone(), clock.clone());

    layer.fetch("org-1").await.unwrap();
    layer.dispose();
    assert!(layer.cache().is_empty());
    assert_eq!(layer.cache().mirror().keys(), vec!["org-1".to_string()]);

    clock.advance(Duration::seconds(120));
    layer.init();
    assert!(layer.cache().mirror().keys().is_empty());
  }
}
