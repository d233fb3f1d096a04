//! Single-flight fetch coordination.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::memory::EntityCache;
use super::traits::{CacheResult, Cacheable};

/// Remote fetch for one entity type.
///
/// `Ok(None)` means the backend confirmed the entity does not exist.
pub trait Fetcher<V>: Send + Sync {
  fn fetch(&self, key: &str) -> BoxFuture<'static, Result<Option<V>>>;
}

impl<V, F, Fut> Fetcher<V> for F
where
  F: Fn(String) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Option<V>>> + Send + 'static,
{
  fn fetch(&self, key: &str) -> BoxFuture<'static, Result<Option<V>>> {
    self(key.to_string()).boxed()
  }
}

/// A fetch failure, shared by every caller that awaited the same request.
#[derive(Clone)]
pub struct FetchError(Arc<Report>);

impl FetchError {
  pub fn new(report: Report) -> Self {
    Self(Arc::new(report))
  }
}

impl From<Report> for FetchError {
  fn from(report: Report) -> Self {
    Self::new(report)
  }
}

impl fmt::Debug for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.0, f)
  }
}

impl fmt::Display for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&*self.0, f)
  }
}

impl std::error::Error for FetchError {}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<Option<V>, FetchError>>>;

struct InFlight<V> {
  id: u64,
  future: SharedFetch<V>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ensures at most one network fetch per key is running at any time.
///
/// Fetches run as spawned tasks so they complete and populate the cache
/// even when every caller that was waiting on them has gone away.
pub struct FetchCoordinator<V: Cacheable> {
  cache: Arc<EntityCache<V>>,
  in_flight: Arc<Mutex<HashMap<String, InFlight<V>>>>,
  last_attempt: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
  min_refetch_interval: Duration,
  next_id: AtomicU64,
}

impl<V: Cacheable> FetchCoordinator<V> {
  pub fn new(cache: Arc<EntityCache<V>>, min_refetch_interval: Duration) -> Self {
    Self {
      cache,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      last_attempt: Arc::new(Mutex::new(HashMap::new())),
      min_refetch_interval,
      next_id: AtomicU64::new(0),
    }
  }

  /// Fetch `key` through `fetcher`, joining an in-flight request if there
  /// is one.
  ///
  /// Without `force`, a key that already has an in-memory value and was
  /// attempted within the minimum refetch interval is answered from memory.
  /// A forced fetch skips that check but still piggybacks on a request
  /// that is already running.
  pub async fn fetch(
    &self,
    key: &str,
    fetcher: &dyn Fetcher<V>,
    force: bool,
  ) -> Result<CacheResult<Option<V>>, FetchError> {
    if !force {
      if let Some(throttled) = self.throttled(key) {
        return Ok(throttled);
      }
    }

    let future = {
      let mut in_flight = lock(&self.in_flight);
      match in_flight.get(key) {
        Some(request) => {
          debug!(key, entity = V::entity_type(), "joining in-flight fetch");
          request.future.clone()
        }
        None => {
          let id = self.next_id.fetch_add(1, Ordering::Relaxed);
          let future = self.spawn(key, id, fetcher.fetch(key));
          in_flight.insert(
            key.to_string(),
            InFlight {
              id,
              future: future.clone(),
            },
          );
          future
        }
      }
    };

    future.await.map(CacheResult::from_network)
  }

  fn throttled(&self, key: &str) -> Option<CacheResult<Option<V>>> {
    let entry = self.cache.peek(key)?;
    let last = *lock(&self.last_attempt).get(key)?;
    if self.cache.now() - last >= self.min_refetch_interval {
      return None;
    }
    debug!(key, entity = V::entity_type(), "refetch suppressed by minimum interval");
    Some(CacheResult::throttled(entry.value, entry.cached_at))
  }

  fn spawn(
    &self,
    key: &str,
    id: u64,
    request: BoxFuture<'static, Result<Option<V>>>,
  ) -> SharedFetch<V> {
    let cache = Arc::clone(&self.cache);
    let in_flight = Arc::clone(&self.in_flight);
    let last_attempt = Arc::clone(&self.last_attempt);
    let token = cache.token(key);
    let key = key.to_string();

    let task = tokio::spawn(async move {
      info!(key = %key, entity = V::entity_type(), "fetching from network");
      let result = request.await.map_err(FetchError::from);

      lock(&last_attempt).insert(key.clone(), cache.now());
      match &result {
        Ok(value) => {
          cache.set_if_current(token, &key, value.clone());
        }
        Err(e) => warn!(key = %key, entity = V::entity_type(), error = %e, "fetch failed"),
      }

      // Deregister after the cache write so late arrivals see the new value
      let mut in_flight = lock(&in_flight);
      if in_flight.get(&key).is_some_and(|request| request.id == id) {
        in_flight.remove(&key);
      }
      result
    });

    async move {
      task
        .await
        .unwrap_or_else(|e| Err(FetchError::new(eyre!("Fetch task failed: {}", e))))
    }
    .boxed()
    .shared()
  }

  /// Whether a fetch for `key` is currently running.
  pub fn is_in_flight(&self, key: &str) -> bool {
    lock(&self.in_flight).contains_key(key)
  }

  pub fn in_flight_count(&self) -> usize {
    lock(&self.in_flight).len()
  }

  /// Forget attempt history for one key or all keys, so the next fetch is
  /// not throttled.
  pub fn forget(&self, key: Option<&str>) {
    let mut last_attempt = lock(&self.last_attempt);
    match key {
      Some(key) => {
        last_attempt.remove(key);
      }
      None => last_attempt.clear(),
    }
  }

  /// Drop every registration. Running tasks still finish, but their
  /// results can no longer be joined.
  pub fn reset(&self) {
    lock(&self.in_flight).clear();
    self.forget(None);
  }
}
