//! View-facing query over a shared cache layer.
//!
//! Inspired by TanStack Query, an `EntityQuery<V>` is what a screen holds on
//! to: it is bound to one key (an organization id, a user id), exposes the
//! current value, a loading flag and the last error, and serves cached data
//! immediately while revalidating stale data in the background.
//!
//! # Example
//!
//! ```ignore
//! let mut query = EntityQuery::new(layer.clone());
//! query.bind(Some(org_id.to_string()));
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.phase() {
//!     QueryPhase::Loading => render_spinner(),
//!     QueryPhase::Error if query.value().is_none() => render_error(query.error()),
//!     _ => render_value(query.value()),
//! }
//! ```

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::cache::{CacheEvent, CacheLayer, CacheResult, Cacheable, FetchError};
use crate::identity::Identity;

type FetchOutcome<V> = Result<CacheResult<Option<V>>, FetchError>;

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
  /// Nothing known and nothing being fetched
  Empty,
  /// First fetch for the bound key is outstanding
  Loading,
  /// A value (possibly "confirmed absent") is available
  Ready,
  /// A value is shown while a newer one is fetched
  Revalidating,
  /// The last fetch failed; a previous value may still be shown
  Error,
}

#[derive(Debug, Clone)]
struct Snapshot<V> {
  value: Option<V>,
  cached_at: DateTime<Utc>,
}

/// Consumer handle bound to one key of a [`CacheLayer`].
///
/// Dropping the query drops its receivers, so a fetch that outlives it
/// still fills the shared cache but never touches this state.
pub struct EntityQuery<V: Cacheable> {
  layer: Arc<CacheLayer<V>>,
  key: Option<String>,
  snapshot: Option<Snapshot<V>>,
  phase: QueryPhase,
  error: Option<String>,
  receiver: Option<mpsc::UnboundedReceiver<FetchOutcome<V>>>,
  /// Identity the outstanding fetch was started under
  fetch_scope: Option<Identity>,
  events: broadcast::Receiver<CacheEvent>,
}

impl<V: Cacheable> EntityQuery<V> {
  /// Create an unbound query.
  pub fn new(layer: Arc<CacheLayer<V>>) -> Self {
    let events = layer.subscribe();
    Self {
      layer,
      key: None,
      snapshot: None,
      phase: QueryPhase::Empty,
      error: None,
      receiver: None,
      fetch_scope: None,
      events,
    }
  }

  /// Create a query already bound to `key`.
  pub fn mount(layer: Arc<CacheLayer<V>>, key: impl Into<String>) -> Self {
    let mut query = Self::new(layer);
    query.bind(Some(key.into()));
    query
  }

  /// Bind to another key (or unbind with `None`).
  ///
  /// Whatever was shown for the previous key is dropped before anything
  /// else happens, so data never leaks across identities.
  pub fn bind(&mut self, key: Option<String>) {
    if key == self.key {
      return;
    }
    self.key = key;
    self.snapshot = None;
    self.error = None;
    self.receiver = None;
    self.phase = QueryPhase::Empty;
    self.load();
  }

  fn load(&mut self) {
    let Some(key) = self.key.clone() else {
      return;
    };

    if let Some(cached) = self.layer.get(&key) {
      self.apply(cached);
      return;
    }

    match self.layer.peek(&key) {
      Some(entry) => {
        self.snapshot = Some(Snapshot {
          value: entry.value,
          cached_at: entry.cached_at,
        });
        self.phase = QueryPhase::Revalidating;
      }
      None => self.phase = QueryPhase::Loading,
    }
    self.start_fetch(key, false);
  }

  /// Force a network fetch for the bound key.
  pub fn refresh(&mut self) {
    let Some(key) = self.key.clone() else {
      return;
    };
    self.phase = if self.snapshot.is_some() {
      QueryPhase::Revalidating
    } else {
      QueryPhase::Loading
    };
    self.start_fetch(key, true);
  }

  /// Drop the bound key from the shared cache without refetching.
  pub fn clear(&mut self) {
    if let Some(key) = &self.key {
      self.layer.clear(Some(key));
    }
    self.snapshot = None;
    self.error = None;
    self.receiver = None;
    self.phase = QueryPhase::Empty;
  }

  fn start_fetch(&mut self, key: String, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.fetch_scope = self.layer.identity();

    let layer = Arc::clone(&self.layer);
    tokio::spawn(async move {
      let result = if force {
        layer.refresh(&key).await
      } else {
        layer.fetch(&key).await
      };
      // Ignore send errors - the query may have been dropped or rebound
      let _ = tx.send(result);
    });
  }

  fn apply(&mut self, result: CacheResult<Option<V>>) {
    let cached_at = result
      .cached_at
      .unwrap_or_else(|| self.layer.cache().now());
    self.snapshot = Some(Snapshot {
      value: result.data,
      cached_at,
    });
    self.error = None;
    self.phase = QueryPhase::Ready;
  }

  /// Apply finished fetches and cache changes for the bound key.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.poll_fetch();

    loop {
      match self.events.try_recv() {
        Ok(event) => {
          if self.key.as_deref().is_some_and(|key| event.affects(key)) {
            changed |= self.sync_from_cache();
          }
        }
        Err(broadcast::error::TryRecvError::Lagged(_)) => {
          changed |= self.sync_from_cache();
        }
        Err(_) => break,
      }
    }

    changed
  }

  fn poll_fetch(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    let outcome = receiver.try_recv();
    if outcome.is_ok() && self.fetch_scope != self.layer.identity() {
      // Finished for an identity that is no longer active
      self.receiver = None;
      self.snapshot = None;
      self.error = None;
      self.phase = QueryPhase::Empty;
      self.load();
      return true;
    }

    match outcome {
      Ok(Ok(result)) => {
        self.receiver = None;
        self.apply(result);
        true
      }
      Ok(Err(error)) => {
        self.receiver = None;
        self.error = Some(error.to_string());
        self.phase = QueryPhase::Error;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Sender dropped without sending - treat as error
        self.receiver = None;
        self.error = Some("Query was cancelled".to_string());
        self.phase = QueryPhase::Error;
        true
      }
    }
  }

  /// Re-read the bound key after someone else changed it.
  fn sync_from_cache(&mut self) -> bool {
    let Some(key) = self.key.clone() else {
      return false;
    };

    match self.layer.peek(&key) {
      Some(entry) => {
        self.snapshot = Some(Snapshot {
          value: entry.value,
          cached_at: entry.cached_at,
        });
        if self.receiver.is_none() {
          self.error = None;
          self.phase = QueryPhase::Ready;
        } else if self.phase == QueryPhase::Loading {
          self.phase = QueryPhase::Revalidating;
        }
      }
      None => {
        self.snapshot = None;
        if self.receiver.is_none() {
          self.phase = QueryPhase::Empty;
        } else {
          self.phase = QueryPhase::Loading;
        }
      }
    }
    true
  }

  pub fn key(&self) -> Option<&str> {
    self.key.as_deref()
  }

  pub fn phase(&self) -> QueryPhase {
    self.phase
  }

  /// Current value, if one is known and the entity exists.
  pub fn value(&self) -> Option<&V> {
    self.snapshot.as_ref().and_then(|s| s.value.as_ref())
  }

  /// True only while the first fetch for the bound key is outstanding.
  pub fn is_loading(&self) -> bool {
    self.phase == QueryPhase::Loading
  }

  /// Whether any fetch is outstanding, first or background.
  pub fn is_fetching(&self) -> bool {
    self.receiver.is_some()
  }

  /// Error message of the last failed fetch, cleared on success.
  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  /// Whether the shown value is older than the layer's TTL.
  pub fn is_stale(&self) -> bool {
    self
      .snapshot
      .as_ref()
      .map(|s| !crate::cache::is_fresh(s.cached_at, self.layer.cache().now(), self.layer.ttl()))
      .unwrap_or(false)
  }
}

impl<V: Cacheable + std::fmt::Debug> std::fmt::Debug for EntityQuery<V> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EntityQuery")
      .field("key", &self.key)
      .field("phase", &self.phase)
      .field("value", &self.value())
      .field("error", &self.error)
      .finish_non_exhaustive()
  }
}
