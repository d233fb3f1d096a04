//! In-memory entity cache with TTL freshness and write-through persistence.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

use super::clock::{is_fresh, Clock};
use super::storage::PersistenceMirror;
use super::traits::Cacheable;
use crate::identity::Identity;

/// Capacity of the change broadcast. Slow consumers that lag behind simply
/// re-read the cache, so a small buffer is enough.
const EVENT_CAPACITY: usize = 64;

/// Last known value for a key.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub key: String,
  /// `None` is a real result: the entity is known not to exist.
  pub value: Option<V>,
  pub cached_at: DateTime<Utc>,
  /// Identity that was active when the value was stored
  pub owner: Option<Identity>,
}

/// Mutation notifications for consumers sharing the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  Updated { key: String },
  /// `key: None` means every entry was affected.
  Cleared { key: Option<String> },
}

impl CacheEvent {
  /// Whether this event concerns `key`.
  pub fn affects(&self, key: &str) -> bool {
    match self {
      Self::Updated { key: k } => k == key,
      Self::Cleared { key: Some(k) } => k == key,
      Self::Cleared { key: None } => true,
    }
  }
}

/// Snapshot of a key's write generation, taken when a fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteToken {
  epoch: u64,
  generation: u64,
}

struct Inner<V> {
  entries: HashMap<String, CacheEntry<V>>,
  generations: HashMap<String, u64>,
  /// Bumped by whole-cache invalidation
  epoch: u64,
  scope: Option<Identity>,
}

impl<V> Inner<V> {
  fn bump(&mut self, key: &str) {
    *self.generations.entry(key.to_string()).or_insert(0) += 1;
  }

  fn token(&self, key: &str) -> WriteToken {
    WriteToken {
      epoch: self.epoch,
      generation: self.generations.get(key).copied().unwrap_or(0),
    }
  }

  fn visible(&self, key: &str) -> Option<&CacheEntry<V>> {
    self
      .entries
      .get(key)
      .filter(|entry| entry.owner == self.scope)
  }
}

/// Process-wide cache of one entity type.
///
/// Every mutation is written through to the [`PersistenceMirror`] and
/// announced on a broadcast channel so all consumers observe it at once.
pub struct EntityCache<V> {
  inner: Mutex<Inner<V>>,
  mirror: PersistenceMirror<V>,
  clock: Arc<dyn Clock>,
  events: broadcast::Sender<CacheEvent>,
}

impl<V: Cacheable> EntityCache<V> {
  pub fn new(mirror: PersistenceMirror<V>, clock: Arc<dyn Clock>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        generations: HashMap::new(),
        epoch: 0,
        scope: None,
      }),
      mirror,
      clock,
      events,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner<V>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn mirror(&self) -> &PersistenceMirror<V> {
    &self.mirror
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Subscribe to mutation notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  fn notify(&self, event: CacheEvent) {
    // No receivers is fine
    let _ = self.events.send(event);
  }

  /// Identity whose entries are currently readable.
  pub fn scope(&self) -> Option<Identity> {
    self.lock().scope.clone()
  }

  pub fn set_scope(&self, scope: Option<Identity>) {
    self.lock().scope = scope;
  }

  /// Fresh value for `key`.
  ///
  /// Returns `None` when the key is unknown, stale or owned by another
  /// identity, and `Some(None)` when the entity is known to be absent.
  pub fn get(&self, key: &str, ttl: Duration) -> Option<Option<V>> {
    let now = self.clock.now();
    let inner = self.lock();
    inner
      .visible(key)
      .filter(|entry| is_fresh(entry.cached_at, now, ttl))
      .map(|entry| entry.value.clone())
  }

  /// Last known entry for `key`, however old.
  pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
    self.lock().visible(key).cloned()
  }

  /// Pull a fresh record from the mirror into memory, keeping its original
  /// timestamp. Does nothing if memory already holds an entry for `key`.
  pub fn hydrate(&self, key: &str, ttl: Duration) -> Option<CacheEntry<V>> {
    let mut inner = self.lock();
    if let Some(existing) = inner.visible(key) {
      return is_fresh(existing.cached_at, self.clock.now(), ttl).then(|| existing.clone());
    }

    let persisted = self.mirror.read(key, ttl)?;
    if persisted.owner != inner.scope {
      debug!(key, "persisted record belongs to another identity");
      return None;
    }

    let entry = CacheEntry {
      key: key.to_string(),
      value: persisted.value,
      cached_at: persisted.cached_at,
      owner: persisted.owner,
    };
    inner.entries.insert(key.to_string(), entry.clone());
    Some(entry)
  }

  /// Current write generation of `key`.
  pub fn token(&self, key: &str) -> WriteToken {
    self.lock().token(key)
  }

  /// Store a value stamped with the current time and active identity.
  pub fn set(&self, key: &str, value: Option<V>) {
    let mut inner = self.lock();
    self.store(&mut inner, key, value, self.clock.now());
    drop(inner);
    self.notify(CacheEvent::Updated {
      key: key.to_string(),
    });
  }

  /// Store a value only if nothing touched `key` since `token` was taken.
  pub fn set_if_current(&self, token: WriteToken, key: &str, value: Option<V>) -> bool {
    let mut inner = self.lock();
    if inner.token(key) != token {
      debug!(key, "dropping fetch result superseded by a newer write");
      return false;
    }
    self.store(&mut inner, key, value, self.clock.now());
    drop(inner);
    self.notify(CacheEvent::Updated {
      key: key.to_string(),
    });
    true
  }

  /// Put back a previously captured entry, timestamp included.
  pub fn restore(&self, entry: CacheEntry<V>) {
    let key = entry.key.clone();
    let mut inner = self.lock();
    inner.bump(&key);
    self
      .mirror
      .write_at(&key, entry.value.as_ref(), entry.owner.as_ref(), entry.cached_at);
    inner.entries.insert(key.clone(), entry);
    drop(inner);
    self.notify(CacheEvent::Updated { key });
  }

  fn store(&self, inner: &mut Inner<V>, key: &str, value: Option<V>, cached_at: DateTime<Utc>) {
    inner.bump(key);
    let owner = inner.scope.clone();
    self
      .mirror
      .write_at(key, value.as_ref(), owner.as_ref(), cached_at);
    inner.entries.insert(
      key.to_string(),
      CacheEntry {
        key: key.to_string(),
        value,
        cached_at,
        owner,
      },
    );
  }

  /// Remove one entry, or all entries when `key` is `None`.
  pub fn clear(&self, key: Option<&str>) {
    let mut inner = self.lock();
    match key {
      Some(key) => {
        inner.entries.remove(key);
        inner.bump(key);
      }
      None => {
        inner.entries.clear();
        inner.epoch += 1;
      }
    }
    self.mirror.clear(key);
    drop(inner);
    self.notify(CacheEvent::Cleared {
      key: key.map(String::from),
    });
  }

  /// Forget everything held in memory but leave the mirror alone.
  pub fn evict_memory(&self) {
    let mut inner = self.lock();
    inner.entries.clear();
    inner.epoch += 1;
    drop(inner);
    self.notify(CacheEvent::Cleared { key: None });
  }

  /// Make `next` the active identity and drop everything it does not own,
  /// in memory and on disk. `None` (signed out) drops everything.
  ///
  /// Done under one lock so no fetch started for the previous identity can
  /// slip a write in between.
  pub fn rescope(&self, next: Option<Identity>) {
    let mut inner = self.lock();
    match &next {
      Some(identity) => {
        inner
          .entries
          .retain(|_, entry| entry.owner.as_ref() == Some(identity));
        self.mirror.retain_owned_by(identity);
      }
      None => {
        inner.entries.clear();
        self.mirror.clear(None);
      }
    }
    inner.scope = next;
    inner.epoch += 1;
    drop(inner);
    self.notify(CacheEvent::Cleared { key: None });
  }

  /// Number of entries held in memory, whatever their owner or age.
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::storage::{DurableStore, MemoryStore};
  use serde::{Deserialize, Serialize};

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

  fn cache_with(store: Arc<dyn DurableStore>, clock: Arc<ManualClock>) -> EntityCache<Org> {
    let mirror = PersistenceMirror::new(store, "test:", clock.clone());
    EntityCache::new(mirror, clock)
  }

  fn cache() -> (EntityCache<Org>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    (cache_with(Arc::new(MemoryStore::new()), clock.clone()), clock)
  }

  #[test]
  fn test_get_respects_ttl() {
    let (cache, clock) = cache();
    let ttl = Duration::seconds(60);

    cache.set("org-1", Some(org("Acme")));
    assert_eq!(cache.get("org-1", ttl), Some(Some(org("Acme"))));

    clock.advance(Duration::seconds(61));
    assert_eq!(cache.get("org-1", ttl), None);
    // The value itself is still there for stale-while-revalidate
    assert_eq!(cache.peek("org-1").unwrap().value, Some(org("Acme")));
  }

  #[test]
  fn test_confirmed_absent_differs_from_unknown() {
    let (cache, _) = cache();
    let ttl = Duration::seconds(60);

    cache.set("org-404", None);
    assert_eq!(cache.get("org-404", ttl), Some(None));
    assert_eq!(cache.get("org-unknown", ttl), None);
  }

  #[test]
  fn test_clear_one_and_all() {
    let (cache, _) = cache();
    let ttl = Duration::seconds(60);

    cache.set("org-1", Some(org("Acme")));
    cache.set("org-2", Some(org("Globex")));

    cache.clear(Some("org-1"));
    assert_eq!(cache.get("org-1", ttl), None);
    assert!(cache.get("org-2", ttl).is_some());
    assert!(cache.mirror().read("org-1", ttl).is_none());

    cache.clear(None);
    assert!(cache.is_empty());
    assert!(cache.mirror().keys().is_empty());
  }

  #[test]
  fn test_hydrate_from_mirror_keeps_timestamp() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let ttl = Duration::seconds(60);

    cache_with(store.clone(), clock.clone()).set("org-1", Some(org("Acme")));
    let written_at = clock.now();
    clock.advance(Duration::seconds(10));

    let reloaded = cache_with(store, clock.clone());
    assert_eq!(reloaded.get("org-1", ttl), None);

    let entry = reloaded.hydrate("org-1", ttl).unwrap();
    assert_eq!(entry.cached_at, written_at);
    assert_eq!(reloaded.get("org-1", ttl), Some(Some(org("Acme"))));

    // Still expires relative to the original write
    clock.advance(Duration::seconds(51));
    assert_eq!(reloaded.get("org-1", ttl), None);
  }

  #[test]
  fn test_set_if_current_rejects_superseded_token() {
    let (cache, _) = cache();
    let ttl = Duration::seconds(60);

    let token = cache.token("org-1");
    cache.set("org-1", Some(org("Pushed")));
    assert!(!cache.set_if_current(token, "org-1", Some(org("Old fetch"))));
    assert_eq!(cache.get("org-1", ttl), Some(Some(org("Pushed"))));

    let token = cache.token("org-1");
    assert!(cache.set_if_current(token, "org-1", Some(org("New fetch"))));
    assert_eq!(cache.get("org-1", ttl), Some(Some(org("New fetch"))));
  }

  #[test]
  fn test_clear_all_invalidates_outstanding_tokens() {
    let (cache, _) = cache();
    let token = cache.token("org-1");
    cache.clear(None);
    assert!(!cache.set_if_current(token, "org-1", Some(org("Late"))));
    assert!(cache.is_empty());
  }

  #[test]
  fn test_scope_hides_other_identity_entries() {
    let (cache, _) = cache();
    let ttl = Duration::seconds(60);
    let a = Identity::from("user-a");
    let b = Identity::from("user-b");

    cache.set_scope(Some(a.clone()));
    cache.set("org-1", Some(org("Acme")));

    cache.set_scope(Some(b.clone()));
    assert_eq!(cache.get("org-1", ttl), None);
    assert!(cache.peek("org-1").is_none());
  }

  #[test]
  fn test_rescope_keeps_only_next_identity_entries() {
    let (cache, _) = cache();
    let ttl = Duration::seconds(60);
    let a = Identity::from("user-a");
    let b = Identity::from("user-b");

    cache.set_scope(Some(b.clone()));
    cache.set("org-b", Some(org("Globex")));
    cache.set_scope(Some(a.clone()));
    cache.set("org-a", Some(org("Acme")));

    let token = cache.token("org-a");
    cache.rescope(Some(b.clone()));

    assert_eq!(cache.scope(), Some(b));
    assert_eq!(cache.get("org-b", ttl), Some(Some(org("Globex"))));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.mirror().keys(), vec!["org-b".to_string()]);
    assert!(!cache.set_if_current(token, "org-a", Some(org("Late"))));

    cache.rescope(None);
    assert!(cache.is_empty());
    assert!(cache.mirror().keys().is_empty());
  }

  #[tokio::test]
  async fn test_mutations_are_broadcast() {
    let (cache, _) = cache();
    let mut events = cache.subscribe();

    cache.set("org-1", Some(org("Acme")));
    cache.clear(Some("org-1"));

    assert_eq!(
      events.recv().await.unwrap(),
      CacheEvent::Updated {
        key: "org-1".to_string()
      }
    );
    let cleared = events.recv().await.unwrap();
    assert!(cleared.affects("org-1"));
    assert!(!cleared.affects("org-2"));
  }
}
