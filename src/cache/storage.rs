//! Durable storage backends and the persistence mirror built on top of them.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::clock::{is_fresh, Clock};
use super::traits::Cacheable;
use crate::identity::Identity;

/// Bumped whenever the record layout changes; older records read as misses.
pub const RECORD_VERSION: u32 = 1;

/// Trait for durable key-value backends.
///
/// Slots are plain strings; namespacing is the mirror's job.
pub trait DurableStore: Send + Sync {
  /// Read a slot.
  fn get(&self, slot: &str) -> Result<Option<String>>;

  /// Write (or overwrite) a slot.
  fn set(&self, slot: &str, data: &str) -> Result<()>;

  /// Remove a slot. Removing a missing slot is not an error.
  fn remove(&self, slot: &str) -> Result<()>;

  /// List all slots starting with `prefix`.
  fn slots(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStore;

impl DurableStore for NoopStore {
  fn get(&self, _slot: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _slot: &str, _data: &str) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _slot: &str) -> Result<()> {
    Ok(())
  }

  fn slots(&self, _prefix: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// Process-local store, handy for tests and for simulating a reload by
/// handing the same store to a freshly constructed cache.
#[derive(Default)]
pub struct MemoryStore {
  slots: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl DurableStore for MemoryStore {
  fn get(&self, slot: &str) -> Result<Option<String>> {
    let slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(slots.get(slot).cloned())
  }

  fn set(&self, slot: &str, data: &str) -> Result<()> {
    let mut slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    slots.insert(slot.to_string(), data.to_string());
    Ok(())
  }

  fn remove(&self, slot: &str) -> Result<()> {
    let mut slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    slots.remove(slot);
    Ok(())
  }

  fn slots(&self, prefix: &str) -> Result<Vec<String>> {
    let slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      slots
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }
}

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("studio-cache").join("cache.db"))
  }

  /// Run database migrations for the slot table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the slot table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    slot TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteStore {
  fn get(&self, slot: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM kv_store WHERE slot = ?",
        params![slot],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read slot {}: {}", slot, e))
  }

  fn set(&self, slot: &str, data: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (slot, data, written_at) VALUES (?, ?, datetime('now'))",
        params![slot, data],
      )
      .map_err(|e| eyre!("Failed to write slot {}: {}", slot, e))?;

    Ok(())
  }

  fn remove(&self, slot: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE slot = ?", params![slot])
      .map_err(|e| eyre!("Failed to remove slot {}: {}", slot, e))?;

    Ok(())
  }

  fn slots(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT slot FROM kv_store WHERE substr(slot, 1, length(?1)) = ?1 ORDER BY slot")
      .map_err(|e| eyre!("Failed to prepare slot query: {}", e))?;

    let slots = stmt
      .query_map(params![prefix], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list slots: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(slots)
  }
}

/// On-disk envelope. The value is kept as its own JSON string so the
/// checksum covers exactly the bytes that were written.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
  version: u32,
  owner: Option<Identity>,
  cached_at: DateTime<Utc>,
  checksum: String,
  payload: String,
}

/// A record read back from the mirror.
#[derive(Debug, Clone)]
pub struct PersistedEntry<V> {
  pub value: Option<V>,
  pub cached_at: DateTime<Utc>,
  pub owner: Option<Identity>,
}

fn checksum(payload: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(payload.as_bytes());
  hex::encode(hasher.finalize())
}

/// Best-effort mirror of cache entries in a [`DurableStore`].
///
/// Nothing here returns an error: a broken store degrades to "no durable
/// cache" and is only visible in the logs.
pub struct PersistenceMirror<V> {
  store: Arc<dyn DurableStore>,
  namespace: String,
  clock: Arc<dyn Clock>,
  _marker: PhantomData<fn() -> V>,
}

impl<V: Cacheable> PersistenceMirror<V> {
  pub fn new(store: Arc<dyn DurableStore>, prefix: &str, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      namespace: format!("{}{}:", prefix, V::entity_type()),
      clock,
      _marker: PhantomData,
    }
  }

  /// Slot prefix shared by every record of this entity type.
  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  fn slot(&self, key: &str) -> String {
    format!("{}{}", self.namespace, key)
  }

  /// Read a record, or `None` if it is missing, unreadable or stale.
  pub fn read(&self, key: &str, ttl: Duration) -> Option<PersistedEntry<V>> {
    let slot = self.slot(key);
    let raw = match self.store.get(&slot) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(slot = %slot, error = %e, "persisted cache read failed");
        return None;
      }
    };

    let entry = match self.decode(&raw) {
      Some(entry) => entry,
      None => {
        debug!(slot = %slot, "discarding malformed persisted record");
        self.remove_slot(&slot);
        return None;
      }
    };

    if !is_fresh(entry.cached_at, self.clock.now(), ttl) {
      debug!(slot = %slot, "persisted record is stale");
      return None;
    }

    Some(entry)
  }

  fn decode(&self, raw: &str) -> Option<PersistedEntry<V>> {
    let record: PersistedRecord = serde_json::from_str(raw).ok()?;
    if record.version != RECORD_VERSION || record.checksum != checksum(&record.payload) {
      return None;
    }
    let value: Option<V> = serde_json::from_str(&record.payload).ok()?;
    Some(PersistedEntry {
      value,
      cached_at: record.cached_at,
      owner: record.owner,
    })
  }

  /// Write a record stamped with the current time.
  pub fn write(&self, key: &str, value: Option<&V>, owner: Option<&Identity>) {
    self.write_at(key, value, owner, self.clock.now());
  }

  pub(crate) fn write_at(
    &self,
    key: &str,
    value: Option<&V>,
    owner: Option<&Identity>,
    cached_at: DateTime<Utc>,
  ) {
    let slot = self.slot(key);
    let encoded = serde_json::to_string(&value).and_then(|payload| {
      serde_json::to_string(&PersistedRecord {
        version: RECORD_VERSION,
        owner: owner.cloned(),
        cached_at,
        checksum: checksum(&payload),
        payload,
      })
    });

    match encoded {
      Ok(data) => {
        if let Err(e) = self.store.set(&slot, &data) {
          warn!(slot = %slot, error = %e, "persisted cache write failed");
        }
      }
      Err(e) => warn!(slot = %slot, error = %e, "failed to serialize cache record"),
    }
  }

  /// Remove one key, or every key in this namespace.
  pub fn clear(&self, key: Option<&str>) {
    match key {
      Some(key) => self.remove_slot(&self.slot(key)),
      None => {
        for slot in self.list_slots() {
          self.remove_slot(&slot);
        }
      }
    }
  }

  /// Remove every record not owned by `identity`.
  pub fn retain_owned_by(&self, identity: &Identity) {
    for slot in self.list_slots() {
      let owned = self
        .store
        .get(&slot)
        .ok()
        .flatten()
        .and_then(|raw| self.decode(&raw))
        .is_some_and(|entry| entry.owner.as_ref() == Some(identity));
      if !owned {
        self.remove_slot(&slot);
      }
    }
  }

  /// Remove every record that is unreadable or older than `ttl`.
  /// Returns how many slots were removed.
  pub fn prune(&self, ttl: Duration) -> usize {
    let now = self.clock.now();
    let mut removed = 0;
    for slot in self.list_slots() {
      let keep = self
        .store
        .get(&slot)
        .ok()
        .flatten()
        .and_then(|raw| self.decode(&raw))
        .is_some_and(|entry| is_fresh(entry.cached_at, now, ttl));
      if !keep {
        self.remove_slot(&slot);
        removed += 1;
      }
    }
    removed
  }

  /// Keys currently persisted under this namespace.
  pub fn keys(&self) -> Vec<String> {
    self
      .list_slots()
      .into_iter()
      .filter_map(|slot| slot.strip_prefix(&self.namespace).map(String::from))
      .collect()
  }

  fn list_slots(&self) -> Vec<String> {
    self.store.slots(&self.namespace).unwrap_or_else(|e| {
      warn!(namespace = %self.namespace, error = %e, "failed to list persisted slots");
      Vec::new()
    })
  }

  fn remove_slot(&self, slot: &str) {
    if let Err(e) = self.store.remove(slot) {
      warn!(slot = %slot, error = %e, "failed to remove persisted slot");
    }
  }
}

/// One persisted slot as seen from outside any entity type.
#[derive(Debug, Clone)]
pub struct SlotSummary {
  pub slot: String,
  pub owner: Option<Identity>,
  pub cached_at: Option<DateTime<Utc>>,
  /// Whether the record would be accepted on read (ignoring its age)
  pub valid: bool,
}

/// Describe every slot under `prefix` without decoding payloads.
pub fn inspect_slots(store: &dyn DurableStore, prefix: &str) -> Result<Vec<SlotSummary>> {
  let mut summaries = Vec::new();
  for slot in store.slots(prefix)? {
    let record = store
      .get(&slot)?
      .and_then(|raw| serde_json::from_str::<PersistedRecord>(&raw).ok());

    summaries.push(match record {
      Some(record) => {
        let valid = record.version == RECORD_VERSION && checksum(&record.payload) == record.checksum;
        SlotSummary {
          slot,
          owner: record.owner,
          cached_at: Some(record.cached_at),
          valid,
        }
      }
      None => SlotSummary {
        slot,
        owner: None,
        cached_at: None,
        valid: false,
      },
    });
  }
  Ok(summaries)
}

/// Remove every slot under `prefix`, returning how many were removed.
pub fn remove_slots(store: &dyn DurableStore, prefix: &str) -> Result<usize> {
  let slots = store.slots(prefix)?;
  for slot in &slots {
    store.remove(slot)?;
  }
  Ok(slots.len())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
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

  fn acme() -> Org {
    Org {
      name: "Acme".to_string(),
    }
  }

  struct FailingStore;

  impl DurableStore for FailingStore {
    fn get(&self, _slot: &str) -> Result<Option<String>> {
      Err(eyre!("storage disabled"))
    }

    fn set(&self, _slot: &str, _data: &str) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }

    fn remove(&self, _slot: &str) -> Result<()> {
      Err(eyre!("storage disabled"))
    }

    fn slots(&self, _prefix: &str) -> Result<Vec<String>> {
      Err(eyre!("storage disabled"))
    }
  }

  fn mirror(store: Arc<dyn DurableStore>, clock: Arc<ManualClock>) -> PersistenceMirror<Org> {
    PersistenceMirror::new(store, "test:", clock)
  }

  #[test]
  fn test_write_then_read_from_new_mirror() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());

    mirror(store.clone(), clock.clone()).write("org-1", Some(&acme()), None);

    // A new mirror over the same store behaves like a reloaded process
    clock.advance(Duration::seconds(30));
    let reloaded = mirror(store, clock);
    let entry = reloaded.read("org-1", Duration::seconds(60)).unwrap();
    assert_eq!(entry.value, Some(acme()));
  }

  #[test]
  fn test_stale_record_is_a_miss() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let mirror = mirror(store, clock.clone());

    mirror.write("org-1", Some(&acme()), None);
    clock.advance(Duration::seconds(61));
    assert!(mirror.read("org-1", Duration::seconds(60)).is_none());
  }

  #[test]
  fn test_confirmed_absent_round_trips_as_none() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let mirror = mirror(store, Arc::new(ManualClock::default()));

    mirror.write("org-404", None, None);
    let entry = mirror.read("org-404", Duration::seconds(60)).unwrap();
    assert_eq!(entry.value, None);
  }

  #[test]
  fn test_malformed_record_is_a_miss_and_removed() {
    let store = Arc::new(MemoryStore::new());
    let mirror = mirror(store.clone(), Arc::new(ManualClock::default()));

    store.set("test:org:org-1", "{not json").unwrap();
    assert!(mirror.read("org-1", Duration::seconds(60)).is_none());
    assert_eq!(store.get("test:org:org-1").unwrap(), None);
  }

  #[test]
  fn test_tampered_payload_fails_checksum() {
    let store = Arc::new(MemoryStore::new());
    let mirror = mirror(store.clone(), Arc::new(ManualClock::default()));

    mirror.write("org-1", Some(&acme()), None);
    let raw = store.get("test:org:org-1").unwrap().unwrap();
    store
      .set("test:org:org-1", &raw.replace("Acme", "Evil"))
      .unwrap();

    assert!(mirror.read("org-1", Duration::seconds(60)).is_none());
  }

  #[test]
  fn test_old_record_version_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    let mirror = mirror(store.clone(), Arc::new(ManualClock::default()));

    mirror.write("org-1", Some(&acme()), None);
    let raw = store.get("test:org:org-1").unwrap().unwrap();
    let mut record: serde_json::Value = serde_json::from_str(&raw).unwrap();
    record["version"] = serde_json::json!(RECORD_VERSION + 1);
    store.set("test:org:org-1", &record.to_string()).unwrap();

    assert!(mirror.read("org-1", Duration::seconds(60)).is_none());
  }

  #[test]
  fn test_failing_store_never_errors() {
    let mirror = mirror(Arc::new(FailingStore), Arc::new(ManualClock::default()));

    mirror.write("org-1", Some(&acme()), None);
    assert!(mirror.read("org-1", Duration::seconds(60)).is_none());
    mirror.clear(None);
    mirror.clear(Some("org-1"));
    assert!(mirror.keys().is_empty());
  }

  #[test]
  fn test_clear_only_touches_namespace() {
    let store = Arc::new(MemoryStore::new());
    let mirror = mirror(store.clone(), Arc::new(ManualClock::default()));

    mirror.write("org-1", Some(&acme()), None);
    mirror.write("org-2", Some(&acme()), None);
    store.set("other:slot", "keep").unwrap();

    mirror.clear(Some("org-1"));
    assert_eq!(mirror.keys(), vec!["org-2".to_string()]);

    mirror.clear(None);
    assert!(mirror.keys().is_empty());
    assert_eq!(store.get("other:slot").unwrap(), Some("keep".to_string()));
  }

  #[test]
  fn test_retain_owned_by() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let mirror = mirror(store, Arc::new(ManualClock::default()));
    let a = Identity::from("user-a");
    let b = Identity::from("user-b");

    mirror.write("org-a", Some(&acme()), Some(&a));
    mirror.write("org-b", Some(&acme()), Some(&b));
    mirror.retain_owned_by(&b);

    assert_eq!(mirror.keys(), vec!["org-b".to_string()]);
  }

  #[test]
  fn test_prune_drops_stale_and_malformed() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let mirror = mirror(store.clone(), clock.clone());

    mirror.write("old", Some(&acme()), None);
    clock.advance(Duration::seconds(120));
    mirror.write("new", Some(&acme()), None);
    store.set("test:org:junk", "garbage").unwrap();

    assert_eq!(mirror.prune(Duration::seconds(60)), 2);
    assert_eq!(mirror.keys(), vec!["new".to_string()]);
  }

  #[test]
  fn test_sqlite_store_survives_reopen() {
    let path = std::env::temp_dir().join(format!(
      "studio-cache-test-{}-{}.db",
      std::process::id(),
      Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let clock = Arc::new(ManualClock::default());

    {
      let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_at(&path).unwrap());
      mirror(store, clock.clone()).write("org-1", Some(&acme()), None);
    }

    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_at(&path).unwrap());
    let entry = mirror(store, clock)
      .read("org-1", Duration::seconds(60))
      .unwrap();
    assert_eq!(entry.value, Some(acme()));

    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn test_sqlite_slots_filter_by_prefix() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("a:1", "x").unwrap();
    store.set("a:2", "y").unwrap();
    store.set("b:1", "z").unwrap();

    assert_eq!(store.slots("a:").unwrap(), vec!["a:1", "a:2"]);
    store.remove("a:1").unwrap();
    assert_eq!(store.get("a:1").unwrap(), None);
    assert_eq!(store.get("b:1").unwrap(), Some("z".to_string()));
  }

  #[test]
  fn test_inspect_and_remove_slots() {
    let store = Arc::new(MemoryStore::new());
    let mirror = mirror(store.clone(), Arc::new(ManualClock::default()));
    let a = Identity::from("user-a");

    mirror.write("org-1", Some(&acme()), Some(&a));
    store.set("test:org:junk", "garbage").unwrap();
    store.set("other:slot", "keep").unwrap();

    let summaries = inspect_slots(store.as_ref(), "test:").unwrap();
    assert_eq!(summaries.len(), 2);
    let good = summaries.iter().find(|s| s.slot == "test:org:org-1").unwrap();
    assert!(good.valid);
    assert_eq!(good.owner, Some(a));
    let junk = summaries.iter().find(|s| s.slot == "test:org:junk").unwrap();
    assert!(!junk.valid);
    assert!(junk.cached_at.is_none());

    assert_eq!(remove_slots(store.as_ref(), "test:").unwrap(), 2);
    assert_eq!(store.slots("").unwrap(), vec!["other:slot"]);
  }
}
