//! Realtime change notifications.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::identity::Identity;

/// What a push says about an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeNotification<V> {
  /// The complete new value; `None` when the row was deleted
  Full(Option<V>),
  /// Only some columns changed; the full value has to be fetched
  Partial(Map<String, Value>),
}

impl<V: Serialize + DeserializeOwned> ChangeNotification<V> {
  /// Classify a raw push payload.
  ///
  /// `null` is a deletion. An object is a full value only when it carries
  /// every column of `V`; columns filled in by serde defaults would
  /// otherwise overwrite cached data. Anything else is a partial diff.
  pub fn from_payload(payload: Value) -> Self {
    match payload {
      Value::Null => Self::Full(None),
      Value::Object(fields) => match Self::complete_value(&fields) {
        Some(value) => Self::Full(Some(value)),
        None => Self::Partial(fields),
      },
      other => {
        let mut fields = Map::new();
        fields.insert("value".to_string(), other);
        Self::Partial(fields)
      }
    }
  }

  fn complete_value(fields: &Map<String, Value>) -> Option<V> {
    let value: V = serde_json::from_value(Value::Object(fields.clone())).ok()?;
    let Value::Object(columns) = serde_json::to_value(&value).ok()? else {
      return None;
    };
    columns
      .keys()
      .all(|column| fields.contains_key(column))
      .then_some(value)
  }
}

/// A change to one cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<V> {
  pub key: String,
  pub notification: ChangeNotification<V>,
}

/// Source of change events for an identity.
pub trait RealtimeChannel<V>: Send + Sync {
  /// Start receiving events for `identity`. Dropping the receiver
  /// unsubscribes.
  fn subscribe(&self, identity: &Identity) -> mpsc::UnboundedReceiver<ChangeEvent<V>>;
}

/// In-process channel that fans published events out to subscribers of the
/// matching identity.
pub struct ChangeFeed<V> {
  subscribers: Mutex<HashMap<Identity, Vec<mpsc::UnboundedSender<ChangeEvent<V>>>>>,
}

impl<V> Default for ChangeFeed<V> {
  fn default() -> Self {
    Self {
      subscribers: Mutex::new(HashMap::new()),
    }
  }
}

impl<V: Clone> ChangeFeed<V> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Deliver `event` to every live subscriber of `identity`.
  /// Returns how many received it.
  pub fn publish(&self, identity: &Identity, event: ChangeEvent<V>) -> usize {
    let mut subscribers = self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let Some(senders) = subscribers.get_mut(identity) else {
      return 0;
    };
    senders.retain(|tx| tx.send(event.clone()).is_ok());
    senders.len()
  }

  /// Live subscribers for `identity`.
  pub fn subscriber_count(&self, identity: &Identity) -> usize {
    let subscribers = self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    subscribers
      .get(identity)
      .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
      .unwrap_or(0)
  }
}

impl<V: Clone + Send> RealtimeChannel<V> for ChangeFeed<V> {
  fn subscribe(&self, identity: &Identity) -> mpsc::UnboundedReceiver<ChangeEvent<V>> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .entry(identity.clone())
      .or_default()
      .push(tx);
    rx
  }
}
