//! Ties cache lifetime to refresh requests, realtime pushes and identity
//! changes.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::FetchError;
use super::layer::CacheLayer;
use super::traits::{CacheResult, Cacheable};
use crate::identity::{Identity, IdentityEvent};
use crate::realtime::{ChangeNotification, RealtimeChannel};

/// Applies a change notification to `layer`. Failures of the fallback
/// refresh are logged and swallowed.
async fn apply_change<V: Cacheable>(
  layer: &CacheLayer<V>,
  key: &str,
  notification: ChangeNotification<V>,
) {
  match notification {
    ChangeNotification::Full(value) => {
      debug!(key, entity = V::entity_type(), "applying pushed value");
      layer.set(key, value);
    }
    ChangeNotification::Partial(fields) => {
      debug!(
        key,
        entity = V::entity_type(),
        fields = fields.len(),
        "partial push, refetching"
      );
      if let Err(e) = layer.refresh(key).await {
        warn!(key, entity = V::entity_type(), error = %e, "refetch after partial push failed");
      }
    }
  }
}

pub struct Invalidator<V: Cacheable> {
  layer: Arc<CacheLayer<V>>,
  channel: Option<Arc<dyn RealtimeChannel<V>>>,
  listener: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Cacheable> Invalidator<V> {
  pub fn new(layer: Arc<CacheLayer<V>>) -> Self {
    Self {
      layer,
      channel: None,
      listener: Mutex::new(None),
    }
  }

  /// Listen to `channel` for the active identity, starting right away if
  /// one is already set.
  pub fn with_channel(mut self, channel: Arc<dyn RealtimeChannel<V>>) -> Self {
    self.channel = Some(channel);
    if let Some(identity) = self.layer.identity() {
      self.resubscribe(Some(&identity));
    }
    self
  }

  pub fn layer(&self) -> &Arc<CacheLayer<V>> {
    &self.layer
  }

  /// Always goes to the network (or joins a fetch already running).
  pub async fn on_explicit_refresh(&self, key: &str) -> Result<CacheResult<Option<V>>, FetchError> {
    self.layer.refresh(key).await
  }

  /// A push said `key` changed.
  pub async fn on_external_change(&self, key: &str, notification: ChangeNotification<V>) {
    apply_change(&self.layer, key, notification).await;
  }

  /// The active identity moved from `previous` to `next`.
  ///
  /// Signing out drops every entry. Switching keeps only what `next` already
  /// owns, so another identity's data is never reused.
  pub fn on_identity_change(&self, previous: Option<&Identity>, next: Option<&Identity>) {
    if previous == next && self.layer.identity().as_ref() == next {
      return;
    }

    info!(
      entity = V::entity_type(),
      from = previous.map(Identity::as_str),
      to = next.map(Identity::as_str),
      "identity changed, invalidating cache"
    );
    self.layer.switch_identity(next.cloned());
    self.resubscribe(next);
  }

  /// Convenience for identity provider events.
  pub fn handle_identity_event(&self, event: &IdentityEvent) {
    let (previous, next) = event.transition();
    self.on_identity_change(previous.as_ref(), next.as_ref());
  }

  fn resubscribe(&self, identity: Option<&Identity>) {
    let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = listener.take() {
      handle.abort();
    }

    let (Some(channel), Some(identity)) = (&self.channel, identity) else {
      return;
    };

    let mut events = channel.subscribe(identity);
    let layer = Arc::clone(&self.layer);
    *listener = Some(tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        apply_change(&layer, &event.key, event.notification).await;
      }
    }));
  }

  /// Whether a realtime listener is running.
  pub fn is_listening(&self) -> bool {
    self
      .listener
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }

  /// Stop listening and release the layer's in-memory state.
  pub fn dispose(&self) {
    if let Some(handle) = self
      .listener
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      handle.abort();
    }
    self.layer.dispose();
  }
}

impl<V: Cacheable> Drop for Invalidator<V> {
  fn drop(&mut self) {
    if let Some(handle) = self
      .listener
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      handle.abort();
    }
  }
}
