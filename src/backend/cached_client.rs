//! Backend client with transparent per-entity caching.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{
  CacheLayer, CacheResult, Cacheable, Clock, DurableStore, FetchError, Fetcher, Invalidator,
  LayerOptions, NoopStore, SqliteStore, SystemClock,
};
use crate::config::{CacheConfig, Config, TtlConfig};
use crate::identity::Identity;
use crate::query::EntityQuery;
use crate::realtime::RealtimeChannel;

use super::client::BackendClient;
use super::types::{
  LegacyBranding, OnboardingUpdate, OrganizationSettings, OrganizationSettingsUpdate, Profile,
  ProfileUpdate, UserPreferences, UserSettingsRow,
};

const ORGANIZATION_TABLE: &str = "organization_settings";
const PROFILE_TABLE: &str = "profiles";
const SETTINGS_TABLE: &str = "user_settings";

/// Open the durable store the cache config asks for.
pub fn open_store(config: &CacheConfig) -> Result<Arc<dyn DurableStore>> {
  if !config.persist {
    return Ok(Arc::new(NoopStore));
  }
  let store = match &config.database_path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };
  Ok(Arc::new(store))
}

fn layer<V: Cacheable>(
  fetcher: impl Fetcher<V> + 'static,
  config: &CacheConfig,
  ttl: &TtlConfig,
  store: &Arc<dyn DurableStore>,
  clock: &Arc<dyn Clock>,
) -> Arc<CacheLayer<V>> {
  let layer = CacheLayer::new(
    fetcher,
    LayerOptions::default()
      .with_ttl(ttl.ttl())
      .with_min_refetch_interval(config.min_refetch_interval())
      .with_prefix(config.storage_prefix.clone())
      .with_store(store.clone())
      .with_clock(clock.clone()),
  );
  layer.init();
  Arc::new(layer)
}

/// The organization's settings row or, for accounts that predate it, the
/// branding the signed-in user kept in `user_settings`.
async fn fetch_organization_settings(
  client: BackendClient,
  organization_id: String,
) -> Result<Option<OrganizationSettings>> {
  if let Some(row) = client
    .select_one(ORGANIZATION_TABLE, "organization_id", &organization_id)
    .await?
  {
    return serde_json::from_value(row)
      .map(Some)
      .map_err(|e| eyre!("Failed to parse organization settings: {}", e));
  }

  let user = client.current_user().await?;
  debug!(organization_id = %organization_id, user_id = %user.id, "no settings row, trying user settings");
  let legacy = client
    .select_one(SETTINGS_TABLE, "user_id", &user.id)
    .await?
    .map(serde_json::from_value::<LegacyBranding>)
    .transpose()
    .map_err(|e| eyre!("Failed to parse user settings: {}", e))?;

  Ok(legacy.map(|branding| OrganizationSettings::from_legacy(&organization_id, branding)))
}

fn fetch_error(e: FetchError) -> color_eyre::Report {
  eyre!("{}", e)
}

/// Backend client with transparent caching support.
///
/// Each entity type gets its own cache layer; all of them share one
/// durable store and follow the same active identity.
pub struct CachedStudioClient {
  inner: BackendClient,
  organizations: Invalidator<OrganizationSettings>,
  profiles: Invalidator<Profile>,
  preferences: Invalidator<UserPreferences>,
}

impl CachedStudioClient {
  /// Create a new cached client from configuration and environment.
  pub fn new(config: &Config) -> Result<Self> {
    let inner = BackendClient::new(config)?;
    let store = open_store(&config.cache)?;
    Ok(Self::from_parts(
      inner,
      &config.cache,
      store,
      Arc::new(SystemClock),
    ))
  }

  pub fn from_parts(
    inner: BackendClient,
    config: &CacheConfig,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let ttls = &config.entities;

    let organizations = {
      let client = inner.clone();
      layer(
        move |organization_id: String| fetch_organization_settings(client.clone(), organization_id),
        config,
        &ttls.organization_settings,
        &store,
        &clock,
      )
    };

    let profiles = {
      let client = inner.clone();
      layer(
        move |user_id: String| {
          let client = client.clone();
          async move {
            let profile = match client.select_one(PROFILE_TABLE, "user_id", &user_id).await? {
              Some(row) => serde_json::from_value::<Profile>(row)
                .map_err(|e| eyre!("Failed to parse profile: {}", e))?,
              None => Profile::minimal(&user_id),
            };
            Ok::<_, color_eyre::Report>(Some(profile))
          }
        },
        config,
        &ttls.profile,
        &store,
        &clock,
      )
    };

    let preferences = {
      let client = inner.clone();
      layer(
        move |user_id: String| {
          let client = client.clone();
          async move {
            let prefs: UserPreferences = match client.select_one(SETTINGS_TABLE, "user_id", &user_id).await? {
              Some(row) => serde_json::from_value::<UserSettingsRow>(row)
                .map_err(|e| eyre!("Failed to parse user settings: {}", e))?
                .into(),
              None => UserPreferences::defaults(&user_id),
            };
            Ok::<_, color_eyre::Report>(Some(prefs))
          }
        },
        config,
        &ttls.user_preferences,
        &store,
        &clock,
      )
    };

    Self {
      inner,
      organizations: Invalidator::new(organizations),
      profiles: Invalidator::new(profiles),
      preferences: Invalidator::new(preferences),
    }
  }

  /// Apply realtime pushes from these channels to the matching layers.
  /// Listening follows the active identity; if one is already active this
  /// must run inside a Tokio runtime.
  pub fn with_realtime(
    self,
    organizations: Arc<dyn RealtimeChannel<OrganizationSettings>>,
    profiles: Arc<dyn RealtimeChannel<Profile>>,
    preferences: Arc<dyn RealtimeChannel<UserPreferences>>,
  ) -> Self {
    let Self {
      inner,
      organizations: organization_invalidator,
      profiles: profile_invalidator,
      preferences: preference_invalidator,
    } = self;
    Self {
      inner,
      organizations: organization_invalidator.with_channel(organizations),
      profiles: profile_invalidator.with_channel(profiles),
      preferences: preference_invalidator.with_channel(preferences),
    }
  }

  /// Whether every layer has a live realtime listener.
  pub fn is_listening(&self) -> bool {
    self.organizations.is_listening()
      && self.profiles.is_listening()
      && self.preferences.is_listening()
  }

  pub fn backend(&self) -> &BackendClient {
    &self.inner
  }

  pub fn organization_layer(&self) -> &Arc<CacheLayer<OrganizationSettings>> {
    self.organizations.layer()
  }

  pub fn profile_layer(&self) -> &Arc<CacheLayer<Profile>> {
    self.profiles.layer()
  }

  pub fn preferences_layer(&self) -> &Arc<CacheLayer<UserPreferences>> {
    self.preferences.layer()
  }

  /// Identity every layer is currently bound to.
  pub fn identity(&self) -> Option<Identity> {
    self.preferences.layer().identity()
  }

  /// Organization settings, cache-first. `None` when the row is missing.
  pub async fn organization_settings(
    &self,
    organization_id: &str,
  ) -> Result<CacheResult<Option<OrganizationSettings>>> {
    self
      .organization_layer()
      .fetch(organization_id)
      .await
      .map_err(fetch_error)
  }

  pub async fn refresh_organization_settings(
    &self,
    organization_id: &str,
  ) -> Result<CacheResult<Option<OrganizationSettings>>> {
    self
      .organizations
      .on_explicit_refresh(organization_id)
      .await
      .map_err(fetch_error)
  }

  /// Profile of `user_id`; a user without a profile row gets a minimal one.
  pub async fn profile(&self, user_id: &str) -> Result<CacheResult<Profile>> {
    let result = self
      .profile_layer()
      .fetch(user_id)
      .await
      .map_err(fetch_error)?;
    Ok(result.map(|profile| profile.unwrap_or_else(|| Profile::minimal(user_id))))
  }

  pub async fn refresh_profile(&self, user_id: &str) -> Result<CacheResult<Profile>> {
    let result = self
      .profiles
      .on_explicit_refresh(user_id)
      .await
      .map_err(fetch_error)?;
    Ok(result.map(|profile| profile.unwrap_or_else(|| Profile::minimal(user_id))))
  }

  /// Preferences of `user_id`, falling back to defaults.
  pub async fn preferences(&self, user_id: &str) -> Result<CacheResult<UserPreferences>> {
    let result = self
      .preferences_layer()
      .fetch(user_id)
      .await
      .map_err(fetch_error)?;
    Ok(result.map(|prefs| prefs.unwrap_or_else(|| UserPreferences::defaults(user_id))))
  }

  pub async fn refresh_preferences(&self, user_id: &str) -> Result<CacheResult<UserPreferences>> {
    let result = self
      .preferences
      .on_explicit_refresh(user_id)
      .await
      .map_err(fetch_error)?;
    Ok(result.map(|prefs| prefs.unwrap_or_else(|| UserPreferences::defaults(user_id))))
  }

  /// Write onboarding fields, showing them immediately.
  ///
  /// On failure the cached preferences go back to what the backend holds.
  pub async fn update_preferences(&self, user_id: &str, update: OnboardingUpdate) -> Result<()> {
    if update.is_empty() {
      return Ok(());
    }

    let current = self.preferences(user_id).await?.data;
    let tentative = current.with_update(&update);
    let client = self.inner.clone();

    self
      .preferences_layer()
      .update_optimistic(user_id, tentative, async move {
        client
          .update(SETTINGS_TABLE, "user_id", user_id, &update)
          .await
      })
      .await
  }

  /// Write profile columns, showing them immediately.
  pub async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> Result<()> {
    if update.is_empty() {
      return Ok(());
    }

    let tentative = self.profile(user_id).await?.data.with_update(&update);
    let client = self.inner.clone();

    self
      .profile_layer()
      .update_optimistic(user_id, tentative, async move {
        client.update(PROFILE_TABLE, "user_id", user_id, &update).await
      })
      .await
  }

  /// Write organization settings columns, showing them immediately.
  ///
  /// Settings have to exist already; this never creates the row.
  pub async fn update_organization_settings(
    &self,
    organization_id: &str,
    update: OrganizationSettingsUpdate,
  ) -> Result<()> {
    if update.is_empty() {
      return Ok(());
    }

    let current = self
      .organization_settings(organization_id)
      .await?
      .data
      .ok_or_else(|| eyre!("No settings for organization {}", organization_id))?;
    let tentative = current.with_update(&update);
    let client = self.inner.clone();

    self
      .organization_layer()
      .update_optimistic(organization_id, tentative, async move {
        client
          .update(ORGANIZATION_TABLE, "organization_id", organization_id, &update)
          .await
      })
      .await
  }

  /// Consumer handle for organization settings.
  pub fn organization_query(&self, organization_id: &str) -> EntityQuery<OrganizationSettings> {
    EntityQuery::mount(self.organization_layer().clone(), organization_id)
  }

  pub fn profile_query(&self, user_id: &str) -> EntityQuery<Profile> {
    EntityQuery::mount(self.profile_layer().clone(), user_id)
  }

  pub fn preferences_query(&self, user_id: &str) -> EntityQuery<UserPreferences> {
    EntityQuery::mount(self.preferences_layer().clone(), user_id)
  }

  /// Bind every layer to `next`, dropping data `next` does not own.
  pub fn switch_identity(&self, next: Option<Identity>) {
    let previous = self.identity();
    self
      .organizations
      .on_identity_change(previous.as_ref(), next.as_ref());
    self
      .profiles
      .on_identity_change(previous.as_ref(), next.as_ref());
    self
      .preferences
      .on_identity_change(previous.as_ref(), next.as_ref());
  }

  /// Sign out: every cached entity is forgotten, in memory and on disk.
  pub fn sign_out(&self) {
    info!("signing out");
    self.switch_identity(None);
  }

  /// Remove one entity type's entries, or everything when `entity` is `None`.
  pub fn clear(&self, entity: Option<&str>, key: Option<&str>) -> Result<()> {
    match entity {
      None => {
        self.organization_layer().clear(None);
        self.profile_layer().clear(None);
        self.preferences_layer().clear(None);
      }
      Some(name) if name == OrganizationSettings::entity_type() => {
        self.organization_layer().clear(key)
      }
      Some(name) if name == Profile::entity_type() => self.profile_layer().clear(key),
      Some(name) if name == UserPreferences::entity_type() => self.preferences_layer().clear(key),
      Some(other) => return Err(eyre!("Unknown entity type: {}", other)),
    }
    Ok(())
  }

  /// Release in-memory state; persisted records stay for the next run.
  pub fn dispose(&self) {
    self.organizations.dispose();
    self.profiles.dispose();
    self.preferences.dispose();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::types::OnboardingStage;
  use crate::cache::{ManualClock, MemoryStore};
  use crate::realtime::{ChangeEvent, ChangeFeed, ChangeNotification};

  /// Client pointed at a port nothing listens on, so every request fails.
  fn offline_client(store: Arc<dyn DurableStore>) -> CachedStudioClient {
    let inner = BackendClient::with_credentials("http://127.0.0.1:9", "anon", "token").unwrap();
    CachedStudioClient::from_parts(
      inner,
      &CacheConfig::default(),
      store,
      Arc::new(ManualClock::default()),
    )
  }

  #[test]
  fn test_open_store_without_persistence_is_noop() {
    let config = CacheConfig {
      persist: false,
      ..CacheConfig::default()
    };
    let store = open_store(&config).unwrap();
    store.set("studio:profile:user-1", "{}").unwrap();
    assert_eq!(store.get("studio:profile:user-1").unwrap(), None);
  }

  #[tokio::test]
  async fn test_cached_entities_are_served_offline() {
    let client = offline_client(Arc::new(MemoryStore::new()));
    client
      .profile_layer()
      .set("user-1", Some(Profile::minimal("user-1")));

    let profile = client.profile("user-1").await.unwrap();
    assert_eq!(profile.data.user_id, "user-1");

    assert!(client.organization_settings("org-1").await.is_err());
  }

  #[tokio::test]
  async fn test_failed_preferences_update_restores_previous() {
    let client = offline_client(Arc::new(MemoryStore::new()));
    let previous = UserPreferences::defaults("user-1");
    client
      .preferences_layer()
      .set("user-1", Some(previous.clone()));

    let update = OnboardingUpdate {
      onboarding_stage: Some(OnboardingStage::Completed),
      ..Default::default()
    };
    assert!(client.update_preferences("user-1", update).await.is_err());

    let cached = client.preferences("user-1").await.unwrap();
    assert_eq!(cached.data, previous);
  }

  #[tokio::test]
  async fn test_failed_profile_update_restores_previous() {
    let client = offline_client(Arc::new(MemoryStore::new()));
    let previous = Profile {
      full_name: Some("Ada".to_string()),
      ..Profile::minimal("user-1")
    };
    client.profile_layer().set("user-1", Some(previous.clone()));

    let update = ProfileUpdate {
      full_name: Some("Ada Lovelace".to_string()),
      ..Default::default()
    };
    assert!(client.update_profile("user-1", update).await.is_err());
    assert_eq!(client.profile("user-1").await.unwrap().data, previous);
  }

  #[tokio::test]
  async fn test_failed_organization_update_restores_previous() {
    let client = offline_client(Arc::new(MemoryStore::new()));
    let previous = OrganizationSettings::from_legacy("org-1", Default::default());
    client
      .organization_layer()
      .set("org-1", Some(previous.clone()));

    let update = OrganizationSettingsUpdate {
      primary_brand_color: Some("#000000".to_string()),
      ..Default::default()
    };
    assert!(client
      .update_organization_settings("org-1", update)
      .await
      .is_err());
    assert_eq!(
      client.organization_layer().peek("org-1").unwrap().value,
      Some(previous)
    );
  }

  #[tokio::test]
  async fn test_organization_update_needs_existing_settings() {
    let client = offline_client(Arc::new(MemoryStore::new()));
    client.organization_layer().set("org-1", None);

    let update = OrganizationSettingsUpdate {
      logo_url: Some("https://cdn.example.com/logo.png".to_string()),
      ..Default::default()
    };
    let err = client
      .update_organization_settings("org-1", update)
      .await
      .unwrap_err();
    assert!(err.to_string().contains("No settings"));
    assert_eq!(client.organization_layer().peek("org-1").unwrap().value, None);
  }

  #[tokio::test]
  async fn test_realtime_pushes_reach_the_layers() {
    let organizations = Arc::new(ChangeFeed::<OrganizationSettings>::new());
    let profiles = Arc::new(ChangeFeed::<Profile>::new());
    let preferences = Arc::new(ChangeFeed::<UserPreferences>::new());
    let client = offline_client(Arc::new(MemoryStore::new())).with_realtime(
      organizations.clone(),
      profiles.clone(),
      preferences.clone(),
    );
    let a = Identity::from("user-a");

    assert!(!client.is_listening());
    client.switch_identity(Some(a.clone()));
    assert!(client.is_listening());

    let pushed = Profile {
      full_name: Some("Live".to_string()),
      ..Profile::minimal("user-a")
    };
    profiles.publish(
      &a,
      ChangeEvent {
        key: "user-a".to_string(),
        notification: ChangeNotification::Full(Some(pushed.clone())),
      },
    );
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(client.profile("user-a").await.unwrap().data, pushed);

    client.sign_out();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(profiles.subscriber_count(&a), 0);
  }

  #[tokio::test]
  async fn test_empty_update_is_a_no_op() {
    let client = offline_client(Arc::new(MemoryStore::new()));
    client
      .update_preferences("user-1", OnboardingUpdate::default())
      .await
      .unwrap();
    assert!(client.preferences_layer().peek("user-1").is_none());
  }

  #[tokio::test]
  async fn test_switch_and_sign_out_follow_identity() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let client = offline_client(store.clone());
    let a = Identity::from("user-a");

    client.switch_identity(Some(a.clone()));
    client
      .profile_layer()
      .set("user-a", Some(Profile::minimal("user-a")));
    client.organization_layer().set("org-1", None);
    assert_eq!(client.identity(), Some(a));

    client.switch_identity(Some(Identity::from("user-b")));
    assert!(client.profile_layer().get("user-a").is_none());

    client.sign_out();
    assert_eq!(client.identity(), None);
    assert!(store.slots("studio:").unwrap().is_empty());
  }

  #[test]
  fn test_clear_rejects_unknown_entity() {
    let client = offline_client(Arc::new(MemoryStore::new()));
    client
      .preferences_layer()
      .set("user-1", Some(UserPreferences::defaults("user-1")));

    assert!(client.clear(Some("invoices"), None).is_err());
    client
      .clear(Some(UserPreferences::entity_type()), Some("user-1"))
      .unwrap();
    assert!(client.preferences_layer().peek("user-1").is_none());
  }
}
