//! Managed backend access: REST client, entity types and the cached client.

mod cached_client;
mod client;
mod types;

pub use cached_client::{open_store, CachedStudioClient};
pub use client::BackendClient;
pub use types::{
  AuthUser, LegacyBranding, LegalEntityType, OnboardingStage, OnboardingUpdate,
  OrganizationSettings, OrganizationSettingsUpdate, PageVideo, Profile, ProfileUpdate, TaxProfile,
  UserPreferences, UserSettingsRow, VatMode, VideoStatus, DEFAULT_BRAND_COLOR,
  DEFAULT_DATE_FORMAT, DEFAULT_TIMEZONE, DEFAULT_TIME_FORMAT, LEGACY_LOCALE,
};
