use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::Cacheable;

pub const DEFAULT_BRAND_COLOR: &str = "#1EB29F";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_DATE_FORMAT: &str = "DD/MM/YYYY";
pub const DEFAULT_TIME_FORMAT: &str = "12-hour";
/// Locale given to settings rebuilt from legacy per-user columns.
pub const LEGACY_LOCALE: &str = "tr";

/// Tax details attached to an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxProfile {
  pub legal_entity_type: LegalEntityType,
  pub company_name: Option<String>,
  pub tax_office: Option<String>,
  pub tax_number: Option<String>,
  pub billing_address: Option<String>,
  pub default_vat_rate: f64,
  pub default_vat_mode: VatMode,
  pub prices_include_vat: bool,
  pub vat_exempt: bool,
}

impl Default for TaxProfile {
  fn default() -> Self {
    Self {
      legal_entity_type: LegalEntityType::Freelance,
      company_name: None,
      tax_office: None,
      tax_number: None,
      billing_address: None,
      default_vat_rate: 0.0,
      default_vat_mode: VatMode::Exclusive,
      prices_include_vat: false,
      vat_exempt: true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegalEntityType {
  Individual,
  Company,
  Freelance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatMode {
  Inclusive,
  Exclusive,
}

/// One row of `organization_settings`, keyed by organization id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationSettings {
  pub organization_id: String,
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub photography_business_name: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub logo_url: Option<String>,
  #[serde(default)]
  pub primary_brand_color: Option<String>,
  #[serde(default)]
  pub date_format: Option<String>,
  #[serde(default)]
  pub time_format: Option<String>,
  #[serde(default)]
  pub timezone: Option<String>,
  #[serde(default, deserialize_with = "null_as_default")]
  pub preferred_project_types: Vec<String>,
  #[serde(default, deserialize_with = "null_as_default")]
  pub service_focus: Vec<String>,
  #[serde(default)]
  pub profile_intake_completed_at: Option<String>,
  #[serde(default)]
  pub seed_sample_data_onboarding: bool,
  #[serde(default)]
  pub preferred_locale: Option<String>,
  #[serde(default)]
  pub social_channels: Option<Map<String, Value>>,
  #[serde(default)]
  pub tax_profile: Option<TaxProfile>,
}

impl OrganizationSettings {
  pub fn brand_color(&self) -> &str {
    self
      .primary_brand_color
      .as_deref()
      .unwrap_or(DEFAULT_BRAND_COLOR)
  }

  pub fn tax_profile(&self) -> TaxProfile {
    self.tax_profile.clone().unwrap_or_default()
  }

  /// Settings for an organization that has no row yet, built from the
  /// branding columns older accounts kept in `user_settings`.
  pub fn from_legacy(organization_id: &str, legacy: LegacyBranding) -> Self {
    Self {
      organization_id: organization_id.to_string(),
      id: None,
      photography_business_name: legacy.photography_business_name,
      email: None,
      phone: None,
      logo_url: legacy.logo_url,
      primary_brand_color: legacy.primary_brand_color,
      date_format: legacy.date_format,
      time_format: None,
      timezone: None,
      preferred_project_types: Vec::new(),
      service_focus: Vec::new(),
      profile_intake_completed_at: None,
      seed_sample_data_onboarding: false,
      preferred_locale: Some(LEGACY_LOCALE.to_string()),
      social_channels: Some(Map::new()),
      tax_profile: None,
    }
  }

  pub fn with_update(&self, update: &OrganizationSettingsUpdate) -> Self {
    let mut next = self.clone();
    let fields = [
      (&mut next.photography_business_name, &update.photography_business_name),
      (&mut next.email, &update.email),
      (&mut next.phone, &update.phone),
      (&mut next.logo_url, &update.logo_url),
      (&mut next.primary_brand_color, &update.primary_brand_color),
      (&mut next.date_format, &update.date_format),
      (&mut next.time_format, &update.time_format),
      (&mut next.timezone, &update.timezone),
      (&mut next.preferred_locale, &update.preferred_locale),
    ];
    for (field, value) in fields {
      if let Some(value) = value {
        *field = Some(value.clone());
      }
    }
    if let Some(tax) = &update.tax_profile {
      next.tax_profile = Some(tax.clone());
    }
    next
  }
}

/// Branding columns of a `user_settings` row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyBranding {
  #[serde(default)]
  pub photography_business_name: Option<String>,
  #[serde(default)]
  pub logo_url: Option<String>,
  #[serde(default)]
  pub primary_brand_color: Option<String>,
  #[serde(default)]
  pub date_format: Option<String>,
}

/// Writable columns of `organization_settings`. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrganizationSettingsUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub photography_business_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub logo_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub primary_brand_color: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub date_format: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub time_format: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timezone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub preferred_locale: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tax_profile: Option<TaxProfile>,
}

impl OrganizationSettingsUpdate {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}

impl Cacheable for OrganizationSettings {
  fn entity_type() -> &'static str {
    "organization_settings"
  }
}

/// One row of `profiles`, keyed by user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  pub user_id: String,
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub full_name: Option<String>,
  #[serde(default)]
  pub phone_number: Option<String>,
  #[serde(default)]
  pub profile_photo_url: Option<String>,
}

impl Profile {
  /// What a user without a profile row looks like.
  pub fn minimal(user_id: &str) -> Self {
    Self {
      user_id: user_id.to_string(),
      id: None,
      full_name: None,
      phone_number: None,
      profile_photo_url: None,
    }
  }

  pub fn with_update(&self, update: &ProfileUpdate) -> Self {
    let mut next = self.clone();
    if let Some(name) = &update.full_name {
      next.full_name = Some(name.clone());
    }
    if let Some(phone) = &update.phone_number {
      next.phone_number = Some(phone.clone());
    }
    if let Some(url) = &update.profile_photo_url {
      next.profile_photo_url = Some(url.clone());
    }
    next
  }
}

/// Writable columns of `profiles`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub full_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone_number: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub profile_photo_url: Option<String>,
}

impl ProfileUpdate {
  pub fn is_empty(&self) -> bool {
    self.full_name.is_none() && self.phone_number.is_none() && self.profile_photo_url.is_none()
  }
}

impl Cacheable for Profile {
  fn entity_type() -> &'static str {
    "profile"
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStage {
  #[default]
  NotStarted,
  ModalShown,
  InProgress,
  Completed,
  Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
  NotSeen,
  Snoozed,
  Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageVideo {
  pub status: VideoStatus,
  #[serde(default)]
  pub last_prompted_at: Option<String>,
}

/// Raw `user_settings` row as the REST API returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct UserSettingsRow {
  pub user_id: String,
  #[serde(default)]
  pub onboarding_stage: Option<OnboardingStage>,
  #[serde(default)]
  pub current_onboarding_step: Option<u32>,
  #[serde(default)]
  pub welcome_modal_shown: Option<bool>,
  #[serde(default)]
  pub page_videos: Option<std::collections::BTreeMap<String, PageVideo>>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Per-user preferences, keyed by user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
  pub user_id: String,
  pub onboarding_stage: OnboardingStage,
  pub current_onboarding_step: u32,
  pub welcome_modal_shown: bool,
  #[serde(default)]
  pub page_videos: std::collections::BTreeMap<String, PageVideo>,
  pub primary_brand_color: String,
  pub timezone: String,
  pub date_format: String,
  pub time_format: String,
  #[serde(default)]
  pub updated_at: Option<String>,
}

impl UserPreferences {
  /// Preferences of a user who has never saved any.
  pub fn defaults(user_id: &str) -> Self {
    Self {
      user_id: user_id.to_string(),
      onboarding_stage: OnboardingStage::NotStarted,
      current_onboarding_step: 1,
      welcome_modal_shown: false,
      page_videos: Default::default(),
      primary_brand_color: DEFAULT_BRAND_COLOR.to_string(),
      timezone: DEFAULT_TIMEZONE.to_string(),
      date_format: DEFAULT_DATE_FORMAT.to_string(),
      time_format: DEFAULT_TIME_FORMAT.to_string(),
      updated_at: None,
    }
  }

  /// Apply an onboarding change on top of these preferences.
  pub fn with_update(&self, update: &OnboardingUpdate) -> Self {
    let mut next = self.clone();
    if let Some(stage) = update.onboarding_stage {
      next.onboarding_stage = stage;
    }
    if let Some(step) = update.current_onboarding_step {
      next.current_onboarding_step = step;
    }
    if let Some(shown) = update.welcome_modal_shown {
      next.welcome_modal_shown = shown;
    }
    next
  }
}

impl From<UserSettingsRow> for UserPreferences {
  fn from(row: UserSettingsRow) -> Self {
    let mut prefs = Self::defaults(&row.user_id);
    prefs.onboarding_stage = row.onboarding_stage.unwrap_or_default();
    prefs.current_onboarding_step = row.current_onboarding_step.filter(|s| *s > 0).unwrap_or(1);
    prefs.welcome_modal_shown = row.welcome_modal_shown.unwrap_or(false);
    prefs.page_videos = row.page_videos.unwrap_or_default();
    prefs.updated_at = row.updated_at;
    prefs
  }
}

impl Cacheable for UserPreferences {
  fn entity_type() -> &'static str {
    "user_preferences"
  }
}

/// The onboarding columns of `user_settings`; the only ones this client
/// ever writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OnboardingUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub onboarding_stage: Option<OnboardingStage>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub current_onboarding_step: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub welcome_modal_shown: Option<bool>,
}

impl OnboardingUpdate {
  pub fn is_empty(&self) -> bool {
    self.onboarding_stage.is_none()
      && self.current_onboarding_step.is_none()
      && self.welcome_modal_shown.is_none()
  }
}

/// The signed-in user as reported by the auth endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
  pub id: String,
  #[serde(default)]
  pub email: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: serde::Deserializer<'de>,
  T: Default + Deserialize<'de>,
{
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
