use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::backend::types::AuthUser;
use crate::config::Config;

/// REST client for the managed backend.
#[derive(Clone)]
pub struct BackendClient {
  http: reqwest::Client,
  base: Url,
}

impl BackendClient {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let token = Config::get_access_token()?;
    Self::with_credentials(&config.backend.url, &api_key, &token)
  }

  pub fn with_credentials(url: &str, api_key: &str, access_token: &str) -> Result<Self> {
    let mut base = Url::parse(url).map_err(|e| eyre!("Invalid backend url {}: {}", url, e))?;
    // Relative joins replace the last segment unless the path ends in a slash
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let mut headers = HeaderMap::new();
    headers.insert(
      "apikey",
      HeaderValue::from_str(api_key).map_err(|e| eyre!("Invalid API key: {}", e))?,
    );
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&format!("Bearer {}", access_token))
        .map_err(|e| eyre!("Invalid access token: {}", e))?,
    );

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base })
  }

  /// `/rest/v1/{table}?{column}=eq.{value}` plus any extra query pairs.
  pub fn table_url(&self, table: &str, column: &str, value: &str) -> Result<Url> {
    let mut url = self
      .base
      .join(&format!("rest/v1/{}", table))
      .map_err(|e| eyre!("Invalid table {}: {}", table, e))?;
    url
      .query_pairs_mut()
      .append_pair(column, &format!("eq.{}", value));
    Ok(url)
  }

  /// The single row of `table` where `column` equals `value`, if any.
  pub async fn select_one(&self, table: &str, column: &str, value: &str) -> Result<Option<Value>> {
    let mut url = self.table_url(table, column, value)?;
    url
      .query_pairs_mut()
      .append_pair("select", "*")
      .append_pair("limit", "1");

    debug!(table, column, value, "select");
    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to query {}: {}", table, e))?
      .error_for_status()
      .map_err(|e| eyre!("Query on {} failed: {}", table, e))?;

    let rows: Vec<Value> = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} rows: {}", table, e))?;

    Ok(rows.into_iter().next())
  }

  /// Patch the rows of `table` where `column` equals `value`.
  pub async fn update<B: Serialize + ?Sized>(
    &self,
    table: &str,
    column: &str,
    value: &str,
    body: &B,
  ) -> Result<()> {
    let url = self.table_url(table, column, value)?;

    debug!(table, column, value, "update");
    self
      .http
      .patch(url)
      .header("Prefer", "return=minimal")
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to update {}: {}", table, e))?
      .error_for_status()
      .map_err(|e| eyre!("Update on {} failed: {}", table, e))?;

    Ok(())
  }

  /// Who the access token belongs to.
  pub async fn current_user(&self) -> Result<AuthUser> {
    let url = self
      .base
      .join("auth/v1/user")
      .map_err(|e| eyre!("Invalid auth url: {}", e))?;

    self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to get current user: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("Auth lookup failed: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse current user: {}", e))
  }
}
