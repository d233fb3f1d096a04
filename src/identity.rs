//! Identity scoping for cache entries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The signed-in user or active organization that cache entries belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for Identity {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

impl From<String> for Identity {
  fn from(s: String) -> Self {
    Self(s)
  }
}

/// Events emitted by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
  SignedIn(Identity),
  SignedOut(Identity),
  Switched { from: Identity, to: Identity },
}

impl IdentityEvent {
  /// The `(previous, next)` pair this event moves between.
  pub fn transition(&self) -> (Option<Identity>, Option<Identity>) {
    match self {
      Self::SignedIn(id) => (None, Some(id.clone())),
      Self::SignedOut(id) => (Some(id.clone()), None),
      Self::Switched { from, to } => (Some(from.clone()), Some(to.clone())),
    }
  }
}
