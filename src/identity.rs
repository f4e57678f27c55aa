//! Identity types and the registry that maps a durable user to its live connection.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

/// Ephemeral transport handle. Unique per connect and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
  /// Allocate a fresh id for a new transport connection.
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ConnectionId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

impl From<String> for ConnectionId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

/// Durable user identifier, stable across reconnects (possibly a provisional guest id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for UserId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for UserId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

impl From<String> for UserId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

/// A user as vouched for by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalUser {
  pub user_id: UserId,
  pub display_name: String,
}

impl LogicalUser {
  pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      display_name: display_name.into(),
    }
  }
}

/// Key used to count distinct identities and to address session participants.
///
/// Members with a user id are keyed by it, guests by their connection id.
/// `Bot` only ever appears as a scripted session participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum IdentityKey {
  User(UserId),
  Guest(ConnectionId),
  Bot(String),
}

impl IdentityKey {
  pub fn for_member(user_id: Option<&UserId>, connection_id: &ConnectionId) -> Self {
    match user_id {
      Some(user_id) => IdentityKey::User(user_id.clone()),
      None => IdentityKey::Guest(connection_id.clone()),
    }
  }

  pub fn is_bot(&self) -> bool {
    matches!(self, IdentityKey::Bot(_))
  }
}

impl fmt::Display for IdentityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      IdentityKey::User(id) => write!(f, "user:{id}"),
      IdentityKey::Guest(id) => write!(f, "guest:{id}"),
      IdentityKey::Bot(name) => write!(f, "bot:{name}"),
    }
  }
}

/// Maps each user id to the connection that most recently registered it.
///
/// Last registration wins. Entries are never removed; a stale mapping simply
/// resolves to a connection that no longer accepts deliveries.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
  sessions: HashMap<UserId, ConnectionId>,
}

impl IdentityRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Point `user_id` at `connection_id`, returning the mapping it replaced.
  pub fn register(&mut self, user_id: UserId, connection_id: ConnectionId) -> Option<ConnectionId> {
    let previous = self.sessions.insert(user_id.clone(), connection_id.clone());
    if let Some(ref old) = previous {
      if old != &connection_id {
        tracing::debug!("Identity {} moved from {} to {}", user_id, old, connection_id);
      }
    }
    previous
  }

  /// Best-effort lookup of the connection currently serving `user_id`.
  pub fn resolve(&self, user_id: &UserId) -> Option<&ConnectionId> {
    self.sessions.get(user_id)
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn last_registration_wins() {
    let mut registry = IdentityRegistry::new();
    assert!(registry.register("alice".into(), "c1".into()).is_none());
    assert_eq!(
      registry.register("alice".into(), "c2".into()),
      Some(ConnectionId::from("c1"))
    );
    assert_eq!(registry.resolve(&"alice".into()), Some(&ConnectionId::from("c2")));
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn unknown_user_resolves_to_nothing() {
    let registry = IdentityRegistry::new();
    assert!(registry.resolve(&"ghost".into()).is_none());
    assert!(registry.is_empty());
  }

  #[test]
  fn guests_are_keyed_by_connection() {
    let conn = ConnectionId::from("c9");
    assert_eq!(IdentityKey::for_member(None, &conn), IdentityKey::Guest(conn.clone()));
    assert_eq!(
      IdentityKey::for_member(Some(&"bob".into()), &conn),
      IdentityKey::User("bob".into())
    );
  }

  #[test]
  fn generated_connection_ids_are_unique() {
    assert_ne!(ConnectionId::generate(), ConnectionId::generate());
  }

  #[test]
  fn identity_key_wire_shape() {
    let json = serde_json::to_value(IdentityKey::User("u1".into())).unwrap();
    assert_eq!(json, serde_json::json!({ "kind": "user", "id": "u1" }));
  }
}
