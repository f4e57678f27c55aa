//! Message archive collaborator: append-only chat history with bounded retention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
  error::ArchiveError,
  identity::{ConnectionId, UserId},
  room::RoomId,
};

/// A chat message as stored and replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedMessage {
  pub id: Uuid,
  pub room_id: RoomId,
  pub from: ConnectionId,
  pub user_id: Option<UserId>,
  pub display_name: String,
  pub text: String,
  pub sent_at: DateTime<Utc>,
}

impl ArchivedMessage {
  pub fn new(
    room_id: RoomId,
    from: ConnectionId,
    user_id: Option<UserId>,
    display_name: impl Into<String>,
    text: impl Into<String>,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      room_id,
      from,
      user_id,
      display_name: display_name.into(),
      text: text.into(),
      sent_at: Utc::now(),
    }
  }
}

#[async_trait]
pub trait MessageArchive: Send + Sync {
  async fn append(&self, room_id: &RoomId, message: ArchivedMessage) -> Result<(), ArchiveError>;

  /// Up to `limit` most recent messages, oldest first.
  async fn recent_history(&self, room_id: &RoomId, limit: usize) -> Result<Vec<ArchivedMessage>, ArchiveError>;

  /// Drop everything kept for a room that has closed.
  async fn forget(&self, room_id: &RoomId) -> Result<(), ArchiveError>;
}

/// Process-local archive keeping the last `retention` messages per room.
pub struct InMemoryArchive {
  rooms: RwLock<HashMap<RoomId, VecDeque<ArchivedMessage>>>,
  retention: usize,
}

impl InMemoryArchive {
  pub fn new(retention: usize) -> Self {
    Self {
      rooms: RwLock::new(HashMap::new()),
      retention,
    }
  }

  /// Number of rooms with retained history.
  pub async fn room_count(&self) -> usize {
    self.rooms.read().await.len()
  }
}

impl Default for InMemoryArchive {
  fn default() -> Self {
    Self::new(100)
  }
}

#[async_trait]
impl MessageArchive for InMemoryArchive {
  async fn append(&self, room_id: &RoomId, message: ArchivedMessage) -> Result<(), ArchiveError> {
    if self.retention == 0 {
      return Ok(());
    }
    let mut rooms = self.rooms.write().await;
    let history = rooms.entry(room_id.clone()).or_default();
    history.push_back(message);
    while history.len() > self.retention {
      history.pop_front();
    }
    Ok(())
  }

  async fn recent_history(&self, room_id: &RoomId, limit: usize) -> Result<Vec<ArchivedMessage>, ArchiveError> {
    let rooms = self.rooms.read().await;
    let Some(history) = rooms.get(room_id) else {
      return Ok(Vec::new());
    };
    let skip = history.len().saturating_sub(limit);
    Ok(history.iter().skip(skip).cloned().collect())
  }

  async fn forget(&self, room_id: &RoomId) -> Result<(), ArchiveError> {
    self.rooms.write().await.remove(room_id);
    Ok(())
  }
}
