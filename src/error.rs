use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::ConnectionId;
use crate::rules::RuleError;

/// Failures raised by the room, mesh and session handlers.
///
/// Every variant is scoped to one room, one link or one request; none of them
/// is fatal to the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
  #[error("Room '{0}' does not exist")]
  RoomNotFound(String),

  #[error("Room '{room_id}' is full (capacity {capacity})")]
  RoomFull { room_id: String, capacity: usize },

  #[error("Only the room host may do that")]
  NotHost,

  #[error("It is not your turn")]
  StaleActor,

  #[error("Signal target {0} is no longer in the room")]
  NegotiationTargetGone(ConnectionId),

  #[error("Local media unavailable: {0}")]
  LocalMediaUnavailable(String),

  #[error("You are not in a room")]
  NotInRoom,

  #[error("A session is already running in this room")]
  SessionActive,

  #[error("No session in this room")]
  NoSession,

  #[error("The session has already finished")]
  SessionFinished,

  #[error("Illegal move: {0}")]
  IllegalMove(String),

  #[error("Invalid participants: {0}")]
  InvalidParticipants(String),

  #[error("Identity does not match the authenticated user")]
  IdentityMismatch,

  #[error("This action requires a registered user id")]
  IdentityRequired,
}

/// Wire-level error code sent alongside error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
  RoomNotFound,
  RoomFull,
  NotHost,
  StaleActor,
  NegotiationTargetGone,
  LocalMediaUnavailable,
  NotInRoom,
  SessionActive,
  NoSession,
  SessionFinished,
  IllegalMove,
  InvalidParticipants,
  IdentityMismatch,
  IdentityRequired,
  RateLimited,
  BadMessage,
}

impl CoreError {
  pub fn code(&self) -> ErrorCode {
    match self {
      CoreError::RoomNotFound(_) => ErrorCode::RoomNotFound,
      CoreError::RoomFull { .. } => ErrorCode::RoomFull,
      CoreError::NotHost => ErrorCode::NotHost,
      CoreError::StaleActor => ErrorCode::StaleActor,
      CoreError::NegotiationTargetGone(_) => ErrorCode::NegotiationTargetGone,
      CoreError::LocalMediaUnavailable(_) => ErrorCode::LocalMediaUnavailable,
      CoreError::NotInRoom => ErrorCode::NotInRoom,
      CoreError::SessionActive => ErrorCode::SessionActive,
      CoreError::NoSession => ErrorCode::NoSession,
      CoreError::SessionFinished => ErrorCode::SessionFinished,
      CoreError::IllegalMove(_) => ErrorCode::IllegalMove,
      CoreError::InvalidParticipants(_) => ErrorCode::InvalidParticipants,
      CoreError::IdentityMismatch => ErrorCode::IdentityMismatch,
      CoreError::IdentityRequired => ErrorCode::IdentityRequired,
    }
  }

  /// Benign races that are logged and dropped instead of reported.
  pub fn is_silent(&self) -> bool {
    matches!(
      self,
      CoreError::StaleActor | CoreError::NegotiationTargetGone(_) | CoreError::SessionFinished
    )
  }
}

impl From<RuleError> for CoreError {
  fn from(err: RuleError) -> Self {
    match err {
      RuleError::Seats { .. } => CoreError::InvalidParticipants(err.to_string()),
      other => CoreError::IllegalMove(other.to_string()),
    }
  }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
  #[error("Archive unavailable: {0}")]
  Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
  #[error("Message too large: {size} bytes (max {max})")]
  TooLarge { size: usize, max: usize },

  #[error("Temporarily banned for sending too many messages")]
  Banned,

  #[error("Rate limit exceeded: max {max} messages per {window_ms} ms")]
  Exceeded { max: u32, window_ms: u128 },
}
