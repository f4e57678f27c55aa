//! Pluggable game rules consumed by the turn session engine.
//!
//! The session engine never interprets a game. It hands the opaque state blob,
//! the acting participant and the raw move to a [`RuleEngine`] and reacts only to
//! the returned [`MoveOutcome`]. Which engine a session uses is decided by the
//! [`GameType`] tag stored on the session.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::ops::RangeInclusive;
use thiserror::Error;

use crate::identity::IdentityKey;

mod nim;
mod tic_tac_toe;

pub use nim::Nim;
pub use tic_tac_toe::TicTacToe;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
  #[error("{0}")]
  IllegalMove(String),

  #[error("Malformed move: {0}")]
  MalformedMove(String),

  #[error("Corrupt game state: {0}")]
  CorruptState(String),

  #[error("This game needs between {min} and {max} participants, got {got}")]
  Seats { min: usize, max: usize, got: usize },
}

/// What the session should do after a move was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
  Continue(IdentityKey),
  Win(IdentityKey),
  Draw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveResult {
  pub state: Value,
  pub outcome: MoveOutcome,
}

/// Game-specific legality and outcome logic.
pub trait RuleEngine: Send + Sync {
  /// Allowed participant counts.
  fn seats(&self) -> RangeInclusive<usize>;

  /// Build the opening state. `participants[0]` moves first.
  fn initial_state(&self, participants: &[IdentityKey]) -> Result<Value, RuleError>;

  fn apply_move(&self, state: &Value, actor: &IdentityKey, mv: &Value) -> Result<MoveResult, RuleError>;

  /// Reset to an opening state for the same participants.
  fn restart(&self, state: &Value) -> Result<Value, RuleError>;

  /// Move chosen by a scripted participant, if the game supports one.
  fn scripted_move(&self, _state: &Value, _actor: &IdentityKey) -> Option<Value> {
    None
  }

  /// The part of the state every room member may see.
  fn public_view(&self, state: &Value) -> Value {
    state.clone()
  }

  fn check_seats(&self, count: usize) -> Result<(), RuleError> {
    let seats = self.seats();
    if seats.contains(&count) {
      Ok(())
    } else {
      Err(RuleError::Seats {
        min: *seats.start(),
        max: *seats.end(),
        got: count,
      })
    }
  }
}

/// Type tag selecting a rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameType {
  TicTacToe,
  Nim,
}

static TIC_TAC_TOE: TicTacToe = TicTacToe;
static NIM: Nim = Nim;

impl GameType {
  pub fn rules(self) -> &'static dyn RuleEngine {
    match self {
      GameType::TicTacToe => &TIC_TAC_TOE,
      GameType::Nim => &NIM,
    }
  }
}

pub(crate) fn decode_state<T: DeserializeOwned>(state: &Value) -> Result<T, RuleError> {
  serde_json::from_value(state.clone()).map_err(|e| RuleError::CorruptState(e.to_string()))
}

pub(crate) fn decode_move<T: DeserializeOwned>(mv: &Value) -> Result<T, RuleError> {
  serde_json::from_value(mv.clone()).map_err(|e| RuleError::MalformedMove(e.to_string()))
}

pub(crate) fn encode_state<T: Serialize>(state: &T) -> Result<Value, RuleError> {
  serde_json::to_value(state).map_err(|e| RuleError::CorruptState(e.to_string()))
}
