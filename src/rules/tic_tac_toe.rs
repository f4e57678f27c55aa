use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::RangeInclusive;

use super::{decode_move, decode_state, encode_state, MoveOutcome, MoveResult, RuleEngine, RuleError};
use crate::identity::IdentityKey;

const LINES: [[usize; 3]; 8] = [
  [0, 1, 2],
  [3, 4, 5],
  [6, 7, 8],
  [0, 3, 6],
  [1, 4, 7],
  [2, 5, 8],
  [0, 4, 8],
  [2, 4, 6],
];

/// Classic 3x3 noughts and crosses. Participant 0 plays `X`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TicTacToe;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Board {
  players: [IdentityKey; 2],
  cells: [Option<usize>; 9],
  next: usize,
}

#[derive(Debug, Deserialize)]
struct Place {
  cell: usize,
}

impl Board {
  fn winner(&self) -> Option<usize> {
    LINES.iter().find_map(|line| match line.map(|i| self.cells[i]) {
      [Some(a), Some(b), Some(c)] if a == b && b == c => Some(a),
      _ => None,
    })
  }

  fn is_full(&self) -> bool {
    self.cells.iter().all(Option::is_some)
  }

  fn free_cells(&self) -> impl Iterator<Item = usize> + '_ {
    (0..9).filter(|&i| self.cells[i].is_none())
  }

  /// Cell that would complete a line for `seat`, if any.
  fn completing_cell(&self, seat: usize) -> Option<usize> {
    self.free_cells().find(|&cell| {
      let mut probe = self.clone();
      probe.cells[cell] = Some(seat);
      probe.winner() == Some(seat)
    })
  }
}

impl RuleEngine for TicTacToe {
  fn seats(&self) -> RangeInclusive<usize> {
    2..=2
  }

  fn initial_state(&self, participants: &[IdentityKey]) -> Result<Value, RuleError> {
    self.check_seats(participants.len())?;
    encode_state(&Board {
      players: [participants[0].clone(), participants[1].clone()],
      cells: [None; 9],
      next: 0,
    })
  }

  fn apply_move(&self, state: &Value, actor: &IdentityKey, mv: &Value) -> Result<MoveResult, RuleError> {
    let mut board: Board = decode_state(state)?;
    let Place { cell } = decode_move(mv)?;

    if &board.players[board.next] != actor {
      return Err(RuleError::IllegalMove("not this player's mark".into()));
    }
    if cell >= 9 {
      return Err(RuleError::IllegalMove(format!("cell {cell} is off the board")));
    }
    if board.cells[cell].is_some() {
      return Err(RuleError::IllegalMove(format!("cell {cell} is already taken")));
    }

    let seat = board.next;
    board.cells[cell] = Some(seat);
    board.next = 1 - seat;

    let outcome = if board.winner() == Some(seat) {
      MoveOutcome::Win(actor.clone())
    } else if board.is_full() {
      MoveOutcome::Draw
    } else {
      MoveOutcome::Continue(board.players[board.next].clone())
    };

    Ok(MoveResult {
      state: encode_state(&board)?,
      outcome,
    })
  }

  fn restart(&self, state: &Value) -> Result<Value, RuleError> {
    let mut board: Board = decode_state(state)?;
    board.cells = [None; 9];
    board.next = 0;
    encode_state(&board)
  }

  /// Win if possible, otherwise block, otherwise prefer the centre, then the first free cell.
  fn scripted_move(&self, state: &Value, actor: &IdentityKey) -> Option<Value> {
    let board: Board = decode_state(state).ok()?;
    let seat = board.players.iter().position(|p| p == actor)?;
    let cell = board
      .completing_cell(seat)
      .or_else(|| board.completing_cell(1 - seat))
      .or_else(|| board.cells[4].is_none().then_some(4))
      .or_else(|| board.free_cells().next())?;
    Some(serde_json::json!({ "cell": cell }))
  }
}
