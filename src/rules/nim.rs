use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::RangeInclusive;

use super::{decode_move, decode_state, encode_state, MoveOutcome, MoveResult, RuleEngine, RuleError};
use crate::identity::IdentityKey;

const OPENING_HEAPS: [u32; 3] = [3, 4, 5];

/// Normal-play Nim: take any number from one heap, taking the last object wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nim;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heaps {
  players: [IdentityKey; 2],
  heaps: Vec<u32>,
  next: usize,
}

#[derive(Debug, Deserialize)]
struct Take {
  heap: usize,
  take: u32,
}

impl RuleEngine for Nim {
  fn seats(&self) -> RangeInclusive<usize> {
    2..=2
  }

  fn initial_state(&self, participants: &[IdentityKey]) -> Result<Value, RuleError> {
    self.check_seats(participants.len())?;
    encode_state(&Heaps {
      players: [participants[0].clone(), participants[1].clone()],
      heaps: OPENING_HEAPS.to_vec(),
      next: 0,
    })
  }

  fn apply_move(&self, state: &Value, actor: &IdentityKey, mv: &Value) -> Result<MoveResult, RuleError> {
    let mut game: Heaps = decode_state(state)?;
    let Take { heap, take } = decode_move(mv)?;

    if &game.players[game.next] != actor {
      return Err(RuleError::IllegalMove("not this player's turn".into()));
    }
    let Some(size) = game.heaps.get_mut(heap) else {
      return Err(RuleError::IllegalMove(format!("no heap {heap}")));
    };
    if take == 0 || take > *size {
      return Err(RuleError::IllegalMove(format!(
        "cannot take {take} from a heap of {size}"
      )));
    }
    *size -= take;

    let seat = game.next;
    game.next = 1 - seat;
    let outcome = if game.heaps.iter().all(|&h| h == 0) {
      MoveOutcome::Win(actor.clone())
    } else {
      MoveOutcome::Continue(game.players[game.next].clone())
    };

    Ok(MoveResult {
      state: encode_state(&game)?,
      outcome,
    })
  }

  fn restart(&self, state: &Value) -> Result<Value, RuleError> {
    let mut game: Heaps = decode_state(state)?;
    game.heaps = OPENING_HEAPS.to_vec();
    game.next = 0;
    encode_state(&game)
  }

  /// Move to a zero nim-sum when possible, otherwise take one from the largest heap.
  fn scripted_move(&self, state: &Value, _actor: &IdentityKey) -> Option<Value> {
    let game: Heaps = decode_state(state).ok()?;
    let nim_sum = game.heaps.iter().fold(0, |acc, &h| acc ^ h);

    let winning = (nim_sum != 0)
      .then(|| {
        game
          .heaps
          .iter()
          .enumerate()
          .find(|&(_, &h)| h ^ nim_sum < h)
          .map(|(i, &h)| (i, h - (h ^ nim_sum)))
      })
      .flatten();

    let (heap, take) = winning.or_else(|| {
      game
        .heaps
        .iter()
        .enumerate()
        .filter(|&(_, &h)| h > 0)
        .max_by_key(|&(_, &h)| h)
        .map(|(i, _)| (i, 1))
    })?;

    Some(serde_json::json!({ "heap": heap, "take": take }))
  }
}
