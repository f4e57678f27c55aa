//! Turn session engine.
//!
//! A [`TurnSession`] runs one game inside a room. It owns the rule engine's
//! opaque state, the ordered participants, whose turn it is and at most one
//! outstanding turn timer. Every transition that changes whose turn it is
//! cancels the old timer and arms the next one in the same step, so a late
//! firing of a superseded timer never matches the session's current timer id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::{
  error::CoreError,
  identity::{ConnectionId, IdentityKey},
  room::{Member, RoomId},
  rules::{GameType, MoveOutcome, RuleEngine, RuleError},
  timer::{TimerHandle, TimerId, TimerKind, TimerScheduler},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
  Idle,
  Active,
  Ended,
  TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum SessionOutcome {
  Winner { winner: IdentityKey },
  Draw,
  Forfeit {
    forfeited: IdentityKey,
    winner: Option<IdentityKey>,
  },
}

/// A seat in a session. Bots have no connection and never get a turn timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
  pub key: IdentityKey,
  pub display_name: String,
  pub connection_id: Option<ConnectionId>,
}

impl Participant {
  pub fn from_member(member: &Member) -> Self {
    Self {
      key: member.identity_key(),
      display_name: member.display_name.clone(),
      connection_id: Some(member.connection_id.clone()),
    }
  }

  pub fn bot(name: impl Into<String>) -> Self {
    let name = name.into();
    Self {
      key: IdentityKey::Bot(name.clone()),
      display_name: name,
      connection_id: None,
    }
  }

  pub fn is_human(&self) -> bool {
    !self.key.is_bot()
  }
}

/// Snapshot of a session that is safe to broadcast to the whole room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSessionState {
  pub game_type: GameType,
  pub phase: SessionPhase,
  pub participants: Vec<Participant>,
  pub current_actor: Option<IdentityKey>,
  pub board: Value,
  pub outcome: Option<SessionOutcome>,
  pub moves: u32,
  pub turn_timeout_ms: u64,
  pub last_move_at: Option<DateTime<Utc>>,
}

struct TurnTimer {
  handle: TimerHandle,
  actor: IdentityKey,
}

pub struct TurnSession {
  room_id: RoomId,
  game_type: GameType,
  state: Value,
  participants: Vec<Participant>,
  turn: usize,
  timer: Option<TurnTimer>,
  phase: SessionPhase,
  outcome: Option<SessionOutcome>,
  turn_timeout: Duration,
  moves: u32,
  last_move_at: Option<DateTime<Utc>>,
}

impl TurnSession {
  /// Seat the participants. The session stays `Idle` until [`TurnSession::start`].
  pub fn new(
    room_id: RoomId,
    game_type: GameType,
    participants: Vec<Participant>,
    turn_timeout: Duration,
  ) -> Result<Self, CoreError> {
    game_type.rules().check_seats(participants.len())?;
    if !participants.iter().any(Participant::is_human) {
      return Err(CoreError::InvalidParticipants(
        "at least one participant must be a room member".into(),
      ));
    }
    for (i, p) in participants.iter().enumerate() {
      if participants[..i].iter().any(|q| q.key == p.key) {
        return Err(CoreError::InvalidParticipants(format!("{} is seated twice", p.key)));
      }
    }

    Ok(Self {
      room_id,
      game_type,
      state: Value::Null,
      participants,
      turn: 0,
      timer: None,
      phase: SessionPhase::Idle,
      outcome: None,
      turn_timeout,
      moves: 0,
      last_move_at: None,
    })
  }

  pub fn start(&mut self, timers: &dyn TimerScheduler) -> Result<(), CoreError> {
    if self.phase != SessionPhase::Idle {
      return Err(CoreError::SessionActive);
    }
    self.state = self.rules().initial_state(&self.keys())?;
    self.begin(timers);
    tracing::info!(
      "Session {:?} started in room {} with {} participants",
      self.game_type,
      self.room_id,
      self.participants.len()
    );
    Ok(())
  }

  /// Apply a move from `actor`.
  ///
  /// Moves from anyone but the current actor fail with [`CoreError::StaleActor`]
  /// and change nothing; so do moves after the session finished.
  pub fn submit_move(
    &mut self,
    actor: &IdentityKey,
    mv: &Value,
    timers: &dyn TimerScheduler,
  ) -> Result<(), CoreError> {
    match self.phase {
      SessionPhase::Active => {}
      SessionPhase::Idle => return Err(CoreError::NoSession),
      SessionPhase::Ended | SessionPhase::TimedOut => return Err(CoreError::SessionFinished),
    }
    if &self.participants[self.turn].key != actor {
      return Err(CoreError::StaleActor);
    }

    self.step(actor, mv)?;
    self.cancel_timer();
    self.advance(timers);
    Ok(())
  }

  /// React to a fired turn timer. Returns whether the session changed.
  pub fn on_timeout(&mut self, timer: TimerId) -> bool {
    if self.phase != SessionPhase::Active {
      return false;
    }
    match self.timer.take() {
      Some(armed) if armed.handle.id() == timer => {
        tracing::info!("Turn of {} in room {} timed out", armed.actor, self.room_id);
        self.forfeit(armed.actor, SessionPhase::TimedOut);
        true
      }
      other => {
        self.timer = other;
        false
      }
    }
  }

  /// Remap participants onto the room's current members and play again from the top.
  pub fn restart(&mut self, members: &[Member], timers: &dyn TimerScheduler) -> Result<(), CoreError> {
    let missing = self.reconcile(members);
    if let Some(key) = missing.first() {
      return Err(CoreError::InvalidParticipants(format!(
        "{key} is no longer in the room"
      )));
    }

    self.cancel_timer();
    self.state = match self.phase {
      SessionPhase::Idle => self.rules().initial_state(&self.keys())?,
      _ => self.rules().restart(&self.state)?,
    };
    self.begin(timers);
    tracing::info!("Session restarted in room {}", self.room_id);
    Ok(())
  }

  /// Point human participants at their current connections.
  ///
  /// Returns the keys of human participants with no member left in the room.
  pub fn reconcile(&mut self, members: &[Member]) -> Vec<IdentityKey> {
    let mut missing = Vec::new();
    for participant in self.participants.iter_mut().filter(|p| p.is_human()) {
      match members.iter().find(|m| m.identity_key() == participant.key) {
        Some(member) => {
          participant.connection_id = Some(member.connection_id.clone());
          participant.display_name = member.display_name.clone();
        }
        None => missing.push(participant.key.clone()),
      }
    }
    missing
  }

  /// Cancel the turn timer and discard the session.
  pub fn end(mut self) -> Option<SessionOutcome> {
    self.cancel_timer();
    self.outcome
  }

  pub fn phase(&self) -> SessionPhase {
    self.phase
  }

  pub fn is_active(&self) -> bool {
    self.phase == SessionPhase::Active
  }

  pub fn outcome(&self) -> Option<&SessionOutcome> {
    self.outcome.as_ref()
  }

  pub fn game_type(&self) -> GameType {
    self.game_type
  }

  pub fn participants(&self) -> &[Participant] {
    &self.participants
  }

  pub fn current_actor(&self) -> Option<&IdentityKey> {
    self.is_active().then(|| &self.participants[self.turn].key)
  }

  /// Id of the outstanding turn timer, if any.
  pub fn pending_timer(&self) -> Option<TimerId> {
    self.timer.as_ref().map(|t| t.handle.id())
  }

  pub fn state(&self) -> &Value {
    &self.state
  }

  pub fn public_state(&self) -> PublicSessionState {
    PublicSessionState {
      game_type: self.game_type,
      phase: self.phase,
      participants: self.participants.clone(),
      current_actor: self.current_actor().cloned(),
      board: self.rules().public_view(&self.state),
      outcome: self.outcome.clone(),
      moves: self.moves,
      turn_timeout_ms: self.turn_timeout.as_millis() as u64,
      last_move_at: self.last_move_at,
    }
  }

  fn rules(&self) -> &'static dyn RuleEngine {
    self.game_type.rules()
  }

  fn keys(&self) -> Vec<IdentityKey> {
    self.participants.iter().map(|p| p.key.clone()).collect()
  }

  fn begin(&mut self, timers: &dyn TimerScheduler) {
    self.turn = 0;
    self.phase = SessionPhase::Active;
    self.outcome = None;
    self.moves = 0;
    self.last_move_at = None;
    self.advance(timers);
  }

  /// Run the rule engine for one move. Leaves everything untouched on error.
  fn step(&mut self, actor: &IdentityKey, mv: &Value) -> Result<(), CoreError> {
    let result = self.rules().apply_move(&self.state, actor, mv)?;
    let next = match &result.outcome {
      MoveOutcome::Continue(next) => Some(
        self
          .participants
          .iter()
          .position(|p| &p.key == next)
          .ok_or_else(|| RuleError::CorruptState(format!("unknown next actor {next}")))?,
      ),
      _ => None,
    };

    self.state = result.state;
    self.moves += 1;
    self.last_move_at = Some(Utc::now());

    match (result.outcome, next) {
      (MoveOutcome::Continue(_), Some(next)) => self.turn = next,
      (MoveOutcome::Win(winner), _) => self.finish(SessionPhase::Ended, SessionOutcome::Winner { winner }),
      _ => self.finish(SessionPhase::Ended, SessionOutcome::Draw),
    }
    Ok(())
  }

  /// Play scripted turns in-line until a human is up, then arm their timer.
  fn advance(&mut self, timers: &dyn TimerScheduler) {
    while self.phase == SessionPhase::Active {
      let actor = self.participants[self.turn].key.clone();
      if !actor.is_bot() {
        let handle = timers.arm(
          self.turn_timeout,
          TimerKind::TurnExpired {
            room_id: self.room_id.clone(),
          },
        );
        self.timer = Some(TurnTimer { handle, actor });
        return;
      }

      let Some(mv) = self.rules().scripted_move(&self.state, &actor) else {
        tracing::warn!("Scripted participant {} has no move, forfeiting", actor);
        self.forfeit(actor, SessionPhase::Ended);
        return;
      };
      if let Err(e) = self.step(&actor, &mv) {
        tracing::warn!("Scripted participant {} made an illegal move: {}", actor, e);
        self.forfeit(actor, SessionPhase::Ended);
        return;
      }
    }
  }

  fn forfeit(&mut self, forfeited: IdentityKey, phase: SessionPhase) {
    let winner = match self.participants.as_slice() {
      [a, b] => Some(if a.key == forfeited { b.key.clone() } else { a.key.clone() }),
      _ => None,
    };
    self.finish(phase, SessionOutcome::Forfeit { forfeited, winner });
  }

  fn finish(&mut self, phase: SessionPhase, outcome: SessionOutcome) {
    self.cancel_timer();
    self.phase = phase;
    self.outcome = Some(outcome);
  }

  fn cancel_timer(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.handle.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::timer::{testing::ManualTimers, TokioTimers};
  use serde_json::json;

  const TIMEOUT: Duration = Duration::from_secs(30);

  fn member(conn: &str, user: &str) -> Member {
    Member::new(conn.into(), Some(user.into()), user.to_string())
  }

  fn u(user: &str) -> IdentityKey {
    IdentityKey::User(user.into())
  }

  fn two_humans(timers: &ManualTimers) -> TurnSession {
    let mut session = TurnSession::new(
      RoomId::normalize("room1"),
      GameType::TicTacToe,
      vec![
        Participant::from_member(&member("c1", "u1")),
        Participant::from_member(&member("c2", "u2")),
      ],
      TIMEOUT,
    )
    .unwrap();
    session.start(timers).unwrap();
    session
  }

  #[test]
  fn start_arms_one_timer_for_the_first_actor() {
    let timers = ManualTimers::new();
    let session = two_humans(&timers);

    assert_eq!(session.phase(), SessionPhase::Active);
    assert_eq!(session.current_actor(), Some(&u("u1")));
    assert_eq!(timers.count(), 1);
    assert_eq!(session.pending_timer(), timers.last().map(|t| t.id));
    assert_eq!(timers.armed()[0].1, TIMEOUT);
  }

  #[test]
  fn move_passes_turn_and_rearms() {
    let timers = ManualTimers::new();
    let mut session = two_humans(&timers);
    let first = session.pending_timer().unwrap();

    session.submit_move(&u("u1"), &json!({ "cell": 4 }), &timers).unwrap();

    assert_eq!(session.current_actor(), Some(&u("u2")));
    let second = session.pending_timer().unwrap();
    assert_ne!(first, second);
    assert_eq!(timers.count(), 2);
    assert!(session.public_state().last_move_at.is_some());
  }

  #[test]
  fn stale_actor_is_rejected_without_change() {
    let timers = ManualTimers::new();
    let mut session = two_humans(&timers);
    let timer = session.pending_timer();

    let err = session.submit_move(&u("u2"), &json!({ "cell": 0 }), &timers).unwrap_err();
    assert_eq!(err, CoreError::StaleActor);
    assert_eq!(session.current_actor(), Some(&u("u1")));
    assert_eq!(session.pending_timer(), timer);
    assert_eq!(session.public_state().moves, 0);
  }

  #[test]
  fn illegal_move_keeps_timer() {
    let timers = ManualTimers::new();
    let mut session = two_humans(&timers);
    let timer = session.pending_timer();

    let err = session.submit_move(&u("u1"), &json!({ "cell": 42 }), &timers).unwrap_err();
    assert!(matches!(err, CoreError::IllegalMove(_)));
    assert_eq!(session.pending_timer(), timer);
    assert_eq!(timers.count(), 1);
  }

  #[test]
  fn superseded_timer_firing_is_a_no_op() {
    let timers = ManualTimers::new();
    let mut session = two_humans(&timers);
    let old = session.pending_timer().unwrap();

    session.submit_move(&u("u1"), &json!({ "cell": 0 }), &timers).unwrap();
    let before = session.state().clone();

    assert!(!session.on_timeout(old));
    assert_eq!(session.phase(), SessionPhase::Active);
    assert_eq!(session.current_actor(), Some(&u("u2")));
    assert_eq!(session.state(), &before);
    assert!(session.pending_timer().is_some());
  }

  #[test]
  fn timeout_forfeits_to_the_other_participant() {
    let timers = ManualTimers::new();
    let mut session = two_humans(&timers);
    session.submit_move(&u("u1"), &json!({ "cell": 0 }), &timers).unwrap();

    let current = session.pending_timer().unwrap();
    assert!(session.on_timeout(current));

    assert_eq!(session.phase(), SessionPhase::TimedOut);
    assert_eq!(
      session.outcome(),
      Some(&SessionOutcome::Forfeit {
        forfeited: u("u2"),
        winner: Some(u("u1")),
      })
    );
    assert!(session.pending_timer().is_none());

    for actor in [u("u1"), u("u2")] {
      let err = session.submit_move(&actor, &json!({ "cell": 8 }), &timers).unwrap_err();
      assert_eq!(err, CoreError::SessionFinished);
    }
  }

  #[test]
  fn win_ends_session_and_cancels_timer() {
    let timers = ManualTimers::new();
    let mut session = two_humans(&timers);
    for (actor, cell) in [("u1", 0), ("u2", 3), ("u1", 1), ("u2", 4), ("u1", 2)] {
      session.submit_move(&u(actor), &json!({ "cell": cell }), &timers).unwrap();
    }

    assert_eq!(session.phase(), SessionPhase::Ended);
    assert_eq!(session.outcome(), Some(&SessionOutcome::Winner { winner: u("u1") }));
    assert!(session.pending_timer().is_none());
    assert!(session.current_actor().is_none());
  }

  #[test]
  fn scripted_opponent_moves_inline_without_a_timer() {
    let timers = ManualTimers::new();
    let mut session = TurnSession::new(
      RoomId::normalize("room1"),
      GameType::TicTacToe,
      vec![Participant::from_member(&member("c1", "u1")), Participant::bot("bot")],
      TIMEOUT,
    )
    .unwrap();
    session.start(&timers).unwrap();
    session.submit_move(&u("u1"), &json!({ "cell": 0 }), &timers).unwrap();

    assert_eq!(session.current_actor(), Some(&u("u1")));
    assert_eq!(session.public_state().moves, 2);
    assert_eq!(timers.count(), 2);
    assert!(timers.armed().iter().all(|(fired, _)| matches!(fired.kind, TimerKind::TurnExpired { .. })));
  }

  #[test]
  fn bot_seated_first_moves_before_any_timer() {
    let timers = ManualTimers::new();
    let mut session = TurnSession::new(
      RoomId::normalize("room1"),
      GameType::Nim,
      vec![Participant::bot("nimbot"), Participant::from_member(&member("c1", "u1"))],
      TIMEOUT,
    )
    .unwrap();
    session.start(&timers).unwrap();

    assert_eq!(session.current_actor(), Some(&u("u1")));
    assert_eq!(session.public_state().moves, 1);
    assert_eq!(timers.count(), 1);
  }

  #[test]
  fn rejects_sessions_without_humans_or_with_duplicates() {
    let bots = TurnSession::new(
      RoomId::normalize("r"),
      GameType::Nim,
      vec![Participant::bot("a"), Participant::bot("b")],
      TIMEOUT,
    );
    assert!(matches!(bots, Err(CoreError::InvalidParticipants(_))));

    let twice = TurnSession::new(
      RoomId::normalize("r"),
      GameType::Nim,
      vec![
        Participant::from_member(&member("c1", "u1")),
        Participant::from_member(&member("c2", "u1")),
      ],
      TIMEOUT,
    );
    assert!(matches!(twice, Err(CoreError::InvalidParticipants(_))));
  }

  #[test]
  fn restart_remaps_reconnected_participants() {
    let timers = ManualTimers::new();
    let mut session = two_humans(&timers);
    session.submit_move(&u("u1"), &json!({ "cell": 0 }), &timers).unwrap();

    let members = vec![member("c1", "u1"), member("c7", "u2")];
    session.restart(&members, &timers).unwrap();

    assert_eq!(session.participants()[1].connection_id, Some("c7".into()));
    assert_eq!(session.current_actor(), Some(&u("u1")));
    assert_eq!(session.public_state().moves, 0);
    assert_eq!(session.state()["cells"], json!([null, null, null, null, null, null, null, null, null]));
    assert_eq!(session.pending_timer(), timers.last().map(|t| t.id));
  }

  #[test]
  fn restart_fails_when_a_participant_left() {
    let timers = ManualTimers::new();
    let mut session = two_humans(&timers);
    let err = session.restart(&[member("c1", "u1")], &timers).unwrap_err();
    assert!(matches!(err, CoreError::InvalidParticipants(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn real_timer_forfeits_after_timeout() {
    let (timers, mut fired) = TokioTimers::channel();
    let mut session = TurnSession::new(
      RoomId::normalize("room1"),
      GameType::Nim,
      vec![
        Participant::from_member(&member("c1", "u1")),
        Participant::from_member(&member("c2", "u2")),
      ],
      Duration::from_millis(200),
    )
    .unwrap();
    session.start(&timers).unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let event = fired.recv().await.unwrap();
    assert!(session.on_timeout(event.id));
    assert_eq!(
      session.outcome(),
      Some(&SessionOutcome::Forfeit {
        forfeited: u("u1"),
        winner: Some(u("u2")),
      })
    );
    assert!(session.submit_move(&u("u1"), &json!({ "heap": 0, "take": 1 }), &timers).is_err());
    assert!(session.submit_move(&u("u2"), &json!({ "heap": 0, "take": 1 }), &timers).is_err());
  }
}
