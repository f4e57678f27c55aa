//! Cancellable one-shot timers that report back into the hub's event stream.
//!
//! A timer never mutates state itself. When it fires it posts a [`TimerFired`]
//! carrying its id; whoever owns the corresponding [`TimerHandle`] checks the id
//! before acting, so a firing that lost a race against a cancel is a no-op.

use serde::Serialize;
use std::{
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};
use tokio::{sync::mpsc, task::AbortHandle};

use crate::{mesh::{AttemptId, LinkKey}, room::RoomId};

pub type TimerId = u64;

/// What a timer is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimerKind {
  /// The current actor of a room's turn session ran out of time.
  TurnExpired { room_id: RoomId },
  /// An initiator's retry delay for a failed peer link elapsed.
  LinkRetry {
    room_id: RoomId,
    link: LinkKey,
    attempt: AttemptId,
  },
}

/// Delivered to the hub when a timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
  pub id: TimerId,
  pub kind: TimerKind,
}

/// Owning handle to an armed timer. Dropping or cancelling it aborts the timer.
#[derive(Debug)]
pub struct TimerHandle {
  id: TimerId,
  task: Option<AbortHandle>,
}

impl TimerHandle {
  pub fn new(id: TimerId, task: Option<AbortHandle>) -> Self {
    Self { id, task }
  }

  pub fn id(&self) -> TimerId {
    self.id
  }

  pub fn cancel(mut self) {
    self.abort();
  }

  fn abort(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

impl Drop for TimerHandle {
  fn drop(&mut self) {
    self.abort();
  }
}

/// Arms timers on behalf of the session engine and the mesh supervisor.
pub trait TimerScheduler: Send + Sync {
  fn arm(&self, delay: Duration, kind: TimerKind) -> TimerHandle;
}

/// Timer scheduler backed by sleeping tokio tasks.
pub struct TokioTimers {
  fired: mpsc::UnboundedSender<TimerFired>,
  next_id: AtomicU64,
}

impl TokioTimers {
  /// Create a scheduler together with the receiver its firings are posted to.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
    let (fired, rx) = mpsc::unbounded_channel();
    (
      Self {
        fired,
        next_id: AtomicU64::new(1),
      },
      rx,
    )
  }
}

impl TimerScheduler for TokioTimers {
  fn arm(&self, delay: Duration, kind: TimerKind) -> TimerHandle {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let fired = self.fired.clone();
    let task = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = fired.send(TimerFired { id, kind });
    });
    TimerHandle::new(id, Some(task.abort_handle()))
  }
}
