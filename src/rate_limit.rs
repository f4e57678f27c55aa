//! Per-connection throttling of inbound frames.

use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};

use crate::{error::RateLimitError, identity::ConnectionId};

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct MessageLimits {
  /// Maximum frame size in bytes
  pub max_size_bytes: usize,
  /// Maximum frames per time window
  pub max_messages_per_window: u32,
  /// Time window for rate limiting
  pub window_duration: Duration,
  /// How long a connection that exceeded the limit is ignored
  pub ban_duration: Duration,
}

impl Default for MessageLimits {
  fn default() -> Self {
    Self {
      max_size_bytes: 64 * 1024,
      max_messages_per_window: 30,
      window_duration: Duration::from_secs(1),
      ban_duration: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Default)]
struct ConnectionRateState {
  message_times: Vec<Instant>,
  banned_until: Option<Instant>,
}

impl ConnectionRateState {
  fn is_banned(&self, now: Instant) -> bool {
    self.banned_until.is_some_and(|until| now < until)
  }

  fn clean_old_messages(&mut self, now: Instant, window: Duration) {
    self.message_times.retain(|&time| now.duration_since(time) < window);
  }
}

/// Sliding-window limiter keyed by connection id.
#[derive(Clone)]
pub struct RateLimiter {
  limits: MessageLimits,
  states: Arc<RwLock<HashMap<ConnectionId, ConnectionRateState>>>,
}

impl RateLimiter {
  pub fn new(limits: MessageLimits) -> Self {
    Self {
      limits,
      states: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  pub fn limits(&self) -> &MessageLimits {
    &self.limits
  }

  /// Check whether a frame of `message_size` bytes from `connection_id` may be processed.
  pub async fn check_allowed(&self, connection_id: &ConnectionId, message_size: usize) -> Result<(), RateLimitError> {
    if message_size > self.limits.max_size_bytes {
      return Err(RateLimitError::TooLarge {
        size: message_size,
        max: self.limits.max_size_bytes,
      });
    }

    let now = Instant::now();
    let mut states = self.states.write().await;
    let state = states.entry(connection_id.clone()).or_default();

    if state.is_banned(now) {
      return Err(RateLimitError::Banned);
    }

    state.clean_old_messages(now, self.limits.window_duration);

    if state.message_times.len() >= self.limits.max_messages_per_window as usize {
      state.banned_until = Some(now + self.limits.ban_duration);
      state.message_times.clear();
      tracing::warn!("Connection {} exceeded rate limit and was throttled", connection_id);
      return Err(RateLimitError::Exceeded {
        max: self.limits.max_messages_per_window,
        window_ms: self.limits.window_duration.as_millis(),
      });
    }

    state.message_times.push(now);
    Ok(())
  }

  pub async fn is_banned(&self, connection_id: &ConnectionId) -> bool {
    let states = self.states.read().await;
    states.get(connection_id).is_some_and(|s| s.is_banned(Instant::now()))
  }

  /// Drop all state for a closed connection.
  pub async fn forget(&self, connection_id: &ConnectionId) {
    self.states.write().await.remove(connection_id);
  }

  pub async fn tracked(&self) -> usize {
    self.states.read().await.len()
  }
}

/// ######################################## TESTS ########################################
