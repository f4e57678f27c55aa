//! Environment-driven configuration.

use anyhow::{Context, Result};
use std::{str::FromStr, time::Duration};

use crate::{hub::HubSettings, rate_limit::MessageLimits, room::RoomSettings};

const DEV_SECRET: &str = "dev-secret";

#[derive(Debug, Clone)]
pub struct Config {
  pub port: u16,
  pub jwt_secret: String,
  /// Admit connections without a token as guests
  pub allow_guests: bool,
  pub hub: HubSettings,
  pub limits: MessageLimits,
}

impl Config {
  /// Load `.env` if present, then read the process environment.
  pub fn from_env() -> Result<Self> {
    dotenv::dotenv().ok();
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let jwt_secret = lookup("JWT_SECRET").unwrap_or_else(|| {
      tracing::warn!("JWT_SECRET is not set; using the development secret");
      DEV_SECRET.to_string()
    });

    let hub = HubSettings {
      rooms: RoomSettings {
        group_capacity: parse(&lookup, "GROUP_CAPACITY", 8)?,
        two_party_capacity: parse(&lookup, "TWO_PARTY_CAPACITY", 4)?,
        ..RoomSettings::default()
      },
      turn_timeout: Duration::from_secs(parse(&lookup, "TURN_TIMEOUT_SECS", 30)?),
      link_retry: Duration::from_secs(parse(&lookup, "LINK_RETRY_SECS", 3)?),
      history_limit: parse(&lookup, "HISTORY_LIMIT", 100)?,
    };

    let limits = MessageLimits {
      max_size_bytes: parse(&lookup, "MAX_MESSAGE_BYTES", 64 * 1024)?,
      max_messages_per_window: parse(&lookup, "RATE_MAX_MESSAGES", 30)?,
      window_duration: Duration::from_millis(parse(&lookup, "RATE_WINDOW_MS", 1000)?),
      ban_duration: Duration::from_secs(parse(&lookup, "RATE_BAN_SECS", 10)?),
    };

    Ok(Self {
      port: parse(&lookup, "PORT", 3000)?,
      jwt_secret,
      allow_guests: parse(&lookup, "ALLOW_GUESTS", true)?,
      hub,
      limits,
    })
  }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match lookup(key) {
    Some(raw) => raw
      .trim()
      .parse()
      .with_context(|| format!("Invalid value for {key}: {raw:?}")),
    None => Ok(default),
  }
}
