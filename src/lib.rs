//! Room coordination server: identity, rooms, peer-mesh negotiation relay and
//! timed turn-based sessions, served over a WebSocket.

pub mod archive;
pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod identity;
pub mod mesh;
pub mod protocol;
pub mod rate_limit;
pub mod room;
pub mod rules;
pub mod server;
pub mod session;
pub mod timer;

pub use archive::{ArchivedMessage, InMemoryArchive, MessageArchive};
pub use auth::{IdentityProvider, JwtAuth, JwtAuthOptions};
pub use config::Config;
pub use error::{CoreError, ErrorCode};
pub use hub::{Hub, HubEvent, HubHandle, HubSettings};
pub use identity::{ConnectionId, IdentityRegistry, LogicalUser, UserId};
pub use mesh::{resolve_glare, LinkState, PeerMesh};
pub use protocol::{ClientMessage, ServerMessage};
pub use room::{RoomId, RoomRegistry, RoomSettings};
pub use rules::{GameType, RuleEngine};
pub use server::Server;
pub use session::{SessionPhase, TurnSession};

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Load configuration, install logging and serve until the listener fails.
pub async fn run() -> anyhow::Result<()> {
  let config = Config::from_env().context("Failed to load configuration")?;

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let addr = format!("0.0.0.0:{}", config.port);
  Server::from_config(&config)
    .listen(&addr)
    .await
    .with_context(|| format!("Server on {addr} failed"))
}
