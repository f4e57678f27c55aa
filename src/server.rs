//! WebSocket transport: authenticate, then pump frames between the socket and the hub.

use axum::{
  extract::{
    ws::{Message, WebSocket},
    Query, State, WebSocketUpgrade,
  },
  http::{header::CONTENT_TYPE, Method, StatusCode},
  response::{IntoResponse, Response},
  routing::get,
  Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tower_http::{
  compression::CompressionLayer,
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};

use crate::{
  archive::{InMemoryArchive, MessageArchive},
  auth::{IdentityProvider, JwtAuth},
  config::Config,
  error::ErrorCode,
  hub::{Hub, HubHandle, HubSettings},
  identity::{ConnectionId, LogicalUser},
  protocol::{ClientMessage, ServerMessage},
  rate_limit::{MessageLimits, RateLimiter},
};

#[derive(Clone)]
struct AppState {
  hub: HubHandle,
  identity: Arc<dyn IdentityProvider>,
  allow_guests: bool,
  rate_limiter: Option<RateLimiter>,
}

/// Room coordination server.
pub struct Server {
  identity: Arc<dyn IdentityProvider>,
  allow_guests: bool,
  rate_limiter: Option<RateLimiter>,
  hub_settings: HubSettings,
  archive: Arc<dyn MessageArchive>,
}

impl Server {
  /// Create a server with default configuration.
  pub fn new() -> Self {
    let hub_settings = HubSettings::default();
    Self {
      identity: Arc::new(JwtAuth::new("dev-secret")),
      allow_guests: true,
      rate_limiter: None,
      archive: Arc::new(InMemoryArchive::new(hub_settings.history_limit)),
      hub_settings,
    }
  }

  /// Build a server from loaded configuration.
  pub fn from_config(config: &Config) -> Self {
    Self::new()
      .with_identity_provider(JwtAuth::new(&config.jwt_secret))
      .with_guests(config.allow_guests)
      .with_limits(config.limits.clone())
      .with_archive(InMemoryArchive::new(config.hub.history_limit))
      .with_hub_settings(config.hub.clone())
  }

  /// Configure the identity provider used to validate connect tokens.
  pub fn with_identity_provider(mut self, provider: impl IdentityProvider + 'static) -> Self {
    self.identity = Arc::new(provider);
    self
  }

  /// Allow or refuse connections that present no token.
  pub fn with_guests(mut self, allow: bool) -> Self {
    self.allow_guests = allow;
    self
  }

  /// Configure rate limiting.
  pub fn with_limits(mut self, limits: MessageLimits) -> Self {
    self.rate_limiter = Some(RateLimiter::new(limits));
    self
  }

  pub fn with_hub_settings(mut self, settings: HubSettings) -> Self {
    self.hub_settings = settings;
    self
  }

  /// Configure the message archive backing chat history.
  pub fn with_archive(mut self, archive: impl MessageArchive + 'static) -> Self {
    self.archive = Arc::new(archive);
    self
  }

  /// Spawn the hub and build the HTTP router around it.
  pub fn build(self) -> (Router, JoinHandle<()>) {
    let (hub, hub_task) = Hub::spawn(self.hub_settings, self.archive);
    let state = AppState {
      hub,
      identity: self.identity,
      allow_guests: self.allow_guests,
      rate_limiter: self.rate_limiter,
    };

    let cors = CorsLayer::new()
      .allow_methods([Method::GET])
      .allow_origin(Any)
      .allow_headers([CONTENT_TYPE]);

    let app = Router::new()
      .route("/ws", get(ws_handler))
      .route("/health", get(health))
      .with_state(state)
      .layer(cors)
      .layer(TraceLayer::new_for_http())
      .layer(CompressionLayer::new());

    (app, hub_task)
  }

  /// Start the server.
  pub async fn listen(self, addr: &str) -> anyhow::Result<()> {
    let (app, hub_task) = self.build();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("WebSocket server listening on {}", addr);
    axum::serve(listener, app).await?;
    hub_task.abort();
    Ok(())
  }
}

impl Default for Server {
  fn default() -> Self {
    Self::new()
  }
}

async fn health() -> Json<serde_json::Value> {
  Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_handler(
  State(state): State<AppState>,
  Query(params): Query<HashMap<String, String>>,
  ws: WebSocketUpgrade,
) -> Response {
  let user = match params.get("token") {
    Some(token) => match state.identity.validate(token).await {
      Ok(user) => Some(user),
      Err(e) => {
        tracing::warn!("Rejected connection: {:#}", e);
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
      }
    },
    None if state.allow_guests => None,
    None => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
  };

  ws.on_upgrade(move |socket| handle_ws(socket, user, state))
}

/// Drive one WebSocket until either direction closes.
async fn handle_ws(ws: WebSocket, user: Option<LogicalUser>, state: AppState) {
  let connection_id = ConnectionId::generate();
  let (mut sender_ws, mut receiver_ws) = ws.split();
  let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

  state.hub.connect(connection_id.clone(), user, tx.clone());

  let hub = state.hub.clone();
  let rate_limiter = state.rate_limiter.clone();
  let conn = connection_id.clone();
  let mut receiver_task = tokio::spawn(async move {
    while let Some(Ok(msg)) = receiver_ws.next().await {
      match msg {
        Message::Text(text) => {
          if let Some(ref limiter) = rate_limiter {
            if let Err(e) = limiter.check_allowed(&conn, text.as_str().len()).await {
              tracing::warn!("Rate limit exceeded for {}: {}", conn, e);
              let _ = tx.send(ServerMessage::error(ErrorCode::RateLimited, e.to_string()));
              continue;
            }
          }

          match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => hub.send(conn.clone(), message),
            Err(e) => {
              tracing::warn!("Failed to parse message from {}: {}", conn, e);
              let _ = tx.send(ServerMessage::error(ErrorCode::BadMessage, format!("Malformed message: {e}")));
            }
          }
        }
        Message::Close(_) => {
          tracing::debug!("Connection {} sent close", conn);
          break;
        }
        _ => {}
      }
    }
  });

  let conn = connection_id.clone();
  let mut sender_task = tokio::spawn(async move {
    while let Some(msg) = rx.recv().await {
      let text = match serde_json::to_string(&msg) {
        Ok(text) => text,
        Err(e) => {
          tracing::warn!("Failed to serialize message for {}: {}", conn, e);
          continue;
        }
      };
      if sender_ws.send(Message::Text(text.into())).await.is_err() {
        tracing::debug!("Failed to send message to {}", conn);
        break;
      }
    }
  });

  tokio::select! {
    _ = &mut receiver_task => sender_task.abort(),
    _ = &mut sender_task => receiver_task.abort(),
  }

  state.hub.disconnect(connection_id.clone());
  if let Some(ref limiter) = state.rate_limiter {
    limiter.forget(&connection_id).await;
  }
}

/// ######################################## TESTS ########################################
