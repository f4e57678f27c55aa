//! The single event-processing stream.
//!
//! One tokio task owns the identity table, the room table and every client's
//! outbound channel. Socket tasks post [`HubEvent`]s; timers post
//! [`TimerFired`]s. Each event is handled to completion before the next one is
//! looked at, so no handler ever observes another one half-way through.

use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
  archive::{ArchivedMessage, MessageArchive},
  error::CoreError,
  identity::{ConnectionId, IdentityRegistry, LogicalUser, UserId},
  mesh::{LinkState, OfferRoute, Supervision},
  protocol::{ClientMessage, SeatRequest, ServerMessage, SessionEndReason, SignalPayload},
  room::{Departure, JoinKind, Room, RoomId, RoomRegistry, RoomSettings},
  rules::GameType,
  session::{Participant, TurnSession},
  timer::{TimerFired, TimerKind, TimerScheduler, TokioTimers},
};

const GUEST_NAME: &str = "Guest";

#[derive(Debug, Clone)]
pub struct HubSettings {
  pub rooms: RoomSettings,
  /// Think time per human turn
  pub turn_timeout: Duration,
  /// Delay before an initiator retries a failed link
  pub link_retry: Duration,
  /// Maximum messages returned by a history request
  pub history_limit: usize,
}

impl Default for HubSettings {
  fn default() -> Self {
    Self {
      rooms: RoomSettings::default(),
      turn_timeout: Duration::from_secs(30),
      link_retry: Duration::from_secs(3),
      history_limit: 100,
    }
  }
}

#[derive(Debug)]
pub enum HubEvent {
  Connected {
    connection_id: ConnectionId,
    user: Option<LogicalUser>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
  },
  Message {
    connection_id: ConnectionId,
    message: ClientMessage,
  },
  Disconnected {
    connection_id: ConnectionId,
  },
}

/// Cheap cloneable sender into the hub.
#[derive(Clone)]
pub struct HubHandle {
  tx: mpsc::UnboundedSender<HubEvent>,
}

impl HubHandle {
  pub fn connect(
    &self,
    connection_id: ConnectionId,
    user: Option<LogicalUser>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
  ) {
    self.post(HubEvent::Connected {
      connection_id,
      user,
      outbound,
    });
  }

  pub fn send(&self, connection_id: ConnectionId, message: ClientMessage) {
    self.post(HubEvent::Message { connection_id, message });
  }

  pub fn disconnect(&self, connection_id: ConnectionId) {
    self.post(HubEvent::Disconnected { connection_id });
  }

  fn post(&self, event: HubEvent) {
    if self.tx.send(event).is_err() {
      tracing::warn!("Hub is gone; dropping event");
    }
  }
}

struct Client {
  outbound: mpsc::UnboundedSender<ServerMessage>,
  identity: Option<LogicalUser>,
  /// The identity came from a validated token and may not be replaced.
  authenticated: bool,
}

pub struct Hub {
  settings: HubSettings,
  identities: IdentityRegistry,
  rooms: RoomRegistry,
  clients: HashMap<ConnectionId, Client>,
  timers: Arc<dyn TimerScheduler>,
  archive: Arc<dyn MessageArchive>,
}

impl Hub {
  pub fn new(settings: HubSettings, timers: Arc<dyn TimerScheduler>, archive: Arc<dyn MessageArchive>) -> Self {
    Self {
      rooms: RoomRegistry::new(settings.rooms.clone()),
      settings,
      identities: IdentityRegistry::new(),
      clients: HashMap::new(),
      timers,
      archive,
    }
  }

  /// Start the hub on its own task with tokio-backed timers.
  pub fn spawn(settings: HubSettings, archive: Arc<dyn MessageArchive>) -> (HubHandle, JoinHandle<()>) {
    let (tx, events) = mpsc::unbounded_channel();
    let (timers, fired) = TokioTimers::channel();
    let hub = Hub::new(settings, Arc::new(timers), archive);
    let task = tokio::spawn(hub.run(events, fired));
    (HubHandle { tx }, task)
  }

  /// Drain events until every [`HubHandle`] is dropped.
  pub async fn run(
    mut self,
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    mut fired: mpsc::UnboundedReceiver<TimerFired>,
  ) {
    loop {
      tokio::select! {
        event = events.recv() => match event {
          Some(event) => self.handle(event).await,
          None => break,
        },
        Some(timer) = fired.recv() => self.handle_timer(timer),
      }
    }
    tracing::info!("Hub stopped");
  }

  pub async fn handle(&mut self, event: HubEvent) {
    match event {
      HubEvent::Connected {
        connection_id,
        user,
        outbound,
      } => {
        tracing::info!("Connection {} opened (user: {:?})", connection_id, user.as_ref().map(|u| &u.user_id));
        if let Some(ref user) = user {
          self.identities.register(user.user_id.clone(), connection_id.clone());
        }
        self.clients.insert(
          connection_id.clone(),
          Client {
            outbound,
            authenticated: user.is_some(),
            identity: user.clone(),
          },
        );
        self.send_to(&connection_id, ServerMessage::Registered { connection_id: connection_id.clone(), user });
      }
      HubEvent::Message { connection_id, message } => {
        if !self.clients.contains_key(&connection_id) {
          tracing::debug!("Message from unknown connection {}", connection_id);
          return;
        }
        if let Err(err) = self.dispatch(&connection_id, message).await {
          self.report(&connection_id, err);
        }
      }
      HubEvent::Disconnected { connection_id } => {
        self.leave_room(&connection_id).await;
        self.clients.remove(&connection_id);
        tracing::info!("Connection {} closed", connection_id);
      }
    }
  }

  pub fn handle_timer(&mut self, fired: TimerFired) {
    match fired.kind {
      TimerKind::TurnExpired { room_id } => {
        let Some(session) = self.rooms.room_mut(&room_id).and_then(|room| room.session.as_mut()) else {
          tracing::debug!("Turn timer {} fired for a room without a session", fired.id);
          return;
        };
        if !session.on_timeout(fired.id) {
          tracing::debug!("Stale turn timer {} in room {}", fired.id, room_id);
          return;
        }
        let state = session.public_state();
        self.broadcast(&room_id, ServerMessage::SessionStateChanged { state });
      }
      TimerKind::LinkRetry { room_id, link, attempt } => {
        let Some(room) = self.rooms.room_mut(&room_id) else {
          return;
        };
        match room.mesh.retry_due(&link, attempt, fired.id) {
          Some((initiator, responder)) => {
            tracing::info!("Retrying link {} -> {} in room {}", initiator, responder, room_id);
            self.send_to(&initiator, ServerMessage::RestartNegotiation { peer: responder });
          }
          None => tracing::debug!("Stale link retry {} in room {}", fired.id, room_id),
        }
      }
    }
  }

  async fn dispatch(&mut self, conn: &ConnectionId, message: ClientMessage) -> Result<(), CoreError> {
    match message {
      ClientMessage::RegisterIdentity { user_id, display_name } => self.register_identity(conn, user_id, display_name),
      ClientMessage::CreateRoom {
        user_id,
        display_name,
        private,
      } => self.create_room(conn, user_id, display_name, private).await,
      ClientMessage::JoinRoom {
        room_id,
        user_id,
        display_name,
      } => self.join_room(conn, &room_id, user_id, display_name).await,
      ClientMessage::LeaveRoom => {
        self.leave_room(conn).await;
        Ok(())
      }
      ClientMessage::ToggleMute => self.toggle_mute(conn),
      ClientMessage::ListMembers => self.list_members(conn),
      ClientMessage::ListRooms => {
        let rooms = self.rooms.public_rooms();
        self.send_to(conn, ServerMessage::RoomList { rooms });
        Ok(())
      }

      ClientMessage::Signal { target, payload } => self.signal(conn, target, payload),
      ClientMessage::ReadyToNegotiate => self.ready_to_negotiate(conn),
      ClientMessage::RequestReinitiate { target } => self.request_reinitiate(conn, target),
      ClientMessage::LinkStatus { peer, state } => self.link_status(conn, peer, state),
      ClientMessage::MediaUnavailable { reason } => self.media_unavailable(conn, reason),
      ClientMessage::MeshStatus => {
        let room = self.current_room(conn)?;
        let links = room.mesh.summary_for(conn);
        self.send_to(conn, ServerMessage::MeshStatus { links });
        Ok(())
      }

      ClientMessage::StartSession {
        game_type,
        participants,
      } => self.start_session(conn, game_type, participants),
      ClientMessage::SubmitMove { move_data } => self.submit_move(conn, move_data),
      ClientMessage::RestartSession => self.restart_session(conn),
      ClientMessage::EndSession => self.end_session(conn),
      ClientMessage::Invite { user_id, game_type } => self.invite(conn, user_id, game_type),

      ClientMessage::Chat { text } => self.chat(conn, text).await,
      ClientMessage::History { limit } => self.history(conn, limit).await,
    }
  }

  /// Surface an error to the acting connection, or swallow a benign race.
  fn report(&self, conn: &ConnectionId, err: CoreError) {
    if err.is_silent() {
      tracing::debug!("Dropped request from {}: {}", conn, err);
      return;
    }
    tracing::warn!("Rejected request from {}: {}", conn, err);
    let message = match err {
      CoreError::IllegalMove(reason) => ServerMessage::IllegalMove { reason },
      other => ServerMessage::error(other.code(), other.to_string()),
    };
    self.send_to(conn, message);
  }

  // ---------------------------------------------------------------- identity

  fn register_identity(&mut self, conn: &ConnectionId, user_id: UserId, display_name: String) -> Result<(), CoreError> {
    let Some(client) = self.clients.get(conn) else {
      return Ok(());
    };
    if client.authenticated && client.identity.as_ref().is_some_and(|u| u.user_id != user_id) {
      return Err(CoreError::IdentityMismatch);
    }
    self.check_claim(conn, &user_id)?;

    let Some(client) = self.clients.get_mut(conn) else {
      return Ok(());
    };
    let user = LogicalUser::new(user_id.clone(), display_name);
    client.identity = Some(user.clone());
    self.identities.register(user_id, conn.clone());
    self.send_to(
      conn,
      ServerMessage::Registered {
        connection_id: conn.clone(),
        user: Some(user),
      },
    );
    Ok(())
  }

  /// Work out the user id and display name a room request acts under.
  fn acting_identity(
    &self,
    conn: &ConnectionId,
    user_id: Option<UserId>,
    display_name: Option<String>,
  ) -> Result<(Option<UserId>, String), CoreError> {
    let client = self.clients.get(conn);
    let known = client.and_then(|c| c.identity.as_ref());

    if let (Some(client), Some(requested)) = (client, user_id.as_ref()) {
      if client.authenticated && known.is_some_and(|u| &u.user_id != requested) {
        return Err(CoreError::IdentityMismatch);
      }
    }

    let user_id = user_id.or_else(|| known.map(|u| u.user_id.clone()));
    if let Some(ref user_id) = user_id {
      self.check_claim(conn, user_id)?;
    }
    let display_name = display_name
      .filter(|name| !name.trim().is_empty())
      .or_else(|| known.map(|u| u.display_name.clone()))
      .unwrap_or_else(|| GUEST_NAME.to_string());
    Ok((user_id, display_name))
  }

  /// Refuse to act as a user whose current connection holds a validated
  /// token, unless `conn` holds a token for that same user.
  fn check_claim(&self, conn: &ConnectionId, user_id: &UserId) -> Result<(), CoreError> {
    let verified_as_user = self
      .clients
      .get(conn)
      .is_some_and(|c| c.authenticated && c.identity.as_ref().is_some_and(|u| &u.user_id == user_id));
    if verified_as_user {
      return Ok(());
    }

    let held_by_token = self
      .identities
      .resolve(user_id)
      .filter(|holder| *holder != conn)
      .and_then(|holder| self.clients.get(holder))
      .is_some_and(|holder| holder.authenticated);
    if held_by_token {
      tracing::warn!("{} tried to act as authenticated user {}", conn, user_id);
      return Err(CoreError::IdentityMismatch);
    }
    Ok(())
  }

  // ---------------------------------------------------------------- rooms

  async fn create_room(
    &mut self,
    conn: &ConnectionId,
    user_id: Option<UserId>,
    display_name: Option<String>,
    private: bool,
  ) -> Result<(), CoreError> {
    let (user_id, display_name) = self.acting_identity(conn, user_id, display_name)?;
    let membership = self.rooms.create_room(conn.clone(), user_id, display_name, private);
    if let Some(previous) = membership.previous {
      self.after_departure(previous).await;
    }

    self.send_to(
      conn,
      ServerMessage::RoomCreated {
        room_id: membership.room_id.clone(),
        member: membership.member,
      },
    );
    self.broadcast_members(&membership.room_id);
    Ok(())
  }

  async fn join_room(
    &mut self,
    conn: &ConnectionId,
    raw_room_id: &str,
    user_id: Option<UserId>,
    display_name: Option<String>,
  ) -> Result<(), CoreError> {
    let (user_id, display_name) = self.acting_identity(conn, user_id, display_name)?;
    let membership = match self.rooms.join(raw_room_id, conn.clone(), user_id, display_name) {
      Ok(membership) => membership,
      Err(err) => {
        tracing::info!("Join of {} to {} rejected: {}", conn, raw_room_id, err);
        self.send_to(
          conn,
          ServerMessage::JoinRejected {
            code: err.code(),
            reason: err.to_string(),
          },
        );
        return Ok(());
      }
    };
    if let Some(previous) = membership.previous {
      self.after_departure(previous).await;
    }

    let room_id = membership.room_id;
    let rejoin = !matches!(membership.kind, JoinKind::New | JoinKind::Created);

    if let JoinKind::Rejoin { ref superseded } = membership.kind {
      for old in superseded {
        self.send_to(old, ServerMessage::Superseded { room_id: room_id.clone() });
      }
      if let Some(room) = self.rooms.room_mut(&room_id) {
        let members = room.members().to_vec();
        if let Some(session) = room.session.as_mut() {
          session.reconcile(&members);
        }
      }
      if membership.member.is_host {
        self.broadcast(
          &room_id,
          ServerMessage::HostChanged {
            room_id: room_id.clone(),
            connection_id: conn.clone(),
          },
        );
      }
    }

    self.send_to(
      conn,
      ServerMessage::RoomJoined {
        room_id: room_id.clone(),
        member: membership.member,
        rejoin,
      },
    );
    if membership.kind != JoinKind::Duplicate {
      self.broadcast_members(&room_id);
    }

    let session = self
      .rooms
      .room(&room_id)
      .and_then(|room| room.session.as_ref())
      .map(TurnSession::public_state);
    if let Some(state) = session {
      self.send_to(conn, ServerMessage::SessionStateChanged { state });
    }
    Ok(())
  }

  async fn leave_room(&mut self, conn: &ConnectionId) {
    if let Some(departure) = self.rooms.leave(conn) {
      self.after_departure(departure).await;
    }
  }

  /// Tell the rest of the room about a departure and end a session it broke.
  async fn after_departure(&mut self, departure: Departure) {
    let Departure {
      room_id,
      member,
      room_closed,
      new_host,
    } = departure;
    tracing::info!("{} left room {}", member.connection_id, room_id);
    if room_closed {
      if let Err(err) = self.archive.forget(&room_id).await {
        tracing::warn!("Failed to drop history of closed room {}: {}", room_id, err);
      }
      return;
    }

    self.broadcast(&room_id, ServerMessage::MemberLeft { room_id: room_id.clone(), member });
    if let Some(host) = new_host {
      self.broadcast(
        &room_id,
        ServerMessage::HostChanged {
          room_id: room_id.clone(),
          connection_id: host.connection_id,
        },
      );
    }
    self.broadcast_members(&room_id);

    let Some(room) = self.rooms.room_mut(&room_id) else {
      return;
    };
    let members = room.members().to_vec();
    let broken = room
      .session
      .as_mut()
      .is_some_and(|session| session.is_active() && !session.reconcile(&members).is_empty());
    if broken {
      let outcome = room.session.take().and_then(TurnSession::end);
      tracing::info!("Session in room {} ended: a participant left", room_id);
      self.broadcast(
        &room_id,
        ServerMessage::SessionEnded {
          reason: SessionEndReason::ParticipantLeft,
          outcome,
        },
      );
    }
  }

  fn toggle_mute(&mut self, conn: &ConnectionId) -> Result<(), CoreError> {
    let (room_id, _) = self.rooms.toggle_mute(conn).ok_or(CoreError::NotInRoom)?;
    self.broadcast_members(&room_id);
    Ok(())
  }

  fn list_members(&self, conn: &ConnectionId) -> Result<(), CoreError> {
    let room = self.current_room(conn)?;
    self.send_to(
      conn,
      ServerMessage::MemberList {
        room_id: room.id.clone(),
        members: room.members().to_vec(),
      },
    );
    Ok(())
  }

  // ---------------------------------------------------------------- mesh

  fn signal(&mut self, conn: &ConnectionId, target: ConnectionId, payload: SignalPayload) -> Result<(), CoreError> {
    let room = self.current_room_mut(conn)?;
    if room.member(&target).is_none() {
      return Err(CoreError::NegotiationTargetGone(target));
    }

    let forward = match payload {
      SignalPayload::Offer { .. } => room.mesh.route_offer(conn, &target) != OfferRoute::GlareLost,
      SignalPayload::Answer { .. } => room.mesh.route_answer(conn, &target),
      SignalPayload::Candidate { .. } => true,
    };
    if !forward {
      tracing::debug!("Not relaying {:?} from {} to {}", payload, conn, target);
      return Ok(());
    }
    self.send_to(
      &target,
      ServerMessage::Signal {
        from: conn.clone(),
        payload,
      },
    );
    Ok(())
  }

  fn ready_to_negotiate(&mut self, conn: &ConnectionId) -> Result<(), CoreError> {
    let room = self.current_room_mut(conn)?;
    let members = room.connection_ids();
    room.mesh.announce_ready(conn, &members);
    let room_id = room.id.clone();
    self.broadcast_except(&room_id, conn, ServerMessage::PeerReady { connection_id: conn.clone() });
    Ok(())
  }

  fn request_reinitiate(&mut self, conn: &ConnectionId, target: ConnectionId) -> Result<(), CoreError> {
    let room = self.current_room(conn)?;
    if room.member(&target).is_none() {
      return Err(CoreError::NegotiationTargetGone(target));
    }
    self.send_to(&target, ServerMessage::PleaseReinitiate { peer: conn.clone() });
    Ok(())
  }

  fn link_status(&mut self, conn: &ConnectionId, peer: ConnectionId, state: LinkState) -> Result<(), CoreError> {
    let timers = Arc::clone(&self.timers);
    let retry = self.settings.link_retry;
    let room = self.current_room_mut(conn)?;
    if room.member(&peer).is_none() {
      return Err(CoreError::NegotiationTargetGone(peer));
    }

    let room_id = room.id.clone();
    match room.mesh.report_status(conn, &peer, state, &room_id, timers.as_ref(), retry) {
      Supervision::None => {}
      Supervision::RetryScheduled { initiator, attempt } => {
        tracing::debug!("{} will retry link to {} (attempt {})", initiator, peer, attempt);
      }
      Supervision::AskInitiator { initiator, responder } => {
        self.send_to(&initiator, ServerMessage::PleaseReinitiate { peer: responder });
      }
    }
    Ok(())
  }

  fn media_unavailable(&mut self, conn: &ConnectionId, reason: String) -> Result<(), CoreError> {
    let room = self.current_room_mut(conn)?;
    let aborted = room.mesh.abort_attempts(conn);
    tracing::debug!("Aborted {} pending links of {}", aborted.len(), conn);
    Err(CoreError::LocalMediaUnavailable(reason))
  }

  // ---------------------------------------------------------------- sessions

  fn start_session(
    &mut self,
    conn: &ConnectionId,
    game_type: GameType,
    seats: Vec<SeatRequest>,
  ) -> Result<(), CoreError> {
    let timers = Arc::clone(&self.timers);
    let turn_timeout = self.settings.turn_timeout;
    let room = self.hosted_room_mut(conn)?;
    if room.session.as_ref().is_some_and(TurnSession::is_active) {
      return Err(CoreError::SessionActive);
    }

    let participants = if seats.is_empty() {
      let max = *game_type.rules().seats().end();
      room.members().iter().take(max).map(Participant::from_member).collect()
    } else {
      seats
        .into_iter()
        .map(|seat| match seat {
          SeatRequest::Member { connection_id } => room
            .member(&connection_id)
            .map(Participant::from_member)
            .ok_or_else(|| CoreError::InvalidParticipants(format!("{connection_id} is not in the room"))),
          SeatRequest::Bot { name } => Ok(Participant::bot(name)),
        })
        .collect::<Result<Vec<_>, _>>()?
    };

    let mut session = TurnSession::new(room.id.clone(), game_type, participants, turn_timeout)?;
    session.start(timers.as_ref())?;
    let state = session.public_state();
    room.session = Some(session);

    let room_id = room.id.clone();
    self.broadcast(&room_id, ServerMessage::SessionStarted { state });
    Ok(())
  }

  fn submit_move(&mut self, conn: &ConnectionId, move_data: serde_json::Value) -> Result<(), CoreError> {
    let timers = Arc::clone(&self.timers);
    let room = self.current_room_mut(conn)?;
    let actor = room.member(conn).map(|m| m.identity_key()).ok_or(CoreError::NotInRoom)?;
    let session = room.session.as_mut().ok_or(CoreError::NoSession)?;

    session.submit_move(&actor, &move_data, timers.as_ref())?;
    let state = session.public_state();
    let room_id = room.id.clone();
    self.broadcast(&room_id, ServerMessage::SessionStateChanged { state });
    Ok(())
  }

  fn restart_session(&mut self, conn: &ConnectionId) -> Result<(), CoreError> {
    let timers = Arc::clone(&self.timers);
    let room = self.hosted_room_mut(conn)?;
    let members = room.members().to_vec();
    let session = room.session.as_mut().ok_or(CoreError::NoSession)?;

    session.restart(&members, timers.as_ref())?;
    let state = session.public_state();
    let room_id = room.id.clone();
    self.broadcast(&room_id, ServerMessage::SessionStarted { state });
    Ok(())
  }

  fn end_session(&mut self, conn: &ConnectionId) -> Result<(), CoreError> {
    let room = self.hosted_room_mut(conn)?;
    let session = room.session.take().ok_or(CoreError::NoSession)?;
    let outcome = session.end();
    let room_id = room.id.clone();
    tracing::info!("Session in room {} ended by host", room_id);
    self.broadcast(
      &room_id,
      ServerMessage::SessionEnded {
        reason: SessionEndReason::HostEnded,
        outcome,
      },
    );
    Ok(())
  }

  /// Deliver an invitation to a user wherever they are connected.
  fn invite(&mut self, conn: &ConnectionId, invitee: UserId, game_type: Option<GameType>) -> Result<(), CoreError> {
    let from = self.inviter(conn).ok_or(CoreError::IdentityRequired)?;
    let Some(target) = self.identities.resolve(&invitee).cloned() else {
      tracing::debug!("Invitee {} is not registered; dropping invitation", invitee);
      return Ok(());
    };
    let room_id = RoomRegistry::derive_two_party_room_id(&from.user_id, &invitee);
    self.send_to(
      &target,
      ServerMessage::Invitation {
        from,
        room_id,
        game_type,
      },
    );
    Ok(())
  }

  fn inviter(&self, conn: &ConnectionId) -> Option<LogicalUser> {
    if let Some(user) = self.clients.get(conn).and_then(|c| c.identity.clone()) {
      return Some(user);
    }
    let room_id = self.rooms.room_of(conn)?;
    let member = self.rooms.room(room_id)?.member(conn)?;
    let user_id = member.user_id.clone()?;
    Some(LogicalUser::new(user_id, member.display_name.clone()))
  }

  // ---------------------------------------------------------------- chat

  async fn chat(&mut self, conn: &ConnectionId, text: String) -> Result<(), CoreError> {
    let room = self.current_room(conn)?;
    let member = room.member(conn).ok_or(CoreError::NotInRoom)?;
    let message = ArchivedMessage::new(
      room.id.clone(),
      conn.clone(),
      member.user_id.clone(),
      member.display_name.clone(),
      text,
    );
    let room_id = room.id.clone();

    if let Err(err) = self.archive.append(&room_id, message.clone()).await {
      tracing::warn!("Failed to archive message in room {}: {}", room_id, err);
    }
    self.broadcast(&room_id, ServerMessage::Chat { message });
    Ok(())
  }

  async fn history(&mut self, conn: &ConnectionId, limit: Option<usize>) -> Result<(), CoreError> {
    let room_id = self.current_room(conn)?.id.clone();
    let limit = limit.unwrap_or(self.settings.history_limit).min(self.settings.history_limit);

    let messages = match self.archive.recent_history(&room_id, limit).await {
      Ok(messages) => messages,
      Err(err) => {
        tracing::warn!("Failed to load history for room {}: {}", room_id, err);
        Vec::new()
      }
    };
    self.send_to(conn, ServerMessage::History { room_id, messages });
    Ok(())
  }

  // ---------------------------------------------------------------- helpers

  fn current_room(&self, conn: &ConnectionId) -> Result<&Room, CoreError> {
    let room_id = self.rooms.room_of(conn).ok_or(CoreError::NotInRoom)?;
    self.rooms.room(room_id).ok_or(CoreError::NotInRoom)
  }

  fn current_room_mut(&mut self, conn: &ConnectionId) -> Result<&mut Room, CoreError> {
    let room_id = self.rooms.room_of(conn).cloned().ok_or(CoreError::NotInRoom)?;
    self.rooms.room_mut(&room_id).ok_or(CoreError::NotInRoom)
  }

  fn hosted_room_mut(&mut self, conn: &ConnectionId) -> Result<&mut Room, CoreError> {
    let room = self.current_room_mut(conn)?;
    if !room.is_host(conn) {
      return Err(CoreError::NotHost);
    }
    Ok(room)
  }

  fn send_to(&self, conn: &ConnectionId, message: ServerMessage) {
    match self.clients.get(conn) {
      Some(client) => {
        if client.outbound.send(message).is_err() {
          tracing::debug!("Outbound channel of {} is closed", conn);
        }
      }
      None => tracing::debug!("No client {}; dropping message", conn),
    }
  }

  fn broadcast(&self, room_id: &RoomId, message: ServerMessage) {
    let Some(room) = self.rooms.room(room_id) else {
      return;
    };
    for member in room.members() {
      self.send_to(&member.connection_id, message.clone());
    }
  }

  fn broadcast_except(&self, room_id: &RoomId, except: &ConnectionId, message: ServerMessage) {
    let Some(room) = self.rooms.room(room_id) else {
      return;
    };
    for member in room.members().iter().filter(|m| &m.connection_id != except) {
      self.send_to(&member.connection_id, message.clone());
    }
  }

  fn broadcast_members(&self, room_id: &RoomId) {
    let Some(room) = self.rooms.room(room_id) else {
      return;
    };
    self.broadcast(
      room_id,
      ServerMessage::MemberListChanged {
        room_id: room_id.clone(),
        members: room.members().to_vec(),
      },
    );
  }

  pub fn rooms(&self) -> &RoomRegistry {
    &self.rooms
  }

  pub fn identities(&self) -> &IdentityRegistry {
    &self.identities
  }
}

/// ######################################## TESTS ########################################
