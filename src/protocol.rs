//! JSON messages exchanged with clients over the WebSocket.
//!
//! Every frame is an internally tagged object: `{"type": "joinRoom", "roomId": "K7QX2M"}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  archive::ArchivedMessage,
  error::ErrorCode,
  identity::{ConnectionId, LogicalUser, UserId},
  mesh::{LinkState, LinkSummary},
  room::{Member, RoomId, RoomInfo},
  rules::GameType,
  session::{PublicSessionState, SessionOutcome},
};

/// Negotiation payload relayed between peers. The server only looks at the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalPayload {
  Offer {
    sdp: String,
  },
  Answer {
    sdp: String,
  },
  Candidate {
    candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp_m_line_index: Option<u32>,
  },
}

/// One seat requested in `startSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "seat", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SeatRequest {
  Member { connection_id: ConnectionId },
  Bot { name: String },
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
  RegisterIdentity {
    user_id: UserId,
    display_name: String,
  },
  CreateRoom {
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    private: bool,
  },
  JoinRoom {
    room_id: String,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    display_name: Option<String>,
  },
  LeaveRoom,
  ToggleMute,
  ListMembers,
  ListRooms,

  Signal {
    target: ConnectionId,
    payload: SignalPayload,
  },
  ReadyToNegotiate,
  RequestReinitiate {
    target: ConnectionId,
  },
  LinkStatus {
    peer: ConnectionId,
    state: LinkState,
  },
  MediaUnavailable {
    reason: String,
  },
  MeshStatus,

  StartSession {
    game_type: GameType,
    #[serde(default)]
    participants: Vec<SeatRequest>,
  },
  SubmitMove {
    move_data: Value,
  },
  RestartSession,
  EndSession,
  Invite {
    user_id: UserId,
    #[serde(default)]
    game_type: Option<GameType>,
  },

  Chat {
    text: String,
  },
  History {
    #[serde(default)]
    limit: Option<usize>,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEndReason {
  HostEnded,
  ParticipantLeft,
}

/// Messages sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
  Registered {
    connection_id: ConnectionId,
    user: Option<LogicalUser>,
  },
  RoomCreated {
    room_id: RoomId,
    member: Member,
  },
  RoomJoined {
    room_id: RoomId,
    member: Member,
    rejoin: bool,
  },
  JoinRejected {
    code: ErrorCode,
    reason: String,
  },
  MemberLeft {
    room_id: RoomId,
    member: Member,
  },
  MemberListChanged {
    room_id: RoomId,
    members: Vec<Member>,
  },
  MemberList {
    room_id: RoomId,
    members: Vec<Member>,
  },
  RoomList {
    rooms: Vec<RoomInfo>,
  },
  HostChanged {
    room_id: RoomId,
    connection_id: ConnectionId,
  },
  Superseded {
    room_id: RoomId,
  },

  Signal {
    from: ConnectionId,
    payload: SignalPayload,
  },
  PeerReady {
    connection_id: ConnectionId,
  },
  PleaseReinitiate {
    peer: ConnectionId,
  },
  RestartNegotiation {
    peer: ConnectionId,
  },
  MeshStatus {
    links: Vec<LinkSummary>,
  },

  SessionStarted {
    state: PublicSessionState,
  },
  SessionStateChanged {
    state: PublicSessionState,
  },
  SessionEnded {
    reason: SessionEndReason,
    outcome: Option<SessionOutcome>,
  },
  IllegalMove {
    reason: String,
  },
  Invitation {
    from: LogicalUser,
    room_id: RoomId,
    game_type: Option<GameType>,
  },

  Chat {
    message: ArchivedMessage,
  },
  History {
    room_id: RoomId,
    messages: Vec<ArchivedMessage>,
  },

  Error {
    code: ErrorCode,
    message: String,
  },
}

impl ServerMessage {
  pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
    ServerMessage::Error {
      code,
      message: message.into(),
    }
  }
}
