//! Room management: canonical ids, membership admission and host election.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
  collections::{HashMap, HashSet},
  fmt,
};

use crate::{
  error::CoreError,
  identity::{ConnectionId, IdentityKey, UserId},
  mesh::PeerMesh,
  session::TurnSession,
};

const TWO_PARTY_PREFIX: &str = "DUO_";
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Canonical room identifier.
///
/// Generated codes are trimmed and uppercased. Two-party ids only have their
/// prefix uppercased, since the user ids inside them are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
  pub fn normalize(raw: &str) -> Self {
    let raw = raw.trim();
    let prefix = raw.get(..TWO_PARTY_PREFIX.len());
    match prefix {
      Some(prefix) if prefix.eq_ignore_ascii_case(TWO_PARTY_PREFIX) => {
        Self(format!("{TWO_PARTY_PREFIX}{}", &raw[TWO_PARTY_PREFIX.len()..]))
      }
      _ => Self(raw.to_ascii_uppercase()),
    }
  }

  /// Id both parties compute independently from their two user ids.
  ///
  /// The lower id is length-prefixed (`DUO_<len>_<low>_<high>`) so no two
  /// pairs share a room, whatever characters the ids contain.
  pub fn two_party(a: &UserId, b: &UserId) -> Self {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    Self(format!("{TWO_PARTY_PREFIX}{}_{low}_{high}", low.as_str().len()))
  }

  pub fn is_two_party(&self) -> bool {
    self
      .0
      .strip_prefix(TWO_PARTY_PREFIX)
      .is_some_and(|rest| !rest.is_empty())
  }

  fn random(len: usize) -> Self {
    let mut rng = rand::thread_rng();
    let code = (0..len)
      .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
      .collect();
    Self(code)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RoomId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A connection's seat in a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
  pub connection_id: ConnectionId,
  pub user_id: Option<UserId>,
  pub display_name: String,
  pub is_host: bool,
  pub is_muted: bool,
}

impl Member {
  pub fn new(connection_id: ConnectionId, user_id: Option<UserId>, display_name: String) -> Self {
    Self {
      connection_id,
      user_id,
      display_name,
      is_host: false,
      is_muted: false,
    }
  }

  pub fn identity_key(&self) -> IdentityKey {
    IdentityKey::for_member(self.user_id.as_ref(), &self.connection_id)
  }
}

/// Capacity and id-shape configuration for the registry.
#[derive(Debug, Clone)]
pub struct RoomSettings {
  /// Distinct identities allowed in an explicitly created room
  pub group_capacity: usize,
  /// Distinct identities allowed in a lazily created two-party room
  pub two_party_capacity: usize,
  /// Length of generated room codes
  pub code_length: usize,
}

impl Default for RoomSettings {
  fn default() -> Self {
    Self {
      group_capacity: 8,
      two_party_capacity: 4,
      code_length: 6,
    }
  }
}

/// Information about a room's current state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
  pub room_id: RoomId,
  pub member_count: usize,
  pub identity_count: usize,
  pub capacity: usize,
  pub is_full: bool,
  pub session_active: bool,
}

pub struct Room {
  pub id: RoomId,
  pub capacity: usize,
  pub private: bool,
  members: Vec<Member>,
  host: Option<ConnectionId>,
  pub session: Option<TurnSession>,
  pub mesh: PeerMesh,
}

impl Room {
  pub fn new(id: RoomId, capacity: usize, private: bool) -> Self {
    Self {
      id,
      capacity,
      private,
      members: Vec::new(),
      host: None,
      session: None,
      mesh: PeerMesh::new(),
    }
  }

  pub fn members(&self) -> &[Member] {
    &self.members
  }

  pub fn member(&self, connection_id: &ConnectionId) -> Option<&Member> {
    self.members.iter().find(|m| &m.connection_id == connection_id)
  }

  pub fn host(&self) -> Option<&ConnectionId> {
    self.host.as_ref()
  }

  pub fn is_host(&self, connection_id: &ConnectionId) -> bool {
    self.host.as_ref() == Some(connection_id)
  }

  pub fn connection_ids(&self) -> Vec<ConnectionId> {
    self.members.iter().map(|m| m.connection_id.clone()).collect()
  }

  pub fn distinct_identities(&self) -> HashSet<IdentityKey> {
    self.members.iter().map(Member::identity_key).collect()
  }

  pub fn is_full(&self) -> bool {
    self.distinct_identities().len() >= self.capacity
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  pub fn info(&self) -> RoomInfo {
    RoomInfo {
      room_id: self.id.clone(),
      member_count: self.members.len(),
      identity_count: self.distinct_identities().len(),
      capacity: self.capacity,
      is_full: self.is_full(),
      session_active: self.session.as_ref().is_some_and(TurnSession::is_active),
    }
  }

  fn insert(&mut self, mut member: Member) -> Member {
    if self.members.is_empty() {
      member.is_host = true;
    }
    if member.is_host {
      for other in &mut self.members {
        other.is_host = false;
      }
      self.host = Some(member.connection_id.clone());
    }
    self.members.push(member.clone());
    member
  }

  /// Drop a member and every peer link that references it.
  fn remove(&mut self, connection_id: &ConnectionId) -> Option<Member> {
    let index = self.members.iter().position(|m| &m.connection_id == connection_id)?;
    let member = self.members.remove(index);
    self.mesh.remove_member(connection_id);
    if self.host.as_ref() == Some(connection_id) {
      self.host = None;
    }
    Some(member)
  }

  /// Hand host status to the first remaining member if nobody holds it.
  fn elect_host(&mut self) -> Option<Member> {
    if self.host.is_some() {
      return None;
    }
    let next = self.members.first_mut()?;
    next.is_host = true;
    self.host = Some(next.connection_id.clone());
    Some(next.clone())
  }

  /// Cancel every timer the room owns.
  fn shutdown(&mut self) {
    if let Some(session) = self.session.take() {
      session.end();
    }
    self.mesh.shutdown();
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKind {
  /// The connection created the room.
  Created,
  /// A new identity took a free seat.
  New,
  /// A known identity came back; `superseded` are the records it replaced.
  Rejoin { superseded: Vec<ConnectionId> },
  /// The connection was already a member; nothing changed.
  Duplicate,
}

#[derive(Debug, Clone)]
pub struct Membership {
  pub room_id: RoomId,
  pub member: Member,
  pub kind: JoinKind,
  /// Membership the connection gave up in another room to get here.
  pub previous: Option<Departure>,
}

#[derive(Debug, Clone)]
pub struct Departure {
  pub room_id: RoomId,
  pub member: Member,
  pub room_closed: bool,
  pub new_host: Option<Member>,
}

/// Owns every room and the connection-to-room index.
pub struct RoomRegistry {
  rooms: HashMap<RoomId, Room>,
  memberships: HashMap<ConnectionId, RoomId>,
  settings: RoomSettings,
}

impl RoomRegistry {
  pub fn new(settings: RoomSettings) -> Self {
    Self {
      rooms: HashMap::new(),
      memberships: HashMap::new(),
      settings,
    }
  }

  pub fn settings(&self) -> &RoomSettings {
    &self.settings
  }

  /// Create a room with a fresh code and seat the creator as host.
  pub fn create_room(
    &mut self,
    owner: ConnectionId,
    user_id: Option<UserId>,
    display_name: String,
    private: bool,
  ) -> Membership {
    let previous = self.leave(&owner);

    let id = loop {
      let id = RoomId::random(self.settings.code_length);
      if !self.rooms.contains_key(&id) && !id.is_two_party() {
        break id;
      }
    };

    let mut room = Room::new(id.clone(), self.settings.group_capacity, private);
    let member = room.insert(Member::new(owner.clone(), user_id, display_name));
    self.rooms.insert(id.clone(), room);
    self.memberships.insert(owner, id.clone());
    tracing::info!("Created room {} (private: {})", id, private);

    Membership {
      room_id: id,
      member,
      kind: JoinKind::Created,
      previous,
    }
  }

  pub fn derive_two_party_room_id(a: &UserId, b: &UserId) -> RoomId {
    RoomId::two_party(a, b)
  }

  /// Admit a connection into a room.
  ///
  /// Capacity counts distinct identities, not connections. A connection whose
  /// user id is already present is a rejoin: it replaces the old records for
  /// that user (inheriting host status) and is always admitted.
  pub fn join(
    &mut self,
    raw_room_id: &str,
    connection_id: ConnectionId,
    user_id: Option<UserId>,
    display_name: String,
  ) -> Result<Membership, CoreError> {
    let room_id = RoomId::normalize(raw_room_id);

    if let Some(room) = self.rooms.get(&room_id) {
      if let Some(existing) = room.member(&connection_id) {
        return Ok(Membership {
          room_id,
          member: existing.clone(),
          kind: JoinKind::Duplicate,
          previous: None,
        });
      }
      let key = IdentityKey::for_member(user_id.as_ref(), &connection_id);
      let identities = room.distinct_identities();
      if !identities.contains(&key) && identities.len() >= room.capacity {
        return Err(CoreError::RoomFull {
          room_id: room_id.to_string(),
          capacity: room.capacity,
        });
      }
    } else if !room_id.is_two_party() {
      return Err(CoreError::RoomNotFound(room_id.to_string()));
    }

    let previous = match self.memberships.get(&connection_id) {
      Some(current) if current != &room_id => self.leave(&connection_id),
      _ => None,
    };

    let room = self.rooms.entry(room_id.clone()).or_insert_with(|| {
      tracing::info!("Lazily created two-party room {}", room_id);
      Room::new(room_id.clone(), self.settings.two_party_capacity, true)
    });
    let created = room.is_empty();

    let mut superseded = Vec::new();
    let mut inherits_host = false;
    if let Some(uid) = user_id.as_ref() {
      let stale: Vec<ConnectionId> = room
        .members
        .iter()
        .filter(|m| m.user_id.as_ref() == Some(uid))
        .map(|m| m.connection_id.clone())
        .collect();
      for conn in stale {
        if let Some(old) = room.remove(&conn) {
          inherits_host |= old.is_host;
          superseded.push(conn);
        }
      }
    }

    let mut member = Member::new(connection_id.clone(), user_id, display_name);
    member.is_host = inherits_host;
    let member = room.insert(member);
    if !inherits_host && room.host.is_none() {
      room.elect_host();
    }

    for conn in &superseded {
      self.memberships.remove(conn);
      tracing::debug!("Connection {} superseded in room {}", conn, room_id);
    }
    self.memberships.insert(connection_id, room_id.clone());

    let kind = if created {
      JoinKind::Created
    } else if superseded.is_empty() {
      JoinKind::New
    } else {
      JoinKind::Rejoin { superseded }
    };

    Ok(Membership {
      room_id,
      member,
      kind,
      previous,
    })
  }

  /// Remove a connection from whatever room it is in.
  ///
  /// Empty rooms are destroyed together with their session and links. If the
  /// host left, the first remaining member becomes host.
  pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<Departure> {
    let room_id = self.memberships.remove(connection_id)?;
    let room = self.rooms.get_mut(&room_id)?;
    let member = room.remove(connection_id)?;

    if room.is_empty() {
      if let Some(mut room) = self.rooms.remove(&room_id) {
        room.shutdown();
      }
      tracing::info!("Room {} closed", room_id);
      return Some(Departure {
        room_id,
        member,
        room_closed: true,
        new_host: None,
      });
    }

    let new_host = room.elect_host();
    if let Some(ref host) = new_host {
      tracing::info!("Host of room {} moved to {}", room_id, host.connection_id);
    }

    Some(Departure {
      room_id,
      member,
      room_closed: false,
      new_host,
    })
  }

  pub fn toggle_mute(&mut self, connection_id: &ConnectionId) -> Option<(RoomId, Member)> {
    let room_id = self.memberships.get(connection_id)?.clone();
    let room = self.rooms.get_mut(&room_id)?;
    let member = room.members.iter_mut().find(|m| &m.connection_id == connection_id)?;
    member.is_muted = !member.is_muted;
    Some((room_id, member.clone()))
  }

  pub fn list_members(&self, room_id: &RoomId) -> Option<&[Member]> {
    self.rooms.get(room_id).map(Room::members)
  }

  pub fn room(&self, room_id: &RoomId) -> Option<&Room> {
    self.rooms.get(room_id)
  }

  pub fn room_mut(&mut self, room_id: &RoomId) -> Option<&mut Room> {
    self.rooms.get_mut(room_id)
  }

  pub fn room_of(&self, connection_id: &ConnectionId) -> Option<&RoomId> {
    self.memberships.get(connection_id)
  }

  /// Summaries of every room that is not private.
  pub fn public_rooms(&self) -> Vec<RoomInfo> {
    let mut rooms: Vec<RoomInfo> = self
      .rooms
      .values()
      .filter(|room| !room.private)
      .map(Room::info)
      .collect();
    rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
    rooms
  }

  pub fn len(&self) -> usize {
    self.rooms.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rooms.is_empty()
  }
}

impl Default for RoomRegistry {
  fn default() -> Self {
    Self::new(RoomSettings::default())
  }
}

/// ######################################## TESTS ########################################
