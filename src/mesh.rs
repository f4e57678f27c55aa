//! Per-room full-mesh negotiation bookkeeping.
//!
//! The server never touches media. It only observes the offer/answer traffic
//! it relays and the health reports clients send, and from that it decides
//! which side of a link is the initiator, which messages to forward and who
//! should restart a broken link.

use serde::{Deserialize, Serialize};
use std::{
  collections::{BTreeMap, BTreeSet},
  time::{Duration, Instant},
};

use crate::{
  identity::ConnectionId,
  room::RoomId,
  timer::{TimerHandle, TimerId, TimerKind, TimerScheduler},
};

/// Identifies one negotiation attempt on a link.
pub type AttemptId = u64;

/// Unordered pair of connections, stored sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkKey {
  low: ConnectionId,
  high: ConnectionId,
}

impl LinkKey {
  pub fn new(a: &ConnectionId, b: &ConnectionId) -> Self {
    if a <= b {
      Self { low: a.clone(), high: b.clone() }
    } else {
      Self { low: b.clone(), high: a.clone() }
    }
  }

  pub fn involves(&self, connection_id: &ConnectionId) -> bool {
    &self.low == connection_id || &self.high == connection_id
  }

  /// The end that is not `connection_id`.
  pub fn other(&self, connection_id: &ConnectionId) -> Option<&ConnectionId> {
    if &self.low == connection_id {
      Some(&self.high)
    } else if &self.high == connection_id {
      Some(&self.low)
    } else {
      None
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
  New,
  Connecting,
  Connected,
  Failed,
  Disconnected,
  /// The initiator's retry timer is armed.
  Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkRole {
  Initiator,
  Responder,
}

/// Outcome of a negotiation collision: a pure function of the two ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlareResolution {
  pub initiator: ConnectionId,
  pub responder: ConnectionId,
}

/// The lexicographically larger id keeps the initiator role; the smaller surrenders.
pub fn resolve_glare(a: &ConnectionId, b: &ConnectionId) -> GlareResolution {
  let (responder, initiator) = if a <= b { (a, b) } else { (b, a) };
  GlareResolution {
    initiator: initiator.clone(),
    responder: responder.clone(),
  }
}

#[derive(Debug, Default, Clone)]
pub struct LinkHealth {
  pub last_report: Option<LinkState>,
  pub reported_at: Option<Instant>,
  pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct PeerLink {
  pub key: LinkKey,
  pub initiator: ConnectionId,
  pub state: LinkState,
  pub attempt: AttemptId,
  /// Sender of the offer that has not been answered yet.
  pending_offer: Option<ConnectionId>,
  pub health: LinkHealth,
  retry: Option<TimerHandle>,
}

impl PeerLink {
  fn new(key: LinkKey, initiator: ConnectionId, attempt: AttemptId) -> Self {
    Self {
      key,
      initiator,
      state: LinkState::New,
      attempt,
      pending_offer: None,
      health: LinkHealth::default(),
      retry: None,
    }
  }

  pub fn responder(&self) -> &ConnectionId {
    self.key.other(&self.initiator).unwrap_or(&self.initiator)
  }

  pub fn role_of(&self, connection_id: &ConnectionId) -> LinkRole {
    if &self.initiator == connection_id {
      LinkRole::Initiator
    } else {
      LinkRole::Responder
    }
  }

  pub fn pending_offer(&self) -> Option<&ConnectionId> {
    self.pending_offer.as_ref()
  }

  pub fn retry_timer(&self) -> Option<TimerId> {
    self.retry.as_ref().map(TimerHandle::id)
  }

  fn cancel_retry(&mut self) {
    if let Some(retry) = self.retry.take() {
      retry.cancel();
    }
  }
}

/// What the relay should do with an offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferRoute {
  Forward,
  /// Crossed an offer from the target; the sender keeps the initiator role.
  GlareWon,
  /// Crossed an offer from the target; the sender surrenders.
  GlareLost,
}

/// Follow-up required after a health report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supervision {
  None,
  /// The initiator's retry timer was armed.
  RetryScheduled { initiator: ConnectionId, attempt: AttemptId },
  /// The responder saw the failure; the initiator must re-initiate.
  AskInitiator { initiator: ConnectionId, responder: ConnectionId },
}

/// A link as seen from one of its ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSummary {
  pub peer: ConnectionId,
  pub role: LinkRole,
  pub state: LinkState,
  pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
pub struct PeerMesh {
  links: BTreeMap<LinkKey, PeerLink>,
  ready: BTreeSet<ConnectionId>,
  next_attempt: AttemptId,
}

impl PeerMesh {
  pub fn new() -> Self {
    Self::default()
  }

  fn fresh_attempt(&mut self) -> AttemptId {
    self.next_attempt += 1;
    self.next_attempt
  }

  /// Mark `announcer` ready and open a link from every other member lacking one.
  ///
  /// Existing members become initiators of the new links; the announcer is
  /// the responder. Returns the keys of the links created.
  pub fn announce_ready(&mut self, announcer: &ConnectionId, members: &[ConnectionId]) -> Vec<LinkKey> {
    self.ready.insert(announcer.clone());
    let mut created = Vec::new();
    for other in members.iter().filter(|m| *m != announcer) {
      let key = LinkKey::new(announcer, other);
      if self.links.contains_key(&key) {
        continue;
      }
      let attempt = self.fresh_attempt();
      self
        .links
        .insert(key.clone(), PeerLink::new(key.clone(), other.clone(), attempt));
      created.push(key);
    }
    created
  }

  pub fn is_ready(&self, connection_id: &ConnectionId) -> bool {
    self.ready.contains(connection_id)
  }

  /// Record an offer from `from` to `to` and decide whether to relay it.
  pub fn route_offer(&mut self, from: &ConnectionId, to: &ConnectionId) -> OfferRoute {
    let key = LinkKey::new(from, to);
    let attempt = self.fresh_attempt();
    let link = self
      .links
      .entry(key.clone())
      .or_insert_with(|| PeerLink::new(key, from.clone(), attempt));

    if link.pending_offer.as_ref() == Some(to) {
      let resolution = resolve_glare(from, to);
      if &resolution.initiator != from {
        tracing::debug!("Glare on {:?}: dropping offer from {}", link.key, from);
        return OfferRoute::GlareLost;
      }
      tracing::debug!("Glare on {:?}: {} keeps initiator role", link.key, from);
      link.initiator = from.clone();
      link.pending_offer = Some(from.clone());
      link.attempt = attempt;
      return OfferRoute::GlareWon;
    }

    // A fresh offer replaces whatever attempt was in flight, including an
    // armed retry.
    link.cancel_retry();
    link.initiator = from.clone();
    link.pending_offer = Some(from.clone());
    link.attempt = attempt;
    if link.state != LinkState::Connected {
      link.state = LinkState::Connecting;
    }
    OfferRoute::Forward
  }

  /// Whether an answer from `from` matches the offer `to` sent.
  pub fn route_answer(&mut self, from: &ConnectionId, to: &ConnectionId) -> bool {
    let Some(link) = self.links.get_mut(&LinkKey::new(from, to)) else {
      return false;
    };
    if link.pending_offer.as_ref() != Some(to) {
      return false;
    }
    link.pending_offer = None;
    true
  }

  /// Apply a client's health report for its link to `peer`.
  pub fn report_status(
    &mut self,
    reporter: &ConnectionId,
    peer: &ConnectionId,
    reported: LinkState,
    room_id: &RoomId,
    timers: &dyn TimerScheduler,
    retry_delay: Duration,
  ) -> Supervision {
    let Some(link) = self.links.get_mut(&LinkKey::new(reporter, peer)) else {
      return Supervision::None;
    };
    link.health.last_report = Some(reported);
    link.health.reported_at = Some(Instant::now());

    match reported {
      LinkState::Connected => {
        link.cancel_retry();
        link.state = LinkState::Connected;
        link.pending_offer = None;
        link.health.consecutive_failures = 0;
        Supervision::None
      }
      LinkState::New | LinkState::Connecting => {
        if link.state != LinkState::Reconnecting {
          link.state = LinkState::Connecting;
        }
        Supervision::None
      }
      LinkState::Reconnecting => Supervision::None,
      LinkState::Failed | LinkState::Disconnected => {
        if link.state == LinkState::Reconnecting {
          tracing::debug!("Link {:?} already reconnecting; absorbing report", link.key);
          return Supervision::None;
        }
        link.health.consecutive_failures += 1;

        if &link.initiator == reporter {
          link.state = LinkState::Reconnecting;
          link.retry = Some(timers.arm(
            retry_delay,
            TimerKind::LinkRetry {
              room_id: room_id.clone(),
              link: link.key.clone(),
              attempt: link.attempt,
            },
          ));
          Supervision::RetryScheduled {
            initiator: link.initiator.clone(),
            attempt: link.attempt,
          }
        } else {
          link.state = reported;
          Supervision::AskInitiator {
            initiator: link.initiator.clone(),
            responder: reporter.clone(),
          }
        }
      }
    }
  }

  /// Handle a retry timer firing.
  ///
  /// Acts only if the link is still reconnecting on the same attempt with the
  /// same timer; the link is reset for a fresh attempt and the
  /// `(initiator, responder)` pair is returned.
  pub fn retry_due(
    &mut self,
    key: &LinkKey,
    attempt: AttemptId,
    timer: TimerId,
  ) -> Option<(ConnectionId, ConnectionId)> {
    let fresh = self.next_attempt + 1;
    let link = self.links.get_mut(key)?;
    if link.state != LinkState::Reconnecting || link.attempt != attempt || link.retry_timer() != Some(timer) {
      return None;
    }
    link.retry = None;
    link.state = LinkState::New;
    link.pending_offer = None;
    link.attempt = fresh;
    let pair = (link.initiator.clone(), link.responder().clone());
    self.next_attempt = fresh;
    Some(pair)
  }

  /// Abort every link of `connection_id` that has not connected yet and
  /// withdraw its readiness.
  pub fn abort_attempts(&mut self, connection_id: &ConnectionId) -> Vec<LinkKey> {
    self.ready.remove(connection_id);
    let aborted: Vec<LinkKey> = self
      .links
      .iter()
      .filter(|(key, link)| {
        key.involves(connection_id) && matches!(link.state, LinkState::New | LinkState::Connecting)
      })
      .map(|(key, _)| key.clone())
      .collect();
    for key in &aborted {
      self.links.remove(key);
    }
    aborted
  }

  /// Tear down every link that references `connection_id`.
  pub fn remove_member(&mut self, connection_id: &ConnectionId) {
    self.ready.remove(connection_id);
    self.links.retain(|key, _| !key.involves(connection_id));
  }

  pub fn shutdown(&mut self) {
    self.ready.clear();
    self.links.clear();
  }

  pub fn link(&self, a: &ConnectionId, b: &ConnectionId) -> Option<&PeerLink> {
    self.links.get(&LinkKey::new(a, b))
  }

  pub fn links_of<'a>(&'a self, connection_id: &'a ConnectionId) -> impl Iterator<Item = &'a PeerLink> + 'a {
    self.links.values().filter(move |link| link.key.involves(connection_id))
  }

  pub fn summary_for(&self, connection_id: &ConnectionId) -> Vec<LinkSummary> {
    self
      .links_of(connection_id)
      .filter_map(|link| {
        Some(LinkSummary {
          peer: link.key.other(connection_id)?.clone(),
          role: link.role_of(connection_id),
          state: link.state,
          consecutive_failures: link.health.consecutive_failures,
        })
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self.links.len()
  }

  pub fn is_empty(&self) -> bool {
    self.links.is_empty()
  }
}

/// ######################################## TESTS ########################################

#[cfg(test)]
mod tests {
  use super::*;
  use crate::timer::testing::ManualTimers;

  const RETRY: Duration = Duration::from_secs(3);

  fn c(id: &str) -> ConnectionId {
    ConnectionId::from(id)
  }

  fn room() -> RoomId {
    RoomId::normalize("mesh01")
  }

  fn ready_pair() -> PeerMesh {
    let mut mesh = PeerMesh::new();
    mesh.announce_ready(&c("a"), &[c("a")]);
    mesh.announce_ready(&c("b"), &[c("a"), c("b")]);
    mesh
  }

  #[test]
  fn existing_members_initiate_to_announcer() {
    let mut mesh = PeerMesh::new();
    assert!(mesh.announce_ready(&c("a"), &[c("a")]).is_empty());
    let created = mesh.announce_ready(&c("c"), &[c("a"), c("b"), c("c")]);
    assert_eq!(created.len(), 2);

    let link = mesh.link(&c("a"), &c("c")).unwrap();
    assert_eq!(link.initiator, c("a"));
    assert_eq!(link.responder(), &c("c"));
    assert_eq!(link.state, LinkState::New);

    // Announcing again does not duplicate links.
    assert!(mesh.announce_ready(&c("c"), &[c("a"), c("b"), c("c")]).is_empty());
    assert_eq!(mesh.len(), 2);
  }

  #[test]
  fn glare_resolution_is_order_independent() {
    let (x, y) = (c("3f2a"), c("9b11"));
    assert_eq!(resolve_glare(&x, &y), resolve_glare(&y, &x));
    assert_eq!(resolve_glare(&x, &y).initiator, y);
  }

  #[test]
  fn crossing_offers_leave_one_initiator_in_either_order() {
    for (first, second) in [(c("a"), c("b")), (c("b"), c("a"))] {
      let mut mesh = PeerMesh::new();
      mesh.route_offer(&first, &second);
      let route = mesh.route_offer(&second, &first);

      let link = mesh.link(&first, &second).unwrap();
      assert_eq!(link.initiator, c("b"));
      assert_eq!(link.pending_offer(), Some(&c("b")));
      if second == c("b") {
        assert_eq!(route, OfferRoute::GlareWon);
      } else {
        assert_eq!(route, OfferRoute::GlareLost);
      }
    }
  }

  #[test]
  fn answers_must_match_the_outstanding_offer() {
    let mut mesh = ready_pair();
    assert_eq!(mesh.route_offer(&c("a"), &c("b")), OfferRoute::Forward);
    assert!(!mesh.route_answer(&c("a"), &c("b")));
    assert!(mesh.route_answer(&c("b"), &c("a")));
    assert!(!mesh.route_answer(&c("b"), &c("a")));
  }

  #[test]
  fn initiator_failure_arms_a_single_retry() {
    let timers = ManualTimers::new();
    let mut mesh = ready_pair();
    mesh.route_offer(&c("a"), &c("b"));
    mesh.report_status(&c("a"), &c("b"), LinkState::Connected, &room(), &timers, RETRY);

    let supervision = mesh.report_status(&c("a"), &c("b"), LinkState::Failed, &room(), &timers, RETRY);
    assert!(matches!(supervision, Supervision::RetryScheduled { ref initiator, .. } if initiator == &c("a")));
    assert_eq!(mesh.link(&c("a"), &c("b")).unwrap().state, LinkState::Reconnecting);

    // Further reports while reconnecting are absorbed.
    let again = mesh.report_status(&c("b"), &c("a"), LinkState::Disconnected, &room(), &timers, RETRY);
    assert_eq!(again, Supervision::None);
    assert_eq!(timers.count(), 1);
    assert_eq!(timers.armed()[0].1, RETRY);
  }

  #[test]
  fn responder_failure_asks_the_initiator() {
    let timers = ManualTimers::new();
    let mut mesh = ready_pair();
    mesh.route_offer(&c("a"), &c("b"));

    let supervision = mesh.report_status(&c("b"), &c("a"), LinkState::Failed, &room(), &timers, RETRY);
    assert_eq!(
      supervision,
      Supervision::AskInitiator {
        initiator: c("a"),
        responder: c("b")
      }
    );
    assert_eq!(timers.count(), 0);
    assert_eq!(mesh.link(&c("a"), &c("b")).unwrap().health.consecutive_failures, 1);
  }

  #[test]
  fn retry_fires_only_for_the_current_attempt() {
    let timers = ManualTimers::new();
    let mut mesh = ready_pair();
    mesh.route_offer(&c("a"), &c("b"));
    let Supervision::RetryScheduled { attempt, .. } =
      mesh.report_status(&c("a"), &c("b"), LinkState::Failed, &room(), &timers, RETRY)
    else {
      panic!("expected retry");
    };
    let fired = timers.last().unwrap();
    let key = LinkKey::new(&c("a"), &c("b"));

    assert!(mesh.retry_due(&key, attempt + 1, fired.id).is_none());
    assert!(mesh.retry_due(&key, attempt, fired.id + 1).is_none());
    assert_eq!(mesh.retry_due(&key, attempt, fired.id), Some((c("a"), c("b"))));

    let link = mesh.link(&c("a"), &c("b")).unwrap();
    assert_eq!(link.state, LinkState::New);
    assert_ne!(link.attempt, attempt);
    assert!(mesh.retry_due(&key, attempt, fired.id).is_none());
  }

  #[test]
  fn replacement_offer_supersedes_pending_retry() {
    let timers = ManualTimers::new();
    let mut mesh = ready_pair();
    mesh.route_offer(&c("a"), &c("b"));
    let Supervision::RetryScheduled { attempt, .. } =
      mesh.report_status(&c("a"), &c("b"), LinkState::Failed, &room(), &timers, RETRY)
    else {
      panic!("expected retry");
    };
    let fired = timers.last().unwrap();

    assert_eq!(mesh.route_offer(&c("a"), &c("b")), OfferRoute::Forward);
    assert_eq!(mesh.link(&c("a"), &c("b")).unwrap().state, LinkState::Connecting);
    assert!(mesh.retry_due(&LinkKey::new(&c("a"), &c("b")), attempt, fired.id).is_none());
  }

  #[test]
  fn media_failure_aborts_pending_links_only() {
    let timers = ManualTimers::new();
    let mut mesh = PeerMesh::new();
    mesh.announce_ready(&c("a"), &[c("a")]);
    mesh.announce_ready(&c("b"), &[c("a"), c("b")]);
    mesh.announce_ready(&c("c"), &[c("a"), c("b"), c("c")]);
    mesh.report_status(&c("a"), &c("c"), LinkState::Connected, &room(), &timers, RETRY);

    let aborted = mesh.abort_attempts(&c("c"));
    assert_eq!(aborted, vec![LinkKey::new(&c("b"), &c("c"))]);
    assert!(mesh.link(&c("a"), &c("c")).is_some());
    assert!(!mesh.is_ready(&c("c")));
  }

  #[test]
  fn leaving_tears_down_every_link_of_the_member() {
    let mut mesh = PeerMesh::new();
    mesh.announce_ready(&c("a"), &[c("a")]);
    mesh.announce_ready(&c("b"), &[c("a"), c("b")]);
    mesh.announce_ready(&c("c"), &[c("a"), c("b"), c("c")]);
    assert_eq!(mesh.len(), 3);

    mesh.remove_member(&c("b"));
    assert_eq!(mesh.len(), 1);
    assert!(mesh.links_of(&c("b")).next().is_none());
  }

  #[test]
  fn summary_reports_role_and_failures() {
    let timers = ManualTimers::new();
    let mut mesh = ready_pair();
    mesh.route_offer(&c("a"), &c("b"));
    mesh.report_status(&c("b"), &c("a"), LinkState::Failed, &room(), &timers, RETRY);

    let summary = mesh.summary_for(&c("b"));
    assert_eq!(
      summary,
      vec![LinkSummary {
        peer: c("a"),
        role: LinkRole::Responder,
        state: LinkState::Failed,
        consecutive_failures: 1,
      }]
    );
  }
}
