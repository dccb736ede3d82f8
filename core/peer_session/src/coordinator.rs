//! Match coordinator: the façade between the relay and a peer session
//!
//! ```text
//!             ┌──────────────── MatchCoordinator ────────────────┐
//! relay ────► │ dispatch ──► match_found ──► PeerSession ──► poll │ ──► events
//!   ▲         │    │                            ▲                 │
//!   │         │    └─► no session? ─► PendingSignals ─(replay once)┘
//!   └──────── │ outbound signals (offer/answer/candidates/stable)  │
//!             └───────────────────────────────────────────────────┘
//! ```
//!
//! Offers and candidates can reach this node before the local session for
//! their room exists (the relay delivers `offer` ahead of `match_found`, or
//! ICE servers are still being fetched). They are buffered per room and
//! replayed exactly once, in arrival order, right after the session is
//! built. Answers are never buffered: without a session there is no local
//! offer they could answer. Signals for a room this node already left are
//! dropped rather than buffered.

use crate::config::Config;
use crate::ice::IceServer;
use crate::metrics::SessionMetrics;
use crate::session::{FailureReason, PeerSession, SessionEvent, SessionParams};
use crate::signaling::{
    IceCandidateInit, Role, SessionDescription, SignalEvent, SignalingChannel, SignalingError,
};
use crate::transport::{ChannelKind, TransportFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Recently ended rooms remembered for dropping their late signals
const ENDED_ROOMS_KEPT: usize = 16;

// ============================================================================
// Pending Signals
// ============================================================================

/// A signal that arrived before its session
#[derive(Debug, Clone, PartialEq)]
pub enum PendingSignal {
    Offer(SessionDescription),
    Candidate(IceCandidateInit),
}

/// Bounded FIFO of early signals for one room
#[derive(Debug)]
pub struct PendingSignals {
    queue: VecDeque<PendingSignal>,
    capacity: usize,
    replayed: bool,
}

impl PendingSignals {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            replayed: false,
        }
    }

    /// Buffer a signal; returns the oldest one if it had to be dropped
    pub fn push(&mut self, signal: PendingSignal) -> Option<PendingSignal> {
        if self.replayed {
            return Some(signal);
        }
        let dropped = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(signal);
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Hand every buffered signal to `apply` in arrival order, then discard
    /// them. Only the first call replays anything.
    pub fn replay(&mut self, mut apply: impl FnMut(PendingSignal)) -> usize {
        if self.replayed {
            return 0;
        }
        self.replayed = true;
        let count = self.queue.len();
        for signal in self.queue.drain(..) {
            apply(signal);
        }
        count
    }
}

// ============================================================================
// Status / Events
// ============================================================================

/// User-visible connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    /// Not queued
    Idle,
    /// Queued, or matched and negotiating
    Waiting,
    Connected,
    /// Unstable or restarting
    Reconnecting,
    /// Match ended; finding a new one is up to the caller
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Queued,
    Matched {
        room_id: String,
        role: Role,
        opponent_ref: Option<String>,
    },
    Established { room_id: String },
    Unstable,
    Reconnecting { attempt: u32 },
    Restored,
    Lost(FailureReason),
    /// Opponent skipped the match
    Skipped,
    Message { channel: ChannelKind, data: Vec<u8> },
}

#[derive(Debug, Clone)]
struct Assignment {
    room_id: String,
    role: Role,
    opponent_ref: Option<String>,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct MatchCoordinator<S: SignalingChannel> {
    config: Config,
    signaling: S,
    factory: Box<dyn TransportFactory>,
    assignment: Option<Assignment>,
    awaiting_ice: bool,
    session: Option<PeerSession>,
    pending: HashMap<String, PendingSignals>,
    ended_rooms: VecDeque<String>,
    status: MatchStatus,
    events: VecDeque<CoordinatorEvent>,
    metrics: Arc<SessionMetrics>,
}

impl<S: SignalingChannel> MatchCoordinator<S> {
    pub fn new(config: Config, signaling: S, factory: Box<dyn TransportFactory>) -> Self {
        Self::with_metrics(config, signaling, factory, Arc::new(SessionMetrics::new()))
    }

    pub fn with_metrics(
        config: Config,
        signaling: S,
        factory: Box<dyn TransportFactory>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            config,
            signaling,
            factory,
            assignment: None,
            awaiting_ice: false,
            session: None,
            pending: HashMap::new(),
            ended_rooms: VecDeque::new(),
            status: MatchStatus::Idle,
            events: VecDeque::new(),
            metrics,
        }
    }

    pub fn status(&self) -> MatchStatus {
        self.status
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }

    pub fn session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.room_id.as_str())
    }

    pub fn signaling(&self) -> &S {
        &self.signaling
    }

    /// Signals buffered for a room that has no session yet
    pub fn pending_count(&self, room_id: &str) -> usize {
        self.pending.get(room_id).map_or(0, PendingSignals::len)
    }

    pub fn poll_event(&mut self) -> Option<CoordinatorEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Enter the relay's matchmaking queue
    pub fn join_queue(&mut self, preferences: serde_json::Value) -> Result<(), SignalingError> {
        log::info!("Joining queue (mode {})", self.config.mode);
        self.signaling.send(SignalEvent::JoinQueue {
            mode: self.config.mode.clone(),
            preferences,
        })?;
        self.status = MatchStatus::Waiting;
        Ok(())
    }

    /// Send an application frame; false if no channel is open
    pub fn send(&mut self, data: &[u8], reliable: bool) -> bool {
        match self.session.as_mut() {
            Some(session) => session.send(data, reliable),
            None => false,
        }
    }

    /// Skip the current opponent
    pub fn skip(&mut self) -> Result<(), SignalingError> {
        if self.assignment.is_none() {
            return Ok(());
        }
        log::info!("Skipping match");
        self.teardown();
        self.status = MatchStatus::Disconnected;
        self.signaling.send(SignalEvent::SkipMatch {})
    }

    /// Tear down without telling the relay
    pub fn leave(&mut self) {
        log::info!("Leaving");
        self.teardown();
        self.pending.clear();
        self.status = MatchStatus::Idle;
        self.events.clear();
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        if let Some(assignment) = self.assignment.take() {
            self.pending.remove(&assignment.room_id);
            if !self.ended_rooms.contains(&assignment.room_id) {
                if self.ended_rooms.len() == ENDED_ROOMS_KEPT {
                    self.ended_rooms.pop_front();
                }
                self.ended_rooms.push_back(assignment.room_id);
            }
        }
        self.awaiting_ice = false;
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Process inbound signals, drive the session and flush its output
    pub fn poll(&mut self, now: Instant) -> Result<(), SignalingError> {
        while let Some(event) = self.signaling.poll_recv()? {
            self.dispatch(event, now)?;
        }

        if let Some(session) = self.session.as_mut() {
            session.poll(now);
        }
        self.drain_session()
    }

    /// Earliest instant `poll` has timer work to do
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.session.as_ref().and_then(|s| s.next_timeout(now))
    }

    fn drain_session(&mut self) -> Result<(), SignalingError> {
        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };

            if let Some(signal) = session.poll_signal() {
                self.signaling.send(signal)?;
                continue;
            }

            let Some(event) = session.poll_event() else {
                return Ok(());
            };
            self.on_session_event(event)?;
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) -> Result<(), SignalingError> {
        match event {
            SessionEvent::Established => {
                self.status = MatchStatus::Connected;
                let room_id = self.room_id().unwrap_or_default().to_string();
                log::info!("Connected in room {}", room_id);
                self.signaling.send(SignalEvent::ConnectionStable {
                    room_id: room_id.clone(),
                    service: self.config.service.clone(),
                })?;
                self.events.push_back(CoordinatorEvent::Established { room_id });
            }
            SessionEvent::Unstable => {
                self.status = MatchStatus::Reconnecting;
                self.events.push_back(CoordinatorEvent::Unstable);
            }
            SessionEvent::Reconnecting { attempt } => {
                self.status = MatchStatus::Reconnecting;
                self.events
                    .push_back(CoordinatorEvent::Reconnecting { attempt });
            }
            SessionEvent::Restored => {
                self.status = MatchStatus::Connected;
                self.events.push_back(CoordinatorEvent::Restored);
            }
            SessionEvent::Lost(reason) => {
                log::warn!("Match lost: {}", reason);
                self.teardown();
                self.status = MatchStatus::Disconnected;
                self.events.push_back(CoordinatorEvent::Lost(reason));
            }
            SessionEvent::Message { channel, data } => {
                self.events
                    .push_back(CoordinatorEvent::Message { channel, data });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------------

    fn session_for(&mut self, room: &str) -> Option<&mut PeerSession> {
        self.session.as_mut().filter(|s| s.room_id() == room)
    }

    fn buffer(&mut self, room: &str, signal: PendingSignal) {
        if self.ended_rooms.iter().any(|r| r == room) {
            log::debug!("Dropping late signal for ended room {}", room);
            SessionMetrics::inc(&self.metrics.signals_dropped_total);
            return;
        }
        let capacity = self.config.max_pending_signals;
        let buffer = self
            .pending
            .entry(room.to_string())
            .or_insert_with(|| PendingSignals::new(capacity));
        SessionMetrics::inc(&self.metrics.signals_buffered_total);
        if let Some(dropped) = buffer.push(signal) {
            log::warn!("Pending buffer for room {} full, dropped {:?}", room, dropped);
            SessionMetrics::inc(&self.metrics.signals_dropped_total);
        }
    }

    fn dispatch(&mut self, event: SignalEvent, now: Instant) -> Result<(), SignalingError> {
        match event {
            SignalEvent::Queued {} => {
                self.status = MatchStatus::Waiting;
                self.events.push_back(CoordinatorEvent::Queued);
            }
            SignalEvent::MatchFound {
                room_id,
                role,
                opponent_ref,
                is_initiator,
                ice_servers,
            } => {
                if is_initiator != (role == Role::Initiator) {
                    log::warn!(
                        "match_found role {} disagrees with isInitiator={}, using role",
                        role,
                        is_initiator
                    );
                }
                if self.session.is_some() {
                    log::info!("New match {} replaces the current session", room_id);
                }
                self.teardown();

                self.ended_rooms.retain(|r| r != &room_id);
                log::info!("Matched in room {} as {}", room_id, role);
                self.events.push_back(CoordinatorEvent::Matched {
                    room_id: room_id.clone(),
                    role,
                    opponent_ref: opponent_ref.clone(),
                });
                self.assignment = Some(Assignment {
                    room_id,
                    role,
                    opponent_ref,
                });
                self.status = MatchStatus::Waiting;

                if ice_servers.is_empty() {
                    log::debug!("No ICE servers in match_found, requesting them");
                    self.awaiting_ice = true;
                    self.signaling.send(SignalEvent::GetIceServers {})?;
                } else {
                    self.construct(ice_servers, now);
                }
            }
            SignalEvent::IceServersConfig { ice_servers } => {
                if !self.awaiting_ice {
                    log::debug!("Ignoring unsolicited ice_servers_config");
                    return Ok(());
                }
                self.awaiting_ice = false;
                let servers = if ice_servers.is_empty() {
                    self.config.ice_servers.clone()
                } else {
                    ice_servers
                };
                self.construct(servers, now);
            }
            SignalEvent::Offer { offer, to, .. } => match self.session_for(&to) {
                Some(session) => session.handle_offer(&offer),
                None => self.buffer(&to, PendingSignal::Offer(offer)),
            },
            SignalEvent::IceCandidate { candidate, to, .. } => match self.session_for(&to) {
                Some(session) => session.handle_remote_candidate(candidate),
                None => self.buffer(&to, PendingSignal::Candidate(candidate)),
            },
            SignalEvent::Answer { answer, to, .. } => match self.session_for(&to) {
                Some(session) => session.handle_answer(&answer),
                None => {
                    log::debug!("Dropping answer for room {} without a session", to);
                    SessionMetrics::inc(&self.metrics.signals_dropped_total);
                }
            },
            SignalEvent::MatchSkipped {} => {
                if self.assignment.is_some() {
                    log::info!("Opponent skipped the match");
                    self.teardown();
                    self.status = MatchStatus::Disconnected;
                    self.events.push_back(CoordinatorEvent::Skipped);
                }
            }
            other => log::debug!("Ignoring {} from relay", other.name()),
        }
        Ok(())
    }

    /// Build the session for the current assignment and replay its buffer
    fn construct(&mut self, ice_servers: Vec<IceServer>, now: Instant) {
        let Some(assignment) = self.assignment.clone() else {
            return;
        };

        let params = SessionParams {
            role: assignment.role,
            room_id: assignment.room_id.clone(),
            opponent_ref: assignment.opponent_ref,
            ice_servers,
            handshake_timeout: self.config.handshake_timeout(),
            recovery: self.config.recovery,
            heartbeat: self.config.heartbeat,
        };

        let mut session =
            match PeerSession::initialize(params, self.factory.as_mut(), self.metrics.clone(), now) {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("Failed to create session: {}", e);
                    self.teardown();
                    self.status = MatchStatus::Disconnected;
                    self.events
                        .push_back(CoordinatorEvent::Lost(FailureReason::Transport(e.to_string())));
                    return;
                }
            };

        if let Some(mut buffer) = self.pending.remove(&assignment.room_id) {
            let replayed = buffer.replay(|signal| match signal {
                PendingSignal::Offer(offer) => session.handle_offer(&offer),
                PendingSignal::Candidate(candidate) => session.handle_remote_candidate(candidate),
            });
            log::debug!(
                "Replayed {} buffered signal(s) for room {}",
                replayed,
                assignment.room_id
            );
            self.metrics
                .signals_replayed_total
                .fetch_add(replayed as u64, std::sync::atomic::Ordering::Relaxed);
        }
        // buffers for any other room are stale now
        self.pending.clear();

        self.session = Some(session);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::transport::memory::{MemoryNetwork, MemoryTransportFactory};
    use crate::transport::PeerTransport;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct Scripted {
        inbox: VecDeque<SignalEvent>,
        sent: Vec<SignalEvent>,
    }

    impl SignalingChannel for Scripted {
        fn send(&mut self, event: SignalEvent) -> Result<(), SignalingError> {
            self.sent.push(event);
            Ok(())
        }

        fn poll_recv(&mut self) -> Result<Option<SignalEvent>, SignalingError> {
            Ok(self.inbox.pop_front())
        }
    }

    fn coordinator(net: &MemoryNetwork) -> MatchCoordinator<Scripted> {
        MatchCoordinator::new(
            Config::default(),
            Scripted::default(),
            Box::new(MemoryTransportFactory::new(net.clone())),
        )
    }

    fn match_found(room: &str, role: Role, ice_servers: Vec<IceServer>) -> SignalEvent {
        SignalEvent::MatchFound {
            room_id: room.into(),
            role,
            opponent_ref: Some("opponent".into()),
            is_initiator: role == Role::Initiator,
            ice_servers,
        }
    }

    fn candidate(room: &str, n: u32) -> SignalEvent {
        SignalEvent::IceCandidate {
            candidate: IceCandidateInit::new(format!(
                "candidate:c{} 1 udp 1 10.0.0.{} 5000 typ host",
                n, n
            )),
            to: room.into(),
            target_ref: None,
        }
    }

    fn stun() -> Vec<IceServer> {
        vec![IceServer::new(["stun:stun.example.org:3478"])]
    }

    fn sent_names(c: &MatchCoordinator<Scripted>) -> Vec<&'static str> {
        c.signaling().sent.iter().map(SignalEvent::name).collect()
    }

    fn events(c: &mut MatchCoordinator<Scripted>) -> Vec<CoordinatorEvent> {
        std::iter::from_fn(|| c.poll_event()).collect()
    }

    #[test]
    fn test_pending_replays_once_in_order() {
        let mut buffer = PendingSignals::new(8);
        for n in 0..3 {
            buffer.push(PendingSignal::Candidate(IceCandidateInit::new(format!("candidate:{}", n))));
        }

        let mut seen = Vec::new();
        let count = buffer.replay(|s| seen.push(s));
        assert_eq!(count, 3);
        assert_eq!(
            seen,
            (0..3)
                .map(|n| PendingSignal::Candidate(IceCandidateInit::new(format!("candidate:{}", n))))
                .collect::<Vec<_>>()
        );

        assert_eq!(buffer.replay(|_| panic!("replayed twice")), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pending_bounded_drops_oldest() {
        let mut buffer = PendingSignals::new(2);
        let c = |n: u32| PendingSignal::Candidate(IceCandidateInit::new(format!("candidate:{}", n)));
        assert!(buffer.push(c(1)).is_none());
        assert!(buffer.push(c(2)).is_none());
        assert_eq!(buffer.push(c(3)), Some(c(1)));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_early_offer_and_candidates_replayed() {
        let net = MemoryNetwork::new();
        let mut remote = net.transport(Role::Initiator);
        remote.create_channels().unwrap();
        let offer = remote.create_offer(false).unwrap();

        let mut c = coordinator(&net);
        let now = Instant::now();
        c.signaling.inbox.extend([
            SignalEvent::Offer {
                offer,
                to: "r1".into(),
                target_ref: None,
            },
            candidate("r1", 1),
            candidate("r1", 2),
        ]);
        c.poll(now).unwrap();
        assert!(c.session().is_none());
        assert_eq!(c.pending_count("r1"), 3);

        c.signaling
            .inbox
            .push_back(match_found("r1", Role::Responder, stun()));
        c.poll(now).unwrap();

        assert_eq!(c.pending_count("r1"), 0);
        assert_eq!(c.metrics().signals_buffered_total.load(Ordering::Relaxed), 3);
        assert_eq!(c.metrics().signals_replayed_total.load(Ordering::Relaxed), 3);
        assert_eq!(c.session().unwrap().pending_candidate_count(), 0);

        let answer = c
            .signaling()
            .sent
            .iter()
            .find_map(|e| match e {
                SignalEvent::Answer { answer, to, .. } if to == "r1" => Some(answer.clone()),
                _ => None,
            })
            .expect("answer sent");

        remote.accept_answer(&answer).unwrap();
        c.poll(now).unwrap();

        assert_eq!(c.status(), MatchStatus::Connected);
        assert!(sent_names(&c).contains(&"connection_stable"));
        assert!(events(&mut c).contains(&CoordinatorEvent::Established {
            room_id: "r1".into()
        }));
    }

    #[test]
    fn test_ice_servers_requested_when_missing() {
        let net = MemoryNetwork::new();
        let mut c = coordinator(&net);
        let now = Instant::now();

        c.signaling
            .inbox
            .push_back(match_found("r2", Role::Responder, Vec::new()));
        c.signaling.inbox.push_back(candidate("r2", 1));
        c.poll(now).unwrap();

        assert_eq!(sent_names(&c), vec!["get_ice_servers"]);
        assert!(c.session().is_none());
        assert_eq!(c.pending_count("r2"), 1);

        c.signaling.inbox.push_back(SignalEvent::IceServersConfig {
            ice_servers: Vec::new(),
        });
        c.poll(now).unwrap();

        let session = c.session().unwrap();
        assert_eq!(session.room_id(), "r2");
        // held until the offer lands
        assert_eq!(session.pending_candidate_count(), 1);
        assert_eq!(c.pending_count("r2"), 0);
    }

    #[test]
    fn test_answer_without_session_dropped() {
        let net = MemoryNetwork::new();
        let mut c = coordinator(&net);
        c.signaling.inbox.push_back(SignalEvent::Answer {
            answer: SessionDescription::answer("v=0"),
            to: "r3".into(),
            target_ref: None,
        });
        c.poll(Instant::now()).unwrap();
        assert_eq!(c.pending_count("r3"), 0);
        assert_eq!(c.metrics().signals_dropped_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_initiator_sends_offer() {
        let net = MemoryNetwork::new();
        let mut c = coordinator(&net);
        c.join_queue(serde_json::Value::Null).unwrap();
        assert_eq!(c.status(), MatchStatus::Waiting);

        c.signaling
            .inbox
            .push_back(match_found("r4", Role::Initiator, stun()));
        c.poll(Instant::now()).unwrap();

        let names = sent_names(&c);
        assert_eq!(names[0], "join_queue");
        assert_eq!(names[1], "offer");
        assert!(names.contains(&"ice-candidate"));
        assert_eq!(c.room_id(), Some("r4"));
    }

    #[test]
    fn test_new_match_replaces_session() {
        let net = MemoryNetwork::new();
        let mut c = coordinator(&net);
        let now = Instant::now();

        c.signaling
            .inbox
            .push_back(match_found("practice", Role::Initiator, stun()));
        c.poll(now).unwrap();
        let first = c.session().unwrap().id();

        c.signaling
            .inbox
            .push_back(match_found("real", Role::Responder, stun()));
        c.poll(now).unwrap();

        let session = c.session().unwrap();
        assert_ne!(session.id(), first);
        assert_eq!(session.room_id(), "real");
        assert_eq!(net.endpoint_count(), 1);
    }

    #[test]
    fn test_skip_and_skipped() {
        let net = MemoryNetwork::new();
        let mut c = coordinator(&net);
        let now = Instant::now();

        c.signaling
            .inbox
            .push_back(match_found("r5", Role::Initiator, stun()));
        c.poll(now).unwrap();
        c.skip().unwrap();
        assert!(c.session().is_none());
        assert_eq!(c.status(), MatchStatus::Disconnected);
        assert_eq!(sent_names(&c).last(), Some(&"skip_match"));

        c.signaling
            .inbox
            .push_back(match_found("r6", Role::Initiator, stun()));
        c.signaling.inbox.push_back(SignalEvent::MatchSkipped {});
        c.poll(now).unwrap();
        assert!(c.session().is_none());
        assert!(events(&mut c).contains(&CoordinatorEvent::Skipped));
    }

    #[test]
    fn test_late_signals_for_ended_room_dropped() {
        let net = MemoryNetwork::new();
        let mut c = coordinator(&net);
        let now = Instant::now();

        c.signaling
            .inbox
            .push_back(match_found("r10", Role::Responder, stun()));
        c.poll(now).unwrap();
        c.skip().unwrap();
        c.signaling.inbox.push_back(candidate("r10", 1));
        c.poll(now).unwrap();
        assert_eq!(c.pending_count("r10"), 0);

        c.signaling
            .inbox
            .push_back(match_found("r11", Role::Responder, stun()));
        c.poll(now).unwrap();
        c.poll(now + Duration::from_secs(16)).unwrap();
        assert!(c.session().is_none());
        c.signaling.inbox.push_back(candidate("r11", 2));
        c.signaling.inbox.push_back(candidate("r12", 3));
        c.poll(now + Duration::from_secs(17)).unwrap();
        assert_eq!(c.pending_count("r11"), 0);
        assert_eq!(c.pending_count("r12"), 1);
        assert_eq!(c.metrics().signals_dropped_total.load(Ordering::Relaxed), 2);

        // a room reassigned by the relay buffers again
        c.signaling.inbox.push_back(candidate("r10", 4));
        c.signaling
            .inbox
            .push_back(match_found("r10", Role::Responder, Vec::new()));
        c.signaling.inbox.push_back(candidate("r10", 5));
        c.poll(now + Duration::from_secs(18)).unwrap();
        assert_eq!(c.pending_count("r10"), 1);
    }

    #[test]
    fn test_handshake_timeout_reports_lost_once() {
        let net = MemoryNetwork::new();
        let mut c = coordinator(&net);
        let now = Instant::now();

        c.signaling
            .inbox
            .push_back(match_found("r7", Role::Responder, stun()));
        c.poll(now).unwrap();
        c.poll(now + Duration::from_secs(16)).unwrap();
        c.poll(now + Duration::from_secs(30)).unwrap();

        let lost: Vec<_> = events(&mut c)
            .into_iter()
            .filter(|e| matches!(e, CoordinatorEvent::Lost(_) | CoordinatorEvent::Established { .. }))
            .collect();
        assert_eq!(lost, vec![CoordinatorEvent::Lost(FailureReason::HandshakeTimeout)]);
        assert_eq!(c.status(), MatchStatus::Disconnected);
        assert!(c.session().is_none());
    }

    #[test]
    fn test_leave_clears_everything() {
        let net = MemoryNetwork::new();
        let mut c = coordinator(&net);
        c.signaling.inbox.push_back(candidate("r8", 1));
        c.signaling
            .inbox
            .push_back(match_found("r9", Role::Initiator, stun()));
        c.poll(Instant::now()).unwrap();
        assert_eq!(c.session().map(|s| s.state().clone()), Some(SessionState::Negotiating));

        c.leave();
        assert_eq!(c.status(), MatchStatus::Idle);
        assert!(c.session().is_none());
        assert_eq!(c.pending_count("r8"), 0);
        assert!(c.poll_event().is_none());
    }
}
