//! Peer session: handshake, dual channels and lifecycle
//!
//! # State Machine
//!
//! ```text
//!           initialize
//!   Idle ─────────────► Negotiating ──── usable ────► Connected ◄───────┐
//!                          │                           │    ▲          │
//!                          │ hard failure   transient  │    │ cleared  │ usable
//!                          │                           ▼    │          │
//!                          │                          Unstable         │
//!                          │                           │               │
//!                          └──────────────────────────►├──► Recovering ┘
//!                                          hard failure│
//!                                                      ▼
//!                      budget / relay-only / timeout  Failed
//!
//!   any ── close() ──► Closed
//! ```
//!
//! "Usable" means the transport reports Connected and the reliable channel
//! is open. All transitions go through [`next_state`]; the session applies
//! side effects (events, signals, transport calls) around it.
//!
//! The session never talks to the relay directly: outbound signals are
//! queued and drained by the owner with [`PeerSession::poll_signal`].

use crate::channel::{ChannelSet, Heartbeat};
use crate::codec;
use crate::config::{HeartbeatConfig, RecoveryPolicy};
use crate::ice::{IceServer, IceServerSet};
use crate::metrics::SessionMetrics;
use crate::recovery::{GiveUpReason, RecoveryAction, RecoveryController};
use crate::signaling::{IceCandidateInit, Role, SessionDescription, SignalEvent};
use crate::transport::{
    ChannelKind, PeerTransport, TransportError, TransportEvent, TransportFactory,
    TransportParams, TransportState,
};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// State
// ============================================================================

/// Why a session ended in Failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Responder received no offer in time
    HandshakeTimeout,
    /// Restart budget spent
    RestartsExhausted,
    /// Relay-only transport failed; no fallback left
    RelayFailed,
    /// Transport could not be driven any further
    Transport(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::HandshakeTimeout => write!(f, "handshake timeout"),
            FailureReason::RestartsExhausted => write!(f, "restart budget exhausted"),
            FailureReason::RelayFailed => write!(f, "relay-only transport failed"),
            FailureReason::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl From<GiveUpReason> for FailureReason {
    fn from(reason: GiveUpReason) -> Self {
        match reason {
            GiveUpReason::RelayOnly => FailureReason::RelayFailed,
            GiveUpReason::BudgetExhausted => FailureReason::RestartsExhausted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Unstable,
    Recovering { attempt: u32 },
    Failed(FailureReason),
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed(_) | SessionState::Closed)
    }
}

/// Inputs to the transition function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateInput {
    Initialized,
    /// Transport connected and reliable channel open
    Usable,
    TransientDisconnect,
    TransientCleared,
    RestartGranted { attempt: u32 },
    GiveUp(FailureReason),
    Close,
}

/// The session's transition function
pub fn next_state(state: &SessionState, input: &StateInput) -> SessionState {
    use SessionState as S;
    use StateInput as I;

    match (state, input) {
        (S::Closed, _) => S::Closed,
        (_, I::Close) => S::Closed,
        (S::Failed(_), _) => state.clone(),

        (S::Idle, I::Initialized) => S::Negotiating,

        (S::Negotiating | S::Recovering { .. } | S::Unstable, I::Usable) => S::Connected,
        (S::Unstable, I::TransientCleared) => S::Connected,
        (S::Connected, I::TransientDisconnect) => S::Unstable,

        (
            S::Negotiating | S::Connected | S::Unstable | S::Recovering { .. },
            I::RestartGranted { attempt },
        ) => S::Recovering { attempt: *attempt },

        (_, I::GiveUp(reason)) => S::Failed(reason.clone()),

        _ => state.clone(),
    }
}

/// Offer/answer negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Lifecycle and data events surfaced to the owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// First time the session became usable
    Established,
    /// Transient loss of connectivity
    Unstable,
    /// A restart was granted (Initiator re-offers, Responder waits)
    Reconnecting { attempt: u32 },
    /// Usable again after Unstable or Recovering
    Restored,
    /// Terminal failure
    Lost(FailureReason),
    /// Application frame (keepalives are filtered out)
    Message { channel: ChannelKind, data: Vec<u8> },
}

// ============================================================================
// Parameters
// ============================================================================

/// Everything `initialize` needs besides the transport factory
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub role: Role,
    pub room_id: String,
    pub opponent_ref: Option<String>,
    /// Raw list; validated once at construction
    pub ice_servers: Vec<IceServer>,
    pub handshake_timeout: Duration,
    pub recovery: RecoveryPolicy,
    pub heartbeat: HeartbeatConfig,
}

fn random_session_id() -> u64 {
    let mut bytes = [0u8; 8];
    if SystemRandom::new().fill(&mut bytes).is_err() {
        log::warn!("System RNG unavailable, falling back to time-based session id");
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        return nanos;
    }
    u64::from_be_bytes(bytes)
}

// ============================================================================
// Session
// ============================================================================

pub struct PeerSession {
    id: u64,
    role: Role,
    room_id: String,
    opponent_ref: Option<String>,
    state: SessionState,
    signaling_state: SignalingState,
    remote_description: Option<SessionDescription>,
    /// Remote description for the current generation applied
    remote_ready: bool,
    /// Generation of the last remote offer applied
    offer_generation: Option<u32>,
    pending_candidates: Vec<IceCandidateInit>,
    transport: Box<dyn PeerTransport>,
    transport_state: TransportState,
    channels: ChannelSet,
    heartbeat: Heartbeat,
    heartbeat_stale: bool,
    recovery: RecoveryController,
    ice_servers: IceServerSet,
    handshake_timeout: Duration,
    /// Responder offer wait, or restart wait
    deadline: Option<Instant>,
    established_once: bool,
    outbound: VecDeque<SignalEvent>,
    events: VecDeque<SessionEvent>,
    metrics: Arc<SessionMetrics>,
}

impl PeerSession {
    /// Build the transport and start negotiating
    ///
    /// Initiator: creates both channels and queues the offer.
    /// Responder: arms the handshake timer and waits for the offer.
    pub fn initialize(
        params: SessionParams,
        factory: &mut dyn TransportFactory,
        metrics: Arc<SessionMetrics>,
        now: Instant,
    ) -> Result<Self, TransportError> {
        let ice_servers = IceServerSet::validate(&params.ice_servers);
        let policy = ice_servers.policy();
        let id = random_session_id();

        let transport = factory.create(&TransportParams {
            role: params.role,
            session_id: id,
            ice_servers: ice_servers.clone(),
            policy,
        })?;

        log::info!(
            "Session {:016x}: {} in room {} (policy {:?}, {} ICE server(s))",
            id,
            params.role,
            params.room_id,
            policy,
            ice_servers.servers().len()
        );
        SessionMetrics::inc(&metrics.sessions_created_total);

        let mut session = Self {
            id,
            role: params.role,
            room_id: params.room_id,
            opponent_ref: params.opponent_ref,
            state: SessionState::Idle,
            signaling_state: SignalingState::Stable,
            remote_description: None,
            remote_ready: false,
            offer_generation: None,
            pending_candidates: Vec::new(),
            transport,
            transport_state: TransportState::New,
            channels: ChannelSet::new(),
            heartbeat: Heartbeat::new(&params.heartbeat),
            heartbeat_stale: false,
            recovery: RecoveryController::new(params.role, &params.recovery, policy),
            ice_servers,
            handshake_timeout: params.handshake_timeout,
            deadline: None,
            established_once: false,
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            metrics,
        };

        session.apply(StateInput::Initialized);

        match session.role {
            Role::Initiator => {
                session.transport.create_channels()?;
                session.send_offer(false)?;
            }
            Role::Responder => {
                session.deadline = Some(now + session.handshake_timeout);
            }
        }

        Ok(session)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn ice_servers(&self) -> &IceServerSet {
        &self.ice_servers
    }

    pub fn restart_attempts(&self) -> u32 {
        self.recovery.restart_attempts()
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_channel_open(&self, channel: ChannelKind) -> bool {
        self.channels.is_open(channel)
    }

    /// Last time anything arrived from the peer, keepalives included
    pub fn last_activity(&self) -> Option<Instant> {
        self.heartbeat.last_activity()
    }

    pub fn keepalives_sent(&self) -> u64 {
        self.heartbeat.keepalives_sent()
    }

    /// Remote candidates waiting for a remote description
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    // ------------------------------------------------------------------------
    // State plumbing
    // ------------------------------------------------------------------------

    fn apply(&mut self, input: StateInput) -> bool {
        let next = next_state(&self.state, &input);
        if next == self.state {
            return false;
        }
        log::debug!(
            "Session {:016x}: {:?} -> {:?} ({:?})",
            self.id,
            self.state,
            next,
            input
        );
        self.state = next;
        true
    }

    fn signal(&mut self, event: SignalEvent) {
        self.outbound.push_back(event);
    }

    fn send_offer(&mut self, ice_restart: bool) -> Result<(), TransportError> {
        let offer = self.transport.create_offer(ice_restart)?;
        self.signaling_state = SignalingState::HaveLocalOffer;
        self.remote_ready = false;
        self.signal(SignalEvent::Offer {
            offer,
            to: self.room_id.clone(),
            target_ref: self.opponent_ref.clone(),
        });
        Ok(())
    }

    fn flush_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            log::debug!(
                "Session {:016x}: applying {} held candidate(s)",
                self.id,
                pending.len()
            );
        }
        for candidate in pending {
            if let Err(e) = self.transport.add_remote_candidate(&candidate) {
                log::debug!("Session {:016x}: candidate rejected: {}", self.id, e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------------

    /// Apply a remote offer (Responder) and queue the answer
    pub fn handle_offer(&mut self, offer: &SessionDescription) {
        if self.state.is_terminal() {
            return;
        }
        if self.role == Role::Initiator {
            log::debug!("Session {:016x}: initiator ignoring remote offer", self.id);
            return;
        }

        let generation = offer.generation();
        if let (Some(g), Some(applied)) = (generation, self.offer_generation) {
            if g <= applied {
                log::debug!(
                    "Session {:016x}: discarding {} offer (generation {}, applied {})",
                    self.id,
                    if g == applied { "duplicate" } else { "late" },
                    g,
                    applied
                );
                SessionMetrics::inc(&self.metrics.stale_offers_total);
                return;
            }
        }

        self.signaling_state = SignalingState::HaveRemoteOffer;
        let answer = match self.transport.accept_offer(offer) {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("Session {:016x}: rejecting offer: {}", self.id, e);
                self.signaling_state = SignalingState::Stable;
                return;
            }
        };

        self.remote_description = Some(offer.clone());
        self.remote_ready = true;
        self.offer_generation = generation.or(self.offer_generation);
        self.signaling_state = SignalingState::Stable;
        if self.state == SessionState::Negotiating {
            // initial offer arrived; only the restart wait stays armed
            self.deadline = None;
        }
        self.flush_pending_candidates();

        log::debug!(
            "Session {:016x}: answering {}offer",
            self.id,
            if offer.has_flag("x-ice-restart") { "ICE-restart " } else { "" }
        );
        self.signal(SignalEvent::Answer {
            answer,
            to: self.room_id.clone(),
            target_ref: self.opponent_ref.clone(),
        });
    }

    /// Apply a remote answer; discarded unless an offer is outstanding
    pub fn handle_answer(&mut self, answer: &SessionDescription) {
        if self.state.is_terminal() {
            return;
        }
        if self.signaling_state != SignalingState::HaveLocalOffer {
            log::debug!(
                "Session {:016x}: discarding answer in {:?}",
                self.id,
                self.signaling_state
            );
            SessionMetrics::inc(&self.metrics.stale_answers_total);
            return;
        }

        if let Err(e) = self.transport.accept_answer(answer) {
            log::warn!("Session {:016x}: rejecting answer: {}", self.id, e);
            return;
        }

        self.remote_description = Some(answer.clone());
        self.remote_ready = true;
        self.signaling_state = SignalingState::Stable;
        self.flush_pending_candidates();
    }

    /// Apply a remote candidate, or hold it until the remote description lands
    pub fn handle_remote_candidate(&mut self, candidate: IceCandidateInit) {
        if self.state.is_terminal() {
            return;
        }
        if !self.remote_ready {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.transport.add_remote_candidate(&candidate) {
            log::debug!("Session {:016x}: candidate rejected: {}", self.id, e);
        }
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Send one frame; false if the target channel is not open
    pub fn send(&mut self, data: &[u8], reliable: bool) -> bool {
        let channel = if reliable {
            ChannelKind::Reliable
        } else {
            ChannelKind::Unreliable
        };
        if self.state.is_terminal() || !self.channels.is_open(channel) {
            return false;
        }
        let sent = self.transport.send(channel, data);
        if sent {
            SessionMetrics::inc(&self.metrics.messages_sent_total);
        }
        sent
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Drive the transport, timers and heartbeat
    pub fn poll(&mut self, now: Instant) {
        if self.state.is_terminal() {
            return;
        }

        if let Err(e) = self.transport.poll(now) {
            log::warn!("Session {:016x}: transport poll failed: {}", self.id, e);
            self.hard_failure(now);
        }

        while let Some(event) = self.transport.poll_event() {
            if self.state.is_terminal() {
                break;
            }
            self.handle_transport_event(event, now);
        }

        if self.state.is_terminal() {
            return;
        }

        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.deadline = None;
                self.on_deadline(now);
                if self.state.is_terminal() {
                    return;
                }
            }
        }

        self.poll_heartbeat(now);
    }

    fn on_deadline(&mut self, now: Instant) {
        match self.state {
            SessionState::Negotiating if self.role == Role::Responder => {
                log::warn!(
                    "Session {:016x}: no offer within {:?}",
                    self.id,
                    self.handshake_timeout
                );
                SessionMetrics::inc(&self.metrics.handshake_timeouts_total);
                self.fail(FailureReason::HandshakeTimeout);
            }
            SessionState::Recovering { attempt } => {
                log::warn!(
                    "Session {:016x}: restart {} did not complete within {:?}",
                    self.id,
                    attempt,
                    self.handshake_timeout
                );
                self.hard_failure(now);
            }
            _ => {}
        }
    }

    fn poll_heartbeat(&mut self, now: Instant) {
        if !matches!(self.state, SessionState::Connected | SessionState::Unstable) {
            return;
        }

        if self.channels.is_open(ChannelKind::Unreliable) && self.heartbeat.poll_keepalive(now) {
            self.transport
                .send(ChannelKind::Unreliable, &codec::encode_keepalive());
        }

        let stale = self.heartbeat.is_stale(now);
        if stale && self.state == SessionState::Connected {
            log::info!("Session {:016x}: peer silent, marking unstable", self.id);
            self.heartbeat_stale = true;
            self.transient(now);
        } else if !stale && self.heartbeat_stale {
            self.heartbeat_stale = false;
            self.try_usable(now);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.signal(SignalEvent::IceCandidate {
                    candidate,
                    to: self.room_id.clone(),
                    target_ref: self.opponent_ref.clone(),
                });
            }
            TransportEvent::StateChanged(state) => {
                log::debug!("Session {:016x}: transport {:?}", self.id, state);
                self.transport_state = state;
                match state {
                    TransportState::Connected => self.try_usable(now),
                    TransportState::Disconnected => self.transient(now),
                    TransportState::Failed => self.hard_failure(now),
                    TransportState::Closed => {
                        self.fail(FailureReason::Transport("closed by transport".into()))
                    }
                    TransportState::New | TransportState::Checking => {}
                }
            }
            TransportEvent::ChannelOpen(kind) => {
                log::debug!("Session {:016x}: {} channel open", self.id, kind);
                self.channels.set_open(kind, true);
                if kind == ChannelKind::Reliable {
                    self.try_usable(now);
                }
            }
            TransportEvent::ChannelClosed(kind) => {
                log::debug!("Session {:016x}: {} channel closed", self.id, kind);
                self.channels.set_open(kind, false);
                if kind == ChannelKind::Reliable {
                    self.transient(now);
                }
            }
            TransportEvent::Message { channel, data } => {
                self.heartbeat.record_activity(now);
                if codec::is_keepalive(&data) {
                    return;
                }
                SessionMetrics::inc(&self.metrics.messages_received_total);
                self.events.push_back(SessionEvent::Message { channel, data });
            }
        }
    }

    fn try_usable(&mut self, now: Instant) {
        if self.transport_state != TransportState::Connected
            || !self.channels.is_usable()
            || self.heartbeat_stale
        {
            return;
        }

        let previous = self.state.clone();
        if !self.apply(StateInput::Usable) {
            return;
        }

        self.deadline = None;
        self.heartbeat.reset(now);
        self.recovery.on_reconnected();

        if previous == SessionState::Negotiating && !self.established_once {
            self.established_once = true;
            log::info!("Session {:016x}: established", self.id);
            SessionMetrics::inc(&self.metrics.sessions_established_total);
            self.events.push_back(SessionEvent::Established);
        } else {
            log::info!("Session {:016x}: restored", self.id);
            self.events.push_back(SessionEvent::Restored);
        }
    }

    fn transient(&mut self, _now: Instant) {
        if self.state != SessionState::Connected {
            return;
        }
        if self.recovery.on_transient_disconnect() == RecoveryAction::NotifyUnstable
            && self.apply(StateInput::TransientDisconnect)
        {
            self.events.push_back(SessionEvent::Unstable);
        }
    }

    fn hard_failure(&mut self, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        self.channels.close_all();

        match self.recovery.on_hard_failure() {
            RecoveryAction::RestartIce { attempt } => {
                self.apply(StateInput::RestartGranted { attempt });
                SessionMetrics::inc(&self.metrics.restarts_total);
                self.events.push_back(SessionEvent::Reconnecting { attempt });
                self.deadline = Some(now + self.handshake_timeout);
                if let Err(e) = self.send_offer(true) {
                    log::warn!("Session {:016x}: ICE restart failed: {}", self.id, e);
                    self.fail(FailureReason::Transport(e.to_string()));
                }
            }
            RecoveryAction::AwaitRestart { attempt } => {
                self.apply(StateInput::RestartGranted { attempt });
                SessionMetrics::inc(&self.metrics.restarts_total);
                self.events.push_back(SessionEvent::Reconnecting { attempt });
                self.deadline = Some(now + self.handshake_timeout);
            }
            RecoveryAction::GiveUp(reason) => self.fail(reason.into()),
            RecoveryAction::NotifyUnstable => self.transient(now),
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        if !self.apply(StateInput::GiveUp(reason.clone())) {
            return;
        }
        log::warn!("Session {:016x}: lost ({})", self.id, reason);
        SessionMetrics::inc(&self.metrics.sessions_lost_total);
        self.deadline = None;
        self.channels.close_all();
        self.transport.close();
        self.events.push_back(SessionEvent::Lost(reason));
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Next signal to forward to the relay
    pub fn poll_signal(&mut self) -> Option<SignalEvent> {
        self.outbound.pop_front()
    }

    /// Earliest instant `poll` has work to do
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let mut timeout = self.transport.timeout();
        let mut merge = |d: Duration| {
            timeout = Some(timeout.map_or(d, |t| t.min(d)));
        };
        if let Some(deadline) = self.deadline {
            merge(deadline.saturating_duration_since(now));
        }
        if matches!(self.state, SessionState::Connected | SessionState::Unstable) {
            merge(self.heartbeat.next_deadline(now));
        }
        timeout
    }

    /// Release channels and transport; idempotent, suppresses later events
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        log::info!("Session {:016x}: closing", self.id);
        self.apply(StateInput::Close);
        self.deadline = None;
        self.channels.close_all();
        self.transport.close();
        self.pending_candidates.clear();
        self.outbound.clear();
        self.events.clear();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &format_args!("{:016x}", self.id))
            .field("role", &self.role)
            .field("room_id", &self.room_id)
            .field("state", &self.state)
            .field("signaling_state", &self.signaling_state)
            .field("channels", &self.channels)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryNetwork, MemoryTransportFactory};

    fn params(role: Role) -> SessionParams {
        SessionParams {
            role,
            room_id: "room-1".into(),
            opponent_ref: None,
            ice_servers: Vec::new(),
            handshake_timeout: Duration::from_secs(15),
            recovery: RecoveryPolicy { max_restarts: 2 },
            heartbeat: HeartbeatConfig::default(),
        }
    }

    struct Pair {
        net: MemoryNetwork,
        a: PeerSession,
        b: PeerSession,
        now: Instant,
        /// Every offer the initiator has sent, in order
        offers: Vec<SessionDescription>,
    }

    impl Pair {
        fn new() -> Self {
            let net = MemoryNetwork::new();
            let mut factory = MemoryTransportFactory::new(net.clone());
            let metrics = Arc::new(SessionMetrics::new());
            let now = Instant::now();
            let a = PeerSession::initialize(params(Role::Initiator), &mut factory, metrics.clone(), now)
                .unwrap();
            let b = PeerSession::initialize(params(Role::Responder), &mut factory, metrics, now)
                .unwrap();
            Self {
                net,
                a,
                b,
                now,
                offers: Vec::new(),
            }
        }

        /// Exchange signals and poll both sides until quiet
        fn pump(&mut self) {
            for _ in 0..8 {
                self.a.poll(self.now);
                self.b.poll(self.now);
                while let Some(sig) = self.a.poll_signal() {
                    if let SignalEvent::Offer { offer, .. } = &sig {
                        self.offers.push(offer.clone());
                    }
                    deliver(&mut self.b, sig);
                }
                while let Some(sig) = self.b.poll_signal() {
                    deliver(&mut self.a, sig);
                }
            }
        }

        fn advance(&mut self, d: Duration) {
            self.now += d;
        }
    }

    fn deliver(session: &mut PeerSession, sig: SignalEvent) {
        match sig {
            SignalEvent::Offer { offer, .. } => session.handle_offer(&offer),
            SignalEvent::Answer { answer, .. } => session.handle_answer(&answer),
            SignalEvent::IceCandidate { candidate, .. } => session.handle_remote_candidate(candidate),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    fn events(session: &mut PeerSession) -> Vec<SessionEvent> {
        std::iter::from_fn(|| session.poll_event()).collect()
    }

    #[test]
    fn test_transition_function() {
        use SessionState as S;
        use StateInput as I;

        assert_eq!(next_state(&S::Idle, &I::Initialized), S::Negotiating);
        assert_eq!(next_state(&S::Negotiating, &I::Usable), S::Connected);
        assert_eq!(next_state(&S::Connected, &I::TransientDisconnect), S::Unstable);
        assert_eq!(next_state(&S::Unstable, &I::TransientCleared), S::Connected);
        assert_eq!(
            next_state(&S::Unstable, &I::RestartGranted { attempt: 1 }),
            S::Recovering { attempt: 1 }
        );
        assert_eq!(next_state(&S::Recovering { attempt: 1 }, &I::Usable), S::Connected);
        assert_eq!(
            next_state(&S::Connected, &I::GiveUp(FailureReason::RelayFailed)),
            S::Failed(FailureReason::RelayFailed)
        );
        assert_eq!(next_state(&S::Failed(FailureReason::HandshakeTimeout), &I::Close), S::Closed);
        assert_eq!(next_state(&S::Closed, &I::Initialized), S::Closed);
        // no shortcut from Idle to Connected
        assert_eq!(next_state(&S::Idle, &I::Usable), S::Idle);
        // Failed is sticky apart from Close
        assert_eq!(
            next_state(&S::Failed(FailureReason::RestartsExhausted), &I::Usable),
            S::Failed(FailureReason::RestartsExhausted)
        );
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let mut p = Pair::new();
        assert_eq!(p.a.signaling_state(), SignalingState::HaveLocalOffer);
        p.pump();

        assert!(p.a.is_connected());
        assert!(p.b.is_connected());
        assert_eq!(events(&mut p.a), vec![SessionEvent::Established]);
        assert_eq!(events(&mut p.b), vec![SessionEvent::Established]);
        assert!(p.a.is_channel_open(ChannelKind::Unreliable));
    }

    #[test]
    fn test_send_and_receive_filters_keepalive() {
        let mut p = Pair::new();
        p.pump();
        events(&mut p.a);
        events(&mut p.b);

        assert!(p.a.send(&[0x01, 0x02], true));
        assert!(p.a.send(&[0x05], false));
        p.pump();

        assert_eq!(
            events(&mut p.b),
            vec![
                SessionEvent::Message {
                    channel: ChannelKind::Reliable,
                    data: vec![0x01, 0x02]
                },
                SessionEvent::Message {
                    channel: ChannelKind::Unreliable,
                    data: vec![0x05]
                },
            ]
        );
    }

    #[test]
    fn test_send_before_connected_is_false() {
        let p = Pair::new();
        let mut a = p.a;
        assert!(!a.send(b"x", true));
        assert!(!a.send(b"x", false));
    }

    #[test]
    fn test_stale_answer_discarded() {
        let mut p = Pair::new();
        p.pump();
        let before = p.a.remote_description().cloned();

        let bogus = SessionDescription::answer("v=0\r\na=x-memory-endpoint:999\r\na=x-generation:7\r\n");
        p.a.handle_answer(&bogus);

        assert_eq!(p.a.remote_description().cloned(), before);
        assert!(p.a.is_connected());
        assert_eq!(p.a.metrics.stale_answers_total.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_candidates_held_until_remote_description() {
        let mut p = Pair::new();
        // candidate arrives before the offer
        p.b.handle_remote_candidate(IceCandidateInit::new("candidate:early 1 udp 1 10.0.0.1 5000 typ host"));
        assert_eq!(p.b.pending_candidate_count(), 1);

        p.pump();
        assert_eq!(p.b.pending_candidate_count(), 0);
        assert!(p.b.is_connected());
    }

    #[test]
    fn test_responder_handshake_timeout() {
        let net = MemoryNetwork::new();
        let mut factory = MemoryTransportFactory::new(net);
        let now = Instant::now();
        let mut b = PeerSession::initialize(
            params(Role::Responder),
            &mut factory,
            Arc::new(SessionMetrics::new()),
            now,
        )
        .unwrap();

        b.poll(now + Duration::from_secs(14));
        assert!(events(&mut b).is_empty());

        b.poll(now + Duration::from_secs(15));
        b.poll(now + Duration::from_secs(16));
        assert_eq!(
            events(&mut b),
            vec![SessionEvent::Lost(FailureReason::HandshakeTimeout)]
        );
        assert_eq!(b.state(), &SessionState::Failed(FailureReason::HandshakeTimeout));
    }

    #[test]
    fn test_transient_disconnect_and_restore() {
        let mut p = Pair::new();
        p.pump();
        events(&mut p.a);
        events(&mut p.b);

        let fault = p.net.fault_handles()[0].clone();
        fault.disconnect();
        p.pump();
        assert_eq!(events(&mut p.a), vec![SessionEvent::Unstable]);
        assert_eq!(p.a.state(), &SessionState::Unstable);

        fault.restore();
        p.pump();
        assert_eq!(events(&mut p.a), vec![SessionEvent::Restored]);
        assert!(p.a.is_connected());
        assert_eq!(p.a.restart_attempts(), 0);
    }

    #[test]
    fn test_hard_failure_restarts_ice() {
        let mut p = Pair::new();
        p.pump();
        events(&mut p.a);
        events(&mut p.b);

        p.net.fault_handles()[0].fail();
        p.pump();

        let a_events = events(&mut p.a);
        assert_eq!(
            a_events,
            vec![SessionEvent::Reconnecting { attempt: 1 }, SessionEvent::Restored]
        );
        assert!(p.a.is_connected());
        assert!(p.b.is_connected());
        assert_eq!(p.a.restart_attempts(), 0);
        assert!(p.a.send(b"after", true));
    }

    #[test]
    fn test_duplicate_offer_ignored() {
        let mut p = Pair::new();
        p.pump();
        events(&mut p.a);
        events(&mut p.b);
        assert_eq!(p.offers.len(), 1);

        let first = p.offers[0].clone();
        p.b.handle_offer(&first);
        assert!(p.b.poll_signal().is_none());
        assert_eq!(p.b.metrics.stale_offers_total.load(std::sync::atomic::Ordering::Relaxed), 1);
        p.pump();
        assert!(p.b.is_connected());
        assert!(events(&mut p.b).is_empty());

        // the link still reports faults after the duplicate
        let fault = p.net.fault_handles()[0].clone();
        fault.disconnect();
        p.pump();
        assert_eq!(events(&mut p.b), vec![SessionEvent::Unstable]);
        fault.restore();
        p.pump();
        assert_eq!(events(&mut p.b), vec![SessionEvent::Restored]);
        assert!(p.b.is_connected());
    }

    #[test]
    fn test_late_offer_after_restart_ignored() {
        let mut p = Pair::new();
        p.pump();
        p.net.fault_handles()[0].fail();
        p.pump();
        assert!(p.a.is_connected());
        assert!(p.b.is_connected());
        assert_eq!(p.offers.len(), 2);
        events(&mut p.a);
        events(&mut p.b);

        let stale = p.offers[0].clone();
        p.b.handle_offer(&stale);
        assert!(p.b.poll_signal().is_none());
        p.pump();
        assert!(p.b.is_connected());
        assert!(p.b.is_channel_open(ChannelKind::Reliable));
        assert!(events(&mut p.b).is_empty());
        assert_eq!(p.b.metrics.stale_offers_total.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(p.b.remote_description(), p.offers.last());
        assert!(p.a.send(b"after", true));
    }

    #[test]
    fn test_bounded_restarts() {
        let p = Pair::new();
        let Pair { mut a, mut b, net, mut now, .. } = p;
        for _ in 0..4 {
            a.poll(now);
            b.poll(now);
            while let Some(sig) = a.poll_signal() {
                deliver(&mut b, sig);
            }
            while let Some(sig) = b.poll_signal() {
                deliver(&mut a, sig);
            }
        }
        events(&mut a);

        // peer disappears, so no restart can ever complete
        drop(b);
        assert_eq!(net.endpoint_count(), 1);

        a.poll(now);
        assert_eq!(events(&mut a), vec![SessionEvent::Reconnecting { attempt: 1 }]);

        now += Duration::from_secs(15);
        a.poll(now);
        assert_eq!(events(&mut a), vec![SessionEvent::Reconnecting { attempt: 2 }]);

        now += Duration::from_secs(15);
        a.poll(now);
        assert_eq!(
            events(&mut a),
            vec![SessionEvent::Lost(FailureReason::RestartsExhausted)]
        );
        assert!(a.state().is_terminal());
    }

    #[test]
    fn test_activity_tracks_inbound_traffic() {
        let mut p = Pair::new();
        assert_eq!(p.a.last_activity(), None);
        assert_eq!(p.a.keepalives_sent(), 0);

        p.pump();
        let connected_at = p.now;
        assert_eq!(p.a.last_activity(), Some(connected_at));
        assert_eq!(p.a.keepalives_sent(), 1);

        p.advance(HeartbeatConfig::default().keepalive_interval());
        p.pump();
        assert_eq!(p.a.keepalives_sent(), 2);
        assert_eq!(p.b.keepalives_sent(), 2);
        assert_eq!(p.a.last_activity(), Some(p.now));
        assert!(p.a.last_activity() > Some(connected_at));
    }

    #[test]
    fn test_heartbeat_silence_marks_unstable() {
        let mut p = Pair::new();
        p.pump();
        events(&mut p.a);

        p.net.fault_handles()[1].set_blackholed(true);
        p.advance(Duration::from_millis(5001));
        p.a.poll(p.now);
        assert_eq!(events(&mut p.a), vec![SessionEvent::Unstable]);

        p.net.fault_handles()[1].set_blackholed(false);
        p.b.poll(p.now);
        p.a.poll(p.now);
        assert_eq!(events(&mut p.a), vec![SessionEvent::Restored]);
    }

    #[test]
    fn test_close_is_idempotent_and_silent() {
        let mut p = Pair::new();
        p.pump();
        p.a.close();
        p.a.close();
        assert_eq!(p.a.state(), &SessionState::Closed);
        assert!(p.a.poll_event().is_none());
        assert!(!p.a.send(b"x", true));
        p.a.poll(p.now);
        assert!(p.a.poll_event().is_none());
    }
}
