//! In-process transport
//!
//! A [`MemoryNetwork`] is a shared switchboard of endpoint inboxes. Two
//! [`MemoryTransport`]s find each other through their session descriptions
//! (`a=x-memory-endpoint:<id>`) and link once the Initiator applies the
//! answer:
//!
//! ```text
//! Initiator                          Responder
//!   create_offer ── offer ─────────►  accept_offer
//!   accept_answer ◄─ answer ────────
//!   Connected, channels open
//!        ── Linked{generation} ────►  Connected, channels announced
//! ```
//!
//! [`FaultHandle`] injects the transport conditions the recovery logic has
//! to handle: transient disconnects, hard failures and silent black-holing.

use super::{
    ChannelKind, PeerTransport, TransportError, TransportEvent, TransportFactory, TransportParams,
    TransportState,
};
use crate::signaling::{IceCandidateInit, Role, SessionDescription, GENERATION_ATTR};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const ENDPOINT_ATTR: &str = "x-memory-endpoint";
const RESTART_FLAG: &str = "x-ice-restart";

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Disconnect,
    Restore,
    Fail,
}

#[derive(Debug)]
enum Wire {
    Linked { generation: u32 },
    Data { channel: ChannelKind, data: Vec<u8> },
    Fault(Fault),
    PeerClosed,
}

#[derive(Debug, Default)]
struct Slot {
    inbox: VecDeque<Wire>,
    peer: Option<u64>,
    /// Silently drop everything to and from this endpoint
    blackholed: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    next_id: u64,
    slots: BTreeMap<u64, Slot>,
}

impl NetworkState {
    fn deliver(&mut self, to: u64, wire: Wire) {
        if let Some(slot) = self.slots.get_mut(&to) {
            slot.inbox.push_back(wire);
        }
    }

    fn is_blackholed(&self, id: u64) -> bool {
        self.slots.get(&id).map(|s| s.blackholed).unwrap_or(true)
    }
}

/// Shared in-process switchboard
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an unlinked endpoint
    pub fn transport(&self, role: Role) -> MemoryTransport {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.slots.insert(id, Slot::default());
            id
        };
        log::debug!("Memory transport {} created ({})", id, role);
        MemoryTransport::new(self.clone(), id, role)
    }

    /// Fault handles for every live endpoint, oldest first
    pub fn fault_handles(&self) -> Vec<FaultHandle> {
        self.lock()
            .slots
            .keys()
            .map(|&id| FaultHandle {
                network: self.clone(),
                id,
            })
            .collect()
    }

    /// Number of live endpoints
    pub fn endpoint_count(&self) -> usize {
        self.lock().slots.len()
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

/// Injects faults on the link of one endpoint (both ends observe them)
#[derive(Debug, Clone)]
pub struct FaultHandle {
    network: MemoryNetwork,
    id: u64,
}

impl FaultHandle {
    pub fn endpoint_id(&self) -> u64 {
        self.id
    }

    fn inject(&self, fault: Fault) {
        let mut state = self.network.lock();
        let peer = state.slots.get(&self.id).and_then(|s| s.peer);
        state.deliver(self.id, Wire::Fault(fault));
        if let Some(peer) = peer {
            state.deliver(peer, Wire::Fault(fault));
        }
    }

    /// Transient loss: both ends report Disconnected
    pub fn disconnect(&self) {
        self.inject(Fault::Disconnect);
    }

    /// End a transient loss
    pub fn restore(&self) {
        self.inject(Fault::Restore);
    }

    /// Hard failure: both ends report Failed and need an ICE restart
    pub fn fail(&self) {
        self.inject(Fault::Fail);
    }

    /// Drop traffic without any state change
    pub fn set_blackholed(&self, blackholed: bool) {
        if let Some(slot) = self.network.lock().slots.get_mut(&self.id) {
            slot.blackholed = blackholed;
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One end of an in-process link
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    id: u64,
    role: Role,
    peer: Option<u64>,
    generation: u32,
    state: TransportState,
    channels_created: bool,
    reliable_open: bool,
    unreliable_open: bool,
    link_up: bool,
    remote_candidates: usize,
    events: VecDeque<TransportEvent>,
    closed: bool,
}

impl MemoryTransport {
    fn new(network: MemoryNetwork, id: u64, role: Role) -> Self {
        Self {
            network,
            id,
            role,
            peer: None,
            generation: 0,
            state: TransportState::New,
            channels_created: false,
            reliable_open: false,
            unreliable_open: false,
            link_up: false,
            remote_candidates: 0,
            events: VecDeque::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Remote candidates applied so far
    pub fn remote_candidate_count(&self) -> usize {
        self.remote_candidates
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            log::debug!("Memory transport {}: {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
            self.events.push_back(TransportEvent::StateChanged(state));
        }
    }

    fn open_channels(&mut self) {
        if !self.reliable_open {
            self.reliable_open = true;
            self.events
                .push_back(TransportEvent::ChannelOpen(ChannelKind::Reliable));
        }
        if !self.unreliable_open {
            self.unreliable_open = true;
            self.events
                .push_back(TransportEvent::ChannelOpen(ChannelKind::Unreliable));
        }
    }

    fn close_channels(&mut self) {
        if self.reliable_open {
            self.reliable_open = false;
            self.events
                .push_back(TransportEvent::ChannelClosed(ChannelKind::Reliable));
        }
        if self.unreliable_open {
            self.unreliable_open = false;
            self.events
                .push_back(TransportEvent::ChannelClosed(ChannelKind::Unreliable));
        }
    }

    fn connected(&mut self) {
        self.link_up = true;
        self.set_state(TransportState::Connected);
        self.open_channels();
    }

    fn description(&self, restart: bool) -> String {
        let mut sdp = format!(
            "v=0\r\na={}:{}\r\na={}:{}\r\n",
            ENDPOINT_ATTR, self.id, GENERATION_ATTR, self.generation
        );
        if restart {
            sdp.push_str("a=");
            sdp.push_str(RESTART_FLAG);
            sdp.push_str("\r\n");
        }
        sdp
    }

    fn parse_remote(desc: &SessionDescription) -> Result<(u64, u32), TransportError> {
        let endpoint = desc
            .attribute(ENDPOINT_ATTR)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| TransportError::InvalidDescription("missing endpoint".into()))?;
        let generation = desc
            .attribute(GENERATION_ATTR)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| TransportError::InvalidDescription("missing generation".into()))?;
        Ok((endpoint, generation))
    }

    fn bind_peer(&mut self, peer: u64) {
        self.peer = Some(peer);
        if let Some(slot) = self.network.lock().slots.get_mut(&self.id) {
            slot.peer = Some(peer);
        }
    }

    fn local_candidate(&mut self) {
        let candidate = format!(
            "candidate:memory 1 udp 2130706431 127.0.0.1 {} typ host",
            self.id
        );
        self.events
            .push_back(TransportEvent::LocalCandidate(IceCandidateInit::new(candidate)));
    }

    fn handle_wire(&mut self, wire: Wire) {
        match wire {
            Wire::Linked { generation } => {
                if self.role == Role::Responder && generation == self.generation {
                    self.connected();
                } else {
                    log::debug!(
                        "Memory transport {}: stale link generation {}",
                        self.id,
                        generation
                    );
                }
            }
            Wire::Data { channel, data } => {
                let open = match channel {
                    ChannelKind::Reliable => self.reliable_open,
                    ChannelKind::Unreliable => self.unreliable_open,
                };
                if open && self.link_up {
                    self.events
                        .push_back(TransportEvent::Message { channel, data });
                }
            }
            Wire::Fault(Fault::Disconnect) => {
                if self.state == TransportState::Connected {
                    self.link_up = false;
                    self.set_state(TransportState::Disconnected);
                }
            }
            Wire::Fault(Fault::Restore) => {
                if self.state == TransportState::Disconnected {
                    self.link_up = true;
                    self.set_state(TransportState::Connected);
                }
            }
            Wire::Fault(Fault::Fail) => {
                if matches!(
                    self.state,
                    TransportState::Connected | TransportState::Disconnected | TransportState::Checking
                ) {
                    self.link_up = false;
                    self.set_state(TransportState::Failed);
                    self.close_channels();
                }
            }
            Wire::PeerClosed => {
                if self.state != TransportState::Closed {
                    self.link_up = false;
                    self.set_state(TransportState::Failed);
                    self.close_channels();
                }
            }
        }
    }
}

impl PeerTransport for MemoryTransport {
    fn create_channels(&mut self) -> Result<(), TransportError> {
        if self.role != Role::Initiator {
            return Err(TransportError::InvalidState("only the initiator creates channels"));
        }
        self.channels_created = true;
        Ok(())
    }

    fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if ice_restart || self.generation == 0 {
            self.generation += 1;
        }
        if ice_restart {
            self.link_up = false;
            self.close_channels();
        }
        self.set_state(TransportState::Checking);
        let offer = SessionDescription::offer(self.description(ice_restart));
        self.local_candidate();
        Ok(offer)
    }

    fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let (peer, generation) = Self::parse_remote(offer)?;
        if self.generation != 0 && generation <= self.generation {
            return Err(TransportError::InvalidDescription(format!(
                "offer generation {} already superseded by {}",
                generation, self.generation
            )));
        }
        // new generation: previous link is gone
        self.link_up = false;
        self.close_channels();
        self.generation = generation;
        self.bind_peer(peer);
        self.set_state(TransportState::Checking);
        let answer = SessionDescription::answer(self.description(false));
        self.local_candidate();
        Ok(answer)
    }

    fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let (peer, generation) = Self::parse_remote(answer)?;
        if generation != self.generation {
            return Err(TransportError::InvalidDescription(format!(
                "answer generation {} does not match offer generation {}",
                generation, self.generation
            )));
        }
        self.bind_peer(peer);
        {
            let mut state = self.network.lock();
            if !state.slots.contains_key(&peer) {
                return Err(TransportError::InvalidDescription(format!(
                    "unknown endpoint {}",
                    peer
                )));
            }
            state.deliver(peer, Wire::Linked { generation });
        }
        if self.channels_created {
            self.connected();
        } else {
            self.link_up = true;
            self.set_state(TransportState::Connected);
        }
        Ok(())
    }

    fn add_remote_candidate(
        &mut self,
        candidate: &IceCandidateInit,
    ) -> Result<(), TransportError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::InvalidCandidate(candidate.candidate.clone()));
        }
        self.remote_candidates += 1;
        Ok(())
    }

    fn send(&mut self, channel: ChannelKind, data: &[u8]) -> bool {
        if !self.is_channel_open(channel) {
            return false;
        }
        let Some(peer) = self.peer else {
            return false;
        };
        if self.link_up {
            let mut state = self.network.lock();
            if !state.is_blackholed(self.id) && !state.is_blackholed(peer) {
                state.deliver(
                    peer,
                    Wire::Data {
                        channel,
                        data: data.to_vec(),
                    },
                );
            }
        }
        true
    }

    fn is_channel_open(&self, channel: ChannelKind) -> bool {
        !self.closed
            && match channel {
                ChannelKind::Reliable => self.reliable_open,
                ChannelKind::Unreliable => self.unreliable_open,
            }
    }

    fn poll(&mut self, _now: Instant) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        let inbox: Vec<Wire> = match self.network.lock().slots.get_mut(&self.id) {
            Some(slot) => slot.inbox.drain(..).collect(),
            None => return Err(TransportError::Closed),
        };
        for wire in inbox {
            self.handle_wire(wire);
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reliable_open = false;
        self.unreliable_open = false;
        self.link_up = false;
        self.state = TransportState::Closed;
        self.events.clear();

        let mut state = self.network.lock();
        if let Some(peer) = self.peer {
            let still_linked = state.slots.get(&peer).and_then(|s| s.peer) == Some(self.id);
            if still_linked {
                state.deliver(peer, Wire::PeerClosed);
            }
        }
        state.slots.remove(&self.id);
        log::debug!("Memory transport {} closed", self.id);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Creates [`MemoryTransport`]s on one network
#[derive(Debug, Clone, Default)]
pub struct MemoryTransportFactory {
    network: MemoryNetwork,
}

impl MemoryTransportFactory {
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&mut self, params: &TransportParams) -> Result<Box<dyn PeerTransport>, TransportError> {
        Ok(Box::new(self.network.transport(params.role)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(t: &mut MemoryTransport) -> Vec<TransportEvent> {
        t.poll(Instant::now()).unwrap();
        std::iter::from_fn(|| t.poll_event()).collect()
    }

    fn linked_pair() -> (MemoryNetwork, MemoryTransport, MemoryTransport) {
        let net = MemoryNetwork::new();
        let mut a = net.transport(Role::Initiator);
        let mut b = net.transport(Role::Responder);
        a.create_channels().unwrap();
        let offer = a.create_offer(false).unwrap();
        let answer = b.accept_offer(&offer).unwrap();
        a.accept_answer(&answer).unwrap();
        drain(&mut a);
        drain(&mut b);
        (net, a, b)
    }

    #[test]
    fn test_link_opens_both_channels() {
        let net = MemoryNetwork::new();
        let mut a = net.transport(Role::Initiator);
        let mut b = net.transport(Role::Responder);
        a.create_channels().unwrap();

        let offer = a.create_offer(false).unwrap();
        assert_eq!(offer.attribute(GENERATION_ATTR), Some("1"));
        let answer = b.accept_offer(&offer).unwrap();
        a.accept_answer(&answer).unwrap();

        let a_events = drain(&mut a);
        assert!(a_events.contains(&TransportEvent::StateChanged(TransportState::Connected)));
        assert!(a_events.contains(&TransportEvent::ChannelOpen(ChannelKind::Reliable)));

        let b_events = drain(&mut b);
        assert!(b_events.contains(&TransportEvent::ChannelOpen(ChannelKind::Reliable)));
        assert!(b_events.contains(&TransportEvent::ChannelOpen(ChannelKind::Unreliable)));
        assert!(b_events
            .iter()
            .any(|e| matches!(e, TransportEvent::LocalCandidate(_))));
    }

    #[test]
    fn test_data_both_channels() {
        let (_net, mut a, mut b) = linked_pair();
        assert!(a.send(ChannelKind::Reliable, b"move"));
        assert!(b.send(ChannelKind::Unreliable, b"pose"));

        assert_eq!(
            drain(&mut b),
            vec![TransportEvent::Message {
                channel: ChannelKind::Reliable,
                data: b"move".to_vec()
            }]
        );
        assert_eq!(
            drain(&mut a),
            vec![TransportEvent::Message {
                channel: ChannelKind::Unreliable,
                data: b"pose".to_vec()
            }]
        );
    }

    #[test]
    fn test_superseded_offer_rejected() {
        let net = MemoryNetwork::new();
        let mut a = net.transport(Role::Initiator);
        let mut b = net.transport(Role::Responder);
        a.create_channels().unwrap();
        let first = a.create_offer(false).unwrap();
        let answer = b.accept_offer(&first).unwrap();
        a.accept_answer(&answer).unwrap();
        drain(&mut a);
        drain(&mut b);
        assert_eq!(b.state(), TransportState::Connected);

        assert!(matches!(
            b.accept_offer(&first),
            Err(TransportError::InvalidDescription(_))
        ));
        assert_eq!(b.state(), TransportState::Connected);
        assert!(drain(&mut b).is_empty());

        let restart = a.create_offer(true).unwrap();
        let answer = b.accept_offer(&restart).unwrap();
        a.accept_answer(&answer).unwrap();
        drain(&mut a);
        drain(&mut b);
        assert!(matches!(
            b.accept_offer(&first),
            Err(TransportError::InvalidDescription(_))
        ));
        assert_eq!(b.state(), TransportState::Connected);
    }

    #[test]
    fn test_send_before_open_is_false() {
        let net = MemoryNetwork::new();
        let mut a = net.transport(Role::Initiator);
        assert!(!a.send(ChannelKind::Reliable, b"x"));
    }

    #[test]
    fn test_disconnect_and_restore() {
        let (net, mut a, mut b) = linked_pair();
        let fault = &net.fault_handles()[0];

        fault.disconnect();
        assert_eq!(
            drain(&mut a),
            vec![TransportEvent::StateChanged(TransportState::Disconnected)]
        );
        assert_eq!(
            drain(&mut b),
            vec![TransportEvent::StateChanged(TransportState::Disconnected)]
        );

        fault.restore();
        assert_eq!(
            drain(&mut b),
            vec![TransportEvent::StateChanged(TransportState::Connected)]
        );
        assert!(b.is_channel_open(ChannelKind::Reliable));
    }

    #[test]
    fn test_fail_then_ice_restart() {
        let (net, mut a, mut b) = linked_pair();
        net.fault_handles()[1].fail();

        assert!(drain(&mut a).contains(&TransportEvent::StateChanged(TransportState::Failed)));
        assert!(drain(&mut b).contains(&TransportEvent::ChannelClosed(ChannelKind::Reliable)));
        assert!(!a.send(ChannelKind::Reliable, b"x"));

        let offer = a.create_offer(true).unwrap();
        assert!(offer.has_flag(RESTART_FLAG));
        assert_eq!(offer.attribute(GENERATION_ATTR), Some("2"));
        let answer = b.accept_offer(&offer).unwrap();
        a.accept_answer(&answer).unwrap();

        assert!(drain(&mut a).contains(&TransportEvent::StateChanged(TransportState::Connected)));
        assert!(drain(&mut b).contains(&TransportEvent::ChannelOpen(ChannelKind::Reliable)));
        assert!(a.send(ChannelKind::Reliable, b"again"));
    }

    #[test]
    fn test_stale_generation_answer_rejected() {
        let net = MemoryNetwork::new();
        let mut a = net.transport(Role::Initiator);
        let mut b = net.transport(Role::Responder);
        let first = a.create_offer(false).unwrap();
        let old_answer = b.accept_offer(&first).unwrap();
        a.create_offer(true).unwrap();
        assert!(matches!(
            a.accept_answer(&old_answer),
            Err(TransportError::InvalidDescription(_))
        ));
    }

    #[test]
    fn test_blackhole_drops_silently() {
        let (net, mut a, mut b) = linked_pair();
        net.fault_handles()[0].set_blackholed(true);
        assert!(a.send(ChannelKind::Unreliable, b"lost"));
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_close_notifies_peer() {
        let (net, mut a, mut b) = linked_pair();
        a.close();
        a.close();
        assert_eq!(net.endpoint_count(), 1);
        assert!(drain(&mut b).contains(&TransportEvent::StateChanged(TransportState::Failed)));
        assert!(a.poll_event().is_none());
    }
}
