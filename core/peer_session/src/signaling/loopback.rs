//! In-process signaling hub
//!
//! Stands in for the relay when both peers live in the same process
//! (practice play, tests). It implements just enough of the relay's
//! behaviour: pairing two queued endpoints of the same mode into a room,
//! answering `get_ice_servers`, and forwarding room-routed events to the
//! other member.

use super::{Role, SignalEvent, SignalingChannel, SignalingError};
use crate::ice::IceServer;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct HubState {
    next_peer: u64,
    next_room: u64,
    /// Endpoints waiting for an opponent: (peer, mode)
    waiting: Vec<(String, String)>,
    inboxes: HashMap<String, VecDeque<SignalEvent>>,
    /// room id → (initiator, responder)
    rooms: HashMap<String, (String, String)>,
    ice_servers: Vec<IceServer>,
    /// Include ICE servers in match_found (otherwise peers must ask)
    ice_in_match: bool,
}

impl HubState {
    fn push(&mut self, peer: &str, event: SignalEvent) {
        if let Some(inbox) = self.inboxes.get_mut(peer) {
            inbox.push_back(event);
        }
    }

    fn other_member(&self, room: &str, peer: &str) -> Option<String> {
        let (a, b) = self.rooms.get(room)?;
        if a == peer {
            Some(b.clone())
        } else if b == peer {
            Some(a.clone())
        } else {
            None
        }
    }

    fn room_of(&self, peer: &str) -> Option<String> {
        self.rooms
            .iter()
            .find(|(_, (a, b))| a == peer || b == peer)
            .map(|(room, _)| room.clone())
    }

    fn leave_room(&mut self, peer: &str) -> Option<String> {
        let room = self.room_of(peer)?;
        let other = self.other_member(&room, peer);
        self.rooms.remove(&room);
        other
    }

    fn handle(&mut self, from: &str, event: SignalEvent) {
        match event {
            SignalEvent::JoinQueue { mode, .. } => self.join(from, mode),
            SignalEvent::GetIceServers {} => {
                let ice_servers = self.ice_servers.clone();
                self.push(from, SignalEvent::IceServersConfig { ice_servers });
            }
            SignalEvent::Offer { .. }
            | SignalEvent::Answer { .. }
            | SignalEvent::IceCandidate { .. } => {
                let room = event.room().unwrap_or_default().to_string();
                match self.other_member(&room, from) {
                    Some(other) => {
                        log::trace!("Hub: {} {} -> {}", event.name(), from, other);
                        self.push(&other, event);
                    }
                    None => log::debug!(
                        "Hub: dropping {} from {} for unknown room {}",
                        event.name(),
                        from,
                        room
                    ),
                }
            }
            SignalEvent::SkipMatch {} => {
                if let Some(other) = self.leave_room(from) {
                    self.push(&other, SignalEvent::MatchSkipped {});
                }
            }
            SignalEvent::ConnectionStable { room_id, service } => {
                log::debug!("Hub: {} stable in room {} ({})", from, room_id, service);
            }
            other => log::debug!("Hub: ignoring client-sent {}", other.name()),
        }
    }

    fn join(&mut self, peer: &str, mode: String) {
        // a peer re-queueing leaves its old room
        self.leave_room(peer);
        self.waiting.retain(|(p, _)| p != peer);

        let partner = self.waiting.iter().position(|(_, m)| *m == mode);
        let Some(index) = partner else {
            self.waiting.push((peer.to_string(), mode));
            self.push(peer, SignalEvent::Queued {});
            return;
        };

        let (initiator, _) = self.waiting.remove(index);
        self.next_room += 1;
        let room_id = format!("loopback-room-{}", self.next_room);
        self.rooms
            .insert(room_id.clone(), (initiator.clone(), peer.to_string()));

        let ice_servers = if self.ice_in_match {
            self.ice_servers.clone()
        } else {
            Vec::new()
        };

        log::debug!(
            "Hub: matched {} (initiator) with {} in {}",
            initiator,
            peer,
            room_id
        );
        for (member, role, opponent) in [
            (initiator.as_str(), Role::Initiator, peer),
            (peer, Role::Responder, initiator.as_str()),
        ] {
            let event = SignalEvent::MatchFound {
                room_id: room_id.clone(),
                role,
                opponent_ref: Some(opponent.to_string()),
                is_initiator: role == Role::Initiator,
                ice_servers: ice_servers.clone(),
            };
            self.push(member, event);
        }
    }
}

/// Shared in-process relay
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// ICE servers handed out by the hub; `in_match` puts them into
    /// `match_found` instead of requiring `get_ice_servers`
    pub fn with_ice_servers(self, ice_servers: Vec<IceServer>, in_match: bool) -> Self {
        {
            let mut state = self.lock();
            state.ice_servers = ice_servers;
            state.ice_in_match = in_match;
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new endpoint
    pub fn endpoint(&self) -> LoopbackSignaling {
        let mut state = self.lock();
        state.next_peer += 1;
        let id = format!("loopback-peer-{}", state.next_peer);
        state.inboxes.insert(id.clone(), VecDeque::new());
        LoopbackSignaling {
            id,
            hub: self.clone(),
        }
    }

    /// Deliver an event straight into an endpoint's inbox
    pub fn inject(&self, peer: &str, event: SignalEvent) {
        self.lock().push(peer, event);
    }

    /// Number of rooms currently open
    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }
}

/// One endpoint of a [`LoopbackHub`]
#[derive(Debug)]
pub struct LoopbackSignaling {
    id: String,
    hub: LoopbackHub,
}

impl LoopbackSignaling {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl SignalingChannel for LoopbackSignaling {
    fn send(&mut self, event: SignalEvent) -> Result<(), SignalingError> {
        let mut state = self.hub.lock();
        if !state.inboxes.contains_key(&self.id) {
            return Err(SignalingError::Closed);
        }
        state.handle(&self.id, event);
        Ok(())
    }

    fn poll_recv(&mut self) -> Result<Option<SignalEvent>, SignalingError> {
        let mut state = self.hub.lock();
        match state.inboxes.get_mut(&self.id) {
            Some(inbox) => Ok(inbox.pop_front()),
            None => Err(SignalingError::Closed),
        }
    }
}

impl Drop for LoopbackSignaling {
    fn drop(&mut self) {
        let mut state = self.hub.lock();
        state.waiting.retain(|(p, _)| *p != self.id);
        state.leave_room(&self.id);
        state.inboxes.remove(&self.id);
    }
}
