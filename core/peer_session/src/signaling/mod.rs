//! Signaling vocabulary and the channel abstraction
//!
//! The relay speaks JSON events of the form `{"event": <name>, "data": {...}}`:
//!
//! ```text
//! Initiator              Relay                Responder
//!   │─── join_queue ─────►│◄──── join_queue ─────│
//!   │◄── match_found ─────│───── match_found ───►│
//!   │─── offer ──────────►│───── offer ─────────►│
//!   │◄── answer ──────────│◄──── answer ─────────│
//!   │◄─► ice-candidate ◄─►│◄─► ice-candidate ◄──►│
//!   │─── connection_stable►│                     │
//! ```
//!
//! Offers, answers and candidates are routed by `to` (the room id). The
//! [`SignalingChannel`] trait hides whether the other end is a real relay
//! ([`relay::RelaySignaling`]) or an in-process hub
//! ([`loopback::LoopbackHub`]).

pub mod loopback;
pub mod relay;

use crate::ice::IceServer;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Payload Types
// ============================================================================

/// Which side of a match this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the channels and sends the offer
    Initiator,
    /// Waits for the offer and answers
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as carried in `offer` / `answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Attribute carrying the negotiation generation
pub const GENERATION_ATTR: &str = "x-generation";

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Value of the first `a=<key>:<value>` line
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.sdp.lines().find_map(|line| {
            line.trim()
                .strip_prefix("a=")?
                .strip_prefix(key)?
                .strip_prefix(':')
        })
    }

    /// Negotiation generation stamped by the transport (`a=x-generation`)
    pub fn generation(&self) -> Option<u32> {
        self.attribute(GENERATION_ATTR)?.trim().parse().ok()
    }

    /// Whether an `a=<key>` flag line is present
    pub fn has_flag(&self, key: &str) -> bool {
        self.sdp
            .lines()
            .any(|line| line.trim().strip_prefix("a=") == Some(key))
    }
}

/// Trickled candidate as carried in `ice-candidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Every event exchanged with the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SignalEvent {
    /// Client → relay: enter the matchmaking queue
    JoinQueue {
        mode: String,
        #[serde(default)]
        preferences: serde_json::Value,
    },
    /// Relay → client: waiting for an opponent
    Queued {},
    /// Relay → client: room and role assignment
    #[serde(rename_all = "camelCase")]
    MatchFound {
        room_id: String,
        role: Role,
        #[serde(default)]
        opponent_ref: Option<String>,
        is_initiator: bool,
        #[serde(default)]
        ice_servers: Vec<IceServer>,
    },
    /// Client → relay: request ICE servers for the current match
    GetIceServers {},
    /// Relay → client: ICE servers (possibly with TURN credentials)
    #[serde(rename_all = "camelCase")]
    IceServersConfig {
        #[serde(default)]
        ice_servers: Vec<IceServer>,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: SessionDescription,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_ref: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        answer: SessionDescription,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_ref: Option<String>,
    },
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidateInit,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_ref: Option<String>,
    },
    /// Client → relay: direct channel is up
    #[serde(rename_all = "camelCase")]
    ConnectionStable { room_id: String, service: String },
    /// Relay → client: opponent skipped this match
    MatchSkipped {},
    /// Client → relay: skip the current opponent
    SkipMatch {},
}

impl SignalEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            SignalEvent::JoinQueue { .. } => "join_queue",
            SignalEvent::Queued {} => "queued",
            SignalEvent::MatchFound { .. } => "match_found",
            SignalEvent::GetIceServers {} => "get_ice_servers",
            SignalEvent::IceServersConfig { .. } => "ice_servers_config",
            SignalEvent::Offer { .. } => "offer",
            SignalEvent::Answer { .. } => "answer",
            SignalEvent::IceCandidate { .. } => "ice-candidate",
            SignalEvent::ConnectionStable { .. } => "connection_stable",
            SignalEvent::MatchSkipped {} => "match_skipped",
            SignalEvent::SkipMatch {} => "skip_match",
        }
    }

    /// Room id for room-routed events (offer, answer, ice-candidate)
    pub fn room(&self) -> Option<&str> {
        match self {
            SignalEvent::Offer { to, .. }
            | SignalEvent::Answer { to, .. }
            | SignalEvent::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Encode(e.to_string()))
    }

    /// Decode a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Decode(e.to_string()))
    }
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Debug)]
pub enum SignalingError {
    /// Could not reach the relay
    Connect(String),
    /// Event could not be serialized
    Encode(String),
    /// Frame was not a known event
    Decode(String),
    /// Underlying socket failed
    Io(std::io::Error),
    /// The relay (or hub) went away
    Closed,
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::Connect(msg) => write!(f, "relay unreachable: {}", msg),
            SignalingError::Encode(msg) => write!(f, "failed to encode event: {}", msg),
            SignalingError::Decode(msg) => write!(f, "failed to decode event: {}", msg),
            SignalingError::Io(e) => write!(f, "signaling I/O error: {}", e),
            SignalingError::Closed => write!(f, "signaling channel closed"),
        }
    }
}

impl std::error::Error for SignalingError {}

impl From<std::io::Error> for SignalingError {
    fn from(e: std::io::Error) -> Self {
        SignalingError::Io(e)
    }
}

/// Bidirectional event bus to the relay
///
/// Non-blocking: `poll_recv` returns `Ok(None)` when nothing is pending.
pub trait SignalingChannel {
    fn send(&mut self, event: SignalEvent) -> Result<(), SignalingError>;

    fn poll_recv(&mut self) -> Result<Option<SignalEvent>, SignalingError>;
}

impl<T: SignalingChannel + ?Sized> SignalingChannel for Box<T> {
    fn send(&mut self, event: SignalEvent) -> Result<(), SignalingError> {
        (**self).send(event)
    }

    fn poll_recv(&mut self) -> Result<Option<SignalEvent>, SignalingError> {
        (**self).poll_recv()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_found_wire_format() {
        let json = r#"{"event":"match_found","data":{
            "roomId":"room-1","role":"initiator","opponentRef":"p2",
            "isInitiator":true,
            "iceServers":[{"urls":"stun:stun.example.org"}]}}"#;
        match SignalEvent::from_json(json).unwrap() {
            SignalEvent::MatchFound {
                room_id,
                role,
                opponent_ref,
                is_initiator,
                ice_servers,
            } => {
                assert_eq!(room_id, "room-1");
                assert_eq!(role, Role::Initiator);
                assert_eq!(opponent_ref.as_deref(), Some("p2"));
                assert!(is_initiator);
                assert_eq!(ice_servers.len(), 1);
            }
            other => panic!("Expected MatchFound, got {:?}", other),
        }
    }

    #[test]
    fn test_ice_candidate_event_name() {
        let event = SignalEvent::IceCandidate {
            candidate: IceCandidateInit::new("candidate:host_1 1 udp 2130706431 10.0.0.1 5000 typ host"),
            to: "room-1".into(),
            target_ref: None,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "ice-candidate");
        assert_eq!(value["data"]["to"], "room-1");
        assert_eq!(value["data"]["candidate"]["sdpMLineIndex"], 0);
        assert!(value["data"].get("targetRef").is_none());
        assert_eq!(event.name(), "ice-candidate");
        assert_eq!(event.room(), Some("room-1"));
    }

    #[test]
    fn test_offer_description() {
        let event = SignalEvent::Offer {
            offer: SessionDescription::offer("v=0\r\na=ice-ufrag:abcd\r\na=x-ice-restart\r\n"),
            to: "room-9".into(),
            target_ref: Some("peer-b".into()),
        };
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""type":"offer""#));
        assert!(json.contains(r#""targetRef":"peer-b""#));

        let back = SignalEvent::from_json(&json).unwrap();
        assert_eq!(back, event);
        if let SignalEvent::Offer { offer, .. } = back {
            assert_eq!(offer.attribute("ice-ufrag"), Some("abcd"));
            assert!(offer.has_flag("x-ice-restart"));
            assert!(!offer.has_flag("ice-ufrag"));
        }
    }

    #[test]
    fn test_empty_data_events() {
        for (event, name) in [
            (SignalEvent::Queued {}, "queued"),
            (SignalEvent::SkipMatch {}, "skip_match"),
            (SignalEvent::GetIceServers {}, "get_ice_servers"),
        ] {
            let json = event.to_json().unwrap();
            assert_eq!(json, format!(r#"{{"event":"{}","data":{{}}}}"#, name));
            assert_eq!(SignalEvent::from_json(&json).unwrap(), event);
        }
    }

    #[test]
    fn test_connection_stable_fields() {
        let json = SignalEvent::ConnectionStable {
            room_id: "r".into(),
            service: "chess".into(),
        }
        .to_json()
        .unwrap();
        assert!(json.contains(r#""roomId":"r""#));
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(matches!(
            SignalEvent::from_json(r#"{"event":"teleport","data":{}}"#),
            Err(SignalingError::Decode(_))
        ));
    }
}
