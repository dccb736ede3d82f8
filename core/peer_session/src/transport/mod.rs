//! Peer transport abstraction
//!
//! A [`PeerTransport`] is the underlying connection a [`PeerSession`] drives:
//! it produces and consumes session descriptions, trickles candidates,
//! carries the two logical channels and reports its connection state. It is
//! sans-IO from the session's point of view: everything happens inside
//! [`PeerTransport::poll`] and results come back as [`TransportEvent`]s.
//!
//! Two implementations:
//! - [`memory::MemoryTransport`]: in-process pair with fault injection
//! - [`quic::QuicTransport`]: UDP socket, ICE-style checks, QUIC stream + DATAGRAM
//!
//! [`PeerSession`]: crate::session::PeerSession

pub mod memory;
pub mod quic;

use crate::ice::{IceServerSet, TransportPolicy};
use crate::signaling::{IceCandidateInit, Role, SessionDescription};
use std::fmt;
use std::time::{Duration, Instant};

// ============================================================================
// Channels
// ============================================================================

/// Label announced for the reliable channel
pub const RELIABLE_LABEL: &str = "reliable";

/// Label announced for the unreliable channel
pub const UNRELIABLE_LABEL: &str = "unreliable";

/// The two logical channels of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Ordered, retransmitting
    Reliable,
    /// Unordered, no retransmission
    Unreliable,
}

impl ChannelKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Reliable => RELIABLE_LABEL,
            ChannelKind::Unreliable => UNRELIABLE_LABEL,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            RELIABLE_LABEL => Some(ChannelKind::Reliable),
            UNRELIABLE_LABEL => Some(ChannelKind::Unreliable),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// State / Events
// ============================================================================

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    /// Connectivity checks or handshake in progress
    Checking,
    Connected,
    /// Transient loss of connectivity; may recover on its own
    Disconnected,
    /// Terminal; needs an ICE restart
    Failed,
    Closed,
}

/// Output of [`PeerTransport::poll_event`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Local candidate to trickle to the peer
    LocalCandidate(IceCandidateInit),
    StateChanged(TransportState),
    ChannelOpen(ChannelKind),
    ChannelClosed(ChannelKind),
    /// Application bytes received on a channel
    Message { channel: ChannelKind, data: Vec<u8> },
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum TransportError {
    /// Description could not be parsed or does not match our state
    InvalidDescription(String),
    /// Candidate string could not be parsed
    InvalidCandidate(String),
    /// Operation not valid in the current negotiation state
    InvalidState(&'static str),
    /// Socket error
    Io(std::io::Error),
    /// QUIC library error
    Quic(quiche::Error),
    /// Missing certificate or similar setup problem
    Setup(String),
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidDescription(msg) => write!(f, "invalid description: {}", msg),
            TransportError::InvalidCandidate(msg) => write!(f, "invalid candidate: {}", msg),
            TransportError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Quic(e) => write!(f, "QUIC error: {}", e),
            TransportError::Setup(msg) => write!(f, "transport setup failed: {}", msg),
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<quiche::Error> for TransportError {
    fn from(e: quiche::Error) -> Self {
        TransportError::Quic(e)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Underlying transport driven by a session
pub trait PeerTransport {
    /// Initiator: open both logical channels (announced once connected)
    fn create_channels(&mut self) -> Result<(), TransportError>;

    /// Initiator: produce an offer; `ice_restart` rotates credentials
    fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    /// Responder: apply a remote offer and produce the answer
    fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Initiator: apply the remote answer
    fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError>;

    fn add_remote_candidate(&mut self, candidate: &IceCandidateInit)
        -> Result<(), TransportError>;

    /// Send on a channel; false if the channel is not open
    fn send(&mut self, channel: ChannelKind, data: &[u8]) -> bool;

    fn is_channel_open(&self, channel: ChannelKind) -> bool;

    /// Drive I/O and timers
    fn poll(&mut self, now: Instant) -> Result<(), TransportError>;

    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// How long until `poll` needs to run again
    fn timeout(&self) -> Option<Duration>;

    /// Release channels and sockets; idempotent
    fn close(&mut self);
}

/// What a factory needs to build a transport
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub role: Role,
    pub session_id: u64,
    pub ice_servers: IceServerSet,
    pub policy: TransportPolicy,
}

/// Builds transports for new sessions
pub trait TransportFactory {
    fn create(&mut self, params: &TransportParams) -> Result<Box<dyn PeerTransport>, TransportError>;
}

impl<F: TransportFactory + ?Sized> TransportFactory for Box<F> {
    fn create(&mut self, params: &TransportParams) -> Result<Box<dyn PeerTransport>, TransportError> {
        (**self).create(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_labels() {
        for kind in [ChannelKind::Reliable, ChannelKind::Unreliable] {
            assert_eq!(ChannelKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(ChannelKind::from_label("video"), None);
    }
}
