//! Peer session core
//!
//! Two players matched by a signaling relay negotiate a direct connection,
//! keep it alive and restore it when the network path breaks:
//!
//! ```text
//!            relay (WebSocket / loopback)
//!                 ▲               ▲
//!   SignalEvent   │               │   SignalEvent
//!                 │               │
//!   ┌─────────────┴───┐       ┌───┴─────────────┐
//!   │ MatchCoordinator│       │ MatchCoordinator│
//!   │   PeerSession   │◄─────►│   PeerSession   │
//!   │  PeerTransport  │ P2P   │  PeerTransport  │
//!   └─────────────────┘       └─────────────────┘
//!     reliable channel: ordered events (turns, scores)
//!     unreliable channel: high-rate state (poses), keepalives
//! ```
//!
//! Everything is sans-IO at the session level and driven by `poll(now)`;
//! transports and signaling adapters own their sockets.
//!
//! - [`coordinator`]: match lifecycle, early-signal buffering, session replacement
//! - [`session`]: offer/answer handshake, state machine, heartbeat, recovery
//! - [`transport`]: the [`PeerTransport`] seam with in-memory and QUIC implementations
//! - [`signaling`]: relay event schema and the [`SignalingChannel`] seam
//! - [`codec`]: tag-dispatched binary frames with quantization helpers
//! - [`ice`]: ICE server validation and transport policy

pub mod channel;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod ice;
pub mod metrics;
pub mod recovery;
pub mod session;
pub mod signaling;
pub mod transport;

pub use codec::{CodecError, Frame, FrameReader, FrameWriter, MessageTable, PayloadLayout, WireMessage};
pub use config::{Config, ConfigError};
pub use coordinator::{CoordinatorEvent, MatchCoordinator, MatchStatus};
pub use ice::{IceServer, IceServerSet, TransportPolicy};
pub use metrics::SessionMetrics;
pub use session::{FailureReason, PeerSession, SessionEvent, SessionParams, SessionState};
pub use signaling::{Role, SignalEvent, SignalingChannel, SignalingError};
pub use transport::{ChannelKind, PeerTransport, TransportError, TransportFactory};
