//! QUIC peer transport
//!
//! One non-blocking UDP socket per session carries three kinds of traffic,
//! told apart by their first bytes:
//!
//! ```text
//! STUN     00xxxxxx .. .. .. 21 12 A4 42 ..   binding requests to STUN servers
//! Check    21 ..                              connectivity checks (connectivity.rs)
//! QUIC     x1xxxxxx ..                        the session itself
//! ```
//!
//! Anything from the TURN server is TURN (turn.rs); Data indications are
//! unwrapped and classified again as if they came from the relayed peer.
//!
//! Negotiation:
//!
//! ```text
//! Initiator (QUIC client)                       Responder (QUIC server)
//!   offer {ufrag, pwd, generation} ────────────►
//!   ◄──────────────────────────────── answer {ufrag, pwd, generation}
//!   ◄──── candidates ────►  checks  ◄──── checks ────►
//!   nominate best pair, connect ─── QUIC Initial ──► accept
//!   stream 0: ["reliable"] ────────────────────────► channels open
//! ```
//!
//! The reliable channel is client-initiated bidirectional stream 0 carrying
//! 4-byte big-endian length-prefixed frames. The unreliable channel is QUIC
//! DATAGRAM frames. An ICE restart rotates credentials, bumps the
//! generation and drops the QUIC connection; checks run again from scratch.
//!
//! Under a relay-only policy the transport gathers no host or reflexive
//! candidates. It allocates on the first `turn:` server instead, advertises
//! the relayed address, and wraps all peer traffic in Send indications. When
//! the allocation is refused the transport fails, which the session treats
//! as terminal.

pub mod candidate;
pub mod connectivity;
pub mod stun;
pub mod turn;

use self::candidate::{gather_host_candidates, gather_reflexive_candidate, Candidate};
use self::connectivity::{
    decode_check, encode_check, is_check_packet, BindingRequest, BindingResponse, CheckList,
    CheckMessage, CheckOutcome, PACE_INTERVAL,
};
use self::stun::{is_stun_packet, StunGatherer};
use self::turn::{TurnClient, TurnEvent};
use super::{
    ChannelKind, PeerTransport, TransportError, TransportEvent, TransportFactory, TransportParams,
    TransportState, RELIABLE_LABEL,
};
use crate::config::QuicTransportConfig;
use crate::ice::TransportPolicy;
use crate::signaling::{IceCandidateInit, Role, SessionDescription, GENERATION_ATTR};
use mio::net::UdpSocket;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// ALPN identifier; both peers must agree
pub const ALPN_PROTOCOL: &[u8] = b"peer-session/1";

const MAX_DATAGRAM_SIZE: usize = 1350;

const RELIABLE_STREAM_ID: u64 = 0;

const FRAME_HEADER_LEN: usize = 4;

/// Largest reliable frame accepted in either direction
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Reliable bytes queued ahead of QUIC flow control before `send` refuses
pub const MAX_OUTBOUND_LEN: usize = 4 * MAX_FRAME_LEN;

const UFRAG_LEN: usize = 8;
const PWD_LEN: usize = 24;
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const UFRAG_ATTR: &str = "ice-ufrag";
const PWD_ATTR: &str = "ice-pwd";
const RESTART_FLAG: &str = "x-ice-restart";

/// Poll cadence while STUN requests are outstanding
const STUN_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Reliable stream framing
// ============================================================================

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Reassembles length-prefixed frames from stream reads
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

/// A peer announced a frame longer than [`MAX_FRAME_LEN`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTooLarge(pub usize);

impl FrameAssembler {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameTooLarge> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameTooLarge(len));
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let frame = self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.buf.drain(..FRAME_HEADER_LEN + len);
        Ok(Some(frame))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Encoded frames waiting for stream credit, capped at [`MAX_OUTBOUND_LEN`]
#[derive(Debug, Default)]
pub struct OutboundQueue {
    buf: Vec<u8>,
}

impl OutboundQueue {
    /// Queue one whole frame; false when it would overflow the cap
    pub fn push_frame(&mut self, payload: &[u8]) -> bool {
        if payload.len() > MAX_FRAME_LEN
            || self.buf.len() + FRAME_HEADER_LEN + payload.len() > MAX_OUTBOUND_LEN
        {
            return false;
        }
        self.buf.extend_from_slice(&encode_frame(payload));
        true
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, written: usize) {
        self.buf.drain(..written.min(self.buf.len()));
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ============================================================================
// Session description
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteDescription {
    ufrag: String,
    pwd: String,
    generation: u32,
}

impl RemoteDescription {
    fn parse(desc: &SessionDescription) -> Result<Self, TransportError> {
        let missing = |what: &str| TransportError::InvalidDescription(format!("missing {}", what));
        let ufrag = desc.attribute(UFRAG_ATTR).ok_or_else(|| missing(UFRAG_ATTR))?;
        let pwd = desc.attribute(PWD_ATTR).ok_or_else(|| missing(PWD_ATTR))?;
        let generation = desc
            .attribute(GENERATION_ATTR)
            .and_then(|g| g.parse().ok())
            .ok_or_else(|| missing(GENERATION_ATTR))?;
        if ufrag.is_empty() || pwd.is_empty() {
            return Err(TransportError::InvalidDescription("empty ICE credentials".into()));
        }
        Ok(Self {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
            generation,
        })
    }
}

fn random_token(rng: &SystemRandom, len: usize) -> Result<String, TransportError> {
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes)
        .map_err(|_| TransportError::Setup("failed to generate ICE credentials".into()))?;
    Ok(bytes
        .iter()
        .map(|b| TOKEN_ALPHABET[(*b as usize) % TOKEN_ALPHABET.len()] as char)
        .collect())
}

fn quic_config(role: Role, cfg: &QuicTransportConfig) -> Result<quiche::Config, TransportError> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

    if role == Role::Responder {
        let (cert, key) = match (&cfg.cert_path, &cfg.key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(TransportError::Setup(
                    "responder needs transport.cert_path and transport.key_path".into(),
                ))
            }
        };
        config.load_cert_chain_from_pem_file(cert)?;
        config.load_priv_key_from_pem_file(key)?;
    }

    config.set_application_protos(&[ALPN_PROTOCOL])?;
    config.enable_dgram(true, 1000, 1000);
    config.set_max_idle_timeout(cfg.idle_timeout_ms);
    config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(100);
    // Peers are authenticated by the signaled ICE credentials, not by PKI
    config.verify_peer(false);
    Ok(config)
}

// ============================================================================
// Transport
// ============================================================================

pub struct QuicTransport {
    role: Role,
    session_id: u64,
    policy: TransportPolicy,
    socket: UdpSocket,
    local_addr: SocketAddr,
    quic_config: quiche::Config,
    conn: Option<quiche::Connection>,
    /// Remote address of the QUIC connection
    peer_addr: Option<SocketAddr>,
    established: bool,
    rng: SystemRandom,

    ufrag: String,
    pwd: String,
    remote: Option<RemoteDescription>,
    generation: u32,
    start_pending: bool,

    checks: CheckList,
    local_candidates: Vec<Candidate>,
    stun_servers: Vec<SocketAddr>,
    stun: StunGatherer,
    reflexive: Vec<SocketAddr>,
    prflx_priority: u32,
    turn: Option<TurnClient>,

    state: TransportState,
    events: VecDeque<TransportEvent>,
    channels_created: bool,
    reliable_open: bool,
    unreliable_open: bool,
    inbound: FrameAssembler,
    outbound: OutboundQueue,
    last_recv: Option<Instant>,
    disconnect_after: Duration,

    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    closed: bool,
}

impl QuicTransport {
    pub fn new(params: &TransportParams, config: &QuicTransportConfig) -> Result<Self, TransportError> {
        let quic_config = quic_config(params.role, config)?;
        let socket = UdpSocket::bind(config.bind_addr)?;
        let local_addr = socket.local_addr()?;
        let rng = SystemRandom::new();

        let relay_only = params.policy == TransportPolicy::Relay;
        let turn = if relay_only {
            let client = params.ice_servers.turn_servers().into_iter().find_map(|server| {
                let addr = match server.url.resolve() {
                    Ok(addrs) => addrs.into_iter().find(|a| a.is_ipv4() == local_addr.is_ipv4()),
                    Err(e) => {
                        log::debug!("Skipping TURN server: {}", e);
                        None
                    }
                }?;
                Some(TurnClient::new(addr, server.username, server.credential))
            });
            match &client {
                Some(c) => log::info!("Session {:016x}: relay-only via TURN {}", params.session_id, c.server()),
                None => log::warn!(
                    "Session {:016x}: relay-only policy without a reachable TURN server",
                    params.session_id
                ),
            }
            client
        } else {
            None
        };

        let local_candidates = if relay_only {
            Vec::new()
        } else {
            gather_host_candidates(local_addr, config.include_loopback)
        };

        // A loopback-bound socket cannot reach public STUN servers
        let stun_servers: Vec<SocketAddr> = if relay_only || local_addr.ip().is_loopback() {
            Vec::new()
        } else {
            params
                .ice_servers
                .stun_urls()
                .iter()
                .filter_map(|url| match url.resolve() {
                    Ok(addrs) => Some(addrs),
                    Err(e) => {
                        log::debug!("Skipping STUN server: {}", e);
                        None
                    }
                })
                .flatten()
                .filter(|addr| addr.is_ipv4() == local_addr.is_ipv4())
                .collect()
        };

        let mut checks = CheckList::new(
            params.role == Role::Initiator,
            Duration::from_millis(config.check_timeout_ms),
        );
        for candidate in &local_candidates {
            checks.add_local(candidate.clone());
        }

        log::info!(
            "Session {:016x}: QUIC transport bound to {} ({} host candidate(s), {} STUN server(s))",
            params.session_id,
            local_addr,
            local_candidates.len(),
            stun_servers.len()
        );

        Ok(Self {
            role: params.role,
            session_id: params.session_id,
            policy: params.policy,
            socket,
            local_addr,
            quic_config,
            conn: None,
            peer_addr: None,
            established: false,
            ufrag: random_token(&rng, UFRAG_LEN)?,
            pwd: random_token(&rng, PWD_LEN)?,
            rng,
            remote: None,
            generation: 0,
            start_pending: false,
            checks,
            local_candidates,
            stun_servers,
            stun: StunGatherer::new(&[]),
            reflexive: Vec::new(),
            prflx_priority: Candidate::peer_reflexive(local_addr).priority,
            turn,
            state: TransportState::New,
            events: VecDeque::new(),
            channels_created: false,
            reliable_open: false,
            unreliable_open: false,
            inbound: FrameAssembler::default(),
            outbound: OutboundQueue::default(),
            last_recv: None,
            disconnect_after: Duration::from_millis(config.disconnect_after_ms),
            recv_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            closed: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Address the QUIC connection runs over, once selected
    pub fn selected_path(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            log::debug!(
                "Session {:016x}: QUIC transport {:?} -> {:?}",
                self.session_id,
                self.state,
                state
            );
            self.state = state;
            self.events.push_back(TransportEvent::StateChanged(state));
        }
    }

    fn open_channels(&mut self) {
        for kind in [ChannelKind::Reliable, ChannelKind::Unreliable] {
            let open = match kind {
                ChannelKind::Reliable => &mut self.reliable_open,
                ChannelKind::Unreliable => &mut self.unreliable_open,
            };
            if !*open {
                *open = true;
                self.events.push_back(TransportEvent::ChannelOpen(kind));
            }
        }
    }

    fn close_channels(&mut self) {
        for kind in [ChannelKind::Reliable, ChannelKind::Unreliable] {
            let open = match kind {
                ChannelKind::Reliable => &mut self.reliable_open,
                ChannelKind::Unreliable => &mut self.unreliable_open,
            };
            if *open {
                *open = false;
                self.events.push_back(TransportEvent::ChannelClosed(kind));
            }
        }
    }

    fn description(&self, restart: bool) -> String {
        let mut sdp = format!(
            "v=0\r\na={}:{}\r\na={}:{}\r\na={}:{}\r\n",
            UFRAG_ATTR, self.ufrag, PWD_ATTR, self.pwd, GENERATION_ATTR, self.generation
        );
        if restart {
            sdp.push_str(&format!("a={}\r\n", RESTART_FLAG));
        }
        sdp
    }

    /// Trickle host candidates now; reflexive ones follow as STUN answers
    fn gather(&mut self) {
        for candidate in &self.local_candidates {
            self.events.push_back(TransportEvent::LocalCandidate(IceCandidateInit::new(
                candidate.to_string(),
            )));
        }
        self.reflexive.clear();
        self.stun = StunGatherer::new(&self.stun_servers);
    }

    /// Drop the current path and everything learned about it
    fn reset_path(&mut self) -> Result<(), TransportError> {
        if self.conn.take().is_some() {
            log::info!("Session {:016x}: dropping QUIC connection for ICE restart", self.session_id);
        }
        self.peer_addr = None;
        self.established = false;
        self.last_recv = None;
        self.inbound.clear();
        self.outbound.clear();
        self.close_channels();
        self.checks.reset();
        self.remote = None;
        self.start_pending = false;
        self.ufrag = random_token(&self.rng, UFRAG_LEN)?;
        self.pwd = random_token(&self.rng, PWD_LEN)?;
        Ok(())
    }

    fn connection_id(&self) -> Result<quiche::ConnectionId<'static>, TransportError> {
        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        self.rng
            .fill(&mut scid)
            .map_err(|_| TransportError::Setup("failed to generate connection ID".into()))?;
        Ok(quiche::ConnectionId::from_vec(scid.to_vec()))
    }

    /// Relayed address once the TURN allocation exists
    pub fn relayed_addr(&self) -> Option<SocketAddr> {
        self.turn.as_ref().and_then(|t| t.relayed_address())
    }

    /// Put a peer packet on the wire, through the relay when one is allocated.
    /// False when the socket is full.
    fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> bool {
        let (packet, dest) = match self.turn.as_ref() {
            Some(turn) if to != turn.server() => match turn.wrap(bytes, to) {
                Some(wrapped) => (wrapped, turn.server()),
                None => {
                    log::trace!("No relay yet, dropped {} bytes to {}", bytes.len(), to);
                    return true;
                }
            },
            _ => (bytes.to_vec(), to),
        };
        match self.socket.send_to(&packet, dest) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::trace!("Socket full, dropped {} bytes to {}", packet.len(), dest);
                false
            }
            Err(e) => {
                log::debug!("Send to {} failed: {}", dest, e);
                true
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn read_socket(&mut self, now: Instant) -> Result<(), TransportError> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            let packet = self.recv_buf[..len].to_vec();

            match self.turn.as_mut() {
                Some(turn) if turn.server() == from => {
                    turn.handle_packet(&packet, now);
                    self.process_turn(now)?;
                }
                _ => self.dispatch(packet, from, now)?,
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, mut packet: Vec<u8>, from: SocketAddr, now: Instant) -> Result<(), TransportError> {
        if is_stun_packet(&packet) {
            self.handle_stun(&packet, from);
        } else if is_check_packet(&packet) {
            self.handle_check(&packet, from, now)?;
        } else if packet.first().map_or(false, |b| b & 0x40 != 0) {
            self.handle_quic(&mut packet, from, now)?;
        } else {
            log::trace!("Unclassified {} byte packet from {}", packet.len(), from);
        }
        Ok(())
    }

    fn process_turn(&mut self, now: Instant) -> Result<(), TransportError> {
        while let Some(event) = self.turn.as_mut().and_then(|t| t.poll_event()) {
            match event {
                TurnEvent::Data { peer, data } => self.dispatch(data, peer, now)?,
                TurnEvent::Allocated { relayed, mapped } => {
                    let candidate = Candidate::relayed(relayed, mapped);
                    log::info!("Session {:016x}: relay candidate {}", self.session_id, relayed);
                    self.checks.add_local(candidate.clone());
                    self.local_candidates.push(candidate.clone());
                    // before negotiation starts, gather() announces it
                    if self.generation != 0 {
                        self.events.push_back(TransportEvent::LocalCandidate(IceCandidateInit::new(
                            candidate.to_string(),
                        )));
                    }
                }
                TurnEvent::Failed(reason) => {
                    log::warn!("Session {:016x}: TURN allocation failed: {}", self.session_id, reason);
                }
            }
        }
        Ok(())
    }

    fn handle_stun(&mut self, packet: &[u8], from: SocketAddr) {
        let Some(mapped) = self.stun.handle_response(packet, from) else {
            return;
        };
        if self.reflexive.contains(&mapped) {
            return;
        }
        self.reflexive.push(mapped);
        if let Some(candidate) = gather_reflexive_candidate(mapped, self.local_addr) {
            log::info!("Session {:016x}: reflexive address {}", self.session_id, mapped);
            self.events.push_back(TransportEvent::LocalCandidate(IceCandidateInit::new(
                candidate.to_string(),
            )));
        }
    }

    fn handle_check(&mut self, packet: &[u8], from: SocketAddr, now: Instant) -> Result<(), TransportError> {
        let msg = match decode_check(packet, &self.pwd) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Dropping check from {}: {}", from, e);
                return Ok(());
            }
        };
        match msg {
            CheckMessage::Request(request) => self.answer_check(request, from, now),
            CheckMessage::Response(response) => {
                match self.checks.handle_response(&response, from) {
                    Some(CheckOutcome::Selected(addr)) => {
                        self.last_recv = Some(now);
                        log::info!("Session {:016x}: path selected via {}", self.session_id, addr);
                        self.connect_quic(addr)?;
                    }
                    Some(CheckOutcome::Succeeded(addr)) => {
                        self.last_recv = Some(now);
                        log::debug!("Session {:016x}: check to {} succeeded", self.session_id, addr);
                    }
                    None => {}
                }
                Ok(())
            }
        }
    }

    fn answer_check(&mut self, request: BindingRequest, from: SocketAddr, now: Instant) -> Result<(), TransportError> {
        let Some(remote) = self.remote.as_ref() else {
            log::trace!("Check from {} before remote description", from);
            return Ok(());
        };
        let expected = format!("{}:{}", self.ufrag, remote.ufrag);
        if request.username != expected {
            log::debug!("Check from {} with unexpected username {}", from, request.username);
            return Ok(());
        }

        let response = CheckMessage::Response(BindingResponse {
            transaction_id: request.transaction_id,
            mapped_address: from,
        });
        match encode_check(&response, &remote.pwd) {
            Ok(bytes) => {
                self.send_raw(&bytes, from);
            }
            Err(e) => log::warn!("Failed to encode check response: {}", e),
        }
        self.last_recv = Some(now);

        if !self.checks.knows_remote(from) {
            if let Some(turn) = self.turn.as_mut() {
                turn.permit(from);
            }
            let mut candidate = Candidate::peer_reflexive(from);
            candidate.priority = request.priority;
            if self.checks.add_remote(candidate) {
                log::debug!("Session {:016x}: peer-reflexive candidate {}", self.session_id, from);
            }
        }
        if request.use_candidate && !self.checks.is_controlling() && self.checks.selected() != Some(from) {
            log::info!("Session {:016x}: peer nominated {}", self.session_id, from);
            self.checks.select(from);
        }
        Ok(())
    }

    fn connect_quic(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        if self.role != Role::Initiator || self.conn.is_some() {
            return Ok(());
        }
        let scid = self.connection_id()?;
        let conn = quiche::connect(None, &scid, self.local_addr, addr, &mut self.quic_config)?;
        log::info!("Session {:016x}: connecting to {} (scid={:?})", self.session_id, addr, scid);
        self.conn = Some(conn);
        self.peer_addr = Some(addr);
        Ok(())
    }

    fn handle_quic(&mut self, packet: &mut [u8], from: SocketAddr, now: Instant) -> Result<(), TransportError> {
        let recv_info = quiche::RecvInfo {
            from,
            to: self.local_addr,
        };

        if let Some(conn) = self.conn.as_mut() {
            if self.peer_addr != Some(from) {
                log::trace!("QUIC packet from {} off the selected path", from);
                return Ok(());
            }
            match conn.recv(packet, recv_info) {
                Ok(_) => self.last_recv = Some(now),
                Err(e) => log::debug!("Session {:016x}: QUIC recv error: {:?}", self.session_id, e),
            }
            return Ok(());
        }

        if self.role != Role::Responder {
            log::trace!("QUIC packet from {} with no connection", from);
            return Ok(());
        }
        if self.checks.selected() != Some(from) && !self.checks.knows_remote(from) {
            log::debug!("QUIC packet from unverified address {}", from);
            return Ok(());
        }

        let (ty, version) = match quiche::Header::from_slice(packet, quiche::MAX_CONN_ID_LEN) {
            Ok(hdr) => (hdr.ty, hdr.version),
            Err(e) => {
                log::debug!("Failed to parse QUIC header from {}: {:?}", from, e);
                return Ok(());
            }
        };
        if ty != quiche::Type::Initial || !quiche::version_is_supported(version) {
            log::debug!("Unexpected {:?} packet (version {:#x}) from {}", ty, version, from);
            return Ok(());
        }

        let scid = self.connection_id()?;
        let mut conn = quiche::accept(&scid, None, self.local_addr, from, &mut self.quic_config)?;
        log::info!("Session {:016x}: accepted QUIC from {} (scid={:?})", self.session_id, from, scid);
        if let Err(e) = conn.recv(packet, recv_info) {
            log::debug!("Session {:016x}: QUIC Initial rejected: {:?}", self.session_id, e);
            return Ok(());
        }
        self.conn = Some(conn);
        self.peer_addr = Some(from);
        self.last_recv = Some(now);
        Ok(())
    }

    fn process_quic(&mut self) {
        let established = match self.conn.as_ref() {
            Some(conn) => conn.is_established(),
            None => return,
        };

        if established && !self.established {
            self.established = true;
            log::info!("Session {:016x}: QUIC established", self.session_id);
            self.set_state(TransportState::Connected);
            if self.role == Role::Initiator && self.channels_created {
                self.outbound.push_frame(RELIABLE_LABEL.as_bytes());
                self.open_channels();
            }
        }
        if !self.established {
            return;
        }

        let mut datagrams = Vec::new();
        let mut too_large = None;
        if let Some(conn) = self.conn.as_mut() {
            let readable: Vec<u64> = conn.readable().collect();
            for stream_id in readable {
                loop {
                    match conn.stream_recv(stream_id, &mut self.recv_buf) {
                        Ok((len, _fin)) => {
                            if stream_id == RELIABLE_STREAM_ID {
                                self.inbound.push(&self.recv_buf[..len]);
                            }
                        }
                        Err(quiche::Error::Done) => break,
                        Err(e) => {
                            log::debug!("Stream {} recv error: {:?}", stream_id, e);
                            break;
                        }
                    }
                }
            }
            loop {
                match conn.dgram_recv(&mut self.recv_buf) {
                    Ok(len) => datagrams.push(self.recv_buf[..len].to_vec()),
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("Datagram recv error: {:?}", e);
                        break;
                    }
                }
            }
        }

        loop {
            match self.inbound.next_frame() {
                Ok(Some(frame)) => self.on_reliable_frame(frame),
                Ok(None) => break,
                Err(FrameTooLarge(len)) => {
                    too_large = Some(len);
                    break;
                }
            }
        }
        if let Some(len) = too_large {
            log::warn!("Session {:016x}: peer sent {} byte frame, closing", self.session_id, len);
            if let Some(conn) = self.conn.as_mut() {
                let _ = conn.close(true, 0x1, b"frame too large");
            }
        }

        for data in datagrams {
            if self.unreliable_open {
                self.events.push_back(TransportEvent::Message {
                    channel: ChannelKind::Unreliable,
                    data,
                });
            }
        }
    }

    fn on_reliable_frame(&mut self, frame: Vec<u8>) {
        if self.reliable_open {
            self.events.push_back(TransportEvent::Message {
                channel: ChannelKind::Reliable,
                data: frame,
            });
        } else if self.role == Role::Responder && frame == RELIABLE_LABEL.as_bytes() {
            log::debug!("Session {:016x}: channels announced", self.session_id);
            self.open_channels();
        } else {
            log::debug!("Dropping {} byte frame before channel announcement", frame.len());
        }
    }

    fn update_liveness(&mut self, now: Instant) {
        if let Some(conn) = self.conn.as_ref() {
            if conn.is_closed() {
                if conn.is_timed_out() {
                    log::info!("Session {:016x}: QUIC idle timeout", self.session_id);
                } else {
                    log::info!(
                        "Session {:016x}: QUIC closed (peer error: {:?})",
                        self.session_id,
                        conn.peer_error()
                    );
                }
                self.conn = None;
                self.peer_addr = None;
                self.established = false;
                self.set_state(TransportState::Failed);
                self.close_channels();
                return;
            }
        }

        if self.conn.is_none() && self.state == TransportState::Checking && self.checks.has_failed(now) {
            log::warn!("Session {:016x}: connectivity checks failed", self.session_id);
            self.set_state(TransportState::Failed);
            return;
        }

        let relay_lost = self.policy == TransportPolicy::Relay
            && self.turn.as_ref().map_or(true, TurnClient::has_failed);
        if relay_lost && self.state == TransportState::Checking && self.conn.is_none() {
            log::warn!("Session {:016x}: no relay to run checks over", self.session_id);
            self.set_state(TransportState::Failed);
            return;
        }

        if self.established {
            let silent = self
                .last_recv
                .map_or(false, |t| now.duration_since(t) >= self.disconnect_after);
            if silent && self.state == TransportState::Connected {
                self.set_state(TransportState::Disconnected);
            } else if !silent && self.state == TransportState::Disconnected {
                self.set_state(TransportState::Connected);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    fn transmit_stun(&mut self, now: Instant) {
        while let Some((request, server)) = self.stun.poll_transmit(now) {
            self.send_raw(&request, server);
        }
    }

    fn transmit_turn(&mut self, now: Instant) -> Result<(), TransportError> {
        while let Some(request) = self.turn.as_mut().and_then(|t| t.poll_transmit(now)) {
            if let Some(server) = self.turn.as_ref().map(TurnClient::server) {
                self.send_raw(&request, server);
            }
        }
        self.process_turn(now)
    }

    fn transmit_checks(&mut self, now: Instant) {
        self.checks.handle_timeouts(now);
        let (username, remote_pwd) = match self.remote.as_ref() {
            Some(remote) => (format!("{}:{}", remote.ufrag, self.ufrag), remote.pwd.clone()),
            None => return,
        };
        while let Some(check) = self.checks.next_request(now) {
            let msg = CheckMessage::Request(BindingRequest {
                transaction_id: check.transaction_id,
                priority: self.prflx_priority,
                use_candidate: check.use_candidate,
                username: username.clone(),
            });
            match encode_check(&msg, &remote_pwd) {
                Ok(bytes) => {
                    self.send_raw(&bytes, check.destination);
                }
                Err(e) => log::warn!("Failed to encode check: {}", e),
            }
        }
    }

    fn flush(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        if !self.outbound.is_empty() && conn.is_established() {
            match conn.stream_send(RELIABLE_STREAM_ID, self.outbound.pending(), false) {
                Ok(written) => self.outbound.consume(written),
                Err(quiche::Error::Done) => {}
                Err(e) => log::debug!("Stream send error: {:?}", e),
            }
        }

        loop {
            let Some(conn) = self.conn.as_mut() else {
                break;
            };
            let (len, to) = match conn.send(&mut self.send_buf) {
                Ok((len, send_info)) => (len, send_info.to),
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::debug!("QUIC send error: {:?}", e);
                    break;
                }
            };
            if !self.send_raw(&self.send_buf[..len], to) {
                break;
            }
        }
    }
}

impl PeerTransport for QuicTransport {
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
        if self.role != Role::Initiator {
            return Err(TransportError::InvalidState("only the initiator offers"));
        }
        if ice_restart {
            self.reset_path()?;
        }
        if ice_restart || self.generation == 0 {
            self.generation += 1;
        }
        self.set_state(TransportState::Checking);
        let offer = SessionDescription::offer(self.description(ice_restart));
        self.gather();
        Ok(offer)
    }

    fn accept_offer(&mut self, offer: &SessionDescription) -> Result<SessionDescription, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.role != Role::Responder {
            return Err(TransportError::InvalidState("only the responder answers"));
        }
        let remote = RemoteDescription::parse(offer)?;
        if self.generation != 0 {
            if remote.generation <= self.generation {
                return Err(TransportError::InvalidDescription(format!(
                    "offer generation {} already superseded by {}",
                    remote.generation, self.generation
                )));
            }
            log::info!(
                "Session {:016x}: ICE restart to generation {}",
                self.session_id,
                remote.generation
            );
            self.reset_path()?;
        }
        self.generation = remote.generation;
        self.remote = Some(remote);
        self.start_pending = true;
        self.set_state(TransportState::Checking);
        let answer = SessionDescription::answer(self.description(false));
        self.gather();
        Ok(answer)
    }

    fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let remote = RemoteDescription::parse(answer)?;
        if remote.generation != self.generation {
            return Err(TransportError::InvalidDescription(format!(
                "answer generation {} does not match offer generation {}",
                remote.generation, self.generation
            )));
        }
        self.remote = Some(remote);
        self.start_pending = true;
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), TransportError> {
        let parsed: Candidate = candidate
            .candidate
            .parse()
            .map_err(|e: candidate::ParseCandidateError| TransportError::InvalidCandidate(e.to_string()))?;
        if let Some(turn) = self.turn.as_mut() {
            turn.permit(parsed.address);
        }
        if self.checks.add_remote(parsed) {
            log::debug!("Session {:016x}: remote candidate {}", self.session_id, candidate.candidate);
        }
        Ok(())
    }

    fn send(&mut self, channel: ChannelKind, data: &[u8]) -> bool {
        if !self.is_channel_open(channel) {
            return false;
        }
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        match channel {
            ChannelKind::Reliable => {
                if !self.outbound.push_frame(data) {
                    log::warn!(
                        "Refusing {} byte reliable frame ({} bytes already queued)",
                        data.len(),
                        self.outbound.len()
                    );
                    return false;
                }
            }
            ChannelKind::Unreliable => match conn.dgram_send(data) {
                Ok(()) => {}
                Err(quiche::Error::Done) => {
                    log::trace!("Datagram queue full, dropped");
                    return false;
                }
                Err(e) => {
                    log::debug!("Datagram send error: {:?}", e);
                    return false;
                }
            },
        }
        self.flush();
        true
    }

    fn is_channel_open(&self, channel: ChannelKind) -> bool {
        !self.closed
            && match channel {
                ChannelKind::Reliable => self.reliable_open,
                ChannelKind::Unreliable => self.unreliable_open,
            }
    }

    fn poll(&mut self, now: Instant) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        if self.start_pending {
            self.start_pending = false;
            self.checks.start(now);
        }

        self.read_socket(now)?;
        self.transmit_turn(now)?;
        self.transmit_stun(now);
        self.transmit_checks(now);
        if let Some(conn) = self.conn.as_mut() {
            conn.on_timeout();
        }
        self.process_quic();
        self.update_liveness(now);
        self.flush();
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn timeout(&self) -> Option<Duration> {
        if self.closed {
            return None;
        }
        let mut timeout = self.conn.as_ref().and_then(|c| c.timeout());
        let mut bound = |d: Duration| {
            timeout = Some(timeout.map_or(d, |t| t.min(d)));
        };
        if self.checks.is_checking() {
            bound(PACE_INTERVAL);
        }
        if !self.stun.is_done() || self.turn.as_ref().map_or(false, TurnClient::is_busy) {
            bound(STUN_POLL_INTERVAL);
        }
        if self.established {
            bound(self.disconnect_after);
        }
        timeout
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.close(true, 0x0, b"session closed");
        }
        self.flush();
        if let Some(release) = self.turn.as_mut().and_then(|t| t.release()) {
            if let Some(server) = self.turn.as_ref().map(TurnClient::server) {
                self.send_raw(&release, server);
            }
        }
        self.closed = true;
        self.conn = None;
        self.reliable_open = false;
        self.unreliable_open = false;
        self.state = TransportState::Closed;
        self.events.clear();
        log::debug!(
            "Session {:016x}: QUIC transport closed ({:?} policy)",
            self.session_id,
            self.policy
        );
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds a [`QuicTransport`] per session from shared settings
#[derive(Debug, Clone, Default)]
pub struct QuicTransportFactory {
    config: QuicTransportConfig,
}

impl QuicTransportFactory {
    pub fn new(config: QuicTransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for QuicTransportFactory {
    fn create(&mut self, params: &TransportParams) -> Result<Box<dyn PeerTransport>, TransportError> {
        Ok(Box::new(QuicTransport::new(params, &self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::IceServerSet;

    fn params(role: Role) -> TransportParams {
        TransportParams {
            role,
            session_id: 7,
            ice_servers: IceServerSet::default(),
            policy: TransportPolicy::All,
        }
    }

    fn loopback_config() -> QuicTransportConfig {
        QuicTransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            include_loopback: true,
            ..QuicTransportConfig::default()
        }
    }

    fn drain(t: &mut QuicTransport) -> Vec<TransportEvent> {
        std::iter::from_fn(|| t.poll_event()).collect()
    }

    fn write_test_certs(tag: &str) -> (String, String) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("peer-session-{}-{}-cert.pem", tag, std::process::id()));
        let key_path = dir.join(format!("peer-session-{}-{}-key.pem", tag, std::process::id()));
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    #[test]
    fn test_frame_assembler_partial_reads() {
        let mut framer = FrameAssembler::default();
        let mut bytes = encode_frame(b"hello");
        bytes.extend(encode_frame(b""));
        bytes.extend(encode_frame(b"world"));

        framer.push(&bytes[..3]);
        assert_eq!(framer.next_frame(), Ok(None));
        framer.push(&bytes[3..11]);
        assert_eq!(framer.next_frame(), Ok(Some(b"hello".to_vec())));
        assert_eq!(framer.next_frame(), Ok(None));
        framer.push(&bytes[11..]);
        assert_eq!(framer.next_frame(), Ok(Some(Vec::new())));
        assert_eq!(framer.next_frame(), Ok(Some(b"world".to_vec())));
        assert_eq!(framer.next_frame(), Ok(None));
    }

    #[test]
    fn test_frame_assembler_rejects_oversized() {
        let mut framer = FrameAssembler::default();
        framer.push(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        assert_eq!(framer.next_frame(), Err(FrameTooLarge(MAX_FRAME_LEN + 1)));
    }

    #[test]
    fn test_responder_requires_certificate() {
        let result = QuicTransport::new(&params(Role::Responder), &loopback_config());
        assert!(matches!(result, Err(TransportError::Setup(_))));
    }

    #[test]
    fn test_offer_carries_credentials_and_candidates() {
        let mut t = QuicTransport::new(&params(Role::Initiator), &loopback_config()).unwrap();
        t.create_channels().unwrap();
        let offer = t.create_offer(false).unwrap();

        assert_eq!(offer.attribute(UFRAG_ATTR).map(str::len), Some(UFRAG_LEN));
        assert_eq!(offer.attribute(PWD_ATTR).map(str::len), Some(PWD_LEN));
        assert_eq!(offer.attribute(GENERATION_ATTR), Some("1"));
        assert!(!offer.has_flag(RESTART_FLAG));

        let events = drain(&mut t);
        assert_eq!(events[0], TransportEvent::StateChanged(TransportState::Checking));
        let candidates: Vec<Candidate> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::LocalCandidate(c) => c.candidate.parse().ok(),
                _ => None,
            })
            .collect();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address, t.local_addr());
    }

    #[test]
    fn test_restart_rotates_credentials() {
        let mut t = QuicTransport::new(&params(Role::Initiator), &loopback_config()).unwrap();
        let first = t.create_offer(false).unwrap();
        let second = t.create_offer(true).unwrap();
        assert_eq!(second.attribute(GENERATION_ATTR), Some("2"));
        assert!(second.has_flag(RESTART_FLAG));
        assert_ne!(first.attribute(UFRAG_ATTR), second.attribute(UFRAG_ATTR));
        assert_ne!(first.attribute(PWD_ATTR), second.attribute(PWD_ATTR));
    }

    #[test]
    fn test_answer_generation_must_match() {
        let mut t = QuicTransport::new(&params(Role::Initiator), &loopback_config()).unwrap();
        t.create_offer(false).unwrap();
        let stale = SessionDescription::answer("a=ice-ufrag:abcd\r\na=ice-pwd:efgh\r\na=x-generation:0\r\n");
        assert!(matches!(t.accept_answer(&stale), Err(TransportError::InvalidDescription(_))));
        let missing = SessionDescription::answer("v=0\r\n");
        assert!(matches!(t.accept_answer(&missing), Err(TransportError::InvalidDescription(_))));
    }

    #[test]
    fn test_bad_candidate_rejected() {
        let mut t = QuicTransport::new(&params(Role::Initiator), &loopback_config()).unwrap();
        let bad = IceCandidateInit::new("candidate:x 1 udp nope 127.0.0.1 1 typ host");
        assert!(matches!(t.add_remote_candidate(&bad), Err(TransportError::InvalidCandidate(_))));
        let good = IceCandidateInit::new("candidate:1 1 udp 2130706431 127.0.0.1 9 typ host");
        assert!(t.add_remote_candidate(&good).is_ok());
    }

    #[test]
    fn test_send_before_connected_is_false() {
        let mut t = QuicTransport::new(&params(Role::Initiator), &loopback_config()).unwrap();
        t.create_channels().unwrap();
        assert!(!t.send(ChannelKind::Reliable, b"x"));
        assert!(!t.send(ChannelKind::Unreliable, b"x"));
    }

    #[test]
    fn test_outbound_queue_is_bounded() {
        let mut queue = OutboundQueue::default();
        let frame = vec![0u8; MAX_FRAME_LEN];
        let mut accepted = 0;
        while queue.push_frame(&frame) {
            accepted += 1;
        }
        assert_eq!(accepted, MAX_OUTBOUND_LEN / (MAX_FRAME_LEN + FRAME_HEADER_LEN));
        assert!(queue.len() <= MAX_OUTBOUND_LEN);
        assert!(!queue.push_frame(&vec![0u8; MAX_FRAME_LEN + 1]));

        queue.consume(FRAME_HEADER_LEN + MAX_FRAME_LEN);
        assert!(queue.push_frame(&frame));
        assert!(!queue.push_frame(&frame));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.push_frame(b"move"));
        assert_eq!(queue.pending(), &encode_frame(b"move")[..]);
    }

    #[test]
    fn test_superseded_offer_rejected() {
        let (cert_path, key_path) = write_test_certs("superseded");
        let responder_config = QuicTransportConfig {
            cert_path: Some(cert_path.clone()),
            key_path: Some(key_path.clone()),
            ..loopback_config()
        };
        let mut a = QuicTransport::new(&params(Role::Initiator), &loopback_config()).unwrap();
        let mut b = QuicTransport::new(&params(Role::Responder), &responder_config).unwrap();
        let _ = std::fs::remove_file(cert_path);
        let _ = std::fs::remove_file(key_path);

        let first = a.create_offer(false).unwrap();
        let answer = b.accept_offer(&first).unwrap();
        assert_eq!(answer.attribute(GENERATION_ATTR), Some("1"));
        drain(&mut b);

        assert!(matches!(b.accept_offer(&first), Err(TransportError::InvalidDescription(_))));
        assert!(drain(&mut b).is_empty());

        let restart = a.create_offer(true).unwrap();
        let answer = b.accept_offer(&restart).unwrap();
        assert_eq!(answer.attribute(GENERATION_ATTR), Some("2"));
        assert!(matches!(b.accept_offer(&first), Err(TransportError::InvalidDescription(_))));
        assert_eq!(b.generation(), 2);
    }

    #[test]
    fn test_relay_policy_without_turn_server_fails() {
        let mut p = params(Role::Initiator);
        p.policy = TransportPolicy::Relay;
        let mut t = QuicTransport::new(&p, &loopback_config()).unwrap();
        t.create_offer(false).unwrap();
        t.poll(Instant::now()).unwrap();
        let events = drain(&mut t);
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransportEvent::LocalCandidate(_))));
        assert_eq!(t.state(), TransportState::Failed);
    }

    #[test]
    fn test_relay_policy_allocates_relay_candidate() {
        use std::net::UdpSocket as StdUdpSocket;

        const ALLOCATE: u16 = 0x0003;
        const ALLOCATE_SUCCESS: u16 = 0x0103;
        const CREATE_PERMISSION: u16 = 0x0008;
        const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
        const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;

        let server = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let server_addr = server.local_addr().unwrap();
        let relayed: SocketAddr = "127.0.0.1:49999".parse().unwrap();

        let mut p = params(Role::Initiator);
        p.policy = TransportPolicy::Relay;
        p.ice_servers = IceServerSet::validate(&[crate::ice::IceServer::new([format!(
            "turn:{}",
            server_addr
        )])
        .with_credentials("player", "secret")]);
        let mut t = QuicTransport::new(&p, &loopback_config()).unwrap();
        t.create_channels().unwrap();
        t.create_offer(false).unwrap();
        t.poll(Instant::now()).unwrap();

        let mut buf = [0u8; 1500];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        let request = stun::Message::parse(&buf[..len]).unwrap();
        assert_eq!(request.msg_type, ALLOCATE);
        let response = stun::MessageBuilder::new(ALLOCATE_SUCCESS, &request.transaction_id)
            .xor_address(ATTR_XOR_RELAYED_ADDRESS, relayed)
            .finish();
        server.send_to(&response, from).unwrap();

        let mut candidates = Vec::new();
        for _ in 0..100 {
            t.poll(Instant::now()).unwrap();
            candidates.extend(drain(&mut t).into_iter().filter_map(|e| match e {
                TransportEvent::LocalCandidate(c) => c.candidate.parse::<Candidate>().ok(),
                _ => None,
            }));
            if !candidates.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].candidate_type, candidate::CandidateType::Relay);
        assert_eq!(candidates[0].address, relayed);
        assert_eq!(t.relayed_addr(), Some(relayed));
        assert_eq!(t.state(), TransportState::Checking);

        let peer = IceCandidateInit::new("candidate:1 1 udp 16777215 127.0.0.1 40000 typ relay");
        t.add_remote_candidate(&peer).unwrap();
        t.poll(Instant::now()).unwrap();
        let (len, _) = server.recv_from(&mut buf).unwrap();
        let permission = stun::Message::parse(&buf[..len]).unwrap();
        assert_eq!(permission.msg_type, CREATE_PERMISSION);
        assert_eq!(
            permission.xor_address(ATTR_XOR_PEER_ADDRESS).map(|a| a.ip()),
            Some("127.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut t = QuicTransport::new(&params(Role::Initiator), &loopback_config()).unwrap();
        t.close();
        t.close();
        assert_eq!(t.state(), TransportState::Closed);
        assert!(t.timeout().is_none());
        assert!(matches!(t.create_offer(false), Err(TransportError::Closed)));
    }
}
