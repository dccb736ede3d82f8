//! Minimal TURN client (RFC 5766) for relayed candidates
//!
//! One UDP allocation per session, on the session socket:
//!
//! ```text
//! Client                                        TURN server
//!   │── Allocate {REQUESTED-TRANSPORT udp} ───────────►│
//!   │◄──────────────────── 401 {REALM, NONCE} ─────────│
//!   │── Allocate + USERNAME/REALM/NONCE/INTEGRITY ────►│
//!   │◄────────── success {XOR-RELAYED-ADDRESS, ...} ───│  relay candidate
//!   │── CreatePermission {XOR-PEER-ADDRESS} ──────────►│  per remote IP
//!   │── Send indication {XOR-PEER-ADDRESS, DATA} ─────►│──► peer
//!   │◄───── Data indication {XOR-PEER-ADDRESS, DATA} ──│◄── peer
//!   │── Refresh before the lifetime runs out ─────────►│
//! ```
//!
//! Long-term credentials: the integrity key is `MD5(username:realm:password)`.
//! Channel bindings are not used; every relayed packet travels in an
//! indication.

use super::stun::{Message, MessageBuilder, ATTR_XOR_MAPPED_ADDRESS, STUN_MAX_TRANSMITS, STUN_RTO};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

const ALLOCATE: u16 = 0x0003;
const REFRESH: u16 = 0x0004;
const SEND_INDICATION: u16 = 0x0016;
const DATA_INDICATION: u16 = 0x0017;
const CREATE_PERMISSION: u16 = 0x0008;

const SUCCESS_CLASS: u16 = 0x0100;
const ERROR_CLASS: u16 = 0x0110;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
const ATTR_DATA: u16 = 0x0013;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;

/// REQUESTED-TRANSPORT value: protocol 17 (UDP) and three reserved bytes
const TRANSPORT_UDP: [u8; 4] = [17, 0, 0, 0];

const UNAUTHORIZED: u16 = 401;
const STALE_NONCE: u16 = 438;

/// Server default when a response carries no LIFETIME
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

/// Permissions last five minutes; refresh a minute early
pub const PERMISSION_REFRESH: Duration = Duration::from_secs(240);

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Allocation granted; `mapped` is our address as the server sees it
    Allocated {
        relayed: SocketAddr,
        mapped: Option<SocketAddr>,
    },
    /// Allocation refused or the server stopped answering
    Failed(String),
    /// Payload relayed from `peer`
    Data { peer: SocketAddr, data: Vec<u8> },
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Allocate,
    Refresh,
    CreatePermission(SocketAddr),
}

impl RequestKind {
    fn method(&self) -> u16 {
        match self {
            RequestKind::Allocate => ALLOCATE,
            RequestKind::Refresh => REFRESH,
            RequestKind::CreatePermission(_) => CREATE_PERMISSION,
        }
    }
}

#[derive(Debug)]
struct Transaction {
    kind: RequestKind,
    transaction_id: [u8; 12],
    packet: Vec<u8>,
    transmits: u32,
    last_sent: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocationState {
    Idle,
    Allocating,
    Allocated,
    Failed,
}

pub struct TurnClient {
    server: SocketAddr,
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<String>,
    key: Option<hmac::Key>,
    state: AllocationState,
    relayed: Option<SocketAddr>,
    lifetime: Duration,
    refreshed_at: Option<Instant>,
    /// Peer IP -> when its permission was last granted
    permissions: HashMap<IpAddr, Option<Instant>>,
    transactions: Vec<Transaction>,
    events: VecDeque<TurnEvent>,
    rng: SystemRandom,
}

impl TurnClient {
    pub fn new(server: SocketAddr, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server,
            username: username.into(),
            password: password.into(),
            realm: None,
            nonce: None,
            key: None,
            state: AllocationState::Idle,
            relayed: None,
            lifetime: DEFAULT_LIFETIME,
            refreshed_at: None,
            permissions: HashMap::new(),
            transactions: Vec::new(),
            events: VecDeque::new(),
            rng: SystemRandom::new(),
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.relayed
    }

    pub fn is_allocated(&self) -> bool {
        self.state == AllocationState::Allocated
    }

    pub fn has_failed(&self) -> bool {
        self.state == AllocationState::Failed
    }

    /// Requests outstanding, so the caller should poll soon
    pub fn is_busy(&self) -> bool {
        self.state == AllocationState::Idle || !self.transactions.is_empty()
    }

    pub fn poll_event(&mut self) -> Option<TurnEvent> {
        self.events.pop_front()
    }

    fn transaction_id(&self) -> Option<[u8; 12]> {
        let mut id = [0u8; 12];
        self.rng.fill(&mut id).ok()?;
        Some(id)
    }

    fn fail(&mut self, reason: String) {
        log::warn!("TURN {}: {}", self.server, reason);
        self.state = AllocationState::Failed;
        self.transactions.clear();
        self.events.push_back(TurnEvent::Failed(reason));
    }

    fn build(&self, kind: RequestKind, transaction_id: &[u8; 12]) -> Vec<u8> {
        let mut msg = MessageBuilder::new(kind.method(), transaction_id);
        match kind {
            RequestKind::Allocate => {
                msg = msg.attribute(ATTR_REQUESTED_TRANSPORT, &TRANSPORT_UDP);
            }
            RequestKind::Refresh => {
                msg = msg.attribute(ATTR_LIFETIME, &(self.lifetime.as_secs() as u32).to_be_bytes());
            }
            RequestKind::CreatePermission(peer) => {
                msg = msg.xor_address(ATTR_XOR_PEER_ADDRESS, peer);
            }
        }
        self.authenticate(msg).finish()
    }

    fn authenticate(&self, msg: MessageBuilder) -> MessageBuilder {
        match (&self.realm, &self.nonce, &self.key) {
            (Some(realm), Some(nonce), Some(key)) => msg
                .attribute(ATTR_USERNAME, self.username.as_bytes())
                .attribute(ATTR_REALM, realm.as_bytes())
                .attribute(ATTR_NONCE, nonce.as_bytes())
                .integrity(key),
            _ => msg,
        }
    }

    fn start(&mut self, kind: RequestKind) {
        self.transactions.retain(|t| t.kind != kind);
        let Some(transaction_id) = self.transaction_id() else {
            log::warn!("Failed to generate TURN transaction id");
            return;
        };
        let packet = self.build(kind, &transaction_id);
        self.transactions.push(Transaction {
            kind,
            transaction_id,
            packet,
            transmits: 0,
            last_sent: None,
        });
    }

    /// Install a permission for `peer`'s IP once the allocation exists
    pub fn permit(&mut self, peer: SocketAddr) {
        if self.permissions.contains_key(&peer.ip()) || self.has_failed() {
            return;
        }
        self.permissions.insert(peer.ip(), None);
        if self.is_allocated() {
            // permissions are per IP; the port is ignored by the server
            self.start(RequestKind::CreatePermission(SocketAddr::new(peer.ip(), 0)));
        }
    }

    /// Next request for the server, if one is due
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        match self.state {
            AllocationState::Idle => {
                self.state = AllocationState::Allocating;
                self.start(RequestKind::Allocate);
            }
            AllocationState::Allocated => self.schedule_refreshes(now),
            AllocationState::Allocating | AllocationState::Failed => {}
        }

        let mut exhausted = None;
        for t in &mut self.transactions {
            let due = t
                .last_sent
                .map_or(true, |sent| now.duration_since(sent) >= STUN_RTO);
            if !due {
                continue;
            }
            if t.transmits >= STUN_MAX_TRANSMITS {
                exhausted = Some(t.kind);
                break;
            }
            t.transmits += 1;
            t.last_sent = Some(now);
            return Some(t.packet.clone());
        }

        match exhausted {
            Some(RequestKind::CreatePermission(peer)) => {
                log::debug!("TURN {}: permission for {} unanswered", self.server, peer.ip());
                self.transactions.retain(|t| t.kind != RequestKind::CreatePermission(peer));
                self.permissions.remove(&peer.ip());
                None
            }
            Some(_) => {
                self.fail("server did not answer".into());
                None
            }
            None => None,
        }
    }

    fn schedule_refreshes(&mut self, now: Instant) {
        let refresh_due = self
            .refreshed_at
            .map_or(false, |at| now.duration_since(at) >= self.lifetime / 2);
        if refresh_due && !self.transactions.iter().any(|t| t.kind == RequestKind::Refresh) {
            self.refreshed_at = Some(now);
            self.start(RequestKind::Refresh);
        }

        let expiring: Vec<IpAddr> = self
            .permissions
            .iter()
            .filter(|(_, granted)| granted.map_or(false, |at| now.duration_since(at) >= PERMISSION_REFRESH))
            .map(|(ip, _)| *ip)
            .collect();
        for ip in expiring {
            self.permissions.insert(ip, None);
            self.start(RequestKind::CreatePermission(SocketAddr::new(ip, 0)));
        }
    }

    /// Wrap `data` for `peer` in a Send indication; None before allocation
    pub fn wrap(&self, data: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        if !self.is_allocated() {
            return None;
        }
        let transaction_id = self.transaction_id()?;
        Some(
            MessageBuilder::new(SEND_INDICATION, &transaction_id)
                .xor_address(ATTR_XOR_PEER_ADDRESS, peer)
                .attribute(ATTR_DATA, data)
                .finish(),
        )
    }

    /// Release the allocation (Refresh with zero lifetime)
    pub fn release(&mut self) -> Option<Vec<u8>> {
        if !self.is_allocated() {
            return None;
        }
        self.state = AllocationState::Failed;
        self.transactions.clear();
        let transaction_id = self.transaction_id()?;
        let msg = MessageBuilder::new(REFRESH, &transaction_id).attribute(ATTR_LIFETIME, &0u32.to_be_bytes());
        Some(self.authenticate(msg).finish())
    }

    /// Feed a packet that came from the server
    pub fn handle_packet(&mut self, packet: &[u8], now: Instant) {
        let Some(msg) = Message::parse(packet) else {
            log::trace!("TURN {}: non-STUN packet ignored", self.server);
            return;
        };

        if msg.msg_type == DATA_INDICATION {
            let peer = msg.xor_address(ATTR_XOR_PEER_ADDRESS);
            let data = msg.attribute(ATTR_DATA);
            if let (Some(peer), Some(data)) = (peer, data) {
                self.events.push_back(TurnEvent::Data {
                    peer,
                    data: data.to_vec(),
                });
            }
            return;
        }

        let Some(idx) = self
            .transactions
            .iter()
            .position(|t| t.transaction_id == msg.transaction_id)
        else {
            log::trace!("TURN {}: unmatched response", self.server);
            return;
        };
        let kind = self.transactions[idx].kind;
        let method = kind.method();

        if msg.msg_type == method | SUCCESS_CLASS {
            if let Some(key) = self.key.as_ref() {
                if !msg.verify_integrity(key) {
                    log::debug!("TURN {}: response failed integrity check", self.server);
                    return;
                }
            }
            self.transactions.remove(idx);
            self.on_success(kind, &msg, now);
        } else if msg.msg_type == method | ERROR_CLASS {
            self.transactions.remove(idx);
            self.on_error(kind, &msg);
        }
    }

    fn on_success(&mut self, kind: RequestKind, msg: &Message<'_>, now: Instant) {
        if let Some(seconds) = msg.attribute(ATTR_LIFETIME).and_then(|v| v.try_into().ok()) {
            self.lifetime = Duration::from_secs(u32::from_be_bytes(seconds) as u64);
        }
        match kind {
            RequestKind::Allocate => {
                let Some(relayed) = msg.xor_address(ATTR_XOR_RELAYED_ADDRESS) else {
                    self.fail("allocation without XOR-RELAYED-ADDRESS".into());
                    return;
                };
                let mapped = msg.xor_address(ATTR_XOR_MAPPED_ADDRESS);
                log::info!("TURN {}: relayed address {}", self.server, relayed);
                self.state = AllocationState::Allocated;
                self.relayed = Some(relayed);
                self.refreshed_at = Some(now);
                let waiting: Vec<IpAddr> = self.permissions.keys().copied().collect();
                for ip in waiting {
                    self.start(RequestKind::CreatePermission(SocketAddr::new(ip, 0)));
                }
                self.events.push_back(TurnEvent::Allocated { relayed, mapped });
            }
            RequestKind::Refresh => {
                log::debug!("TURN {}: allocation refreshed for {:?}", self.server, self.lifetime);
            }
            RequestKind::CreatePermission(peer) => {
                log::debug!("TURN {}: permission granted for {}", self.server, peer.ip());
                self.permissions.insert(peer.ip(), Some(now));
            }
        }
    }

    fn on_error(&mut self, kind: RequestKind, msg: &Message<'_>) {
        let code = msg
            .attribute(ATTR_ERROR_CODE)
            .filter(|v| v.len() >= 4)
            .map(|v| (v[2] & 0x07) as u16 * 100 + v[3] as u16)
            .unwrap_or(0);

        let challenged = code == STALE_NONCE || (code == UNAUTHORIZED && self.key.is_none());
        if challenged {
            let realm = msg.attribute(ATTR_REALM).map(|v| String::from_utf8_lossy(v).into_owned());
            let nonce = msg.attribute(ATTR_NONCE).map(|v| String::from_utf8_lossy(v).into_owned());
            if let Some(nonce) = nonce {
                if let Some(realm) = realm.or_else(|| self.realm.clone()) {
                    let digest = md5::compute(format!("{}:{}:{}", self.username, realm, self.password));
                    self.key = Some(hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &digest.0));
                    self.realm = Some(realm);
                }
                self.nonce = Some(nonce);
                if self.key.is_some() {
                    log::debug!("TURN {}: retrying {:?} with credentials", self.server, kind);
                    self.start(kind);
                    return;
                }
            }
        }

        match kind {
            RequestKind::CreatePermission(peer) => {
                log::debug!("TURN {}: permission for {} refused ({})", self.server, peer.ip(), code);
                self.permissions.remove(&peer.ip());
            }
            RequestKind::Refresh if self.is_allocated() => {
                self.fail(format!("refresh refused ({})", code));
            }
            RequestKind::Refresh => {}
            RequestKind::Allocate => self.fail(format!("allocation refused ({})", code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "player";
    const PASS: &str = "hunter2";
    const REALM: &str = "example.org";

    fn server() -> SocketAddr {
        "192.0.2.10:3478".parse().unwrap()
    }

    fn key() -> hmac::Key {
        let digest = md5::compute(format!("{}:{}:{}", USER, REALM, PASS));
        hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &digest.0)
    }

    fn txn(packet: &[u8]) -> [u8; 12] {
        Message::parse(packet).unwrap().transaction_id
    }

    fn challenge(request: &[u8]) -> Vec<u8> {
        let mut code = vec![0, 0, 4, 1];
        code.extend_from_slice(b"Unauthorized");
        MessageBuilder::new(ALLOCATE | ERROR_CLASS, &txn(request))
            .attribute(ATTR_ERROR_CODE, &code)
            .attribute(ATTR_REALM, REALM.as_bytes())
            .attribute(ATTR_NONCE, b"n0nce")
            .finish()
    }

    fn allocated(request: &[u8], relayed: SocketAddr) -> Vec<u8> {
        MessageBuilder::new(ALLOCATE | SUCCESS_CLASS, &txn(request))
            .xor_address(ATTR_XOR_RELAYED_ADDRESS, relayed)
            .xor_address(ATTR_XOR_MAPPED_ADDRESS, "198.51.100.4:50000".parse().unwrap())
            .attribute(ATTR_LIFETIME, &600u32.to_be_bytes())
            .integrity(&key())
            .finish()
    }

    /// Runs the 401 exchange; returns the client and its relayed address
    fn allocate(now: Instant) -> (TurnClient, SocketAddr) {
        let relayed: SocketAddr = "192.0.2.10:49152".parse().unwrap();
        let mut client = TurnClient::new(server(), USER, PASS);
        let first = client.poll_transmit(now).unwrap();
        client.handle_packet(&challenge(&first), now);
        let second = client.poll_transmit(now).unwrap();
        client.handle_packet(&allocated(&second, relayed), now);
        (client, relayed)
    }

    #[test]
    fn test_allocate_with_long_term_credentials() {
        let now = Instant::now();
        let mut client = TurnClient::new(server(), USER, PASS);

        let first = client.poll_transmit(now).unwrap();
        let msg = Message::parse(&first).unwrap();
        assert_eq!(msg.msg_type, ALLOCATE);
        assert_eq!(msg.attribute(ATTR_REQUESTED_TRANSPORT), Some(&TRANSPORT_UDP[..]));
        assert!(msg.attribute(ATTR_USERNAME).is_none());

        client.handle_packet(&challenge(&first), now);
        let second = client.poll_transmit(now).unwrap();
        let msg = Message::parse(&second).unwrap();
        assert_eq!(msg.msg_type, ALLOCATE);
        assert_eq!(msg.attribute(ATTR_USERNAME), Some(USER.as_bytes()));
        assert_eq!(msg.attribute(ATTR_REALM), Some(REALM.as_bytes()));
        assert_eq!(msg.attribute(ATTR_NONCE), Some(&b"n0nce"[..]));
        assert!(msg.verify_integrity(&key()));

        let relayed: SocketAddr = "192.0.2.10:49152".parse().unwrap();
        client.handle_packet(&allocated(&second, relayed), now);
        assert!(client.is_allocated());
        assert_eq!(
            client.poll_event(),
            Some(TurnEvent::Allocated {
                relayed,
                mapped: Some("198.51.100.4:50000".parse().unwrap()),
            })
        );
    }

    #[test]
    fn test_permission_waits_for_allocation() {
        let now = Instant::now();
        let peer: SocketAddr = "203.0.113.9:61000".parse().unwrap();
        let mut client = TurnClient::new(server(), USER, PASS);
        let first = client.poll_transmit(now).unwrap();
        client.permit(peer);
        assert!(client.poll_transmit(now).is_none());

        client.handle_packet(&challenge(&first), now);
        let second = client.poll_transmit(now).unwrap();
        client.handle_packet(&allocated(&second, "192.0.2.10:49152".parse().unwrap()), now);

        let request = client.poll_transmit(now).unwrap();
        let msg = Message::parse(&request).unwrap();
        assert_eq!(msg.msg_type, CREATE_PERMISSION);
        assert_eq!(
            msg.xor_address(ATTR_XOR_PEER_ADDRESS).map(|a| a.ip()),
            Some(peer.ip())
        );
        assert!(msg.verify_integrity(&key()));

        let granted = MessageBuilder::new(CREATE_PERMISSION | SUCCESS_CLASS, &msg.transaction_id)
            .integrity(&key())
            .finish();
        client.handle_packet(&granted, now);
        assert!(!client.is_busy());
        assert!(client.poll_transmit(now + PERMISSION_REFRESH).is_some());
    }

    #[test]
    fn test_send_and_data_indications() {
        let now = Instant::now();
        let peer: SocketAddr = "203.0.113.9:61000".parse().unwrap();
        let unallocated = TurnClient::new(server(), USER, PASS);
        assert!(unallocated.wrap(b"x", peer).is_none());

        let (mut client, _) = allocate(now);
        let wrapped = client.wrap(b"check", peer).unwrap();
        let msg = Message::parse(&wrapped).unwrap();
        assert_eq!(msg.msg_type, SEND_INDICATION);
        assert_eq!(msg.xor_address(ATTR_XOR_PEER_ADDRESS), Some(peer));
        assert_eq!(msg.attribute(ATTR_DATA), Some(&b"check"[..]));

        let inbound = MessageBuilder::new(DATA_INDICATION, &[7u8; 12])
            .xor_address(ATTR_XOR_PEER_ADDRESS, peer)
            .attribute(ATTR_DATA, b"quic")
            .finish();
        while client.poll_event().is_some() {}
        client.handle_packet(&inbound, now);
        assert_eq!(
            client.poll_event(),
            Some(TurnEvent::Data {
                peer,
                data: b"quic".to_vec()
            })
        );
    }

    #[test]
    fn test_refused_allocation_fails() {
        let now = Instant::now();
        let mut client = TurnClient::new(server(), USER, PASS);
        let first = client.poll_transmit(now).unwrap();
        let quota = MessageBuilder::new(ALLOCATE | ERROR_CLASS, &txn(&first))
            .attribute(ATTR_ERROR_CODE, &[0, 0, 4, 86])
            .finish();
        client.handle_packet(&quota, now);
        assert!(client.has_failed());
        assert_eq!(
            client.poll_event(),
            Some(TurnEvent::Failed("allocation refused (486)".into()))
        );
        assert!(client.poll_transmit(now).is_none());
    }

    #[test]
    fn test_unanswered_allocation_fails() {
        let t0 = Instant::now();
        let mut client = TurnClient::new(server(), USER, PASS);
        for i in 0..STUN_MAX_TRANSMITS {
            assert!(client.poll_transmit(t0 + STUN_RTO * i).is_some());
        }
        assert!(client.poll_transmit(t0 + STUN_RTO * STUN_MAX_TRANSMITS).is_none());
        assert!(client.has_failed());
    }

    #[test]
    fn test_refresh_at_half_lifetime_and_release() {
        let now = Instant::now();
        let (mut client, _) = allocate(now);
        assert!(client.poll_transmit(now + Duration::from_secs(10)).is_none());

        let refresh = client.poll_transmit(now + DEFAULT_LIFETIME / 2).unwrap();
        assert_eq!(Message::parse(&refresh).unwrap().msg_type, REFRESH);

        let release = client.release().unwrap();
        let msg = Message::parse(&release).unwrap();
        assert_eq!(msg.msg_type, REFRESH);
        assert_eq!(msg.attribute(ATTR_LIFETIME), Some(&[0u8, 0, 0, 0][..]));
        assert!(!client.is_allocated());
        assert!(client.wrap(b"x", server()).is_none());
    }

    #[test]
    fn test_forged_success_ignored() {
        let now = Instant::now();
        let mut client = TurnClient::new(server(), USER, PASS);
        let first = client.poll_transmit(now).unwrap();
        client.handle_packet(&challenge(&first), now);
        let second = client.poll_transmit(now).unwrap();
        let forged = MessageBuilder::new(ALLOCATE | SUCCESS_CLASS, &txn(&second))
            .xor_address(ATTR_XOR_RELAYED_ADDRESS, "198.51.100.66:1".parse().unwrap())
            .integrity(&hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, b"wrong"))
            .finish();
        client.handle_packet(&forged, now);
        assert!(!client.is_allocated());
        assert!(client.poll_event().is_none());
    }
}
