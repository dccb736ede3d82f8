//! Connectivity checks over the session socket
//!
//! Each side pairs its base candidate with every remote candidate and sends
//! binding checks. The controlling side (the Initiator) nominates the first
//! pair that succeeds by repeating the check with `use_candidate` set; the
//! nominated pair's second success selects the path QUIC runs over.
//!
//! ```text
//! Initiator (controlling)                      Responder (controlled)
//!   │── Check(txn, prio) ──────────────────────────►│
//!   │◄─────────────────────── Response(txn, mapped) ─│
//!   │── Check(txn', prio, use_candidate) ──────────►│  path selected
//!   │◄────────────────────── Response(txn', mapped) ─│  path selected
//! ```
//!
//! # Wire format
//!
//! ```text
//! [0x21][bincode(CheckMessage)][HMAC-SHA256(body, receiver ice-pwd); 32]
//! ```
//!
//! Pair priority (RFC 8445 §6.1.2.3):
//! `2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)`

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::candidate::Candidate;

// ============================================================================
// Constants
// ============================================================================

/// First byte of every check packet
pub const CHECK_MARKER: u8 = 0x21;

pub const TRANSACTION_ID_LEN: usize = 12;

const TAG_LEN: usize = 32;

pub const INITIAL_RTO: Duration = Duration::from_millis(100);

pub const MAX_RTO: Duration = Duration::from_millis(1600);

pub const MAX_RETRANSMITS: u32 = 5;

/// Minimum gap between two outgoing checks
pub const PACE_INTERVAL: Duration = Duration::from_millis(20);

pub type TransactionId = [u8; TRANSACTION_ID_LEN];

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub transaction_id: TransactionId,
    /// Priority a peer-reflexive candidate learned from this check would get
    pub priority: u32,
    pub use_candidate: bool,
    /// `<receiver ufrag>:<sender ufrag>`
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResponse {
    pub transaction_id: TransactionId,
    /// Source address the request was seen from
    pub mapped_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckMessage {
    Request(BindingRequest),
    Response(BindingResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    Malformed(String),
    /// Integrity tag did not verify with the expected password
    Integrity,
    Encode(String),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::Malformed(msg) => write!(f, "malformed check: {}", msg),
            CheckError::Integrity => write!(f, "check integrity mismatch"),
            CheckError::Encode(msg) => write!(f, "check encode failed: {}", msg),
        }
    }
}

impl std::error::Error for CheckError {}

pub fn is_check_packet(packet: &[u8]) -> bool {
    packet.first() == Some(&CHECK_MARKER)
}

/// Serialize and sign with the receiver's ICE password
pub fn encode_check(msg: &CheckMessage, receiver_pwd: &str) -> Result<Vec<u8>, CheckError> {
    let body = bincode::serialize(msg).map_err(|e| CheckError::Encode(e.to_string()))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, receiver_pwd.as_bytes());
    let tag = hmac::sign(&key, &body);

    let mut out = Vec::with_capacity(1 + body.len() + TAG_LEN);
    out.push(CHECK_MARKER);
    out.extend_from_slice(&body);
    out.extend_from_slice(tag.as_ref());
    Ok(out)
}

/// Verify with our own ICE password, then deserialize
pub fn decode_check(packet: &[u8], own_pwd: &str) -> Result<CheckMessage, CheckError> {
    if !is_check_packet(packet) {
        return Err(CheckError::Malformed("missing marker".into()));
    }
    if packet.len() < 1 + TAG_LEN + 1 {
        return Err(CheckError::Malformed(format!("{} bytes", packet.len())));
    }
    let (body, tag) = packet[1..].split_at(packet.len() - 1 - TAG_LEN);
    let key = hmac::Key::new(hmac::HMAC_SHA256, own_pwd.as_bytes());
    hmac::verify(&key, body, tag).map_err(|_| CheckError::Integrity)?;
    bincode::deserialize(body).map_err(|e| CheckError::Malformed(e.to_string()))
}

// ============================================================================
// Candidate Pairs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
    pub foundation: String,
    pub state: CheckState,
    pub transmit_count: u32,
    pub last_sent: Option<Instant>,
    pub transaction_id: Option<TransactionId>,
    /// Controlling side: the outstanding check carries `use_candidate`
    pub nominated: bool,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate, controlling: bool) -> Self {
        let priority = calculate_pair_priority(local.priority, remote.priority, controlling);
        let foundation = format!("{}:{}", local.foundation, remote.foundation);
        Self {
            local,
            remote,
            priority,
            foundation,
            state: CheckState::Frozen,
            transmit_count: 0,
            last_sent: None,
            transaction_id: None,
            nominated: false,
        }
    }

    /// Exponential backoff, capped
    pub fn current_rto(&self) -> Duration {
        let multiplier = 1u32 << self.transmit_count.saturating_sub(1).min(4);
        (INITIAL_RTO * multiplier).min(MAX_RTO)
    }

    fn needs_retransmit(&self, now: Instant) -> bool {
        if self.state != CheckState::InProgress || self.transmit_count >= MAX_RETRANSMITS {
            return false;
        }
        match self.last_sent {
            Some(sent) => now.duration_since(sent) >= self.current_rto(),
            None => true,
        }
    }

    fn retransmits_exhausted(&self, now: Instant) -> bool {
        self.state == CheckState::InProgress
            && self.transmit_count >= MAX_RETRANSMITS
            && self
                .last_sent
                .map_or(true, |sent| now.duration_since(sent) >= self.current_rto())
    }
}

pub fn calculate_pair_priority(local_priority: u32, remote_priority: u32, controlling: bool) -> u64 {
    let (g, d) = if controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };
    let tie_breaker = u64::from(g > d);
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + tie_breaker
}

// ============================================================================
// Check List
// ============================================================================

/// A check ready to go on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingCheck {
    pub destination: SocketAddr,
    pub transaction_id: TransactionId,
    pub use_candidate: bool,
}

/// Result of matching a response against the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Pair works; nomination (if ours to do) follows
    Succeeded(SocketAddr),
    /// Nominated pair confirmed: run QUIC over this remote address
    Selected(SocketAddr),
}

#[derive(Debug)]
pub struct CheckList {
    pairs: Vec<CandidatePair>,
    local: Vec<Candidate>,
    /// Remotes with no local candidate of their family yet
    unpaired: Vec<Candidate>,
    controlling: bool,
    check_timeout: Duration,
    start_time: Option<Instant>,
    last_check_time: Option<Instant>,
    selected: Option<SocketAddr>,
    rng: SystemRandom,
}

impl CheckList {
    pub fn new(controlling: bool, check_timeout: Duration) -> Self {
        Self {
            pairs: Vec::new(),
            local: Vec::new(),
            unpaired: Vec::new(),
            controlling,
            check_timeout,
            start_time: None,
            last_check_time: None,
            selected: None,
            rng: SystemRandom::new(),
        }
    }

    /// Forget every pair and result (ICE restart)
    pub fn reset(&mut self) {
        self.pairs.clear();
        self.unpaired.clear();
        self.start_time = None;
        self.last_check_time = None;
        self.selected = None;
    }

    pub fn is_controlling(&self) -> bool {
        self.controlling
    }

    /// Local candidates all share the socket, so each remote gets paired
    /// with the best local candidate of the same address family only.
    pub fn add_local(&mut self, candidate: Candidate) {
        if self.local.iter().any(|c| c.address == candidate.address) {
            return;
        }
        self.local.push(candidate);
        self.local.sort_by(|a, b| b.priority.cmp(&a.priority));
        let mut remotes: Vec<Candidate> = self.pairs.iter().map(|p| p.remote.clone()).collect();
        remotes.append(&mut self.unpaired);
        self.pairs.clear();
        for remote in remotes {
            self.pair_remote(remote);
        }
    }

    pub fn clear_local(&mut self) {
        self.local.clear();
    }

    pub fn add_remote(&mut self, remote: Candidate) -> bool {
        if self.knows_remote(remote.address) || self.unpaired.iter().any(|c| c.address == remote.address) {
            return false;
        }
        self.pair_remote(remote)
    }

    fn pair_remote(&mut self, remote: Candidate) -> bool {
        let local = match self
            .local
            .iter()
            .find(|l| l.address.is_ipv4() == remote.address.is_ipv4())
        {
            Some(local) => local.clone(),
            None => {
                log::debug!("No local candidate to pair with {} yet", remote.address);
                self.unpaired.push(remote);
                return false;
            }
        };
        let mut pair = CandidatePair::new(local, remote, self.controlling);
        if !self.pairs.iter().any(|p| p.foundation == pair.foundation) {
            pair.state = CheckState::Waiting;
        }
        self.pairs.push(pair);
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        true
    }

    pub fn start(&mut self, now: Instant) {
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
    }

    pub fn is_started(&self) -> bool {
        self.start_time.is_some()
    }

    /// Next check to send, honouring the pacing interval
    pub fn next_request(&mut self, now: Instant) -> Option<OutgoingCheck> {
        if self.start_time.is_none() || self.selected.is_some() {
            return None;
        }
        if let Some(last) = self.last_check_time {
            if now.duration_since(last) < PACE_INTERVAL {
                return None;
            }
        }

        if let Some(idx) = self.pairs.iter().position(|p| p.needs_retransmit(now)) {
            let pair = &mut self.pairs[idx];
            pair.transmit_count += 1;
            pair.last_sent = Some(now);
            self.last_check_time = Some(now);
            let transaction_id = pair.transaction_id?;
            return Some(OutgoingCheck {
                destination: pair.remote.address,
                transaction_id,
                use_candidate: pair.nominated,
            });
        }

        let idx = self.pairs.iter().position(|p| p.state == CheckState::Waiting)?;
        let transaction_id = self.transaction_id()?;
        let pair = &mut self.pairs[idx];
        pair.state = CheckState::InProgress;
        pair.transaction_id = Some(transaction_id);
        pair.transmit_count = 1;
        pair.last_sent = Some(now);
        self.last_check_time = Some(now);
        Some(OutgoingCheck {
            destination: pair.remote.address,
            transaction_id,
            use_candidate: pair.nominated,
        })
    }

    fn transaction_id(&self) -> Option<TransactionId> {
        let mut id = [0u8; TRANSACTION_ID_LEN];
        match self.rng.fill(&mut id) {
            Ok(()) => Some(id),
            Err(_) => {
                log::warn!("Failed to generate check transaction id");
                None
            }
        }
    }

    pub fn handle_response(&mut self, response: &BindingResponse, from: SocketAddr) -> Option<CheckOutcome> {
        let idx = self
            .pairs
            .iter()
            .position(|p| p.transaction_id == Some(response.transaction_id))?;

        // Responses must come back from where the check went
        if self.pairs[idx].remote.address != from {
            log::debug!(
                "Check response from {} for pair targeting {}",
                from,
                self.pairs[idx].remote.address
            );
            self.pairs[idx].state = CheckState::Failed;
            return None;
        }

        let pair = &mut self.pairs[idx];
        pair.transaction_id = None;
        pair.state = CheckState::Succeeded;
        let foundation = pair.foundation.clone();
        let remote = pair.remote.address;

        if pair.nominated {
            self.selected = Some(remote);
            return Some(CheckOutcome::Selected(remote));
        }
        if self.controlling && !self.pairs.iter().any(|p| p.nominated) {
            let pair = &mut self.pairs[idx];
            pair.nominated = true;
            pair.state = CheckState::Waiting;
            pair.transmit_count = 0;
            pair.last_sent = None;
            // Nominated check goes out immediately
            self.last_check_time = None;
        }

        for pair in &mut self.pairs {
            if pair.state == CheckState::Frozen && pair.foundation == foundation {
                pair.state = CheckState::Waiting;
            }
        }
        Some(CheckOutcome::Succeeded(remote))
    }

    /// Controlled side: the peer nominated `remote`
    pub fn select(&mut self, remote: SocketAddr) {
        self.selected = Some(remote);
    }

    pub fn selected(&self) -> Option<SocketAddr> {
        self.selected
    }

    pub fn handle_timeouts(&mut self, now: Instant) {
        let overall = self.is_timed_out(now);
        let mut renominate = false;
        for pair in &mut self.pairs {
            if pair.retransmits_exhausted(now) || (overall && pair.state == CheckState::InProgress) {
                renominate |= pair.nominated;
                pair.nominated = false;
                pair.state = CheckState::Failed;
            }
        }
        if renominate && self.controlling && self.selected.is_none() {
            // Nominate the next best pair that has already succeeded
            if let Some(pair) = self
                .pairs
                .iter_mut()
                .find(|p| p.state == CheckState::Succeeded)
            {
                pair.nominated = true;
                pair.state = CheckState::Waiting;
                pair.transmit_count = 0;
            }
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        match self.start_time {
            Some(start) => now.duration_since(start) >= self.check_timeout,
            None => false,
        }
    }

    /// Checks ran out of time without selecting a path
    pub fn has_failed(&self, now: Instant) -> bool {
        self.selected.is_none() && self.is_timed_out(now)
    }

    pub fn is_checking(&self) -> bool {
        self.start_time.is_some()
            && self.selected.is_none()
            && self
                .pairs
                .iter()
                .any(|p| matches!(p.state, CheckState::Waiting | CheckState::InProgress))
    }

    pub fn has_succeeded(&self) -> bool {
        self.pairs.iter().any(|p| p.state == CheckState::Succeeded)
    }

    pub fn get_best_succeeded(&self) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .filter(|p| p.state == CheckState::Succeeded)
            .max_by_key(|p| p.priority)
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs_by_state(&self, state: CheckState) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.iter().filter(move |p| p.state == state)
    }

    pub fn knows_remote(&self, addr: SocketAddr) -> bool {
        self.pairs.iter().any(|p| p.remote.address == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str) -> Candidate {
        Candidate::host(addr.parse().unwrap())
    }

    fn list(controlling: bool) -> CheckList {
        let mut cl = CheckList::new(controlling, Duration::from_secs(5));
        cl.add_local(host("10.0.0.1:5000"));
        cl
    }

    fn respond(check: &OutgoingCheck) -> BindingResponse {
        BindingResponse {
            transaction_id: check.transaction_id,
            mapped_address: "10.0.0.1:5000".parse().unwrap(),
        }
    }

    #[test]
    fn test_encode_decode_with_password() {
        let msg = CheckMessage::Request(BindingRequest {
            transaction_id: [7; TRANSACTION_ID_LEN],
            priority: 1234,
            use_candidate: true,
            username: "remote:local".into(),
        });
        let packet = encode_check(&msg, "pwd-b").unwrap();
        assert!(is_check_packet(&packet));
        assert_eq!(decode_check(&packet, "pwd-b").unwrap(), msg);
        assert_eq!(decode_check(&packet, "pwd-a"), Err(CheckError::Integrity));
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let msg = CheckMessage::Response(BindingResponse {
            transaction_id: [1; TRANSACTION_ID_LEN],
            mapped_address: "192.0.2.1:9".parse().unwrap(),
        });
        let mut packet = encode_check(&msg, "pwd").unwrap();
        packet[3] ^= 0xff;
        assert_eq!(decode_check(&packet, "pwd"), Err(CheckError::Integrity));
        assert!(matches!(decode_check(&[CHECK_MARKER, 1, 2], "pwd"), Err(CheckError::Malformed(_))));
    }

    #[test]
    fn test_pair_priority_formula() {
        let g = 100u32;
        let d = 50u32;
        assert_eq!(calculate_pair_priority(g, d, true), (1u64 << 32) * 50 + 2 * 100 + 1);
        assert_eq!(calculate_pair_priority(d, g, false), (1u64 << 32) * 50 + 2 * 100 + 1);
        assert_eq!(calculate_pair_priority(g, d, false), (1u64 << 32) * 50 + 2 * 100);
    }

    #[test]
    fn test_rto_backoff() {
        let mut pair = CandidatePair::new(host("10.0.0.1:1"), host("10.0.0.2:1"), true);
        pair.transmit_count = 1;
        assert_eq!(pair.current_rto(), INITIAL_RTO);
        pair.transmit_count = 3;
        assert_eq!(pair.current_rto(), Duration::from_millis(400));
        pair.transmit_count = 10;
        assert_eq!(pair.current_rto(), MAX_RTO);
    }

    #[test]
    fn test_no_requests_before_start() {
        let mut cl = list(true);
        cl.add_remote(host("10.0.0.2:6000"));
        assert!(cl.next_request(Instant::now()).is_none());
    }

    #[test]
    fn test_pacing() {
        let mut cl = list(false);
        cl.add_local(host("10.0.0.1:5000"));
        cl.add_remote(host("10.0.0.2:6000"));
        cl.add_remote(host("10.0.0.3:6000"));
        assert_eq!(cl.pair_count(), 2);
        let now = Instant::now();
        cl.start(now);
        assert!(cl.next_request(now).is_some());
        assert!(cl.next_request(now + Duration::from_millis(5)).is_none());
        assert!(cl.next_request(now + PACE_INTERVAL).is_some());
    }

    #[test]
    fn test_controlling_nominates_then_selects() {
        let mut cl = list(true);
        let remote: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        cl.add_remote(Candidate::host(remote));
        let now = Instant::now();
        cl.start(now);

        let first = cl.next_request(now).unwrap();
        assert!(!first.use_candidate);
        assert_eq!(cl.handle_response(&respond(&first), remote), Some(CheckOutcome::Succeeded(remote)));

        let nominated = cl.next_request(now + Duration::from_millis(1)).unwrap();
        assert!(nominated.use_candidate);
        assert_ne!(nominated.transaction_id, first.transaction_id);
        assert_eq!(cl.handle_response(&respond(&nominated), remote), Some(CheckOutcome::Selected(remote)));
        assert_eq!(cl.selected(), Some(remote));
        assert!(cl.next_request(now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_controlled_does_not_nominate() {
        let mut cl = list(false);
        let remote: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        cl.add_remote(Candidate::host(remote));
        let now = Instant::now();
        cl.start(now);
        let check = cl.next_request(now).unwrap();
        cl.handle_response(&respond(&check), remote);
        assert!(cl.has_succeeded());
        assert!(cl.selected().is_none());
        assert!(cl.next_request(now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_response_from_wrong_address_fails_pair() {
        let mut cl = list(true);
        cl.add_remote(host("10.0.0.2:6000"));
        let now = Instant::now();
        cl.start(now);
        let check = cl.next_request(now).unwrap();
        assert!(cl.handle_response(&respond(&check), "10.9.9.9:1".parse().unwrap()).is_none());
        assert_eq!(cl.pairs_by_state(CheckState::Failed).count(), 1);
    }

    #[test]
    fn test_retransmits_then_fail() {
        let mut cl = list(true);
        cl.add_remote(host("10.0.0.2:6000"));
        let mut now = Instant::now();
        cl.start(now);
        let first = cl.next_request(now).unwrap();
        let mut sent = 1;
        for _ in 0..50 {
            now += Duration::from_millis(100);
            if let Some(again) = cl.next_request(now) {
                assert_eq!(again.transaction_id, first.transaction_id);
                sent += 1;
            }
            cl.handle_timeouts(now);
        }
        assert_eq!(sent, MAX_RETRANSMITS);
        assert_eq!(cl.pairs_by_state(CheckState::Failed).count(), 1);
        assert!(cl.has_failed(now));
    }

    #[test]
    fn test_ipv6_remote_needs_ipv6_local() {
        let mut cl = list(true);
        assert!(!cl.add_remote(host("[2001:db8::2]:6000")));
        assert!(cl.add_remote(host("10.0.0.2:6000")));
        assert!(!cl.add_remote(host("10.0.0.2:6000")));
    }

    #[test]
    fn test_remote_paired_once_local_arrives() {
        let mut cl = CheckList::new(true, Duration::from_secs(5));
        assert!(!cl.add_remote(host("10.0.0.2:6000")));
        assert!(!cl.add_remote(host("10.0.0.2:6000")));
        assert_eq!(cl.pair_count(), 0);

        cl.add_local(host("10.0.0.1:5000"));
        assert_eq!(cl.pair_count(), 1);
        assert!(cl.knows_remote("10.0.0.2:6000".parse().unwrap()));
    }

    #[test]
    fn test_reset_clears_selection() {
        let mut cl = list(true);
        cl.select("10.0.0.2:6000".parse().unwrap());
        cl.start(Instant::now());
        cl.reset();
        assert!(cl.selected().is_none());
        assert!(!cl.is_started());
        assert_eq!(cl.pair_count(), 0);
    }
}
