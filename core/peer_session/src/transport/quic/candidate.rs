//! Local candidates and the ICE candidate-line grammar
//!
//! Priorities follow RFC 8445 §5.1.2.1. Candidates travel over signaling as
//! `candidate:<foundation> 1 udp <priority> <ip> <port> typ <type>
//! [raddr <ip> rport <port>]`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

// ============================================================================
// Constants
// ============================================================================

const HOST_TYPE_PREF: u32 = 126;
const PRFLX_TYPE_PREF: u32 = 110;
const SRFLX_TYPE_PREF: u32 = 100;
const RELAY_TYPE_PREF: u32 = 0;

const IPV4_LOCAL_PREF: u32 = 65535;
const IPV6_LOCAL_PREF: u32 = 65534;

/// Single component; RTCP is never multiplexed here
pub const COMPONENT_ID: u32 = 1;

const CANDIDATE_PREFIX: &str = "candidate:";

// ============================================================================
// Candidate Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => HOST_TYPE_PREF,
            CandidateType::ServerReflexive => SRFLX_TYPE_PREF,
            CandidateType::PeerReflexive => PRFLX_TYPE_PREF,
            CandidateType::Relay => RELAY_TYPE_PREF,
        }
    }

    fn token(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::ServerReflexive),
            "prflx" => Some(CandidateType::PeerReflexive),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// ============================================================================
// Candidate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub candidate_type: CandidateType,
    pub address: SocketAddr,
    pub priority: u32,
    pub foundation: String,
    /// Base address for reflexive and relayed candidates
    pub related_address: Option<SocketAddr>,
}

impl Candidate {
    pub fn new(
        candidate_type: CandidateType,
        address: SocketAddr,
        related_address: Option<SocketAddr>,
    ) -> Self {
        let priority = calculate_priority(
            candidate_type.type_preference(),
            local_preference(&address),
            COMPONENT_ID,
        );
        Self {
            candidate_type,
            address,
            priority,
            foundation: foundation(candidate_type, &address),
            related_address,
        }
    }

    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateType::Host, address, None)
    }

    /// Public mapping learned from a STUN binding response
    pub fn server_reflexive(mapped: SocketAddr, base: SocketAddr) -> Self {
        Self::new(CandidateType::ServerReflexive, mapped, Some(base))
    }

    /// Address a TURN server relays for us; `base` is the server-side mapping
    pub fn relayed(relayed: SocketAddr, base: Option<SocketAddr>) -> Self {
        Self::new(CandidateType::Relay, relayed, base)
    }

    /// Remote address seen on a connectivity check that was never signaled
    pub fn peer_reflexive(address: SocketAddr) -> Self {
        Self::new(CandidateType::PeerReflexive, address, None)
    }

    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }

    pub fn is_link_local(&self) -> bool {
        match self.address.ip() {
            IpAddr::V4(addr) => addr.is_link_local(),
            IpAddr::V6(addr) => (addr.segments()[0] & 0xffc0) == 0xfe80,
        }
    }
}

/// Candidate-line rendering, without the `a=` prefix
impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {} udp {} {} {} typ {}",
            CANDIDATE_PREFIX,
            self.foundation,
            COMPONENT_ID,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type
        )?;
        if let Some(related) = self.related_address {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCandidateError(pub String);

impl fmt::Display for ParseCandidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed candidate: {}", self.0)
    }
}

impl std::error::Error for ParseCandidateError {}

impl FromStr for Candidate {
    type Err = ParseCandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |what: &str| ParseCandidateError(format!("{} in {:?}", what, s));

        let line = s.trim().trim_start_matches("a=");
        let body = line
            .strip_prefix(CANDIDATE_PREFIX)
            .ok_or_else(|| err("missing candidate: prefix"))?;
        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(err("too few fields"));
        }

        let foundation = fields[0].to_string();
        if fields[1] != "1" {
            return Err(err("unsupported component"));
        }
        if !fields[2].eq_ignore_ascii_case("udp") {
            return Err(err("unsupported transport"));
        }
        let priority: u32 = fields[3].parse().map_err(|_| err("bad priority"))?;
        let ip: IpAddr = fields[4].parse().map_err(|_| err("bad address"))?;
        let port: u16 = fields[5].parse().map_err(|_| err("bad port"))?;
        if fields[6] != "typ" {
            return Err(err("missing typ"));
        }
        let candidate_type = CandidateType::from_token(fields[7]).ok_or_else(|| err("bad type"))?;

        // Trailing extension attributes come in key/value pairs
        let mut raddr: Option<IpAddr> = None;
        let mut rport: Option<u16> = None;
        for pair in fields[8..].chunks(2) {
            match pair {
                ["raddr", value] => raddr = Some(value.parse().map_err(|_| err("bad raddr"))?),
                ["rport", value] => rport = Some(value.parse().map_err(|_| err("bad rport"))?),
                [_, _] => {}
                _ => return Err(err("dangling attribute")),
            }
        }

        Ok(Candidate {
            candidate_type,
            address: SocketAddr::new(ip, port),
            priority,
            foundation,
            related_address: match (raddr, rport) {
                (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
                _ => None,
            },
        })
    }
}

// ============================================================================
// Priority
// ============================================================================

/// `(2^24 * type_pref) + (2^8 * local_pref) + (256 - component)`
pub fn calculate_priority(type_pref: u32, local_pref: u32, component_id: u32) -> u32 {
    let type_pref = type_pref.min(126);
    let local_pref = local_pref.min(65535);
    let component_id = component_id.clamp(1, 256);
    (type_pref << 24) | (local_pref << 8) | (256 - component_id)
}

fn local_preference(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(_) => IPV4_LOCAL_PREF,
        IpAddr::V6(_) => IPV6_LOCAL_PREF,
    }
}

/// Same base IP and type share a foundation. Colons are mapped so IPv6
/// foundations stay within the ICE token alphabet.
fn foundation(candidate_type: CandidateType, addr: &SocketAddr) -> String {
    let ip: String = addr
        .ip()
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '+' })
        .collect();
    format!("{}{}", candidate_type, ip)
}

// ============================================================================
// Gathering
// ============================================================================

/// Host candidates for the socket's port on every usable interface
///
/// A socket bound to a specific address yields just that address; a
/// wildcard bind enumerates interfaces.
pub fn gather_host_candidates(bound: SocketAddr, include_loopback: bool) -> Vec<Candidate> {
    let addrs = if bound.ip().is_unspecified() {
        let mut addrs = enumerate_local_addresses(bound.port());
        if include_loopback {
            addrs.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port()));
        }
        addrs
    } else {
        vec![bound]
    };

    let mut candidates: Vec<Candidate> = addrs
        .into_iter()
        .filter(|addr| include_loopback || !addr.ip().is_loopback())
        .map(Candidate::host)
        .filter(|c| !c.is_link_local())
        .collect();
    sort_candidates_by_priority(&mut candidates);
    candidates.dedup_by(|a, b| a.address == b.address);
    candidates
}

/// None when the mapping equals the base (no NAT in between)
pub fn gather_reflexive_candidate(mapped: SocketAddr, base: SocketAddr) -> Option<Candidate> {
    if mapped.ip() == base.ip() {
        return None;
    }
    Some(Candidate::server_reflexive(mapped, base))
}

pub fn sort_candidates_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// Non-loopback IPv4 interface addresses via `getifaddrs`
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    // SAFETY: the list returned by getifaddrs is only walked while valid and
    // is released with freeifaddrs before returning.
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            log::debug!("getifaddrs failed: {}", std::io::Error::last_os_error());
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sin = ifa.ifa_addr as *const libc::sockaddr_in;
                let octets = (*sin).sin_addr.s_addr.to_ne_bytes();
                let ip = Ipv4Addr::from(octets);
                if !ip.is_loopback() {
                    addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(_port: u16) -> Vec<SocketAddr> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let host = calculate_priority(126, 65535, 1);
        assert_eq!(host, (126 << 24) | (65535 << 8) | 255);
        let prflx = calculate_priority(110, 65535, 1);
        let srflx = calculate_priority(100, 65535, 1);
        let relay = calculate_priority(0, 65535, 1);
        assert!(host > prflx && prflx > srflx && srflx > relay);
    }

    #[test]
    fn test_host_line_format() {
        let c = Candidate::host("192.168.1.100:50000".parse().unwrap());
        let line = c.to_string();
        assert!(line.starts_with("candidate:host192+168+1+100 1 udp "));
        assert!(line.ends_with(" 192.168.1.100 50000 typ host"));
    }

    #[test]
    fn test_parse_reflexive_line() {
        let c: Candidate = "candidate:842163049 1 udp 1677729535 203.0.113.5 61234 typ srflx raddr 10.0.0.2 rport 61234"
            .parse()
            .unwrap();
        assert_eq!(c.candidate_type, CandidateType::ServerReflexive);
        assert_eq!(c.address, "203.0.113.5:61234".parse().unwrap());
        assert_eq!(c.priority, 1677729535);
        assert_eq!(c.foundation, "842163049");
        assert_eq!(c.related_address, Some("10.0.0.2:61234".parse().unwrap()));
    }

    #[test]
    fn test_parse_accepts_prefix_and_extensions() {
        let c: Candidate = "a=candidate:1 1 UDP 2122260223 10.0.0.2 5000 typ host generation 0"
            .parse()
            .unwrap();
        assert_eq!(c.candidate_type, CandidateType::Host);
        assert!(c.related_address.is_none());
    }

    #[test]
    fn test_parse_written_line() {
        let original = Candidate::server_reflexive(
            "[2001:db8::1]:4000".parse().unwrap(),
            "[fd00::2]:4000".parse().unwrap(),
        );
        let parsed: Candidate = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Candidate>().is_err());
        assert!("candidate:1 1 tcp 1 10.0.0.1 5 typ host".parse::<Candidate>().is_err());
        assert!("candidate:1 1 udp 1 10.0.0.1 5 typ bogus".parse::<Candidate>().is_err());
        assert!("candidate:1 2 udp 1 10.0.0.1 5 typ host".parse::<Candidate>().is_err());
        assert!("candidate:1 1 udp 1 not-an-ip 5 typ host".parse::<Candidate>().is_err());
    }

    #[test]
    fn test_gather_host_specific_bind() {
        let bound: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        assert!(gather_host_candidates(bound, false).is_empty());
        let with_lo = gather_host_candidates(bound, true);
        assert_eq!(with_lo.len(), 1);
        assert_eq!(with_lo[0].address, bound);
    }

    #[test]
    fn test_gather_reflexive_skips_same_ip() {
        let base: SocketAddr = "192.168.1.100:50000".parse().unwrap();
        assert!(gather_reflexive_candidate("203.0.113.50:50000".parse().unwrap(), base).is_some());
        assert!(gather_reflexive_candidate("192.168.1.100:51000".parse().unwrap(), base).is_none());
    }

    #[test]
    fn test_enumerate_local_addresses() {
        for addr in enumerate_local_addresses(50000) {
            assert!(!addr.ip().is_loopback());
            assert_eq!(addr.port(), 50000);
        }
    }
}
