//! Minimal STUN binding client (RFC 5389) for server-reflexive candidates
//!
//! Only what gathering needs: a bare Binding request, and a Binding success
//! response parsed for XOR-MAPPED-ADDRESS (falling back to MAPPED-ADDRESS).
//! [`Message`] and [`MessageBuilder`] are the attribute-level codec the TURN
//! client (turn.rs) builds on.

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

pub const HEADER_LEN: usize = 20;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// HMAC-SHA1 digest length
const INTEGRITY_LEN: usize = 20;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Retransmission interval for unanswered requests
pub const STUN_RTO: Duration = Duration::from_millis(500);

/// Transmissions per server before giving up on it
pub const STUN_MAX_TRANSMITS: u32 = 3;

/// Two high bits clear and the magic cookie in place
pub fn is_stun_packet(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN
        && packet[0] & 0xC0 == 0
        && packet[4..8] == MAGIC_COOKIE.to_be_bytes()
}

pub fn encode_binding_request(transaction_id: &[u8; 12]) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Length 0: no attributes
    out[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out[8..20].copy_from_slice(transaction_id);
    out
}

/// Returns the transaction id and mapped address of a Binding success response
pub fn decode_binding_response(packet: &[u8]) -> Option<([u8; 12], SocketAddr)> {
    let msg = Message::parse(packet)?;
    if msg.msg_type != BINDING_SUCCESS {
        return None;
    }
    let mapped = msg.xor_address(ATTR_XOR_MAPPED_ADDRESS).or_else(|| {
        msg.attribute(ATTR_MAPPED_ADDRESS)
            .and_then(|value| parse_address(value, None))
    })?;
    Some((msg.transaction_id, mapped))
}

// ============================================================================
// Messages
// ============================================================================

/// A parsed STUN message; attributes are borrowed from the packet
#[derive(Debug, Clone)]
pub struct Message<'a> {
    pub msg_type: u16,
    pub transaction_id: [u8; 12],
    packet: &'a [u8],
    body: &'a [u8],
}

impl<'a> Message<'a> {
    pub fn parse(packet: &'a [u8]) -> Option<Self> {
        if !is_stun_packet(packet) {
            return None;
        }
        let length = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        let body = packet.get(HEADER_LEN..HEADER_LEN + length)?;
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&packet[8..20]);
        Some(Self {
            msg_type: u16::from_be_bytes([packet[0], packet[1]]),
            transaction_id,
            packet,
            body,
        })
    }

    /// `(type, value, offset of the attribute header within the packet)`
    fn entries(&self) -> impl Iterator<Item = (u16, &'a [u8], usize)> + 'a {
        let body = self.body;
        let mut offset = 0;
        std::iter::from_fn(move || {
            if offset + 4 > body.len() {
                return None;
            }
            let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            let value = body.get(offset + 4..offset + 4 + attr_len)?;
            let at = HEADER_LEN + offset;
            // Attributes are padded to 4 bytes
            offset += 4 + ((attr_len + 3) & !3);
            Some((attr_type, value, at))
        })
    }

    pub fn attribute(&self, attr_type: u16) -> Option<&'a [u8]> {
        self.entries()
            .find(|(t, _, _)| *t == attr_type)
            .map(|(_, value, _)| value)
    }

    pub fn xor_address(&self, attr_type: u16) -> Option<SocketAddr> {
        parse_address(self.attribute(attr_type)?, Some(&self.transaction_id))
    }

    /// Check MESSAGE-INTEGRITY against `key`; false when absent
    pub fn verify_integrity(&self, key: &hmac::Key) -> bool {
        let Some((_, tag, at)) = self
            .entries()
            .find(|(t, _, _)| *t == ATTR_MESSAGE_INTEGRITY)
        else {
            return false;
        };
        // The length field covers everything up to and including the tag
        let mut signed = self.packet[..at].to_vec();
        let covered = (at + 4 + INTEGRITY_LEN - HEADER_LEN) as u16;
        signed[2..4].copy_from_slice(&covered.to_be_bytes());
        hmac::verify(key, &signed, tag).is_ok()
    }
}

/// Appends attributes, keeping the header length current
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, transaction_id: &[u8; 12]) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&msg_type.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(transaction_id);
        Self { buf }
    }

    fn set_length(&mut self, length: usize) {
        self.buf[2..4].copy_from_slice(&(length as u16).to_be_bytes());
    }

    pub fn attribute(mut self, attr_type: u16, value: &[u8]) -> Self {
        self.buf.extend_from_slice(&attr_type.to_be_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        let padded = (value.len() + 3) & !3;
        self.buf.resize(self.buf.len() + padded - value.len(), 0);
        let length = self.buf.len() - HEADER_LEN;
        self.set_length(length);
        self
    }

    pub fn xor_address(self, attr_type: u16, addr: SocketAddr) -> Self {
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&self.buf[8..20]);
        let value = encode_address(addr, Some(&transaction_id));
        self.attribute(attr_type, &value)
    }

    /// Sign everything so far; must be the last attribute
    pub fn integrity(mut self, key: &hmac::Key) -> Self {
        let length = self.buf.len() - HEADER_LEN + 4 + INTEGRITY_LEN;
        self.set_length(length);
        let tag = hmac::sign(key, &self.buf);
        self.attribute(ATTR_MESSAGE_INTEGRITY, tag.as_ref())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// MAPPED-ADDRESS layout, XOR'd when `xor_with` is given
pub fn encode_address(addr: SocketAddr, xor_with: Option<&[u8; 12]>) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = addr.port();
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    let mut out = vec![0u8];
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(FAMILY_IPV4);
            out.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if xor_with.is_some() {
                for (o, c) in octets.iter_mut().zip(cookie.iter()) {
                    *o ^= c;
                }
            }
            out.extend_from_slice(&octets);
        }
        IpAddr::V6(ip) => {
            out.push(FAMILY_IPV6);
            out.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if let Some(txn) = xor_with {
                let mask = cookie.iter().chain(txn.iter());
                for (o, m) in octets.iter_mut().zip(mask) {
                    *o ^= m;
                }
            }
            out.extend_from_slice(&octets);
        }
    }
    out
}

/// MAPPED-ADDRESS layout, XOR'd with the cookie and transaction id when
/// `xor_with` is given
pub fn parse_address(value: &[u8], xor_with: Option<&[u8; 12]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match value[1] {
        FAMILY_IPV4 => {
            let mut octets: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            if xor_with.is_some() {
                for (o, c) in octets.iter_mut().zip(cookie.iter()) {
                    *o ^= c;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            let mut octets: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            if let Some(txn) = xor_with {
                let mask = cookie.iter().chain(txn.iter());
                for (o, m) in octets.iter_mut().zip(mask) {
                    *o ^= m;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

// ============================================================================
// Gathering
// ============================================================================

#[derive(Debug)]
struct Binding {
    server: SocketAddr,
    transaction_id: [u8; 12],
    transmits: u32,
    last_sent: Option<Instant>,
    done: bool,
}

/// Drives binding requests to every STUN server until each answers or
/// runs out of retransmissions
#[derive(Debug)]
pub struct StunGatherer {
    bindings: Vec<Binding>,
}

impl StunGatherer {
    pub fn new(servers: &[SocketAddr]) -> Self {
        let rng = SystemRandom::new();
        let bindings = servers
            .iter()
            .filter_map(|&server| {
                let mut transaction_id = [0u8; 12];
                if rng.fill(&mut transaction_id).is_err() {
                    log::warn!("Failed to generate STUN transaction id for {}", server);
                    return None;
                }
                Some(Binding {
                    server,
                    transaction_id,
                    transmits: 0,
                    last_sent: None,
                    done: false,
                })
            })
            .collect();
        Self { bindings }
    }

    /// Next request to put on the wire, if any binding is due
    pub fn poll_transmit(&mut self, now: Instant) -> Option<([u8; HEADER_LEN], SocketAddr)> {
        for binding in &mut self.bindings {
            if binding.done {
                continue;
            }
            let due = binding
                .last_sent
                .map_or(true, |sent| now.duration_since(sent) >= STUN_RTO);
            if !due {
                continue;
            }
            if binding.transmits >= STUN_MAX_TRANSMITS {
                log::debug!("STUN server {} did not answer", binding.server);
                binding.done = true;
                continue;
            }
            binding.transmits += 1;
            binding.last_sent = Some(now);
            return Some((encode_binding_request(&binding.transaction_id), binding.server));
        }
        None
    }

    /// Mapped address from a matching response
    pub fn handle_response(&mut self, packet: &[u8], from: SocketAddr) -> Option<SocketAddr> {
        let (transaction_id, mapped) = decode_binding_response(packet)?;
        let binding = self
            .bindings
            .iter_mut()
            .find(|b| !b.done && b.transaction_id == transaction_id && b.server == from)?;
        binding.done = true;
        Some(mapped)
    }

    pub fn is_done(&self) -> bool {
        self.bindings.iter().all(|b| b.done)
    }

    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.bindings
            .iter()
            .filter(|b| !b.done)
            .map(|b| match b.last_sent {
                Some(sent) => STUN_RTO.saturating_sub(now.duration_since(sent)),
                None => Duration::ZERO,
            })
            .min()
    }
}
