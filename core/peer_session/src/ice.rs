//! ICE server configuration
//!
//! The relay hands out ICE servers as a JSON list of
//! `{urls, username?, credential?}` entries. Before a session uses them the
//! list is validated:
//!
//! 1. URLs that do not parse as `stun:`, `stuns:`, `turn:` or `turns:` are dropped
//! 2. TURN URLs on an entry without both username and credential are dropped
//! 3. Entries left with no URLs are dropped
//! 4. If no TURN URL survives, the default public STUN entry is appended
//!    (unless an identical entry is already present)
//!
//! The result is never empty. The transport policy follows from it: relay-only
//! when a TURN server survived, all candidate types otherwise.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

// ============================================================================
// Constants
// ============================================================================

/// Public STUN servers used when the relay provides no usable TURN server
pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Default port for stun:/turn:
const DEFAULT_PORT: u16 = 3478;

/// Default port for stuns:/turns:
const DEFAULT_TLS_PORT: u16 = 5349;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceError {
    /// URL scheme is not one of stun, stuns, turn, turns
    UnsupportedScheme(String),
    /// URL is missing a host or has an invalid port/query
    MalformedUrl(String),
    /// Host name did not resolve
    Unresolvable(String),
}

impl fmt::Display for IceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IceError::UnsupportedScheme(url) => write!(f, "unsupported ICE URL scheme: {}", url),
            IceError::MalformedUrl(url) => write!(f, "malformed ICE URL: {}", url),
            IceError::Unresolvable(url) => write!(f, "could not resolve ICE URL: {}", url),
        }
    }
}

impl std::error::Error for IceError {}

// ============================================================================
// ICE URL
// ============================================================================

/// Scheme of an ICE server URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceScheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl IceScheme {
    pub fn is_turn(&self) -> bool {
        matches!(self, IceScheme::Turn | IceScheme::Turns)
    }

    fn default_port(&self) -> u16 {
        match self {
            IceScheme::Stun | IceScheme::Turn => DEFAULT_PORT,
            IceScheme::Stuns | IceScheme::Turns => DEFAULT_TLS_PORT,
        }
    }
}

/// Parsed `scheme:host[:port][?transport=udp|tcp]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceUrl {
    pub scheme: IceScheme,
    pub host: String,
    pub port: u16,
}

impl IceUrl {
    /// Parse an ICE server URL (RFC 7064 / RFC 7065 subset)
    pub fn parse(url: &str) -> Result<Self, IceError> {
        let (scheme, rest) = url
            .split_once(':')
            .ok_or_else(|| IceError::MalformedUrl(url.to_string()))?;

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "stun" => IceScheme::Stun,
            "stuns" => IceScheme::Stuns,
            "turn" => IceScheme::Turn,
            "turns" => IceScheme::Turns,
            _ => return Err(IceError::UnsupportedScheme(url.to_string())),
        };

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        if let Some(query) = query {
            // only TURN URLs may carry a transport parameter
            let valid = scheme.is_turn()
                && matches!(query, "transport=udp" | "transport=tcp");
            if !valid {
                return Err(IceError::MalformedUrl(url.to_string()));
            }
        }

        let (host, port) = split_host_port(authority)
            .ok_or_else(|| IceError::MalformedUrl(url.to_string()))?;
        if host.is_empty() || host.contains('/') || host.contains('@') {
            return Err(IceError::MalformedUrl(url.to_string()));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port: port.unwrap_or_else(|| scheme.default_port()),
        })
    }

    /// Resolve to socket addresses (blocking DNS lookup)
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, IceError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        (host, self.port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect())
            .map_err(|_| IceError::Unresolvable(format!("{}:{}", self.host, self.port)))
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals
fn split_host_port(authority: &str) -> Option<(&str, Option<u16>)> {
    if authority.starts_with('[') {
        let end = authority.find(']')?;
        let host = &authority[..=end];
        return match &authority[end + 1..] {
            "" => Some((host, None)),
            p => Some((host, Some(p.strip_prefix(':')?.parse().ok()?))),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((authority, None)),
    }
}

// ============================================================================
// ICE Server
// ============================================================================

/// One ICE server entry as sent by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// A single URL string or a list of URLs
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

impl IceServer {
    /// Entry with URLs only
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }

    /// Entry with long-term credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }

    /// The built-in public STUN entry
    pub fn default_stun() -> Self {
        Self::new(DEFAULT_STUN_URLS)
    }

    fn has_credentials(&self) -> bool {
        matches!((&self.username, &self.credential), (Some(u), Some(c)) if !u.is_empty() && !c.is_empty())
    }

    /// Parsed URLs of this entry (invalid URLs skipped)
    pub fn parsed_urls(&self) -> impl Iterator<Item = IceUrl> + '_ {
        self.urls.iter().filter_map(|u| IceUrl::parse(u).ok())
    }

    fn has_turn(&self) -> bool {
        self.parsed_urls().any(|u| u.scheme.is_turn())
    }
}

// ============================================================================
// Validated Set
// ============================================================================

/// Candidate-type policy handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPolicy {
    /// Relay candidates only
    Relay,
    /// Every candidate type
    All,
}

/// Validated, non-empty ICE server list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerSet {
    servers: Vec<IceServer>,
}

impl IceServerSet {
    /// Validate a raw list from the relay or the config
    pub fn validate(raw: &[IceServer]) -> Self {
        let mut servers: Vec<IceServer> = Vec::with_capacity(raw.len() + 1);

        for entry in raw {
            let has_credentials = entry.has_credentials();
            let urls: Vec<String> = entry
                .urls
                .iter()
                .filter(|url| match IceUrl::parse(url) {
                    Ok(parsed) if parsed.scheme.is_turn() && !has_credentials => {
                        log::warn!("Dropping TURN URL without credentials: {}", url);
                        false
                    }
                    Ok(_) => true,
                    Err(e) => {
                        log::warn!("Dropping ICE URL: {}", e);
                        false
                    }
                })
                .cloned()
                .collect();

            if urls.is_empty() {
                continue;
            }

            servers.push(IceServer {
                urls,
                username: entry.username.clone(),
                credential: entry.credential.clone(),
            });
        }

        if !servers.iter().any(IceServer::has_turn) {
            let fallback = IceServer::default_stun();
            if !servers.contains(&fallback) {
                log::debug!("No TURN server available, appending default STUN servers");
                servers.push(fallback);
            }
        }

        Self { servers }
    }

    pub fn servers(&self) -> &[IceServer] {
        &self.servers
    }

    /// Relay-only if any TURN entry survived validation
    pub fn policy(&self) -> TransportPolicy {
        if self.servers.iter().any(IceServer::has_turn) {
            TransportPolicy::Relay
        } else {
            TransportPolicy::All
        }
    }

    /// All STUN URLs, in order
    pub fn stun_urls(&self) -> Vec<IceUrl> {
        self.servers
            .iter()
            .flat_map(|s| s.parsed_urls())
            .filter(|u| matches!(u.scheme, IceScheme::Stun))
            .collect()
    }
}

/// A `turn:` URL with the long-term credentials of its entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: IceUrl,
    pub username: String,
    pub credential: String,
}

impl IceServerSet {
    /// TURN-over-UDP servers, in order; `turns:` and `?transport=tcp` are
    /// not spoken by the transport and are skipped
    pub fn turn_servers(&self) -> Vec<TurnServer> {
        let mut out = Vec::new();
        for server in &self.servers {
            let (Some(username), Some(credential)) = (&server.username, &server.credential) else {
                continue;
            };
            for url in &server.urls {
                if url.ends_with("?transport=tcp") {
                    log::debug!("Skipping TURN over TCP: {}", url);
                    continue;
                }
                match IceUrl::parse(url) {
                    Ok(parsed) if parsed.scheme == IceScheme::Turn => out.push(TurnServer {
                        url: parsed,
                        username: username.clone(),
                        credential: credential.clone(),
                    }),
                    Ok(parsed) if parsed.scheme == IceScheme::Turns => {
                        log::debug!("Skipping TURN over TLS: {}", url);
                    }
                    _ => {}
                }
            }
        }
        out
    }
}

impl Default for IceServerSet {
    fn default() -> Self {
        Self::validate(&[])
    }
}

// ============================================================================
// Tests
// ============================================================================
