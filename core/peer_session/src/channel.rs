//! Channel bookkeeping and heartbeat liveness
//!
//! # Heartbeat
//!
//! While the reliable channel is open a one-byte keepalive frame is sent on
//! the unreliable channel every `keepalive_interval`. Any inbound frame
//! (keepalive or application) counts as activity. When nothing arrives for
//! `stale_after` the session treats the link as transiently disconnected,
//! the same as a transport-reported disconnect.

use crate::config::HeartbeatConfig;
use crate::transport::ChannelKind;
use std::time::{Duration, Instant};

// ============================================================================
// Channel Set
// ============================================================================

/// Open/closed state of the two logical channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSet {
    reliable: bool,
    unreliable: bool,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open(&mut self, kind: ChannelKind, open: bool) {
        match kind {
            ChannelKind::Reliable => self.reliable = open,
            ChannelKind::Unreliable => self.unreliable = open,
        }
    }

    pub fn is_open(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Reliable => self.reliable,
            ChannelKind::Unreliable => self.unreliable,
        }
    }

    /// Reliable open means usable for the application
    pub fn is_usable(&self) -> bool {
        self.reliable
    }

    pub fn close_all(&mut self) {
        self.reliable = false;
        self.unreliable = false;
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    stale_after: Duration,
    last_sent: Option<Instant>,
    last_activity: Option<Instant>,
    /// Number of keepalives sent
    sent: u64,
}

impl Heartbeat {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            interval: config.keepalive_interval(),
            stale_after: config.stale_after(),
            last_sent: None,
            last_activity: None,
            sent: 0,
        }
    }

    /// Restart the silence timer (channel just opened or recovered)
    pub fn reset(&mut self, now: Instant) {
        self.last_sent = None;
        self.last_activity = Some(now);
    }

    /// Returns true if a keepalive is due now; records it as sent
    pub fn poll_keepalive(&mut self, now: Instant) -> bool {
        let due = match self.last_sent {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_sent = Some(now);
            self.sent += 1;
        }
        due
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// No inbound traffic for longer than `stale_after`
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.last_activity {
            Some(last) => now.saturating_duration_since(last) > self.stale_after,
            None => false,
        }
    }

    /// Time until the next keepalive is due
    pub fn next_deadline(&self, now: Instant) -> Duration {
        match self.last_sent {
            None => Duration::ZERO,
            Some(last) => (last + self.interval).saturating_duration_since(now),
        }
    }

    pub fn keepalives_sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Heartbeat {
        Heartbeat::new(&HeartbeatConfig {
            keepalive_interval_ms: 1000,
            stale_after_ms: 5000,
        })
    }

    #[test]
    fn test_channel_set() {
        let mut set = ChannelSet::new();
        assert!(!set.is_usable());

        set.set_open(ChannelKind::Unreliable, true);
        assert!(!set.is_usable());

        set.set_open(ChannelKind::Reliable, true);
        assert!(set.is_usable());
        assert!(set.is_open(ChannelKind::Unreliable));

        set.close_all();
        assert_eq!(set, ChannelSet::default());
    }

    #[test]
    fn test_keepalive_cadence() {
        let mut hb = heartbeat();
        let t0 = Instant::now();
        hb.reset(t0);

        assert!(hb.poll_keepalive(t0));
        assert!(!hb.poll_keepalive(t0 + Duration::from_millis(500)));
        assert_eq!(
            hb.next_deadline(t0 + Duration::from_millis(500)),
            Duration::from_millis(500)
        );
        assert!(hb.poll_keepalive(t0 + Duration::from_millis(1000)));
        assert_eq!(hb.keepalives_sent(), 2);
    }

    #[test]
    fn test_stale_after_silence() {
        let mut hb = heartbeat();
        let t0 = Instant::now();
        assert!(!hb.is_stale(t0 + Duration::from_secs(60)));

        hb.reset(t0);
        assert!(!hb.is_stale(t0 + Duration::from_secs(5)));
        assert!(hb.is_stale(t0 + Duration::from_millis(5001)));

        hb.record_activity(t0 + Duration::from_secs(4));
        assert!(!hb.is_stale(t0 + Duration::from_millis(5001)));
    }
}
