//! Lock-free session lifecycle counters.
//!
//! Shared as `Arc<SessionMetrics>` between the coordinator and its sessions;
//! rendered in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct SessionMetrics {
    /// Sessions constructed (counter)
    pub sessions_created_total: AtomicU64,
    /// Sessions that reached Connected at least once (counter)
    pub sessions_established_total: AtomicU64,
    /// ICE restarts started or awaited (counter)
    pub restarts_total: AtomicU64,
    /// Sessions that ended in Failed (counter)
    pub sessions_lost_total: AtomicU64,
    /// Responder handshakes that timed out waiting for an offer (counter)
    pub handshake_timeouts_total: AtomicU64,
    /// Answers discarded because no local offer was outstanding (counter)
    pub stale_answers_total: AtomicU64,
    /// Offers discarded as duplicate or older than the applied one (counter)
    pub stale_offers_total: AtomicU64,
    /// Signals buffered before their session existed (counter)
    pub signals_buffered_total: AtomicU64,
    /// Buffered signals replayed into a new session (counter)
    pub signals_replayed_total: AtomicU64,
    /// Signals dropped (buffer overflow, no session, wrong room) (counter)
    pub signals_dropped_total: AtomicU64,
    /// Application frames that failed to decode (counter)
    pub frames_dropped_total: AtomicU64,
    /// Application messages sent (counter)
    pub messages_sent_total: AtomicU64,
    /// Application messages received (counter)
    pub messages_received_total: AtomicU64,
    pub start_time: Instant,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            sessions_created_total: AtomicU64::new(0),
            sessions_established_total: AtomicU64::new(0),
            restarts_total: AtomicU64::new(0),
            sessions_lost_total: AtomicU64::new(0),
            handshake_timeouts_total: AtomicU64::new(0),
            stale_answers_total: AtomicU64::new(0),
            stale_offers_total: AtomicU64::new(0),
            signals_buffered_total: AtomicU64::new(0),
            signals_replayed_total: AtomicU64::new(0),
            signals_dropped_total: AtomicU64::new(0),
            frames_dropped_total: AtomicU64::new(0),
            messages_sent_total: AtomicU64::new(0),
            messages_received_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 13] = [
            ("sessions_created_total", "Peer sessions constructed", &self.sessions_created_total),
            ("sessions_established_total", "Peer sessions that reached connected", &self.sessions_established_total),
            ("restarts_total", "ICE restarts", &self.restarts_total),
            ("sessions_lost_total", "Peer sessions that failed terminally", &self.sessions_lost_total),
            ("handshake_timeouts_total", "Responder handshakes without an offer", &self.handshake_timeouts_total),
            ("stale_answers_total", "Answers discarded without a local offer", &self.stale_answers_total),
            ("stale_offers_total", "Offers discarded as duplicate or late", &self.stale_offers_total),
            ("signals_buffered_total", "Signals buffered before session construction", &self.signals_buffered_total),
            ("signals_replayed_total", "Buffered signals replayed", &self.signals_replayed_total),
            ("signals_dropped_total", "Signals dropped", &self.signals_dropped_total),
            ("frames_dropped_total", "Application frames that failed to decode", &self.frames_dropped_total),
            ("messages_sent_total", "Application messages sent", &self.messages_sent_total),
            ("messages_received_total", "Application messages received", &self.messages_received_total),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            let _ = write!(
                out,
                "# HELP peer_session_{name} {help}\n\
                 # TYPE peer_session_{name} counter\n\
                 peer_session_{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }
        let _ = write!(
            out,
            "# HELP peer_session_uptime_seconds Process uptime in seconds\n\
             # TYPE peer_session_uptime_seconds gauge\n\
             peer_session_uptime_seconds {}\n",
            self.start_time.elapsed().as_secs()
        );
        out
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
