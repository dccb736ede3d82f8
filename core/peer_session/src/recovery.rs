//! Restart policy for failing transports
//!
//! Failures come in two strengths:
//!
//! - **Transient** (transport Disconnected, heartbeat silence): report the
//!   session as unstable and wait. Nothing is torn down.
//! - **Hard** (transport Failed, restart wait expired): spend one restart
//!   from the budget. The Initiator sends a fresh offer with the ICE-restart
//!   flag; the Responder waits for it. With the budget spent, or when the
//!   session was already relay-only, give up.
//!
//! A successful reconnection refills the budget.

use crate::config::RecoveryPolicy;
use crate::ice::TransportPolicy;
use crate::signaling::Role;

/// What the session should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Surface "unstable"; keep the transport
    NotifyUnstable,
    /// Initiator: create and send an ICE-restart offer
    RestartIce { attempt: u32 },
    /// Responder: wait for the peer's ICE-restart offer
    AwaitRestart { attempt: u32 },
    /// Terminal
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// Relay candidates were already the only option
    RelayOnly,
    /// All restarts used
    BudgetExhausted,
}

#[derive(Debug, Clone)]
pub struct RecoveryController {
    role: Role,
    max_restarts: u32,
    restart_attempts: u32,
    relay_only: bool,
}

impl RecoveryController {
    pub fn new(role: Role, policy: &RecoveryPolicy, transport_policy: TransportPolicy) -> Self {
        Self {
            role,
            max_restarts: policy.max_restarts,
            restart_attempts: 0,
            relay_only: transport_policy == TransportPolicy::Relay,
        }
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    pub fn is_relay_only(&self) -> bool {
        self.relay_only
    }

    pub fn on_transient_disconnect(&self) -> RecoveryAction {
        RecoveryAction::NotifyUnstable
    }

    pub fn on_hard_failure(&mut self) -> RecoveryAction {
        if self.relay_only {
            log::warn!("Relay-only transport failed, giving up");
            return RecoveryAction::GiveUp(GiveUpReason::RelayOnly);
        }
        if self.restart_attempts >= self.max_restarts {
            log::warn!(
                "Restart budget exhausted ({}/{}), giving up",
                self.restart_attempts,
                self.max_restarts
            );
            return RecoveryAction::GiveUp(GiveUpReason::BudgetExhausted);
        }

        self.restart_attempts += 1;
        let attempt = self.restart_attempts;
        log::info!(
            "Transport failed, restart {}/{} ({})",
            attempt,
            self.max_restarts,
            self.role
        );
        match self.role {
            Role::Initiator => RecoveryAction::RestartIce { attempt },
            Role::Responder => RecoveryAction::AwaitRestart { attempt },
        }
    }

    pub fn on_reconnected(&mut self) {
        if self.restart_attempts > 0 {
            log::info!("Reconnected after {} restart(s)", self.restart_attempts);
        }
        self.restart_attempts = 0;
    }
}
