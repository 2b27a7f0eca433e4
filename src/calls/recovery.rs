//! Delayed "hang up and call back" for broken connections.
//!
//! At most one timer is armed per remote session; arming again only ever
//! brings the deadline forward. Timers only enqueue [`EngineEvent::RecoveryDue`]; whether
//! the restart still makes sense is decided by [`evaluate`] when the event
//! is handled.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use meshcore::{PeerPhase, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::event::EngineEvent;
use crate::config::CallConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryReason {
    /// ICE or the overall connection went failed/disconnected mid-call.
    ConnectionFailed,
    /// We answered an offer and the connection never came up.
    AnswerUnacknowledged,
    /// Adding a remote candidate failed, or the transport reported a
    /// candidate error.
    CandidateError,
}

impl RecoveryReason {
    pub(crate) fn delay(self, config: &CallConfig) -> Duration {
        match self {
            Self::ConnectionFailed => config.recovery_delay,
            Self::AnswerUnacknowledged => config.initial_connect_timeout,
            Self::CandidateError => config.candidate_error_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryVerdict {
    Restart,
    SkipCallEnded,
    SkipNoConnection,
    SkipRecovered,
    /// We placed the original call; the other side is the one that retries.
    SkipOutgoing,
}

/// Decide what a due recovery should do.
pub(crate) fn evaluate(in_call: bool, phase: Option<PeerPhase>, outgoing: bool) -> RecoveryVerdict {
    if !in_call {
        return RecoveryVerdict::SkipCallEnded;
    }
    match phase {
        None | Some(PeerPhase::Closed) => RecoveryVerdict::SkipNoConnection,
        Some(PeerPhase::Connected) => RecoveryVerdict::SkipRecovered,
        Some(_) if outgoing => RecoveryVerdict::SkipOutgoing,
        Some(_) => RecoveryVerdict::Restart,
    }
}

struct Armed {
    ticket: u64,
    reason: RecoveryReason,
    deadline: Instant,
    timer: JoinHandle<()>,
}

pub(crate) struct RecoverySupervisor {
    tx: mpsc::UnboundedSender<EngineEvent>,
    armed: HashMap<SessionId, Armed>,
    next_ticket: u64,
}

impl RecoverySupervisor {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            next_ticket: 0,
        }
    }

    /// Arm the recovery timer for `session_id`. An armed timer that is due
    /// no later than the new one is kept, so a stream of failures can never
    /// push a recovery back.
    pub(crate) fn schedule(&mut self, session_id: SessionId, reason: RecoveryReason, delay: Duration) {
        let deadline = Instant::now() + delay;
        if let Some(armed) = self.armed.get(&session_id)
            && armed.deadline <= deadline
        {
            debug!(
                target: "Call/Recovery",
                "Recovery for {session_id} already due sooner ({:?}), ignoring {reason:?}",
                armed.reason
            );
            return;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let tx = self.tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(EngineEvent::RecoveryDue { session_id, ticket });
        });

        if let Some(previous) = self.armed.insert(
            session_id,
            Armed {
                ticket,
                reason,
                deadline,
                timer,
            },
        ) {
            previous.timer.abort();
            debug!(target: "Call/Recovery", "Brought recovery for {session_id} forward to {delay:?} ({:?} -> {reason:?})", previous.reason);
        } else {
            debug!(target: "Call/Recovery", "Armed recovery for {session_id} in {delay:?} ({reason:?})");
        }
    }

    /// Claim a fired timer. Returns `None` when the timer was replaced or
    /// cancelled after it fired.
    pub(crate) fn take_due(&mut self, session_id: SessionId, ticket: u64) -> Option<RecoveryReason> {
        match self.armed.get(&session_id) {
            Some(armed) if armed.ticket == ticket => {
                self.armed.remove(&session_id).map(|armed| armed.reason)
            }
            _ => None,
        }
    }

    pub(crate) fn cancel(&mut self, session_id: SessionId) -> bool {
        match self.armed.remove(&session_id) {
            Some(armed) => {
                armed.timer.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.timer.abort();
        }
    }

    pub(crate) fn pending(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.armed.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Drop for RecoverySupervisor {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
