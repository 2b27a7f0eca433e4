//! Per-peer negotiation state machine.
//!
//! The transport reports raw signaling/ICE/connection states; this module
//! folds them into a [`PeerPhase`] and decides which inbound offers, answers
//! and candidates may be applied. The guards detect out-of-order and
//! duplicate messages from the connection's own state instead of reordering
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Offer/answer state of a connection, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Connectivity-check state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    /// States from which no inbound negotiation message is applied.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// Aggregate transport state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Which half of the offer/answer exchange this side last performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Negotiation {
    OfferSent,
    AnswerSent,
}

/// Lifecycle phase of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "phase", content = "role")]
pub enum PeerPhase {
    Uninitialized,
    Negotiating(Negotiation),
    Connected,
    Recovering,
    Closed,
}

/// Inputs to the per-peer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransition {
    OfferSent,
    AnswerSent,
    IceChanged(IceConnectionState),
    ConnectionChanged(PeerConnectionState),
    Closed,
}

/// What to do with an inbound offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Apply,
    /// The connection is failed/disconnected/closed.
    RejectTerminal(IceConnectionState),
    /// A remote offer is already being processed (glare or duplicate).
    RejectPendingRemoteOffer,
}

/// What to do with an inbound answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDecision {
    Apply,
    /// Nothing is awaiting an answer; stale or duplicate.
    IgnoreStable,
    IgnorePendingRemoteOffer,
    IgnoreClosed,
}

pub fn offer_decision(signaling: SignalingState, ice: IceConnectionState) -> OfferDecision {
    if ice.is_terminal() {
        return OfferDecision::RejectTerminal(ice);
    }
    if signaling == SignalingState::HaveRemoteOffer {
        return OfferDecision::RejectPendingRemoteOffer;
    }
    OfferDecision::Apply
}

pub fn answer_decision(signaling: SignalingState) -> AnswerDecision {
    match signaling {
        SignalingState::Stable => AnswerDecision::IgnoreStable,
        SignalingState::HaveRemoteOffer => AnswerDecision::IgnorePendingRemoteOffer,
        SignalingState::Closed => AnswerDecision::IgnoreClosed,
        _ => AnswerDecision::Apply,
    }
}

pub fn candidate_accepted(ice: IceConnectionState) -> bool {
    !ice.is_terminal()
}

/// Phase bookkeeping for one connection generation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationState {
    phase: PeerPhase,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl Default for NegotiationState {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationState {
    pub fn new() -> Self {
        Self {
            phase: PeerPhase::Uninitialized,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn phase(&self) -> PeerPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == PeerPhase::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.phase == PeerPhase::Closed
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    /// Apply a transition, returning the new phase.
    pub fn apply(&mut self, transition: PeerTransition) -> Result<PeerPhase, InvalidTransition> {
        use PeerPhase::*;

        let next = match (self.phase, transition) {
            (Closed, PeerTransition::Closed) => Closed,
            (Closed, other) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", self.phase),
                    attempted: format!("{other:?}"),
                });
            }
            (_, PeerTransition::Closed) => Closed,
            (Connected, PeerTransition::OfferSent | PeerTransition::AnswerSent) => Connected,
            (_, PeerTransition::OfferSent) => Negotiating(Negotiation::OfferSent),
            (_, PeerTransition::AnswerSent) => Negotiating(Negotiation::AnswerSent),
            (_, PeerTransition::IceChanged(ice)) if ice.is_connected() => Connected,
            (_, PeerTransition::ConnectionChanged(PeerConnectionState::Connected)) => Connected,
            (_, PeerTransition::IceChanged(ice)) if ice.is_terminal() => Recovering,
            (_, PeerTransition::ConnectionChanged(state)) if state.is_failed() => Recovering,
            (current, PeerTransition::IceChanged(_) | PeerTransition::ConnectionChanged(_)) => {
                current
            }
        };

        if next == Connected && self.connected_at.is_none() {
            self.connected_at = Some(Utc::now());
        }
        self.phase = next;
        Ok(next)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
