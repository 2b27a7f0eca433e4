//! One connection to one remote session.
//!
//! A lifecycle owns its [`PeerConnection`], the side channel layered on it
//! and the remote tracks it received. Inbound offers, answers and
//! candidates are applied in arrival order; duplicates and stale messages
//! are recognised from the connection's own signaling and ICE state and
//! dropped rather than reordered.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use meshcore::{
    AnswerDecision, ControlEvent, IceCandidate, IceConnectionState, NegotiationState,
    OfferDecision, PeerConnectionState, PeerPhase, PeerTransition, SessionDescription, SessionId,
    SignalingState, TrackKind, answer_decision, candidate_accepted, offer_decision,
};

use super::media::tracks::MediaTrackManager;
use super::media::{PeerConfig, PeerConnection, PeerConnectionFactory, PeerEventSink, RemoteTrack, TransportError};
use super::signaling::Signaling;
use tokio::time::Instant;

/// Result of an inbound offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferOutcome {
    Answered {
        /// Our own outstanding offer was abandoned in favour of theirs.
        rolled_back: bool,
    },
    Ignored,
}

pub(crate) struct PeerLifecycle {
    session_id: SessionId,
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    negotiation: NegotiationState,
    /// Since when the connection has been without media: creation until
    /// the first connect, and the last drop out of `Connected` after that.
    down_since: Option<Instant>,
    remote_tracks: Vec<Arc<dyn RemoteTrack>>,
}

impl PeerLifecycle {
    /// Create the connection and attach the current local tracks.
    pub(crate) async fn open(
        factory: &dyn PeerConnectionFactory,
        config: PeerConfig,
        sink: PeerEventSink,
        media: &MediaTrackManager,
    ) -> Result<Self, TransportError> {
        let session_id = sink.session_id();
        let generation = sink.generation();
        let connection = factory.create(config, sink).await?;
        let lifecycle = Self {
            session_id,
            generation,
            connection,
            negotiation: NegotiationState::new(),
            down_since: Some(Instant::now()),
            remote_tracks: Vec::new(),
        };
        if let Err(e) = lifecycle.sync_senders(media).await {
            lifecycle.connection.close().await;
            return Err(e);
        }
        debug!(target: "Call/Peer", "Opened connection to {session_id} (generation {generation})");
        Ok(lifecycle)
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn phase(&self) -> PeerPhase {
        self.negotiation.phase()
    }

    /// How long the connection has gone without being connected. `None`
    /// while connected or once closed.
    pub(crate) fn down_for(&self) -> Option<Duration> {
        if self.negotiation.is_closed() {
            return None;
        }
        self.down_since.map(|since| since.elapsed())
    }

    pub(crate) fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    /// Point the audio and video senders at the current local tracks.
    pub(crate) async fn sync_senders(&self, media: &MediaTrackManager) -> Result<(), TransportError> {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            self.connection
                .set_sender_track(kind, media.track_for(kind))
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn send_offer(&mut self, signaling: Signaling<'_>) -> Result<(), TransportError> {
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        signaling.send(self.session_id, ControlEvent::Offer(offer)).await;
        self.transition(PeerTransition::OfferSent);
        debug!(target: "Call/Peer", "Sent offer to {}", self.session_id);
        Ok(())
    }

    /// Apply a remote offer and answer it.
    ///
    /// Offers are refused while a remote offer is already pending or once
    /// the connection is terminal. When both sides offered at once, the
    /// side with the lower session id keeps its offer.
    pub(crate) async fn handle_offer(
        &mut self,
        offer: SessionDescription,
        media: &MediaTrackManager,
        signaling: Signaling<'_>,
    ) -> Result<OfferOutcome, TransportError> {
        let state = self.connection.signaling_state();
        match offer_decision(state, self.connection.ice_connection_state()) {
            OfferDecision::Apply => {}
            decision => {
                debug!(target: "Call/Peer", "Ignoring offer from {}: {decision:?}", self.session_id);
                return Ok(OfferOutcome::Ignored);
            }
        }

        let rolled_back = state == SignalingState::HaveLocalOffer;
        if rolled_back && signaling.self_session < self.session_id {
            info!(target: "Call/Peer", "Offer collision with {}, keeping ours", self.session_id);
            return Ok(OfferOutcome::Ignored);
        }

        self.connection.set_remote_description(offer).await?;
        self.sync_senders(media).await?;
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        signaling.send(self.session_id, ControlEvent::Answer(answer)).await;
        self.transition(PeerTransition::AnswerSent);
        debug!(target: "Call/Peer", "Answered offer from {}", self.session_id);
        Ok(OfferOutcome::Answered { rolled_back })
    }

    /// Returns whether the answer was applied.
    pub(crate) async fn handle_answer(&mut self, answer: SessionDescription) -> Result<bool, TransportError> {
        match answer_decision(self.connection.signaling_state()) {
            AnswerDecision::Apply => {
                self.connection.set_remote_description(answer).await?;
                Ok(true)
            }
            decision => {
                debug!(target: "Call/Peer", "Ignoring answer from {}: {decision:?}", self.session_id);
                Ok(false)
            }
        }
    }

    /// Returns whether the candidate was applied. An error means the
    /// transport rejected it.
    pub(crate) async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<bool, TransportError> {
        let ice = self.connection.ice_connection_state();
        if !candidate_accepted(ice) {
            debug!(target: "Call/Peer", "Ignoring candidate from {} in ICE state {ice:?}", self.session_id);
            return Ok(false);
        }
        self.connection.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Returns the new phase if it changed.
    pub(crate) fn on_ice_state(&mut self, state: IceConnectionState) -> Option<PeerPhase> {
        self.transition(PeerTransition::IceChanged(state))
    }

    pub(crate) fn on_connection_state(&mut self, state: PeerConnectionState) -> Option<PeerPhase> {
        self.transition(PeerTransition::ConnectionChanged(state))
    }

    /// Keep a received track. Audio follows the local deafen state.
    pub(crate) fn attach_remote_track(&mut self, track: Arc<dyn RemoteTrack>, deaf: bool) {
        if track.kind() == TrackKind::Audio {
            track.set_enabled(!deaf);
        }
        if !self.remote_tracks.iter().any(|t| t.id() == track.id()) {
            self.remote_tracks.push(track);
        }
    }

    pub(crate) fn set_deaf(&self, deaf: bool) {
        for track in &self.remote_tracks {
            if track.kind() == TrackKind::Audio {
                track.set_enabled(!deaf);
            }
        }
    }

    /// Fire-and-forget. Dropped when the side channel is not open.
    pub(crate) fn send_side_channel(&self, text: &str) {
        if !self.connection.side_channel_open() {
            debug!(target: "Call/Peer", "Side channel to {} not open, dropping message", self.session_id);
            return;
        }
        if let Err(e) = self.connection.send_side_channel(text) {
            debug!(target: "Call/Peer", "Side channel send to {} failed: {e}", self.session_id);
        }
    }

    pub(crate) async fn close(mut self) {
        self.transition(PeerTransition::Closed);
        self.remote_tracks.clear();
        self.connection.close().await;
        debug!(target: "Call/Peer", "Closed connection to {} (generation {})", self.session_id, self.generation);
    }

    fn transition(&mut self, transition: PeerTransition) -> Option<PeerPhase> {
        let before = self.negotiation.phase();
        match self.negotiation.apply(transition) {
            Ok(after) if after != before => {
                if after == PeerPhase::Connected {
                    self.down_since = None;
                } else if before == PeerPhase::Connected {
                    self.down_since = Some(Instant::now());
                }
                Some(after)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(target: "Call/Peer", "Connection to {}: {e}", self.session_id);
                None
            }
        }
    }
}
