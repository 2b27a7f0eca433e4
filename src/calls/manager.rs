//! The call engine: one task that owns every piece of call state.
//!
//! Commands from [`super::CallHandle`], server pushes, peer events and timer
//! expiries all arrive on a single queue and are handled one at a time, so
//! no two handlers ever observe a half-applied change. Handlers may suspend
//! (negotiation, device acquisition, server round trips) but nothing else
//! runs against the call state meanwhile.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::join_all;
use log::{debug, info, warn};
use meshcore::{
    CallState, ControlEvent, ConversationId, MediaSource, PeerPhase, RemoteSession,
    SessionFlags, SessionId, SessionUpsert, SignalingState, TrackChange, TrackKind, VideoSource,
    VoiceSettings,
};
use tokio::sync::mpsc;

use super::broadcast::BroadcastNotifier;
use super::error::CallError;
use super::event::{Command, EngineEvent};
use super::handle::{CallOptions, CallSnapshot, ToggleOutcome};
use super::media::tracks::{MediaTrackManager, TrackLoss};
use super::media::voice::VoiceActivityMonitor;
use super::media::{
    DeviceError, MediaDevices, PeerConfig, PeerConnectionFactory, PeerEvent, PeerEventSink,
};
use super::peer::{OfferOutcome, PeerLifecycle};
use super::recovery::{RecoveryReason, RecoverySupervisor, RecoveryVerdict, evaluate};
use super::signaling::{RelayQueue, Signaling, decode_inbound, decode_relayed};
use crate::config::CallConfig;
use crate::keepalive::Keepalive;
use crate::server::{CallServer, JoinRequest, LeaveRequest, ServerPush};
use crate::types::events::{
    CallJoined, CallLeft, CallLeftReason, CallWarning, EventBus, ParticipantJoined,
    ParticipantLeft, PeerPhaseChanged, PendingInvitations, RemoteTrackAttached,
    SessionFlagsChanged, TalkingChanged,
};

/// Runtime resources that exist only while a call is active. Dropping it
/// stops every timer and worker it owns.
pub(crate) struct ActiveCall {
    pub(crate) conversation_id: ConversationId,
    pub(crate) self_session: SessionId,
    pub(crate) peers: BTreeMap<SessionId, PeerLifecycle>,
    /// Sessions we placed the current connection to. The other side owns
    /// recovery for these.
    pub(crate) outgoing: BTreeSet<SessionId>,
    pub(crate) recovery: RecoverySupervisor,
    pub(crate) relay: RelayQueue,
    broadcast: BroadcastNotifier,
    _keepalive: Keepalive,
}

impl ActiveCall {
    pub(crate) fn signaling(&self) -> Signaling<'_> {
        Signaling {
            relay: &self.relay,
            channel_id: self.conversation_id,
            self_session: self.self_session,
        }
    }

    fn split(&mut self) -> (Signaling<'_>, &mut BTreeMap<SessionId, PeerLifecycle>) {
        (
            Signaling {
                relay: &self.relay,
                channel_id: self.conversation_id,
                self_session: self.self_session,
            },
            &mut self.peers,
        )
    }

    fn schedule_recovery(&mut self, session_id: SessionId, reason: RecoveryReason, config: &CallConfig) {
        if self.outgoing.contains(&session_id) {
            debug!(target: "Call/Recovery", "Not recovering {session_id}: we placed the call ({reason:?})");
            return;
        }
        self.recovery
            .schedule(session_id, reason, reason.delay(config));
    }

    /// Close and forget the connection to `session_id`, if any.
    pub(crate) async fn drop_peer(&mut self, session_id: SessionId) -> bool {
        self.recovery.cancel(session_id);
        self.outgoing.remove(&session_id);
        match self.peers.remove(&session_id) {
            Some(peer) => {
                peer.close().await;
                true
            }
            None => false,
        }
    }
}

pub(crate) struct CallEngine {
    pub(crate) config: CallConfig,
    pub(crate) server: Arc<dyn CallServer>,
    factory: Arc<dyn PeerConnectionFactory>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) tx: mpsc::UnboundedSender<EngineEvent>,
    pub(crate) state: CallState,
    pub(crate) call: Option<ActiveCall>,
    media: MediaTrackManager,
    voice: VoiceActivityMonitor,
    voice_settings: VoiceSettings,
    next_generation: u64,
}

impl CallEngine {
    pub(crate) fn new(
        config: CallConfig,
        server: Arc<dyn CallServer>,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        events: Arc<EventBus>,
        tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let media = MediaTrackManager::new(devices, tx.clone());
        let voice = VoiceActivityMonitor::new(
            tx.clone(),
            config.voice_sample_interval,
            config.voice_min_silent_samples,
        );
        Self {
            config,
            server,
            factory,
            events,
            tx,
            state: CallState::new(),
            call: None,
            media,
            voice,
            voice_settings: VoiceSettings::default(),
            next_generation: 0,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        info!(target: "Call/Session", "Call engine started");
        while let Some(event) = rx.recv().await {
            if !self.handle(event).await {
                break;
            }
        }
        self.leave().await;
        info!(target: "Call/Session", "Call engine stopped");
    }

    /// Returns false when the engine should stop.
    async fn handle(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Command(command) => return self.handle_command(command).await,
            EngineEvent::Push(push) => self.handle_push(push).await,
            EngineEvent::Peer {
                session_id,
                generation,
                event,
            } => self.handle_peer_event(session_id, generation, event).await,
            EngineEvent::RecoveryDue { session_id, ticket } => {
                self.handle_recovery_due(session_id, ticket).await
            }
            EngineEvent::KeepaliveTick { epoch } => self.handle_keepalive_tick(epoch),
            EngineEvent::PingCompleted { epoch, result } => {
                self.handle_ping_result(epoch, result).await
            }
            EngineEvent::TalkingChanged {
                generation,
                talking,
            } => {
                if self.voice.accepts(generation) {
                    self.apply_talking(talking).await;
                }
            }
            EngineEvent::PushToTalkReleased { generation, token } => {
                if let Some(talking) = self.voice.release_elapsed(generation, token) {
                    self.apply_talking(talking).await;
                }
            }
            EngineEvent::TrackEnded { source, token } => {
                self.handle_track_ended(source, token).await
            }
        }
        true
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Toggle {
                conversation_id,
                options,
                reply,
            } => {
                let _ = reply.send(self.toggle(conversation_id, options).await);
            }
            Command::Join {
                conversation_id,
                options,
                reply,
            } => {
                let _ = reply.send(self.join(conversation_id, options).await);
            }
            Command::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
            Command::End { reply } => {
                self.teardown(CallLeftReason::Ended).await;
                let _ = reply.send(());
            }
            Command::SetMuted { muted, reply } => {
                if self.media.set_muted(muted) {
                    self.announce_local_state(TrackKind::Audio).await;
                }
                let _ = reply.send(());
            }
            Command::SetDeaf { deaf, reply } => {
                self.set_deaf(deaf).await;
                let _ = reply.send(());
            }
            Command::SetSource {
                source,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_source(source, enabled).await);
            }
            Command::PushToTalk { pressed } => {
                if pressed {
                    if let Some(talking) = self.voice.key_down() {
                        self.apply_talking(talking).await;
                    }
                } else {
                    self.voice.key_up();
                }
            }
            Command::SetVoiceSettings { settings, reply } => {
                let _ = reply.send(self.set_voice_settings(settings).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
            Command::Shutdown => return false,
        }
        true
    }

    async fn toggle(
        &mut self,
        conversation_id: ConversationId,
        options: CallOptions,
    ) -> Result<ToggleOutcome, CallError> {
        if let Some(current) = self.state.conversation_id() {
            self.leave().await;
            if current == conversation_id {
                return Ok(ToggleOutcome::Left);
            }
        }
        self.join(conversation_id, options)
            .await
            .map(ToggleOutcome::Joined)
    }

    async fn join(
        &mut self,
        conversation_id: ConversationId,
        options: CallOptions,
    ) -> Result<SessionId, CallError> {
        if let Some(context) = self.state.context() {
            if context.conversation_id() == conversation_id {
                return Ok(context.self_session_id());
            }
            self.leave().await;
        }

        if !self.factory.is_supported() {
            warn!(target: "Call/Session", "Cannot join {conversation_id}: real-time media unsupported");
            EventBus::publish(&self.events.warning, CallWarning::Unsupported);
            return Err(CallError::Unsupported);
        }

        let response = self
            .server
            .join_call(JoinRequest {
                conversation_id,
                known_session_ids: Vec::new(),
            })
            .await?;
        let self_session = response.self_session_id;

        let context = self.state.begin(
            conversation_id,
            self_session,
            response.ice_servers,
            response.sessions,
        )?;
        let epoch = context.epoch();
        let existing = context.session_ids();

        self.call = Some(ActiveCall {
            conversation_id,
            self_session,
            peers: BTreeMap::new(),
            outgoing: BTreeSet::new(),
            recovery: RecoverySupervisor::new(self.tx.clone()),
            relay: RelayQueue::new(
                self.server.clone(),
                self.config.relay_debounce,
                self.config.relay_retry_delay,
            ),
            broadcast: BroadcastNotifier::new(
                self.server.clone(),
                conversation_id,
                self_session,
                self.config.broadcast_debounce,
            ),
            _keepalive: Keepalive::spawn(self.config.ping_interval, epoch, self.tx.clone()),
        });

        info!(
            target: "Call/Session",
            "Joined {conversation_id} as {self_session} with {} other session(s)",
            existing.len()
        );
        EventBus::publish(
            &self.events.call_joined,
            CallJoined {
                conversation_id,
                self_session_id: self_session,
                sessions: existing.clone(),
            },
        );
        if !response.invited_members.is_empty() {
            EventBus::publish(
                &self.events.invitations,
                PendingInvitations {
                    conversation_id,
                    members: response.invited_members,
                },
            );
        }

        if options.start_with_audio
            && let Err(e) = self.start_microphone().await
        {
            self.device_warning(MediaSource::Microphone, &e);
        }
        if options.start_with_video
            && let Err(e) = self.media.enable_video(options.video_type).await
        {
            self.device_warning(options.video_type.media_source(), &e);
        }
        if let Some(call) = &self.call {
            call.broadcast
                .update(self.media.state().broadcast_state())
                .await;
        }

        for session_id in existing {
            self.connect(session_id).await;
        }
        Ok(self_session)
    }

    /// Tell peers and the server we are leaving, then tear down. A no-op
    /// outside a call.
    pub(crate) async fn leave(&mut self) {
        let Some(conversation_id) = self.state.conversation_id() else {
            debug!(target: "Call/Session", "Leave requested outside a call");
            return;
        };

        if let Some(call) = &self.call
            && let Some(text) = call.signaling().encode(ControlEvent::Disconnect)
        {
            for peer in call.peers.values() {
                peer.send_side_channel(&text);
            }
        }
        if let Err(e) = self
            .server
            .leave_call(LeaveRequest { conversation_id })
            .await
        {
            warn!(target: "Call/Session", "Leave notification for {conversation_id} failed: {e}");
        }
        self.teardown(CallLeftReason::Left).await;
    }

    /// Stop everything that belongs to the current call: timers, queued
    /// relay messages, connections, local devices and the context itself.
    pub(crate) async fn teardown(&mut self, reason: CallLeftReason) {
        let Some(context) = self.state.end() else {
            return;
        };
        let call = self.call.take();
        self.voice.stop();
        self.media.stop_all();

        if let Some(mut call) = call {
            call.recovery.cancel_all();
            call.relay.clear().await;
            let peers = std::mem::take(&mut call.peers);
            join_all(peers.into_values().map(PeerLifecycle::close)).await;
        }

        info!(target: "Call/Session", "Left {} ({reason:?})", context.conversation_id());
        EventBus::publish(
            &self.events.call_left,
            CallLeft {
                conversation_id: context.conversation_id(),
                reason,
            },
        );
    }

    fn is_current(&self, conversation_id: ConversationId) -> bool {
        self.state.conversation_id() == Some(conversation_id)
    }

    async fn handle_push(&mut self, push: ServerPush) {
        match push {
            ServerPush::ParticipantJoined {
                conversation_id,
                session,
            } if self.is_current(conversation_id) => {
                self.upsert_participant(session).await;
            }
            ServerPush::SessionsUpdated {
                conversation_id,
                sessions,
            } if self.is_current(conversation_id) => {
                for session in sessions {
                    self.upsert_participant(session).await;
                }
            }
            ServerPush::ParticipantLeft {
                conversation_id,
                session_id,
            } if self.is_current(conversation_id) => {
                self.remove_participant(session_id).await;
            }
            ServerPush::SessionTerminated {
                conversation_id,
                session_id,
            } if self.is_current(conversation_id) => {
                if self.state.context().map(|c| c.self_session_id()) == Some(session_id) {
                    info!(target: "Call/Session", "Server terminated our session in {conversation_id}");
                    self.teardown(CallLeftReason::Ended).await;
                } else {
                    self.remove_participant(session_id).await;
                }
            }
            ServerPush::CallEnded { conversation_id } if self.is_current(conversation_id) => {
                info!(target: "Call/Session", "Server ended the call in {conversation_id}");
                self.teardown(CallLeftReason::Ended).await;
            }
            ServerPush::PeerNotifications(notifications) => {
                let Some(channel_id) = self.state.conversation_id() else {
                    return;
                };
                for notification in notifications {
                    if let Some(event) = decode_relayed(channel_id, &notification) {
                        self.handle_control(notification.sender, event).await;
                    }
                }
            }
            other => {
                debug!(target: "Call/Session", "Ignoring push for another conversation: {other:?}");
            }
        }
    }

    async fn upsert_participant(&mut self, session: RemoteSession) {
        let Some(context) = self.state.context_mut() else {
            return;
        };
        let session_id = session.id;
        let member_id = session.member_id;
        let flags = session.flags;
        match context.upsert_session(session) {
            SessionUpsert::Inserted => {
                info!(target: "Call/Session", "Participant {session_id} joined");
                EventBus::publish(
                    &self.events.participant_joined,
                    ParticipantJoined {
                        session_id,
                        member_id,
                    },
                );
                self.connect(session_id).await;
            }
            SessionUpsert::Updated => self.publish_flags(session_id, flags),
            SessionUpsert::Unchanged | SessionUpsert::IsSelf => {}
        }
    }

    pub(crate) async fn remove_participant(&mut self, session_id: SessionId) {
        let removed = self
            .state
            .context_mut()
            .and_then(|context| context.remove_session(session_id));
        if removed.is_none() {
            return;
        }
        info!(target: "Call/Session", "Participant {session_id} left");
        self.close_peer(session_id).await;
        EventBus::publish(&self.events.participant_left, ParticipantLeft { session_id });
    }

    pub(crate) async fn close_peer(&mut self, session_id: SessionId) {
        if let Some(call) = self.call.as_mut()
            && call.drop_peer(session_id).await
        {
            Self::publish_phase(&self.events, session_id, PeerPhase::Closed);
        }
    }

    /// Create a connection to `session_id` without offering. Returns false
    /// when none exists afterwards.
    async fn open_peer(&mut self, session_id: SessionId) -> bool {
        let (Some(context), Some(call)) = (self.state.context(), self.call.as_mut()) else {
            return false;
        };
        if call.peers.contains_key(&session_id) {
            return true;
        }
        if !context.contains(session_id) {
            warn!(target: "Call/Peer", "Refusing connection to {session_id}: not in the roster");
            return false;
        }

        self.next_generation += 1;
        let sink = PeerEventSink::new(session_id, self.next_generation, self.tx.clone());
        let config = PeerConfig {
            ice_servers: context.ice_servers().to_vec(),
            side_channel: self.config.side_channel.clone(),
        };
        match PeerLifecycle::open(self.factory.as_ref(), config, sink, &self.media).await {
            Ok(peer) => {
                call.peers.insert(session_id, peer);
                true
            }
            Err(e) => {
                warn!(target: "Call/Peer", "Failed to open connection to {session_id}: {e}");
                false
            }
        }
    }

    /// Place a call to `session_id`: open a connection and send an offer.
    pub(crate) async fn connect(&mut self, session_id: SessionId) {
        if !self.open_peer(session_id).await {
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let (signaling, peers) = call.split();
        let Some(peer) = peers.get_mut(&session_id) else {
            return;
        };
        if peer.phase() != PeerPhase::Uninitialized {
            return;
        }
        let result = peer.send_offer(signaling).await.map(|()| peer.phase());
        match result {
            Ok(phase) => {
                call.outgoing.insert(session_id);
                Self::publish_phase(&self.events, session_id, phase);
            }
            Err(e) => {
                warn!(target: "Call/Peer", "Failed to offer to {session_id}: {e}");
                call.drop_peer(session_id).await;
            }
        }
    }

    /// Hang up on `session_id` and call it back on a fresh connection.
    pub(crate) async fn restart_peer(&mut self, session_id: SessionId) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        info!(target: "Call/Recovery", "Restarting connection to {session_id}");
        call.signaling()
            .send(session_id, ControlEvent::Disconnect)
            .await;
        call.drop_peer(session_id).await;
        self.connect(session_id).await;
    }

    async fn handle_control(&mut self, sender: SessionId, event: ControlEvent) {
        match event {
            ControlEvent::Offer(offer) => {
                let provisional = self
                    .state
                    .context_mut()
                    .is_some_and(|context| context.insert_provisional(sender));
                if provisional {
                    info!(target: "Call/Session", "Offer from unannounced session {sender}, adding provisionally");
                    EventBus::publish(
                        &self.events.participant_joined,
                        ParticipantJoined {
                            session_id: sender,
                            member_id: None,
                        },
                    );
                }
                if !self.open_peer(sender).await {
                    return;
                }
                let Some(call) = self.call.as_mut() else {
                    return;
                };
                let (signaling, peers) = call.split();
                let Some(peer) = peers.get_mut(&sender) else {
                    return;
                };
                let before = peer.phase();
                let result = peer
                    .handle_offer(offer, &self.media, signaling)
                    .await
                    .map(|outcome| (outcome, peer.phase()));
                match result {
                    Ok((OfferOutcome::Answered { rolled_back }, phase)) => {
                        // Only yielding in a collision hands the caller role
                        // over; a renegotiation leaves it where it was.
                        if rolled_back {
                            info!(target: "Call/Peer", "Yielded to offer from {sender}");
                            call.outgoing.remove(&sender);
                        }
                        call.schedule_recovery(
                            sender,
                            RecoveryReason::AnswerUnacknowledged,
                            &self.config,
                        );
                        if phase != before {
                            Self::publish_phase(&self.events, sender, phase);
                        }
                    }
                    Ok((OfferOutcome::Ignored, _)) => {}
                    Err(e) => {
                        warn!(target: "Call/Peer", "Dropping offer from {sender}: {e}");
                    }
                }
            }
            ControlEvent::Answer(answer) => {
                let Some(peer) = self
                    .call
                    .as_mut()
                    .and_then(|call| call.peers.get_mut(&sender))
                else {
                    debug!(target: "Call/Peer", "Answer from {sender} without a connection");
                    return;
                };
                if let Err(e) = peer.handle_answer(answer).await {
                    warn!(target: "Call/Peer", "Dropping answer from {sender}: {e}");
                }
            }
            ControlEvent::IceCandidate(candidate) => {
                let Some(call) = self.call.as_mut() else {
                    return;
                };
                let Some(peer) = call.peers.get_mut(&sender) else {
                    debug!(target: "Call/Peer", "Candidate from {sender} without a connection");
                    return;
                };
                if let Err(e) = peer.handle_candidate(candidate).await {
                    warn!(target: "Call/Peer", "Adding candidate from {sender} failed: {e}");
                    call.schedule_recovery(sender, RecoveryReason::CandidateError, &self.config);
                }
            }
            ControlEvent::TrackChange(change) => {
                let changed = self
                    .state
                    .context_mut()
                    .is_some_and(|context| context.apply_flags(sender, change.state));
                if changed {
                    self.publish_flags(sender, change.state);
                }
            }
            ControlEvent::Disconnect => {
                debug!(target: "Call/Peer", "{sender} hung up its connection");
                self.close_peer(sender).await;
            }
        }
    }

    async fn handle_peer_event(&mut self, session_id: SessionId, generation: u64, event: PeerEvent) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let (signaling, peers) = call.split();
        let Some(peer) = peers.get_mut(&session_id) else {
            debug!(target: "Call/Peer", "Event for closed connection to {session_id}: {event:?}");
            return;
        };
        if peer.generation() != generation {
            debug!(target: "Call/Peer", "Stale event for {session_id} (generation {generation}): {event:?}");
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                signaling
                    .send(session_id, ControlEvent::IceCandidate(candidate))
                    .await;
            }
            PeerEvent::NegotiationNeeded => {
                if peer.phase() == PeerPhase::Uninitialized
                    || peer.signaling_state() != SignalingState::Stable
                {
                    return;
                }
                debug!(target: "Call/Peer", "Renegotiating with {session_id}");
                if let Err(e) = peer.send_offer(signaling).await {
                    warn!(target: "Call/Peer", "Renegotiation with {session_id} failed: {e}");
                }
            }
            PeerEvent::IceStateChanged(state) => {
                debug!(target: "Call/Peer", "ICE state of {session_id}: {state:?}");
                if let Some(phase) = peer.on_ice_state(state) {
                    self.on_phase_changed(session_id, phase);
                }
            }
            PeerEvent::ConnectionStateChanged(state) => {
                debug!(target: "Call/Peer", "Connection state of {session_id}: {state:?}");
                if let Some(phase) = peer.on_connection_state(state) {
                    self.on_phase_changed(session_id, phase);
                }
            }
            PeerEvent::IceCandidateError { code, text } => {
                warn!(target: "Call/Peer", "Candidate error on {session_id}: {code} {text}");
                call.schedule_recovery(session_id, RecoveryReason::CandidateError, &self.config);
            }
            PeerEvent::RemoteTrack(track) => {
                let track_id = track.id();
                let kind = track.kind();
                peer.attach_remote_track(track, self.media.state().is_deaf());
                EventBus::publish(
                    &self.events.remote_track,
                    RemoteTrackAttached {
                        session_id,
                        track_id,
                        kind,
                    },
                );
            }
            PeerEvent::SideChannelOpen => {
                let flags = self.media.state().flags();
                for kind in [TrackKind::Audio, TrackKind::Video] {
                    if let Some(text) =
                        signaling.encode(ControlEvent::TrackChange(TrackChange { kind, state: flags }))
                    {
                        peer.send_side_channel(&text);
                    }
                }
            }
            PeerEvent::SideChannelMessage(text) => {
                if let Some(event) = decode_inbound(signaling.channel_id, session_id, &text) {
                    self.handle_control(session_id, event).await;
                }
            }
        }
    }

    fn on_phase_changed(&mut self, session_id: SessionId, phase: PeerPhase) {
        Self::publish_phase(&self.events, session_id, phase);
        let Some(call) = self.call.as_mut() else {
            return;
        };
        match phase {
            PeerPhase::Connected => {
                info!(target: "Call/Peer", "Connected to {session_id}");
                call.recovery.cancel(session_id);
            }
            PeerPhase::Recovering => {
                warn!(target: "Call/Peer", "Connection to {session_id} failed");
                call.schedule_recovery(session_id, RecoveryReason::ConnectionFailed, &self.config);
            }
            _ => {}
        }
    }

    async fn handle_recovery_due(&mut self, session_id: SessionId, ticket: u64) {
        let in_call = self.state.is_in_call();
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(reason) = call.recovery.take_due(session_id, ticket) else {
            return;
        };
        let verdict = evaluate(
            in_call,
            call.peers.get(&session_id).map(PeerLifecycle::phase),
            call.outgoing.contains(&session_id),
        );
        match verdict {
            RecoveryVerdict::Restart => {
                info!(target: "Call/Recovery", "Recovering {session_id} ({reason:?})");
                self.restart_peer(session_id).await;
            }
            skipped => {
                debug!(target: "Call/Recovery", "Recovery of {session_id} skipped: {skipped:?}");
            }
        }
    }

    async fn set_deaf(&mut self, deaf: bool) {
        if !self.media.set_deaf(deaf) {
            return;
        }
        if let Some(call) = &self.call {
            for peer in call.peers.values() {
                peer.set_deaf(deaf);
            }
        }
        self.announce_local_state(TrackKind::Audio).await;
    }

    async fn set_source(&mut self, source: MediaSource, enabled: bool) -> Result<(), CallError> {
        if !self.state.is_in_call() {
            return Err(CallError::NotInCall);
        }
        let result = match (source, enabled) {
            (MediaSource::Microphone, true) => self.start_microphone().await,
            (MediaSource::Microphone, false) => {
                self.voice.stop();
                self.media.disable_microphone();
                self.apply_talking(false).await;
                Ok(())
            }
            (MediaSource::Camera, true) => self.media.enable_video(VideoSource::Camera).await,
            (MediaSource::Display, true) => self.media.enable_video(VideoSource::Screen).await,
            (MediaSource::Camera, false) => {
                self.media.disable_video(Some(VideoSource::Camera));
                Ok(())
            }
            (MediaSource::Display, false) => {
                self.media.disable_video(Some(VideoSource::Screen));
                Ok(())
            }
        };

        self.sync_senders().await;
        self.announce_local_state(source.kind()).await;
        if let Err(e) = result {
            self.device_warning(source, &e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn set_voice_settings(&mut self, settings: VoiceSettings) -> Result<(), CallError> {
        let previous = std::mem::replace(&mut self.voice_settings, settings);
        if !previous.requires_restart(&self.voice_settings) {
            self.voice
                .set_release_delay(self.voice_settings.push_to_talk_delay);
            return Ok(());
        }
        if self.media.audio_track().is_none() {
            return Ok(());
        }

        if previous.input_device != self.voice_settings.input_device {
            info!(target: "Call/Media", "Switching input device to {:?}", self.voice_settings.input_device);
            let result = self.start_microphone().await;
            self.sync_senders().await;
            if let Err(e) = result {
                self.device_warning(MediaSource::Microphone, &e);
                self.announce_local_state(TrackKind::Audio).await;
                return Err(e.into());
            }
        } else {
            self.restart_voice_monitor().await;
        }
        Ok(())
    }

    async fn start_microphone(&mut self) -> Result<(), DeviceError> {
        self.voice.stop();
        self.media
            .enable_microphone(self.voice_settings.input_device.clone())
            .await?;
        self.restart_voice_monitor().await;
        Ok(())
    }

    async fn restart_voice_monitor(&mut self) {
        self.apply_talking(false).await;
        let Some(track) = self.media.audio_track() else {
            self.voice.stop();
            return;
        };
        if let Err(e) = self
            .voice
            .start(&self.voice_settings, &track, self.media.devices().as_ref())
        {
            // Without a level meter we cannot detect speech; keep the
            // microphone open rather than silently muting.
            warn!(target: "Call/Voice", "Voice activity monitor unavailable, sending continuously: {e}");
            self.apply_talking(true).await;
        }
    }

    async fn apply_talking(&mut self, talking: bool) {
        if !self.media.set_talking(talking) {
            return;
        }
        debug!(target: "Call/Voice", "Talking: {talking}");
        EventBus::publish(&self.events.talking, TalkingChanged { talking });
        self.announce_local_state(TrackKind::Audio).await;
    }

    async fn handle_track_ended(&mut self, source: MediaSource, token: u64) {
        let Some(loss) = self.media.handle_track_ended(source, token) else {
            return;
        };
        EventBus::publish(&self.events.warning, CallWarning::DeviceLost { source });
        if loss == TrackLoss::Audio {
            self.voice.stop();
            self.apply_talking(false).await;
        }
        self.sync_senders().await;
        self.announce_local_state(source.kind()).await;
    }

    async fn sync_senders(&self) {
        let Some(call) = &self.call else {
            return;
        };
        for peer in call.peers.values() {
            if let Err(e) = peer.sync_senders(&self.media).await {
                warn!(target: "Call/Media", "Updating senders for {} failed: {e}", peer.session_id());
            }
        }
    }

    /// Publish the local flags: track-change over every side channel and a
    /// debounced update to the server.
    async fn announce_local_state(&self, kind: TrackKind) {
        let Some(call) = &self.call else {
            return;
        };
        let state = self.media.state();
        call.broadcast.update(state.broadcast_state()).await;
        if let Some(text) = call.signaling().encode(ControlEvent::TrackChange(TrackChange {
            kind,
            state: state.flags(),
        })) {
            for peer in call.peers.values() {
                peer.send_side_channel(&text);
            }
        }
    }

    fn device_warning(&self, source: MediaSource, error: &DeviceError) {
        warn!(target: "Call/Media", "Could not use {source:?}: {error}");
        EventBus::publish(
            &self.events.warning,
            CallWarning::DeviceUnavailable {
                source,
                message: error.to_string(),
            },
        );
    }

    fn publish_flags(&self, session_id: SessionId, flags: SessionFlags) {
        EventBus::publish(
            &self.events.session_flags,
            SessionFlagsChanged { session_id, flags },
        );
    }

    pub(crate) fn publish_phase(events: &EventBus, session_id: SessionId, phase: PeerPhase) {
        EventBus::publish(&events.peer_phase, PeerPhaseChanged { session_id, phase });
    }

    async fn snapshot(&self) -> Option<CallSnapshot> {
        let context = self.state.context()?;
        let call = self.call.as_ref()?;
        Some(CallSnapshot {
            conversation_id: context.conversation_id(),
            self_session_id: context.self_session_id(),
            started_at: context.started_at(),
            sessions: context.sessions().cloned().collect(),
            peers: call
                .peers
                .iter()
                .map(|(id, peer)| (*id, peer.phase()))
                .collect(),
            outgoing: call.outgoing.iter().copied().collect(),
            pending_recoveries: call.recovery.pending(),
            media: self.media.state().clone(),
            queued_relay_messages: call.relay.pending_len().await,
        })
    }
}
