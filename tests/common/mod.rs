#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mesh_call::calls::{
    AudioLevelMeter, DeviceConstraints, DeviceError, LocalTrack, MediaDevices, PeerConfig,
    PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTrack,
    TrackEndedSink, TransportError,
};
use mesh_call::server::{
    CallServer, JoinRequest, JoinResponse, LeaveRequest, PeerNotification, PingRequest,
    PingResponse, ServerError, SessionStateUpdate,
};
use mesh_call::{CallConfig, CallHandle};
use meshcore::{
    ControlEvent, ControlMessage, IceCandidate, IceConnectionState, MediaSource, MemberId,
    PeerConnectionState, RemoteSession, SdpKind, SessionDescription, SessionId, SignalingState,
    TrackId, TrackKind,
};

pub const SELF: SessionId = SessionId(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn remote(id: u64) -> RemoteSession {
    RemoteSession::new(SessionId(id), MemberId(id * 100))
}

/// Server double that records every request.
#[derive(Default)]
pub struct MockServer {
    pub self_session: Mutex<Option<SessionId>>,
    pub roster: Mutex<Vec<RemoteSession>>,
    pub invited: Mutex<Vec<MemberId>>,
    pub join_delay: Mutex<Duration>,
    pub joins: Mutex<Vec<JoinRequest>>,
    pub leaves: Mutex<Vec<LeaveRequest>>,
    pub pings: Mutex<Vec<PingRequest>>,
    /// When unset, pings confirm every known session.
    pub ping_response: Mutex<Option<PingResponse>>,
    pub relayed: Mutex<Vec<PeerNotification>>,
    pub state_updates: Mutex<Vec<SessionStateUpdate>>,
}

impl MockServer {
    pub fn with_roster(roster: Vec<RemoteSession>) -> Arc<Self> {
        let server = Self::default();
        *server.roster.lock().unwrap() = roster;
        Arc::new(server)
    }

    /// Relayed control messages in send order, one entry per target.
    pub fn relayed_events(&self) -> Vec<(SessionId, ControlEvent)> {
        self.relayed
            .lock()
            .unwrap()
            .iter()
            .flat_map(|n| {
                let event = ControlMessage::decode(&n.message).unwrap().event;
                n.targets.iter().map(move |t| (*t, event.clone()))
            })
            .collect()
    }

    pub fn count_relayed(&self, name: &str) -> usize {
        self.relayed_events()
            .iter()
            .filter(|(_, e)| e.name() == name)
            .count()
    }
}

#[async_trait]
impl CallServer for MockServer {
    async fn join_call(&self, request: JoinRequest) -> Result<JoinResponse, ServerError> {
        let delay = *self.join_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.joins.lock().unwrap().push(request);
        Ok(JoinResponse {
            self_session_id: self.self_session.lock().unwrap().unwrap_or(SELF),
            ice_servers: Vec::new(),
            sessions: self.roster.lock().unwrap().clone(),
            invited_members: self.invited.lock().unwrap().clone(),
        })
    }

    async fn leave_call(&self, request: LeaveRequest) -> Result<(), ServerError> {
        self.leaves.lock().unwrap().push(request);
        Ok(())
    }

    async fn ping(&self, request: PingRequest) -> Result<PingResponse, ServerError> {
        let response = match self.ping_response.lock().unwrap().clone() {
            Some(response) => response,
            None => PingResponse {
                active: request
                    .known_session_ids
                    .iter()
                    .map(|id| remote(id.get()))
                    .collect(),
                dropped: Vec::new(),
            },
        };
        self.pings.lock().unwrap().push(request);
        Ok(response)
    }

    async fn notify_peers(&self, batch: Vec<PeerNotification>) -> Result<(), ServerError> {
        self.relayed.lock().unwrap().extend(batch);
        Ok(())
    }

    async fn update_session_state(&self, update: SessionStateUpdate) -> Result<(), ServerError> {
        self.state_updates.lock().unwrap().push(update);
        Ok(())
    }
}

/// Connection double. Signaling state follows the descriptions applied to
/// it the way a real connection's would.
pub struct MockPeer {
    pub session_id: SessionId,
    sink: PeerEventSink,
    signaling: Mutex<SignalingState>,
    ice: Mutex<IceConnectionState>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub fail_candidates: AtomicBool,
    pub senders: Mutex<HashMap<TrackKind, Option<TrackId>>>,
    pub side_channel_open: AtomicBool,
    pub side_channel_sent: Mutex<Vec<String>>,
    pub close_count: AtomicUsize,
}

impl MockPeer {
    pub fn emit(&self, event: PeerEvent) {
        self.sink.emit(event);
    }

    pub fn force_signaling_state(&self, state: SignalingState) {
        *self.signaling.lock().unwrap() = state;
    }

    pub fn set_ice(&self, state: IceConnectionState) {
        *self.ice.lock().unwrap() = state;
        self.emit(PeerEvent::IceStateChanged(state));
    }

    pub fn signaling_state_for_test(&self) -> SignalingState {
        *self.signaling.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.close_count.load(Ordering::SeqCst) > 0
    }

    pub fn side_channel_events(&self) -> Vec<ControlEvent> {
        self.side_channel_sent
            .lock()
            .unwrap()
            .iter()
            .map(|text| ControlMessage::decode(text).unwrap().event)
            .collect()
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-{}-{n}", self.session_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("answer-{}-{n}", self.session_id)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        *self.signaling.lock().unwrap() = match description.kind {
            SdpKind::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        *self.signaling.lock().unwrap() = match description.kind {
            SdpKind::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("bad candidate".into()));
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn set_sender_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<dyn LocalTrack>>,
    ) -> Result<(), TransportError> {
        self.senders
            .lock()
            .unwrap()
            .insert(kind, track.map(|t| t.id()));
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock().unwrap()
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        *self.ice.lock().unwrap()
    }

    fn connection_state(&self) -> PeerConnectionState {
        PeerConnectionState::New
    }

    fn side_channel_open(&self) -> bool {
        self.side_channel_open.load(Ordering::SeqCst)
    }

    fn send_side_channel(&self, text: &str) -> Result<(), TransportError> {
        self.side_channel_sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        *self.signaling.lock().unwrap() = SignalingState::Closed;
        *self.ice.lock().unwrap() = IceConnectionState::Closed;
    }
}

pub struct MockFactory {
    pub supported: AtomicBool,
    pub created: Mutex<Vec<Arc<MockPeer>>>,
    /// New connections start with their side channel open.
    pub open_side_channels: AtomicBool,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self {
            supported: AtomicBool::new(true),
            created: Mutex::new(Vec::new()),
            open_side_channels: AtomicBool::new(false),
        }
    }
}

impl MockFactory {
    /// The most recent connection to `session_id`.
    pub fn peer(&self, session_id: SessionId) -> Arc<MockPeer> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.session_id == session_id)
            .cloned()
            .unwrap_or_else(|| panic!("no connection to {session_id}"))
    }

    pub fn created_for(&self, session_id: SessionId) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.session_id == session_id)
            .count()
    }

    pub fn total_created(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    async fn create(
        &self,
        _config: PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let peer = Arc::new(MockPeer {
            session_id: events.session_id(),
            sink: events,
            signaling: Mutex::new(SignalingState::Stable),
            ice: Mutex::new(IceConnectionState::New),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            candidates: Mutex::new(Vec::new()),
            fail_candidates: AtomicBool::new(false),
            senders: Mutex::new(HashMap::new()),
            side_channel_open: AtomicBool::new(self.open_side_channels.load(Ordering::SeqCst)),
            side_channel_sent: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        });
        self.created.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Debug)]
pub struct MockTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub enabled: AtomicBool,
    pub stopped: AtomicBool,
}

impl MockTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for MockTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockRemoteTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub enabled: AtomicBool,
}

impl MockRemoteTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: TrackId::new(id),
            kind,
            enabled: AtomicBool::new(true),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl RemoteTrack for MockRemoteTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

struct SilentMeter;

impl AudioLevelMeter for SilentMeter {
    fn level(&mut self) -> f32 {
        0.0
    }
}

#[derive(Default)]
pub struct MockDevices {
    pub unavailable: Mutex<HashSet<MediaSource>>,
    pub acquired: Mutex<Vec<(MediaSource, Arc<MockTrack>, TrackEndedSink)>>,
}

impl MockDevices {
    pub fn tracks(&self, source: MediaSource) -> Vec<Arc<MockTrack>> {
        self.acquired
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == source)
            .map(|(_, t, _)| t.clone())
            .collect()
    }

    pub fn latest(&self, source: MediaSource) -> Arc<MockTrack> {
        self.tracks(source)
            .pop()
            .unwrap_or_else(|| panic!("no {source:?} track acquired"))
    }

    /// Simulate the OS ending the latest track of `source`.
    pub fn end_latest(&self, source: MediaSource) {
        let acquired = self.acquired.lock().unwrap();
        let (_, _, sink) = acquired
            .iter()
            .rev()
            .find(|(s, _, _)| *s == source)
            .unwrap();
        sink.notify();
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn acquire(
        &self,
        source: MediaSource,
        constraints: DeviceConstraints,
        ended: TrackEndedSink,
    ) -> Result<Arc<dyn LocalTrack>, DeviceError> {
        if self.unavailable.lock().unwrap().contains(&source) {
            return Err(DeviceError::PermissionDenied(source));
        }
        let mut acquired = self.acquired.lock().unwrap();
        let device = constraints.device_id.unwrap_or_else(|| "default".into());
        let track = Arc::new(MockTrack {
            id: TrackId::new(format!("{source:?}-{device}-{}", acquired.len())),
            kind: source.kind(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        acquired.push((source, track.clone(), ended));
        Ok(track)
    }

    fn level_meter(
        &self,
        _track: &Arc<dyn LocalTrack>,
    ) -> Result<Box<dyn AudioLevelMeter>, DeviceError> {
        Ok(Box::new(SilentMeter))
    }
}

pub struct Harness {
    pub server: Arc<MockServer>,
    pub factory: Arc<MockFactory>,
    pub devices: Arc<MockDevices>,
    pub handle: CallHandle,
}

impl Harness {
    pub fn new(server: Arc<MockServer>) -> Self {
        init_logging();
        let factory = Arc::new(MockFactory::default());
        let devices = Arc::new(MockDevices::default());
        let handle = CallHandle::spawn(
            CallConfig::default(),
            server.clone(),
            factory.clone(),
            devices.clone(),
        );
        Self {
            server,
            factory,
            devices,
            handle,
        }
    }

    /// Let the relay worker flush anything queued.
    pub async fn flush_relay(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Wait until the engine has handled everything submitted so far.
    pub async fn settle(&self) {
        self.handle.snapshot().await.unwrap();
    }
}

pub fn offer(sdp: &str) -> ControlEvent {
    ControlEvent::Offer(SessionDescription::offer(sdp))
}
