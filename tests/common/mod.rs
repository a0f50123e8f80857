#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use voip_signaling::calls::{
    CallFrontEnd, CallHistory, CallServices, CallState, ChannelError, Contact, ContactDirectory,
    DeviceStatus, EngineError, IceCandidate, MessageChannel, OutgoingMessage, PeerConnection,
    PeerConnectionEngine, PeerConnectionObserver, PeerConnectionParams, PeerSignalingMessage,
    SdpType, SessionDescription, Sound, StatsReport, TransportState, VerificationLevel,
    VideoProfile,
};
use voip_signaling::types::call::CallId;
use voip_signaling::types::events::{CallEvent, SessionEvent};
use voip_signaling::{CallConfig, CallCoordinator, CallEventBus, CallSessionDriver, SignalingHandler};

pub const ALICE: &str = "ALICE001";
pub const BOB: &str = "BOB00002";
pub const CAROL: &str = "CAROL003";
/// Known, but never verified.
pub const STRANGER: &str = "STRANGER";
/// Runs a client without video support.
pub const AUDIO_ONLY: &str = "AUDIO001";

/// Let every spawned task run until it blocks. The test clock is paused,
/// so this advances time by a few milliseconds only.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

type Envelope = (String, u8, Vec<u8>);

/// In-memory message transport between test peers.
#[derive(Default)]
pub struct Network {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

struct Outbox {
    from: String,
    network: Arc<Network>,
    sent: Arc<Mutex<Vec<(String, OutgoingMessage)>>>,
}

impl MessageChannel for Outbox {
    fn enqueue(&self, to_identity: &str, message: OutgoingMessage) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((to_identity.to_string(), message.clone()));
        let payload = message
            .to_payload()
            .map_err(|e| ChannelError::Enqueue(e.to_string()))?;
        let route = self.network.routes.lock().unwrap().get(to_identity).cloned();
        // messages to unknown peers are lost, like those to an offline device
        if let Some(route) = route {
            route
                .send((self.from.clone(), message.signaling_type().code(), payload))
                .map_err(|_| ChannelError::Closed)?;
        }
        Ok(())
    }
}

struct Directory;

impl ContactDirectory for Directory {
    fn get(&self, identity: &str) -> Option<Contact> {
        match identity {
            "UNKNOWN1" => None,
            STRANGER => Some(Contact::new(identity).with_verification_level(VerificationLevel::Unverified)),
            AUDIO_ONLY => Some(Contact::new(identity).with_video_support(false)),
            _ => Some(Contact::new(identity)),
        }
    }
}

#[derive(Default)]
pub struct FakeDevice {
    pub native_call_ongoing: AtomicBool,
    pub off_hours: AtomicBool,
    pub metered: AtomicBool,
}

impl DeviceStatus for FakeDevice {
    fn is_native_call_ongoing(&self) -> bool {
        self.native_call_ongoing.load(Ordering::SeqCst)
    }
    fn is_off_hours(&self, _identity: &str) -> bool {
        self.off_hours.load(Ordering::SeqCst)
    }
    fn has_valid_credentials(&self) -> bool {
        true
    }
    fn is_ringtone_muted(&self, _identity: &str) -> bool {
        false
    }
    fn is_network_metered(&self) -> bool {
        self.metered.load(Ordering::SeqCst)
    }
}

struct EmptyHistory;

impl CallHistory for EmptyHistory {
    fn has_call_status(&self, _identity: &str, _call_id: CallId, _lookback: usize) -> bool {
        false
    }
}

/// Front end that records every request as a short string.
#[derive(Default)]
pub struct RecordingFrontEnd {
    log: Mutex<Vec<String>>,
    looping: Mutex<Option<Sound>>,
}

impl RecordingFrontEnd {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn has(&self, entry: &str) -> bool {
        self.log.lock().unwrap().iter().any(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

impl CallFrontEnd for RecordingFrontEnd {
    fn show_incoming_call(&self, contact: &Contact, call_id: CallId, video: bool) {
        self.record(format!("incoming:{}:{call_id}:{video}", contact.identity));
    }
    fn cancel_incoming_call(&self, identity: &str) {
        self.record(format!("cancel_incoming:{identity}"));
    }
    fn start_ringtone(&self, identity: &str, _muted: bool) {
        self.record(format!("ringtone:{identity}"));
    }
    fn stop_ringtone(&self) {}
    fn register_media_button(&self) {}
    fn unregister_media_button(&self) {}
    fn show_in_call(&self, contact: &Contact, call_id: CallId) {
        self.record(format!("in_call:{}:{call_id}", contact.identity));
    }
    fn cancel_in_call(&self) {}
    fn start_looping_sound(&self, sound: Sound) {
        *self.looping.lock().unwrap() = Some(sound);
        self.record(format!("loop:{sound:?}"));
    }
    fn stop_looping_sound(&self) -> bool {
        self.looping.lock().unwrap().take().is_some()
    }
    fn play_sound(&self, sound: Sound) -> bool {
        self.record(format!("sound:{sound:?}"));
        true
    }
    fn show_error_notification(&self, message: &str) {
        self.record(format!("error:{message}"));
    }
    fn show_toast(&self, message: &str) {
        self.record(format!("toast:{message}"));
    }
}

/// Engine whose connections report descriptions and candidates right away.
/// With `auto_connect`, the answering side reports `Connected` after its
/// answer and the offering side once the answer was applied.
pub struct FakeEngine {
    local_candidates: Vec<String>,
    auto_connect: bool,
    factory_delay: Duration,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeEngine {
    pub fn new(options: &PeerOptions) -> Arc<Self> {
        Arc::new(Self {
            local_candidates: options.local_candidates.iter().map(|c| c.to_string()).collect(),
            auto_connect: options.auto_connect,
            factory_delay: options.factory_delay,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn last_connection(&self) -> Arc<FakeConnection> {
        self.connections().pop().expect("no connection was created")
    }
}

#[async_trait]
impl PeerConnectionEngine for FakeEngine {
    async fn create_factory(&self) -> Result<(), EngineError> {
        if !self.factory_delay.is_zero() {
            tokio::time::sleep(self.factory_delay).await;
        }
        Ok(())
    }

    async fn create_connection(
        &self,
        params: PeerConnectionParams,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let connection = Arc::new(FakeConnection {
            params,
            observer,
            local_candidates: self.local_candidates.clone(),
            auto_connect: self.auto_connect,
            remote_candidates: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            data_channel: Mutex::new(Vec::new()),
            capturing: AtomicBool::new(false),
            capture_stops: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection as Arc<dyn PeerConnection>)
    }
}

pub struct FakeConnection {
    pub params: PeerConnectionParams,
    observer: Arc<dyn PeerConnectionObserver>,
    local_candidates: Vec<String>,
    auto_connect: bool,
    remote_candidates: Mutex<Vec<String>>,
    remote_descriptions: Mutex<Vec<SdpType>>,
    data_channel: Mutex<Vec<PeerSignalingMessage>>,
    capturing: AtomicBool,
    capture_stops: AtomicUsize,
    closed: AtomicBool,
}

impl FakeConnection {
    pub fn remote_candidates(&self) -> Vec<String> {
        self.remote_candidates.lock().unwrap().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SdpType> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    pub fn data_channel(&self) -> Vec<PeerSignalingMessage> {
        self.data_channel.lock().unwrap().clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn capture_stops(&self) -> usize {
        self.capture_stops.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate a transport change reported by the engine.
    pub async fn report_transport(&self, state: TransportState) {
        self.observer
            .on_transport_state(self.params.call_id, state)
            .await;
    }

    pub async fn report_stats(&self, report: StatsReport) {
        self.observer.on_stats(self.params.call_id, report).await;
    }

    /// Deliver a data channel message from the peer.
    pub async fn receive(&self, message: PeerSignalingMessage) {
        self.observer
            .on_signaling_message(self.params.call_id, message)
            .await;
    }

    pub async fn report_first_frame(&self) {
        self.observer.on_camera_first_frame().await;
    }

    fn describe(&self, local: SessionDescription, connect: bool) {
        let observer = self.observer.clone();
        let call_id = self.params.call_id;
        let candidates = self.local_candidates.clone();
        let connect = connect && self.auto_connect;
        tokio::spawn(async move {
            observer.on_local_description(call_id, local).await;
            for candidate in candidates {
                observer
                    .on_ice_candidate(call_id, IceCandidate::new(candidate).with_sdp_mid("0"))
                    .await;
            }
            if connect {
                observer
                    .on_transport_state(call_id, TransportState::Connected)
                    .await;
            }
        });
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<(), EngineError> {
        self.describe(SessionDescription::offer("v=0 fake offer"), false);
        Ok(())
    }

    async fn create_answer(&self) -> Result<(), EngineError> {
        self.describe(SessionDescription::answer("v=0 fake answer"), true);
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), EngineError> {
        self.remote_descriptions.lock().unwrap().push(sdp.sdp_type);
        let observer = self.observer.clone();
        let call_id = self.params.call_id;
        let connect = self.auto_connect && sdp.sdp_type == SdpType::Answer;
        tokio::spawn(async move {
            observer.on_remote_description_set(call_id).await;
            if connect {
                observer
                    .on_transport_state(call_id, TransportState::Connected)
                    .await;
            }
        });
        Ok(())
    }

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.remote_candidates
            .lock()
            .unwrap()
            .push(candidate.candidate);
        Ok(())
    }

    async fn change_outgoing_video_params(&self, _profile: VideoProfile) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start_capturing(&self, _profile: VideoProfile) -> Result<(), EngineError> {
        self.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_capturing(&self) -> Result<(), EngineError> {
        self.capture_stops.fetch_add(1, Ordering::SeqCst);
        self.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn switch_camera(&self) -> Result<bool, EngineError> {
        Ok(false)
    }

    async fn send_signaling_message(&self, message: PeerSignalingMessage) -> Result<(), EngineError> {
        self.data_channel.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct PeerOptions {
    pub config: CallConfig,
    pub local_candidates: Vec<&'static str>,
    /// Report `Connected` without being told to.
    pub auto_connect: bool,
    pub factory_delay: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            config: CallConfig::default(),
            local_candidates: vec!["candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host"],
            auto_connect: true,
            factory_delay: Duration::ZERO,
        }
    }
}

/// One endpoint: coordinator, session driver and recording fakes.
pub struct TestPeer {
    pub identity: String,
    pub coordinator: Arc<CallCoordinator>,
    pub driver: Arc<CallSessionDriver>,
    pub handler: SignalingHandler,
    pub engine: Arc<FakeEngine>,
    pub device: Arc<FakeDevice>,
    pub front_end: Arc<RecordingFrontEnd>,
    sent: Arc<Mutex<Vec<(String, OutgoingMessage)>>>,
    call_rx: Mutex<broadcast::Receiver<Arc<CallEvent>>>,
    session_rx: Mutex<broadcast::Receiver<Arc<SessionEvent>>>,
    call_log: Mutex<Vec<CallEvent>>,
    session_log: Mutex<Vec<SessionEvent>>,
}

impl TestPeer {
    pub fn join(network: &Arc<Network>, identity: &str) -> Self {
        Self::join_with(network, identity, PeerOptions::default())
    }

    pub fn join_with(network: &Arc<Network>, identity: &str, options: PeerOptions) -> Self {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let device = Arc::new(FakeDevice::default());
        let front_end = Arc::new(RecordingFrontEnd::default());
        let engine = FakeEngine::new(&options);
        let services = CallServices {
            channel: Arc::new(Outbox {
                from: identity.to_string(),
                network: network.clone(),
                sent: sent.clone(),
            }),
            contacts: Arc::new(Directory),
            device: device.clone(),
            history: Arc::new(EmptyHistory),
            front_end: front_end.clone(),
        };
        let config = Arc::new(options.config);
        let events = Arc::new(CallEventBus::new());
        let call_rx = events.call.subscribe();
        let session_rx = events.session.subscribe();
        let coordinator = CallCoordinator::new(config.clone(), services.clone(), events.clone());
        let driver = CallSessionDriver::new(
            config,
            coordinator.clone(),
            services,
            engine.clone(),
            events,
        );
        let handler = SignalingHandler::new(coordinator.clone());

        let (tx, mut inbox) = mpsc::unbounded_channel::<Envelope>();
        network
            .routes
            .lock()
            .unwrap()
            .insert(identity.to_string(), tx);
        let forward = handler.clone();
        tokio::spawn(async move {
            while let Some((from, type_code, payload)) = inbox.recv().await {
                forward.handle(&from, Utc::now(), type_code, &payload).await;
            }
        });
        tokio::spawn(driver.clone().run());

        Self {
            identity: identity.to_string(),
            coordinator,
            driver,
            handler,
            engine,
            device,
            front_end,
            sent,
            call_rx: Mutex::new(call_rx),
            session_rx: Mutex::new(session_rx),
            call_log: Mutex::new(Vec::new()),
            session_log: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> CallState {
        self.coordinator.call_state().state
    }

    pub fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        self.sent.lock().unwrap().clone()
    }

    /// Every call history event emitted so far.
    pub fn call_events(&self) -> Vec<CallEvent> {
        let mut log = self.call_log.lock().unwrap();
        let mut rx = self.call_rx.lock().unwrap();
        while let Ok(event) = rx.try_recv() {
            log.push((*event).clone());
        }
        log.clone()
    }

    pub fn session_events(&self) -> Vec<SessionEvent> {
        let mut log = self.session_log.lock().unwrap();
        let mut rx = self.session_rx.lock().unwrap();
        while let Ok(event) = rx.try_recv() {
            log.push((*event).clone());
        }
        log.clone()
    }
}
