use anyhow::Context;
use async_trait::async_trait;
use chrono::{Local, Utc};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voip_signaling::calls::{
    CallFrontEnd, CallHistory, CallServices, ChannelError, Contact, ContactDirectory,
    DeviceStatus, EngineError, IceCandidate, MessageChannel, OutgoingMessage, PeerConnection,
    PeerConnectionEngine, PeerConnectionObserver, PeerConnectionParams, PeerSignalingMessage,
    SdpType, SessionDescription, Sound, TransportState, VideoPreference, VideoProfile,
};
use voip_signaling::types::call::CallId;
use voip_signaling::types::events::CallEvent;
use voip_signaling::{CallConfig, CallCoordinator, CallEventBus, CallSessionDriver, SignalingHandler};

// Runs one call between two peers living in this process. Signaling goes
// through in-memory queues and the media engine connects instantly.
//
// Usage:
//   cargo run                               # audio call, callee accepts
//   cargo run -- --video --talk-secs 5      # video call, 5 seconds long
//   cargo run -- --reject                   # callee declines
//   cargo run -- --video --quality max      # caller raises video quality mid-call
//   cargo run -- --config call.json         # tunables from a JSON file

#[derive(Debug, Parser)]
#[command(about = "Loopback call between two in-process peers")]
struct Args {
    /// JSON file with call tunables.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    video: bool,
    /// The callee declines instead of accepting.
    #[arg(long)]
    reject: bool,
    #[arg(long, default_value_t = 2)]
    talk_secs: u64,
    /// Video quality the caller switches to once connected.
    #[arg(long, value_parser = parse_preference)]
    quality: Option<VideoPreference>,
}

fn parse_preference(value: &str) -> Result<VideoPreference, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|_| format!("unknown video quality '{value}', expected auto, low, high or max"))
}

const CALLER: &str = "ALICE001";
const CALLEE: &str = "BOB00002";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CallConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CallConfig::default(),
    };
    info!("Using {config:?}");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(async {
        tokio::select! {
            result = run(args, Arc::new(config)) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, exiting");
                Ok(())
            }
        }
    })
}

async fn run(args: Args, config: Arc<CallConfig>) -> anyhow::Result<()> {
    let (to_callee, callee_inbox) = mpsc::unbounded_channel();
    let (to_caller, caller_inbox) = mpsc::unbounded_channel();
    let caller = Peer::new(CALLER, config.clone(), to_callee);
    let callee = Peer::new(CALLEE, config, to_caller);
    caller.spawn(caller_inbox);
    callee.spawn(callee_inbox);

    let mut callee_calls = callee.events.call.subscribe();
    let mut caller_calls = caller.events.call.subscribe();

    let call_id = caller.driver.start_outgoing_call(CALLEE, args.video).await?;
    info!("{CALLER} is calling {CALLEE} (call {call_id})");

    loop {
        let event = callee_calls.recv().await?;
        if let CallEvent::Ringing { call_id: ringing, .. } = &*event {
            anyhow::ensure!(*ringing == call_id, "unexpected call {ringing} is ringing");
            break;
        }
    }

    if args.reject {
        callee.driver.reject_call(call_id).await?;
        // the caller plays the busy tone before giving up
        tokio::time::sleep(Duration::from_secs(5)).await;
    } else {
        callee.driver.accept_call(call_id).await?;
        if let Some(quality) = args.quality {
            tokio::time::sleep(Duration::from_millis(200)).await;
            info!("{CALLER} switches video quality to {quality:?}");
            caller.driver.set_video_preference(quality).await;
        }
        tokio::time::sleep(Duration::from_secs(args.talk_secs)).await;
        info!("Debug info of {CALLER}: {}", caller.driver.debug_info().await);
        caller.driver.hang_up().await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for (name, rx) in [(CALLER, &mut caller_calls), (CALLEE, &mut callee_calls)] {
        while let Ok(event) = rx.try_recv() {
            info!("{name} call record: {event:?}");
        }
    }
    caller.driver.shutdown();
    callee.driver.shutdown();
    Ok(())
}

type Envelope = (String, u8, Vec<u8>);

struct Peer {
    events: Arc<CallEventBus>,
    driver: Arc<CallSessionDriver>,
    handler: SignalingHandler,
}

impl Peer {
    fn new(identity: &str, config: Arc<CallConfig>, outbox: mpsc::UnboundedSender<Envelope>) -> Self {
        let services = CallServices {
            channel: Arc::new(Outbox {
                from: identity.to_string(),
                tx: outbox,
            }),
            contacts: Arc::new(Everyone),
            device: Arc::new(IdleDevice),
            history: Arc::new(NoHistory),
            front_end: Arc::new(LogFrontEnd {
                identity: identity.to_string(),
            }),
        };
        let events = Arc::new(CallEventBus::new());
        let coordinator = CallCoordinator::new(config.clone(), services.clone(), events.clone());
        let driver = CallSessionDriver::new(
            config,
            coordinator.clone(),
            services,
            Arc::new(LoopbackEngine),
            events.clone(),
        );
        Self {
            events,
            driver,
            handler: SignalingHandler::new(coordinator),
        }
    }

    fn spawn(&self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        tokio::spawn(self.driver.clone().run());
        let handler = self.handler.clone();
        tokio::spawn(async move {
            while let Some((from, type_code, payload)) = inbox.recv().await {
                handler.handle(&from, Utc::now(), type_code, &payload).await;
            }
        });
    }
}

struct Outbox {
    from: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MessageChannel for Outbox {
    fn enqueue(&self, _to_identity: &str, message: OutgoingMessage) -> Result<(), ChannelError> {
        let payload = message
            .to_payload()
            .map_err(|e| ChannelError::Enqueue(e.to_string()))?;
        self.tx
            .send((self.from.clone(), message.signaling_type().code(), payload))
            .map_err(|_| ChannelError::Closed)
    }
}

struct Everyone;

impl ContactDirectory for Everyone {
    fn get(&self, identity: &str) -> Option<Contact> {
        let name = match identity {
            CALLER => "Alice",
            CALLEE => "Bob",
            other => other,
        };
        Some(Contact::new(identity).with_display_name(name))
    }
}

struct IdleDevice;

impl DeviceStatus for IdleDevice {
    fn is_native_call_ongoing(&self) -> bool {
        false
    }
    fn is_off_hours(&self, _identity: &str) -> bool {
        false
    }
    fn has_valid_credentials(&self) -> bool {
        true
    }
    fn is_ringtone_muted(&self, _identity: &str) -> bool {
        false
    }
    fn is_network_metered(&self) -> bool {
        false
    }
}

struct NoHistory;

impl CallHistory for NoHistory {
    fn has_call_status(&self, _identity: &str, _call_id: CallId, _lookback: usize) -> bool {
        false
    }
}

struct LogFrontEnd {
    identity: String,
}

impl CallFrontEnd for LogFrontEnd {
    fn show_incoming_call(&self, contact: &Contact, call_id: CallId, video: bool) {
        info!(target: "Demo", "{}: incoming call {call_id} from {} (video={video})", self.identity, contact.display_name);
    }
    fn cancel_incoming_call(&self, identity: &str) {
        info!(target: "Demo", "{}: incoming call from {identity} dismissed", self.identity);
    }
    fn start_ringtone(&self, _identity: &str, muted: bool) {
        info!(target: "Demo", "{}: ringtone (muted={muted})", self.identity);
    }
    fn stop_ringtone(&self) {}
    fn register_media_button(&self) {}
    fn unregister_media_button(&self) {}
    fn show_in_call(&self, contact: &Contact, call_id: CallId) {
        info!(target: "Demo", "{}: in call {call_id} with {}", self.identity, contact.display_name);
    }
    fn cancel_in_call(&self) {}
    fn start_looping_sound(&self, sound: Sound) {
        info!(target: "Demo", "{}: looping {sound:?}", self.identity);
    }
    fn stop_looping_sound(&self) -> bool {
        false
    }
    fn play_sound(&self, sound: Sound) -> bool {
        info!(target: "Demo", "{}: playing {sound:?}", self.identity);
        true
    }
    fn show_error_notification(&self, message: &str) {
        warn!(target: "Demo", "{}: error: {message}", self.identity);
    }
    fn show_toast(&self, message: &str) {
        info!(target: "Demo", "{}: {message}", self.identity);
    }
}

/// Engine whose connections come up as soon as both descriptions are set.
struct LoopbackEngine;

#[async_trait]
impl PeerConnectionEngine for LoopbackEngine {
    async fn create_factory(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_connection(
        &self,
        params: PeerConnectionParams,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        Ok(Arc::new(LoopbackConnection {
            call_id: params.call_id,
            observer,
            closed: Mutex::new(false),
        }))
    }
}

struct LoopbackConnection {
    call_id: CallId,
    observer: Arc<dyn PeerConnectionObserver>,
    closed: Mutex<bool>,
}

impl LoopbackConnection {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if *self.closed.lock().expect("Mutex should not be poisoned") {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Report the local description and one host candidate, then bring the
    /// transport up if `connect` is set. Runs in order on one task.
    fn describe(&self, local: SessionDescription, connect: bool) {
        let observer = self.observer.clone();
        let call_id = self.call_id;
        tokio::spawn(async move {
            observer.on_local_description(call_id, local).await;
            observer
                .on_ice_candidate(
                    call_id,
                    IceCandidate::new("candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host")
                        .with_sdp_mid("0")
                        .with_sdp_m_line_index(0),
                )
                .await;
            if connect {
                observer
                    .on_transport_state(call_id, TransportState::Connected)
                    .await;
            }
        });
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.describe(SessionDescription::offer("v=0 loopback offer"), false);
        Ok(())
    }

    async fn create_answer(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.describe(SessionDescription::answer("v=0 loopback answer"), true);
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let observer = self.observer.clone();
        let call_id = self.call_id;
        tokio::spawn(async move {
            observer.on_remote_description_set(call_id).await;
            if sdp.sdp_type == SdpType::Answer {
                observer
                    .on_transport_state(call_id, TransportState::Connected)
                    .await;
            }
        });
        Ok(())
    }

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        info!(target: "Demo", "[{}] remote candidate {}", self.call_id, candidate.candidate);
        Ok(())
    }

    async fn change_outgoing_video_params(&self, profile: VideoProfile) -> Result<(), EngineError> {
        self.ensure_open()?;
        info!(target: "Demo", "[{}] outgoing video now {profile}", self.call_id);
        Ok(())
    }

    async fn start_capturing(&self, _profile: VideoProfile) -> Result<(), EngineError> {
        self.ensure_open()
    }

    async fn stop_capturing(&self) -> Result<(), EngineError> {
        self.ensure_open()
    }

    async fn switch_camera(&self) -> Result<bool, EngineError> {
        self.ensure_open()?;
        Ok(false)
    }

    async fn send_signaling_message(&self, message: PeerSignalingMessage) -> Result<(), EngineError> {
        self.ensure_open()?;
        info!(target: "Demo", "[{}] data channel: {message:?}", self.call_id);
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock().expect("Mutex should not be poisoned") = true;
    }
}
