//! Call session driver.
//!
//! Owns the peer connection of the current call. Consumes the
//! [`SessionInput`] queue of the coordinator, drives the engine and reacts
//! to its callbacks as the connection's [`PeerConnectionObserver`].

use super::capture::Capturer;
use super::collaborators::{
    CallServices, Contact, PeerConnection, PeerConnectionEngine, PeerConnectionObserver,
    PeerConnectionParams, PeerSignalingMessage, Sound, TransportState, VerificationLevel,
};
use super::coordinator::{CallCoordinator, SessionInput};
use super::error::{CallError, EngineError};
use super::signaling::{CallAnswerData, IceCandidatesData, SdpData, SdpType, SessionDescription};
use super::timer::DeferredTask;
use super::transport::IceCandidate;
use super::video_quality::{QualityLink, VideoPreference, VideoQualityNegotiator};
use super::video_state::{FrameActivity, FrameDetector, RemoteVideoChange, RemoteVideoStateDetector, StatsReport};
use crate::config::CallConfig;
use crate::types::call::{AnswerAction, CallId, RejectReason};
use crate::types::events::{CallEvent, CallEventBus, SessionEvent};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug, Default)]
struct SessionState {
    call_id: CallId,
    contact: Option<Contact>,
    is_initiator: bool,
    video_enabled: bool,
    /// Start the camera as soon as the callee rings.
    launch_video: bool,
    ice_connected: bool,
    ice_was_connected: bool,
    is_error: bool,
    active: bool,
    /// Remote candidates that arrived before the peer connection existed.
    pending_candidates: Vec<IceCandidate>,
    problem_sound: Option<DeferredTask>,
    busy_disconnect: Option<DeferredTask>,
    last_stats: Option<StatsReport>,
}

impl SessionState {
    fn identity(&self) -> Option<String> {
        self.contact.as_ref().map(|c| c.identity.clone())
    }

    fn accepts_call_id(&self, call_id: CallId) -> bool {
        call_id == self.call_id || (self.is_initiator && call_id.is_unspecified())
    }
}

pub struct CallSessionDriver {
    config: Arc<CallConfig>,
    coordinator: Arc<CallCoordinator>,
    services: CallServices,
    engine: Arc<dyn PeerConnectionEngine>,
    events: Arc<CallEventBus>,
    quality: VideoQualityNegotiator,
    capturer: Capturer,
    connection: std::sync::Mutex<Option<Arc<dyn PeerConnection>>>,
    session: Mutex<SessionState>,
    frame_detector: std::sync::Mutex<FrameDetector>,
    remote_video: std::sync::Mutex<RemoteVideoStateDetector>,
    shutdown: Notify,
    me: Weak<Self>,
}

impl std::fmt::Debug for CallSessionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionDriver")
            .field("coordinator", &self.coordinator)
            .field("quality", &self.quality)
            .finish_non_exhaustive()
    }
}

impl CallSessionDriver {
    pub fn new(
        config: Arc<CallConfig>,
        coordinator: Arc<CallCoordinator>,
        services: CallServices,
        engine: Arc<dyn PeerConnectionEngine>,
        events: Arc<CallEventBus>,
    ) -> Arc<Self> {
        let quality =
            VideoQualityNegotiator::new(config.video_preference, config.video_hardware_acceleration);
        let frame_detector = FrameDetector::new(config.frame_stop_threshold);
        Arc::new_cyclic(|me| Self {
            config,
            coordinator,
            services,
            engine,
            events,
            quality,
            capturer: Capturer::new(),
            connection: std::sync::Mutex::new(None),
            session: Mutex::new(SessionState::default()),
            frame_detector: std::sync::Mutex::new(frame_detector),
            remote_video: std::sync::Mutex::new(RemoteVideoStateDetector::new()),
            shutdown: Notify::new(),
            me: me.clone(),
        })
    }

    /// Process coordinator inputs until [`CallSessionDriver::shutdown`] is
    /// called or the coordinator goes away.
    pub async fn run(self: Arc<Self>) {
        let Some(mut inputs) = self.coordinator.take_session_inputs() else {
            error!(target: "Call/Session", "Session inputs already taken, driver not started");
            return;
        };
        info!(target: "Call/Session", "Session driver started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(target: "Call/Session", "Session driver shutting down");
                    break;
                }
                input = inputs.recv() => match input {
                    Some(input) => self.handle_session_input(input).await,
                    None => break,
                },
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn handle_session_input(&self, input: SessionInput) {
        match input {
            SessionInput::Candidates { identity, data } => {
                self.on_remote_candidates(&identity, data).await
            }
            SessionInput::Answer { identity, data } => self.on_answer(&identity, data).await,
            SessionInput::PeerRinging { identity, call_id } => {
                self.on_peer_ringing(&identity, call_id).await
            }
            SessionInput::RemoteHangup { identity, call_id } => {
                self.on_remote_hangup(&identity, call_id).await
            }
        }
    }

    fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    fn set_connection(&self, connection: Option<Arc<dyn PeerConnection>>) -> Option<Arc<dyn PeerConnection>> {
        std::mem::replace(
            &mut *self.connection.lock().expect("Mutex should not be poisoned"),
            connection,
        )
    }

    fn quality_link(&self) -> Option<QualityLink<'_>> {
        self.connection().map(|connection| QualityLink {
            connection,
            capturer: &self.capturer,
            calling: self.coordinator.call_state().state.is_calling(),
        })
    }

    async fn is_current(&self, call_id: CallId) -> bool {
        let session = self.session.lock().await;
        session.active && session.call_id == call_id
    }

    // --- operator actions ---

    /// Place a call to `identity`. Returns the generated call id.
    pub async fn start_outgoing_call(&self, identity: &str, video: bool) -> Result<CallId, CallError> {
        let state = self.coordinator.call_state().state;
        if !state.is_idle() {
            return Err(CallError::AlreadyStarted);
        }
        let call_id = CallId::generate();
        info!(target: "Call/Session", "[{call_id}] Starting outgoing call to {identity} (video={video})");
        self.handle_new_call(identity.to_string(), call_id, true, video)
            .await?;
        Ok(call_id)
    }

    /// Accept the ringing call.
    pub async fn accept_call(&self, call_id: CallId) -> Result<(), CallError> {
        let identity = self.coordinator.accept_call(call_id).await?;
        self.handle_new_call(identity, call_id, false, true).await
    }

    pub async fn reject_call(&self, call_id: CallId) -> Result<(), CallError> {
        self.coordinator
            .reject_call(call_id, RejectReason::Rejected)
            .await
    }

    /// End the current call from the local side.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let (call_id, identity) = {
            let session = self.session.lock().await;
            if !session.active {
                debug!(target: "Call/Session", "Hang up without an active session");
                return Ok(());
            }
            (session.call_id, session.identity())
        };
        let current = self.coordinator.call_state();
        let connecting = current.call_id == call_id
            && (current.state.is_initializing() || current.state.is_calling());
        if let (true, Some(identity)) = (connecting, identity) {
            if let Err(e) = self.coordinator.send_call_hangup(&identity, call_id).await {
                warn!(target: "Call/Session", "[{call_id}] Could not send hangup: {e}");
            }
        }
        self.disconnect(None).await;
        Ok(())
    }

    /// Set up the session for a call that was just accepted or started.
    pub async fn handle_new_call(
        &self,
        identity: String,
        call_id: CallId,
        is_initiator: bool,
        video: bool,
    ) -> Result<(), CallError> {
        if self.coordinator.call_state().state.is_calling() {
            warn!(target: "Call/Session", "[{call_id}] Call already in progress, ignoring new call");
            return Err(CallError::AlreadyStarted);
        }

        self.coordinator.set_initiator(is_initiator).await;
        if !is_initiator {
            self.coordinator.cancel_call_notifications_for_new_call().await;
        }
        {
            let mut session = self.session.lock().await;
            *session = SessionState {
                call_id,
                is_initiator,
                launch_video: is_initiator && video,
                active: true,
                ..SessionState::default()
            };
        }

        let Some(contact) = self.services.contacts.get(&identity) else {
            self.abort_call(&format!("Contact {identity} not found"), false)
                .await;
            return Err(CallError::UnknownContact(identity));
        };
        self.session.lock().await.contact = Some(contact.clone());
        self.coordinator.set_state_initializing(call_id).await;

        let remote_offer = if is_initiator {
            None
        } else {
            let offer = self.coordinator.call_offer(call_id).await;
            let described = offer.as_ref().and_then(|o| {
                o.data
                    .offer
                    .as_ref()
                    .and_then(SdpData::to_session_description)
                    .map(|sd| (sd, o.data.features.has_video()))
            });
            match described {
                Some(described) => Some(described),
                None => {
                    self.abort_call("Call offer not found", true).await;
                    return Err(CallError::InvalidArgument(format!("no offer for call {call_id}")));
                }
            }
        };

        let video_enabled = self.config.video_calls_enabled
            && contact.supports_video
            && remote_offer.as_ref().map_or(video, |(_, offered)| *offered);
        let force_turn =
            contact.verification_level == VerificationLevel::Unverified || self.config.force_turn;
        info!(
            target: "Call/Session",
            "[{call_id}] New call with {identity}: initiator={is_initiator} video={video_enabled} force_turn={force_turn}"
        );

        match tokio::time::timeout(self.config.factory_timeout, self.engine.create_factory()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.abort_call(&format!("Could not create peer connection factory: {e}"), true)
                    .await;
                return Err(e.into());
            }
            Err(_) => {
                self.abort_call("Timeout while creating peer connection factory", true)
                    .await;
                return Err(CallError::FactoryTimeout(self.config.factory_timeout));
            }
        }

        let params = PeerConnectionParams {
            call_id,
            is_initiator,
            video_enabled,
            force_turn,
            allow_ipv6: self.config.allow_ipv6,
        };
        self.start_call(&contact, params, remote_offer.map(|(sd, _)| sd))
            .await
    }

    async fn start_call(
        &self,
        contact: &Contact,
        params: PeerConnectionParams,
        remote_offer: Option<SessionDescription>,
    ) -> Result<(), CallError> {
        let call_id = params.call_id;
        let is_initiator = params.is_initiator;
        let video_enabled = params.video_enabled;
        self.services.front_end.show_in_call(contact, call_id);

        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        let observer: Arc<dyn PeerConnectionObserver> = me;
        let connection = match self.engine.create_connection(params, observer).await {
            Ok(connection) => connection,
            Err(e) => {
                self.abort_call(&format!("Could not create peer connection: {e}"), true)
                    .await;
                return Err(e.into());
            }
        };

        {
            let mut session = self.session.lock().await;
            if !session.active || session.call_id != call_id {
                drop(session);
                info!(target: "Call/Session", "[{call_id}] Call ended during setup, closing connection");
                connection.close().await;
                return Ok(());
            }
            session.video_enabled = video_enabled;
            self.set_connection(Some(connection.clone()));
            let pending = std::mem::take(&mut session.pending_candidates);
            if !pending.is_empty() {
                debug!(target: "Call/Session", "[{call_id}] Adding {} pending remote candidates", pending.len());
            }
            for candidate in pending {
                if let Err(e) = connection.add_remote_ice_candidate(candidate).await {
                    warn!(target: "Call/Session", "[{call_id}] Could not add remote candidate: {e}");
                }
            }
        }

        self.update_own_video_quality_profile().await;

        let result = match remote_offer {
            None => connection.create_offer().await,
            Some(offer) => connection.set_remote_description(offer).await,
        };
        if let Err(e) = result {
            self.abort_call(&format!("Could not start call: {e}"), true)
                .await;
            return Err(e.into());
        }
        debug!(target: "Call/Session", "[{call_id}] Call started (initiator={is_initiator})");
        Ok(())
    }

    // --- coordinator inputs ---

    async fn on_remote_candidates(&self, identity: &str, data: IceCandidatesData) {
        let call_id = data.call_id_or_default();
        let mut session = self.session.lock().await;
        if !session.active {
            debug!(target: "Call/Session", "[{call_id}] Remote candidates without an active session, ignoring");
            return;
        }
        if session.contact.as_ref().is_some_and(|c| c.identity != identity) {
            warn!(target: "Call/Session", "[{call_id}] Remote candidates from {identity} for another call, ignoring");
            return;
        }
        if !session.accepts_call_id(call_id) {
            warn!(
                target: "Call/Session",
                "[{call_id}] Remote candidates for a foreign call (local={}), ignoring",
                session.call_id
            );
            return;
        }

        let allow_ipv6 = self.config.allow_ipv6;
        let candidates: Vec<IceCandidate> = data
            .candidates
            .unwrap_or_default()
            .into_iter()
            .filter(|candidate| {
                let keep = allow_ipv6 || !candidate.is_ipv6();
                if !keep {
                    debug!(target: "Call/Session", "Ignoring IPv6 candidate: {}", candidate.candidate);
                }
                keep
            })
            .collect();

        match self.connection() {
            None => session.pending_candidates.extend(candidates),
            Some(connection) => {
                for candidate in candidates {
                    if let Err(e) = connection.add_remote_ice_candidate(candidate).await {
                        warn!(target: "Call/Session", "[{call_id}] Could not add remote candidate: {e}");
                    }
                }
            }
        }
    }

    async fn on_answer(&self, identity: &str, data: CallAnswerData) {
        let mut session = self.session.lock().await;
        let call_id = session.call_id;
        if !session.active || !session.is_initiator {
            debug!(target: "Call/Session", "[{call_id}] Answer from {identity} without an outgoing call, ignoring");
            return;
        }

        match data.action {
            Some(AnswerAction::Reject) => {
                drop(session);
                let reason = data.reject_reason.unwrap_or(RejectReason::Unknown);
                self.on_call_rejected(call_id, reason).await;
            }
            Some(AnswerAction::Accept) => {
                if session.video_enabled && !data.features.has_video() {
                    info!(target: "Call/Session", "[{call_id}] Peer does not support video, disabling");
                    session.video_enabled = false;
                    self.events
                        .emit_session(SessionEvent::VideoDisabled { call_id });
                }
                drop(session);
                let answer = data
                    .answer
                    .as_ref()
                    .and_then(SdpData::to_session_description)
                    .filter(|sd| matches!(sd.sdp_type, SdpType::Answer | SdpType::Pranswer));
                let Some(answer) = answer else {
                    self.abort_call("Invalid call answer received", true)
                        .await;
                    return;
                };
                let Some(connection) = self.connection() else {
                    warn!(target: "Call/Session", "[{call_id}] Answer arrived before the peer connection");
                    return;
                };
                if let Err(e) = connection.set_remote_description(answer).await {
                    self.abort_call(&format!("Could not set remote description: {e}"), true)
                        .await;
                }
            }
            None => {}
        }
    }

    /// The callee declined: play the busy tone, then tear down.
    async fn on_call_rejected(&self, call_id: CallId, reason: RejectReason) {
        info!(target: "Call/Session", "[{call_id}] Call rejected by peer ({reason})");
        let front_end = &self.services.front_end;
        front_end.stop_looping_sound();
        self.pre_disconnect(call_id).await;
        front_end.play_sound(Sound::Busy);

        let me = self.me.clone();
        let task = DeferredTask::after(self.config.busy_disconnect_delay, async move {
            if let Some(driver) = me.upgrade() {
                if driver.is_current(call_id).await {
                    driver.disconnect(None).await;
                }
            }
        });
        self.session.lock().await.busy_disconnect = Some(task);
    }

    async fn on_peer_ringing(&self, identity: &str, call_id: CallId) {
        let launch_video = {
            let session = self.session.lock().await;
            if !session.active || !session.is_initiator || !session.accepts_call_id(call_id) {
                debug!(target: "Call/Session", "[{call_id}] Ringing from {identity} without an outgoing call, ignoring");
                return;
            }
            session.launch_video && session.video_enabled
        };
        info!(target: "Call/Session", "[{call_id}] Peer {identity} is ringing");
        self.services.front_end.start_looping_sound(Sound::Ringback);
        self.events
            .emit_session(SessionEvent::PeerRinging { call_id });
        if launch_video {
            if let Err(e) = self.start_capturing().await {
                warn!(target: "Call/Video", "[{call_id}] Could not start video: {e}");
            }
        }
    }

    async fn on_remote_hangup(&self, identity: &str, call_id: CallId) {
        {
            let session = self.session.lock().await;
            if !session.active || !session.accepts_call_id(call_id) {
                debug!(target: "Call/Session", "[{call_id}] Hangup from {identity} without a matching session");
                return;
            }
        }
        info!(target: "Call/Session", "[{call_id}] Remote hangup from {identity}");
        self.disconnect(None).await;
    }

    // --- transport ---

    async fn on_ice_connected(&self, call_id: CallId) {
        let first = !self.session.lock().await.ice_was_connected;
        // a remote hangup or a newer call may own the slot by now
        if first && !self.coordinator.set_state_calling_if(call_id).await {
            info!(target: "Call/Session", "[{call_id}] Connected, but the call is no longer current");
            return;
        }
        let (identity, outgoing) = {
            let mut session = self.session.lock().await;
            session.ice_connected = true;
            session.ice_was_connected = true;
            if let Some(task) = session.problem_sound.take() {
                task.cancel();
            }
            (session.identity(), session.is_initiator)
        };
        let front_end = &self.services.front_end;

        if first {
            info!(target: "Call/Session", "[{call_id}] Call connected");
            front_end.stop_looping_sound();
            front_end.play_sound(Sound::Pickup);
            self.events
                .emit_session(SessionEvent::Connected { call_id });
            if let Some(identity) = identity {
                self.events.emit_call(CallEvent::Started {
                    call_id,
                    identity,
                    outgoing,
                });
            }
            if let Some(connection) = self.connection() {
                if let Err(e) = self.quality.announce_local_profile(connection.as_ref()).await {
                    warn!(target: "Call/Quality", "[{call_id}] Could not send video profile: {e}");
                }
            }
        } else {
            info!(target: "Call/Session", "[{call_id}] Call reconnected");
            if front_end.stop_looping_sound() {
                front_end.play_sound(Sound::Pickup);
            }
            self.events
                .emit_session(SessionEvent::Reconnected { call_id });
        }
    }

    async fn on_ice_disconnected(&self, call_id: CallId) {
        let mut session = self.session.lock().await;
        session.ice_connected = false;
        info!(target: "Call/Session", "[{call_id}] Transport disconnected, reconnecting");
        self.events
            .emit_session(SessionEvent::Reconnecting { call_id });

        let me = self.me.clone();
        session.problem_sound = Some(DeferredTask::after(
            self.config.problem_sound_delay,
            async move {
                if let Some(driver) = me.upgrade() {
                    driver.on_problem_sound_due(call_id).await;
                }
            },
        ));
    }

    async fn on_problem_sound_due(&self, call_id: CallId) {
        let mut session = self.session.lock().await;
        // we are running inside this task
        if let Some(task) = session.problem_sound.take() {
            task.detach();
        }
        if session.active && session.call_id == call_id && !session.ice_connected {
            self.services.front_end.start_looping_sound(Sound::Problem);
        }
    }

    async fn on_ice_failed(&self, call_id: CallId) {
        let (was_connected, identity) = {
            let session = self.session.lock().await;
            (session.ice_was_connected, session.identity())
        };
        if was_connected {
            warn!(target: "Call/Session", "[{call_id}] Transport failed after connecting");
            self.disconnect(Some("Connection lost")).await;
            return;
        }

        warn!(target: "Call/Session", "[{call_id}] Transport failed before connecting");
        self.events
            .emit_session(SessionEvent::ConnectingFailed { call_id });
        if let Some(identity) = identity {
            if let Err(e) = self.coordinator.send_call_hangup(&identity, call_id).await {
                warn!(target: "Call/Session", "[{call_id}] Could not send hangup: {e}");
            }
        }
        self.services.front_end.play_sound(Sound::Problem);
        self.disconnect(Some("Could not establish connection")).await;
    }

    // --- teardown ---

    async fn pre_disconnect(&self, call_id: CallId) {
        self.coordinator.set_state_disconnecting_if(call_id).await;
        self.events
            .emit_session(SessionEvent::PreDisconnect { call_id });
    }

    /// Tear the session down. A second call is a no-op.
    pub async fn disconnect(&self, message: Option<&str>) {
        let (call_id, identity, outgoing, was_connected, is_error) = {
            let mut session = self.session.lock().await;
            if !session.active {
                debug!(target: "Call/Session", "Already disconnected");
                return;
            }
            session.active = false;
            if let Some(task) = session.problem_sound.take() {
                task.cancel();
            }
            if let Some(task) = session.busy_disconnect.take() {
                task.detach();
            }
            session.pending_candidates.clear();
            session.ice_connected = false;
            (
                session.call_id,
                session.identity(),
                session.is_initiator,
                session.ice_was_connected,
                session.is_error,
            )
        };
        info!(target: "Call/Session", "[{call_id}] Disconnecting");

        let current = self.coordinator.call_state();
        if current.state.is_calling() && current.call_id == call_id {
            if let (Some(duration), Some(identity)) =
                (self.coordinator.call_duration().await, identity)
            {
                self.events.emit_call(CallEvent::Finished {
                    call_id,
                    identity,
                    outgoing,
                    duration,
                });
            }
        }
        self.pre_disconnect(call_id).await;

        if let Some(connection) = self.set_connection(None) {
            connection.close().await;
        }
        self.frame_detector
            .lock()
            .expect("Mutex should not be poisoned")
            .reset();
        self.remote_video
            .lock()
            .expect("Mutex should not be poisoned")
            .reset();
        self.capturer.reset().await;
        self.quality.reset().await;

        let front_end = &self.services.front_end;
        front_end.stop_looping_sound();
        front_end.cancel_in_call();
        self.coordinator.set_state_idle_if(call_id).await;

        if was_connected && !is_error {
            self.events
                .emit_session(SessionEvent::Disconnected { call_id });
        } else {
            self.events
                .emit_session(SessionEvent::Cancelled { call_id });
        }
        let toast = match message {
            Some(message) => format!("Call finished: {message}"),
            None => "Call finished".to_string(),
        };
        front_end.show_toast(&toast);
    }

    /// End the call because of an error. The error notification is shown
    /// at most once per call.
    pub async fn abort_call(&self, message: &str, show_notification: bool) {
        error!(target: "Call/Session", "Aborting call: {message}");
        let first_error = {
            let mut session = self.session.lock().await;
            !std::mem::replace(&mut session.is_error, true)
        };
        if show_notification && first_error {
            self.services.front_end.show_error_notification(message);
        }
        self.disconnect(Some(message)).await;
    }

    // --- video ---

    pub async fn start_capturing(&self) -> Result<(), CallError> {
        let Some(connection) = self.connection() else {
            return Err(CallError::InvalidState {
                operation: "start capturing",
                state: self.coordinator.call_state().state,
            });
        };
        self.quality
            .start_capturing(connection.as_ref(), &self.capturer)
            .await?;
        self.send_capture_state(connection.as_ref(), true).await?;
        self.events.emit_session(SessionEvent::OutgoingVideoStarted);
        Ok(())
    }

    pub async fn stop_capturing(&self) -> Result<(), CallError> {
        let Some(connection) = self.connection() else {
            return Err(CallError::InvalidState {
                operation: "stop capturing",
                state: self.coordinator.call_state().state,
            });
        };
        self.capturer.stop(connection.as_ref()).await?;
        self.send_capture_state(connection.as_ref(), false).await?;
        self.events.emit_session(SessionEvent::OutgoingVideoStopped);
        Ok(())
    }

    async fn send_capture_state(&self, connection: &dyn PeerConnection, camera_on: bool) -> Result<(), EngineError> {
        match connection
            .send_signaling_message(PeerSignalingMessage::CaptureState { camera_on })
            .await
        {
            Err(EngineError::Closed) => Ok(()),
            other => other,
        }
    }

    /// Returns the new camera facing, or `None` if nothing was switched.
    pub async fn switch_camera(&self) -> Result<Option<bool>, CallError> {
        let Some(connection) = self.connection() else {
            return Ok(None);
        };
        let front_facing = self.capturer.switch_camera(connection.as_ref()).await?;
        if let Some(front_facing) = front_facing {
            self.events
                .emit_session(SessionEvent::CameraChanged { front_facing });
        }
        Ok(front_facing)
    }

    pub async fn is_capturing(&self) -> bool {
        self.capturer.is_capturing().await
    }

    pub async fn set_video_preference(&self, preference: VideoPreference) {
        self.quality.set_preference(preference);
        self.update_own_video_quality_profile().await;
    }

    /// Re-evaluate the local profile after the network changed.
    pub async fn on_network_changed(&self) {
        self.update_own_video_quality_profile().await;
    }

    async fn update_own_video_quality_profile(&self) {
        let metered = self.services.device.is_network_metered();
        let relayed = self.quality.is_relayed().await;
        if let Err(e) = self
            .quality
            .update_own_profile(metered, relayed, self.quality_link())
            .await
        {
            warn!(target: "Call/Quality", "Could not update own video profile: {e}");
        }
    }

    pub fn video_quality(&self) -> &VideoQualityNegotiator {
        &self.quality
    }

    fn apply_remote_video(&self, change: Option<RemoteVideoChange>) {
        match change {
            Some(RemoteVideoChange::Started) => {
                self.events.emit_session(SessionEvent::IncomingVideoStarted)
            }
            Some(RemoteVideoChange::Stopped) => {
                self.events.emit_session(SessionEvent::IncomingVideoStopped)
            }
            None => {}
        }
    }

    /// Summary of the current session for the debug overlay. The video
    /// profile section is left out if the quality lock is busy.
    pub async fn debug_info(&self) -> String {
        let mut info = {
            let session = self.session.lock().await;
            let mut info = format!(
                "callId={} state={} initiator={} ice={} video={}",
                session.call_id,
                self.coordinator.call_state().state,
                session.is_initiator,
                session.ice_connected,
                session.video_enabled
            );
            if let Some(stats) = &session.last_stats {
                info.push('\n');
                info.push_str(&stats.summary);
            }
            info
        };
        if let Some(profiles) = self
            .quality
            .try_describe(self.config.stats_lock_timeout)
            .await
        {
            info.push_str(&profiles);
        }
        info
    }
}

#[async_trait]
impl PeerConnectionObserver for CallSessionDriver {
    async fn on_local_description(&self, call_id: CallId, sdp: SessionDescription) {
        let (identity, is_initiator, video) = {
            let session = self.session.lock().await;
            if !session.active || session.call_id != call_id {
                return;
            }
            (session.identity(), session.is_initiator, session.video_enabled)
        };
        let Some(identity) = identity else {
            return;
        };
        let result = if is_initiator {
            self.coordinator
                .send_call_offer(&identity, call_id, &sdp, video)
                .await
        } else {
            self.coordinator
                .send_accept_call_answer(&identity, call_id, &sdp, video)
                .await
        };
        if let Err(e) = result {
            self.abort_call(&format!("Could not send local description: {e}"), true)
                .await;
        }
    }

    async fn on_remote_description_set(&self, call_id: CallId) {
        let is_initiator = {
            let session = self.session.lock().await;
            if !session.active || session.call_id != call_id {
                return;
            }
            session.is_initiator
        };
        debug!(target: "Call/Session", "[{call_id}] Remote description set");
        if is_initiator {
            return;
        }
        let Some(connection) = self.connection() else {
            return;
        };
        if let Err(e) = connection.create_answer().await {
            self.abort_call(&format!("Could not create answer: {e}"), true)
                .await;
        }
    }

    async fn on_ice_candidate(&self, call_id: CallId, candidate: IceCandidate) {
        let identity = {
            let session = self.session.lock().await;
            if !session.active || session.call_id != call_id {
                return;
            }
            session.identity()
        };
        let Some(identity) = identity else {
            return;
        };
        if let Err(e) = self
            .coordinator
            .send_ice_candidates(&identity, call_id, vec![candidate])
            .await
        {
            warn!(target: "Call/Session", "[{call_id}] Could not send local candidate: {e}");
        }
    }

    async fn on_transport_state(&self, call_id: CallId, state: TransportState) {
        if !self.is_current(call_id).await {
            return;
        }
        debug!(target: "Call/Session", "[{call_id}] Transport state {state:?}");
        match state {
            TransportState::Checking => {}
            TransportState::Connected => self.on_ice_connected(call_id).await,
            TransportState::Disconnected => self.on_ice_disconnected(call_id).await,
            TransportState::Failed => self.on_ice_failed(call_id).await,
        }
    }

    async fn on_peer_connection_closed(&self, call_id: CallId) {
        if self.is_current(call_id).await {
            info!(target: "Call/Session", "[{call_id}] Peer connection closed");
            self.disconnect(None).await;
        }
    }

    async fn on_error(&self, call_id: CallId, description: String, abort_call: bool) {
        if !self.is_current(call_id).await {
            return;
        }
        if abort_call {
            self.abort_call(&description, true).await;
        } else {
            warn!(target: "Call/Session", "[{call_id}] Peer connection error: {description}");
        }
    }

    async fn on_signaling_message(&self, call_id: CallId, message: PeerSignalingMessage) {
        if !self.is_current(call_id).await {
            return;
        }
        match message {
            PeerSignalingMessage::CaptureState { camera_on } => {
                debug!(target: "Call/Video", "[{call_id}] Peer camera {}", if camera_on { "on" } else { "off" });
                let change = {
                    let mut detector = self
                        .remote_video
                        .lock()
                        .expect("Mutex should not be poisoned");
                    if camera_on {
                        detector.on_capturing_enabled()
                    } else {
                        detector.on_capturing_disabled()
                    }
                };
                self.apply_remote_video(change);
            }
            PeerSignalingMessage::VideoQualityProfile(profile) => {
                if let Err(e) = self
                    .quality
                    .update_peer_profile(profile, self.quality_link())
                    .await
                {
                    warn!(target: "Call/Quality", "[{call_id}] Could not apply peer video profile: {e}");
                }
            }
        }
    }

    async fn on_stats(&self, call_id: CallId, report: StatsReport) {
        if !self.is_current(call_id).await {
            return;
        }
        let metered = self.services.device.is_network_metered();
        match self
            .quality
            .update_relay_state(report.uses_relay, metered, self.quality_link())
            .await
        {
            Ok(true) => info!(target: "Call/Quality", "[{call_id}] Relay state changed to {}", report.uses_relay),
            Ok(false) => {}
            Err(e) => warn!(target: "Call/Quality", "[{call_id}] Could not update relay state: {e}"),
        }

        let activity = self
            .frame_detector
            .lock()
            .expect("Mutex should not be poisoned")
            .on_stats(&report.tracks, Instant::now());
        let change = activity.and_then(|activity| {
            let mut detector = self
                .remote_video
                .lock()
                .expect("Mutex should not be poisoned");
            match activity {
                FrameActivity::Started => detector.on_frames_started(),
                FrameActivity::Stopped => detector.on_frames_stopped(),
            }
        });
        self.apply_remote_video(change);

        self.session.lock().await.last_stats = Some(report);
    }

    async fn on_camera_first_frame(&self) {
        if !self.capturer.resync_on_first_frame().await {
            return;
        }
        // the engine captures although we think it does not
        if let Some(connection) = self.connection() {
            if let Err(e) = self.capturer.stop(connection.as_ref()).await {
                warn!(target: "Call/Video", "Could not stop stray capturing: {e}");
            }
        }
    }
}
