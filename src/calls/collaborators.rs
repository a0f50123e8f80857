//! Interfaces of everything the call core drives but does not implement.
//!
//! The host process wires concrete implementations into [`CallServices`]
//! and the [`PeerConnectionEngine`]; the coordinator and the session driver
//! only ever talk to these traits.

use super::error::{ChannelError, EngineError};
use super::signaling::{OutgoingMessage, SessionDescription};
use super::transport::IceCandidate;
use super::video_quality::VideoProfile;
use super::video_state::StatsReport;
use crate::types::call::CallId;
use async_trait::async_trait;
use std::sync::Arc;

/// Outbound queue for signaling messages.
///
/// Enqueueing is fire-and-forget: delivery happens later and is never
/// awaited by the caller.
pub trait MessageChannel: Send + Sync {
    fn enqueue(&self, to_identity: &str, message: OutgoingMessage) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationLevel {
    Unverified,
    ServerVerified,
    FullyVerified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub identity: String,
    pub display_name: String,
    pub verification_level: VerificationLevel,
    /// Feature bit advertised by the contact's client.
    pub supports_video: bool,
}

impl Contact {
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            display_name: identity.clone(),
            identity,
            verification_level: VerificationLevel::ServerVerified,
            supports_video: true,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_verification_level(mut self, level: VerificationLevel) -> Self {
        self.verification_level = level;
        self
    }

    pub fn with_video_support(mut self, supported: bool) -> Self {
        self.supports_video = supported;
        self
    }
}

pub trait ContactDirectory: Send + Sync {
    fn get(&self, identity: &str) -> Option<Contact>;
}

/// Device and account conditions consulted while admitting calls.
pub trait DeviceStatus: Send + Sync {
    /// A cellular (non-app) call is in progress.
    fn is_native_call_ongoing(&self) -> bool;
    /// The contact currently falls into a do-not-disturb window.
    fn is_off_hours(&self, identity: &str) -> bool;
    fn has_valid_credentials(&self) -> bool;
    fn is_ringtone_muted(&self, identity: &str) -> bool;
    fn is_network_metered(&self) -> bool;
}

/// Persisted call records.
pub trait CallHistory: Send + Sync {
    /// Whether one of the last `lookback` call records with `identity`
    /// carries `call_id`.
    fn has_call_status(&self, identity: &str, call_id: CallId, lookback: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sound {
    /// Played to the caller while the callee rings.
    Ringback,
    Busy,
    Pickup,
    Problem,
    Hangup,
}

/// Notification and audio surface. Every method expresses intent only.
pub trait CallFrontEnd: Send + Sync {
    fn show_incoming_call(&self, contact: &Contact, call_id: CallId, video: bool);
    fn cancel_incoming_call(&self, identity: &str);
    fn start_ringtone(&self, identity: &str, muted: bool);
    fn stop_ringtone(&self);
    fn register_media_button(&self);
    fn unregister_media_button(&self);
    fn show_in_call(&self, contact: &Contact, call_id: CallId);
    fn cancel_in_call(&self);
    fn start_looping_sound(&self, sound: Sound);
    /// Returns whether a looping sound was playing.
    fn stop_looping_sound(&self) -> bool;
    fn play_sound(&self, sound: Sound) -> bool;
    fn show_error_notification(&self, message: &str);
    fn show_toast(&self, message: &str);
}

/// Collaborators shared by the coordinator and the session driver.
#[derive(Clone)]
pub struct CallServices {
    pub channel: Arc<dyn MessageChannel>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub device: Arc<dyn DeviceStatus>,
    pub history: Arc<dyn CallHistory>,
    pub front_end: Arc<dyn CallFrontEnd>,
}

impl std::fmt::Debug for CallServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallServices").finish_non_exhaustive()
    }
}

/// Construction parameters for one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionParams {
    pub call_id: CallId,
    pub is_initiator: bool,
    pub video_enabled: bool,
    /// Relay all media, hiding the local address from the peer.
    pub force_turn: bool,
    pub allow_ipv6: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Checking,
    Connected,
    Disconnected,
    Failed,
}

/// In-call messages exchanged over the peer connection's data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSignalingMessage {
    CaptureState { camera_on: bool },
    VideoQualityProfile(VideoProfile),
}

#[async_trait]
pub trait PeerConnectionEngine: Send + Sync {
    /// Prepare codecs and threads. Callers bound this with a timeout.
    async fn create_factory(&self) -> Result<(), EngineError>;

    async fn create_connection(
        &self,
        params: PeerConnectionParams,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

/// One peer connection. Results of SDP operations arrive through the
/// [`PeerConnectionObserver`].
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<(), EngineError>;
    async fn create_answer(&self) -> Result<(), EngineError>;
    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), EngineError>;
    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    async fn change_outgoing_video_params(&self, profile: VideoProfile) -> Result<(), EngineError>;
    async fn start_capturing(&self, profile: VideoProfile) -> Result<(), EngineError>;
    async fn stop_capturing(&self) -> Result<(), EngineError>;
    /// Returns whether the front camera is active afterwards.
    async fn switch_camera(&self) -> Result<bool, EngineError>;
    async fn send_signaling_message(&self, message: PeerSignalingMessage)
    -> Result<(), EngineError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionObserver: Send + Sync {
    async fn on_local_description(&self, call_id: CallId, sdp: SessionDescription);
    async fn on_remote_description_set(&self, call_id: CallId);
    async fn on_ice_candidate(&self, call_id: CallId, candidate: IceCandidate);
    async fn on_transport_state(&self, call_id: CallId, state: TransportState);
    async fn on_peer_connection_closed(&self, call_id: CallId);
    async fn on_error(&self, call_id: CallId, description: String, abort_call: bool);
    async fn on_signaling_message(&self, call_id: CallId, message: PeerSignalingMessage);
    async fn on_stats(&self, call_id: CallId, report: StatsReport);
    /// The local camera produced its first frame.
    async fn on_camera_first_frame(&self);
}
