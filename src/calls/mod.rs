//! One-to-one call signaling.
//!
//! # Architecture
//!
//! - [`SignalingHandler`]: decodes inbound signaling payloads
//! - [`CallCoordinator`]: the call state machine; admits offers, validates
//!   call IDs, buffers early ICE candidates and owns the ring timeout
//! - [`CallSessionDriver`]: owns the peer connection and reacts to engine
//!   callbacks
//! - [`VideoQualityNegotiator`]: local/remote/common video profiles
//!
//! Everything outside this core (message delivery, the media engine,
//! contacts, notifications and sounds) is reached through the traits in
//! [`collaborators`].
//!
//! # Message flow
//!
//! An inbound message goes through the handler to the coordinator, which
//! checks the call ID against the current state. Work that needs a live
//! peer connection is queued to the session driver as a [`SessionInput`].
//! Engine callbacks come back to the driver, which sends outbound messages
//! through the coordinator.

mod candidates;
mod capture;
pub mod collaborators;
mod coordinator;
mod error;
mod handler;
mod recent;
mod session;
mod signaling;
mod state;
mod timer;
mod transport;
mod video_quality;
mod video_state;

pub use candidates::CandidateCache;
pub use capture::Capturer;
pub use collaborators::{
    CallFrontEnd, CallHistory, CallServices, Contact, ContactDirectory, DeviceStatus,
    MessageChannel, PeerConnection, PeerConnectionEngine, PeerConnectionObserver,
    PeerConnectionParams, PeerSignalingMessage, Sound, TransportState, VerificationLevel,
};
pub use coordinator::{CallCoordinator, PendingOffer, SessionInput};
pub use error::{CallError, ChannelError, EngineError};
pub use handler::SignalingHandler;
pub use recent::RecentCallIds;
pub use session::CallSessionDriver;
pub use signaling::{
    CallAnswerData, CallHangupData, CallOfferData, CallRingingData, FeatureList,
    IceCandidatesData, IncomingMessage, OutgoingMessage, SdpData, SdpType, SessionDescription,
    SignalingType, VIDEO_FEATURE, decode_payload,
};
pub use state::{CallState, CallStateCell, CallStateSnapshot};
pub use timer::DeferredTask;
pub use transport::IceCandidate;
pub use video_quality::{
    QualityLink, VideoPreference, VideoProfile, VideoProfiles, VideoQualityNegotiator, VideoTier,
};
pub use video_state::{
    FrameActivity, FrameDetector, RemoteVideoChange, RemoteVideoStateDetector, StatsReport,
    TrackStats,
};
