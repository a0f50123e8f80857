use crate::calls::{CallOfferData, CallAnswerData, CallState};
use crate::types::call::{CallId, RejectReason};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Call history records, one per call outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// An incoming call started ringing locally.
    Ringing { call_id: CallId, identity: String },
    /// Media started flowing.
    Started {
        call_id: CallId,
        identity: String,
        outgoing: bool,
    },
    /// An established call ended.
    Finished {
        call_id: CallId,
        identity: String,
        outgoing: bool,
        duration: Duration,
    },
    /// An incoming call was not (fully) taken.
    Missed {
        call_id: CallId,
        identity: String,
        accepted: bool,
        date: Option<DateTime<Utc>>,
    },
    Rejected {
        call_id: CallId,
        identity: String,
        rejected_locally: bool,
        reason: RejectReason,
    },
    /// An outgoing call was given up before it connected.
    Aborted { call_id: CallId, identity: String },
}

/// Inbound signaling messages that passed validation.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    OfferReceived {
        identity: String,
        offer: CallOfferData,
    },
    AnswerReceived {
        identity: String,
        answer: CallAnswerData,
    },
    RingingReceived { identity: String, call_id: CallId },
    HangupReceived { identity: String, call_id: CallId },
}

/// Session progress, as the call screen would display it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        call_id: CallId,
        from: CallState,
        to: CallState,
    },
    CallAccepted { call_id: CallId },
    PeerRinging { call_id: CallId },
    Connected { call_id: CallId },
    Reconnecting { call_id: CallId },
    Reconnected { call_id: CallId },
    ConnectingFailed { call_id: CallId },
    PreDisconnect { call_id: CallId },
    Disconnected { call_id: CallId },
    Cancelled { call_id: CallId },
    VideoDisabled { call_id: CallId },
    IncomingVideoStarted,
    IncomingVideoStopped,
    OutgoingVideoStarted,
    OutgoingVideoStopped,
    CameraChanged { front_facing: bool },
}

// Macro to generate CallEventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event family.
        #[derive(Debug)]
        pub struct CallEventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl CallEventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (call, Arc<CallEvent>),
    (signaling, Arc<SignalingEvent>),
    (session, Arc<SessionEvent>),
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CallEventBus {
    // A send error only means nobody is subscribed.
    pub(crate) fn emit_call(&self, event: CallEvent) {
        let _ = self.call.send(Arc::new(event));
    }

    pub(crate) fn emit_signaling(&self, event: SignalingEvent) {
        let _ = self.signaling.send(Arc::new(event));
    }

    pub(crate) fn emit_session(&self, event: SessionEvent) {
        let _ = self.session.send(Arc::new(event));
    }
}
