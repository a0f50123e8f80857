//! Signaling message definitions.
//!
//! Every call message travels as a JSON payload tagged with a one-byte
//! message type. Legacy peers omit `callId`, which decodes as
//! [`CallId::UNSPECIFIED`].

use super::error::CallError;
use super::transport::IceCandidate;
use crate::types::call::{AnswerAction, CallId, RejectReason};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Message type codes for call signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalingType {
    CallOffer = 0x60,
    CallAnswer = 0x61,
    IceCandidates = 0x62,
    CallHangup = 0x63,
    CallRinging = 0x64,
}

impl SignalingType {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x60 => Some(Self::CallOffer),
            0x61 => Some(Self::CallAnswer),
            0x62 => Some(Self::IceCandidates),
            0x63 => Some(Self::CallHangup),
            0x64 => Some(Self::CallRinging),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CallOffer => "call-offer",
            Self::CallAnswer => "call-answer",
            Self::IceCandidates => "call-ice-candidates",
            Self::CallHangup => "call-hangup",
            Self::CallRinging => "call-ringing",
        }
    }
}

impl fmt::Display for SignalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Session description kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "pranswer" => Some(Self::Pranswer),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// A validated session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp)
    }
}

/// Session description as it appears on the wire.
///
/// The type is kept as a string so that an unknown type turns into a
/// rejected offer instead of an undecodable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpData {
    pub sdp_type: String,
    #[serde(default)]
    pub sdp: Option<String>,
}

impl SdpData {
    /// Validate and convert. A rollback carries no SDP body; every other
    /// type requires one.
    pub fn to_session_description(&self) -> Option<SessionDescription> {
        let sdp_type = SdpType::parse(&self.sdp_type)?;
        match (sdp_type, &self.sdp) {
            (SdpType::Rollback, sdp) => Some(SessionDescription::new(
                sdp_type,
                sdp.clone().unwrap_or_default(),
            )),
            (_, Some(sdp)) => Some(SessionDescription::new(sdp_type, sdp.clone())),
            (_, None) => None,
        }
    }
}

impl From<&SessionDescription> for SdpData {
    fn from(sd: &SessionDescription) -> Self {
        Self {
            sdp_type: sd.sdp_type.as_str().to_string(),
            sdp: match sd.sdp_type {
                SdpType::Rollback => None,
                _ => Some(sd.sdp.clone()),
            },
        }
    }
}

pub const VIDEO_FEATURE: &str = "video";

/// Optional capabilities advertised next to an offer or answer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureList(BTreeMap<String, serde_json::Value>);

impl FeatureList {
    pub fn with_video(mut self) -> Self {
        self.0
            .insert(VIDEO_FEATURE.to_string(), serde_json::Value::Null);
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn has_video(&self) -> bool {
        self.has(VIDEO_FEATURE)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOfferData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    #[serde(default)]
    pub offer: Option<SdpData>,
    #[serde(default, skip_serializing_if = "FeatureList::is_empty")]
    pub features: FeatureList,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    #[serde(default)]
    pub action: Option<AnswerAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SdpData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
    #[serde(default, skip_serializing_if = "FeatureList::is_empty")]
    pub features: FeatureList,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatesData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    /// Deprecated removal marker, never acted upon.
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub candidates: Option<Vec<IceCandidate>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRingingData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHangupData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

macro_rules! impl_call_id_or_default {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                pub fn call_id_or_default(&self) -> CallId {
                    self.call_id.unwrap_or_default()
                }
            }
        )*
    };
}

impl_call_id_or_default!(
    CallOfferData,
    CallAnswerData,
    IceCandidatesData,
    CallRingingData,
    CallHangupData,
);

impl CallAnswerData {
    pub fn accept(call_id: CallId, answer: &SessionDescription, features: FeatureList) -> Self {
        Self {
            call_id: Some(call_id),
            action: Some(AnswerAction::Accept),
            answer: Some(SdpData::from(answer)),
            reject_reason: None,
            features,
        }
    }

    pub fn reject(call_id: CallId, reason: RejectReason) -> Self {
        Self {
            call_id: Some(call_id),
            action: Some(AnswerAction::Reject),
            answer: None,
            reject_reason: Some(reason),
            features: FeatureList::default(),
        }
    }
}

/// An inbound message after transport decryption.
#[derive(Debug, Clone)]
pub struct IncomingMessage<T> {
    pub from_identity: String,
    pub date: DateTime<Utc>,
    /// Absent payloads are ignored by every handler.
    pub data: Option<T>,
}

impl<T> IncomingMessage<T> {
    pub fn new(from_identity: impl Into<String>, data: T) -> Self {
        Self {
            from_identity: from_identity.into(),
            date: Utc::now(),
            data: Some(data),
        }
    }

    pub fn empty(from_identity: impl Into<String>) -> Self {
        Self {
            from_identity: from_identity.into(),
            date: Utc::now(),
            data: None,
        }
    }
}

/// A message handed to the outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    Offer(CallOfferData),
    Answer(CallAnswerData),
    IceCandidates(IceCandidatesData),
    Ringing(CallRingingData),
    Hangup(CallHangupData),
}

impl OutgoingMessage {
    pub fn signaling_type(&self) -> SignalingType {
        match self {
            Self::Offer(_) => SignalingType::CallOffer,
            Self::Answer(_) => SignalingType::CallAnswer,
            Self::IceCandidates(_) => SignalingType::IceCandidates,
            Self::Ringing(_) => SignalingType::CallRinging,
            Self::Hangup(_) => SignalingType::CallHangup,
        }
    }

    pub fn call_id(&self) -> CallId {
        match self {
            Self::Offer(d) => d.call_id_or_default(),
            Self::Answer(d) => d.call_id_or_default(),
            Self::IceCandidates(d) => d.call_id_or_default(),
            Self::Ringing(d) => d.call_id_or_default(),
            Self::Hangup(d) => d.call_id_or_default(),
        }
    }

    /// Encode the JSON body that follows the type byte on the wire.
    pub fn to_payload(&self) -> Result<Vec<u8>, CallError> {
        let body = match self {
            Self::Offer(d) => serde_json::to_vec(d)?,
            Self::Answer(d) => serde_json::to_vec(d)?,
            Self::IceCandidates(d) => serde_json::to_vec(d)?,
            Self::Ringing(d) => serde_json::to_vec(d)?,
            Self::Hangup(d) => serde_json::to_vec(d)?,
        };
        Ok(body)
    }
}

/// Decode a JSON body. An empty body or a literal `null` yields `None`.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<Option<T>, CallError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(serde_json::from_slice::<Option<T>>(payload)?)
}
