//! Call identifiers and answer codes shared by both peers.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one call attempt end-to-end.
///
/// Zero means "unspecified": legacy peers never attach a call ID, so every
/// message from them decodes to `CallId(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u32);

impl CallId {
    pub const UNSPECIFIED: CallId = CallId(0);

    /// Generate a random, non-zero call ID for a new outgoing call.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        loop {
            let id: u32 = rng.random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for CallId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Reason attached to a rejecting answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum RejectReason {
    Unknown = 0,
    Busy = 1,
    Timeout = 2,
    Rejected = 3,
    Disabled = 4,
    OffHours = 5,
}

impl RejectReason {
    /// Reasons the receiving user should see as a missed call rather than a
    /// deliberate rejection.
    pub fn counts_as_missed(&self) -> bool {
        matches!(self, Self::Busy | Self::Timeout | Self::OffHours)
    }
}

impl TryFrom<u8> for RejectReason {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Busy),
            2 => Ok(Self::Timeout),
            3 => Ok(Self::Rejected),
            4 => Ok(Self::Disabled),
            5 => Ok(Self::OffHours),
            other => Err(format!("unknown reject reason {other}")),
        }
    }
}

impl From<RejectReason> for u8 {
    fn from(reason: RejectReason) -> Self {
        reason as u8
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::Disabled => "disabled",
            Self::OffHours => "off-hours",
        };
        f.write_str(name)
    }
}

/// Action carried by an answer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum AnswerAction {
    Reject = 0,
    Accept = 1,
}

impl TryFrom<u8> for AnswerAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Reject),
            1 => Ok(Self::Accept),
            other => Err(format!("unknown answer action {other}")),
        }
    }
}

impl From<AnswerAction> for u8 {
    fn from(action: AnswerAction) -> Self {
        action as u8
    }
}
