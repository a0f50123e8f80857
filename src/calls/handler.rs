//! Inbound signaling message handler.

use super::coordinator::CallCoordinator;
use super::error::CallError;
use super::signaling::{IncomingMessage, SignalingType, decode_payload};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Decodes typed signaling payloads and dispatches them to the coordinator.
#[derive(Debug, Clone)]
pub struct SignalingHandler {
    coordinator: Arc<CallCoordinator>,
}

impl SignalingHandler {
    pub fn new(coordinator: Arc<CallCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Handle one decrypted message. Returns `false` if the message type is
    /// not a call message or its payload could not be decoded; everything
    /// else counts as processed, including messages the coordinator ignored.
    pub async fn handle(
        &self,
        from_identity: &str,
        date: DateTime<Utc>,
        type_code: u8,
        payload: &[u8],
    ) -> bool {
        let Some(signaling_type) = SignalingType::from_code(type_code) else {
            debug!(target: "Call/Handler", "Not a call message: type 0x{type_code:02x}");
            return false;
        };
        debug!(target: "Call/Handler", "Received {signaling_type} from {from_identity}");

        let result = match signaling_type {
            SignalingType::CallOffer => match decode(from_identity, date, payload) {
                Ok(msg) => self.coordinator.handle_call_offer(msg).await,
                Err(e) => Err(e),
            },
            SignalingType::CallAnswer => match decode(from_identity, date, payload) {
                Ok(msg) => self.coordinator.handle_call_answer(msg).await,
                Err(e) => Err(e),
            },
            SignalingType::IceCandidates => match decode(from_identity, date, payload) {
                Ok(msg) => self.coordinator.handle_ice_candidates(msg).await,
                Err(e) => Err(e),
            },
            SignalingType::CallHangup => match decode(from_identity, date, payload) {
                Ok(msg) => self.coordinator.handle_remote_call_hangup(msg).await,
                Err(e) => Err(e),
            },
            SignalingType::CallRinging => match decode(from_identity, date, payload) {
                Ok(msg) => self.coordinator.handle_call_ringing(msg).await,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => true,
            Err(e @ CallError::Json(_)) => {
                warn!(target: "Call/Handler", "Failed to parse {signaling_type} from {from_identity}: {e}");
                false
            }
            Err(e) => {
                warn!(target: "Call/Handler", "Failed to handle {signaling_type} from {from_identity}: {e}");
                true
            }
        }
    }
}

fn decode<T: DeserializeOwned>(
    from_identity: &str,
    date: DateTime<Utc>,
    payload: &[u8],
) -> Result<IncomingMessage<T>, CallError> {
    Ok(IncomingMessage {
        from_identity: from_identity.to_string(),
        date,
        data: decode_payload(payload)?,
    })
}
