//! Call-related error types.

use super::state::CallState;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown contact: {0}")]
    UnknownContact(String),

    #[error("message channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("peer connection error: {0}")]
    Engine(#[from] EngineError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("peer connection factory not ready after {0:?}")]
    FactoryTimeout(Duration),

    #[error("a call is already in progress")]
    AlreadyStarted,
}

/// Failure to hand a signaling message to the outbound queue.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("message queue closed")]
    Closed,

    #[error("enqueue failed: {0}")]
    Enqueue(String),
}

/// Failure reported by the peer-connection engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The peer connection went away while the operation was in flight.
    #[error("peer connection closed")]
    Closed,

    #[error("factory creation failed: {0}")]
    Factory(String),

    #[error("{0}")]
    Operation(String),
}
