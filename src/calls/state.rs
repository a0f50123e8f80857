//! Call state machine.

use crate::types::call::CallId;
use serde::Serialize;
use std::fmt;
use std::sync::RwLock;

/// Lifecycle state of the single call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum CallState {
    /// No active or pending call.
    #[default]
    Idle,
    /// Incoming offer waiting for the user's decision.
    Ringing,
    /// Call accepted or outgoing call started, peer connection being built.
    Initializing,
    /// Transport established, media flowing.
    Calling,
    /// Teardown in progress.
    Disconnecting,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing)
    }

    pub fn is_initializing(&self) -> bool {
        matches!(self, Self::Initializing)
    }

    pub fn is_calling(&self) -> bool {
        matches!(self, Self::Calling)
    }

    pub fn is_disconnecting(&self) -> bool {
        matches!(self, Self::Disconnecting)
    }

    /// No session exists yet, so remote candidates must be buffered.
    pub fn buffers_candidates(&self) -> bool {
        matches!(self, Self::Idle | Self::Ringing)
    }

    /// A session exists and takes remote candidates directly.
    pub fn forwards_candidates(&self) -> bool {
        matches!(self, Self::Initializing | Self::Calling)
    }

    pub fn can_send_candidates(&self) -> bool {
        matches!(self, Self::Ringing | Self::Initializing | Self::Calling)
    }

    /// The platform media button should be routed to us.
    pub fn wants_media_button(&self) -> bool {
        matches!(self, Self::Ringing | Self::Initializing)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Ringing => "RINGING",
            Self::Initializing => "INITIALIZING",
            Self::Calling => "CALLING",
            Self::Disconnecting => "DISCONNECTING",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable view of the call slot. Replaced as a whole on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallStateSnapshot {
    pub state: CallState,
    pub call_id: CallId,
    /// Number of times the slot entered `Ringing` during this process.
    pub incoming_call_counter: u64,
    pub answer_received: bool,
}

impl CallStateSnapshot {
    /// Compute the snapshot after moving to `to`.
    ///
    /// Returns `None` when the slot already is in `to`, which makes every
    /// transition idempotent.
    pub fn transition(&self, to: CallState, call_id: CallId) -> Option<Self> {
        if self.state == to {
            return None;
        }
        let call_id = if to.is_idle() { CallId::UNSPECIFIED } else { call_id };
        let incoming_call_counter = if to.is_ringing() {
            self.incoming_call_counter + 1
        } else {
            self.incoming_call_counter
        };
        let answer_received = self.answer_received && !to.is_idle() && call_id == self.call_id;
        Some(Self {
            state: to,
            call_id,
            incoming_call_counter,
            answer_received,
        })
    }

    pub fn with_answer_received(self) -> Self {
        Self {
            answer_received: true,
            ..self
        }
    }
}

impl fmt::Display for CallStateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State{{{},id={},counter={}}}",
            self.state, self.call_id, self.incoming_call_counter
        )
    }
}

/// Holder for the current snapshot. Readers never observe a half-applied
/// transition because the snapshot is swapped in one write.
#[derive(Debug, Default)]
pub struct CallStateCell {
    current: RwLock<CallStateSnapshot>,
}

impl CallStateCell {
    pub fn snapshot(&self) -> CallStateSnapshot {
        *self
            .current
            .read()
            .expect("RwLock should not be poisoned")
    }

    pub fn state(&self) -> CallState {
        self.snapshot().state
    }

    pub fn call_id(&self) -> CallId {
        self.snapshot().call_id
    }

    pub(crate) fn replace(&self, next: CallStateSnapshot) -> CallStateSnapshot {
        let mut guard = self
            .current
            .write()
            .expect("RwLock should not be poisoned");
        std::mem::replace(&mut *guard, next)
    }
}
