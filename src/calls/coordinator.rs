//! Call signaling coordinator.
//!
//! Owns the call state and the table of pending offers. Every inbound
//! signaling message passes through here first; whatever needs a live peer
//! connection is forwarded to the session driver as a [`SessionInput`].

use super::candidates::CandidateCache;
use super::collaborators::CallServices;
use super::error::CallError;
use super::recent::RecentCallIds;
use super::signaling::{
    CallAnswerData, CallHangupData, CallOfferData, CallRingingData, FeatureList,
    IceCandidatesData, IncomingMessage, OutgoingMessage, SdpData, SdpType, SessionDescription,
};
use super::state::{CallState, CallStateCell, CallStateSnapshot};
use super::timer::DeferredTask;
use super::transport::IceCandidate;
use crate::config::CallConfig;
use crate::types::call::{AnswerAction, CallId, RejectReason};
use crate::types::events::{CallEvent, CallEventBus, SessionEvent, SignalingEvent};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

/// Work handed from the coordinator to the session driver.
#[derive(Debug, Clone)]
pub enum SessionInput {
    Candidates {
        identity: String,
        data: IceCandidatesData,
    },
    Answer {
        identity: String,
        data: CallAnswerData,
    },
    PeerRinging {
        identity: String,
        call_id: CallId,
    },
    RemoteHangup {
        identity: String,
        call_id: CallId,
    },
}

/// An offer kept while its call is ringing or being set up.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub identity: String,
    pub data: CallOfferData,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CoordinatorInner {
    /// `None` until the local side either accepted or started a call.
    initiator: Option<bool>,
    offers: HashMap<CallId, PendingOffer>,
    recent_call_ids: RecentCallIds,
    call_started_at: Option<Instant>,
    ring_timeout: Option<DeferredTask>,
    notification_tags: HashSet<String>,
    peer_ringing: bool,
}

pub struct CallCoordinator {
    config: Arc<CallConfig>,
    services: CallServices,
    events: Arc<CallEventBus>,
    state: CallStateCell,
    inner: Mutex<CoordinatorInner>,
    candidates: CandidateCache,
    timeout_reject: AtomicBool,
    session_tx: mpsc::UnboundedSender<SessionInput>,
    session_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SessionInput>>>,
    me: Weak<Self>,
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("state", &self.state.snapshot())
            .field("timeout_reject", &self.timeout_reject.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CallCoordinator {
    pub fn new(config: Arc<CallConfig>, services: CallServices, events: Arc<CallEventBus>) -> Arc<Self> {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let recent_call_ids = RecentCallIds::new(config.recent_call_ids_capacity);
        Arc::new_cyclic(|me| Self {
            config,
            services,
            events,
            state: CallStateCell::default(),
            inner: Mutex::new(CoordinatorInner {
                initiator: None,
                offers: HashMap::new(),
                recent_call_ids,
                call_started_at: None,
                ring_timeout: None,
                notification_tags: HashSet::new(),
                peer_ringing: false,
            }),
            candidates: CandidateCache::new(),
            timeout_reject: AtomicBool::new(true),
            session_tx,
            session_rx: std::sync::Mutex::new(Some(session_rx)),
            me: me.clone(),
        })
    }

    /// Hand out the receiving end of the session input queue. Only the
    /// first caller gets it.
    pub fn take_session_inputs(&self) -> Option<mpsc::UnboundedReceiver<SessionInput>> {
        self.session_rx
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
    }

    pub fn call_state(&self) -> CallStateSnapshot {
        self.state.snapshot()
    }

    pub fn candidate_cache(&self) -> &CandidateCache {
        &self.candidates
    }

    // --- state transitions ---

    pub async fn set_state_initializing(&self, call_id: CallId) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CallState::Initializing, call_id);
    }

    // The session driver may still act on a call the slot has already
    // left. These only move the slot while it holds `call_id`.

    pub async fn set_state_calling_if(&self, call_id: CallId) -> bool {
        self.transition_if_current(CallState::Calling, call_id).await
    }

    pub async fn set_state_disconnecting_if(&self, call_id: CallId) -> bool {
        self.transition_if_current(CallState::Disconnecting, call_id)
            .await
    }

    pub async fn set_state_idle_if(&self, call_id: CallId) -> bool {
        self.transition_if_current(CallState::Idle, call_id).await
    }

    async fn transition_if_current(&self, to: CallState, call_id: CallId) -> bool {
        let mut inner = self.inner.lock().await;
        let current = self.state.snapshot();
        if current.state.is_idle() || current.call_id != call_id {
            debug!(
                target: "Call/Coordinator",
                "[{call_id}] Not moving to {to}, slot holds {current}"
            );
            return false;
        }
        self.transition(&mut inner, to, call_id);
        true
    }

    /// Returns the previous snapshot, or `None` if the slot already was in `to`.
    fn transition(
        &self,
        inner: &mut CoordinatorInner,
        to: CallState,
        call_id: CallId,
    ) -> Option<CallStateSnapshot> {
        let Some(next) = self.state.snapshot().transition(to, call_id) else {
            debug!(target: "Call/Coordinator", "Call state already {to}, ignoring transition");
            return None;
        };
        let prev = self.state.replace(next);
        self.on_state_change(inner, prev, next);
        Some(prev)
    }

    fn on_state_change(
        &self,
        inner: &mut CoordinatorInner,
        prev: CallStateSnapshot,
        next: CallStateSnapshot,
    ) {
        info!(target: "Call/Coordinator", "Call state change from {prev} to {next}");
        let front_end = &self.services.front_end;

        if prev.state.is_initializing() {
            inner.peer_ringing = false;
        }
        if !next.state.is_ringing() {
            front_end.stop_ringtone();
            if let Some(task) = inner.ring_timeout.take() {
                task.cancel();
            }
        }
        if next.state.wants_media_button() {
            front_end.register_media_button();
        } else if next.state.is_disconnecting() || next.state.is_idle() {
            front_end.unregister_media_button();
        }
        if !prev.call_id.is_unspecified() {
            inner.recent_call_ids.insert(prev.call_id);
        }
        self.enable_timeout_reject();

        match next.state {
            CallState::Initializing => self.flush_candidates(),
            CallState::Calling => inner.call_started_at = Some(Instant::now()),
            CallState::Disconnecting => {
                inner.call_started_at = None;
                self.candidates.clear();
            }
            CallState::Idle => {
                inner.call_started_at = None;
                inner.initiator = None;
                inner.offers.remove(&prev.call_id);
            }
            CallState::Ringing => {}
        }

        let call_id = if next.call_id.is_unspecified() {
            prev.call_id
        } else {
            next.call_id
        };
        self.events.emit_session(SessionEvent::StateChanged {
            call_id,
            from: prev.state,
            to: next.state,
        });
    }

    fn flush_candidates(&self) {
        for (identity, batches) in self.candidates.drain() {
            debug!(
                target: "Call/Coordinator",
                "Replaying {} cached candidate batches from {identity}",
                batches.len()
            );
            for data in batches {
                self.forward(SessionInput::Candidates {
                    identity: identity.clone(),
                    data,
                });
            }
        }
    }

    fn forward(&self, input: SessionInput) {
        if self.session_tx.send(input).is_err() {
            warn!(target: "Call/Coordinator", "Session driver is gone, dropping input");
        }
    }

    // --- inbound messages ---

    pub async fn handle_call_offer(&self, msg: IncomingMessage<CallOfferData>) -> Result<(), CallError> {
        let Some(offer) = msg.data else {
            warn!(target: "Call/Coordinator", "Call offer from {} without data, ignoring", msg.from_identity);
            return Ok(());
        };
        let identity = msg.from_identity;
        let call_id = offer.call_id_or_default();
        info!(target: "Call/Coordinator", "[{call_id}] Call offer received from {identity}");

        let Some(contact) = self.services.contacts.get(&identity) else {
            warn!(target: "Call/Coordinator", "[{call_id}] Call offer from unknown contact {identity}, ignoring");
            return Ok(());
        };

        if !self.config.calls_enabled {
            info!(target: "Call/Coordinator", "[{call_id}] Calls are disabled, rejecting");
            return self.reject_answer(&identity, call_id, RejectReason::Disabled, false);
        }
        if !is_valid_offer(offer.offer.as_ref()) {
            warn!(target: "Call/Coordinator", "[{call_id}] Call offer is invalid, rejecting");
            return self.reject_answer(&identity, call_id, RejectReason::Unknown, false);
        }

        let mut inner = self.inner.lock().await;
        let current = self.state.snapshot();
        if !current.state.is_idle() {
            info!(
                target: "Call/Coordinator",
                "[{call_id}] Busy with call {} ({}), rejecting",
                current.call_id,
                current.state
            );
            return self.reject_answer(&identity, call_id, RejectReason::Busy, true);
        }
        let device = &self.services.device;
        if device.is_native_call_ongoing() {
            info!(target: "Call/Coordinator", "[{call_id}] Native call ongoing, rejecting");
            return self.reject_answer(&identity, call_id, RejectReason::Busy, true);
        }
        if device.is_off_hours(&identity) {
            info!(target: "Call/Coordinator", "[{call_id}] Off hours for {identity}, rejecting");
            return self.reject_answer(&identity, call_id, RejectReason::OffHours, true);
        }
        if !device.has_valid_credentials() {
            warn!(target: "Call/Coordinator", "[{call_id}] No valid credentials, rejecting");
            return self.reject_answer(&identity, call_id, RejectReason::Unknown, true);
        }

        inner.offers.insert(
            call_id,
            PendingOffer {
                identity: identity.clone(),
                data: offer.clone(),
                received_at: msg.date,
            },
        );
        self.transition(&mut inner, CallState::Ringing, call_id);

        let video = self.config.video_calls_enabled && contact.supports_video && offer.features.has_video();
        let front_end = &self.services.front_end;
        inner.notification_tags.insert(identity.clone());
        front_end.show_incoming_call(&contact, call_id, video);
        front_end.start_ringtone(&identity, device.is_ringtone_muted(&identity));

        if let Err(e) = self.enqueue(
            &identity,
            OutgoingMessage::Ringing(CallRingingData {
                call_id: Some(call_id),
            }),
        ) {
            warn!(target: "Call/Coordinator", "[{call_id}] Could not send ringing message: {e}");
        }

        let me = self.me.clone();
        let timeout_identity = identity.clone();
        inner.ring_timeout = Some(DeferredTask::after_wall_clock(
            self.config.ring_timeout,
            async move {
                if let Some(coordinator) = me.upgrade() {
                    coordinator.on_ring_timeout(timeout_identity, call_id).await;
                }
            },
        ));
        drop(inner);

        self.events.emit_signaling(SignalingEvent::OfferReceived {
            identity: identity.clone(),
            offer,
        });
        self.events.emit_call(CallEvent::Ringing { call_id, identity });
        Ok(())
    }

    async fn on_ring_timeout(&self, identity: String, call_id: CallId) {
        let mut inner = self.inner.lock().await;
        let current = self.state.snapshot();
        if !current.state.is_ringing() || current.call_id != call_id {
            debug!(target: "Call/Coordinator", "[{call_id}] Ring timeout for a call that is no longer ringing");
            return;
        }
        if !self.is_timeout_reject() {
            info!(target: "Call/Coordinator", "[{call_id}] Ring timeout reached, but timeout reject is disabled");
            return;
        }
        // we are running inside this task
        if let Some(task) = inner.ring_timeout.take() {
            task.detach();
        }

        info!(target: "Call/Coordinator", "[{call_id}] Ring timeout reached, rejecting");
        if let Err(e) = self.reject_answer(&identity, call_id, RejectReason::Timeout, true) {
            warn!(target: "Call/Coordinator", "[{call_id}] Could not send timeout reject: {e}");
        }
        self.transition(&mut inner, CallState::Idle, call_id);
        self.cancel_notification(&mut inner, &identity);
    }

    pub async fn handle_call_answer(&self, msg: IncomingMessage<CallAnswerData>) -> Result<(), CallError> {
        let Some(answer) = msg.data else {
            warn!(target: "Call/Coordinator", "Call answer from {} without data, ignoring", msg.from_identity);
            return Ok(());
        };
        let identity = msg.from_identity;
        let call_id = answer.call_id_or_default();

        let inner = self.inner.lock().await;
        let current = self.state.snapshot();
        if !Self::is_call_id_valid(&inner, &current, call_id) {
            info!(
                target: "Call/Coordinator",
                "Call answer received for an invalid call ID ({call_id}, local={}), ignoring",
                current.call_id
            );
            return Ok(());
        }
        if current.answer_received {
            warn!(target: "Call/Coordinator", "[{call_id}] Received extra answer, ignoring");
            return Ok(());
        }
        let Some(action) = answer.action else {
            warn!(target: "Call/Coordinator", "[{call_id}] Call answer received without action, ignoring");
            return Ok(());
        };

        match action {
            AnswerAction::Accept => {
                info!(target: "Call/Coordinator", "[{call_id}] Call answer received from {identity}: accept");
                self.events.emit_session(SessionEvent::CallAccepted {
                    call_id: current.call_id,
                });
            }
            AnswerAction::Reject => {
                let reason = answer.reject_reason.unwrap_or(RejectReason::Unknown);
                info!(target: "Call/Coordinator", "[{call_id}] Call answer received from {identity}: reject/{reason}");
                self.events.emit_call(CallEvent::Rejected {
                    call_id: current.call_id,
                    identity: identity.clone(),
                    rejected_locally: false,
                    reason,
                });
            }
        }

        self.state.replace(current.with_answer_received());
        self.forward(SessionInput::Answer {
            identity: identity.clone(),
            data: answer.clone(),
        });
        drop(inner);

        self.events
            .emit_signaling(SignalingEvent::AnswerReceived { identity, answer });
        Ok(())
    }

    pub async fn handle_ice_candidates(
        &self,
        msg: IncomingMessage<IceCandidatesData>,
    ) -> Result<(), CallError> {
        let identity = msg.from_identity;
        let Some(data) = msg.data else {
            warn!(target: "Call/Coordinator", "ICE candidates from {identity} without data, ignoring");
            return Ok(());
        };
        let Some(count) = data.candidates.as_ref().map(Vec::len) else {
            warn!(target: "Call/Coordinator", "ICE candidates from {identity} are null, ignoring");
            return Ok(());
        };
        let call_id = data.call_id_or_default();

        let inner = self.inner.lock().await;
        let current = self.state.snapshot();
        if !Self::is_call_id_valid(&inner, &current, call_id) {
            info!(
                target: "Call/Coordinator",
                "ICE candidates from {identity} for an invalid call ID ({call_id}, local={}), ignoring",
                current.call_id
            );
            return Ok(());
        }
        if data.removed {
            info!(target: "Call/Coordinator", "[{call_id}] ICE candidates from {identity} with removed=true, ignoring");
            return Ok(());
        }

        debug!(target: "Call/Coordinator", "[{call_id}] {count} ICE candidates received from {identity}");
        if current.state.buffers_candidates() {
            self.candidates.push(&identity, data);
        } else if current.state.forwards_candidates() {
            self.forward(SessionInput::Candidates { identity, data });
        } else {
            warn!(
                target: "Call/Coordinator",
                "[{call_id}] Received ICE candidates in invalid call state ({}), ignoring",
                current.state
            );
        }
        Ok(())
    }

    pub async fn handle_call_ringing(
        &self,
        msg: IncomingMessage<CallRingingData>,
    ) -> Result<(), CallError> {
        let identity = msg.from_identity;
        // older peers send ringing without a body
        let call_id = msg
            .data
            .as_ref()
            .map(CallRingingData::call_id_or_default)
            .unwrap_or_default();

        let mut inner = self.inner.lock().await;
        let current = self.state.snapshot();
        if !Self::is_call_id_valid(&inner, &current, call_id) {
            info!(
                target: "Call/Coordinator",
                "Ringing from {identity} for an invalid call ID ({call_id}, local={}), ignoring",
                current.call_id
            );
            return Ok(());
        }
        if !current.state.is_initializing() {
            warn!(
                target: "Call/Coordinator",
                "[{call_id}] Ringing from {identity} ignored, call state is {}",
                current.state
            );
            return Ok(());
        }

        info!(target: "Call/Coordinator", "[{call_id}] Peer {identity} is ringing");
        inner.peer_ringing = true;
        self.forward(SessionInput::PeerRinging {
            identity: identity.clone(),
            call_id: current.call_id,
        });
        drop(inner);

        self.events.emit_signaling(SignalingEvent::RingingReceived {
            identity,
            call_id: current.call_id,
        });
        Ok(())
    }

    pub async fn handle_remote_call_hangup(
        &self,
        msg: IncomingMessage<CallHangupData>,
    ) -> Result<(), CallError> {
        let identity = msg.from_identity;
        let call_id = msg
            .data
            .as_ref()
            .map(CallHangupData::call_id_or_default)
            .unwrap_or_default();

        let mut inner = self.inner.lock().await;
        let prev = self.state.snapshot();
        if !Self::is_call_id_valid(&inner, &prev, call_id) {
            if self.is_missed_call_locked(&inner, &identity, call_id) {
                drop(inner);
                info!(target: "Call/Coordinator", "Missed call received from {identity} with call ID {call_id}");
                self.events.emit_call(CallEvent::Missed {
                    call_id,
                    identity,
                    accepted: false,
                    date: Some(msg.date),
                });
                return Ok(());
            }
            info!(
                target: "Call/Coordinator",
                "Hangup from {identity} for an invalid call ID ({call_id}, local={}), ignoring",
                prev.call_id
            );
            return Ok(());
        }

        info!(target: "Call/Coordinator", "[{call_id}] Hangup received from {identity}");
        let duration = inner.call_started_at.map(|started| started.elapsed());
        // the initiator flag is unset until the call was accepted, so unset means incoming
        let incoming = inner.initiator != Some(true);

        self.transition(&mut inner, CallState::Idle, prev.call_id);
        self.cancel_notification(&mut inner, &identity);
        self.forward(SessionInput::RemoteHangup {
            identity: identity.clone(),
            call_id: prev.call_id,
        });
        drop(inner);

        self.events.emit_signaling(SignalingEvent::HangupReceived {
            identity: identity.clone(),
            call_id: prev.call_id,
        });
        let was_pending = matches!(
            prev.state,
            CallState::Idle | CallState::Ringing | CallState::Initializing
        );
        if incoming && was_pending {
            self.events.emit_call(CallEvent::Missed {
                call_id: prev.call_id,
                identity,
                accepted: prev.state.is_initializing(),
                date: Some(msg.date),
            });
        } else if let (true, Some(duration)) = (prev.state.is_calling(), duration) {
            self.events.emit_call(CallEvent::Finished {
                call_id: prev.call_id,
                identity,
                outgoing: !incoming,
                duration,
            });
        }
        Ok(())
    }

    fn is_call_id_valid(inner: &CoordinatorInner, current: &CallStateSnapshot, call_id: CallId) -> bool {
        if call_id == current.call_id {
            return true;
        }
        // legacy peers never send a call id back to the initiator
        inner.initiator == Some(true) && call_id.is_unspecified()
    }

    /// A hangup for a call we never heard of counts as missed, unless the
    /// id was seen recently or already sits in the call history.
    pub async fn is_missed_call(&self, identity: &str, call_id: CallId) -> bool {
        let inner = self.inner.lock().await;
        self.is_missed_call_locked(&inner, identity, call_id)
    }

    fn is_missed_call_locked(&self, inner: &CoordinatorInner, identity: &str, call_id: CallId) -> bool {
        if inner.recent_call_ids.contains(call_id) {
            info!(target: "Call/Coordinator", "No missed call: call ID {call_id} is a recent call");
            return false;
        }
        if self
            .services
            .history
            .has_call_status(identity, call_id, self.config.missed_call_lookback)
        {
            info!(target: "Call/Coordinator", "No missed call: call ID {call_id} found in history");
            return false;
        }
        true
    }

    // --- outbound messages ---

    pub async fn send_call_offer(
        &self,
        identity: &str,
        call_id: CallId,
        offer: &SessionDescription,
        video: bool,
    ) -> Result<(), CallError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(CallError::InvalidArgument(format!(
                "a {} session description is not valid for an offer",
                offer.sdp_type.as_str()
            )));
        }
        let _inner = self.inner.lock().await;
        let state = self.state.state();
        if !state.is_initializing() {
            return Err(CallError::InvalidState {
                operation: "send call offer",
                state,
            });
        }
        let features = if video {
            FeatureList::default().with_video()
        } else {
            FeatureList::default()
        };
        self.enqueue(
            identity,
            OutgoingMessage::Offer(CallOfferData {
                call_id: Some(call_id),
                offer: Some(SdpData::from(offer)),
                features,
            }),
        )?;
        info!(target: "Call/Coordinator", "[{call_id}] Call offer enqueued to {identity}");
        Ok(())
    }

    pub async fn send_accept_call_answer(
        &self,
        identity: &str,
        call_id: CallId,
        answer: &SessionDescription,
        video: bool,
    ) -> Result<(), CallError> {
        if !matches!(answer.sdp_type, SdpType::Answer | SdpType::Pranswer) {
            return Err(CallError::InvalidArgument(format!(
                "a {} session description is not valid for an answer",
                answer.sdp_type.as_str()
            )));
        }
        let _inner = self.inner.lock().await;
        let state = self.state.state();
        if !(state.is_ringing() || state.is_initializing()) {
            return Err(CallError::InvalidState {
                operation: "send accept answer",
                state,
            });
        }
        let features = if video {
            FeatureList::default().with_video()
        } else {
            FeatureList::default()
        };
        self.enqueue(
            identity,
            OutgoingMessage::Answer(CallAnswerData::accept(call_id, answer, features)),
        )?;
        info!(target: "Call/Coordinator", "[{call_id}] Accept answer enqueued to {identity}");
        Ok(())
    }

    /// Send a reject answer. With `notify_listeners` the rejection lands in
    /// the call history as missed or rejected, depending on the reason.
    pub async fn send_reject_call_answer(
        &self,
        identity: &str,
        call_id: CallId,
        reason: RejectReason,
        notify_listeners: bool,
    ) -> Result<(), CallError> {
        let _inner = self.inner.lock().await;
        self.reject_answer(identity, call_id, reason, notify_listeners)
    }

    fn reject_answer(
        &self,
        identity: &str,
        call_id: CallId,
        reason: RejectReason,
        notify_listeners: bool,
    ) -> Result<(), CallError> {
        info!(target: "Call/Coordinator", "[{call_id}] Sending reject answer to {identity} (reason={reason})");
        self.enqueue(
            identity,
            OutgoingMessage::Answer(CallAnswerData::reject(call_id, reason)),
        )?;
        if !notify_listeners {
            return Ok(());
        }
        let identity = identity.to_string();
        if reason.counts_as_missed() {
            self.events.emit_call(CallEvent::Missed {
                call_id,
                identity,
                accepted: false,
                date: None,
            });
        } else {
            self.events.emit_call(CallEvent::Rejected {
                call_id,
                identity,
                rejected_locally: true,
                reason,
            });
        }
        Ok(())
    }

    pub async fn send_ice_candidates(
        &self,
        identity: &str,
        call_id: CallId,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), CallError> {
        let _inner = self.inner.lock().await;
        let state = self.state.state();
        if !state.can_send_candidates() {
            return Err(CallError::InvalidState {
                operation: "send ICE candidates",
                state,
            });
        }
        debug!(
            target: "Call/Coordinator",
            "[{call_id}] Enqueueing {} ICE candidates to {identity}",
            candidates.len()
        );
        self.enqueue(
            identity,
            OutgoingMessage::IceCandidates(IceCandidatesData {
                call_id: Some(call_id),
                removed: false,
                candidates: Some(candidates),
            }),
        )
    }

    /// Acknowledge a ringing incoming call to the caller.
    pub async fn send_call_ringing(&self, identity: &str, call_id: CallId) -> Result<(), CallError> {
        let _inner = self.inner.lock().await;
        let state = self.state.state();
        if !state.is_ringing() {
            return Err(CallError::InvalidState {
                operation: "send ringing",
                state,
            });
        }
        self.enqueue(
            identity,
            OutgoingMessage::Ringing(CallRingingData {
                call_id: Some(call_id),
            }),
        )
    }

    pub async fn send_call_hangup(&self, identity: &str, call_id: CallId) -> Result<(), CallError> {
        let inner = self.inner.lock().await;
        let state = self.state.state();
        let duration = inner.call_started_at.map(|started| started.elapsed());
        let outgoing = inner.initiator == Some(true);
        drop(inner);

        self.enqueue(
            identity,
            OutgoingMessage::Hangup(CallHangupData {
                call_id: Some(call_id),
            }),
        )?;
        info!(
            target: "Call/Coordinator",
            "[{call_id}] Hangup enqueued to {identity} (state={state}, duration={duration:?})"
        );

        // finished calls are recorded by the session driver on disconnect
        let never_connected = duration.is_none()
            && matches!(
                state,
                CallState::Initializing | CallState::Calling | CallState::Disconnecting
            );
        if never_connected {
            let identity = identity.to_string();
            if outgoing {
                self.events.emit_call(CallEvent::Aborted { call_id, identity });
            } else {
                self.events.emit_call(CallEvent::Missed {
                    call_id,
                    identity,
                    accepted: true,
                    date: None,
                });
            }
        }
        Ok(())
    }

    fn enqueue(&self, identity: &str, message: OutgoingMessage) -> Result<(), CallError> {
        debug!(
            target: "Call/Coordinator",
            "[{}] Enqueueing {} to {identity}",
            message.call_id(),
            message.signaling_type()
        );
        self.services.channel.enqueue(identity, message)?;
        Ok(())
    }

    // --- operator actions ---

    /// Take the ringing call. Disarms the ring timeout and returns the
    /// caller's identity; the session driver then moves the call on.
    pub async fn accept_call(&self, call_id: CallId) -> Result<String, CallError> {
        self.disable_timeout_reject();
        let mut inner = self.inner.lock().await;
        let current = self.state.snapshot();
        if !current.state.is_ringing() || current.call_id != call_id {
            self.enable_timeout_reject();
            return Err(CallError::InvalidState {
                operation: "accept call",
                state: current.state,
            });
        }
        if let Some(task) = inner.ring_timeout.take() {
            task.cancel();
        }
        let identity = inner
            .offers
            .get(&call_id)
            .map(|offer| offer.identity.clone())
            .ok_or_else(|| CallError::InvalidArgument(format!("no offer stored for call {call_id}")))?;
        info!(target: "Call/Coordinator", "[{call_id}] Call from {identity} accepted");
        Ok(identity)
    }

    /// Decline the ringing call.
    pub async fn reject_call(&self, call_id: CallId, reason: RejectReason) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let current = self.state.snapshot();
        if !current.state.is_ringing() || current.call_id != call_id {
            return Err(CallError::InvalidState {
                operation: "reject call",
                state: current.state,
            });
        }
        let identity = inner
            .offers
            .get(&call_id)
            .map(|offer| offer.identity.clone())
            .ok_or_else(|| CallError::InvalidArgument(format!("no offer stored for call {call_id}")))?;

        self.reject_answer(&identity, call_id, reason, true)?;
        self.transition(&mut inner, CallState::Idle, call_id);
        self.cancel_notification(&mut inner, &identity);
        Ok(())
    }

    pub fn disable_timeout_reject(&self) {
        self.timeout_reject.store(false, Ordering::SeqCst);
    }

    pub fn enable_timeout_reject(&self) {
        self.timeout_reject.store(true, Ordering::SeqCst);
    }

    pub fn is_timeout_reject(&self) -> bool {
        self.timeout_reject.load(Ordering::SeqCst)
    }

    pub async fn set_initiator(&self, initiator: bool) {
        self.inner.lock().await.initiator = Some(initiator);
    }

    pub async fn is_peer_ringing(&self) -> bool {
        self.inner.lock().await.peer_ringing
    }

    /// Elapsed time since the call reached `Calling`.
    pub async fn call_duration(&self) -> Option<Duration> {
        self.inner
            .lock()
            .await
            .call_started_at
            .map(|started| started.elapsed())
    }

    pub async fn call_offer(&self, call_id: CallId) -> Option<PendingOffer> {
        self.inner.lock().await.offers.get(&call_id).cloned()
    }

    fn cancel_notification(&self, inner: &mut CoordinatorInner, identity: &str) {
        let front_end = &self.services.front_end;
        front_end.stop_ringtone();
        if inner.notification_tags.remove(identity) {
            info!(target: "Call/Coordinator", "Cancelling call notification for {identity}");
        } else {
            warn!(
                target: "Call/Coordinator",
                "No call notification found for {identity}, number of tags: {}",
                inner.notification_tags.len()
            );
        }
        front_end.cancel_incoming_call(identity);
    }

    /// Drop every incoming-call notification before a new call starts.
    pub async fn cancel_call_notifications_for_new_call(&self) {
        let mut inner = self.inner.lock().await;
        let front_end = &self.services.front_end;
        front_end.stop_ringtone();
        info!(
            target: "Call/Coordinator",
            "Cancelling all {} call notifications",
            inner.notification_tags.len()
        );
        for identity in inner.notification_tags.drain() {
            front_end.cancel_incoming_call(&identity);
        }
    }

    /// Silence the ringtone of a ringing incoming call.
    pub async fn mute_ringtone(&self) -> bool {
        let inner = self.inner.lock().await;
        let incoming = inner.initiator != Some(true);
        if incoming && self.state.state().is_ringing() {
            self.services.front_end.stop_ringtone();
            info!(target: "Call/Coordinator", "Muting ringtone as requested by user");
            return true;
        }
        false
    }
}

fn is_valid_offer(offer: Option<&SdpData>) -> bool {
    offer
        .and_then(SdpData::to_session_description)
        .is_some_and(|sd| sd.sdp_type == SdpType::Offer)
}
