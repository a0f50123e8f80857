mod common;

use chrono::Utc;
use common::{ALICE, BOB, CAROL, Network, PeerOptions, TestPeer, settle};
use std::time::Duration;
use voip_signaling::calls::{
    CallState, OutgoingMessage, PeerSignalingMessage, SdpType, SignalingType, TransportState,
};
use voip_signaling::CallConfig;
use voip_signaling::types::call::{AnswerAction, CallId, RejectReason};
use voip_signaling::types::events::{CallEvent, SessionEvent};

async fn connected_call(network: &std::sync::Arc<Network>) -> (TestPeer, TestPeer, CallId) {
    let alice = TestPeer::join(network, ALICE);
    let bob = TestPeer::join(network, BOB);

    let call_id = alice.driver.start_outgoing_call(BOB, false).await.unwrap();
    settle().await;
    bob.driver.accept_call(call_id).await.unwrap();
    settle().await;

    assert_eq!(alice.state(), CallState::Calling);
    assert_eq!(bob.state(), CallState::Calling);
    (alice, bob, call_id)
}

fn finished(events: &[CallEvent]) -> Vec<(CallId, bool, Duration)> {
    events
        .iter()
        .filter_map(|event| match event {
            CallEvent::Finished {
                call_id,
                outgoing,
                duration,
                ..
            } => Some((*call_id, *outgoing, *duration)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_outgoing_call_rings_connects_and_finishes() {
    let network = Network::new();
    let alice = TestPeer::join(&network, ALICE);
    let bob = TestPeer::join(&network, BOB);

    let call_id = alice.driver.start_outgoing_call(BOB, false).await.unwrap();
    assert!(!call_id.is_unspecified());
    settle().await;

    // the offer reached bob, bob's ringing reached alice
    assert_eq!(alice.state(), CallState::Initializing);
    assert_eq!(bob.state(), CallState::Ringing);
    assert_eq!(bob.coordinator.call_state().call_id, call_id);
    assert!(bob.front_end.has(&format!("incoming:{ALICE}:{call_id}:false")));
    assert!(bob.front_end.has(&format!("ringtone:{ALICE}")));
    assert!(alice.coordinator.is_peer_ringing().await);
    assert!(alice.front_end.has("loop:Ringback"));
    assert!(bob.call_events().contains(&CallEvent::Ringing {
        call_id,
        identity: ALICE.to_string(),
    }));

    bob.driver.accept_call(call_id).await.unwrap();
    settle().await;

    assert_eq!(alice.state(), CallState::Calling);
    assert_eq!(bob.state(), CallState::Calling);
    assert!(alice.front_end.has("sound:Pickup"));
    assert!(alice.call_events().contains(&CallEvent::Started {
        call_id,
        identity: BOB.to_string(),
        outgoing: true,
    }));
    assert!(bob.call_events().contains(&CallEvent::Started {
        call_id,
        identity: ALICE.to_string(),
        outgoing: false,
    }));
    assert!(alice
        .session_events()
        .contains(&SessionEvent::CallAccepted { call_id }));

    // both sides announce their video profile once connected
    let data_channel = alice.engine.last_connection().data_channel();
    assert!(matches!(
        data_channel.first(),
        Some(PeerSignalingMessage::VideoQualityProfile(_))
    ));

    tokio::time::sleep(Duration::from_secs(3)).await;
    alice.driver.hang_up().await.unwrap();
    settle().await;

    assert_eq!(alice.state(), CallState::Idle);
    assert_eq!(bob.state(), CallState::Idle);

    let alice_finished = finished(&alice.call_events());
    assert_eq!(alice_finished.len(), 1);
    assert_eq!(alice_finished[0].0, call_id);
    assert!(alice_finished[0].1);
    assert!(alice_finished[0].2 >= Duration::from_secs(3));

    let bob_finished = finished(&bob.call_events());
    assert_eq!(bob_finished.len(), 1);
    assert!(!bob_finished[0].1);
    assert!(bob_finished[0].2 >= Duration::from_secs(3));

    assert!(alice
        .session_events()
        .contains(&SessionEvent::Disconnected { call_id }));
    assert!(bob
        .session_events()
        .contains(&SessionEvent::Disconnected { call_id }));
    assert!(alice.engine.last_connection().is_closed());
    assert!(bob.engine.last_connection().is_closed());
    assert!(alice.front_end.has("toast:Call finished"));
}

#[tokio::test(start_paused = true)]
async fn test_wire_sequence_of_a_connected_call() {
    let network = Network::new();
    let (alice, bob, call_id) = connected_call(&network).await;

    let alice_sent: Vec<SignalingType> = alice
        .sent()
        .iter()
        .map(|(to, message)| {
            assert_eq!(to, BOB);
            assert_eq!(message.call_id(), call_id);
            message.signaling_type()
        })
        .collect();
    assert_eq!(
        alice_sent,
        vec![SignalingType::CallOffer, SignalingType::IceCandidates]
    );

    let bob_sent: Vec<SignalingType> = bob
        .sent()
        .iter()
        .map(|(_, message)| message.signaling_type())
        .collect();
    assert_eq!(
        bob_sent,
        vec![
            SignalingType::CallRinging,
            SignalingType::CallAnswer,
            SignalingType::IceCandidates
        ]
    );
    let Some((_, OutgoingMessage::Answer(answer))) = bob.sent().into_iter().nth(1) else {
        panic!("expected an answer from bob");
    };
    assert_eq!(answer.action, Some(AnswerAction::Accept));
    assert_eq!(
        alice.engine.last_connection().remote_descriptions(),
        vec![SdpType::Answer]
    );
}

#[tokio::test(start_paused = true)]
async fn test_early_candidates_are_replayed_in_arrival_order() {
    let network = Network::new();
    let alice = TestPeer::join_with(
        &network,
        ALICE,
        PeerOptions {
            local_candidates: vec![
                "candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host",
                "candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx",
                "candidate:3 1 udp 41885439 198.51.100.9 3478 typ relay",
            ],
            ..PeerOptions::default()
        },
    );
    let bob = TestPeer::join(&network, BOB);

    let call_id = alice.driver.start_outgoing_call(BOB, false).await.unwrap();
    settle().await;
    assert_eq!(bob.coordinator.candidate_cache().batch_count(ALICE), 3);

    bob.driver.accept_call(call_id).await.unwrap();
    settle().await;

    assert!(bob.coordinator.candidate_cache().is_empty());
    let added = bob.engine.last_connection().remote_candidates();
    assert_eq!(
        added,
        vec![
            "candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host",
            "candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx",
            "candidate:3 1 udp 41885439 198.51.100.9 3478 typ relay",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_ipv6_candidates_dropped_when_disabled() {
    let network = Network::new();
    let alice = TestPeer::join_with(
        &network,
        ALICE,
        PeerOptions {
            local_candidates: vec![
                "candidate:1 1 udp 2122260223 2001:db8::1 50000 typ host",
                "candidate:2 1 udp 2122260223 192.168.1.2 50000 typ host",
            ],
            ..PeerOptions::default()
        },
    );
    let bob = TestPeer::join_with(
        &network,
        BOB,
        PeerOptions {
            config: CallConfig {
                allow_ipv6: false,
                ..CallConfig::default()
            },
            ..PeerOptions::default()
        },
    );

    let call_id = alice.driver.start_outgoing_call(BOB, false).await.unwrap();
    settle().await;
    bob.driver.accept_call(call_id).await.unwrap();
    settle().await;

    assert!(!bob.engine.last_connection().params.allow_ipv6);
    assert_eq!(
        bob.engine.last_connection().remote_candidates(),
        vec!["candidate:2 1 udp 2122260223 192.168.1.2 50000 typ host"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_answer_is_applied_once() {
    let network = Network::new();
    let (alice, bob, _) = connected_call(&network).await;

    let answer = bob
        .sent()
        .into_iter()
        .find(|(_, message)| message.signaling_type() == SignalingType::CallAnswer)
        .map(|(_, message)| message)
        .unwrap();
    let payload = answer.to_payload().unwrap();

    assert!(alice.handler.handle(BOB, Utc::now(), 0x61, &payload).await);
    settle().await;

    assert_eq!(alice.engine.last_connection().remote_descriptions().len(), 1);
    assert_eq!(alice.state(), CallState::Calling);
    let accepted = alice
        .session_events()
        .iter()
        .filter(|e| matches!(e, SessionEvent::CallAccepted { .. }))
        .count();
    assert_eq!(accepted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_busy_callee_rejects_and_caller_plays_busy_tone() {
    let network = Network::new();
    let alice = TestPeer::join(&network, ALICE);
    let bob = TestPeer::join(&network, BOB);
    bob.device
        .native_call_ongoing
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let call_id = alice.driver.start_outgoing_call(BOB, false).await.unwrap();
    settle().await;

    assert_eq!(bob.state(), CallState::Idle);
    assert!(bob.call_events().contains(&CallEvent::Missed {
        call_id,
        identity: ALICE.to_string(),
        accepted: false,
        date: None,
    }));
    assert!(alice.call_events().contains(&CallEvent::Rejected {
        call_id,
        identity: BOB.to_string(),
        rejected_locally: false,
        reason: RejectReason::Busy,
    }));
    assert!(alice.front_end.has("sound:Busy"));
    assert_eq!(alice.state(), CallState::Disconnecting);

    // the busy tone plays out before the session goes away
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(alice.state(), CallState::Idle);
    assert!(alice
        .session_events()
        .contains(&SessionEvent::Cancelled { call_id }));
}

#[tokio::test(start_paused = true)]
async fn test_second_caller_gets_busy_during_a_call() {
    let network = Network::new();
    let (_alice, bob, call_id) = connected_call(&network).await;
    let carol = TestPeer::join(&network, CAROL);

    let carol_call = carol.driver.start_outgoing_call(BOB, false).await.unwrap();
    settle().await;

    assert_eq!(bob.state(), CallState::Calling);
    assert_eq!(bob.coordinator.call_state().call_id, call_id);
    assert!(carol.call_events().contains(&CallEvent::Rejected {
        call_id: carol_call,
        identity: BOB.to_string(),
        rejected_locally: false,
        reason: RejectReason::Busy,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_offer_right_after_remote_hangup_keeps_ringing() {
    let network = Network::new();
    let (_alice, bob, call_id) = connected_call(&network).await;

    let hangup = format!(r#"{{"callId":{}}}"#, call_id.0);
    assert!(bob.handler.handle(ALICE, Utc::now(), 0x63, hangup.as_bytes()).await);
    let offer = br#"{"callId":555,"offer":{"sdpType":"offer","sdp":"v=0"}}"#;
    assert!(bob.handler.handle(CAROL, Utc::now(), 0x60, offer).await);
    assert_eq!(bob.state(), CallState::Ringing);

    // the driver tears down the old session after the new offer arrived
    settle().await;
    let state = bob.coordinator.call_state();
    assert_eq!(state.state, CallState::Ringing);
    assert_eq!(state.call_id, CallId(555));
    assert!(bob.coordinator.call_offer(CallId(555)).await.is_some());
    assert!(bob.engine.connections()[0].is_closed());
    assert!(!bob.session_events().iter().any(|event| matches!(
        event,
        SessionEvent::StateChanged {
            to: CallState::Disconnecting,
            ..
        }
    )));
    assert_eq!(finished(&bob.call_events()).len(), 1);

    // the new call still times out on its own ring timer
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(bob.state(), CallState::Idle);
    assert!(bob.sent().iter().any(|(to, message)| to == CAROL
        && matches!(
            message,
            OutgoingMessage::Answer(answer) if answer.reject_reason == Some(RejectReason::Timeout)
        )));
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_remote_hangup_does_not_revive_call() {
    let network = Network::new();
    let alice = TestPeer::join(&network, ALICE);
    let bob = TestPeer::join_with(
        &network,
        BOB,
        PeerOptions {
            auto_connect: false,
            ..PeerOptions::default()
        },
    );

    let call_id = alice.driver.start_outgoing_call(BOB, false).await.unwrap();
    settle().await;
    bob.driver.accept_call(call_id).await.unwrap();
    settle().await;
    assert_eq!(bob.state(), CallState::Initializing);

    // the engine connects before the driver saw the hangup
    let hangup = format!(r#"{{"callId":{}}}"#, call_id.0);
    assert!(bob.handler.handle(ALICE, Utc::now(), 0x63, hangup.as_bytes()).await);
    bob.engine
        .last_connection()
        .report_transport(TransportState::Connected)
        .await;
    assert_eq!(bob.state(), CallState::Idle);

    settle().await;
    assert_eq!(bob.state(), CallState::Idle);
    let events = bob.call_events();
    assert!(!events.iter().any(|event| matches!(event, CallEvent::Started { .. })));
    assert!(finished(&events).is_empty());
    let missed = events
        .iter()
        .filter(|event| matches!(event, CallEvent::Missed { accepted: true, .. }))
        .count();
    assert_eq!(missed, 1);
    assert!(bob.engine.last_connection().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_transport_drop_reconnects_with_problem_sound() {
    let network = Network::new();
    let (alice, _bob, call_id) = connected_call(&network).await;
    let connection = alice.engine.last_connection();

    connection.report_transport(TransportState::Disconnected).await;
    assert!(alice
        .session_events()
        .contains(&SessionEvent::Reconnecting { call_id }));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(alice.front_end.has("loop:Problem"));

    connection.report_transport(TransportState::Connected).await;
    assert!(alice
        .session_events()
        .contains(&SessionEvent::Reconnected { call_id }));
    assert_eq!(alice.state(), CallState::Calling);
    assert_eq!(alice.front_end.count("sound:Pickup"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_after_connect_ends_call() {
    let network = Network::new();
    let (alice, _bob, call_id) = connected_call(&network).await;

    alice
        .engine
        .last_connection()
        .report_transport(TransportState::Failed)
        .await;

    assert_eq!(alice.state(), CallState::Idle);
    assert_eq!(finished(&alice.call_events()).len(), 1);
    assert!(alice
        .session_events()
        .contains(&SessionEvent::Disconnected { call_id }));
    assert!(alice.front_end.has("toast:Call finished: Connection lost"));
}

#[tokio::test(start_paused = true)]
async fn test_video_call_starts_camera_when_peer_rings() {
    let network = Network::new();
    let alice = TestPeer::join(&network, ALICE);
    let bob = TestPeer::join(&network, BOB);

    let call_id = alice.driver.start_outgoing_call(BOB, true).await.unwrap();
    settle().await;

    assert!(bob.front_end.has(&format!("incoming:{ALICE}:{call_id}:true")));
    let connection = alice.engine.last_connection();
    assert!(connection.params.video_enabled);
    assert!(connection.is_capturing());
    assert!(alice.driver.is_capturing().await);
    assert!(connection
        .data_channel()
        .contains(&PeerSignalingMessage::CaptureState { camera_on: true }));
    assert!(alice
        .session_events()
        .contains(&SessionEvent::OutgoingVideoStarted));

    alice.driver.stop_capturing().await.unwrap();
    assert!(!connection.is_capturing());
    assert!(connection
        .data_channel()
        .contains(&PeerSignalingMessage::CaptureState { camera_on: false }));
}

#[tokio::test(start_paused = true)]
async fn test_second_outgoing_call_is_refused() {
    let network = Network::new();
    let (alice, _bob, _) = connected_call(&network).await;

    let err = alice.driver.start_outgoing_call(CAROL, false).await;
    assert!(matches!(
        err,
        Err(voip_signaling::CallError::AlreadyStarted)
    ));
}
