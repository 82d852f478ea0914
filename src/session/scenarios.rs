//! Ende-zu-Ende Abläufe mit zwei Geräten und gemeinsamer Datenbank

use super::*;
use crate::audio::AudioOutput;
use crate::model::{CallSession, CallStatus, CallType};
use crate::signaling::{SignalingEvent, WakeOutcome, WakePayload};
use crate::store::{CallStore, ChangeFilter, SqliteCallStore, StoreChange};
use crate::testing::{settle, Side};
use std::sync::Arc;
use std::time::Duration;

fn store() -> Arc<SqliteCallStore> {
    Arc::new(SqliteCallStore::open_in_memory().unwrap())
}

async fn status_of(store: &SqliteCallStore, call_id: &str) -> CallStatus {
    store.fetch_session(call_id).await.unwrap().unwrap().status
}

/// Alice ruft Bob an, Bob wird über den Push geweckt
async fn ring_bob(alice: &Side, bob: &Side) -> (String, String) {
    let outgoing = alice
        .manager
        .start_outgoing("bob", CallType::Voice)
        .await
        .unwrap();
    let payload = alice
        .push
        .sent()
        .into_iter()
        .rev()
        .map(|push| push.payload)
        .find(|payload| matches!(payload, WakePayload::IncomingCall { .. }))
        .unwrap();
    let (_, disposition) = bob.wake(payload).await;
    assert_eq!(disposition, Some(IncomingDisposition::Surfaced));

    let room = format!("room-{}", outgoing.call_id);
    (outgoing.call_id, room)
}

#[tokio::test(start_paused = true)]
async fn test_offline_callee_woken_by_push_connects() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    let mut alice_events = alice.manager.subscribe();

    let outgoing = alice
        .manager
        .start_outgoing("bob", CallType::Video)
        .await
        .unwrap();
    assert_eq!(outgoing.state, CallState::Ringing);
    assert_eq!(outgoing.advisory.as_deref(), Some("bob appears offline"));
    let call_id = outgoing.call_id.clone();
    let room = format!("room-{call_id}");

    let pushes = alice.push.sent();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].to_user_id, "bob");
    assert_eq!(pushes[0].ttl, Duration::from_secs(30));

    // Bob startet aus dem Push
    let (outcome, disposition) = bob.wake(pushes[0].payload.clone()).await;
    assert_eq!(outcome, WakeOutcome::Delivered);
    assert_eq!(disposition, Some(IncomingDisposition::Surfaced));

    let incoming = bob.manager.snapshot().unwrap();
    assert_eq!(incoming.state, CallState::Ringing);
    assert_eq!(incoming.direction, Direction::Incoming);
    assert_eq!(incoming.peer_name, "Alice");
    assert!(incoming.camera_enabled);
    assert!(bob.alerter.is_alerting(&call_id));

    // Derselbe Anruf zusätzlich über den Stream
    let session = store.fetch_session(&call_id).await.unwrap().unwrap();
    assert_eq!(
        bob.manager.receive_incoming(session).await,
        IncomingDisposition::Duplicate
    );

    let answered = bob.manager.answer().await.unwrap();
    assert_eq!(answered.state, CallState::Connecting);
    assert!(!bob.alerter.is_alerting(&call_id));
    assert_eq!(bob.media.count(&format!("join:{room}")), 1);

    alice.media.peer_joined(&room, "bob");
    bob.media.peer_joined(&room, "alice");
    settle().await;

    assert_eq!(alice.manager.snapshot().unwrap().state, CallState::Connected);
    assert_eq!(bob.manager.snapshot().unwrap().state, CallState::Connected);
    assert_eq!(status_of(&store, &call_id).await, CallStatus::Connected);
    assert_eq!(
        bob.ui.events(),
        vec![
            format!("incoming:{call_id}:Alice"),
            format!("connected:{call_id}")
        ]
    );

    // Weder Ring-Timeout noch Ablauf nach dem Verbinden
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(alice.manager.snapshot().unwrap().state, CallState::Connected);
    assert_eq!(bob.manager.snapshot().unwrap().state, CallState::Connected);

    alice.manager.hangup().await.unwrap();
    settle().await;

    let alice_end = alice.manager.snapshot().unwrap();
    assert_eq!(
        alice_end.state,
        CallState::Ended {
            reason: EndReason::LocalHangup
        }
    );
    assert!(alice_end.connected_for.unwrap() >= Duration::from_secs(60));
    assert_eq!(
        bob.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::RemoteEnded
        }
    );
    assert_eq!(status_of(&store, &call_id).await, CallStatus::Ended);
    assert!(!alice.audio_modes.is_held());
    assert!(!bob.audio_modes.is_held());
    // Verbundene Anrufe brauchen keinen Beendigungs-Push
    assert_eq!(alice.push.sent().len(), 1);

    let mut saw_advisory = false;
    while let Ok(event) = alice_events.try_recv() {
        if let CallEvent::Advisory { message, .. } = event {
            saw_advisory |= message == "bob appears offline";
        }
    }
    assert!(saw_advisory);
}

#[tokio::test(start_paused = true)]
async fn test_call_ended_before_callee_launches_is_not_shown() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");

    let outgoing = alice
        .manager
        .start_outgoing("bob", CallType::Voice)
        .await
        .unwrap();
    let call_id = outgoing.call_id.clone();
    let wake = alice.push.sent()[0].payload.clone();

    alice.manager.hangup().await.unwrap();
    let row = store.fetch_session(&call_id).await.unwrap().unwrap();
    assert_eq!(row.status, CallStatus::Ended);
    assert!(row.ended_at.is_some());

    let pushes = alice.push.sent();
    assert_eq!(pushes.len(), 2);
    assert_eq!(
        pushes[1].payload,
        WakePayload::CallEnded {
            call_id: call_id.clone()
        }
    );

    // Bob startet verspätet aus dem ersten Push
    let mut bob_events = bob.manager.subscribe();
    let (outcome, disposition) = bob.wake(wake).await;
    assert_eq!(outcome, WakeOutcome::Stale(CallStatus::Ended));
    assert_eq!(disposition, None);

    // Der Wake hat die Beendigung bereits vermerkt
    let session = store.fetch_session(&call_id).await.unwrap().unwrap();
    assert_eq!(
        bob.manager.receive_incoming(session.clone()).await,
        IncomingDisposition::AlreadyFinished
    );

    assert!(bob.manager.snapshot().is_none());
    assert!(bob.alerter.started().is_empty());
    assert!(bob.ui.events().is_empty());
    assert!(bob_events.try_recv().is_err());

    // Ein zweites Gerät ohne Wake liest den maßgeblichen Datensatz
    let other_device = Side::new(&store, "bob");
    assert_eq!(
        other_device.manager.receive_incoming(session.clone()).await,
        IncomingDisposition::Stale(CallStatus::Ended)
    );
    assert_eq!(
        other_device.manager.receive_incoming(session).await,
        IncomingDisposition::AlreadyFinished
    );
    assert!(other_device.manager.snapshot().is_none());
    assert!(other_device.alerter.started().is_empty());
    assert!(other_device.ui.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_termination_before_ringing_insert_wins() {
    let store = store();
    let bob = Side::new(&store, "bob");
    bob.channel.start();

    let (outcome, _) = bob
        .wake(WakePayload::CallEnded {
            call_id: "c1".to_string(),
        })
        .await;
    assert_eq!(outcome, WakeOutcome::Terminated);

    let mut signals = bob.channel.subscribe();
    let session = CallSession::outgoing(
        "c1".to_string(),
        "alice".to_string(),
        "bob".to_string(),
        CallType::Voice,
        "Alice".to_string(),
        Some("room-c1".to_string()),
    );
    store.insert_session(&session).await.unwrap();
    settle().await;

    while let Ok(event) = signals.try_recv() {
        assert!(
            !matches!(event, SignalingEvent::IncomingCall(_)),
            "late ringing insert must not be delivered"
        );
    }
    assert_eq!(
        bob.manager.receive_incoming(session).await,
        IncomingDisposition::AlreadyFinished
    );
    assert!(bob.manager.snapshot().is_none());
    assert!(bob.alerter.started().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_hangups_clean_up_once() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let outgoing = alice
        .manager
        .start_outgoing("bob", CallType::Voice)
        .await
        .unwrap();
    let call_id = outgoing.call_id.clone();
    let mut changes = store.subscribe(ChangeFilter::Call(call_id.clone()));

    let (first, second) = tokio::join!(alice.manager.hangup(), alice.manager.hangup());
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(alice.manager.hangup().await, Ok(()));

    let mut updates = 0;
    while let Ok(Some(change)) = tokio::time::timeout(Duration::from_millis(50), changes.next()).await {
        if matches!(change, StoreChange::SessionUpdated(_)) {
            updates += 1;
        }
    }
    assert_eq!(updates, 1);
    assert_eq!(alice.media.count(&format!("leave:room-{call_id}")), 1);
    assert_eq!(alice.push.sent().len(), 2);
    assert_eq!(alice.ui.events(), vec![format!("end:{call_id}")]);
    assert!(!alice.audio_modes.is_held());
    assert_eq!(
        alice.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::LocalHangup
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_ring_timeout_then_late_connect_is_ignored() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    let (call_id, room) = ring_bob(&alice, &bob).await;
    let mut events = alice.manager.subscribe();

    tokio::time::sleep(Duration::from_secs(31)).await;

    let snapshot = alice.manager.snapshot().unwrap();
    assert_eq!(
        snapshot.state,
        CallState::Ended {
            reason: EndReason::NoAnswer
        }
    );
    assert_eq!(snapshot.reason.as_deref(), Some("No answer"));
    assert_eq!(status_of(&store, &call_id).await, CallStatus::Missed);
    assert!(!alice.audio_modes.is_held());
    assert_eq!(alice.media.count(&format!("leave:{room}")), 1);

    // Bob sieht den verpassten Anruf über den Datensatz
    assert_eq!(
        bob.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::RemoteMissed
        }
    );
    assert!(!bob.alerter.is_alerting(&call_id));

    alice.media.peer_joined(&room, "bob");
    settle().await;

    assert_eq!(
        alice.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::NoAnswer
        }
    );
    assert_eq!(status_of(&store, &call_id).await, CallStatus::Missed);
    assert_eq!(alice.push.sent().len(), 2);

    let mut terminal_events = 0;
    while let Ok(event) = events.try_recv() {
        if let CallEvent::StateChanged(snapshot) = event {
            if snapshot.state.is_terminal() {
                terminal_events += 1;
            }
        }
    }
    assert_eq!(terminal_events, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hangup_during_answer_join_releases_once() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    let (_, room) = ring_bob(&alice, &bob).await;

    let gate = bob.media.gate_joins();
    let answering = {
        let manager = Arc::clone(&bob.manager);
        tokio::spawn(async move { manager.answer().await })
    };
    settle().await;
    assert_eq!(bob.media.count(&format!("join:{room}")), 1);

    alice.manager.hangup().await.unwrap();
    settle().await;
    gate.notify_one();

    let result = answering.await.unwrap();
    assert_eq!(result.unwrap_err(), CallError::CallEnded);
    assert_eq!(
        bob.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::RemoteEnded
        }
    );
    assert_eq!(bob.media.count(&format!("leave:{room}")), 1);
    assert!(!bob.audio_modes.is_held());
}

#[tokio::test(start_paused = true)]
async fn test_reject_ends_caller() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    let (call_id, _) = ring_bob(&alice, &bob).await;

    bob.manager.reject().await.unwrap();
    settle().await;

    assert_eq!(status_of(&store, &call_id).await, CallStatus::Rejected);
    assert_eq!(
        bob.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::Declined
        }
    );
    assert_eq!(
        alice.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::RemoteRejected
        }
    );
    assert!(!alice.audio_modes.is_held());
    assert!(!bob.alerter.is_alerting(&call_id));
    // Abgelehnt ist kein Abbruch durch den Anrufer
    assert_eq!(alice.push.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_peer_leaving_room_ends_call() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    let (call_id, room) = ring_bob(&alice, &bob).await;

    bob.manager.answer().await.unwrap();
    alice.media.peer_joined(&room, "bob");
    bob.media.peer_joined(&room, "alice");
    settle().await;

    alice.media.peer_left(&room, "bob");
    settle().await;

    assert_eq!(
        alice.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::PeerLeft
        }
    );
    assert_eq!(status_of(&store, &call_id).await, CallStatus::Ended);
    assert_eq!(
        bob.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::RemoteEnded
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_incoming_while_busy_is_ignored() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    let carol = Side::new(&store, "carol");
    let (call_id, _) = ring_bob(&alice, &bob).await;

    carol
        .manager
        .start_outgoing("bob", CallType::Voice)
        .await
        .unwrap();
    let (outcome, disposition) = bob.wake(carol.push.sent()[0].payload.clone()).await;
    assert_eq!(outcome, WakeOutcome::Delivered);
    assert_eq!(disposition, Some(IncomingDisposition::Busy));

    let current = bob.manager.snapshot().unwrap();
    assert_eq!(current.call_id, call_id);
    assert_eq!(current.state, CallState::Ringing);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_incoming_expires_locally() {
    let store = store();
    let bob = Side::new(&store, "bob");
    let session = CallSession::outgoing(
        "c1".to_string(),
        "alice".to_string(),
        "bob".to_string(),
        CallType::Voice,
        "Alice".to_string(),
        Some("room-c1".to_string()),
    );
    store.insert_session(&session).await.unwrap();

    assert_eq!(
        bob.manager.receive_incoming(session).await,
        IncomingDisposition::Surfaced
    );

    // Anrufer ist verschwunden, der Datensatz klingelt weiter
    tokio::time::sleep(Duration::from_secs(36)).await;

    assert_eq!(
        bob.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::Missed
        }
    );
    assert_eq!(status_of(&store, "c1").await, CallStatus::Missed);
    assert!(!bob.alerter.is_alerting("c1"));
}

#[tokio::test(start_paused = true)]
async fn test_native_ui_failure_does_not_block_call() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    bob.ui.set_unavailable();

    let (_, room) = ring_bob(&alice, &bob).await;
    bob.manager.answer().await.unwrap();
    bob.media.peer_joined(&room, "alice");
    settle().await;

    assert_eq!(bob.manager.snapshot().unwrap().state, CallState::Connected);
    assert!(bob.ui.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_join_failure_fails_answer() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    let (call_id, _) = ring_bob(&alice, &bob).await;
    bob.media.fail_join();

    let err = bob.manager.answer().await.unwrap_err();
    assert!(matches!(err, CallError::NetworkFailure(_)));
    assert!(matches!(
        bob.manager.snapshot().unwrap().state,
        CallState::Failed {
            kind: FailureKind::NetworkFailure,
            ..
        }
    ));
    settle().await;

    assert_eq!(status_of(&store, &call_id).await, CallStatus::Ended);
    assert_eq!(
        alice.manager.snapshot().unwrap().state,
        CallState::Ended {
            reason: EndReason::RemoteEnded
        }
    );
    assert!(!bob.audio_modes.is_held());
    assert!(bob.media.calls().iter().any(|c| c.starts_with("permissions:")));
}

#[tokio::test(start_paused = true)]
async fn test_speaker_chosen_while_ringing_survives_answer() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");
    let (_call_id, _room) = ring_bob(&alice, &bob).await;

    // Klingeln setzt kein Earpiece durch
    assert_eq!(bob.route.current(), None);

    bob.manager.set_speaker(true).unwrap();
    assert_eq!(bob.manager.snapshot().unwrap().audio_output, AudioOutput::Speaker);

    let answered = bob.manager.answer().await.unwrap();
    assert_eq!(answered.audio_output, AudioOutput::Speaker);
    assert_eq!(bob.route.current(), Some(AudioOutput::Speaker));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(bob.route.current(), Some(AudioOutput::Speaker));
}

#[tokio::test(start_paused = true)]
async fn test_next_incoming_call_starts_on_earpiece() {
    let store = store();
    let alice = Side::new(&store, "alice");
    let bob = Side::new(&store, "bob");

    ring_bob(&alice, &bob).await;
    bob.manager.set_speaker(true).unwrap();
    bob.manager.reject().await.unwrap();
    settle().await;

    ring_bob(&alice, &bob).await;
    assert_eq!(bob.manager.snapshot().unwrap().audio_output, AudioOutput::Earpiece);
    let answered = bob.manager.answer().await.unwrap();
    assert_eq!(answered.audio_output, AudioOutput::Earpiece);
    assert_eq!(bob.route.current(), Some(AudioOutput::Earpiece));
}
