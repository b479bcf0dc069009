//! End-to-end call flows over a shared in-process store.
//!
//! Each manager runs its full stack (state machine, peer session, relay
//! subscription); only the store is shared, so every signal travels the
//! same path it would through the remote backend.

use std::sync::Arc;
use std::time::Duration;
use wavecall_core::{
    BackoffConfig, CallConfig, CallEvent, CallManager, CallMode, CallPhase, CallStatus, EndReason,
    SignalPayload, SignalStore, SignalingRelay, SqliteStore, StaticMediaSource,
};

fn manager(user: &str, store: Arc<SqliteStore>) -> CallManager {
    let _ = env_logger::builder().is_test(true).try_init();
    let relay = Arc::new(SignalingRelay::new(store as Arc<dyn SignalStore>));
    let mut config = CallConfig::new(user);
    config.setup_timeout_secs = 30;
    config.ice_servers = Vec::new();
    CallManager::new(config, relay, Arc::new(StaticMediaSource), None)
}

async fn settle() {
    // lets freshly spawned subscription tasks open their feeds
    tokio::time::sleep(Duration::from_millis(200)).await;
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn next_incoming(events: &mut tokio::sync::broadcast::Receiver<CallEvent>) -> (String, CallMode) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(CallEvent::IncomingCall { call_id, mode, .. }) = events.recv().await {
                return (call_id, mode);
            }
        }
    })
    .await
    .expect("timed out waiting for incoming call")
}

async fn next_ended(events: &mut tokio::sync::broadcast::Receiver<CallEvent>) -> (String, EndReason) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(CallEvent::CallEnded { call_id, reason }) = events.recv().await {
                return (call_id, reason);
            }
        }
    })
    .await
    .expect("timed out waiting for call end")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_video_call_handshake_and_hangup() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let alice = manager("alice", store.clone());
    let bob = manager("bob", store.clone());
    settle().await;

    let mut bob_events = bob.subscribe();

    let outgoing = alice.start_call("bob", CallMode::Video).await.unwrap();
    assert_eq!(alice.snapshot().phase, CallPhase::Calling);

    let (ringing_id, mode) = next_incoming(&mut bob_events).await;
    assert_eq!(ringing_id, outgoing.call_id);
    assert_eq!(mode, CallMode::Video);
    assert_eq!(bob.snapshot().phase, CallPhase::Ringing);

    let record = store.get_call(&outgoing.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Initiated);
    assert_eq!(record.caller_id, "alice");
    assert_eq!(record.receiver_id, "bob");

    let bob_media = bob.answer_call().await.unwrap();
    assert!(bob_media.audio().is_some());
    assert!(bob_media.video().is_some());
    assert!(matches!(
        bob.snapshot().phase,
        CallPhase::Connecting | CallPhase::Connected
    ));

    // the answer travels back through the relay
    wait_until("alice to leave Calling", || {
        matches!(
            alice.snapshot().phase,
            CallPhase::Connecting | CallPhase::Connected
        )
    })
    .await;

    let record = store.get_call(&outgoing.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Answered);
    assert!(record.answered_at.is_some());

    alice.end_call().await.unwrap();
    assert_eq!(alice.snapshot().phase, CallPhase::Idle);

    wait_until("bob to return to idle", || {
        bob.snapshot().phase == CallPhase::Idle
    })
    .await;

    let record = store.get_call(&outgoing.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert!(record.ended_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reject_flow() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let alice = manager("alice", store.clone());
    let bob = manager("bob", store.clone());
    settle().await;

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let outgoing = alice.start_call("bob", CallMode::Voice).await.unwrap();
    next_incoming(&mut bob_events).await;

    bob.reject_call().await.unwrap();
    assert_eq!(bob.snapshot().phase, CallPhase::Idle);

    let (ended_id, reason) = next_ended(&mut alice_events).await;
    assert_eq!(ended_id, outgoing.call_id);
    assert_eq!(reason, EndReason::Rejected);
    assert_eq!(alice.snapshot().phase, CallPhase::Idle);

    let record = store.get_call(&outgoing.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Rejected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_callee_refuses_second_offer() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let alice = manager("alice", store.clone());
    let carol = manager("carol", store.clone());
    let bob = manager("bob", store.clone());
    settle().await;

    let mut bob_events = bob.subscribe();
    let mut carol_events = carol.subscribe();

    // bob is already ringing with alice's call
    let first = alice.start_call("bob", CallMode::Voice).await.unwrap();
    next_incoming(&mut bob_events).await;

    let second = carol.start_call("bob", CallMode::Voice).await.unwrap();

    let (ended_id, reason) = next_ended(&mut carol_events).await;
    assert_eq!(ended_id, second.call_id);
    assert_eq!(reason, EndReason::Busy);
    assert_eq!(carol.snapshot().phase, CallPhase::Idle);

    let record = store.get_call(&second.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Failed);

    // the busy refusal never touched bob's ringing session
    let bob_snapshot = bob.snapshot();
    assert_eq!(bob_snapshot.phase, CallPhase::Ringing);
    assert_eq!(bob_snapshot.call_id, Some(first.call_id));
    assert_eq!(bob_snapshot.remote_user_id.as_deref(), Some("alice"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_connection_failure_ends_call() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let alice = manager("alice", store.clone());
    // bob is scripted through a bare relay instead of a full manager
    let bob_relay = SignalingRelay::new(store.clone() as Arc<dyn SignalStore>);
    let mut bob_inbound = bob_relay.subscribe_inbound("bob", BackoffConfig::default());
    settle().await;

    let mut alice_events = alice.subscribe();
    let outgoing = alice.start_call("bob", CallMode::Voice).await.unwrap();

    // bob sees the offer, then reports a dead transport
    let offer = tokio::time::timeout(Duration::from_secs(10), bob_inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(offer.payload, SignalPayload::Offer { .. }));

    bob_relay
        .send_signal(
            &outgoing.call_id,
            "bob",
            "alice",
            SignalPayload::CallEnd {
                reason: EndReason::ConnectionFailed,
                duration_seconds: None,
            },
        )
        .await
        .unwrap();

    let (ended_id, reason) = next_ended(&mut alice_events).await;
    assert_eq!(ended_id, outgoing.call_id);
    assert_eq!(reason, EndReason::ConnectionFailed);
    assert_eq!(alice.snapshot().phase, CallPhase::Idle);

    // never connected, so the record closes as failed with no duration
    let record = store.get_call(&outgoing.call_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Failed);
    assert_eq!(record.duration_seconds, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_candidates_before_answer_are_not_lost() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let alice = manager("alice", store.clone());
    let bob = manager("bob", store.clone());
    settle().await;

    let mut bob_events = bob.subscribe();

    alice.start_call("bob", CallMode::Voice).await.unwrap();
    next_incoming(&mut bob_events).await;

    // Trickled candidates from alice may arrive while bob is still
    // ringing, before bob has any peer session. Give them a moment to land,
    // then answer; any held candidates are consumed on the way.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let trickled = store
            .signals_since("bob", 0)
            .await
            .unwrap()
            .iter()
            .any(|s| matches!(s.payload, SignalPayload::IceCandidate { .. }));
        if trickled || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    bob.answer_call().await.unwrap();
    assert!(matches!(
        bob.snapshot().phase,
        CallPhase::Connecting | CallPhase::Connected
    ));

    bob.end_call().await.unwrap();
    wait_until("alice to return to idle", || {
        alice.snapshot().phase == CallPhase::Idle
    })
    .await;
}
