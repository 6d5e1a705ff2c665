use super::*;
use crate::test_support::FakeStore;
use serde_json::json;
use std::time::Duration;

fn me() -> UserId {
    UserId::from("me")
}

fn store_with_roster() -> FakeStore {
    let store = FakeStore::new();
    store.seed(CONVERSATIONS, "c1", json!({ "members": ["me", "bob"] }));
    store
}

async fn next(rx: &mut mpsc::UnboundedReceiver<SlotMessage>) -> SlotMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("slot message in time")
        .expect("lifecycle alive")
}

async fn go_live(
    lifecycle: &mut SubscriptionLifecycle,
    rx: &mut mpsc::UnboundedReceiver<SlotMessage>,
    target: SlotTarget,
) -> u64 {
    let generation = lifecycle.start(target);
    // Snapshots from slots that are already live may arrive first.
    loop {
        if let SlotMessage::Established {
            kind,
            generation: got,
            result,
        } = next(rx).await
        {
            assert_eq!(got, generation);
            assert_eq!(lifecycle.establish(kind, got, result), Establish::Live);
            break;
        }
    }
    generation
}

#[tokio::test]
async fn restart_before_establish_unsubscribes_the_older_result() {
    let store = store_with_roster();
    let (mut lifecycle, mut rx) = SubscriptionLifecycle::new(Arc::new(store.clone()));

    let first = lifecycle.start(SlotTarget::Roster(me()));
    let second = lifecycle.start(SlotTarget::Roster(me()));
    assert_eq!(lifecycle.phase(SlotKind::Roster), SlotPhase::Subscribing);

    let mut outcomes = Vec::new();
    while outcomes.len() < 2 {
        if let SlotMessage::Established {
            kind,
            generation,
            result,
        } = next(&mut rx).await
        {
            outcomes.push((generation, lifecycle.establish(kind, generation, result)));
        }
    }
    outcomes.sort_by_key(|(generation, _)| *generation);
    assert_eq!(
        outcomes,
        vec![(first, Establish::Stale), (second, Establish::Live)]
    );
    assert_eq!(store.live_queries(CONVERSATIONS), 1);
    assert!(lifecycle.is_current(SlotKind::Roster, second));
    assert!(!lifecycle.is_current(SlotKind::Roster, first));
}

#[tokio::test]
async fn snapshots_carry_the_generation_that_produced_them() {
    let store = store_with_roster();
    let (mut lifecycle, mut rx) = SubscriptionLifecycle::new(Arc::new(store.clone()));
    let generation = go_live(&mut lifecycle, &mut rx, SlotTarget::Typing(ConversationId::from("c1"))).await;

    match next(&mut rx).await {
        SlotMessage::Snapshot {
            kind,
            generation: got,
            event: SnapshotEvent::Document(Some(document)),
        } => {
            assert_eq!(kind, SlotKind::Typing);
            assert_eq!(got, generation);
            assert_eq!(document.id, "c1");
        }
        other => panic!("expected typing snapshot, got {other:?}"),
    }
    assert_eq!(
        lifecycle.target(SlotKind::Typing),
        Some(&SlotTarget::Typing(ConversationId::from("c1")))
    );
}

#[tokio::test]
async fn stop_releases_the_subscription_before_returning() {
    let store = store_with_roster();
    let (mut lifecycle, mut rx) = SubscriptionLifecycle::new(Arc::new(store.clone()));
    let conversation = ConversationId::from("c1");
    let generation = go_live(&mut lifecycle, &mut rx, SlotTarget::Messages(conversation.clone())).await;
    assert_eq!(store.live_queries(&messages_collection(&conversation)), 1);

    lifecycle.stop(SlotKind::Messages);
    assert_eq!(store.live_queries(&messages_collection(&conversation)), 0);
    assert_eq!(lifecycle.phase(SlotKind::Messages), SlotPhase::Idle);
    assert!(!lifecycle.is_current(SlotKind::Messages, generation));
    assert!(lifecycle.target(SlotKind::Messages).is_none());
}

#[tokio::test]
async fn rejected_subscribe_moves_the_slot_to_error() {
    let store = store_with_roster();
    store.fail_subscriptions_to(CONVERSATIONS);
    let (mut lifecycle, mut rx) = SubscriptionLifecycle::new(Arc::new(store.clone()));

    let generation = lifecycle.start(SlotTarget::Typing(ConversationId::from("c1")));
    let SlotMessage::Established { kind, result, .. } = next(&mut rx).await else {
        panic!("expected establish");
    };
    let outcome = lifecycle.establish(kind, generation, result);
    assert!(matches!(outcome, Establish::Failed(err) if err.code == shared::error::ErrorCode::PermissionDenied));
    assert_eq!(lifecycle.phase(SlotKind::Typing), SlotPhase::Error);

    lifecycle.stop(SlotKind::Typing);
    assert_eq!(lifecycle.phase(SlotKind::Typing), SlotPhase::Idle);
}

#[tokio::test]
async fn failing_a_live_slot_only_applies_to_its_generation() {
    let store = store_with_roster();
    let (mut lifecycle, mut rx) = SubscriptionLifecycle::new(Arc::new(store.clone()));
    let generation = go_live(&mut lifecycle, &mut rx, SlotTarget::Roster(me())).await;

    assert!(!lifecycle.fail(SlotKind::Roster, generation + 1));
    assert_eq!(lifecycle.phase(SlotKind::Roster), SlotPhase::Live);
    assert!(lifecycle.fail(SlotKind::Roster, generation));
    assert_eq!(lifecycle.phase(SlotKind::Roster), SlotPhase::Error);
    assert_eq!(store.live_subscriptions(CONVERSATIONS), 0);
}

#[tokio::test]
async fn dropping_the_lifecycle_releases_every_slot() {
    let store = store_with_roster();
    let (mut lifecycle, mut rx) = SubscriptionLifecycle::new(Arc::new(store.clone()));
    go_live(&mut lifecycle, &mut rx, SlotTarget::Roster(me())).await;
    go_live(&mut lifecycle, &mut rx, SlotTarget::Typing(ConversationId::from("c1"))).await;
    assert_eq!(store.total_live(), 2);

    drop(lifecycle);
    assert_eq!(store.total_live(), 0);
}
