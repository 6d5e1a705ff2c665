use super::*;
use chrono::{Duration, TimeZone};
use serde_json::{json, Value};

fn doc(id: &str, value: Value) -> Document {
    let Value::Object(fields) = value else {
        panic!("fixture must be an object");
    };
    Document::new(id, fields)
}

fn me() -> UserId {
    UserId::from("me")
}

fn profile(id: &str, name: &str) -> ProfileRecord {
    ProfileRecord {
        id: UserId::from(id),
        display_name: Some(name.into()),
        photo_url: Some(format!("https://photos/{id}.png")),
        ..ProfileRecord::default()
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).single().expect("valid time")
}

#[test]
fn relative_time_buckets() {
    let now = now();
    assert_eq!(relative_time(None, now), "");
    assert_eq!(relative_time(Some(now - Duration::seconds(30)), now), "Now");
    assert_eq!(relative_time(Some(now + Duration::seconds(5)), now), "Now");
    assert_eq!(relative_time(Some(now - Duration::minutes(5)), now), "5m ago");
    assert_eq!(relative_time(Some(now - Duration::minutes(59)), now), "59m ago");
    assert_eq!(relative_time(Some(now - Duration::hours(3)), now), "3h ago");
    assert_eq!(relative_time(Some(now - Duration::days(6)), now), "6d ago");
    assert_eq!(relative_time(Some(now - Duration::days(8)), now), "2024-05-12");
}

#[test]
fn snapshot_requests_each_counterpart_profile_once() {
    let mut roster = RosterSynchronizer::new();
    let docs = vec![
        doc("c1", json!({ "members": ["me", "bob"] })),
        doc("c2", json!({ "members": ["me", "bob", "carol"] })),
    ];
    let fetches = roster.apply_snapshot(&docs, &me());
    let users: Vec<&str> = fetches.iter().map(|(user, _)| user.as_str()).collect();
    assert_eq!(users, vec!["bob", "carol"]);

    assert!(roster.apply_snapshot(&docs, &me()).is_empty());
}

#[test]
fn derive_sorts_by_last_message_time_with_empty_conversations_last() {
    let mut roster = RosterSynchronizer::new();
    let docs = vec![
        doc("fresh", json!({ "members": ["me", "a"], "lastMessageTime": null })),
        doc("old", json!({ "members": ["me", "b"], "lastMessageTime": 1_000 })),
        doc("new", json!({ "members": ["me", "c"], "lastMessageTime": 9_000 })),
        doc("tie", json!({ "members": ["me", "d"], "lastMessageTime": 1_000 })),
        doc("fresh2", json!({ "members": ["me", "e"] })),
    ];
    roster.apply_snapshot(&docs, &me());
    let ids: Vec<String> = roster
        .derive(&me(), now())
        .iter()
        .map(|entry| entry.id().to_string())
        .collect();
    assert_eq!(ids, vec!["new", "old", "tie", "fresh", "fresh2"]);
}

#[test]
fn display_fields_come_from_counterpart_profiles() {
    let mut roster = RosterSynchronizer::new();
    let docs = vec![
        doc("pair", json!({ "members": ["me", "bob"] })),
        doc("group", json!({ "members": ["me", "bob", "carol"] })),
    ];
    let fetches = roster.apply_snapshot(&docs, &me());
    let before = roster.derive(&me(), now());
    assert_eq!(before[0].display_name, UNKNOWN_USER);

    for (user, seq) in fetches {
        let name = if user.as_str() == "bob" { "Bob" } else { "Carol" };
        roster
            .profiles_mut()
            .complete(&user, seq, Some(profile(user.as_str(), name)));
    }
    let entries = roster.derive(&me(), now());
    let pair = entries.iter().find(|e| e.id().as_str() == "pair").expect("pair");
    assert_eq!(pair.display_name, "Bob");
    assert_eq!(pair.display_photo.as_deref(), Some("https://photos/bob.png"));
    assert_eq!(pair.counterpart_id, Some(UserId::from("bob")));
    assert!(!pair.is_group);

    let group = entries.iter().find(|e| e.id().as_str() == "group").expect("group");
    assert_eq!(group.display_name, "Bob, Carol");
    assert_eq!(group.counterpart_id, None);
    assert!(group.is_group);
}

#[test]
fn older_profile_reads_never_replace_newer_ones() {
    let mut cache = ProfileCache::default();
    let bob = UserId::from("bob");
    let first = cache.request(&bob).expect("first read");
    let second = cache.invalidate(&bob);

    assert!(cache.complete(&bob, second, Some(profile("bob", "Robert"))));
    assert!(!cache.complete(&bob, first, Some(profile("bob", "Bob"))));
    assert_eq!(
        cache.get(&bob).and_then(ProfileRecord::best_name),
        Some("Robert")
    );
    assert_eq!(cache.request(&bob), None);
}

#[test]
fn failed_reads_are_retried_on_the_next_request() {
    let mut cache = ProfileCache::default();
    let bob = UserId::from("bob");
    let seq = cache.request(&bob).expect("read");
    assert_eq!(cache.request(&bob), None);
    cache.fail(&bob, seq);
    assert!(cache.request(&bob).is_some());
}

#[test]
fn hidden_conversations_reappear_when_a_newer_message_arrives() {
    let mut roster = RosterSynchronizer::new();
    roster.apply_snapshot(
        &[doc("c1", json!({ "members": ["me", "bob"], "lastMessageTime": 100 }))],
        &me(),
    );
    roster.hide(&ConversationId::from("c1"));
    assert!(roster.derive(&me(), now()).is_empty());

    roster.apply_snapshot(
        &[doc("c1", json!({ "members": ["me", "bob"], "lastMessageTime": 100, "unreadCount": 1 }))],
        &me(),
    );
    assert!(roster.derive(&me(), now()).is_empty());

    roster.apply_snapshot(
        &[doc("c1", json!({ "members": ["me", "bob"], "lastMessageTime": 200 }))],
        &me(),
    );
    assert_eq!(roster.derive(&me(), now()).len(), 1);
}

#[test]
fn existing_pair_is_found_regardless_of_member_order() {
    let mut roster = RosterSynchronizer::new();
    roster.apply_snapshot(
        &[
            doc("group", json!({ "members": ["me", "bob", "carol"] })),
            doc("pair", json!({ "members": ["bob", "me"] })),
        ],
        &me(),
    );
    assert_eq!(
        roster.existing_with(&me(), &UserId::from("bob")),
        Some(ConversationId::from("pair"))
    );
    assert_eq!(roster.existing_with(&me(), &UserId::from("carol")), None);
}
