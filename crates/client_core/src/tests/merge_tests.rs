use chrono::{DateTime, TimeZone, Utc};
use shared::domain::{MessageId, UserId};

use super::{is_confirmed_echo, merge_room_feed, ECHO_WINDOW_MS};
use crate::types::{ChatMessage, Delivery};

fn at(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + offset_ms).unwrap()
}

fn confirmed(id: &str, sender: &str, body: &str, offset_ms: i64) -> ChatMessage {
    ChatMessage {
        delivery: Delivery::Confirmed {
            message_id: MessageId::new(id),
        },
        sender_id: UserId::new(sender),
        body: body.to_string(),
        read: false,
        created_at: at(offset_ms),
        updated_at: at(offset_ms),
    }
}

fn placeholder(body: &str, offset_ms: i64) -> ChatMessage {
    ChatMessage::placeholder(UserId::new("me"), body, at(offset_ms))
}

fn ids(messages: &[ChatMessage]) -> Vec<&str> {
    messages
        .iter()
        .map(|message| match &message.delivery {
            Delivery::Confirmed { message_id } => message_id.as_str(),
            Delivery::Pending { .. } => "<pending>",
        })
        .collect()
}

#[test]
fn sorts_merged_feed_ascending_with_stable_ties() {
    let snapshot = vec![
        confirmed("m2", "customer-1", "second", 2_000),
        confirmed("m1", "customer-1", "first", 1_000),
    ];
    let live = vec![
        confirmed("m3", "company-1", "third", 1_500),
        confirmed("m4", "company-1", "tied with first", 1_000),
    ];
    let merged = merge_room_feed(&snapshot, &live);
    assert_eq!(ids(&merged), vec!["m1", "m4", "m3", "m2"]);
}

#[test]
fn collapses_placeholder_against_server_echo() {
    let live = vec![
        placeholder("on my way", 0),
        confirmed("m7", "customer-1", "on my way", 400),
    ];
    let merged = merge_room_feed(&[], &live);
    assert_eq!(merged.len(), 1);
    assert!(merged[0].delivery.is_confirmed());
}

#[test]
fn echo_window_is_strictly_under_one_second() {
    let sent = placeholder("ping", 0);
    let just_inside = confirmed("m1", "customer-1", "ping", ECHO_WINDOW_MS - 1);
    let at_boundary = confirmed("m2", "customer-1", "ping", ECHO_WINDOW_MS);
    assert!(is_confirmed_echo(&just_inside, &sent));
    assert!(!is_confirmed_echo(&at_boundary, &sent));

    let merged = merge_room_feed(&[at_boundary], &[placeholder("ping", 0)]);
    assert_eq!(merged.len(), 2, "a boundary hit must keep the placeholder");
}

#[test]
fn echo_match_ignores_the_sender() {
    // an identical text from the other participant inside the window still
    // swallows the placeholder
    let snapshot = vec![confirmed("m9", "someone-else", "yes", 300)];
    let live = vec![placeholder("yes", 0)];
    assert_eq!(ids(&merge_room_feed(&snapshot, &live)), vec!["m9"]);
}

#[test]
fn keeps_placeholder_without_an_echo() {
    let snapshot = vec![confirmed("m1", "customer-1", "hello", 0)];
    let live = vec![placeholder("are you there?", 5_000)];
    let merged = merge_room_feed(&snapshot, &live);
    assert_eq!(merged.len(), 2);
    assert!(matches!(merged[1].delivery, Delivery::Pending { .. }));
}

#[test]
fn body_match_outside_the_window_is_not_an_echo() {
    let snapshot = vec![confirmed("m5", "customer-1", "ok", 10_000)];
    let live = vec![placeholder("ok", 0)];
    assert_eq!(merge_room_feed(&snapshot, &live).len(), 2);
}

#[test]
fn snapshot_copy_wins_on_duplicate_ids() {
    let mut snapshot_copy = confirmed("m3", "company-1", "deal", 1_000);
    snapshot_copy.read = true;
    let live_copy = confirmed("m3", "company-1", "deal", 1_000);
    let merged = merge_room_feed(&[snapshot_copy], &[live_copy]);
    assert_eq!(merged.len(), 1);
    assert!(merged[0].read, "the snapshot copy carries the read flag");
}

#[test]
fn merging_twice_is_idempotent() {
    let snapshot = vec![
        confirmed("m2", "customer-1", "b", 2_000),
        confirmed("m1", "company-1", "a", 1_000),
    ];
    let live = vec![
        placeholder("c", 3_000),
        confirmed("m4", "company-1", "d", 2_500),
    ];
    let merged = merge_room_feed(&snapshot, &live);
    assert_eq!(merge_room_feed(&merged, &[]), merged);
}

#[test]
fn identical_texts_from_both_sides_stay_distinct() {
    let live = vec![
        confirmed("m1", "customer-1", "ok", 500),
        confirmed("m2", "company-1", "ok", 500),
    ];
    assert_eq!(ids(&merge_room_feed(&[], &live)), vec!["m1", "m2"]);
}

#[test]
fn live_only_feed_works_before_any_snapshot() {
    let live = vec![confirmed("m1", "company-1", "hi", 100)];
    assert_eq!(ids(&merge_room_feed(&[], &live)), vec!["m1"]);
}

#[test]
fn empty_inputs_merge_to_empty() {
    assert!(merge_room_feed(&[], &[]).is_empty());
}
