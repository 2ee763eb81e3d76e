use chrono::{DateTime, TimeZone, Utc};
use shared::domain::{MessageId, RoomId, UserId};
use shared::protocol::MessagePayload;

use super::RoomFeeds;
use crate::types::{ChatMessage, Delivery};

fn at(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + offset_ms).unwrap()
}

fn payload(id: &str, room: &str, sender: &str, body: &str, offset_ms: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId::new(id),
        room_id: RoomId::new(room),
        sender_id: UserId::new(sender),
        body: body.to_string(),
        read: false,
        created_at: at(offset_ms),
        updated_at: at(offset_ms),
    }
}

fn placeholder(body: &str, offset_ms: i64) -> ChatMessage {
    ChatMessage::placeholder(UserId::new("customer-1"), body, at(offset_ms))
}

#[test]
fn snapshot_and_live_merge_in_display_order() {
    let room = RoomId::new("room-1");
    let mut feeds = RoomFeeds::default();
    feeds.apply_snapshot(&room, vec![payload("m1", "room-1", "company-1", "hello", 1_000)]);
    feeds.push_live(payload("m2", "room-1", "customer-1", "hi", 2_000));

    let merged = feeds.merged(&room);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].delivery.message_id(), Some(&MessageId::new("m1")));
    assert_eq!(merged[1].delivery.message_id(), Some(&MessageId::new("m2")));
}

#[test]
fn fresh_snapshot_prunes_covered_live_entries() {
    let room = RoomId::new("room-1");
    let mut feeds = RoomFeeds::default();
    feeds.push_live(payload("m1", "room-1", "company-1", "hello", 1_000));
    feeds.push_placeholder(Some(&room), placeholder("on my way", 2_000));

    // the next poll returns both: the pushed message and the echo of the
    // placeholder
    feeds.apply_snapshot(
        &room,
        vec![
            payload("m1", "room-1", "company-1", "hello", 1_000),
            payload("m2", "room-1", "customer-1", "on my way", 2_400),
        ],
    );

    assert!(feeds.live.get(&room).is_some_and(Vec::is_empty));
    assert_eq!(feeds.merged(&room).len(), 2);
}

#[test]
fn placeholder_waits_in_outbox_until_a_room_exists() {
    let room = RoomId::new("room-1");
    let mut feeds = RoomFeeds::default();
    feeds.push_placeholder(None, placeholder("anyone there?", 0));
    assert_eq!(feeds.outbox().len(), 1);
    assert!(feeds.merged(&room).is_empty());

    feeds.adopt_outbox(&room);
    assert!(feeds.outbox().is_empty());
    let merged = feeds.merged(&room);
    assert_eq!(merged.len(), 1);
    assert!(matches!(merged[0].delivery, Delivery::Pending { .. }));
}

#[test]
fn adoption_skips_placeholders_whose_echo_already_arrived() {
    let room = RoomId::new("room-1");
    let mut feeds = RoomFeeds::default();
    feeds.push_placeholder(None, placeholder("anyone there?", 0));
    feeds.push_live(payload("m1", "room-1", "customer-1", "anyone there?", 300));

    feeds.adopt_outbox(&room);
    assert!(feeds.outbox().is_empty());
    let merged = feeds.merged(&room);
    assert_eq!(merged.len(), 1);
    assert!(merged[0].delivery.is_confirmed());
}

#[test]
fn pushed_echo_replaces_a_room_placeholder_immediately() {
    let room = RoomId::new("room-1");
    let mut feeds = RoomFeeds::default();
    feeds.push_placeholder(Some(&room), placeholder("on my way", 0));
    feeds.push_live(payload("m1", "room-1", "customer-1", "on my way", 300));

    let live = feeds.live.get(&room).expect("live list");
    assert_eq!(live.len(), 1);
    assert!(live[0].delivery.is_confirmed());
}

#[test]
fn duplicate_push_is_ignored() {
    let room = RoomId::new("room-1");
    let mut feeds = RoomFeeds::default();
    feeds.apply_snapshot(&room, vec![payload("m1", "room-1", "company-1", "hello", 1_000)]);
    feeds.push_live(payload("m1", "room-1", "company-1", "hello", 1_000));
    feeds.push_live(payload("m2", "room-1", "company-1", "again", 2_000));
    feeds.push_live(payload("m2", "room-1", "company-1", "again", 2_000));

    assert_eq!(feeds.merged(&room).len(), 2);
}

#[test]
fn counterpart_read_flags_flip_without_touching_own_messages() {
    let room = RoomId::new("room-1");
    let me = UserId::new("customer-1");
    let mut feeds = RoomFeeds::default();
    feeds.apply_snapshot(
        &room,
        vec![
            payload("m1", "room-1", "company-1", "quote ready", 0),
            payload("m2", "room-1", "customer-1", "thanks", 1_000),
        ],
    );
    feeds.push_live(payload("m3", "room-1", "company-1", "see attachment", 2_000));

    assert!(feeds.has_unread_from_counterpart(&room, &me));
    assert!(feeds.mark_counterpart_read(&room, &me));
    assert!(!feeds.has_unread_from_counterpart(&room, &me));
    // marking again changes nothing
    assert!(!feeds.mark_counterpart_read(&room, &me));

    for message in feeds.merged(&room) {
        if message.sender_id == me {
            assert!(!message.read, "own flag follows the server, not the ack");
        } else {
            assert!(message.read);
        }
    }
}
