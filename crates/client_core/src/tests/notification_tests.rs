use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use shared::domain::{NotificationId, NotificationKind};
use shared::protocol::NotificationPayload;

use super::NotificationFeed;

fn at(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + offset_ms).unwrap()
}

fn notification(id: &str, read: bool, offset_ms: i64) -> NotificationPayload {
    NotificationPayload {
        notification_id: NotificationId::new(id),
        kind: NotificationKind::Booking,
        title: format!("notification {id}"),
        body: "body".to_string(),
        read,
        metadata: BTreeMap::new(),
        created_at: at(offset_ms),
    }
}

fn ids(feed: &NotificationFeed) -> Vec<&str> {
    feed.items()
        .iter()
        .map(|item| item.notification_id.as_str())
        .collect()
}

#[test]
fn pushed_notification_lands_on_top_whatever_its_timestamp() {
    let mut feed = NotificationFeed::default();
    feed.replace_items(vec![notification("n1", false, 60_000)]);
    // the push carries an older creation time and still wins the top slot
    assert!(feed.apply_created(notification("n2", false, 0)));
    assert_eq!(ids(&feed), vec!["n2", "n1"]);
}

#[test]
fn badge_follows_creations_reads_and_deletions() {
    let mut feed = NotificationFeed::default();
    feed.replace_items(vec![notification("n1", false, 0), notification("n2", true, 1_000)]);
    feed.set_unread(1);

    assert!(feed.apply_created(notification("n3", false, 2_000)));
    assert_eq!(feed.unread(), 2);

    assert!(feed.mark_read(&NotificationId::new("n3")));
    assert_eq!(feed.unread(), 1);
    assert!(!feed.mark_read(&NotificationId::new("n3")), "already read");
    assert_eq!(feed.unread(), 1);

    assert!(feed.apply_deleted(&NotificationId::new("n1")));
    assert_eq!(feed.unread(), 0);
    assert!(!feed.apply_deleted(&NotificationId::new("n1")));
    assert_eq!(ids(&feed), vec!["n3", "n2"]);
}

#[test]
fn update_adjusts_badge_by_the_read_delta() {
    let mut feed = NotificationFeed::default();
    feed.replace_items(vec![notification("n1", false, 0)]);
    feed.set_unread(5);

    assert!(feed.apply_updated(notification("n1", true, 0)));
    assert_eq!(feed.unread(), 4);
    assert!(feed.apply_updated(notification("n1", false, 0)));
    assert_eq!(feed.unread(), 5);

    // an id outside the visible page is ignored
    assert!(!feed.apply_updated(notification("n9", true, 0)));
    assert_eq!(feed.unread(), 5);
    assert_eq!(ids(&feed), vec!["n1"]);
}

#[test]
fn mark_all_read_clears_every_flag_and_the_badge() {
    let mut feed = NotificationFeed::default();
    feed.replace_items(vec![
        notification("n1", false, 0),
        notification("n2", true, 1_000),
        notification("n3", false, 2_000),
    ]);
    feed.set_unread(7);

    feed.mark_all_read();
    assert_eq!(feed.unread(), 0);
    assert!(feed.items().iter().all(|item| item.read));
}

#[test]
fn remove_read_keeps_only_unread_items() {
    let mut feed = NotificationFeed::default();
    feed.replace_items(vec![
        notification("n1", false, 0),
        notification("n2", true, 1_000),
        notification("n3", true, 2_000),
    ]);
    feed.set_unread(1);

    assert_eq!(feed.remove_read(), 2);
    assert_eq!(ids(&feed), vec!["n1"]);
    assert_eq!(feed.unread(), 1);
}

#[test]
fn duplicate_create_is_treated_as_an_update() {
    let mut feed = NotificationFeed::default();
    feed.replace_items(vec![notification("n1", false, 0)]);
    feed.set_unread(1);

    let mut updated = notification("n1", true, 0);
    updated.title = "booking confirmed".to_string();
    assert!(feed.apply_created(updated));

    assert_eq!(feed.items().len(), 1);
    assert!(feed.items()[0].read);
    assert_eq!(feed.items()[0].title, "booking confirmed");
    assert_eq!(feed.unread(), 0);
}

#[test]
fn badge_never_underflows() {
    let mut feed = NotificationFeed::default();
    feed.replace_items(vec![notification("n1", false, 0)]);
    feed.set_unread(0);

    assert!(feed.apply_deleted(&NotificationId::new("n1")));
    assert_eq!(feed.unread(), 0);
}

#[test]
fn replacing_the_page_leaves_the_badge_alone() {
    let mut feed = NotificationFeed::default();
    feed.set_unread(4);
    feed.replace_items(vec![notification("n1", true, 0), notification("n2", true, 1_000)]);
    assert_eq!(feed.unread(), 4, "a filtered page must not distort the badge");
}
