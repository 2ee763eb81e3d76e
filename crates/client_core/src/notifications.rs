//! The notification feed and its unread badge.
//!
//! Unlike conversation feeds this list keeps insertion order: a pushed
//! notification always lands on top, whatever its timestamp says. The unread
//! count is tracked separately from the visible page, so a filtered view does
//! not distort the badge; pushes and polls both overwrite it, last write wins.

use shared::domain::NotificationId;
use shared::protocol::NotificationPayload;

#[derive(Debug, Clone, Default)]
pub struct NotificationFeed {
    items: Vec<NotificationPayload>,
    unread: u64,
}

impl NotificationFeed {
    pub fn items(&self) -> &[NotificationPayload] {
        &self.items
    }

    pub fn unread(&self) -> u64 {
        self.unread
    }

    /// Replaces the visible page. The badge is left alone; it is fed by the
    /// unread endpoint and push events, not by whichever filter is on screen.
    pub fn replace_items(&mut self, items: Vec<NotificationPayload>) {
        self.items = items;
    }

    pub fn set_unread(&mut self, unread: u64) {
        self.unread = unread;
    }

    /// Prepends a pushed notification. A duplicate id is treated as an
    /// update instead. Returns whether the feed changed.
    pub fn apply_created(&mut self, notification: NotificationPayload) -> bool {
        if self.find(&notification.notification_id).is_some() {
            return self.apply_updated(notification);
        }
        if !notification.read {
            self.unread += 1;
        }
        self.items.insert(0, notification);
        true
    }

    /// Replaces a notification in place, adjusting the badge by the read-flag
    /// delta. An id outside the visible page is ignored; its badge change
    /// arrives through the unread count channel.
    pub fn apply_updated(&mut self, notification: NotificationPayload) -> bool {
        let Some(index) = self.find(&notification.notification_id) else {
            return false;
        };
        let was_read = self.items[index].read;
        match (was_read, notification.read) {
            (false, true) => self.unread = self.unread.saturating_sub(1),
            (true, false) => self.unread += 1,
            _ => {}
        }
        self.items[index] = notification;
        true
    }

    pub fn apply_deleted(&mut self, notification_id: &NotificationId) -> bool {
        let Some(index) = self.find(notification_id) else {
            return false;
        };
        let removed = self.items.remove(index);
        if !removed.read {
            self.unread = self.unread.saturating_sub(1);
        }
        true
    }

    /// Optimistically marks one notification read. Returns whether anything
    /// changed.
    pub fn mark_read(&mut self, notification_id: &NotificationId) -> bool {
        let Some(index) = self.find(notification_id) else {
            return false;
        };
        if self.items[index].read {
            return false;
        }
        self.items[index].read = true;
        self.unread = self.unread.saturating_sub(1);
        true
    }

    /// Optimistically marks everything read and zeroes the badge.
    pub fn mark_all_read(&mut self) {
        for item in &mut self.items {
            item.read = true;
        }
        self.unread = 0;
    }

    /// Optimistically removes every read notification from the visible page.
    /// Returns how many were dropped.
    pub fn remove_read(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|item| !item.read);
        before - self.items.len()
    }

    fn find(&self, notification_id: &NotificationId) -> Option<usize> {
        self.items
            .iter()
            .position(|item| &item.notification_id == notification_id)
    }
}

#[cfg(test)]
#[path = "tests/notification_tests.rs"]
mod tests;
