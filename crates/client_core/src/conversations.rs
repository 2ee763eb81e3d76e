//! Per-room conversation state.
//!
//! Each room keeps the latest REST snapshot and a live list fed by the push
//! channel. Placeholders for a conversation whose room does not exist yet sit
//! in a shared outbox until the room resolves.

use std::collections::HashMap;

use shared::domain::{RoomId, UserId};
use shared::protocol::MessagePayload;

use crate::merge::{is_confirmed_echo, merge_room_feed};
use crate::types::{ChatMessage, Delivery};

#[derive(Debug, Default)]
pub struct RoomFeeds {
    snapshots: HashMap<RoomId, Vec<ChatMessage>>,
    live: HashMap<RoomId, Vec<ChatMessage>>,
    outbox: Vec<ChatMessage>,
}

impl RoomFeeds {
    /// Installs a fresh snapshot page for `room_id` and prunes live entries
    /// the snapshot now covers, so the live list does not grow without bound
    /// across poll cycles.
    pub fn apply_snapshot(&mut self, room_id: &RoomId, items: Vec<MessagePayload>) {
        let snapshot: Vec<ChatMessage> = items.into_iter().map(ChatMessage::confirmed).collect();
        if let Some(live) = self.live.get_mut(room_id) {
            live.retain(|message| match &message.delivery {
                Delivery::Confirmed { message_id } => !snapshot
                    .iter()
                    .any(|snap| snap.delivery.message_id() == Some(message_id)),
                Delivery::Pending { .. } => !snapshot
                    .iter()
                    .any(|snap| is_confirmed_echo(snap, message)),
            });
        }
        self.snapshots.insert(room_id.clone(), snapshot);
    }

    /// Appends a pushed message to its room's live list. Duplicate ids are
    /// skipped; placeholders echoed by the new message are dropped on the
    /// spot rather than waiting for the next merge.
    pub fn push_live(&mut self, payload: MessagePayload) {
        let room_id = payload.room_id.clone();
        let message_id = payload.message_id.clone();
        if self
            .room_messages(&room_id)
            .any(|existing| existing.delivery.message_id() == Some(&message_id))
        {
            return;
        }
        let message = ChatMessage::confirmed(payload);
        let live = self.live.entry(room_id).or_default();
        live.retain(|existing| {
            !matches!(existing.delivery, Delivery::Pending { .. })
                || !is_confirmed_echo(&message, existing)
        });
        live.push(message);
    }

    /// Records an optimistic placeholder. With a room it joins that room's
    /// live list; without one it goes to the outbox of the pending
    /// conversation.
    pub fn push_placeholder(&mut self, room_id: Option<&RoomId>, message: ChatMessage) {
        match room_id {
            Some(room_id) => self.live.entry(room_id.clone()).or_default().push(message),
            None => self.outbox.push(message),
        }
    }

    /// Moves outbox placeholders into `room_id` once the pending conversation
    /// has resolved. Placeholders whose echo already arrived for that room
    /// are discarded instead of moved.
    pub fn adopt_outbox(&mut self, room_id: &RoomId) {
        if self.outbox.is_empty() {
            return;
        }
        let adopted: Vec<ChatMessage> = self.outbox.drain(..).collect();
        let live = self.live.entry(room_id.clone()).or_default();
        for message in adopted {
            let echoed = self
                .snapshots
                .get(room_id)
                .into_iter()
                .flatten()
                .chain(live.iter())
                .any(|candidate| is_confirmed_echo(candidate, &message));
            if !echoed {
                live.push(message);
            }
        }
    }

    /// The merged feed for `room_id`, in display order.
    pub fn merged(&self, room_id: &RoomId) -> Vec<ChatMessage> {
        let snapshot = self.snapshots.get(room_id).map_or(&[][..], Vec::as_slice);
        let live = self.live.get(room_id).map_or(&[][..], Vec::as_slice);
        merge_room_feed(snapshot, live)
    }

    /// Placeholders waiting for a room.
    pub fn outbox(&self) -> &[ChatMessage] {
        &self.outbox
    }

    /// Whether the room holds messages from someone other than `me` that are
    /// still unread.
    pub fn has_unread_from_counterpart(&self, room_id: &RoomId, me: &UserId) -> bool {
        self.room_messages(room_id)
            .any(|message| !message.read && &message.sender_id != me)
    }

    /// Flips the local read flag on every counterpart message in the room.
    /// Returns whether anything changed.
    pub fn mark_counterpart_read(&mut self, room_id: &RoomId, me: &UserId) -> bool {
        let mut changed = false;
        for source in [
            self.snapshots.get_mut(room_id),
            self.live.get_mut(room_id),
        ]
        .into_iter()
        .flatten()
        {
            for message in source.iter_mut() {
                if !message.read && &message.sender_id != me {
                    message.read = true;
                    changed = true;
                }
            }
        }
        changed
    }

    fn room_messages<'a>(&'a self, room_id: &RoomId) -> impl Iterator<Item = &'a ChatMessage> {
        self.snapshots
            .get(room_id)
            .into_iter()
            .flatten()
            .chain(self.live.get(room_id).into_iter().flatten())
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
