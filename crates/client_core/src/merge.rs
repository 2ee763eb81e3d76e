//! Reconciliation of REST snapshots with live-pushed messages.
//!
//! A conversation feed is assembled from two sources that overlap: the last
//! snapshot page fetched over REST and the messages accumulated from the push
//! channel since. [`merge_room_feed`] collapses the overlap into the single
//! sequence shown to the caller.

use std::collections::HashSet;

use shared::domain::MessageId;

use crate::types::{ChatMessage, Delivery};

/// A placeholder is collapsed against a confirmed message when the bodies are
/// identical and the timestamps differ by strictly less than this.
pub const ECHO_WINDOW_MS: i64 = 1_000;

/// True when `candidate` is the server-confirmed copy of the optimistic
/// `placeholder`. The sender is deliberately not compared; body plus a tight
/// time window is the whole heuristic.
pub fn is_confirmed_echo(candidate: &ChatMessage, placeholder: &ChatMessage) -> bool {
    candidate.delivery.is_confirmed()
        && candidate.body == placeholder.body
        && (candidate.created_at - placeholder.created_at)
            .num_milliseconds()
            .abs()
            < ECHO_WINDOW_MS
}

/// Merges a snapshot and the live list into one feed.
///
/// Snapshot items come first, so when the same confirmed message appears in
/// both sources the snapshot copy wins. Placeholders that have a confirmed
/// echo anywhere in the combined input are dropped. The result is sorted by
/// `created_at` ascending; the sort is stable, so equal timestamps keep their
/// snapshot-then-live order.
pub fn merge_room_feed(snapshot: &[ChatMessage], live: &[ChatMessage]) -> Vec<ChatMessage> {
    let combined: Vec<&ChatMessage> = snapshot.iter().chain(live.iter()).collect();

    let mut seen: HashSet<MessageId> = HashSet::with_capacity(combined.len());
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(combined.len());
    for message in &combined {
        match &message.delivery {
            Delivery::Pending { .. } => {
                let echoed = combined
                    .iter()
                    .any(|candidate| is_confirmed_echo(candidate, message));
                if !echoed {
                    merged.push((*message).clone());
                }
            }
            Delivery::Confirmed { message_id } => {
                if seen.insert(message_id.clone()) {
                    merged.push((*message).clone());
                }
            }
        }
    }

    merged.sort_by_key(|message| message.created_at);
    merged
}

#[cfg(test)]
#[path = "tests/merge_tests.rs"]
mod tests;
