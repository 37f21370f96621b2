//! Merges the legacy inline array and the normalized sub-store feed of one
//! conversation into a single timeline.
//!
//! The merge is a pure fold: legacy entries are installed first, then the
//! feed, keyed by message identity (or timestamp for id-less legacy
//! entries).  A later install under an existing key replaces the earlier
//! value in place, so the sub-store wins over the legacy array.  The result
//! is stably sorted by timestamp, which leaves equal timestamps in arrival
//! order.

use std::collections::HashMap;

use crate::model::{LegacyMessage, Message};

/// Merge both sources into one deduplicated timeline, ascending by timestamp.
pub fn merge_timeline(legacy: &[LegacyMessage], feed: &[Message]) -> Vec<Message> {
    merge_counting(legacy, feed).0
}

/// Same as [`merge_timeline`], also returning how many id-less legacy
/// entries were dropped because another legacy entry shared their timestamp.
fn merge_counting(legacy: &[LegacyMessage], feed: &[Message]) -> (Vec<Message>, usize) {
    let mut merged: Vec<Message> = Vec::with_capacity(legacy.len() + feed.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(legacy.len() + feed.len());
    let mut collisions = 0;

    for entry in legacy {
        let message = entry.to_message();
        match index.get(&message.id) {
            Some(&slot) => {
                if entry.id.as_deref().map_or(true, str::is_empty) {
                    collisions += 1;
                }
                merged[slot] = message;
            }
            None => {
                index.insert(message.id.clone(), merged.len());
                merged.push(message);
            }
        }
    }

    for message in feed {
        match index.get(&message.id) {
            Some(&slot) => merged[slot] = message.clone(),
            None => {
                index.insert(message.id.clone(), merged.len());
                merged.push(message.clone());
            }
        }
    }

    merged.sort_by_key(|m| m.timestamp);
    (merged, collisions)
}

/// Accumulated reconciliation state for the active conversation.
#[derive(Debug, Default)]
pub struct Reconciler {
    conversation_id: Option<String>,
    legacy: Vec<LegacyMessage>,
    feed: Vec<Message>,
    timeline: Vec<Message>,
    collisions: usize,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard everything accumulated so far and bind to `conversation_id`.
    pub fn reset(&mut self, conversation_id: Option<&str>) {
        self.conversation_id = conversation_id.map(str::to_string);
        self.legacy.clear();
        self.feed.clear();
        self.timeline.clear();
        self.collisions = 0;
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Install the legacy inline array. Returns whether the timeline changed.
    pub fn set_legacy(&mut self, legacy: &[LegacyMessage]) -> bool {
        if self.legacy == legacy {
            return false;
        }
        self.legacy = legacy.to_vec();
        self.recompute()
    }

    /// Install a sub-store snapshot. Returns whether the timeline changed.
    pub fn set_feed(&mut self, feed: Vec<Message>) -> bool {
        if self.feed == feed {
            return false;
        }
        self.feed = feed;
        self.recompute()
    }

    pub fn timeline(&self) -> &[Message] {
        &self.timeline
    }

    fn recompute(&mut self) -> bool {
        let (timeline, collisions) = merge_counting(&self.legacy, &self.feed);
        if collisions > 0 && collisions != self.collisions {
            crate::clog!(
                "reconciler: {} legacy message(s) in {} share a timestamp with another and were dropped",
                collisions,
                crate::logging::conv_id(self.conversation_id.as_deref().unwrap_or("?"))
            );
        }
        self.collisions = collisions;
        if timeline == self.timeline {
            return false;
        }
        self.timeline = timeline;
        true
    }
}
