//! Counterpart presence for direct conversations.

use crate::model::PresenceRecord;
use crate::store::{DocumentStore, Query, Snapshot, SnapshotSink, Stream, SubscriptionId, Tag};

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    /// Offline with a known last-active time, e.g. "5m ago".
    LastActive(String),
    Offline,
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceState::Online => write!(f, "online"),
            PresenceState::LastActive(label) => write!(f, "active {label}"),
            PresenceState::Offline => write!(f, "offline"),
        }
    }
}

/// Relative label for the time elapsed since last activity.
pub fn relative_label(elapsed_ms: u64) -> String {
    if elapsed_ms < MINUTE_MS {
        "just now".to_string()
    } else if elapsed_ms < HOUR_MS {
        format!("{}m ago", elapsed_ms / MINUTE_MS)
    } else if elapsed_ms < DAY_MS {
        format!("{}h ago", elapsed_ms / HOUR_MS)
    } else {
        "a while ago".to_string()
    }
}

pub fn derive_presence(record: Option<&PresenceRecord>, now_ms: u64) -> PresenceState {
    match record {
        Some(r) if r.online => PresenceState::Online,
        Some(PresenceRecord {
            last_active: Some(at),
            ..
        }) => PresenceState::LastActive(relative_label(now_ms.saturating_sub(*at))),
        _ => PresenceState::Offline,
    }
}

/// Holds at most one presence subscription, for the current counterpart.
#[derive(Debug, Default)]
pub struct PresenceMonitor {
    counterpart: Option<String>,
    subscription: Option<SubscriptionId>,
    generation: u64,
    record: Option<PresenceRecord>,
}

impl PresenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counterpart(&self) -> Option<&str> {
        self.counterpart.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Point the monitor at `counterpart`.  Passing the same identity again
    /// is a no-op; a different one (or `None`) tears the old subscription
    /// down first.  A failed subscribe leaves the monitor showing offline.
    pub fn follow<S: DocumentStore>(
        &mut self,
        store: &mut S,
        counterpart: Option<&str>,
        sink: &SnapshotSink,
    ) {
        if self.counterpart.as_deref() == counterpart {
            return;
        }
        self.release(store);

        let Some(user_id) = counterpart else {
            return;
        };
        self.counterpart = Some(user_id.to_string());
        let query = Query::Presence {
            user_id: user_id.to_string(),
        };
        match store.subscribe(query, Tag::new(Stream::Presence, self.generation), sink.clone()) {
            Ok(id) => self.subscription = Some(id),
            Err(e) => crate::clog!(
                "presence: cannot watch {}, showing offline: {}",
                crate::logging::user_id(user_id),
                e
            ),
        }
    }

    /// Drop the subscription and forget the counterpart.
    pub fn release<S: DocumentStore>(&mut self, store: &mut S) {
        if let Some(id) = self.subscription.take() {
            store.unsubscribe(id);
        }
        self.generation += 1;
        self.counterpart = None;
        self.record = None;
    }

    /// Apply a presence delivery.  Returns false when the tag is stale.
    pub fn apply(&mut self, tag: Tag, snapshot: Snapshot) -> bool {
        if tag.stream != Stream::Presence || tag.generation != self.generation {
            return false;
        }
        match snapshot {
            Snapshot::Presence(record) => self.record = record,
            Snapshot::Failed(reason) => {
                crate::clog!("presence: live status unavailable, showing offline: {}", reason);
                self.record = None;
            }
            _ => return false,
        }
        true
    }

    pub fn state(&self, now_ms: u64) -> PresenceState {
        if self.counterpart.is_none() {
            return PresenceState::Offline;
        }
        derive_presence(self.record.as_ref(), now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_760_000_000_000;

    fn record(online: bool, last_active: Option<u64>) -> PresenceRecord {
        PresenceRecord {
            user_id: "bob".to_string(),
            online,
            last_active,
        }
    }

    #[test]
    fn label_thresholds() {
        let at = |ms: u64| derive_presence(Some(&record(false, Some(NOW - ms))), NOW);
        assert_eq!(at(30 * 1000), PresenceState::LastActive("just now".into()));
        assert_eq!(at(45 * MINUTE_MS), PresenceState::LastActive("45m ago".into()));
        assert_eq!(at(5 * HOUR_MS), PresenceState::LastActive("5h ago".into()));
        assert_eq!(at(2 * DAY_MS), PresenceState::LastActive("a while ago".into()));
    }

    #[test]
    fn boundaries_round_down() {
        assert_eq!(relative_label(MINUTE_MS - 1), "just now");
        assert_eq!(relative_label(MINUTE_MS), "1m ago");
        assert_eq!(relative_label(HOUR_MS - 1), "59m ago");
        assert_eq!(relative_label(DAY_MS - 1), "23h ago");
        assert_eq!(relative_label(DAY_MS), "a while ago");
    }

    #[test]
    fn online_flag_wins_over_last_active() {
        let r = record(true, Some(NOW - 3 * DAY_MS));
        assert_eq!(derive_presence(Some(&r), NOW), PresenceState::Online);
    }

    #[test]
    fn missing_record_or_timestamp_is_offline() {
        assert_eq!(derive_presence(None, NOW), PresenceState::Offline);
        assert_eq!(
            derive_presence(Some(&record(false, None)), NOW),
            PresenceState::Offline
        );
    }

    #[test]
    fn future_last_active_reads_as_just_now() {
        let r = record(false, Some(NOW + 5_000));
        assert_eq!(
            derive_presence(Some(&r), NOW),
            PresenceState::LastActive("just now".into())
        );
    }

    #[test]
    fn stale_or_foreign_tags_are_ignored() {
        let mut monitor = PresenceMonitor::new();
        monitor.counterpart = Some("bob".to_string());
        let current = Tag::new(Stream::Presence, monitor.generation());
        let stale = Tag::new(Stream::Presence, monitor.generation() + 7);

        assert!(!monitor.apply(stale, Snapshot::Presence(Some(record(true, None)))));
        assert_eq!(monitor.state(NOW), PresenceState::Offline);

        assert!(monitor.apply(current, Snapshot::Presence(Some(record(true, None)))));
        assert_eq!(monitor.state(NOW), PresenceState::Online);

        assert!(monitor.apply(current, Snapshot::Failed("boom".into())));
        assert_eq!(monitor.state(NOW), PresenceState::Offline);
    }
}
