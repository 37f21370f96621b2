//! Conversation list rows for the viewer.

use serde::Serialize;

use crate::model::Conversation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub title: String,
    pub preview: Option<String>,
    pub last_message_at: Option<u64>,
    /// Unread count to display, if any.
    pub unread_badge: Option<u32>,
}

/// Case-insensitive substring match on title or last-message preview.
pub fn matches_filter(conversation: &Conversation, filter: &str) -> bool {
    let needle = filter.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    conversation.title.to_lowercase().contains(&needle)
        || conversation
            .last_message
            .as_deref()
            .is_some_and(|preview| preview.to_lowercase().contains(&needle))
}

/// Filter `conversations` keeping upstream order; the badge is hidden for
/// the active conversation.
pub fn project(
    conversations: &[Conversation],
    filter: &str,
    viewer_id: &str,
    active_id: Option<&str>,
) -> Vec<ConversationRow> {
    conversations
        .iter()
        .filter(|c| matches_filter(c, filter))
        .map(|c| {
            let unread = c.unread_for(viewer_id);
            let is_active = active_id == Some(c.id.as_str());
            ConversationRow {
                conversation_id: c.id.clone(),
                title: c.title.clone(),
                preview: c.last_message.clone(),
                last_message_at: c.last_message_at,
                unread_badge: (!is_active && unread > 0).then_some(unread),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: &str, title: &str, preview: &str) -> Conversation {
        let mut c = Conversation::direct(id, title, "me", "them");
        c.last_message = Some(preview.to_string());
        c
    }

    #[test]
    fn filter_matches_preview_case_insensitively() {
        let list = vec![
            conv("1", "Mini fridge", "Sent a photo"),
            conv("2", "Lecture Notes", "See you there"),
        ];
        let rows = project(&list, "photo", "me", None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].conversation_id, "1");

        let rows = project(&list, "LECTURE", "me", None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].conversation_id, "2");
    }

    #[test]
    fn empty_filter_keeps_upstream_order() {
        let list = vec![conv("b", "B", "x"), conv("a", "A", "y"), conv("c", "C", "z")];
        let ids: Vec<String> = project(&list, "  ", "me", None)
            .into_iter()
            .map(|r| r.conversation_id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn badge_hidden_for_active_and_zero_counts() {
        let mut busy = conv("1", "Couch", "still available?");
        busy.unread.insert("me".to_string(), 3);
        let mut also_busy = conv("2", "Lamp", "ok");
        also_busy.unread.insert("me".to_string(), 2);
        also_busy.unread.insert("them".to_string(), 9);
        let quiet = conv("3", "Desk", "thanks");

        let rows = project(&[busy, also_busy, quiet], "", "me", Some("2"));
        assert_eq!(rows[0].unread_badge, Some(3));
        assert_eq!(rows[1].unread_badge, None);
        assert_eq!(rows[2].unread_badge, None);
    }
}
