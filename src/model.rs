//! Conversation, message and presence records as they live in the document
//! store.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Maximum number of messages kept in a conversation's legacy inline array.
pub const LEGACY_INLINE_LIMIT: usize = 100;

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The identity every component acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: String,
    pub display_name: String,
}

impl Viewer {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Broadcast,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Broadcast => "broadcast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationKind::Direct),
            "broadcast" => Some(ConversationKind::Broadcast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "read" => DeliveryStatus::Read,
            _ => DeliveryStatus::Sent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(AttachmentKind::Image),
            "file" => Some(AttachmentKind::File),
            _ => None,
        }
    }

    /// Conversation-list preview for a message that carries only this attachment.
    pub fn preview(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "Sent a photo",
            AttachmentKind::File => "Sent a file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Opaque URL returned by the media uploader.
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A message in the canonical timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    /// Wall-clock milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub status: DeliveryStatus,
}

impl Message {
    /// Text shown in the conversation list for this message.
    pub fn preview(&self) -> String {
        preview_text(self.body.as_deref(), self.attachment.as_ref())
    }
}

fn preview_text(body: Option<&str>, attachment: Option<&Attachment>) -> String {
    match (body, attachment) {
        (Some(body), _) if !body.trim().is_empty() => body.to_string(),
        (_, Some(att)) => att.kind.preview().to_string(),
        _ => String::new(),
    }
}

/// A message as stored in the legacy inline array of a conversation record.
///
/// Entries written before store-assigned identities existed carry no `id`;
/// their identity is synthesized from the timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    pub timestamp: u64,
    #[serde(default)]
    pub status: DeliveryStatus,
}

impl LegacyMessage {
    /// Identity used for deduplication: the stored id, else the timestamp.
    pub fn merge_key(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.timestamp.to_string(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message {
            id: self.merge_key(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            body: self.body.clone(),
            attachment: self.attachment.clone(),
            timestamp: self.timestamp,
            status: self.status,
        }
    }
}

/// Fields of a message supplied by the sender; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    pub timestamp: u64,
}

impl NewMessage {
    pub fn preview(&self) -> String {
        preview_text(self.body.as_deref(), self.attachment.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub title: String,
    pub participants: Vec<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<u64>,
    /// Unread counter per recipient.
    #[serde(default)]
    pub unread: BTreeMap<String, u32>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub blocked_by: Option<String>,
    #[serde(default)]
    pub typing: BTreeMap<String, bool>,
    #[serde(default)]
    pub legacy_messages: Vec<LegacyMessage>,
    pub created_at: u64,
}

impl Conversation {
    pub fn direct(id: impl Into<String>, title: impl Into<String>, a: &str, b: &str) -> Self {
        Self::new(id, ConversationKind::Direct, title, vec![a.to_string(), b.to_string()])
    }

    pub fn broadcast(
        id: impl Into<String>,
        title: impl Into<String>,
        participants: Vec<String>,
    ) -> Self {
        Self::new(id, ConversationKind::Broadcast, title, participants)
    }

    fn new(
        id: impl Into<String>,
        kind: ConversationKind,
        title: impl Into<String>,
        participants: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            participants,
            last_message: None,
            last_message_at: None,
            unread: BTreeMap::new(),
            blocked: false,
            blocked_by: None,
            typing: BTreeMap::new(),
            legacy_messages: Vec::new(),
            created_at: now_millis(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ConversationKind::Direct
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// The other participant of a direct conversation.
    pub fn counterpart(&self, viewer_id: &str) -> Option<&str> {
        if !self.is_direct() {
            return None;
        }
        self.participants
            .iter()
            .find(|p| p.as_str() != viewer_id)
            .map(String::as_str)
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }

    /// Participants other than `user_id` currently flagged as typing.
    pub fn typing_others(&self, user_id: &str) -> Vec<&str> {
        self.typing
            .iter()
            .filter(|(who, typing)| **typing && who.as_str() != user_id)
            .map(|(who, _)| who.as_str())
            .collect()
    }
}

/// Live status document owned by one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub online: bool,
    #[serde(default)]
    pub last_active: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy(id: Option<&str>, ts: u64) -> LegacyMessage {
        LegacyMessage {
            id: id.map(str::to_string),
            sender_id: "alice".to_string(),
            sender_name: "Alice".to_string(),
            body: Some("hi".to_string()),
            attachment: None,
            timestamp: ts,
            status: DeliveryStatus::Sent,
        }
    }

    #[test]
    fn legacy_without_id_falls_back_to_timestamp() {
        assert_eq!(legacy(None, 1_700_000_000_123).merge_key(), "1700000000123");
        assert_eq!(legacy(Some(""), 5).merge_key(), "5");
        assert_eq!(legacy(Some("abc"), 5).merge_key(), "abc");
        assert_eq!(legacy(None, 7).to_message().id, "7");
    }

    #[test]
    fn legacy_json_without_status_defaults_to_sent() {
        let m: LegacyMessage =
            serde_json::from_str(r#"{"sender_id":"bob","timestamp":10,"body":"yo"}"#).unwrap();
        assert_eq!(m.status, DeliveryStatus::Sent);
        assert!(m.id.is_none());
    }

    #[test]
    fn counterpart_only_for_direct() {
        let direct = Conversation::direct("c1", "Bike for sale", "alice", "bob");
        assert_eq!(direct.counterpart("alice"), Some("bob"));
        assert_eq!(direct.counterpart("bob"), Some("alice"));

        let broadcast = Conversation::broadcast(
            "c2",
            "Dorm 4",
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
        );
        assert_eq!(broadcast.counterpart("alice"), None);
    }

    #[test]
    fn attachment_only_preview() {
        let msg = Message {
            id: "m1".to_string(),
            sender_id: "alice".to_string(),
            sender_name: "Alice".to_string(),
            body: None,
            attachment: Some(Attachment {
                kind: AttachmentKind::Image,
                url: "file:///tmp/x.png".to_string(),
                name: None,
            }),
            timestamp: 1,
            status: DeliveryStatus::Sent,
        };
        assert_eq!(msg.preview(), "Sent a photo");
    }
}
