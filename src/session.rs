//! The chat surface a UI drives: open, send, block, delete, plus the derived
//! state of the active conversation.
//!
//! A [`ChatSession`] owns every live subscription it opens.  Deliveries from
//! the store arrive on an internal channel and are applied by [`ChatSession::pump`];
//! each one carries the [`Tag`] it was subscribed with, and anything tagged
//! with a superseded generation is dropped before it can touch the timeline
//! of the conversation that replaced it.

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::blocking::{self, BlockAffordance, BlockError, BlockState};
use crate::media::{MediaUploader, UploadError, UploadFile};
use crate::model::{
    now_millis, Attachment, Conversation, Message, NewMessage, PresenceRecord, Viewer,
};
use crate::presence::{PresenceMonitor, PresenceState};
use crate::projector::{self, ConversationRow};
use crate::receipts::{ReadReceiptTracker, ReceiptOutcome};
use crate::reconciler::Reconciler;
use crate::storage::StorageError;
use crate::store::{
    ConversationField, ConversationUpdate, Delivery, DocumentStore, Query, Snapshot,
    SnapshotSink, Stream, SubscriptionId, Tag,
};
use crate::typing::TypingSignal;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SendError {
    /// The counterpart holds a block on this conversation.
    BlockedByOther,
    EmptyMessage,
    UnknownConversation(String),
    Upload(UploadError),
    Store(StorageError),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::BlockedByOther => write!(f, "you can no longer send messages here"),
            SendError::EmptyMessage => write!(f, "message has no text and no attachment"),
            SendError::UnknownConversation(id) => write!(f, "unknown conversation: {id}"),
            SendError::Upload(e) => write!(f, "upload failed, message not sent: {e}"),
            SendError::Store(e) => write!(f, "message not sent: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<StorageError> for SendError {
    fn from(e: StorageError) -> Self {
        SendError::Store(e)
    }
}

impl From<UploadError> for SendError {
    fn from(e: UploadError) -> Self {
        SendError::Upload(e)
    }
}

#[derive(Debug)]
pub enum ConversationError {
    UnknownConversation(String),
    /// Broadcast conversations cannot be deleted by a participant.
    Broadcast,
    InvalidParticipants(String),
    Store(StorageError),
}

impl std::fmt::Display for ConversationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationError::UnknownConversation(id) => write!(f, "unknown conversation: {id}"),
            ConversationError::Broadcast => {
                write!(f, "broadcast conversations cannot be deleted")
            }
            ConversationError::InvalidParticipants(reason) => {
                write!(f, "invalid participants: {reason}")
            }
            ConversationError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for ConversationError {}

impl From<StorageError> for ConversationError {
    fn from(e: StorageError) -> Self {
        ConversationError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct ActiveConversation {
    id: String,
    record: Option<Conversation>,
    /// Set once the first message snapshot has arrived.
    feed_loaded: bool,
    subscriptions: Vec<SubscriptionId>,
}

pub struct ChatSession<S: DocumentStore> {
    store: S,
    viewer: Viewer,
    sink: SnapshotSink,
    inbox: mpsc::UnboundedReceiver<Delivery>,
    /// Bumped on every open/close of the active conversation.
    generation: u64,
    active: Option<ActiveConversation>,
    reconciler: Reconciler,
    presence: PresenceMonitor,
    receipts: ReadReceiptTracker,
    last_receipt: Option<ReceiptOutcome>,
    list_generation: u64,
    list_subscription: Option<SubscriptionId>,
    conversations: Vec<Conversation>,
    typing: TypingSignal,
}

impl<S: DocumentStore> ChatSession<S> {
    pub fn new(store: S, viewer: Viewer) -> Self {
        let (sink, inbox) = mpsc::unbounded_channel();
        let receipts = ReadReceiptTracker::new(viewer.user_id.clone());
        Self {
            store,
            viewer,
            sink,
            inbox,
            generation: 0,
            active: None,
            reconciler: Reconciler::new(),
            presence: PresenceMonitor::new(),
            receipts,
            last_receipt: None,
            list_generation: 0,
            list_subscription: None,
            conversations: Vec::new(),
            typing: TypingSignal::new(),
        }
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Follow every conversation the viewer participates in.
    pub fn watch_conversation_list(&mut self) -> Result<(), StorageError> {
        if let Some(id) = self.list_subscription.take() {
            self.store.unsubscribe(id);
        }
        self.list_generation += 1;
        let query = Query::ConversationsFor {
            user_id: self.viewer.user_id.clone(),
        };
        let tag = Tag::new(Stream::ConversationList, self.list_generation);
        self.list_subscription = Some(self.store.subscribe(query, tag, self.sink.clone())?);
        Ok(())
    }

    /// Make `conversation_id` the active conversation.
    ///
    /// Accumulated timeline state is cleared and the generation bumped before
    /// the old subscriptions are released, so nothing still queued for the
    /// previous conversation can land in this one.
    pub fn open_conversation(&mut self, conversation_id: &str) -> Result<(), StorageError> {
        if self.active_conversation_id() == Some(conversation_id) {
            return Ok(());
        }
        self.flush_typing();
        self.generation += 1;
        self.reconciler.reset(Some(conversation_id));
        self.last_receipt = None;
        self.release_active();

        let mut active = ActiveConversation {
            id: conversation_id.to_string(),
            record: None,
            feed_loaded: false,
            subscriptions: Vec::new(),
        };
        let queries = [
            (
                Query::Conversation {
                    conversation_id: conversation_id.to_string(),
                },
                Stream::Conversation,
            ),
            (
                Query::Messages {
                    conversation_id: conversation_id.to_string(),
                },
                Stream::Messages,
            ),
        ];
        for (query, stream) in queries {
            match self
                .store
                .subscribe(query, Tag::new(stream, self.generation), self.sink.clone())
            {
                Ok(id) => active.subscriptions.push(id),
                Err(e) => {
                    for id in active.subscriptions {
                        self.store.unsubscribe(id);
                    }
                    self.reconciler.reset(None);
                    return Err(e);
                }
            }
        }

        crate::clog!(
            "session: {} opened {} (generation {})",
            crate::logging::user_id(&self.viewer.user_id),
            crate::logging::conv_id(conversation_id),
            self.generation
        );
        self.active = Some(active);
        Ok(())
    }

    /// Tear down the active conversation view, if any.
    pub fn close_conversation(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.flush_typing();
        self.generation += 1;
        self.reconciler.reset(None);
        self.last_receipt = None;
        self.release_active();
    }

    fn release_active(&mut self) {
        if let Some(previous) = self.active.take() {
            for id in previous.subscriptions {
                self.store.unsubscribe(id);
            }
        }
        self.presence.release(&mut self.store);
    }

    /// Apply every delivery queued so far.  Returns how many were accepted.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(delivery) = self.inbox.try_recv() {
            if self.apply(delivery) {
                applied += 1;
            }
        }
        applied
    }

    /// Apply one delivery.  Returns false when it was stale or irrelevant.
    pub fn apply(&mut self, delivery: Delivery) -> bool {
        let Delivery { tag, snapshot } = delivery;
        match tag.stream {
            Stream::Presence => self.presence.apply(tag, snapshot),
            Stream::ConversationList => self.apply_list(tag, snapshot),
            Stream::Conversation | Stream::Messages => self.apply_active(tag, snapshot),
        }
    }

    fn apply_list(&mut self, tag: Tag, snapshot: Snapshot) -> bool {
        if tag.generation != self.list_generation || self.list_subscription.is_none() {
            return false;
        }
        match snapshot {
            Snapshot::Conversations(list) => self.conversations = list,
            Snapshot::Failed(reason) => {
                crate::clog!("session: conversation list unavailable, keeping last view: {}", reason);
            }
            _ => return false,
        }
        true
    }

    fn apply_active(&mut self, tag: Tag, snapshot: Snapshot) -> bool {
        if tag.generation != self.generation {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        let timeline_changed = match (tag.stream, snapshot) {
            (Stream::Conversation, Snapshot::Conversation(Some(record))) => {
                let changed = self.reconciler.set_legacy(&record.legacy_messages);
                let counterpart = record.counterpart(&self.viewer.user_id).map(str::to_string);
                self.presence
                    .follow(&mut self.store, counterpart.as_deref(), &self.sink);
                active.record = Some(record);
                changed
            }
            (Stream::Conversation, Snapshot::Conversation(None)) => {
                crate::clog!(
                    "session: {} no longer exists",
                    crate::logging::conv_id(&active.id)
                );
                active.record = None;
                self.presence.release(&mut self.store);
                self.reconciler.set_legacy(&[])
            }
            (Stream::Messages, Snapshot::Messages(feed)) => {
                active.feed_loaded = true;
                self.reconciler.set_feed(feed)
            }
            (_, Snapshot::Failed(reason)) => {
                crate::clog!(
                    "session: live query for {} failed, keeping last view: {}",
                    crate::logging::conv_id(&active.id),
                    reason
                );
                return true;
            }
            _ => return false,
        };

        let counter = active
            .record
            .as_ref()
            .map_or(0, |c| c.unread_for(&self.viewer.user_id));
        if timeline_changed || counter > 0 {
            self.mark_read();
        }
        true
    }

    /// Commit read receipts once both the record and the messages are known.
    fn mark_read(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.feed_loaded {
            return;
        }
        let Some(record) = active.record.as_mut() else {
            return;
        };
        let counter = record.unread_for(&self.viewer.user_id);
        let outcome =
            self.receipts
                .commit(&mut self.store, &active.id, self.reconciler.timeline(), counter);
        if matches!(outcome, ReceiptOutcome::Committed { .. }) {
            // The store echo will confirm; until then don't plan another reset.
            record.unread.remove(&self.viewer.user_id);
        }
        self.last_receipt = Some(outcome);
    }

    // -----------------------------------------------------------------------
    // Derived state
    // -----------------------------------------------------------------------

    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.id.as_str())
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|a| a.record.as_ref())
    }

    /// Merged timeline of the active conversation.
    pub fn timeline(&self) -> &[Message] {
        self.reconciler.timeline()
    }

    /// Outcome of the most recent read-receipt commit for the active
    /// conversation.
    pub fn last_receipt(&self) -> Option<&ReceiptOutcome> {
        self.last_receipt.as_ref()
    }

    /// Counterpart presence, or `None` when the active conversation has no
    /// single counterpart.
    pub fn presence(&self, now_ms: u64) -> Option<PresenceState> {
        self.presence.counterpart()?;
        Some(self.presence.state(now_ms))
    }

    pub fn block_state(&self) -> Option<BlockState> {
        blocking::resolve(self.active_conversation()?, &self.viewer.user_id)
    }

    pub fn block_affordance(&self) -> Option<BlockAffordance> {
        blocking::affordance(self.active_conversation()?, &self.viewer.user_id)
    }

    /// Other participants currently flagged as typing in the active
    /// conversation.
    pub fn typing_others(&self) -> Vec<String> {
        self.active_conversation()
            .map(|c| {
                c.typing_others(&self.viewer.user_id)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Conversation list rows matching `filter`.
    pub fn conversation_list(&self, filter: &str) -> Vec<ConversationRow> {
        projector::project(
            &self.conversations,
            filter,
            &self.viewer.user_id,
            self.active_conversation_id(),
        )
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// The active record when it matches, else a one-off read.
    fn lookup(&self, conversation_id: &str) -> Result<Option<Conversation>, StorageError> {
        if let Some(record) = self
            .active
            .as_ref()
            .filter(|a| a.id == conversation_id)
            .and_then(|a| a.record.as_ref())
        {
            return Ok(Some(record.clone()));
        }
        self.store.get_conversation(conversation_id)
    }

    /// Send a message with an optional attachment.
    ///
    /// Rejected before any upload or store write when the counterpart holds a
    /// block.  The attachment is uploaded first; if that fails nothing is
    /// written.
    ///
    /// The early check reads the active record, which lags a counterpart's
    /// block until the next [`pump`](Self::pump).  The store re-checks the
    /// block when the message is written, so a send in that window still
    /// fails with [`SendError::BlockedByOther`], after the upload.
    pub async fn send_message<U: MediaUploader>(
        &mut self,
        conversation_id: &str,
        body: &str,
        attachment: Option<UploadFile>,
        uploader: &U,
    ) -> Result<String, SendError> {
        let conversation = self
            .lookup(conversation_id)?
            .filter(|c| c.has_participant(&self.viewer.user_id))
            .ok_or_else(|| SendError::UnknownConversation(conversation_id.to_string()))?;
        if !blocking::can_send(&conversation, &self.viewer.user_id) {
            crate::clog!(
                "send: {} is blocked by the other participant, not sending",
                crate::logging::conv_id(conversation_id)
            );
            return Err(SendError::BlockedByOther);
        }

        let body = body.trim();
        if body.is_empty() && attachment.is_none() {
            return Err(SendError::EmptyMessage);
        }

        let attachment = match attachment {
            Some(file) => {
                let url = uploader.upload(&file).await.map_err(|e| {
                    crate::clog!("send: upload of {} failed: {}", file.name, e);
                    SendError::Upload(e)
                })?;
                Some(Attachment {
                    kind: file.kind(),
                    url,
                    name: Some(file.name),
                })
            }
            None => None,
        };

        let message = NewMessage {
            sender_id: self.viewer.user_id.clone(),
            sender_name: self.viewer.display_name.clone(),
            body: (!body.is_empty()).then(|| body.to_string()),
            attachment,
            timestamp: now_millis(),
        };
        let message_id = self.store.add_message(conversation_id, &message).map_err(|e| {
            crate::clog!(
                "send: storing message in {} failed: {}",
                crate::logging::conv_id(conversation_id),
                e
            );
            match e {
                StorageError::Conflict(_) => SendError::BlockedByOther,
                other => SendError::Store(other),
            }
        })?;

        let mut update = ConversationUpdate::new(conversation_id).field(
            ConversationField::LastMessage {
                text: message.preview(),
                at: message.timestamp,
            },
        );
        for participant in &conversation.participants {
            if participant != &self.viewer.user_id {
                update = update.field(ConversationField::IncrementUnread {
                    user_id: participant.clone(),
                    by: 1,
                });
            }
        }
        if self.typing.stop().is_some() {
            update = update.field(ConversationField::Typing {
                user_id: self.viewer.user_id.clone(),
                typing: false,
            });
        }
        // The message itself is stored; a stale summary heals on the next send.
        if let Err(e) = self.store.update_conversation(&update) {
            crate::clog!(
                "send: {} stored but summary update for {} failed: {}",
                crate::logging::msg_id(&message_id),
                crate::logging::conv_id(conversation_id),
                e
            );
        }

        crate::clog!(
            "send: {} -> {} as {}",
            crate::logging::user_id(&self.viewer.user_id),
            crate::logging::conv_id(conversation_id),
            crate::logging::msg_id(&message_id)
        );
        Ok(message_id)
    }

    /// Block or unblock the counterpart.  Returns the resulting block state.
    ///
    /// Decided on a fresh read; the store write is conditional on the stored
    /// block and a lost race surfaces as [`BlockError::HeldByOther`].
    pub fn toggle_block(&mut self, conversation_id: &str) -> Result<BlockState, BlockError> {
        let mut conversation = self
            .store
            .get_conversation(conversation_id)?
            .filter(|c| c.has_participant(&self.viewer.user_id))
            .ok_or_else(|| BlockError::UnknownConversation(conversation_id.to_string()))?;
        let field = blocking::toggle_fields(&conversation, &self.viewer.user_id)?;
        if conversation.blocked && conversation.blocked_by.is_none() {
            crate::clog!(
                "block: {} had no recorded holder, lifting",
                crate::logging::conv_id(conversation_id)
            );
        }
        self.store
            .update_conversation(&ConversationUpdate::new(conversation_id).field(field.clone()))
            .map_err(|e| match e {
                StorageError::Conflict(reason) => {
                    crate::clog!(
                        "block: write lost for {}: {}",
                        crate::logging::conv_id(conversation_id),
                        reason
                    );
                    BlockError::HeldByOther
                }
                StorageError::NotFound(_) => {
                    BlockError::UnknownConversation(conversation_id.to_string())
                }
                other => BlockError::Store(other),
            })?;

        if let ConversationField::Block { by, blocked } = field {
            conversation.blocked = blocked;
            conversation.blocked_by = blocked.then_some(by);
        }
        if let Some(record) = self
            .active
            .as_mut()
            .filter(|a| a.id == conversation_id)
            .and_then(|a| a.record.as_mut())
        {
            record.blocked = conversation.blocked;
            record.blocked_by = conversation.blocked_by.clone();
        }
        let state = blocking::resolve(&conversation, &self.viewer.user_id).unwrap_or_default();
        crate::clog!(
            "block: {} {} {}",
            crate::logging::user_id(&self.viewer.user_id),
            if state.is_blocked { "blocked" } else { "unblocked" },
            crate::logging::conv_id(conversation_id)
        );
        Ok(state)
    }

    /// Delete a direct conversation with all its messages and counters.
    pub fn delete_conversation(&mut self, conversation_id: &str) -> Result<(), ConversationError> {
        let conversation = self
            .lookup(conversation_id)?
            .filter(|c| c.has_participant(&self.viewer.user_id))
            .ok_or_else(|| ConversationError::UnknownConversation(conversation_id.to_string()))?;
        if !conversation.is_direct() {
            return Err(ConversationError::Broadcast);
        }
        if self.active_conversation_id() == Some(conversation_id) {
            self.close_conversation();
        }
        self.store
            .delete_conversation(conversation_id)
            .map_err(|e| match e {
                StorageError::NotFound(_) => {
                    ConversationError::UnknownConversation(conversation_id.to_string())
                }
                other => ConversationError::Store(other),
            })?;
        crate::clog!(
            "session: {} deleted {}",
            crate::logging::user_id(&self.viewer.user_id),
            crate::logging::conv_id(conversation_id)
        );
        Ok(())
    }

    /// Find the direct conversation with `other_id`, creating it if needed.
    pub fn start_direct_conversation(
        &mut self,
        other_id: &str,
        title: &str,
    ) -> Result<Conversation, ConversationError> {
        let other_id = other_id.trim();
        if other_id.is_empty() || other_id == self.viewer.user_id {
            return Err(ConversationError::InvalidParticipants(format!(
                "cannot start a conversation with {other_id:?}"
            )));
        }
        if let Some(existing) = self
            .store
            .find_direct_conversation(&self.viewer.user_id, other_id)?
        {
            return Ok(existing);
        }

        let id = direct_conversation_id(&self.viewer.user_id, other_id);
        let conversation = Conversation::direct(id, title, &self.viewer.user_id, other_id);
        match self.store.create_conversation(&conversation) {
            Ok(()) => {}
            // Someone else created it between our lookup and insert.
            Err(StorageError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store
            .get_conversation(&conversation.id)?
            .ok_or_else(|| ConversationError::UnknownConversation(conversation.id.clone()))
    }

    /// Create a broadcast conversation shared by the viewer and `participants`.
    pub fn create_broadcast_conversation(
        &mut self,
        title: &str,
        participants: &[String],
    ) -> Result<Conversation, ConversationError> {
        let mut members = vec![self.viewer.user_id.clone()];
        for p in participants {
            let p = p.trim();
            if !p.is_empty() && !members.iter().any(|m| m == p) {
                members.push(p.to_string());
            }
        }
        if members.len() < 2 {
            return Err(ConversationError::InvalidParticipants(
                "a broadcast needs at least one other participant".to_string(),
            ));
        }

        let id = broadcast_conversation_id(title, &members);
        let conversation = Conversation::broadcast(id, title, members);
        self.store.create_conversation(&conversation)?;
        crate::clog!(
            "session: {} created broadcast {} with {} participant(s)",
            crate::logging::user_id(&self.viewer.user_id),
            crate::logging::conv_id(&conversation.id),
            conversation.participants.len()
        );
        Ok(conversation)
    }

    pub fn go_online(&mut self) -> Result<(), StorageError> {
        self.write_presence(true)
    }

    pub fn go_offline(&mut self) -> Result<(), StorageError> {
        self.write_presence(false)
    }

    fn write_presence(&mut self, online: bool) -> Result<(), StorageError> {
        self.store.set_presence(&PresenceRecord {
            user_id: self.viewer.user_id.clone(),
            online,
            last_active: Some(now_millis()),
        })
    }

    // -----------------------------------------------------------------------
    // Typing
    // -----------------------------------------------------------------------

    /// Composer keystroke in the active conversation.
    pub fn on_composer_input(&mut self, now_ms: u64) {
        if self.active.is_none() {
            return;
        }
        if let Some(typing) = self.typing.on_keystroke(now_ms) {
            self.write_typing(typing);
        }
    }

    /// Drive the typing idle timer.
    pub fn tick(&mut self, now_ms: u64) {
        if let Some(typing) = self.typing.poll(now_ms) {
            self.write_typing(typing);
        }
    }

    fn flush_typing(&mut self) {
        if let Some(typing) = self.typing.stop() {
            self.write_typing(typing);
        }
    }

    fn write_typing(&mut self, typing: bool) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let update = ConversationUpdate::new(active.id.as_str()).field(ConversationField::Typing {
            user_id: self.viewer.user_id.clone(),
            typing,
        });
        if let Err(e) = self.store.update_conversation(&update) {
            crate::clog!(
                "typing: flag update for {} failed: {}",
                crate::logging::conv_id(&active.id),
                e
            );
        }
    }
}

impl<S: DocumentStore> Drop for ChatSession<S> {
    fn drop(&mut self) {
        if let Some(id) = self.list_subscription.take() {
            self.store.unsubscribe(id);
        }
        self.release_active();
    }
}

/// Stable id for the direct conversation between two identities, independent
/// of who starts it.
pub fn direct_conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update([0u8]);
    hasher.update(hi.as_bytes());
    format!("d-{}", hex::encode(&hasher.finalize()[..12]))
}

fn broadcast_conversation_id(title: &str, members: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    for m in members {
        hasher.update([0u8]);
        hasher.update(m.as_bytes());
    }
    hasher.update(now_millis().to_be_bytes());
    format!("b-{}", hex::encode(&hasher.finalize()[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn session(user: &str) -> ChatSession<Storage> {
        ChatSession::new(Storage::open_in_memory().unwrap(), Viewer::new(user, user))
    }

    #[test]
    fn direct_id_is_order_independent() {
        assert_eq!(
            direct_conversation_id("alice", "bob"),
            direct_conversation_id("bob", "alice")
        );
        assert_ne!(
            direct_conversation_id("alice", "bob"),
            direct_conversation_id("alice", "carol")
        );
    }

    #[test]
    fn start_direct_is_find_or_create() {
        let mut s = session("alice");
        let first = s.start_direct_conversation("bob", "Desk lamp").unwrap();
        let again = s.start_direct_conversation("bob", "Other title").unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.title, "Desk lamp");
        assert!(matches!(
            s.start_direct_conversation("alice", "me"),
            Err(ConversationError::InvalidParticipants(_))
        ));
    }

    #[test]
    fn open_delivers_initial_snapshots() {
        let mut s = session("alice");
        let c = s.start_direct_conversation("bob", "Desk lamp").unwrap();
        s.open_conversation(&c.id).unwrap();
        assert!(s.pump() >= 2);
        assert_eq!(s.active_conversation().unwrap().id, c.id);
        assert_eq!(s.presence(0), Some(PresenceState::Offline));
        assert_eq!(s.block_state(), Some(BlockState::default()));
    }

    #[test]
    fn close_releases_everything() {
        let mut s = session("alice");
        let c = s.start_direct_conversation("bob", "Desk lamp").unwrap();
        s.open_conversation(&c.id).unwrap();
        s.pump();
        assert_eq!(s.store().subscription_count(), 3);
        s.close_conversation();
        assert_eq!(s.store().subscription_count(), 0);
        assert!(s.timeline().is_empty());
        assert!(s.presence(0).is_none());
    }

    #[test]
    fn broadcast_cannot_be_deleted() {
        let mut s = session("alice");
        let b = s
            .create_broadcast_conversation("Hall 3", &["bob".to_string(), "carol".to_string()])
            .unwrap();
        assert!(matches!(
            s.delete_conversation(&b.id),
            Err(ConversationError::Broadcast)
        ));
        assert!(matches!(
            s.create_broadcast_conversation("Solo", &["alice".to_string()]),
            Err(ConversationError::InvalidParticipants(_))
        ));
    }
}
