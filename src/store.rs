//! The document-store collaborator as seen by the sync engine.
//!
//! Live queries push [`Snapshot`]s into a [`SnapshotSink`] instead of being
//! polled.  Every subscription is opened with a [`Tag`] that the store echoes
//! back unchanged on each [`Delivery`], so the consumer can tell which
//! subscription generation a snapshot belongs to even after it has
//! unsubscribed.
//!
//! Writes are expressed as targeted [`ConversationField`] updates rather than
//! whole-document overwrites, and read receipts go through an all-or-nothing
//! [`WriteBatch`].

use tokio::sync::mpsc;

use crate::model::{Conversation, DeliveryStatus, Message, NewMessage, PresenceRecord};
use crate::storage::StorageError;

/// Which live stream a delivery belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Conversation,
    Messages,
    Presence,
    ConversationList,
}

/// Subscription tag echoed by the store on every delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub stream: Stream,
    pub generation: u64,
}

impl Tag {
    pub fn new(stream: Stream, generation: u64) -> Self {
        Self { stream, generation }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// A single conversation record.
    Conversation { conversation_id: String },
    /// The normalized per-message sub-store, ordered by timestamp then arrival.
    Messages { conversation_id: String },
    /// One identity's presence record.
    Presence { user_id: String },
    /// Every conversation the user participates in, most recent first.
    ConversationsFor { user_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Conversation(Option<Conversation>),
    Messages(Vec<Message>),
    Presence(Option<PresenceRecord>),
    Conversations(Vec<Conversation>),
    /// The live query failed; the subscription stays registered.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: Tag,
    pub snapshot: Snapshot,
}

pub type SnapshotSink = mpsc::UnboundedSender<Delivery>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// A targeted update to one field of a conversation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationField {
    /// Set or lift the block on behalf of `by`.  Setting needs no block in
    /// place; lifting needs `by` to hold it, or no recorded holder.  The
    /// write fails with `StorageError::Conflict` otherwise.
    Block { by: String, blocked: bool },
    /// Numeric-increment of one recipient's unread counter.
    IncrementUnread { user_id: String, by: u32 },
    ResetUnread { user_id: String },
    LastMessage { text: String, at: u64 },
    Typing { user_id: String, typing: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub conversation_id: String,
    pub fields: Vec<ConversationField>,
}

impl ConversationUpdate {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: ConversationField) -> Self {
        self.fields.push(field);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    MessageStatus {
        conversation_id: String,
        message_id: String,
        status: DeliveryStatus,
    },
    Conversation(ConversationUpdate),
}

/// Writes applied atomically: either all land or none do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Operations the sync engine consumes from the document store.
pub trait DocumentStore {
    /// Register a live query.  The store sends the current snapshot
    /// immediately and again after every write that affects the query.
    fn subscribe(
        &mut self,
        query: Query,
        tag: Tag,
        sink: SnapshotSink,
    ) -> Result<SubscriptionId, StorageError>;

    /// Release a live query.  Unknown ids are ignored.
    fn unsubscribe(&mut self, id: SubscriptionId);

    fn get_conversation(&self, conversation_id: &str)
        -> Result<Option<Conversation>, StorageError>;

    fn find_direct_conversation(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<Conversation>, StorageError>;

    fn create_conversation(&mut self, conversation: &Conversation) -> Result<(), StorageError>;

    /// Append a message to the sub-store; returns the store-assigned id.
    /// Fails with `StorageError::Conflict` when a participant other than the
    /// sender holds a block on the conversation.
    fn add_message(
        &mut self,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<String, StorageError>;

    fn update_conversation(&mut self, update: &ConversationUpdate) -> Result<(), StorageError>;

    fn commit_batch(&mut self, batch: &WriteBatch) -> Result<(), StorageError>;

    fn delete_conversation(&mut self, conversation_id: &str) -> Result<(), StorageError>;

    fn set_presence(&mut self, record: &PresenceRecord) -> Result<(), StorageError>;
}
