//! Read receipts for the active conversation.
//!
//! Every inbound message that is not yet `read` gets a status transition,
//! and the viewer's unread counter is reset, all inside one atomic batch.
//! A failed batch is never retried here: the next timeline change plans a
//! fresh one.

use crate::model::{DeliveryStatus, Message};
use crate::storage::StorageError;
use crate::store::{ConversationField, ConversationUpdate, DocumentStore, WriteBatch, WriteOp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// Nothing unread and the counter is already zero.
    NothingToDo,
    Committed { marked: usize },
    /// A target message disappeared between read and commit.
    TargetGone,
    /// Any other commit failure; logged, left for the next timeline change.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ReadReceiptTracker {
    viewer_id: String,
}

impl ReadReceiptTracker {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
        }
    }

    /// Inbound messages still awaiting a read transition.
    pub fn unread_inbound<'a>(&self, timeline: &'a [Message]) -> Vec<&'a Message> {
        timeline
            .iter()
            .filter(|m| m.sender_id != self.viewer_id && m.status != DeliveryStatus::Read)
            .collect()
    }

    /// Build the batch for `timeline`, or `None` when there is nothing to commit.
    pub fn plan(
        &self,
        conversation_id: &str,
        timeline: &[Message],
        unread_counter: u32,
    ) -> Option<WriteBatch> {
        let pending = self.unread_inbound(timeline);
        if pending.is_empty() && unread_counter == 0 {
            return None;
        }

        let mut batch = WriteBatch::default();
        for message in pending {
            batch.push(WriteOp::MessageStatus {
                conversation_id: conversation_id.to_string(),
                message_id: message.id.clone(),
                status: DeliveryStatus::Read,
            });
        }
        batch.push(WriteOp::Conversation(
            ConversationUpdate::new(conversation_id).field(ConversationField::ResetUnread {
                user_id: self.viewer_id.clone(),
            }),
        ));
        Some(batch)
    }

    /// Plan and commit in one go.
    pub fn commit<S: DocumentStore>(
        &self,
        store: &mut S,
        conversation_id: &str,
        timeline: &[Message],
        unread_counter: u32,
    ) -> ReceiptOutcome {
        let Some(batch) = self.plan(conversation_id, timeline, unread_counter) else {
            return ReceiptOutcome::NothingToDo;
        };
        // Every op except the trailing counter reset is a message transition.
        let marked = batch.len() - 1;

        match store.commit_batch(&batch) {
            Ok(()) => {
                if marked > 0 {
                    crate::clog!(
                        "receipts: marked {} message(s) read in {}",
                        marked,
                        crate::logging::conv_id(conversation_id)
                    );
                }
                ReceiptOutcome::Committed { marked }
            }
            Err(StorageError::NotFound(_)) => ReceiptOutcome::TargetGone,
            Err(e) => {
                crate::clog!(
                    "receipts: commit for {} failed, leaving state as-is: {}",
                    crate::logging::conv_id(conversation_id),
                    e
                );
                ReceiptOutcome::Failed(e.to_string())
            }
        }
    }
}
