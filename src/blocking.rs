//! Directional blocking on direct conversations.

use crate::model::Conversation;
use crate::storage::StorageError;
use crate::store::ConversationField;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockState {
    pub is_blocked: bool,
    pub blocked_by_me: bool,
    /// The counterpart holds the block; the viewer cannot send.
    pub blocked_by_other: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAction {
    Block,
    Unblock,
}

/// What the compose area should offer for the block toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAffordance {
    pub action: BlockAction,
    /// False when the block is held by the counterpart.
    pub enabled: bool,
}

#[derive(Debug)]
pub enum BlockError {
    Broadcast,
    HeldByOther,
    UnknownConversation(String),
    Store(StorageError),
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockError::Broadcast => write!(f, "broadcast conversations cannot be blocked"),
            BlockError::HeldByOther => {
                write!(f, "the block is held by the other participant")
            }
            BlockError::UnknownConversation(id) => write!(f, "unknown conversation: {id}"),
            BlockError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for BlockError {}

impl From<StorageError> for BlockError {
    fn from(e: StorageError) -> Self {
        BlockError::Store(e)
    }
}

/// Block booleans for `viewer_id`, or `None` for broadcast conversations.
pub fn resolve(conversation: &Conversation, viewer_id: &str) -> Option<BlockState> {
    if !conversation.is_direct() {
        return None;
    }
    if !conversation.blocked {
        return Some(BlockState::default());
    }
    // A block with no recorded holder restricts nobody and either
    // participant may lift it.
    let blocker = conversation.blocked_by.as_deref();
    Some(BlockState {
        is_blocked: true,
        blocked_by_me: blocker == Some(viewer_id),
        blocked_by_other: blocker.is_some_and(|b| b != viewer_id),
    })
}

pub fn affordance(conversation: &Conversation, viewer_id: &str) -> Option<BlockAffordance> {
    let state = resolve(conversation, viewer_id)?;
    Some(if !state.is_blocked {
        BlockAffordance {
            action: BlockAction::Block,
            enabled: true,
        }
    } else {
        BlockAffordance {
            action: BlockAction::Unblock,
            enabled: !state.blocked_by_other,
        }
    })
}

/// Targeted field update that toggles the block for `viewer_id`.
pub fn toggle_fields(
    conversation: &Conversation,
    viewer_id: &str,
) -> Result<ConversationField, BlockError> {
    let state = resolve(conversation, viewer_id).ok_or(BlockError::Broadcast)?;
    if state.blocked_by_other {
        return Err(BlockError::HeldByOther);
    }
    Ok(ConversationField::Block {
        by: viewer_id.to_string(),
        blocked: !state.is_blocked,
    })
}

/// Whether outbound sends and uploads are allowed.
pub fn can_send(conversation: &Conversation, viewer_id: &str) -> bool {
    resolve(conversation, viewer_id).map_or(true, |s| !s.blocked_by_other)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct() -> Conversation {
        Conversation::direct("c1", "Textbook swap", "alice", "bob")
    }

    fn blocked_by(who: &str) -> Conversation {
        let mut c = direct();
        c.blocked = true;
        c.blocked_by = Some(who.to_string());
        c
    }

    #[test]
    fn unblocked_conversation() {
        let state = resolve(&direct(), "alice").unwrap();
        assert_eq!(state, BlockState::default());
        assert!(can_send(&direct(), "alice"));
        assert_eq!(
            affordance(&direct(), "alice"),
            Some(BlockAffordance {
                action: BlockAction::Block,
                enabled: true
            })
        );
    }

    #[test]
    fn direction_matters() {
        let c = blocked_by("alice");
        let mine = resolve(&c, "alice").unwrap();
        assert!(mine.is_blocked && mine.blocked_by_me && !mine.blocked_by_other);
        assert!(can_send(&c, "alice"));

        let theirs = resolve(&c, "bob").unwrap();
        assert!(theirs.is_blocked && !theirs.blocked_by_me && theirs.blocked_by_other);
        assert!(!can_send(&c, "bob"));
    }

    #[test]
    fn blocked_viewer_sees_disabled_unblock() {
        let c = blocked_by("alice");
        assert_eq!(
            affordance(&c, "bob"),
            Some(BlockAffordance {
                action: BlockAction::Unblock,
                enabled: false
            })
        );
        assert!(matches!(toggle_fields(&c, "bob"), Err(BlockError::HeldByOther)));
    }

    #[test]
    fn toggle_sets_then_lifts_on_behalf_of_viewer() {
        let set = toggle_fields(&direct(), "alice").unwrap();
        assert_eq!(
            set,
            ConversationField::Block {
                by: "alice".to_string(),
                blocked: true
            }
        );
        let lift = toggle_fields(&blocked_by("alice"), "alice").unwrap();
        assert_eq!(
            lift,
            ConversationField::Block {
                by: "alice".to_string(),
                blocked: false
            }
        );
    }

    #[test]
    fn block_without_holder_is_liftable_by_either_side() {
        let mut c = direct();
        c.blocked = true;
        for viewer in ["alice", "bob"] {
            let state = resolve(&c, viewer).unwrap();
            assert!(state.is_blocked && !state.blocked_by_me && !state.blocked_by_other);
            assert!(can_send(&c, viewer));
            assert_eq!(
                affordance(&c, viewer),
                Some(BlockAffordance {
                    action: BlockAction::Unblock,
                    enabled: true
                })
            );
            assert_eq!(
                toggle_fields(&c, viewer).unwrap(),
                ConversationField::Block {
                    by: viewer.to_string(),
                    blocked: false
                }
            );
        }
    }

    #[test]
    fn broadcast_is_never_blockable() {
        let c = Conversation::broadcast("b1", "Hall 3", vec!["alice".into(), "bob".into()]);
        assert!(resolve(&c, "alice").is_none());
        assert!(affordance(&c, "alice").is_none());
        assert!(matches!(toggle_fields(&c, "alice"), Err(BlockError::Broadcast)));
        assert!(can_send(&c, "alice"));
    }
}
