//! SQLite storage layer for campus-chat.
//!
//! Implements [`DocumentStore`] on top of a single SQLite database: the
//! conversation records (with their legacy inline message arrays), per-
//! participant counters and typing flags, the normalized message sub-store,
//! and presence records.  Live queries are kept in an in-process registry and
//! re-run after every write that touches them.
//!
//! Also hosts the one-time import that folds legacy inline arrays into the
//! message sub-store.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::model::{
    Attachment, AttachmentKind, Conversation, ConversationKind, DeliveryStatus, LegacyMessage,
    Message, NewMessage, PresenceRecord, LEGACY_INLINE_LIMIT,
};
use crate::reconciler::merge_timeline;
use crate::store::{
    ConversationField, ConversationUpdate, Delivery, DocumentStore, Query, Snapshot,
    SnapshotSink, SubscriptionId, Tag, WriteBatch, WriteOp,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Serde(serde_json::Error),
    NotFound(String),
    AlreadyExists(String),
    /// A conditional write lost against the stored state.
    Conflict(String),
    /// Transient failure of the backing store.
    Unavailable(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::Serde(e) => write!(f, "serialization error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
            StorageError::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            StorageError::Conflict(msg) => write!(f, "conflict: {msg}"),
            StorageError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Which live queries a committed write can affect.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Conversation(String),
    Messages(String),
    Presence(String),
}

struct Subscriber {
    query: Query,
    tag: Tag,
    sink: SnapshotSink,
}

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscription: u64,
    id_nonce: u64,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let storage = Self {
            conn,
            subscribers: BTreeMap::new(),
            next_subscription: 1,
            id_nonce: 0,
        };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                kind            TEXT NOT NULL,
                title           TEXT NOT NULL,
                last_message    TEXT,
                last_message_at INTEGER,
                blocked         INTEGER NOT NULL DEFAULT 0,
                blocked_by      TEXT,
                legacy_messages TEXT NOT NULL DEFAULT '[]',
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS participants (
                conversation_id TEXT NOT NULL
                    REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL,
                position        INTEGER NOT NULL,
                unread          INTEGER NOT NULL DEFAULT 0,
                typing          INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_user
                ON participants(user_id);

            CREATE TABLE IF NOT EXISTS messages (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                message_id      TEXT NOT NULL,
                sender_id       TEXT NOT NULL,
                sender_name     TEXT NOT NULL,
                body            TEXT,
                attachment_kind TEXT,
                attachment_url  TEXT,
                attachment_name TEXT,
                timestamp       INTEGER NOT NULL,
                status          TEXT NOT NULL DEFAULT 'sent',
                UNIQUE (conversation_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, timestamp, seq);

            CREATE TABLE IF NOT EXISTS presence (
                user_id     TEXT PRIMARY KEY,
                online      INTEGER NOT NULL DEFAULT 0,
                last_active INTEGER
            );
            ",
        )?;
        Ok(())
    }

    /// Number of live queries currently registered.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn list_conversations_for(&self, user_id: &str) -> Result<Vec<Conversation>, StorageError> {
        list_conversations_for(&self.conn, user_id)
    }

    /// Messages of one conversation ordered by timestamp, then arrival.
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StorageError> {
        load_messages(&self.conn, conversation_id)
    }

    pub fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>, StorageError> {
        load_presence(&self.conn, user_id)
    }

    // -----------------------------------------------------------------------
    // Legacy inline array
    // -----------------------------------------------------------------------

    /// Append to a conversation's legacy inline array, as pre-migration
    /// clients do.  The array keeps only the newest [`LEGACY_INLINE_LIMIT`]
    /// entries.
    pub fn append_legacy_message(
        &mut self,
        conversation_id: &str,
        message: &LegacyMessage,
    ) -> Result<(), StorageError> {
        let mut legacy = load_legacy(&self.conn, conversation_id)?
            .ok_or_else(|| StorageError::NotFound(format!("conversation {conversation_id}")))?;
        legacy.push(message.clone());
        if legacy.len() > LEGACY_INLINE_LIMIT {
            let excess = legacy.len() - LEGACY_INLINE_LIMIT;
            legacy.drain(..excess);
        }
        store_legacy(&self.conn, conversation_id, &legacy)?;
        self.publish(&[Change::Conversation(conversation_id.to_string())]);
        Ok(())
    }

    /// Fold one conversation's legacy inline array into the message
    /// sub-store and clear the array, in one transaction.
    pub fn import_legacy_messages(
        &mut self,
        conversation_id: &str,
    ) -> Result<ImportReport, StorageError> {
        let tx = self.conn.transaction()?;
        let legacy = load_legacy(&tx, conversation_id)?
            .ok_or_else(|| StorageError::NotFound(format!("conversation {conversation_id}")))?;
        if legacy.is_empty() {
            return Ok(ImportReport::default());
        }

        let existing = load_messages(&tx, conversation_id)?;
        let existing_ids: HashSet<&str> = existing.iter().map(|m| m.id.as_str()).collect();
        let mut report = ImportReport {
            conversations: 1,
            ..ImportReport::default()
        };
        for message in merge_timeline(&legacy, &existing) {
            if existing_ids.contains(message.id.as_str()) {
                continue;
            }
            insert_message_row(&tx, conversation_id, &message)?;
            report.imported += 1;
        }
        report.skipped = legacy.len() - report.imported;

        store_legacy(&tx, conversation_id, &[])?;
        tx.commit()?;

        crate::clog!(
            "import: moved {} legacy message(s) of {} into the sub-store ({} already present)",
            report.imported,
            crate::logging::conv_id(conversation_id),
            report.skipped
        );
        self.publish(&[
            Change::Conversation(conversation_id.to_string()),
            Change::Messages(conversation_id.to_string()),
        ]);
        Ok(report)
    }

    /// Run [`Storage::import_legacy_messages`] over every conversation that
    /// still carries a legacy array.
    pub fn import_all_legacy(&mut self) -> Result<ImportReport, StorageError> {
        let ids: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT conversation_id FROM conversations
                 WHERE legacy_messages != '[]' ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut total = ImportReport::default();
        for id in ids {
            let report = self.import_legacy_messages(&id)?;
            total.conversations += report.conversations;
            total.imported += report.imported;
            total.skipped += report.skipped;
        }
        Ok(total)
    }

    // -----------------------------------------------------------------------
    // Live queries
    // -----------------------------------------------------------------------

    fn publish(&mut self, changes: &[Change]) {
        let mut closed = Vec::new();
        for (id, sub) in &self.subscribers {
            if !changes.iter().any(|c| affects(&sub.query, c)) {
                continue;
            }
            let snapshot =
                run_query(&self.conn, &sub.query).unwrap_or_else(|e| Snapshot::Failed(e.to_string()));
            let delivery = Delivery {
                tag: sub.tag,
                snapshot,
            };
            if sub.sink.send(delivery).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    fn next_message_id(&mut self, conversation_id: &str, message: &NewMessage) -> String {
        self.id_nonce += 1;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut hasher = Sha256::new();
        hasher.update(conversation_id.as_bytes());
        hasher.update(message.sender_id.as_bytes());
        hasher.update(message.timestamp.to_be_bytes());
        hasher.update(message.body.as_deref().unwrap_or_default().as_bytes());
        hasher.update(nanos.to_be_bytes());
        hasher.update(self.id_nonce.to_be_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}

impl DocumentStore for Storage {
    fn subscribe(
        &mut self,
        query: Query,
        tag: Tag,
        sink: SnapshotSink,
    ) -> Result<SubscriptionId, StorageError> {
        let snapshot = run_query(&self.conn, &query)?;
        sink.send(Delivery { tag, snapshot })
            .map_err(|_| StorageError::Unavailable("subscriber went away".to_string()))?;

        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscribers.insert(id, Subscriber { query, tag, sink });
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.remove(&id.0);
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        load_conversation(&self.conn, conversation_id)
    }

    fn find_direct_conversation(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<Conversation>, StorageError> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT c.conversation_id FROM conversations c
                 WHERE c.kind = 'direct'
                   AND EXISTS (SELECT 1 FROM participants p
                               WHERE p.conversation_id = c.conversation_id AND p.user_id = ?1)
                   AND EXISTS (SELECT 1 FROM participants p
                               WHERE p.conversation_id = c.conversation_id AND p.user_id = ?2)
                 ORDER BY c.created_at LIMIT 1",
                params![a, b],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => load_conversation(&self.conn, &id),
            None => Ok(None),
        }
    }

    fn create_conversation(&mut self, conversation: &Conversation) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM conversations WHERE conversation_id = ?1",
            params![conversation.id],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(StorageError::AlreadyExists(format!(
                "conversation {}",
                conversation.id
            )));
        }
        tx.execute(
            "INSERT INTO conversations
             (conversation_id, kind, title, last_message, last_message_at,
              blocked, blocked_by, legacy_messages, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                conversation.id,
                conversation.kind.as_str(),
                conversation.title,
                conversation.last_message,
                conversation.last_message_at.map(|t| t as i64),
                conversation.blocked as i32,
                conversation.blocked_by,
                serde_json::to_string(&conversation.legacy_messages)?,
                conversation.created_at as i64,
            ],
        )?;
        for (position, user_id) in conversation.participants.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO participants
                 (conversation_id, user_id, position, unread, typing)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation.id,
                    user_id,
                    position as i64,
                    conversation.unread_for(user_id) as i64,
                    conversation.typing.get(user_id).copied().unwrap_or(false) as i32,
                ],
            )?;
        }
        tx.commit()?;
        self.publish(&[Change::Conversation(conversation.id.clone())]);
        Ok(())
    }

    fn add_message(
        &mut self,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<String, StorageError> {
        let blocker: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT blocked_by FROM conversations
                 WHERE conversation_id = ?1 AND blocked = 1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(Some(blocker)) = blocker {
            if blocker != message.sender_id {
                return Err(StorageError::Conflict(format!(
                    "{conversation_id} is blocked by {blocker}"
                )));
            }
        }
        if load_legacy(&self.conn, conversation_id)?.is_none() {
            return Err(StorageError::NotFound(format!("conversation {conversation_id}")));
        }
        let id = self.next_message_id(conversation_id, message);
        let row = Message {
            id: id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            body: message.body.clone(),
            attachment: message.attachment.clone(),
            timestamp: message.timestamp,
            status: DeliveryStatus::Sent,
        };
        insert_message_row(&self.conn, conversation_id, &row)?;
        self.publish(&[Change::Messages(conversation_id.to_string())]);
        Ok(id)
    }

    fn update_conversation(&mut self, update: &ConversationUpdate) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        apply_conversation_update(&tx, update)?;
        tx.commit()?;
        self.publish(&[Change::Conversation(update.conversation_id.clone())]);
        Ok(())
    }

    fn commit_batch(&mut self, batch: &WriteBatch) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let mut changes = Vec::new();
        for op in &batch.ops {
            match op {
                WriteOp::MessageStatus {
                    conversation_id,
                    message_id,
                    status,
                } => {
                    let in_legacy =
                        set_message_status(&tx, conversation_id, message_id, *status)?;
                    let change = if in_legacy {
                        Change::Conversation(conversation_id.clone())
                    } else {
                        Change::Messages(conversation_id.clone())
                    };
                    if !changes.contains(&change) {
                        changes.push(change);
                    }
                }
                WriteOp::Conversation(update) => {
                    apply_conversation_update(&tx, update)?;
                    let change = Change::Conversation(update.conversation_id.clone());
                    if !changes.contains(&change) {
                        changes.push(change);
                    }
                }
            }
        }
        tx.commit()?;
        self.publish(&changes);
        Ok(())
    }

    fn delete_conversation(&mut self, conversation_id: &str) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.execute(
            "DELETE FROM participants WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        let affected = tx.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("conversation {conversation_id}")));
        }
        tx.commit()?;
        self.publish(&[
            Change::Conversation(conversation_id.to_string()),
            Change::Messages(conversation_id.to_string()),
        ]);
        Ok(())
    }

    fn set_presence(&mut self, record: &PresenceRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO presence (user_id, online, last_active) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                online = excluded.online,
                last_active = excluded.last_active",
            params![
                record.user_id,
                record.online as i32,
                record.last_active.map(|t| t as i64),
            ],
        )?;
        self.publish(&[Change::Presence(record.user_id.clone())]);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Import report
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Conversations whose legacy array was folded in.
    pub conversations: usize,
    pub imported: usize,
    /// Legacy entries already present in the sub-store, or dropped as
    /// duplicates.
    pub skipped: usize,
}

impl ImportReport {
    pub fn is_empty(&self) -> bool {
        self.conversations == 0 && self.imported == 0 && self.skipped == 0
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn affects(query: &Query, change: &Change) -> bool {
    match (query, change) {
        (Query::Conversation { conversation_id }, Change::Conversation(id)) => conversation_id == id,
        (Query::Messages { conversation_id }, Change::Messages(id)) => conversation_id == id,
        (Query::Presence { user_id }, Change::Presence(id)) => user_id == id,
        (Query::ConversationsFor { .. }, Change::Conversation(_)) => true,
        _ => false,
    }
}

fn run_query(conn: &Connection, query: &Query) -> Result<Snapshot, StorageError> {
    Ok(match query {
        Query::Conversation { conversation_id } => {
            Snapshot::Conversation(load_conversation(conn, conversation_id)?)
        }
        Query::Messages { conversation_id } => {
            Snapshot::Messages(load_messages(conn, conversation_id)?)
        }
        Query::Presence { user_id } => Snapshot::Presence(load_presence(conn, user_id)?),
        Query::ConversationsFor { user_id } => {
            Snapshot::Conversations(list_conversations_for(conn, user_id)?)
        }
    })
}

fn load_conversation(
    conn: &Connection,
    conversation_id: &str,
) -> Result<Option<Conversation>, StorageError> {
    let row = conn
        .query_row(
            "SELECT conversation_id, kind, title, last_message, last_message_at,
                    blocked, blocked_by, legacy_messages, created_at
             FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?.map(|t| t as u64),
                    row.get::<_, i32>(5)? != 0,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)? as u64,
                ))
            },
        )
        .optional()?;
    let Some((id, kind, title, last_message, last_message_at, blocked, blocked_by, legacy, created_at)) =
        row
    else {
        return Ok(None);
    };

    let kind = ConversationKind::parse(&kind).unwrap_or(ConversationKind::Direct);
    let legacy_messages: Vec<LegacyMessage> = serde_json::from_str(&legacy)?;

    let mut stmt = conn.prepare(
        "SELECT user_id, unread, typing FROM participants
         WHERE conversation_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)? as u32,
            row.get::<_, i32>(2)? != 0,
        ))
    })?;
    let mut participants = Vec::new();
    let mut unread = BTreeMap::new();
    let mut typing = BTreeMap::new();
    for row in rows {
        let (user_id, count, is_typing) = row?;
        if count > 0 {
            unread.insert(user_id.clone(), count);
        }
        if is_typing {
            typing.insert(user_id.clone(), true);
        }
        participants.push(user_id);
    }

    Ok(Some(Conversation {
        id,
        kind,
        title,
        participants,
        last_message,
        last_message_at,
        unread,
        blocked,
        blocked_by,
        typing,
        legacy_messages,
        created_at,
    }))
}

fn list_conversations_for(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<Conversation>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT c.conversation_id FROM conversations c
         JOIN participants p ON p.conversation_id = c.conversation_id
         WHERE p.user_id = ?1
         ORDER BY COALESCE(c.last_message_at, c.created_at) DESC, c.conversation_id",
    )?;
    let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
    let mut result = Vec::new();
    for row in rows {
        if let Some(conversation) = load_conversation(conn, &row?)? {
            result.push(conversation);
        }
    }
    Ok(result)
}

fn load_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT message_id, sender_id, sender_name, body, attachment_kind,
                attachment_url, attachment_name, timestamp, status
         FROM messages WHERE conversation_id = ?1
         ORDER BY timestamp, seq",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| {
        let kind: Option<String> = row.get(4)?;
        let url: Option<String> = row.get(5)?;
        let attachment = match (kind.as_deref().and_then(AttachmentKind::parse), url) {
            (Some(kind), Some(url)) => Some(Attachment {
                kind,
                url,
                name: row.get(6)?,
            }),
            _ => None,
        };
        Ok(Message {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            sender_name: row.get(2)?,
            body: row.get(3)?,
            attachment,
            timestamp: row.get::<_, i64>(7)? as u64,
            status: DeliveryStatus::parse(&row.get::<_, String>(8)?),
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn insert_message_row(
    conn: &Connection,
    conversation_id: &str,
    message: &Message,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO messages
         (conversation_id, message_id, sender_id, sender_name, body,
          attachment_kind, attachment_url, attachment_name, timestamp, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            conversation_id,
            message.id,
            message.sender_id,
            message.sender_name,
            message.body,
            message.attachment.as_ref().map(|a| a.kind.as_str()),
            message.attachment.as_ref().map(|a| a.url.clone()),
            message.attachment.as_ref().and_then(|a| a.name.clone()),
            message.timestamp as i64,
            message.status.as_str(),
        ],
    )?;
    Ok(())
}

fn load_presence(conn: &Connection, user_id: &str) -> Result<Option<PresenceRecord>, StorageError> {
    let row = conn
        .query_row(
            "SELECT user_id, online, last_active FROM presence WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(PresenceRecord {
                    user_id: row.get(0)?,
                    online: row.get::<_, i32>(1)? != 0,
                    last_active: row.get::<_, Option<i64>>(2)?.map(|t| t as u64),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// `None` when the conversation does not exist.
fn load_legacy(
    conn: &Connection,
    conversation_id: &str,
) -> Result<Option<Vec<LegacyMessage>>, StorageError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT legacy_messages FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn store_legacy(
    conn: &Connection,
    conversation_id: &str,
    legacy: &[LegacyMessage],
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE conversations SET legacy_messages = ?1 WHERE conversation_id = ?2",
        params![serde_json::to_string(legacy)?, conversation_id],
    )?;
    Ok(())
}

/// Update a message's status in the sub-store, falling back to the legacy
/// inline array.  Returns whether the legacy array was the one touched.
fn set_message_status(
    conn: &Connection,
    conversation_id: &str,
    message_id: &str,
    status: DeliveryStatus,
) -> Result<bool, StorageError> {
    let affected = conn.execute(
        "UPDATE messages SET status = ?1 WHERE conversation_id = ?2 AND message_id = ?3",
        params![status.as_str(), conversation_id, message_id],
    )?;
    if affected > 0 {
        return Ok(false);
    }

    let not_found = || StorageError::NotFound(format!("message {message_id}"));
    let mut legacy = load_legacy(conn, conversation_id)?.ok_or_else(not_found)?;
    let entry = legacy
        .iter_mut()
        .find(|m| m.merge_key() == message_id)
        .ok_or_else(not_found)?;
    entry.status = status;
    store_legacy(conn, conversation_id, &legacy)?;
    Ok(true)
}

fn apply_conversation_update(
    conn: &Connection,
    update: &ConversationUpdate,
) -> Result<(), StorageError> {
    let id = update.conversation_id.as_str();
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversations WHERE conversation_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(StorageError::NotFound(format!("conversation {id}")));
    }

    for field in &update.fields {
        match field {
            ConversationField::Block { by, blocked: true } => {
                let affected = conn.execute(
                    "UPDATE conversations SET blocked = 1, blocked_by = ?1
                     WHERE conversation_id = ?2 AND blocked = 0",
                    params![by, id],
                )?;
                if affected == 0 {
                    return Err(StorageError::Conflict(format!("{id} is already blocked")));
                }
            }
            ConversationField::Block { by, blocked: false } => {
                let affected = conn.execute(
                    "UPDATE conversations SET blocked = 0, blocked_by = NULL
                     WHERE conversation_id = ?1 AND blocked = 1
                       AND (blocked_by = ?2 OR blocked_by IS NULL)",
                    params![id, by],
                )?;
                if affected == 0 {
                    return Err(StorageError::Conflict(format!(
                        "{id} is not blocked by {by}"
                    )));
                }
            }
            ConversationField::IncrementUnread { user_id, by } => {
                conn.execute(
                    "UPDATE participants SET unread = unread + ?1
                     WHERE conversation_id = ?2 AND user_id = ?3",
                    params![*by as i64, id, user_id],
                )?;
            }
            ConversationField::ResetUnread { user_id } => {
                conn.execute(
                    "UPDATE participants SET unread = 0
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    params![id, user_id],
                )?;
            }
            ConversationField::LastMessage { text, at } => {
                conn.execute(
                    "UPDATE conversations SET last_message = ?1, last_message_at = ?2
                     WHERE conversation_id = ?3",
                    params![text, *at as i64, id],
                )?;
            }
            ConversationField::Typing { user_id, typing } => {
                conn.execute(
                    "UPDATE participants SET typing = ?1
                     WHERE conversation_id = ?2 AND user_id = ?3",
                    params![*typing as i32, id, user_id],
                )?;
            }
        }
    }
    Ok(())
}

/// Resolve the database path: `{data_dir}/campus-chat.db`.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("campus-chat.db")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::store::Stream;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn seeded() -> Storage {
        let mut storage = test_storage();
        storage
            .create_conversation(&Conversation::direct("c1", "Bike", "alice", "bob"))
            .unwrap();
        storage
    }

    fn new_message(sender: &str, ts: u64, body: &str) -> NewMessage {
        NewMessage {
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            body: Some(body.to_string()),
            attachment: None,
            timestamp: ts,
        }
    }

    fn legacy(id: Option<&str>, sender: &str, ts: u64) -> LegacyMessage {
        LegacyMessage {
            id: id.map(str::to_string),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            body: Some(format!("old {ts}")),
            attachment: None,
            timestamp: ts,
            status: DeliveryStatus::Sent,
        }
    }

    #[test]
    fn test_conversation_crud() {
        let mut storage = seeded();
        let loaded = storage.get_conversation("c1").unwrap().unwrap();
        assert_eq!(loaded.participants, vec!["alice", "bob"]);
        assert_eq!(loaded.kind, ConversationKind::Direct);
        assert!(!loaded.blocked);

        let dup = storage.create_conversation(&Conversation::direct("c1", "x", "a", "b"));
        assert!(matches!(dup, Err(StorageError::AlreadyExists(_))));

        storage.delete_conversation("c1").unwrap();
        assert!(storage.get_conversation("c1").unwrap().is_none());
        assert!(matches!(
            storage.delete_conversation("c1"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_find_direct_conversation_either_order() {
        let storage = seeded();
        assert_eq!(
            storage.find_direct_conversation("bob", "alice").unwrap().unwrap().id,
            "c1"
        );
        assert!(storage.find_direct_conversation("alice", "carol").unwrap().is_none());
    }

    #[test]
    fn test_add_message_assigns_unique_ids_and_orders() {
        let mut storage = seeded();
        let a = storage.add_message("c1", &new_message("alice", 20, "second")).unwrap();
        let b = storage.add_message("c1", &new_message("bob", 10, "first")).unwrap();
        let c = storage.add_message("c1", &new_message("bob", 20, "third")).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);

        let bodies: Vec<String> = storage
            .list_messages("c1")
            .unwrap()
            .into_iter()
            .filter_map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);

        assert!(matches!(
            storage.add_message("missing", &new_message("bob", 1, "x")),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_targeted_counter_updates() {
        let mut storage = seeded();
        storage
            .update_conversation(
                &ConversationUpdate::new("c1")
                    .field(ConversationField::IncrementUnread {
                        user_id: "bob".to_string(),
                        by: 1,
                    })
                    .field(ConversationField::IncrementUnread {
                        user_id: "bob".to_string(),
                        by: 2,
                    })
                    .field(ConversationField::LastMessage {
                        text: "still there?".to_string(),
                        at: 99,
                    }),
            )
            .unwrap();
        let c = storage.get_conversation("c1").unwrap().unwrap();
        assert_eq!(c.unread_for("bob"), 3);
        assert_eq!(c.unread_for("alice"), 0);
        assert_eq!(c.last_message.as_deref(), Some("still there?"));

        storage
            .update_conversation(&ConversationUpdate::new("c1").field(
                ConversationField::ResetUnread {
                    user_id: "bob".to_string(),
                },
            ))
            .unwrap();
        let c = storage.get_conversation("c1").unwrap().unwrap();
        assert_eq!(c.unread_for("bob"), 0);
        // Unrelated fields survive.
        assert_eq!(c.last_message_at, Some(99));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let mut storage = seeded();
        let id = storage.add_message("c1", &new_message("bob", 1, "hi")).unwrap();
        storage
            .update_conversation(&ConversationUpdate::new("c1").field(
                ConversationField::IncrementUnread {
                    user_id: "alice".to_string(),
                    by: 1,
                },
            ))
            .unwrap();

        let batch = WriteBatch {
            ops: vec![
                WriteOp::MessageStatus {
                    conversation_id: "c1".to_string(),
                    message_id: id.clone(),
                    status: DeliveryStatus::Read,
                },
                WriteOp::MessageStatus {
                    conversation_id: "c1".to_string(),
                    message_id: "vanished".to_string(),
                    status: DeliveryStatus::Read,
                },
                WriteOp::Conversation(ConversationUpdate::new("c1").field(
                    ConversationField::ResetUnread {
                        user_id: "alice".to_string(),
                    },
                )),
            ],
        };
        assert!(matches!(
            storage.commit_batch(&batch),
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(storage.list_messages("c1").unwrap()[0].status, DeliveryStatus::Sent);
        assert_eq!(storage.get_conversation("c1").unwrap().unwrap().unread_for("alice"), 1);
    }

    fn block(by: &str, blocked: bool) -> ConversationUpdate {
        ConversationUpdate::new("c1").field(ConversationField::Block {
            by: by.to_string(),
            blocked,
        })
    }

    #[test]
    fn test_block_write_rejected_for_non_holder() {
        let mut storage = seeded();
        storage.update_conversation(&block("bob", true)).unwrap();

        assert!(matches!(
            storage.update_conversation(&block("alice", true)),
            Err(StorageError::Conflict(_))
        ));
        assert!(matches!(
            storage.update_conversation(&block("alice", false)),
            Err(StorageError::Conflict(_))
        ));
        let c = storage.get_conversation("c1").unwrap().unwrap();
        assert!(c.blocked);
        assert_eq!(c.blocked_by.as_deref(), Some("bob"));

        storage.update_conversation(&block("bob", false)).unwrap();
        let c = storage.get_conversation("c1").unwrap().unwrap();
        assert!(!c.blocked);
        assert!(c.blocked_by.is_none());
    }

    #[test]
    fn test_block_without_holder_liftable_by_either_side() {
        let mut storage = seeded();
        storage
            .conn
            .execute(
                "UPDATE conversations SET blocked = 1, blocked_by = NULL WHERE conversation_id = 'c1'",
                [],
            )
            .unwrap();
        storage.update_conversation(&block("alice", false)).unwrap();
        assert!(!storage.get_conversation("c1").unwrap().unwrap().blocked);
    }

    #[test]
    fn test_add_message_rejected_while_counterpart_blocks() {
        let mut storage = seeded();
        storage.update_conversation(&block("bob", true)).unwrap();

        assert!(matches!(
            storage.add_message("c1", &new_message("alice", 1, "hi")),
            Err(StorageError::Conflict(_))
        ));
        storage.add_message("c1", &new_message("bob", 2, "still here")).unwrap();
        assert_eq!(storage.list_messages("c1").unwrap().len(), 1);
    }

    #[test]
    fn test_status_falls_back_to_legacy_array() {
        let mut storage = seeded();
        storage
            .append_legacy_message("c1", &legacy(None, "bob", 500))
            .unwrap();
        let batch = WriteBatch {
            ops: vec![WriteOp::MessageStatus {
                conversation_id: "c1".to_string(),
                message_id: "500".to_string(),
                status: DeliveryStatus::Read,
            }],
        };
        storage.commit_batch(&batch).unwrap();
        let c = storage.get_conversation("c1").unwrap().unwrap();
        assert_eq!(c.legacy_messages[0].status, DeliveryStatus::Read);
    }

    #[test]
    fn test_legacy_array_is_bounded() {
        let mut storage = seeded();
        for ts in 0..(LEGACY_INLINE_LIMIT as u64 + 5) {
            storage
                .append_legacy_message("c1", &legacy(None, "alice", ts))
                .unwrap();
        }
        let c = storage.get_conversation("c1").unwrap().unwrap();
        assert_eq!(c.legacy_messages.len(), LEGACY_INLINE_LIMIT);
        assert_eq!(c.legacy_messages[0].timestamp, 5);
    }

    #[test]
    fn test_import_legacy_messages() {
        let mut storage = seeded();
        let kept = storage.add_message("c1", &new_message("alice", 30, "new")).unwrap();
        storage
            .append_legacy_message("c1", &legacy(Some(&kept), "alice", 30))
            .unwrap();
        storage
            .append_legacy_message("c1", &legacy(None, "bob", 10))
            .unwrap();
        storage
            .append_legacy_message("c1", &legacy(Some("old-2"), "alice", 20))
            .unwrap();

        let report = storage.import_all_legacy().unwrap();
        assert_eq!(
            report,
            ImportReport {
                conversations: 1,
                imported: 2,
                skipped: 1
            }
        );

        let ids: Vec<String> = storage
            .list_messages("c1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["10".to_string(), "old-2".to_string(), kept]);
        assert!(storage
            .get_conversation("c1")
            .unwrap()
            .unwrap()
            .legacy_messages
            .is_empty());

        // Nothing left to import.
        assert!(storage.import_all_legacy().unwrap().is_empty());
    }

    #[test]
    fn test_subscription_pushes_initial_and_updates() {
        let mut storage = seeded();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = Tag::new(Stream::Messages, 3);
        let sub = storage
            .subscribe(
                Query::Messages {
                    conversation_id: "c1".to_string(),
                },
                tag,
                tx,
            )
            .unwrap();

        let initial = rx.try_recv().unwrap();
        assert_eq!(initial.tag, tag);
        assert_eq!(initial.snapshot, Snapshot::Messages(Vec::new()));

        storage.add_message("c1", &new_message("bob", 1, "hi")).unwrap();
        match rx.try_recv().unwrap().snapshot {
            Snapshot::Messages(msgs) => assert_eq!(msgs.len(), 1),
            other => panic!("unexpected snapshot {other:?}"),
        }

        // Unrelated writes do not wake the message query.
        storage
            .set_presence(&PresenceRecord {
                user_id: "bob".to_string(),
                online: true,
                last_active: None,
            })
            .unwrap();
        assert!(rx.try_recv().is_err());

        storage.unsubscribe(sub);
        storage.add_message("c1", &new_message("bob", 2, "again")).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(storage.subscription_count(), 0);
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let mut storage = seeded();
        let (tx, rx) = mpsc::unbounded_channel();
        storage
            .subscribe(
                Query::Conversation {
                    conversation_id: "c1".to_string(),
                },
                Tag::new(Stream::Conversation, 0),
                tx,
            )
            .unwrap();
        drop(rx);
        storage
            .update_conversation(&ConversationUpdate::new("c1").field(
                ConversationField::Typing {
                    user_id: "alice".to_string(),
                    typing: true,
                },
            ))
            .unwrap();
        assert_eq!(storage.subscription_count(), 0);
    }

    #[test]
    fn test_conversation_list_order_and_presence() {
        let mut storage = seeded();
        storage
            .create_conversation(&Conversation::broadcast(
                "b1",
                "Dorm",
                vec!["alice".to_string(), "carol".to_string()],
            ))
            .unwrap();
        storage
            .update_conversation(&ConversationUpdate::new("c1").field(
                ConversationField::LastMessage {
                    text: "newest".to_string(),
                    at: u64::MAX / 4,
                },
            ))
            .unwrap();
        let ids: Vec<String> = storage
            .list_conversations_for("alice")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c1", "b1"]);
        assert_eq!(storage.list_conversations_for("carol").unwrap().len(), 1);

        assert!(storage.get_presence("bob").unwrap().is_none());
        storage
            .set_presence(&PresenceRecord {
                user_id: "bob".to_string(),
                online: false,
                last_active: Some(42),
            })
            .unwrap();
        assert_eq!(storage.get_presence("bob").unwrap().unwrap().last_active, Some(42));
    }

    #[test]
    fn test_open_on_disk_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = db_path(tmp.path());
        {
            let mut storage = Storage::open(&path).unwrap();
            storage
                .create_conversation(&Conversation::direct("c1", "Bike", "alice", "bob"))
                .unwrap();
        }
        let storage = Storage::open(&path).unwrap();
        assert!(storage.get_conversation("c1").unwrap().is_some());
    }
}
