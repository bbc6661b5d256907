//! SQLite-backed conversation store
//!
//! One `conversations` row per unique (participant, suspect) key, with its
//! messages in a child table ordered by insertion rowid. Appends commit in a
//! transaction under `synchronous = FULL` before returning.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{Conversation, Message};
use crate::{ConversationStore, validate_key};

/// SQLite conversation store (thread-safe via Arc<Mutex>)
#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    /// Open (or create) the database at `path` and initialize the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opening conversation store at {:?}", path.as_ref());
        Self::from_connection(conn)
    }

    /// Open a private in-memory database (contents vanish on drop)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Conversation store mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            f(&mut conn)
        })
        .await?
    }
}

/// Create tables and indices. Safe to call multiple times.
fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let journal: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch(
        "PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            participant_id TEXT NOT NULL,
            suspect_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (participant_id, suspect_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            sender TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id)",
        [],
    )?;

    debug!("Conversation schema initialized (journal_mode={})", journal);
    Ok(())
}

fn conversation_id(
    conn: &Connection,
    participant_id: &str,
    suspect_id: &str,
) -> Result<Option<i64>, StoreError> {
    let id = conn
        .query_row(
            "SELECT id FROM conversations WHERE participant_id = ?1 AND suspect_id = ?2",
            params![participant_id, suspect_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn load_conversation(
    conn: &Connection,
    participant_id: &str,
    suspect_id: &str,
) -> Result<Conversation, StoreError> {
    let mut conversation = Conversation::empty(participant_id, suspect_id);
    let Some(id) = conversation_id(conn, participant_id, suspect_id)? else {
        return Ok(conversation);
    };

    let mut stmt = conn.prepare(
        "SELECT sender, message, timestamp FROM messages
         WHERE conversation_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    for row in rows {
        let (sender, text, timestamp) = row?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", timestamp, e)))?
            .with_timezone(&Utc);
        conversation.messages.push(Message {
            sender,
            text,
            timestamp,
        });
    }

    Ok(conversation)
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn append(
        &self,
        participant_id: &str,
        suspect_id: &str,
        message: Message,
    ) -> Result<Conversation, StoreError> {
        validate_key(participant_id, suspect_id)?;
        if message.text.is_empty() {
            return Err(StoreError::EmptyMessage);
        }

        let participant_id = participant_id.to_owned();
        let suspect_id = suspect_id.to_owned();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (participant_id, suspect_id, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(participant_id, suspect_id) DO NOTHING",
                params![&participant_id, &suspect_id, Utc::now().to_rfc3339()],
            )?;
            let id = conversation_id(&tx, &participant_id, &suspect_id)?.ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "conversation ({}, {}) missing after upsert",
                    participant_id, suspect_id
                ))
            })?;
            tx.execute(
                "INSERT INTO messages (conversation_id, sender, message, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    &message.sender,
                    &message.text,
                    message.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                ],
            )?;
            tx.commit()?;

            debug!(
                "Appended message from {} to ({}, {})",
                message.sender, participant_id, suspect_id
            );
            load_conversation(conn, &participant_id, &suspect_id)
        })
        .await
    }

    async fn read(
        &self,
        participant_id: &str,
        suspect_id: &str,
    ) -> Result<Conversation, StoreError> {
        validate_key(participant_id, suspect_id)?;
        let participant_id = participant_id.to_owned();
        let suspect_id = suspect_id.to_owned();

        self.with_conn(move |conn| load_conversation(conn, &participant_id, &suspect_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_unwritten_key_is_empty() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let conv = store.read("p1", "suspectA").await.unwrap();
        assert_eq!(conv.participant_id, "p1");
        assert_eq!(conv.suspect_id, "suspectA");
        assert!(conv.is_empty());
    }

    #[tokio::test]
    async fn test_append_returns_full_conversation() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        store
            .append("p1", "suspectA", Message::new("p1", "Hello"))
            .await
            .unwrap();
        let conv = store
            .append("p1", "suspectA", Message::new("suspectA", "I have an alibi."))
            .await
            .unwrap();

        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages[0].sender, "p1");
        assert_eq!(conv.messages[0].text, "Hello");
        assert_eq!(conv.messages[1].sender, "suspectA");
        assert_eq!(conv.messages[1].text, "I have an alibi.");
    }

    #[tokio::test]
    async fn test_timestamps_round_trip_exactly() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let msg = Message::new("p1", "Hello");
        store.append("p1", "suspectA", msg.clone()).await.unwrap();
        let conv = store.read("p1", "suspectA").await.unwrap();
        assert_eq!(conv.messages, vec![msg]);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        store.append("p1", "suspectA", Message::new("p1", "a")).await.unwrap();
        store.append("p1", "suspectB", Message::new("p1", "b")).await.unwrap();
        store.append("p2", "suspectA", Message::new("p2", "c")).await.unwrap();

        assert_eq!(store.read("p1", "suspectA").await.unwrap().len(), 1);
        assert_eq!(store.read("p1", "suspectB").await.unwrap().len(), 1);
        assert_eq!(store.read("p2", "suspectA").await.unwrap().messages[0].text, "c");
    }

    #[tokio::test]
    async fn test_invalid_key_and_empty_message() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        assert!(matches!(
            store.read("", "suspectA").await,
            Err(StoreError::InvalidKey { .. })
        ));
        assert!(matches!(
            store.append("p1", "", Message::new("p1", "x")).await,
            Err(StoreError::InvalidKey { .. })
        ));
        assert!(matches!(
            store.append("p1", "suspectA", Message::new("p1", "")).await,
            Err(StoreError::EmptyMessage)
        ));
        assert!(store.read("p1", "suspectA").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_appends_keep_per_key_order() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let n = 25;
        for i in 0..n {
            for key in ["suspectA", "suspectB", "suspectC"] {
                store
                    .append("p1", key, Message::new("p1", format!("{}-{}", key, i)))
                    .await
                    .unwrap();
            }
        }
        for key in ["suspectA", "suspectB", "suspectC"] {
            let conv = store.read("p1", key).await.unwrap();
            let texts: Vec<String> = conv.messages.iter().map(|m| m.text.clone()).collect();
            let expected: Vec<String> = (0..n).map(|i| format!("{}-{}", key, i)).collect();
            assert_eq!(texts, expected);
        }
    }

    #[tokio::test]
    async fn test_concurrent_writers_lose_nothing() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let mut handles = Vec::new();
        for p in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let participant = format!("p{}", p);
                for i in 0..20 {
                    store
                        .append(&participant, "suspectA", Message::new(&participant, i.to_string()))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for p in 0..4 {
            let conv = store.read(&format!("p{}", p), "suspectA").await.unwrap();
            let texts: Vec<String> = conv.messages.iter().map(|m| m.text.clone()).collect();
            let expected: Vec<String> = (0..20).map(|i: i32| i.to_string()).collect();
            assert_eq!(texts, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_same_key_keep_their_order() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let writers = 4;
        let per_writer = 25;
        let mut handles = Vec::new();
        for w in 0..writers {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let sender = format!("w{}", w);
                for i in 0..per_writer {
                    store
                        .append("p1", "suspectA", Message::new(&sender, format!("{}-{}", w, i)))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let conv = store.read("p1", "suspectA").await.unwrap();
        assert_eq!(conv.len(), writers * per_writer);
        for w in 0..writers {
            let sender = format!("w{}", w);
            let seen: Vec<String> = conv
                .messages
                .iter()
                .filter(|m| m.sender == sender)
                .map(|m| m.text.clone())
                .collect();
            let expected: Vec<String> = (0..per_writer).map(|i| format!("{}-{}", w, i)).collect();
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn test_reopen_preserves_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alibi.db");

        {
            let store = SqliteConversationStore::open(&path).unwrap();
            store.append("p1", "suspectA", Message::new("p1", "Hello")).await.unwrap();
            store
                .append("p1", "suspectA", Message::new("suspectA", "You must be mistaken."))
                .await
                .unwrap();
        }

        let store = SqliteConversationStore::open(&path).unwrap();
        let conv = store.read("p1", "suspectA").await.unwrap();
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages[1].text, "You must be mistaken.");
    }

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }
}
