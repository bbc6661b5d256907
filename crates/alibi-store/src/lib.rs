//! Conversation persistence for alibi
//!
//! This crate provides:
//! - The `ConversationStore` contract the router appends through
//! - A SQLite-backed store with synchronous durability
//! - An in-memory store with identical semantics (tests, ephemeral runs)

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::MemoryConversationStore;
pub use sqlite::SqliteConversationStore;
pub use types::{Conversation, Message};

/// Keyed, append-only log of messages per (participant, suspect) pair.
///
/// Appends for one key are applied in call order. A successful `append`
/// means the message has been persisted.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a message and return the conversation including it.
    async fn append(
        &self,
        participant_id: &str,
        suspect_id: &str,
        message: Message,
    ) -> Result<Conversation, StoreError>;

    /// Read a conversation. Never-written keys yield an empty conversation.
    async fn read(
        &self,
        participant_id: &str,
        suspect_id: &str,
    ) -> Result<Conversation, StoreError>;
}

/// Reject keys with an empty component.
pub(crate) fn validate_key(participant_id: &str, suspect_id: &str) -> Result<(), StoreError> {
    if participant_id.is_empty() || suspect_id.is_empty() {
        return Err(StoreError::InvalidKey {
            participant_id: participant_id.to_string(),
            suspect_id: suspect_id.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("p1", "suspectA").is_ok());
        assert!(matches!(
            validate_key("", "suspectA"),
            Err(StoreError::InvalidKey { .. })
        ));
        assert!(matches!(
            validate_key("p1", ""),
            Err(StoreError::InvalidKey { .. })
        ));
    }
}
