//! In-memory conversation store

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::types::{Conversation, Message};
use crate::{ConversationStore, validate_key};

type Key = (String, String);

/// Volatile store with the same contract as the SQLite one. Nothing survives
/// a restart.
#[derive(Clone, Default)]
pub struct MemoryConversationStore {
    conversations: Arc<RwLock<HashMap<Key, Conversation>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversations that have at least one message
    pub async fn count(&self) -> usize {
        self.conversations.read().await.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
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

        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry((participant_id.to_string(), suspect_id.to_string()))
            .or_insert_with(|| Conversation::empty(participant_id, suspect_id));
        conversation.messages.push(message);
        debug!(
            "Appended message to ({}, {}), {} total",
            participant_id,
            suspect_id,
            conversation.len()
        );
        Ok(conversation.clone())
    }

    async fn read(
        &self,
        participant_id: &str,
        suspect_id: &str,
    ) -> Result<Conversation, StoreError> {
        validate_key(participant_id, suspect_id)?;
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(&(participant_id.to_string(), suspect_id.to_string()))
            .cloned()
            .unwrap_or_else(|| Conversation::empty(participant_id, suspect_id)))
    }
}
