//! Conversation data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    #[serde(rename = "message")]
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The ordered message log for one (participant, suspect) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub participant_id: String,
    pub suspect_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn empty(participant_id: impl Into<String>, suspect_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            suspect_id: suspect_id.into(),
            messages: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
