//! Store error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid conversation key (participant '{participant_id}', suspect '{suspect_id}')")]
    InvalidKey {
        participant_id: String,
        suspect_id: String,
    },

    #[error("message text must not be empty")]
    EmptyMessage,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored row could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
