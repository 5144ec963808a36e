//! The conversation store contract used by the exchange pipeline and
//! the chat routes.
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::models::{Chat, ChatSummary, NewTurn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Chat {0} not found")]
    NotFound(String),
    #[error("Chat {0} already has a response in progress")]
    TurnInProgress(String),
    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

/// Compose the persisted response from the accumulated text and an
/// optional error note.
pub fn annotate(response: &str, annotation: Option<&str>) -> String {
    match annotation {
        Some(note) if response.is_empty() => format!("[Error: {}]", note),
        Some(note) => format!("{}\n[Error: {}]", response, note),
        None => response.to_string(),
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Allocate a chat seeded with one open turn and return its id.
    async fn create(&self, turn: NewTurn) -> Result<String, StoreError>;

    /// Append an open turn to an existing chat and return its index.
    async fn append_open_turn(&self, chat_id: &str, turn: NewTurn) -> Result<usize, StoreError>;

    /// Set the response of an open turn. Returns `false` without
    /// writing anything if the turn was already finalized.
    async fn finalize_open_turn(
        &self,
        chat_id: &str,
        turn_index: usize,
        response: &str,
        annotation: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Index of the chat's open turn, if it has one.
    async fn open_turn(&self, chat_id: &str) -> Result<Option<usize>, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;

    /// Chats ordered by most recent activity.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<ChatSummary>, StoreError>;

    async fn get(&self, chat_id: &str) -> Result<Chat, StoreError>;

    async fn rename(&self, chat_id: &str, name: &str) -> Result<(), StoreError>;

    async fn delete(&self, chat_id: &str) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn ConversationStore>;
