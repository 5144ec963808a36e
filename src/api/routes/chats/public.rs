//! Public types for the chats API
use serde::{Deserialize, Serialize};

use crate::chat::models::{Chat, ChatSummary};

#[derive(Deserialize)]
pub struct ChatListQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct ChatListResponse {
    pub chats: Vec<ChatSummary>,
    pub page: usize,
    pub limit: usize,
    pub total_chats: i64,
    pub total_pages: i64,
}

#[derive(Serialize, Deserialize)]
pub struct ChatResponse {
    pub chat: Chat,
}

#[derive(Serialize, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}
