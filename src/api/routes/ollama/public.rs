//! Public types for the Ollama API
use serde::{Deserialize, Serialize};

use crate::chat::exchange::DocumentUpload;
use crate::ollama::Message;

/// Header carrying the id of the chat an exchange was saved to.
pub const CHAT_ID_HEADER: &str = "X-Chat-ID";

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Serialize, Deserialize, Default)]
pub struct ChatRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(rename = "chatId", default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub document: Option<DocumentUpload>,
}

#[derive(Serialize, Deserialize)]
pub struct ModelListResponse {
    pub models: Vec<String>,
}
