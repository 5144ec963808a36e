//! The core models for a chat and its turns.
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::ollama::{Message, Role};

/// Chats are named after the start of their first user message.
pub const CHAT_NAME_MAX_CHARS: usize = 50;

/// Truncate to at most `max` characters without splitting a char.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub text: String,
}

impl Document {
    /// Decode an uploaded document. Only the text is kept, anything
    /// that isn't UTF-8 is replaced rather than rejected.
    pub fn from_base64(
        name: &str,
        data: &str,
        max_chars: usize,
    ) -> Result<Self, base64::DecodeError> {
        let bytes = BASE64.decode(strip_data_uri(data))?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(Self {
            name: name.to_string(),
            text: truncate_chars(&text, max_chars).to_string(),
        })
    }

    /// How the document is presented to the model ahead of the
    /// user's prompt.
    pub fn prompt_prefix(&self) -> String {
        format!("Document \"{}\":\n{}\n\n", self.name, self.text)
    }
}

/// Remove a `data:<mime>;base64,` prefix if there is one.
pub fn strip_data_uri(data: &str) -> &str {
    if data.starts_with("data:") {
        match data.split_once(',') {
            Some((_, payload)) => payload,
            None => data,
        }
    } else {
        data
    }
}

/// Store images as data URIs. Raw base64 gets its mime type sniffed
/// from the leading bytes.
pub fn image_data_uri(data: &str) -> String {
    if data.starts_with("data:") {
        return data.to_string();
    }
    let mime = if data.starts_with("/9j/") {
        "image/jpeg"
    } else if data.starts_with("R0lGOD") {
        "image/gif"
    } else if data.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/png"
    };
    format!("data:{};base64,{}", mime, data)
}

/// A user prompt about to be stored, before the model has replied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewTurn {
    pub user: String,
    pub image: Option<String>,
    pub document: Option<Document>,
}

impl NewTurn {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            ..Default::default()
        }
    }

    pub fn chat_name(&self) -> String {
        truncate_chars(self.user.trim(), CHAT_NAME_MAX_CHARS).to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub ai: String,
    pub datetime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    pub finalized: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub datetime: String,
    pub messages: Vec<Turn>,
}

impl Chat {
    /// Project the turns into the message history the backend
    /// expects. A turn that is still open contributes only its prompt.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() * 2);
        for turn in &self.messages {
            let images = turn
                .image
                .as_deref()
                .map(|img| vec![strip_data_uri(img).to_string()])
                .unwrap_or_default();
            messages.push(Message::new(Role::User, &turn.user).with_images(images));
            if turn.finalized && !turn.ai.is_empty() {
                messages.push(Message::new(Role::Assistant, &turn.ai));
            }
        }
        messages
    }

    pub fn open_turn(&self) -> Option<usize> {
        self.messages.iter().rposition(|t| !t.finalized)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    pub datetime: String,
    pub turn_count: usize,
}
