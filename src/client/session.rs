use serde::{Deserialize, Serialize};

use super::consumer::ExchangeState;
use crate::ollama::{Message, Role};

pub const GENERATION_STOPPED: &str = "[Generation stopped]";

/// A turn as the client sees it. The response fills in as fragments
/// arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTurn {
    pub user: String,
    pub ai: String,
    /// Shown after the response, never sent back to the model.
    pub note: Option<String>,
    pub state: ExchangeState,
}

impl LocalTurn {
    /// The response as displayed, including any note.
    pub fn display(&self) -> String {
        match &self.note {
            Some(note) if self.ai.is_empty() => note.clone(),
            Some(note) => format!("{}\n{}", self.ai, note),
            None => self.ai.clone(),
        }
    }
}

/// The local copy of one conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    chat_id: Option<String>,
    turns: Vec<LocalTurn>,
}

impl ConversationSession {
    pub fn new(chat_id: Option<String>) -> Self {
        Self {
            chat_id,
            turns: Vec::new(),
        }
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn turns(&self) -> &[LocalTurn] {
        &self.turns
    }

    pub fn turn(&self, index: usize) -> Option<&LocalTurn> {
        self.turns.get(index)
    }

    /// Take the id the server saved the exchange under. The server
    /// starts a new chat when it doesn't know ours, so its answer wins.
    /// Returns whether the id changed.
    pub fn adopt_chat_id(&mut self, chat_id: &str) -> bool {
        if self.chat_id.as_deref() == Some(chat_id) {
            return false;
        }
        self.chat_id = Some(chat_id.to_string());
        true
    }

    /// Append a turn with an empty response and return its index.
    pub fn begin_turn(&mut self, user: &str) -> usize {
        self.turns.push(LocalTurn {
            user: user.to_string(),
            ai: String::new(),
            note: None,
            state: ExchangeState::Sending,
        });
        self.turns.len() - 1
    }

    pub fn apply_fragment(&mut self, index: usize, fragment: &str) {
        if let Some(turn) = self.turns.get_mut(index) {
            turn.ai.push_str(fragment);
        }
    }

    pub fn set_state(&mut self, index: usize, state: ExchangeState) {
        if let Some(turn) = self.turns.get_mut(index) {
            turn.state = state;
        }
    }

    pub fn annotate(&mut self, index: usize, note: &str) {
        if let Some(turn) = self.turns.get_mut(index) {
            turn.note = Some(note.to_string());
        }
    }

    /// History to send with a request, ending with the latest prompt.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2);
        for (idx, turn) in self.turns.iter().enumerate() {
            messages.push(Message::new(Role::User, &turn.user));
            if idx + 1 < self.turns.len() && !turn.ai.is_empty() {
                messages.push(Message::new(Role::Assistant, &turn.ai));
            }
        }
        messages
    }
}
