//! Save-exactly-once finalization of an exchange's response.
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use super::relay::RelayError;
use super::store::SharedStore;
use crate::chat::models::truncate_chars;

/// Upstream error text is cut to this many characters in the
/// persisted annotation.
pub const ERROR_NOTE_MAX_CHARS: usize = 100;

pub const CLIENT_DISCONNECTED: &str = "Client Disconnected";
pub const INTERRUPTED: &str = "Interrupted";

/// Why an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Completed,
    Errored(String),
    ClientDisconnected,
    /// The turn was left open by an exchange that no longer exists.
    Interrupted,
}

impl Termination {
    pub fn annotation(&self) -> Option<String> {
        match self {
            Termination::Completed => None,
            Termination::Errored(msg) => {
                let note = truncate_chars(msg, ERROR_NOTE_MAX_CHARS);
                if note.len() < msg.len() {
                    Some(format!("{}...", note))
                } else {
                    Some(note.to_string())
                }
            }
            Termination::ClientDisconnected => Some(CLIENT_DISCONNECTED.to_string()),
            Termination::Interrupted => Some(INTERRUPTED.to_string()),
        }
    }
}

impl From<RelayError> for Termination {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::ClientDisconnected => Termination::ClientDisconnected,
            RelayError::Upstream(msg) => Termination::Errored(msg),
            RelayError::MalformedFrame(e) => Termination::Errored(e.to_string()),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchState {
    Open = 0,
    Finalized = 1,
}

struct Inner {
    state: AtomicU8,
    store: SharedStore,
    chat_id: String,
    turn_index: usize,
}

/// Latch guarding the single write of a turn's response. Clones share
/// the latch, so whichever termination path gets there first writes
/// and the rest do nothing.
#[derive(Clone)]
pub struct Finalizer {
    inner: Arc<Inner>,
}

impl Finalizer {
    pub fn new(store: SharedStore, chat_id: &str, turn_index: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(LatchState::Open as u8),
                store,
                chat_id: chat_id.to_string(),
                turn_index,
            }),
        }
    }

    pub fn state(&self) -> LatchState {
        match self.inner.state.load(Ordering::Acquire) {
            0 => LatchState::Open,
            _ => LatchState::Finalized,
        }
    }

    /// Persist `text` with the annotation for `termination`. Returns
    /// whether this call won the latch. Store failures are logged and
    /// swallowed.
    pub async fn finalize(&self, termination: &Termination, text: &str) -> bool {
        // The latch flips before the write starts so a trigger that
        // arrives while the write is pending is still a no-op
        if self
            .inner
            .state
            .compare_exchange(
                LatchState::Open as u8,
                LatchState::Finalized as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!(
                "Turn {}/{} already finalized, ignoring {:?}",
                self.inner.chat_id,
                self.inner.turn_index,
                termination
            );
            return false;
        }

        let annotation = termination.annotation();
        match self
            .inner
            .store
            .finalize_open_turn(
                &self.inner.chat_id,
                self.inner.turn_index,
                text,
                annotation.as_deref(),
            )
            .await
        {
            Ok(true) => {
                tracing::info!(
                    "Saved response for chat {} turn {} ({} chars, {:?})",
                    self.inner.chat_id,
                    self.inner.turn_index,
                    text.chars().count(),
                    termination
                );
            }
            Ok(false) => {
                tracing::warn!(
                    "Turn {}/{} was finalized by someone else",
                    self.inner.chat_id,
                    self.inner.turn_index
                );
            }
            Err(e) => {
                tracing::error!(
                    "Failed to save response for chat {} turn {}: {}",
                    self.inner.chat_id,
                    self.inner.turn_index,
                    e
                );
            }
        }
        true
    }
}
