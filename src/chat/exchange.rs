//! One chat exchange: persist the prompt, stream the model's reply to
//! the client and save whatever was received exactly once.
use std::time::Duration;

use anyhow::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::finalizer::{Finalizer, Termination};
use super::inflight::{Claim, InFlight};
use super::models::{Document, NewTurn, image_data_uri, strip_data_uri};
use super::relay::{Accumulator, relay};
use super::store::{SharedStore, StoreError};
use crate::core::AppConfig;
use crate::ollama::{Message, OllamaClient, Role, StreamEvent, TokenStream};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Model and messages required")]
    MissingModelOrMessages,
    #[error("Last message must be a user message with content.")]
    InvalidLastMessage,
    #[error("Invalid document {name}: {reason}")]
    InvalidDocument { name: String, reason: String },
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
}

/// A document attached to the prompt, base64 encoded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentUpload {
    pub name: String,
    pub data: String,
}

/// A validated exchange request.
#[derive(Clone, Debug)]
pub struct ExchangeInput {
    pub model: String,
    /// History as sent to the backend.
    pub messages: Vec<Message>,
    pub chat_id: Option<String>,
    /// What gets stored for this turn.
    pub turn: NewTurn,
}

impl ExchangeInput {
    pub fn new(
        model: Option<String>,
        mut messages: Vec<Message>,
        chat_id: Option<String>,
        document: Option<DocumentUpload>,
        config: &AppConfig,
    ) -> Result<Self, ValidationError> {
        let model = model
            .filter(|m| !m.trim().is_empty())
            .ok_or(ValidationError::MissingModelOrMessages)?;
        let last = messages
            .last_mut()
            .ok_or(ValidationError::MissingModelOrMessages)?;
        if last.role != Role::User || last.content.trim().is_empty() {
            return Err(ValidationError::InvalidLastMessage);
        }

        let document = document
            .map(|doc| {
                Document::from_base64(&doc.name, &doc.data, config.document_max_chars).map_err(
                    |e| ValidationError::InvalidDocument {
                        name: doc.name.clone(),
                        reason: e.to_string(),
                    },
                )
            })
            .transpose()?;

        let turn = NewTurn {
            user: last.content.clone(),
            image: last.images.first().map(|img| image_data_uri(img)),
            document: document.clone(),
        };

        if let Some(doc) = &document {
            last.content = format!("{}{}", doc.prompt_prefix(), last.content);
        }

        // The backend wants bare base64
        for msg in messages.iter_mut() {
            for img in msg.images.iter_mut() {
                *img = strip_data_uri(img).to_string();
            }
        }

        if let Some(system) = &config.system_message {
            if !messages.iter().any(|m| m.role == Role::System) {
                messages.insert(0, Message::new(Role::System, system));
            }
        }

        Ok(Self {
            model,
            messages,
            chat_id: chat_id.filter(|id| !id.trim().is_empty()),
            turn,
        })
    }
}

/// An exchange whose backend stream is open and whose turn is stored.
pub struct Exchange {
    pub chat_id: String,
    pub turn_index: usize,
    pub tokens: TokenStream,
    pub finalizer: Finalizer,
    pub claim: Claim,
}

/// Everything that can fail before a byte is streamed happens here,
/// so failures can still become a regular error response.
///
/// The backend stream is opened before anything is stored: a request
/// for an unknown model leaves no chat behind.
pub async fn open_exchange(
    store: &SharedStore,
    gateway: &OllamaClient,
    inflight: &InFlight,
    grace: Duration,
    input: ExchangeInput,
) -> Result<Exchange, Error> {
    let ExchangeInput {
        model,
        messages,
        chat_id,
        turn,
    } = input;

    let claim = match &chat_id {
        Some(id) => Some(
            inflight
                .claim(id, grace)
                .await
                .ok_or_else(|| StoreError::TurnInProgress(id.clone()))?,
        ),
        None => None,
    };

    let tokens = gateway.stream_chat(&model, &messages).await?;

    let (chat_id, turn_index, claim) = match (chat_id, claim) {
        (Some(id), Some(claim)) => match append_turn(store, &id, turn.clone()).await {
            Ok(idx) => (id, idx, claim),
            Err(StoreError::NotFound(_)) => {
                tracing::warn!("Chat {} not found, starting a new chat", id);
                drop(claim);
                create_chat(store, inflight, turn).await?
            }
            Err(e) => return Err(e.into()),
        },
        _ => create_chat(store, inflight, turn).await?,
    };

    tracing::info!(
        "Streaming {} for chat {} turn {}",
        model,
        chat_id,
        turn_index
    );

    let finalizer = Finalizer::new(store.clone(), &chat_id, turn_index);
    Ok(Exchange {
        chat_id,
        turn_index,
        tokens,
        finalizer,
        claim,
    })
}

async fn create_chat(
    store: &SharedStore,
    inflight: &InFlight,
    turn: NewTurn,
) -> Result<(String, usize, Claim), Error> {
    let chat_id = store.create(turn).await?;
    // Nobody else knows this id yet
    let claim = inflight
        .claim(&chat_id, Duration::ZERO)
        .await
        .ok_or_else(|| StoreError::TurnInProgress(chat_id.clone()))?;
    Ok((chat_id, 0, claim))
}

// Only called while holding the chat's claim, so an open turn in the
// store belongs to an exchange that died without finalizing
async fn append_turn(store: &SharedStore, chat_id: &str, turn: NewTurn) -> Result<usize, StoreError> {
    match store.append_open_turn(chat_id, turn.clone()).await {
        Err(StoreError::TurnInProgress(_)) => {
            if let Some(idx) = store.open_turn(chat_id).await? {
                tracing::warn!("Closing orphaned turn {} of chat {}", idx, chat_id);
                let note = Termination::Interrupted.annotation();
                store
                    .finalize_open_turn(chat_id, idx, "", note.as_deref())
                    .await?;
            }
            store.append_open_turn(chat_id, turn).await
        }
        res => res,
    }
}

/// Drive an opened exchange to its end.
///
/// Relays tokens into `client` until the backend is done, fails, or
/// `disconnected` fires. Then closes the backend stream, saves the
/// accumulated text and finally drops `client`, which ends the
/// response body.
pub async fn run_exchange(
    exchange: Exchange,
    client: mpsc::UnboundedSender<Bytes>,
    disconnected: oneshot::Receiver<()>,
) -> Termination {
    let Exchange {
        chat_id,
        turn_index,
        mut tokens,
        finalizer,
        claim,
    } = exchange;
    let mut acc = Accumulator::new();

    let termination = tokio::select! {
        biased;
        _ = disconnected => Termination::ClientDisconnected,
        res = relay(&mut tokens, &mut acc, &client) => match res {
            Ok(_) => Termination::Completed,
            Err(e) => e.into(),
        },
    };
    tokens.cancel();

    if let Termination::Errored(msg) = &termination {
        if let Ok(mut line) = serde_json::to_vec(&StreamEvent::failure(msg)) {
            line.push(b'\n');
            let _ = client.send(Bytes::from(line));
        }
    }

    tracing::debug!(
        "Exchange for chat {} turn {} ended: {:?}",
        chat_id,
        turn_index,
        termination
    );
    finalizer.finalize(&termination, acc.as_str()).await;

    drop(client);
    drop(claim);
    termination
}
