//! Sends prompts to the server and reads the streamed reply into a
//! shared `ConversationSession`.
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Error, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::session::{ConversationSession, GENERATION_STOPPED};
use crate::api::public::ollama::{CHAT_ID_HEADER, ChatRequest};
use crate::ollama::{FrameError, LineBuffer, parse_line};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Aborted,
    Errored(String),
}

impl ExchangeState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExchangeState::Completed | ExchangeState::Aborted | ExchangeState::Errored(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("{0}")]
    Stream(String),
}

/// Progress of the exchange in flight, for rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChatId(String),
    Fragment { turn: usize, text: String },
    Finished { turn: usize, state: ExchangeState },
}

struct Pending {
    turn: usize,
    token: CancellationToken,
    handle: JoinHandle<ExchangeState>,
}

fn lock(session: &Mutex<ConversationSession>) -> MutexGuard<'_, ConversationSession> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ChatClient {
    http: reqwest::Client,
    chat_url: String,
    model: String,
    session: Arc<Mutex<ConversationSession>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    pending: Option<Pending>,
}

impl ChatClient {
    pub fn new(
        server_url: &str,
        model: &str,
        session: ConversationSession,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), Error> {
        let http = reqwest::Client::builder().build()?;
        let (events, rx) = mpsc::unbounded_channel();
        let client = Self {
            http,
            chat_url: format!("{}/api/ollama/chat", server_url.trim_end_matches('/')),
            model: model.to_string(),
            session: Arc::new(Mutex::new(session)),
            events,
            pending: None,
        };
        Ok((client, rx))
    }

    pub fn session(&self) -> ConversationSession {
        lock(&self.session).clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.pending
            .as_ref()
            .map(|p| !p.handle.is_finished())
            .unwrap_or(false)
    }

    /// Send a prompt. Any exchange still running is stopped first so
    /// only one turn is ever open. Returns the new turn's index.
    pub async fn send(&mut self, content: &str) -> usize {
        self.stop().await;

        let (turn, request) = {
            let mut session = lock(&self.session);
            let turn = session.begin_turn(content);
            let request = ChatRequest {
                model: Some(self.model.clone()),
                messages: session.messages(),
                chat_id: session.chat_id().map(|id| id.to_string()),
                document: None,
            };
            (turn, request)
        };

        let token = CancellationToken::new();
        let exchange = Exchange {
            http: self.http.clone(),
            chat_url: self.chat_url.clone(),
            session: self.session.clone(),
            events: self.events.clone(),
            turn,
        };
        let handle = tokio::spawn(exchange.run(request, token.clone()));
        self.pending = Some(Pending {
            turn,
            token,
            handle,
        });
        turn
    }

    /// Cancel the exchange in flight, keeping what was received so
    /// far. Returns its final state, or `None` if nothing was running.
    pub async fn stop(&mut self) -> Option<ExchangeState> {
        let pending = self.pending.as_ref()?;
        pending.token.cancel();
        self.wait().await
    }

    /// Wait for the exchange in flight to end.
    pub async fn wait(&mut self) -> Option<ExchangeState> {
        let pending = self.pending.take()?;
        match pending.handle.await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!("Exchange task for turn {} failed: {}", pending.turn, e);
                let state = ExchangeState::Errored(e.to_string());
                lock(&self.session).set_state(pending.turn, state.clone());
                Some(state)
            }
        }
    }
}

struct Exchange {
    http: reqwest::Client,
    chat_url: String,
    session: Arc<Mutex<ConversationSession>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    turn: usize,
}

impl Exchange {
    async fn run(self, request: ChatRequest, token: CancellationToken) -> ExchangeState {
        let state = tokio::select! {
            biased;
            _ = token.cancelled() => ExchangeState::Aborted,
            res = self.stream(&request) => match res {
                Ok(()) => ExchangeState::Completed,
                Err(e) => ExchangeState::Errored(e.to_string()),
            },
        };

        {
            let mut session = lock(&self.session);
            match &state {
                ExchangeState::Aborted => session.annotate(self.turn, GENERATION_STOPPED),
                ExchangeState::Errored(msg) => {
                    tracing::warn!("Exchange for turn {} failed: {}", self.turn, msg);
                    session.annotate(self.turn, &format!("Error: {}", msg));
                }
                _ => {}
            }
            session.set_state(self.turn, state.clone());
        }
        let _ = self.events.send(ClientEvent::Finished {
            turn: self.turn,
            state: state.clone(),
        });
        state
    }

    async fn stream(&self, request: &ChatRequest) -> Result<(), ClientError> {
        let response = self.http.post(&self.chat_url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| format!("Request failed with status {}", status));
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if let Some(chat_id) = response
            .headers()
            .get(CHAT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if lock(&self.session).adopt_chat_id(chat_id) {
                tracing::debug!("Server saved the exchange as chat {}", chat_id);
                let _ = self.events.send(ClientEvent::ChatId(chat_id.to_string()));
            }
        }
        lock(&self.session).set_state(self.turn, ExchangeState::Streaming);

        let mut lines = LineBuffer::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            for line in lines.push(&chunk?)? {
                if self.apply_line(&line)? {
                    return Ok(());
                }
            }
        }
        if let Some(line) = lines.finish() {
            self.apply_line(&line)?;
        }
        Ok(())
    }

    // Returns true once the server marked the reply as done
    fn apply_line(&self, line: &[u8]) -> Result<bool, ClientError> {
        let Some(event) = parse_line(line)? else {
            return Ok(false);
        };
        if let Some(err) = event.error {
            return Err(ClientError::Stream(err));
        }
        if let Some(fragment) = event.content() {
            lock(&self.session).apply_fragment(self.turn, fragment);
            let _ = self.events.send(ClientEvent::Fragment {
                turn: self.turn,
                text: fragment.to_string(),
            });
        }
        Ok(event.done)
    }
}
