//! Copies the backend's token stream to the client while building up
//! the full response.
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::ollama::{FrameError, LineBuffer, TokenStream, parse_line};

/// The response text received so far. Lives outside the relay so it
/// can still be read after the relay future is dropped.
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    text: String,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed stream frame: {0}")]
    MalformedFrame(#[from] FrameError),
    #[error("{0}")]
    Upstream(String),
    #[error("Client disconnected")]
    ClientDisconnected,
}

/// How a relay that didn't fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The backend sent `done: true`.
    Done,
    /// The connection closed without a `done` event.
    TransportClosed,
}

/// Relay every complete line from `tokens` to `client`, in order.
/// Content fragments are appended to `acc` before the line is
/// forwarded.
pub async fn relay(
    tokens: &mut TokenStream,
    acc: &mut Accumulator,
    client: &UnboundedSender<Bytes>,
) -> Result<RelayEnd, RelayError> {
    let mut lines = LineBuffer::new();

    while let Some(chunk) = tokens.next_chunk().await {
        let chunk = chunk.map_err(|e| {
            tracing::error!("Token stream failed: {:#}", e);
            RelayError::Upstream(e.to_string())
        })?;
        let complete = lines.push(&chunk).inspect_err(|e| tracing::error!("{}", e))?;
        for line in complete {
            if forward_line(&line, acc, client)? {
                return Ok(RelayEnd::Done);
            }
        }
    }

    if let Some(line) = lines.finish() {
        if forward_line(&line, acc, client)? {
            return Ok(RelayEnd::Done);
        }
    }

    tracing::warn!(
        "Token stream closed without a done event after {} bytes",
        acc.as_str().len()
    );
    Ok(RelayEnd::TransportClosed)
}

// Returns true once the backend marked the response as done
fn forward_line(
    line: &[u8],
    acc: &mut Accumulator,
    client: &UnboundedSender<Bytes>,
) -> Result<bool, RelayError> {
    let event = match parse_line(line) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(false),
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };

    if let Some(err) = event.error {
        tracing::error!("Backend reported an error mid-stream: {}", err);
        return Err(RelayError::Upstream(err));
    }

    if let Some(fragment) = event.content() {
        acc.push(fragment);
    }

    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(line);
    out.push(b'\n');
    client
        .send(Bytes::from(out))
        .map_err(|_| RelayError::ClientDisconnected)?;

    Ok(event.done)
}
