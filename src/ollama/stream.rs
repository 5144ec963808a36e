//! Framing for the newline-delimited JSON token stream.
//!
//! Ollama (and the relay in front of it) emits one JSON object per
//! line, but transport chunks don't line up with those lines. Both
//! the server relay and the client consumer feed raw chunks through
//! a `LineBuffer` and only parse complete lines.
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Stream frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Malformed stream frame {line:?}: {source}")]
    Json {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Stream frame exceeds {limit} bytes without a newline")]
    LineTooLong { limit: usize },
}

/// Longest line a `LineBuffer` accepts by default.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into complete lines.
///
/// Bytes after the last newline are held back and prefixed onto the
/// next chunk. Lines are kept as bytes until complete so a multi-byte
/// character split across two chunks is decoded correctly.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    // Bytes of `buf` already known to hold no newline
    scanned: usize,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Append a chunk and drain every line it completed, without the
    /// trailing `\n` (or `\r\n`). Fails once a line grows past the
    /// limit, after which the buffer starts over empty.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if end - start > self.limit {
                return Err(self.overflow());
            }
            let mut line = self.buf[start..end].to_vec();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.limit {
            return Err(self.overflow());
        }
        Ok(lines)
    }

    fn overflow(&mut self) -> FrameError {
        self.buf.clear();
        self.scanned = 0;
        FrameError::LineTooLong { limit: self.limit }
    }

    /// Whatever is left once the transport has ended. A stream that
    /// doesn't end with a newline still carries a final line.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buf);
        if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(rest)
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
}

/// One line of the token stream.
// {"model":"llama3","created_at":"...","message":{"role":"assistant","content":"He"},"done":false}
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<EventMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    pub fn failure(message: &str) -> Self {
        Self {
            message: None,
            done: true,
            error: Some(message.to_string()),
        }
    }

    /// The content fragment carried by this event, if any.
    pub fn content(&self) -> Option<&str> {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
    }
}

/// Parse one complete line. Blank lines (heartbeats) yield `None`.
pub fn parse_line(line: &[u8]) -> Result<Option<StreamEvent>, FrameError> {
    let text = std::str::from_utf8(line)?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<StreamEvent>(text)
        .map(Some)
        .map_err(|source| FrameError::Json {
            line: text.to_string(),
            source,
        })
}
