use std::pin::Pin;
use std::time::Duration;

use anyhow::{Error, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "user")]
    User,
}

/// A message in the shape the Ollama chat API expects. Images are raw
/// base64 strings without a data URI prefix.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Message {
    pub fn new(role: Role, content: &str) -> Self {
        Message {
            role,
            content: content.to_string(),
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Inference backend is unreachable at {url}: {source}")]
    BackendUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Inference backend returned {status}: {message}")]
    UpstreamError { status: u16, message: String },
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Handle to a streaming response from the inference backend.
///
/// Yields raw chunks exactly as they arrive. Dropping or cancelling
/// the handle closes the underlying connection, which is how Ollama
/// learns to stop generating.
pub struct TokenStream {
    inner: Option<ChunkStream>,
}

impl TokenStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self {
            inner: Some(Box::pin(stream)),
        }
    }

    /// Next raw chunk, or `None` once the transport ended or the
    /// handle was cancelled.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, Error>> {
        match self.inner.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        }
    }

    pub fn cancel(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!("Token stream cancelled");
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

/// Client for an Ollama compatible inference backend.
#[derive(Clone, Debug)]
pub struct OllamaClient {
    http: reqwest::Client,
    api_url: String,
    request_timeout: Duration,
}

impl OllamaClient {
    pub fn new(
        api_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Open a streaming chat completion. Returns as soon as the backend
    /// has answered with headers so errors like an unknown model are
    /// known before anything is relayed.
    pub async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
    ) -> Result<TokenStream, GatewayError> {
        let payload = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        let url = format!("{}/api/chat", self.api_url);
        tracing::debug!("Opening chat stream to {} with {} messages", url, messages.len());

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|source| GatewayError::BackendUnreachable {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body);
            tracing::warn!("Chat stream rejected by backend ({}): {}", status, message);
            return Err(if status == reqwest::StatusCode::NOT_FOUND {
                GatewayError::ModelNotFound(message)
            } else {
                GatewayError::UpstreamError {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let stream = response.bytes_stream().map(|chunk| chunk.map_err(Error::from));
        Ok(TokenStream::new(stream))
    }

    /// Names of the models available on the backend.
    pub async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        let url = format!("{}/api/tags", self.api_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| GatewayError::BackendUnreachable {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::UpstreamError {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let tags: TagsResponse =
            serde_json::from_str(&body).map_err(|e| GatewayError::UpstreamError {
                status: status.as_u16(),
                message: format!("Invalid model list: {}", e),
            })?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

// Ollama reports failures as {"error": "..."} but anything in front of
// it (proxies, load balancers) may not
fn error_message(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(val) => val["error"]
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| body.trim().to_string()),
        Err(_) => body.trim().to_string(),
    }
}
