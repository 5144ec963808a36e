//! Router for the Ollama API

use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    response::Response,
    routing::{get, post},
};
use http::{StatusCode, header};
use tokio::sync::{mpsc, oneshot};

use super::public;
use crate::api::public::ApiError;
use crate::api::state::AppState;
use crate::api::utils::{DetectDisconnect, ndjson_body};
use crate::chat::{ExchangeInput, ValidationError, open_exchange, run_exchange};

type SharedState = Arc<RwLock<AppState>>;

/// Store the prompt and stream the model's reply back as JSON lines
async fn chat_handler(
    State(state): State<SharedState>,
    payload: Result<Json<public::ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.map_err(|e| ValidationError::InvalidBody(e.body_text()))?;

    let (store, gateway, inflight, config) = {
        let shared_state = state
            .read()
            .map_err(|_| anyhow!("Unable to read shared state"))?;
        (
            shared_state.store.clone(),
            shared_state.gateway.clone(),
            shared_state.inflight.clone(),
            shared_state.config.clone(),
        )
    };

    tracing::debug!(
        "Chat request for model {:?} with chat id {:?} and {} messages",
        payload.model,
        payload.chat_id,
        payload.messages.len()
    );
    let input = ExchangeInput::new(
        payload.model,
        payload.messages,
        payload.chat_id,
        payload.document,
        &config,
    )?;
    let exchange = open_exchange(&store, &gateway, &inflight, config.turn_grace, input).await?;
    let chat_id = exchange.chat_id.clone();

    let (tx, rx) = mpsc::unbounded_channel();
    let (disconnect_notifier, disconnected) = oneshot::channel();
    let body = DetectDisconnect::new(ndjson_body(rx, config.heartbeat_interval), disconnect_notifier);

    // The exchange outlives this handler, it ends when the stream is
    // done or the body is dropped
    tokio::spawn(run_exchange(exchange, tx, disconnected));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, public::NDJSON_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(public::CHAT_ID_HEADER, chat_id)
        .body(Body::from_stream(body))?;
    Ok(response)
}

/// List the models available on the backend
async fn model_list(
    State(state): State<SharedState>,
) -> Result<Json<public::ModelListResponse>, ApiError> {
    let gateway = state
        .read()
        .map_err(|_| anyhow!("Unable to read shared state"))?
        .gateway
        .clone();
    let models = gateway.list_models().await?;
    tracing::debug!("Backend has {} models", models.len());

    Ok(Json(public::ModelListResponse { models }))
}

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/list", get(model_list))
}
