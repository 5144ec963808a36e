//! Router for saved chats

use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use axum_extra::extract::Query;

use super::public;
use crate::api::public::ApiError;
use crate::api::state::AppState;
use crate::chat::{SharedStore, ValidationError};
use crate::chat::models::{CHAT_NAME_MAX_CHARS, truncate_chars};

type SharedState = Arc<RwLock<AppState>>;

fn store(state: &SharedState) -> Result<SharedStore, ApiError> {
    let store = state
        .read()
        .map_err(|_| anyhow!("Unable to read shared state"))?
        .store
        .clone();
    Ok(store)
}

/// Get a page of chats, most recently active first
async fn chat_list(
    State(state): State<SharedState>,
    Query(params): Query<public::ChatListQuery>,
) -> Result<Json<public::ChatListResponse>, ApiError> {
    let store = store(&state)?;
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1)
        .checked_mul(limit)
        .filter(|offset| i64::try_from(*offset).is_ok())
        .ok_or_else(|| ValidationError::InvalidBody(format!("Page {} is out of range", page)))?;
    let total_chats = store.count().await?;
    let chats = store.list(limit, offset).await?;
    let total_pages = (total_chats as f64 / limit as f64).ceil() as i64;

    Ok(Json(public::ChatListResponse {
        chats,
        page,
        limit,
        total_chats,
        total_pages,
    }))
}

/// Get a single chat with all of its turns
async fn chat_get(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<public::ChatResponse>, ApiError> {
    let chat = store(&state)?.get(&id).await?;
    Ok(Json(public::ChatResponse { chat }))
}

async fn chat_rename(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(payload): Json<public::RenameRequest>,
) -> Result<StatusCode, ApiError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ValidationError::InvalidBody("Name must not be empty".to_string()).into());
    }
    store(&state)?
        .rename(&id, truncate_chars(name, CHAT_NAME_MAX_CHARS))
        .await?;
    tracing::info!("Renamed chat {}", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn chat_delete(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    store(&state)?.delete(&id).await?;
    tracing::info!("Deleted chat {}", id);
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(chat_list))
        .route("/{id}", get(chat_get).patch(chat_rename).delete(chat_delete))
}
