//! API routes module

pub mod chats;
pub mod ollama;

use std::sync::{Arc, RwLock};

use crate::api::state::AppState;
use axum::Router;

type SharedState = Arc<RwLock<AppState>>;

/// Create the combined API router
pub fn router() -> Router<SharedState> {
    Router::new()
        // Streaming chat exchange and model catalog
        .nest("/ollama", ollama::router())
        // Saved chats
        .nest("/chats", chats::router())
}
