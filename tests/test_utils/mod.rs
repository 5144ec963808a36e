//! Test utilities for integration tests
#![allow(dead_code)]
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::{Router, body::Body};
use tempfile::TempDir;

use llamachat::api::AppState;
use llamachat::api::app;
use llamachat::chat::{ConversationStore, SharedStore, SqliteStore};
use llamachat::chat::models::Chat;
use llamachat::core::AppConfig;

pub const HELLO_STREAM: &str = concat!(
    "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"He\"},\"done\":false}\n",
    "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"llo\"},\"done\":true}\n",
);

pub struct TestApp {
    pub router: Router,
    pub state: Arc<RwLock<AppState>>,
    pub store: SharedStore,
    // Removed when the test ends
    _dir: TempDir,
}

/// Creates a test application backed by a fresh sqlite database in a
/// temporary directory, talking to the inference backend at
/// `backend_url` (usually a `mockito` server).
pub async fn test_app(backend_url: &str) -> TestApp {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("llamachat.sqlite");

    let app_config = AppConfig {
        storage_path: dir.path().display().to_string(),
        db_path: db_path.display().to_string(),
        ollama_api_url: backend_url.to_string(),
        system_message: None,
        request_timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(60),
        turn_grace: Duration::from_millis(100),
        document_max_chars: 1000,
    };

    let store = SqliteStore::open(&app_config.db_path)
        .await
        .expect("Failed to open db");
    let store: SharedStore = Arc::new(store);
    let app_state = AppState::new(store.clone(), app_config).expect("Failed to build state");
    let state = Arc::new(RwLock::new(app_state));

    TestApp {
        router: app(Arc::clone(&state)),
        state,
        store,
        _dir: dir,
    }
}

pub async fn body_to_string(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Failed to read body");
    String::from_utf8(bytes.to_vec()).expect("Body is not UTF-8")
}

/// Poll until the chat's latest turn has been finalized.
pub async fn wait_for_finalized(store: &SharedStore, chat_id: &str) -> Chat {
    for _ in 0..100 {
        let chat = store.get(chat_id).await.expect("Chat not found");
        if chat.open_turn().is_none() {
            return chat;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Chat {} was never finalized", chat_id);
}
