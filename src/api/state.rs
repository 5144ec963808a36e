use std::sync::Arc;

use anyhow::{Error, Result};

use crate::chat::{InFlight, SharedStore, SqliteStore};
use crate::core::AppConfig;
use crate::ollama::OllamaClient;

pub struct AppState {
    pub store: SharedStore,
    pub gateway: OllamaClient,
    // Chats with a response currently streaming
    pub inflight: InFlight,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(store: SharedStore, config: AppConfig) -> Result<Self, Error> {
        let gateway = OllamaClient::new(
            &config.ollama_api_url,
            config.connect_timeout,
            config.request_timeout,
        )?;
        Ok(Self {
            store,
            gateway,
            inflight: InFlight::new(),
            config,
        })
    }

    /// State backed by the sqlite database from `config`.
    pub async fn open(config: AppConfig) -> Result<Self, Error> {
        let store = SqliteStore::open(&config.db_path).await?;
        Self::new(Arc::new(store), config)
    }
}
