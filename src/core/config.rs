use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub storage_path: String,
    pub db_path: String,
    pub ollama_api_url: String,
    pub system_message: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub turn_grace: Duration,
    pub document_max_chars: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(val) => val.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value for {}: {}", key, val);
            default
        }),
        Err(_) => default,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let storage_path = env::var("LLAMACHAT_STORAGE_PATH").unwrap_or("./".to_string());
        let db_path = format!("{}/llamachat.sqlite", storage_path.trim_end_matches('/'));
        let ollama_api_url =
            env::var("OLLAMA_API_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
        let system_message = env::var("LLAMACHAT_SYSTEM_MESSAGE")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let request_timeout = Duration::from_secs(env_or("LLAMACHAT_REQUEST_TIMEOUT_SECS", 60 * 5));
        let connect_timeout = Duration::from_secs(env_or("LLAMACHAT_CONNECT_TIMEOUT_SECS", 10));
        let heartbeat_interval = Duration::from_millis(env_or("LLAMACHAT_HEARTBEAT_MS", 1000));
        let turn_grace = Duration::from_millis(env_or("LLAMACHAT_TURN_GRACE_MS", 3000));
        let document_max_chars = env_or("LLAMACHAT_DOCUMENT_MAX_CHARS", 20_000);

        Self {
            storage_path,
            db_path,
            ollama_api_url,
            system_message,
            request_timeout,
            connect_timeout,
            heartbeat_interval,
            turn_grace,
            document_max_chars,
        }
    }
}
