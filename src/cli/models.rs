use anyhow::Result;

use crate::core::AppConfig;
use crate::ollama::OllamaClient;

pub async fn run(config: &AppConfig) -> Result<()> {
    let client = OllamaClient::new(
        &config.ollama_api_url,
        config.connect_timeout,
        config.request_timeout,
    )?;
    for name in client.list_models().await? {
        println!("{}", name);
    }
    Ok(())
}
