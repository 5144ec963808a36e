use anyhow::Result;
use llamachat::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
