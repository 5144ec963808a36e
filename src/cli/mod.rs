use anyhow::Result;
use clap::{Parser, Subcommand};

pub mod chat;
pub mod init;
pub mod models;
pub mod serve;

use crate::core::AppConfig;

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    Init {},
    /// Run the API server
    Serve {
        /// Set the server host address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Set the server port
        #[arg(long, default_value = "3001")]
        port: String,
    },
    /// List the models available on the inference backend
    Models {},
    /// Chat with a model through a running server
    Chat {
        #[arg(long)]
        model: String,
        /// Base url of the llamachat server
        #[arg(long, default_value = "http://127.0.0.1:3001")]
        server: String,
        /// Continue an existing chat
        #[arg(long)]
        chat_id: Option<String>,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    let config = AppConfig::default();

    // Handle each sub command
    match args.command {
        Some(Command::Init {}) => {
            init::run(&config).await?;
        }
        Some(Command::Serve { host, port }) => {
            serve::run(host, port, config).await?;
        }
        Some(Command::Models {}) => {
            models::run(&config).await?;
        }
        Some(Command::Chat {
            model,
            server,
            chat_id,
        }) => {
            chat::run(&model, &server, chat_id).await?;
        }
        None => {}
    }

    Ok(())
}
