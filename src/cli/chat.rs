use std::io::Write;

use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::client::{ChatClient, ClientEvent, ConversationSession, ExchangeState};

pub async fn run(model: &str, server: &str, chat_id: Option<String>) -> Result<()> {
    // Keep logs out of the way of streamed text
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter("warn")
        .init();

    let mut rl = DefaultEditor::new()?;
    let (mut client, mut events) = ChatClient::new(server, model, ConversationSession::new(chat_id))?;

    loop {
        let readline = rl.readline(">>> ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                client.send(line).await;
                print_reply(&mut client, &mut events).await?;
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(chat_id) = client.session().chat_id() {
        println!("Chat saved as {}", chat_id);
    }
    Ok(())
}

// Print fragments as they arrive. Ctrl-C stops the generation.
async fn print_reply(
    client: &mut ChatClient,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
) -> Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.stop().await;
            }
            event = events.recv() => match event {
                Some(ClientEvent::Fragment { text, .. }) => {
                    print!("{}", text);
                    stdout.flush()?;
                }
                Some(ClientEvent::ChatId(_)) => {}
                Some(ClientEvent::Finished { state, .. }) => {
                    match state {
                        ExchangeState::Aborted => println!("\n[Generation stopped]"),
                        ExchangeState::Errored(msg) => println!("\nError: {}", msg),
                        _ => println!(),
                    }
                    client.wait().await;
                    return Ok(());
                }
                None => return Ok(()),
            },
        }
    }
}
