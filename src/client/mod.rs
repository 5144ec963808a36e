//! Client for a running llamachat server.
pub mod consumer;
pub mod session;

pub use consumer::{ChatClient, ClientError, ClientEvent, ExchangeState};
pub use session::{ConversationSession, LocalTurn};
