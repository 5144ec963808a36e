pub mod db;
pub mod exchange;
pub mod finalizer;
pub mod inflight;
pub mod models;
pub mod relay;
pub mod store;

pub use db::SqliteStore;
pub use exchange::{Exchange, ExchangeInput, ValidationError, open_exchange, run_exchange};
pub use finalizer::{Finalizer, Termination};
pub use inflight::InFlight;
pub use store::{ConversationStore, SharedStore, StoreError};
