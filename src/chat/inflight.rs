//! Tracks which chats have an exchange streaming right now.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

type Entries = HashMap<String, (u64, watch::Receiver<bool>)>;

#[derive(Clone, Default)]
pub struct InFlight {
    chats: Arc<Mutex<Entries>>,
    next_id: Arc<AtomicU64>,
}

fn lock(chats: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    // Entries stay consistent even if a holder panicked
    chats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `chat_id` for a new exchange. If another exchange holds
    /// it, wait up to `grace` for it to let go. Returns `None` if it
    /// is still held after that.
    pub async fn claim(&self, chat_id: &str, grace: Duration) -> Option<Claim> {
        let deadline = Instant::now() + grace;
        loop {
            let mut held = {
                let mut chats = lock(&self.chats);
                match chats.get(chat_id) {
                    Some((_, rx)) if !*rx.borrow() => rx.clone(),
                    _ => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(false);
                        chats.insert(chat_id.to_string(), (id, rx));
                        return Some(Claim {
                            chat_id: chat_id.to_string(),
                            id,
                            tx,
                            chats: self.chats.clone(),
                        });
                    }
                }
            };

            tracing::debug!("Chat {} has an exchange in flight, waiting", chat_id);
            match timeout_at(deadline, held.wait_for(|released| *released)).await {
                Ok(_) => continue,
                Err(_) => {
                    tracing::warn!("Chat {} still busy after {:?}", chat_id, grace);
                    return None;
                }
            }
        }
    }

    pub fn is_active(&self, chat_id: &str) -> bool {
        lock(&self.chats)
            .get(chat_id)
            .map(|(_, rx)| !*rx.borrow())
            .unwrap_or(false)
    }
}

/// Held for the lifetime of an exchange. Dropping it releases the chat
/// and wakes anyone waiting on it.
pub struct Claim {
    chat_id: String,
    id: u64,
    tx: watch::Sender<bool>,
    chats: Arc<Mutex<Entries>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.tx.send_replace(true);
        let mut chats = lock(&self.chats);
        if matches!(chats.get(&self.chat_id), Some((id, _)) if *id == self.id) {
            chats.remove(&self.chat_id);
        }
    }
}
