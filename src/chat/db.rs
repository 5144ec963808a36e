use anyhow::{Error, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params};
use uuid::Uuid;

use super::models::{Chat, ChatSummary, Document, NewTurn, Turn};
use super::store::{ConversationStore, StoreError, annotate};

/// Conversation store backed by sqlite.
#[derive(Clone)]
pub struct SqliteStore {
    db: Connection,
}

impl SqliteStore {
    pub fn new(db: Connection) -> Self {
        Self { db }
    }

    /// Open a store at `path`, creating the schema if needed.
    pub async fn open(path: &str) -> Result<Self, Error> {
        let db = crate::core::db::async_db(path).await?;
        db.call(|conn| {
            crate::core::db::initialize_db(conn)?;
            Ok(())
        })
        .await?;
        Ok(Self::new(db))
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn insert_turn(
    conn: &rusqlite::Connection,
    chat_id: &str,
    idx: i64,
    turn: &NewTurn,
    datetime: &str,
) -> Result<(), rusqlite::Error> {
    let (document_name, document_text) = match &turn.document {
        Some(doc) => (Some(doc.name.as_str()), Some(doc.text.as_str())),
        None => (None, None),
    };
    conn.execute(
        r#"
        INSERT INTO turn (chat_id, idx, user, ai, image, document_name, document_text, datetime, finalized)
        VALUES (?1, ?2, ?3, '', ?4, ?5, ?6, ?7, 0)
        "#,
        params![
            chat_id,
            idx,
            turn.user,
            turn.image,
            document_name,
            document_text,
            datetime
        ],
    )?;
    Ok(())
}

enum AppendOutcome {
    Appended(usize),
    Missing,
    Open(usize),
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create(&self, turn: NewTurn) -> Result<String, StoreError> {
        let chat_id = Uuid::new_v4().to_string();
        let name = turn.chat_name();
        let id = chat_id.clone();
        let datetime = now();

        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO chat (id, name, created_at, datetime) VALUES (?1, ?2, ?3, ?3)",
                    params![id, name, datetime],
                )?;
                insert_turn(&tx, &id, 0, &turn, &datetime)?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        tracing::debug!("Created chat {}", chat_id);
        Ok(chat_id)
    }

    async fn append_open_turn(&self, chat_id: &str, turn: NewTurn) -> Result<usize, StoreError> {
        let id = chat_id.to_owned();
        let datetime = now();

        let outcome = self
            .db
            .call(move |conn| {
                // The open turn check and the insert have to happen
                // together or two requests could both append
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM chat WHERE id = ?1)",
                    [&id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(AppendOutcome::Missing);
                }

                let open: Option<i64> = tx
                    .query_row(
                        "SELECT idx FROM turn WHERE chat_id = ?1 AND finalized = 0 ORDER BY idx DESC LIMIT 1",
                        [&id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(idx) = open {
                    return Ok(AppendOutcome::Open(idx as usize));
                }

                let next: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(idx) + 1, 0) FROM turn WHERE chat_id = ?1",
                    [&id],
                    |row| row.get(0),
                )?;
                insert_turn(&tx, &id, next, &turn, &datetime)?;
                tx.execute(
                    "UPDATE chat SET datetime = ?2 WHERE id = ?1",
                    params![id, datetime],
                )?;
                tx.commit()?;
                Ok(AppendOutcome::Appended(next as usize))
            })
            .await?;

        match outcome {
            AppendOutcome::Appended(idx) => Ok(idx),
            AppendOutcome::Missing => Err(StoreError::NotFound(chat_id.to_string())),
            AppendOutcome::Open(idx) => {
                tracing::warn!("Chat {} still has open turn {}", chat_id, idx);
                Err(StoreError::TurnInProgress(chat_id.to_string()))
            }
        }
    }

    async fn finalize_open_turn(
        &self,
        chat_id: &str,
        turn_index: usize,
        response: &str,
        annotation: Option<&str>,
    ) -> Result<bool, StoreError> {
        let id = chat_id.to_owned();
        let ai = annotate(response, annotation);
        let idx = turn_index as i64;
        let datetime = now();

        let updated = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                // Targeted update keyed by turn index. The `finalized`
                // guard makes repeated calls no-ops.
                let updated = tx.execute(
                    r#"
                    UPDATE turn SET ai = ?3, datetime = ?4, finalized = 1
                    WHERE chat_id = ?1 AND idx = ?2 AND finalized = 0
                    "#,
                    params![id, idx, ai, datetime],
                )?;
                if updated > 0 {
                    tx.execute(
                        "UPDATE chat SET datetime = ?2 WHERE id = ?1",
                        params![id, datetime],
                    )?;
                }
                tx.commit()?;
                Ok(updated > 0)
            })
            .await?;

        Ok(updated)
    }

    async fn open_turn(&self, chat_id: &str) -> Result<Option<usize>, StoreError> {
        let id = chat_id.to_owned();
        let open = self
            .db
            .call(move |conn| {
                let idx: Option<i64> = conn
                    .query_row(
                        "SELECT idx FROM turn WHERE chat_id = ?1 AND finalized = 0 ORDER BY idx DESC LIMIT 1",
                        [id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(idx)
            })
            .await?;
        Ok(open.map(|idx| idx as usize))
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let count = self
            .db
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT COUNT(*) FROM chat")?;
                let count: i64 = stmt.query_row([], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<ChatSummary>, StoreError> {
        let chats = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT c.id, c.name, c.datetime,
                           (SELECT COUNT(*) FROM turn t WHERE t.chat_id = c.id) AS turn_count
                    FROM chat c
                    ORDER BY c.datetime DESC, c.rowid DESC
                    LIMIT ?1 OFFSET ?2
                    "#,
                )?;
                let chats = stmt
                    .query_map(params![limit, offset], |row| {
                        let turn_count: i64 = row.get(3)?;
                        Ok(ChatSummary {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            datetime: row.get(2)?,
                            turn_count: turn_count as usize,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(chats)
            })
            .await?;
        Ok(chats)
    }

    async fn get(&self, chat_id: &str) -> Result<Chat, StoreError> {
        let id = chat_id.to_owned();
        let chat = self
            .db
            .call(move |conn| {
                let chat = conn
                    .query_row(
                        "SELECT id, name, created_at, datetime FROM chat WHERE id = ?1",
                        [&id],
                        |row| {
                            Ok(Chat {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                created_at: row.get(2)?,
                                datetime: row.get(3)?,
                                messages: Vec::new(),
                            })
                        },
                    )
                    .optional()?;
                let Some(mut chat) = chat else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare(
                    r#"
                    SELECT user, ai, datetime, image, document_name, document_text, finalized
                    FROM turn WHERE chat_id = ?1 ORDER BY idx ASC
                    "#,
                )?;
                chat.messages = stmt
                    .query_map([&id], |row| {
                        let document_name: Option<String> = row.get(4)?;
                        let document_text: Option<String> = row.get(5)?;
                        let document = document_name.map(|name| Document {
                            name,
                            text: document_text.unwrap_or_default(),
                        });
                        Ok(Turn {
                            user: row.get(0)?,
                            ai: row.get(1)?,
                            datetime: row.get(2)?,
                            image: row.get(3)?,
                            document,
                            finalized: row.get(6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(chat))
            })
            .await?;

        chat.ok_or_else(|| StoreError::NotFound(chat_id.to_string()))
    }

    async fn rename(&self, chat_id: &str, name: &str) -> Result<(), StoreError> {
        let id = chat_id.to_owned();
        let name = name.to_owned();
        let updated = self
            .db
            .call(move |conn| {
                let updated =
                    conn.execute("UPDATE chat SET name = ?2 WHERE id = ?1", params![id, name])?;
                Ok(updated)
            })
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(chat_id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, chat_id: &str) -> Result<(), StoreError> {
        let id = chat_id.to_owned();
        let deleted = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM turn WHERE chat_id = ?1", [&id])?;
                let deleted = tx.execute("DELETE FROM chat WHERE id = ?1", [&id])?;
                tx.commit()?;
                Ok(deleted)
            })
            .await?;

        if deleted == 0 {
            return Err(StoreError::NotFound(chat_id.to_string()));
        }
        Ok(())
    }
}
