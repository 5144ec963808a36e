//! Database connection and schema management
use anyhow::{Error, Result};
use rusqlite::Connection as SyncConnection;
use tokio_rusqlite::Connection;

/// Open an async connection to the sqlite database at `path`.
///
/// Foreign keys are enforced per connection so deleting a chat
/// cascades to its turns.
pub async fn async_db(path: &str) -> Result<Connection, Error> {
    let db = Connection::open(path).await?;
    db.call(|conn| {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Ok(())
    })
    .await?;
    Ok(db)
}

/// Same as `async_db` but backed by memory, handy for tests.
pub async fn async_db_in_memory() -> Result<Connection, Error> {
    let db = Connection::open_in_memory().await?;
    db.call(|conn| {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        initialize_db(conn)?;
        Ok(())
    })
    .await?;
    Ok(db)
}

/// Create the schema if it doesn't exist yet. Safe to run on every
/// startup.
pub fn initialize_db(conn: &SyncConnection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        BEGIN;

        CREATE TABLE IF NOT EXISTS chat (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            datetime TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS chat_datetime_idx ON chat (datetime);

        CREATE TABLE IF NOT EXISTS turn (
            chat_id TEXT NOT NULL REFERENCES chat(id) ON DELETE CASCADE,
            idx INTEGER NOT NULL,
            user TEXT NOT NULL,
            ai TEXT NOT NULL DEFAULT '',
            image TEXT,
            document_name TEXT,
            document_text TEXT,
            datetime TEXT NOT NULL,
            finalized INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (chat_id, idx)
        );

        COMMIT;
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_db_is_idempotent() {
        let conn = SyncConnection::open_in_memory().unwrap();
        initialize_db(&conn).unwrap();
        initialize_db(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('chat', 'turn')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[tokio::test]
    async fn test_async_db_in_memory_has_schema() {
        let db = async_db_in_memory().await.unwrap();
        let count: i64 = db
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM chat", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
