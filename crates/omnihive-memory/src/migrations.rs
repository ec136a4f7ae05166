use anyhow::Result;
use rusqlite::Connection;

/// Bootstrap the schema. Idempotent; runs at every open.
///
/// The vec0 virtual tables are created lazily per logical table once the
/// embedding dimension is known (see `VectorStore::ensure_vec_table`).
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS records (
            tbl TEXT NOT NULL,
            id TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (tbl, id)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS records_fts USING fts5(
            content, tbl UNINDEXED, id UNINDEXED
        );

        CREATE TABLE IF NOT EXISTS embedding_cache (
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding TEXT NOT NULL,
            dims INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (provider, model, hash)
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            checkpoint_id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL,
            parent_checkpoint_id TEXT,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            timestamp REAL NOT NULL,
            has_embedding INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
            ON checkpoints(thread_id, timestamp DESC);
        "#,
    )?;
    Ok(())
}
