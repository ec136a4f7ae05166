use std::sync::Arc;

use anyhow::{anyhow, Result};
use omnihive_schema::CheckpointError;
use rusqlite::{params, OptionalExtension};
use tokio::task;
use uuid::Uuid;

use crate::store::{VectorRow, VectorStore};

const CHECKPOINT_TABLE: &str = "checkpoints";

/// One persisted workflow-state snapshot with parent linkage.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub thread_id: String,
    pub parent_checkpoint_id: Option<String>,
    /// Canonical-JSON serialization of the workflow state.
    pub content: String,
    pub metadata: serde_json::Value,
    pub timestamp: f64,
}

/// Semantic-search hit over checkpoint history.
#[derive(Debug, Clone)]
pub struct SimilarCheckpoint {
    pub content: String,
    pub metadata: serde_json::Value,
    pub distance: f64,
}

/// Append-only, thread-scoped, vector-searchable checkpoint history.
///
/// Rows live in the `checkpoints` SQL table; snapshots that carry an
/// embedding are additionally indexed in the vector store's
/// `"checkpoints"` logical table, so `search_similar` only ever sees
/// checkpoints with non-null embeddings.
#[derive(Clone)]
pub struct CheckpointStore {
    store: VectorStore,
}

impl CheckpointStore {
    pub fn new(store: VectorStore) -> Self {
        Self { store }
    }

    /// Save a checkpoint. `parent_checkpoint_id`, when given, must name an
    /// existing checkpoint in the same thread; anything else is a
    /// `CheckpointConflict` and the workflow that caused it must abort.
    pub async fn save(
        &self,
        thread_id: &str,
        content: &str,
        parent_checkpoint_id: Option<&str>,
        metadata: Option<serde_json::Value>,
        embedding: Option<Vec<f32>>,
    ) -> Result<String> {
        let checkpoint_id = Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));

        let db = self.store.db();
        let thread = thread_id.to_owned();
        let parent = parent_checkpoint_id.map(str::to_owned);
        let content_owned = content.to_owned();
        let metadata_json = serde_json::to_string(&metadata)?;
        let id = checkpoint_id.clone();

        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            if let Some(parent_id) = &parent {
                let parent_ts: Option<f64> = conn
                    .query_row(
                        "SELECT timestamp FROM checkpoints
                         WHERE checkpoint_id = ?1 AND thread_id = ?2",
                        params![parent_id, thread],
                        |r| r.get(0),
                    )
                    .optional()?;
                let parent_ts = parent_ts.ok_or_else(|| CheckpointError::Conflict {
                    thread_id: thread.clone(),
                    parent_id: parent_id.clone(),
                })?;
                if parent_ts > timestamp {
                    // Non-monotonic chain means corrupted state; fatal.
                    return Err(CheckpointError::Storage(format!(
                        "parent checkpoint {parent_id} is newer than child ({parent_ts} > {timestamp})"
                    ))
                    .into());
                }
            }

            conn.execute(
                r#"
                INSERT INTO checkpoints
                    (checkpoint_id, thread_id, parent_checkpoint_id, content, metadata, timestamp, has_embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    id,
                    thread,
                    parent,
                    content_owned,
                    metadata_json,
                    timestamp,
                    0
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        if let Some(vector) = embedding {
            let mut meta = metadata.clone();
            if let Some(map) = meta.as_object_mut() {
                map.insert(
                    "thread_id".into(),
                    serde_json::Value::String(thread_id.to_owned()),
                );
            }
            self.store
                .upsert(
                    CHECKPOINT_TABLE,
                    vec![VectorRow {
                        id: checkpoint_id.clone(),
                        vector,
                        content: content.to_owned(),
                        metadata: meta,
                    }],
                )
                .await?;
            self.mark_embedded(&checkpoint_id).await?;
        }

        tracing::debug!(thread_id, checkpoint_id = %checkpoint_id, "checkpoint saved");
        Ok(checkpoint_id)
    }

    async fn mark_embedded(&self, checkpoint_id: &str) -> Result<()> {
        let db = self.store.db();
        let id = checkpoint_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "UPDATE checkpoints SET has_embedding = 1 WHERE checkpoint_id = ?1",
                params![id],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    pub async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointRecord>> {
        let mut history = self.history(thread_id, 1).await?;
        Ok(history.pop())
    }

    pub async fn get_by_id(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        let db = self.store.db();
        let id = checkpoint_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let record = conn
                .query_row(
                    "SELECT checkpoint_id, thread_id, parent_checkpoint_id, content, metadata, timestamp
                     FROM checkpoints WHERE checkpoint_id = ?1",
                    params![id],
                    row_to_record,
                )
                .optional()?;
            Ok::<Option<CheckpointRecord>, anyhow::Error>(record)
        })
        .await?
    }

    /// Newest-first history for a thread.
    pub async fn history(&self, thread_id: &str, limit: usize) -> Result<Vec<CheckpointRecord>> {
        let db = self.store.db();
        let thread = thread_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT checkpoint_id, thread_id, parent_checkpoint_id, content, metadata, timestamp
                 FROM checkpoints WHERE thread_id = ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![thread, limit as i64], row_to_record)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok::<Vec<CheckpointRecord>, anyhow::Error>(records)
        })
        .await?
    }

    /// Semantic recall over embedded checkpoints, optionally scoped to one
    /// thread and/or a metadata field equality.
    pub async fn search_similar(
        &self,
        query_vec: &[f32],
        thread_id: Option<&str>,
        limit: usize,
        filter: Option<(String, String)>,
    ) -> Result<Vec<SimilarCheckpoint>> {
        let scope = thread_id.map(|t| ("thread_id".to_string(), t.to_string()));
        // Only one metadata filter reaches the store; apply the second here.
        let hits = self
            .store
            .search_vector(CHECKPOINT_TABLE, query_vec, limit * 2, scope)
            .await?;
        let mut out = Vec::new();
        for hit in hits {
            if let Some((key, value)) = &filter {
                let matches = hit
                    .metadata
                    .get(key)
                    .map(|v| match v {
                        serde_json::Value::String(s) => s == value,
                        other => other.to_string() == *value,
                    })
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            out.push(SimilarCheckpoint {
                content: hit.content,
                metadata: hit.metadata,
                distance: hit.distance,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Delete every checkpoint for a thread. Atomic; returns the count.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<usize> {
        let db = self.store.db();
        let thread = thread_id.to_owned();
        let ids: Vec<String> = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt =
                conn.prepare("SELECT checkpoint_id FROM checkpoints WHERE thread_id = ?1")?;
            let rows = stmt.query_map(params![thread], |r| r.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM checkpoints WHERE thread_id = ?1",
                params![thread],
            )?;
            tx.commit()?;
            Ok::<Vec<String>, anyhow::Error>(ids)
        })
        .await??;

        let count = ids.len();
        if !ids.is_empty() {
            self.store.delete(CHECKPOINT_TABLE, ids).await?;
        }
        tracing::info!(thread_id, count, "checkpoints deleted");
        Ok(count)
    }

    pub async fn count(&self, thread_id: &str) -> Result<usize> {
        let db = self.store.db();
        let thread = thread_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE thread_id = ?1",
                params![thread],
                |r| r.get(0),
            )?;
            Ok::<usize, anyhow::Error>(count as usize)
        })
        .await?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    let metadata_raw: String = row.get(4)?;
    Ok(CheckpointRecord {
        checkpoint_id: row.get(0)?,
        thread_id: row.get(1)?,
        parent_checkpoint_id: row.get(2)?,
        content: row.get(3)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        timestamp: row.get(5)?,
    })
}
