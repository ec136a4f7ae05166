use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use omnihive_schema::StoreError;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A row to persist: id, embedding, searchable content, JSON metadata.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub id: String,
    pub vector: Vec<f32>,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Vector-only search hit, ordered ascending by distance.
#[derive(Debug, Clone)]
pub struct SearchRow {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub distance: f64,
}

/// Hybrid search hit with the fused score used for ranking.
#[derive(Debug, Clone)]
pub struct HybridRow {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub vector_score: f64,
    pub keyword_score: f64,
    pub final_score: f64,
}

/// Reciprocal Rank Fusion parameters: `final = Σ w_s / (k + rank_s)`,
/// normalized so a hit ranked first in every searched branch scores 1.0.
#[derive(Debug, Clone)]
pub struct RrfParams {
    pub k: f64,
    pub vector_weight: f64,
    pub keyword_weight: f64,
}

impl Default for RrfParams {
    fn default() -> Self {
        Self {
            k: 60.0,
            vector_weight: 1.0,
            keyword_weight: 1.5,
        }
    }
}

/// Initialize sqlite-vec extension. Must be called before Connection::open().
fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

/// Logical table names become part of a SQL identifier; restrict them.
fn validate_table_name(table: &str) -> Result<(), StoreError> {
    if table.is_empty()
        || !table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(StoreError::InvalidInput(format!(
            "invalid table name: {table:?}"
        )));
    }
    Ok(())
}

fn vec_table_name(table: &str) -> String {
    format!("vec_{table}")
}

fn embedding_to_json(embedding: &[f32]) -> String {
    serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_owned())
}

/// Persistent ANN + keyword index over `(id, vector, content, metadata)`
/// rows in named logical tables, on one SQLite file with sqlite-vec and
/// FTS5. Writes are serialized by the connection mutex; every blocking
/// call runs on the blocking pool.
#[derive(Clone)]
pub struct VectorStore {
    db: Arc<Mutex<Connection>>,
}

impl VectorStore {
    pub fn open(path: &Path) -> Result<Self> {
        init_sqlite_vec();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        crate::migrations::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        crate::migrations::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Shared connection handle for sibling stores (checkpoints, embedding
    /// cache) living in the same file.
    pub fn db(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    /// Dimension recorded for a logical table, if it exists.
    pub fn table_dimension(&self, table: &str) -> Result<Option<usize>> {
        let conn = self
            .db
            .lock()
            .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![format!("vec_dimensions:{table}")],
                |r| r.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    /// Insert-or-replace rows by id. The table's dimension is fixed by the
    /// first upsert; later rows of a different length fail with
    /// `DimensionMismatch` and nothing is written.
    pub async fn upsert(&self, table: &str, rows: Vec<VectorRow>) -> Result<()> {
        validate_table_name(table)?;
        if rows.is_empty() {
            return Ok(());
        }
        let dims = rows[0].vector.len();
        if dims == 0 {
            return Err(StoreError::InvalidInput("empty vector in upsert".into()).into());
        }
        if let Some(row) = rows.iter().find(|r| r.vector.len() != dims) {
            return Err(StoreError::DimensionMismatch {
                expected: dims,
                got: row.vector.len(),
            }
            .into());
        }
        if let Some(existing) = self.table_dimension(table)? {
            if existing != dims {
                return Err(StoreError::DimensionMismatch {
                    expected: existing,
                    got: dims,
                }
                .into());
            }
        }

        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let vec_table = vec_table_name(&table);

            let has_vec_table: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    params![vec_table],
                    |r| r.get(0),
                )
                .unwrap_or(false);
            if !has_vec_table {
                conn.execute_batch(&format!(
                    "CREATE VIRTUAL TABLE {vec_table} USING vec0(id TEXT PRIMARY KEY, embedding float[{dims}]);"
                ))?;
                conn.execute(
                    "INSERT INTO meta(key, value) VALUES(?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![format!("vec_dimensions:{table}"), dims.to_string()],
                )?;
                tracing::info!("created {vec_table} with {dims} dimensions");
            }

            let now = chrono::Utc::now().timestamp();
            let tx = conn.unchecked_transaction()?;
            for row in &rows {
                let metadata = serde_json::to_string(&row.metadata)?;
                tx.execute(
                    r#"
                    INSERT INTO records(tbl, id, content, metadata, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(tbl, id) DO UPDATE SET
                        content = excluded.content,
                        metadata = excluded.metadata,
                        updated_at = excluded.updated_at
                    "#,
                    params![table, row.id, row.content, metadata, now],
                )?;
                tx.execute(
                    "DELETE FROM records_fts WHERE tbl = ?1 AND id = ?2",
                    params![table, row.id],
                )?;
                tx.execute(
                    "INSERT INTO records_fts(content, tbl, id) VALUES (?1, ?2, ?3)",
                    params![row.content, table, row.id],
                )?;
                tx.execute(
                    &format!("INSERT OR REPLACE INTO {vec_table}(id, embedding) VALUES (?1, ?2)"),
                    params![row.id, embedding_to_json(&row.vector)],
                )?;
            }
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    /// Delete by id list. A logical row is removed from the record, FTS
    /// and vec tables inside one transaction, never partially.
    pub async fn delete(&self, table: &str, ids: Vec<String>) -> Result<usize> {
        validate_table_name(table)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let vec_table = vec_table_name(&table);
            let has_vec = vec_table_exists(&conn, &vec_table)?;
            let tx = conn.unchecked_transaction()?;
            let mut removed = 0;
            for id in &ids {
                removed += tx.execute(
                    "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                    params![table, id],
                )?;
                tx.execute(
                    "DELETE FROM records_fts WHERE tbl = ?1 AND id = ?2",
                    params![table, id],
                )?;
                if has_vec {
                    tx.execute(
                        &format!("DELETE FROM {vec_table} WHERE id = ?1"),
                        params![id],
                    )?;
                }
            }
            tx.commit()?;
            Ok::<usize, anyhow::Error>(removed)
        })
        .await?
    }

    /// Delete every row whose metadata field equals the given value.
    pub async fn delete_where(&self, table: &str, meta_key: &str, value: &str) -> Result<usize> {
        validate_table_name(table)?;
        let ids = self.ids_where(table, meta_key, value).await?;
        self.delete(table, ids).await
    }

    async fn ids_where(&self, table: &str, meta_key: &str, value: &str) -> Result<Vec<String>> {
        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        let path = format!("$.{meta_key}");
        let value = value.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id FROM records WHERE tbl = ?1 AND json_extract(metadata, ?2) = ?3",
            )?;
            let rows = stmt.query_map(params![table, path, value], |r| r.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok::<Vec<String>, anyhow::Error>(ids)
        })
        .await?
    }

    /// Fetch one row by id (no vector involved; distance is 0).
    pub async fn get(&self, table: &str, id: &str) -> Result<Option<SearchRow>> {
        validate_table_name(table)?;
        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let row = conn
                .query_row(
                    "SELECT id, content, metadata FROM records WHERE tbl = ?1 AND id = ?2",
                    params![table, id],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok::<Option<SearchRow>, anyhow::Error>(row.map(|(id, content, metadata_raw)| {
                SearchRow {
                    id,
                    content,
                    metadata: serde_json::from_str(&metadata_raw)
                        .unwrap_or(serde_json::Value::Null),
                    distance: 0.0,
                }
            }))
        })
        .await?
    }

    /// List ids currently stored in a logical table.
    pub async fn list_ids(&self, table: &str) -> Result<Vec<String>> {
        validate_table_name(table)?;
        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare("SELECT id FROM records WHERE tbl = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![table], |r| r.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok::<Vec<String>, anyhow::Error>(ids)
        })
        .await?
    }

    /// Drop a logical table: records, FTS rows, vec table and the
    /// recorded dimension.
    pub async fn drop_table(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let vec_table = vec_table_name(&table);
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM records WHERE tbl = ?1", params![table])?;
            tx.execute("DELETE FROM records_fts WHERE tbl = ?1", params![table])?;
            tx.execute(
                "DELETE FROM meta WHERE key = ?1",
                params![format!("vec_dimensions:{table}")],
            )?;
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {vec_table};"))?;
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    /// Nearest-neighbour search, ascending by distance. Unknown tables
    /// return an empty list; an empty query vector is `InvalidInput`.
    pub async fn search_vector(
        &self,
        table: &str,
        query_vec: &[f32],
        limit: usize,
        filter: Option<(String, String)>,
    ) -> Result<Vec<SearchRow>> {
        validate_table_name(table)?;
        if query_vec.is_empty() {
            return Err(StoreError::InvalidInput("empty query vector".into()).into());
        }
        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        let query_json = embedding_to_json(query_vec);
        // Over-fetch when a metadata filter will discard candidates.
        let fetch = if filter.is_some() {
            limit.saturating_mul(4)
        } else {
            limit
        }
        .max(1);

        let search = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let vec_table = vec_table_name(&table);
            if !vec_table_exists(&conn, &vec_table)? {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT v.id, r.content, r.metadata, v.distance
                FROM {vec_table} v
                JOIN records r ON r.id = v.id AND r.tbl = ?2
                WHERE v.embedding MATCH ?1 AND k = ?3
                "#,
            ))?;
            let rows = stmt.query_map(params![query_json, table, fetch as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, f64>(3)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, content, metadata_raw, distance) = row?;
                let metadata = serde_json::from_str(&metadata_raw)
                    .unwrap_or(serde_json::Value::Null);
                if let Some((key, value)) = &filter {
                    let matches = metadata
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
                out.push(SearchRow {
                    id,
                    content,
                    metadata,
                    distance,
                });
            }
            out.sort_by(|a, b| a.distance.total_cmp(&b.distance));
            out.truncate(limit);
            Ok::<Vec<SearchRow>, anyhow::Error>(out)
        });

        match tokio::time::timeout(SEARCH_TIMEOUT, search).await {
            Ok(joined) => joined?,
            Err(_) => {
                tracing::warn!("vector search timed out after {SEARCH_TIMEOUT:?}");
                Ok(Vec::new())
            }
        }
    }

    /// Keyword-only (FTS5/bm25) search, best rank first.
    pub async fn search_keyword(
        &self,
        table: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<SearchRow>> {
        validate_table_name(table)?;
        let Some(match_expr) = fts_match_expr(keywords) else {
            return Ok(Vec::new());
        };
        let db = Arc::clone(&self.db);
        let table = table.to_owned();
        let result = task::spawn_blocking(move || {
            keyword_candidates(&db, &table, &match_expr, limit)
        })
        .await?;
        match result {
            Ok(rows) => Ok(rows
                .into_iter()
                .map(|(id, content, metadata, rank)| SearchRow {
                    id,
                    content,
                    metadata,
                    distance: rank,
                })
                .collect()),
            Err(e) => {
                tracing::debug!("keyword search failed (treating as empty): {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Hybrid search fusing vector similarity and keyword rank with RRF.
    /// An empty keyword list degrades to vector-only ranking.
    pub async fn search_hybrid(
        &self,
        table: &str,
        query_vec: &[f32],
        keywords: &[String],
        limit: usize,
        params_rrf: &RrfParams,
    ) -> Result<Vec<HybridRow>> {
        validate_table_name(table)?;
        if query_vec.is_empty() {
            return Err(StoreError::InvalidInput("empty query vector".into()).into());
        }

        let candidate_limit = limit.saturating_mul(4).max(1);
        let vector_hits = self
            .search_vector(table, query_vec, candidate_limit, None)
            .await?;
        let keyword_hits = if keywords.is_empty() {
            Vec::new()
        } else {
            self.search_keyword(table, keywords, candidate_limit).await?
        };

        Ok(fuse_rrf(
            vector_hits,
            keyword_hits,
            keywords.is_empty(),
            limit,
            params_rrf,
        ))
    }
}

fn vec_table_exists(conn: &Connection, vec_table: &str) -> Result<bool> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            params![vec_table],
            |r| r.get(0),
        )
        .unwrap_or(false);
    Ok(exists)
}

/// Build an FTS5 MATCH expression from keywords: each token quoted,
/// OR-joined. Returns None when nothing usable remains.
fn fts_match_expr(keywords: &[String]) -> Option<String> {
    let tokens: Vec<String> = keywords
        .iter()
        .map(|k| k.replace('"', " "))
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .map(|k| format!("\"{k}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

type KeywordCandidate = (String, String, serde_json::Value, f64);

fn keyword_candidates(
    db: &Arc<Mutex<Connection>>,
    table: &str,
    match_expr: &str,
    limit: usize,
) -> Result<Vec<KeywordCandidate>> {
    let conn = db
        .lock()
        .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
    let mut stmt = conn.prepare(
        r#"
        SELECT f.id, r.content, r.metadata, bm25(records_fts) AS rank
        FROM records_fts f
        JOIN records r ON r.id = f.id AND r.tbl = ?1
        WHERE records_fts MATCH ?2 AND f.tbl = ?1
        ORDER BY rank
        LIMIT ?3
        "#,
    )?;
    let rows = stmt.query_map(params![table, match_expr, limit as i64], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, f64>(3)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, content, metadata_raw, rank) = row?;
        let metadata = serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null);
        out.push((id, content, metadata, rank));
    }
    Ok(out)
}

/// Reciprocal Rank Fusion over the two candidate lists. Scores are
/// normalized so a hit ranked first in every searched branch gets 1.0;
/// that keeps confidence-profile thresholds meaningful.
fn fuse_rrf(
    vector_hits: Vec<SearchRow>,
    keyword_hits: Vec<SearchRow>,
    vector_only: bool,
    limit: usize,
    params: &RrfParams,
) -> Vec<HybridRow> {
    use std::collections::HashMap;

    struct Fused {
        content: String,
        metadata: serde_json::Value,
        vector_score: f64,
        keyword_score: f64,
        rrf: f64,
    }

    let mut merged: HashMap<String, Fused> = HashMap::new();

    for (rank, hit) in vector_hits.into_iter().enumerate() {
        let contribution = params.vector_weight / (params.k + (rank + 1) as f64);
        let vector_score = (1.0 - hit.distance).max(0.0);
        merged.insert(
            hit.id,
            Fused {
                content: hit.content,
                metadata: hit.metadata,
                vector_score,
                keyword_score: 0.0,
                rrf: contribution,
            },
        );
    }

    let keyword_count = keyword_hits.len();
    for (rank, hit) in keyword_hits.into_iter().enumerate() {
        let contribution = params.keyword_weight / (params.k + (rank + 1) as f64);
        // bm25 rank is negative-better; map to a (0, 1] display score.
        let keyword_score = 1.0 - (rank as f64 / keyword_count.max(1) as f64);
        match merged.get_mut(&hit.id) {
            Some(entry) => {
                entry.rrf += contribution;
                entry.keyword_score = keyword_score;
            }
            None => {
                merged.insert(
                    hit.id,
                    Fused {
                        content: hit.content,
                        metadata: hit.metadata,
                        vector_score: 0.0,
                        keyword_score,
                        rrf: contribution,
                    },
                );
            }
        }
    }

    let searched_weight = if vector_only {
        params.vector_weight
    } else {
        params.vector_weight + params.keyword_weight
    };
    let norm = searched_weight / (params.k + 1.0);

    let mut out: Vec<HybridRow> = merged
        .into_iter()
        .map(|(id, fused)| HybridRow {
            id,
            content: fused.content,
            metadata: fused.metadata,
            vector_score: fused.vector_score,
            keyword_score: fused.keyword_score,
            final_score: if norm > 0.0 { fused.rrf / norm } else { 0.0 },
        })
        .collect();
    out.sort_by(|a, b| b.final_score.total_cmp(&a.final_score).then(a.id.cmp(&b.id)));
    out.truncate(limit);
    out
}
