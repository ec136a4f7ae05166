//! Live-wire indexer: scan bundles, embed routing text, persist to the
//! vector store, swap the registry snapshot, notify subscribers.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use omnihive_memory::{EmbeddingProvider, VectorRow, VectorStore};
use omnihive_schema::{EmbeddingError, RegistryUpdate, StoreError, ToolRecord};
use serde_json::json;

use crate::bundle::{load_bundle, scan_bundles, SkillBundle};
use crate::registry::SkillRegistry;

pub const SKILLS_TABLE: &str = "skills";

const EMBED_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct LiveWireIndexer {
    skills_dir: PathBuf,
    store: VectorStore,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<SkillRegistry>,
}

impl LiveWireIndexer {
    pub fn new(
        skills_dir: PathBuf,
        store: VectorStore,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<SkillRegistry>,
    ) -> Self {
        Self {
            skills_dir,
            store,
            embedder,
            registry,
        }
    }

    pub fn registry(&self) -> Arc<SkillRegistry> {
        Arc::clone(&self.registry)
    }

    /// Full pass over every bundle under `skills_dir`. Skills that
    /// disappeared since the last pass are removed from index and registry.
    pub async fn reindex_all(&self) -> Result<RegistryUpdate> {
        let bundles = scan_bundles(&self.skills_dir)?;
        let mut touched: Vec<String> =
            bundles.iter().map(|b| b.manifest.name.clone()).collect();
        for known in self.registry.skill_names() {
            if !touched.contains(&known) {
                touched.push(known);
            }
        }
        self.run_pass(touched, bundles).await
    }

    /// Incremental pass for the named bundles only; the rest of the tree
    /// is not rescanned.
    pub async fn reindex_bundles(&self, names: &[String]) -> Result<RegistryUpdate> {
        let mut bundles = Vec::new();
        for name in names {
            let dir = self.skills_dir.join(name);
            if dir.join("SKILL.md").exists() {
                match load_bundle(&dir) {
                    Ok(bundle) => bundles.push(bundle),
                    Err(e) => {
                        tracing::warn!("failed to reload skill {name}: {e}");
                    }
                }
            }
            // Missing directory means the skill was removed; it stays in
            // `touched` so the pass deletes its rows.
        }
        self.run_pass(names.to_vec(), bundles).await
    }

    /// Force a clean rebuild: drop the skills table first.
    pub async fn reindex_clear(&self) -> Result<RegistryUpdate> {
        self.store.drop_table(SKILLS_TABLE).await?;
        self.reindex_all().await
    }

    async fn run_pass(
        &self,
        touched: Vec<String>,
        bundles: Vec<SkillBundle>,
    ) -> Result<RegistryUpdate> {
        // Embed first: an embedding outage must not wipe the live index.
        let mut indexed = Vec::new();
        let mut dirty = Vec::new();
        for bundle in bundles {
            match self.embed_bundle(&bundle).await {
                Ok(rows) => indexed.push((bundle, rows)),
                Err(e) => {
                    tracing::warn!(
                        skill = %bundle.manifest.name,
                        "embedding failed after retry, bundle stays dirty: {e}"
                    );
                    self.registry.mark_dirty(&bundle.manifest.name);
                    dirty.push(bundle.manifest.name.clone());
                }
            }
        }

        // Persist. A dimension change (new embedding backend) drops and
        // rebuilds the table once; storage errors abort the pass and keep
        // the previous snapshot live.
        let all_rows: Vec<VectorRow> = indexed
            .iter()
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect();
        if !all_rows.is_empty() {
            if let Err(err) = self.store.upsert(SKILLS_TABLE, all_rows.clone()).await {
                match err.downcast_ref::<StoreError>() {
                    Some(StoreError::DimensionMismatch { expected, got }) => {
                        tracing::warn!(
                            "skills table dimension changed ({expected} -> {got}), rebuilding"
                        );
                        self.store.drop_table(SKILLS_TABLE).await?;
                        self.store.upsert(SKILLS_TABLE, all_rows).await?;
                    }
                    _ => return Err(err),
                }
            }
        }

        // Delete rows for commands that no longer exist.
        let surviving: HashSet<String> = indexed
            .iter()
            .flat_map(|(_, rows)| rows.iter().map(|r| r.id.clone()))
            .collect();
        let existing = self.store.list_ids(SKILLS_TABLE).await?;
        let stale: Vec<String> = existing
            .into_iter()
            .filter(|id| {
                let skill = id.split('.').next().unwrap_or(id);
                touched.iter().any(|t| t == skill)
                    && !dirty.iter().any(|d| d == skill)
                    && !surviving.contains(id)
            })
            .collect();
        if !stale.is_empty() {
            self.store.delete(SKILLS_TABLE, stale).await?;
        }

        // Swap the registry snapshot; this also notifies subscribers and
        // busts downstream caches. Dirty bundles keep their old snapshot.
        let swap: Vec<String> = touched
            .into_iter()
            .filter(|name| !dirty.iter().any(|d| d == name))
            .collect();
        let loaded: Vec<SkillBundle> = indexed.into_iter().map(|(bundle, _)| bundle).collect();
        let update = self.registry.apply_bundles(&swap, loaded);
        if !update.is_empty() {
            tracing::info!(
                added = update.added.len(),
                modified = update.modified.len(),
                removed = update.removed.len(),
                "skill index updated"
            );
        }
        Ok(update)
    }

    async fn embed_bundle(&self, bundle: &SkillBundle) -> Result<Vec<VectorRow>, EmbeddingError> {
        if bundle.commands.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = bundle
            .commands
            .iter()
            .map(ToolRecord::routing_text)
            .collect();

        let vectors = match self.embedder.embed_batch(&texts).await {
            Ok(vectors) => vectors,
            Err(EmbeddingError::Unavailable(first)) => {
                tracing::warn!("embedding unavailable, retrying once: {first}");
                tokio::time::sleep(EMBED_RETRY_BACKOFF).await;
                self.embedder.embed_batch(&texts).await?
            }
            Err(e) => return Err(e),
        };

        Ok(bundle
            .commands
            .iter()
            .zip(vectors)
            .map(|(record, vector)| VectorRow {
                id: record.tool_id(),
                vector,
                content: record.routing_text(),
                metadata: json!({
                    "skill": record.skill_name,
                    "command": record.command_name,
                    "input_schema": record.input_schema,
                    "routing_keywords": record.routing_keywords,
                    "category": record.category,
                    "weight": record.weight,
                    "file_path": record.file_path,
                    "mtime": bundle.mtime,
                }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnihive_memory::HashEmbedding;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_bundle(root: &Path, name: &str, commands: &[(&str, &str)]) {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("scripts")).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            format!(
                "---\nname: {name}\ndescription: {name} skill\nversion: 1.0.0\nrouting_keywords: [{name}]\n---\nbody"
            ),
        )
        .unwrap();
        let mut source = String::new();
        for (command, description) in commands {
            source.push_str(&format!(
                "@skill_command(name=\"{command}\", description=\"{description}\")\ndef {command}(arg: str):\n    pass\n\n"
            ));
        }
        std::fs::write(dir.join("scripts").join("mod.py"), source).unwrap();
    }

    fn indexer(root: &Path) -> LiveWireIndexer {
        LiveWireIndexer::new(
            root.to_path_buf(),
            VectorStore::open_in_memory().unwrap(),
            Arc::new(HashEmbedding::new(16)),
            Arc::new(SkillRegistry::new()),
        )
    }

    #[tokio::test]
    async fn reindex_all_populates_store_and_registry() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "git", &[("commit", "commit changes")]);
        write_bundle(root.path(), "demo", &[("echo", "echo a message")]);

        let indexer = indexer(root.path());
        let update = indexer.reindex_all().await.unwrap();
        assert_eq!(update.added.len(), 2);

        let registry = indexer.registry();
        assert!(registry.get_command("git", "commit").is_some());
        let ids = indexer.store.list_ids(SKILLS_TABLE).await.unwrap();
        assert_eq!(ids, vec!["demo.echo", "git.commit"]);
    }

    #[tokio::test]
    async fn reindex_bundles_only_touches_named_skills() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "git", &[("commit", "commit changes")]);
        write_bundle(root.path(), "demo", &[("echo", "echo a message")]);

        let indexer = indexer(root.path());
        indexer.reindex_all().await.unwrap();

        // Change git, then reindex only git.
        write_bundle(
            root.path(),
            "git",
            &[("commit", "commit changes"), ("push", "push commits")],
        );
        let update = indexer.reindex_bundles(&["git".into()]).await.unwrap();
        assert_eq!(update.added, vec!["git.push"]);
        assert_eq!(update.modified, vec!["git.commit"]);
        assert!(indexer.registry().get_command("demo", "echo").is_some());
    }

    #[tokio::test]
    async fn removed_skill_rows_are_deleted() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "git", &[("commit", "commit changes")]);
        let indexer = indexer(root.path());
        indexer.reindex_all().await.unwrap();

        std::fs::remove_dir_all(root.path().join("git")).unwrap();
        let update = indexer.reindex_bundles(&["git".into()]).await.unwrap();
        assert_eq!(update.removed, vec!["git.commit"]);
        assert!(indexer.store.list_ids(SKILLS_TABLE).await.unwrap().is_empty());
        assert!(indexer.registry().get_command("git", "commit").is_none());
    }

    struct FlakyEmbedding {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for FlakyEmbedding {
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(EmbeddingError::Unavailable("backend down".into()));
            }
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn backend_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn embedding_failure_retries_once_then_succeeds() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "git", &[("commit", "commit changes")]);

        let indexer = LiveWireIndexer::new(
            root.path().to_path_buf(),
            VectorStore::open_in_memory().unwrap(),
            Arc::new(FlakyEmbedding {
                calls: AtomicUsize::new(0),
                fail_first: 1,
            }),
            Arc::new(SkillRegistry::new()),
        );
        let update = indexer.reindex_all().await.unwrap();
        assert_eq!(update.added, vec!["git.commit"]);
    }

    #[tokio::test]
    async fn embedding_outage_leaves_previous_snapshot_live() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "git", &[("commit", "commit changes")]);

        let store = VectorStore::open_in_memory().unwrap();
        let registry = Arc::new(SkillRegistry::new());
        let good = LiveWireIndexer::new(
            root.path().to_path_buf(),
            store.clone(),
            Arc::new(HashEmbedding::new(2)),
            Arc::clone(&registry),
        );
        good.reindex_all().await.unwrap();

        // Both the first call and the retry fail.
        let broken = LiveWireIndexer::new(
            root.path().to_path_buf(),
            store,
            Arc::new(FlakyEmbedding {
                calls: AtomicUsize::new(0),
                fail_first: 99,
            }),
            Arc::clone(&registry),
        );
        let update = broken.reindex_all().await.unwrap();
        assert!(update.is_empty());
        assert!(registry.get_command("git", "commit").is_some());
        assert_eq!(
            registry.skill_state("git"),
            Some(omnihive_schema::SkillState::Dirty)
        );
    }

    #[tokio::test]
    async fn dimension_change_rebuilds_table() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "git", &[("commit", "commit changes")]);

        let store = VectorStore::open_in_memory().unwrap();
        let registry = Arc::new(SkillRegistry::new());
        let first = LiveWireIndexer::new(
            root.path().to_path_buf(),
            store.clone(),
            Arc::new(HashEmbedding::new(4)),
            Arc::clone(&registry),
        );
        first.reindex_all().await.unwrap();
        assert_eq!(store.table_dimension(SKILLS_TABLE).unwrap(), Some(4));

        let second = LiveWireIndexer::new(
            root.path().to_path_buf(),
            store.clone(),
            Arc::new(HashEmbedding::new(8)),
            registry,
        );
        second.reindex_all().await.unwrap();
        assert_eq!(store.table_dimension(SKILLS_TABLE).unwrap(), Some(8));
    }
}
