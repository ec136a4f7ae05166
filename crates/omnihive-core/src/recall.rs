//! Knowledge-intent detection and semantic recall from checkpoint
//! history: prior plans and harvested lessons flow back into the
//! context as system notes.

use std::sync::Arc;

use anyhow::Result;
use omnihive_memory::{CheckpointStore, EmbeddingProvider};

/// Canonical knowledge-intent rule: leading interrogatives, documentation
/// keywords, or a file-extension mention. Imperative commands ("commit my
/// changes") stay out, so simple actions never pay the recall cost.
const INTERROGATIVES: &[&str] = &["how", "what", "why", "where", "which", "explain"];
const DOC_KEYWORDS: &[&str] = &[
    "doc",
    "docs",
    "documentation",
    "readme",
    "guide",
    "reference",
    "spec",
];
const EXTENSIONS: &[&str] = &[".md", ".py", ".rs", ".toml", ".yaml"];

pub fn is_knowledge_intent(query: &str) -> bool {
    let lowered = query.trim().to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    if let Some(first) = lowered.split_whitespace().next() {
        if INTERROGATIVES.contains(&first) {
            return true;
        }
    }
    let has_doc_keyword = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| DOC_KEYWORDS.contains(&token));
    if has_doc_keyword {
        return true;
    }
    EXTENSIONS.iter().any(|ext| lowered.contains(ext))
}

/// Semantic recall over checkpoint history: similar prior states and
/// harvested lessons.
pub struct Librarian {
    checkpoints: CheckpointStore,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Librarian {
    pub fn new(checkpoints: CheckpointStore, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            checkpoints,
            embedder,
        }
    }

    /// High-similarity snippets from prior checkpoints, best first.
    pub async fn recall(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let query_vec = match self.embedder.embed(query).await {
            Ok(vec) => vec,
            Err(e) => {
                tracing::debug!("recall skipped, embedding unavailable: {e}");
                return Ok(Vec::new());
            }
        };
        let hits = self
            .checkpoints
            .search_similar(&query_vec, None, limit, None)
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| {
                let mut snippet = hit.content;
                if snippet.len() > 400 {
                    snippet.truncate(400);
                    snippet.push_str("...");
                }
                snippet
            })
            .collect())
    }

    /// Lessons harvested in earlier sessions relevant to this task.
    pub async fn recall_lessons(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let query_vec = match self.embedder.embed(query).await {
            Ok(vec) => vec,
            Err(_) => return Ok(Vec::new()),
        };
        let hits = self
            .checkpoints
            .search_similar(
                &query_vec,
                None,
                limit,
                Some(("kind".into(), "lesson".into())),
            )
            .await?;
        Ok(hits.into_iter().map(|hit| hit.content).collect())
    }

    /// Record a tool correction: a previously failing tool that now
    /// succeeded, kept for later semantic recall.
    pub async fn harvest_lesson(
        &self,
        tool: &str,
        failed_attempt: &str,
        successful_attempt: &str,
    ) -> Result<()> {
        let content = serde_json::json!({
            "tool": tool,
            "failed_attempt": failed_attempt,
            "successful_attempt": successful_attempt,
        })
        .to_string();
        let embedding = self.embedder.embed(&content).await.ok();
        self.checkpoints
            .save(
                "lessons",
                &content,
                None,
                Some(serde_json::json!({"kind": "lesson", "tool": tool})),
                embedding,
            )
            .await?;
        tracing::info!(tool, "lesson harvested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnihive_memory::{HashEmbedding, VectorStore};

    #[test]
    fn interrogatives_are_knowledge_intent() {
        assert!(is_knowledge_intent("how does the checkpoint store work"));
        assert!(is_knowledge_intent("What is RRF"));
        assert!(is_knowledge_intent("explain the router pipeline"));
    }

    #[test]
    fn doc_keywords_are_knowledge_intent() {
        assert!(is_knowledge_intent("open the project readme"));
        assert!(is_knowledge_intent("check the api reference"));
    }

    #[test]
    fn extension_mentions_are_knowledge_intent() {
        assert!(is_knowledge_intent("summarize notes.md for me"));
    }

    #[test]
    fn imperative_commands_are_not() {
        assert!(!is_knowledge_intent("commit my changes"));
        assert!(!is_knowledge_intent("run the tests"));
        assert!(!is_knowledge_intent(""));
    }

    fn librarian() -> Librarian {
        Librarian::new(
            CheckpointStore::new(VectorStore::open_in_memory().unwrap()),
            Arc::new(HashEmbedding::new(8)),
        )
    }

    #[tokio::test]
    async fn harvest_then_recall_lessons() {
        let librarian = librarian();
        librarian
            .harvest_lesson(
                "git.commit",
                "git.commit with empty message failed",
                "git.commit with a message succeeded",
            )
            .await
            .unwrap();

        let lessons = librarian.recall_lessons("git.commit pitfalls", 5).await.unwrap();
        assert_eq!(lessons.len(), 1);
        assert!(lessons[0].contains("git.commit"));
    }

    #[tokio::test]
    async fn recall_on_empty_store_is_empty() {
        let librarian = librarian();
        assert!(librarian.recall("anything", 3).await.unwrap().is_empty());
    }
}
