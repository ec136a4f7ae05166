//! End-to-end routing scenarios against a seeded skills index.

use std::sync::Arc;

use async_trait::async_trait;
use omnihive_memory::{EmbeddingProvider, VectorRow, VectorStore};
use omnihive_router::{QueryTranslator, RouteOptions, SkillRouter};
use omnihive_schema::config::RouterConfig;
use omnihive_schema::{Confidence, EmbeddingError};
use serde_json::json;
use sha2::{Digest, Sha256};

const DIMS: usize = 32;

/// Deterministic bag-of-tokens embedding: each token hashes to a unit
/// vector, a text embeds as the normalized token sum. Similarity then
/// tracks token overlap, which is what routing cares about.
#[derive(Clone)]
struct TokenEmbedding;

impl TokenEmbedding {
    fn token_vector(token: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        (0..DIMS)
            .map(|i| {
                let b = digest[i % digest.len()];
                ((b as f32 / 255.0) * 2.0 - 1.0) + (i as f32 * 1e-3)
            })
            .collect()
    }

    fn embed_text(text: &str) -> Vec<f32> {
        let mut sum = vec![0.0f32; DIMS];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            for (i, v) in Self::token_vector(token).iter().enumerate() {
                sum[i] += v;
            }
        }
        let norm = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut sum {
                *v /= norm;
            }
        }
        sum
    }
}

#[async_trait]
impl EmbeddingProvider for TokenEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| Self::embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        DIMS
    }

    fn backend_name(&self) -> &str {
        "token-bag"
    }
}

async fn seed_store() -> VectorStore {
    let store = VectorStore::open_in_memory().unwrap();
    let embedder = TokenEmbedding;

    let rows = vec![
        (
            "git.commit",
            "commit changes git vcs save work",
            json!({"skill": "git", "command": "commit", "routing_keywords": ["git", "vcs"], "category": null, "weight": 1.0}),
        ),
        (
            "git.status",
            "show working tree status git vcs",
            json!({"skill": "git", "command": "status", "routing_keywords": ["git", "vcs"], "category": null, "weight": 1.0}),
        ),
        (
            "advanced_tools.smart_find",
            "find files by glob pattern list directory folder path extension",
            json!({"skill": "advanced_tools", "command": "smart_find", "routing_keywords": ["find", "files", "glob"], "category": "file_discovery", "weight": 1.0}),
        ),
        (
            "researcher.harvest",
            "research analyze repo harvest a repository into a report",
            json!({"skill": "researcher", "command": "harvest", "routing_keywords": ["research", "analyze", "repo"], "category": null, "weight": 1.0}),
        ),
        // Skill-level meta row; must never route.
        (
            "git.git",
            "git skill bundle",
            json!({"skill": "git", "command": "git", "routing_keywords": [], "category": null, "weight": 1.0}),
        ),
    ];

    let mut vector_rows = Vec::new();
    for (id, content, metadata) in rows {
        let vector = embedder.embed(content).await.unwrap();
        vector_rows.push(VectorRow {
            id: id.to_string(),
            vector,
            content: content.to_string(),
            metadata,
        });
    }
    store.upsert("skills", vector_rows).await.unwrap();
    store
}

fn router(store: VectorStore) -> SkillRouter {
    SkillRouter::new(
        store,
        Arc::new(TokenEmbedding),
        QueryTranslator::disabled(),
        RouterConfig::default(),
    )
}

#[tokio::test]
async fn exact_command_shortcut_is_high_confidence() {
    let router = router(seed_store().await);

    let hits = router.route("git.commit").await.unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].skill_name, "git");
    assert_eq!(hits[0].command_name, "commit");
    assert_eq!(hits[0].confidence, Confidence::High);
    assert!((hits[0].final_score - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn natural_language_git_commit_ranks_same_command() {
    let router = router(seed_store().await);

    let hits = router.route("git commit").await.unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].skill_name, "git");
    assert_eq!(hits[0].command_name, "commit");
    assert!(matches!(
        hits[0].confidence,
        Confidence::High | Confidence::Medium
    ));
}

#[tokio::test]
async fn file_discovery_intent_routes_to_smart_find() {
    let router = router(seed_store().await);

    let hits = router
        .route("find *.py files in current directory")
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].skill_name, "advanced_tools");
    assert_eq!(hits[0].command_name, "smart_find");
}

#[tokio::test]
async fn research_url_query_routes_to_researcher() {
    let router = router(seed_store().await);

    // With translation disabled the router sees the already-English
    // fallback phrase the translator synthesizes for non-English input.
    let hits = router
        .route("research https://example.com/repo")
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].skill_name, "researcher");
}

#[tokio::test]
async fn empty_query_returns_empty_not_error() {
    let router = router(seed_store().await);
    assert!(router.route("").await.unwrap().is_empty());
    assert!(router.route("   ").await.unwrap().is_empty());
}

#[tokio::test]
async fn single_character_query_proceeds_as_hybrid() {
    let router = router(seed_store().await);
    // Must not error; ranking content is irrelevant.
    let _ = router.route("a").await.unwrap();
}

#[tokio::test]
async fn skill_level_rows_are_dropped() {
    let router = router(seed_store().await);
    let hits = router.route("git").await.unwrap();
    assert!(hits
        .iter()
        .all(|hit| !(hit.skill_name == "git" && hit.command_name == "git")));
}

#[tokio::test]
async fn duplicate_identity_keeps_max_score() {
    let router = router(seed_store().await);
    let hits = router.route("git commit vcs").await.unwrap();
    let commit_hits = hits
        .iter()
        .filter(|h| h.skill_name == "git" && h.command_name == "commit")
        .count();
    assert!(commit_hits <= 1);
}

#[tokio::test]
async fn routing_is_deterministic_on_frozen_index() {
    let store = seed_store().await;
    let router = router(store);

    let first: Vec<(String, String)> = router
        .route("find *.py files")
        .await
        .unwrap()
        .into_iter()
        .map(|h| (h.skill_name, h.command_name))
        .collect();
    router.invalidate_cache();
    let second: Vec<(String, String)> = router
        .route("find *.py files")
        .await
        .unwrap()
        .into_iter()
        .map(|h| (h.skill_name, h.command_name))
        .collect();
    assert_eq!(first, second);
}

#[tokio::test]
async fn unknown_table_yields_empty_results() {
    let store = VectorStore::open_in_memory().unwrap();
    let router = router(store);
    let hits = router.route("anything at all").await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn route_with_threshold_and_limit() {
    let router = router(seed_store().await);
    let hits = router
        .route_with(
            "git commit",
            RouteOptions {
                threshold: Some(0.9),
                limit: Some(1),
                profile: None,
            },
        )
        .await
        .unwrap();
    assert!(hits.len() <= 1);
}

#[tokio::test]
async fn cached_route_skips_recomputation() {
    let router = router(seed_store().await);
    let first = router.route("git commit").await.unwrap();
    let second = router.route("git commit").await.unwrap();
    assert_eq!(first.len(), second.len());
    if let (Some(a), Some(b)) = (first.first(), second.first()) {
        assert_eq!(a.final_score, b.final_score);
    }
}
