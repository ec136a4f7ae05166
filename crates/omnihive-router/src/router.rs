//! Hybrid router: translated, classified queries ranked over the skills
//! index with RRF fusion, confidence profiles and adaptive retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use omnihive_memory::{EmbeddingProvider, HybridRow, RrfParams, VectorStore};
use omnihive_schema::config::{ConfidenceProfile, RouterConfig};
use omnihive_schema::{parse_tool_id, Confidence, RouteHit};
use omnihive_provider::ChatProvider;

use crate::intent::{classify, classify_with_llm, CategoryFilter, IntentResult, SearchIntent};
use crate::translate::QueryTranslator;

const SKILLS_TABLE: &str = "skills";

#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub threshold: Option<f64>,
    pub limit: Option<usize>,
    pub profile: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    translated: String,
    intent: &'static str,
    category: Option<&'static str>,
    threshold_milli: i64,
    limit: usize,
    profile: String,
}

struct CacheEntry {
    hits: Vec<RouteHit>,
    stored_at: Instant,
}

pub struct SkillRouter {
    store: VectorStore,
    embedder: Arc<dyn EmbeddingProvider>,
    translator: QueryTranslator,
    intent_llm: Option<(Arc<dyn ChatProvider>, String)>,
    config: RouterConfig,
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl SkillRouter {
    pub fn new(
        store: VectorStore,
        embedder: Arc<dyn EmbeddingProvider>,
        translator: QueryTranslator,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            translator,
            intent_llm: None,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Enable the LLM intent classifier; the rule-based result stands
    /// whenever the model fails.
    pub fn with_intent_llm(mut self, provider: Arc<dyn ChatProvider>, model: String) -> Self {
        self.intent_llm = Some((provider, model));
        self
    }

    /// Drop every cached result. The indexer calls this whenever the
    /// skills table changes.
    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub async fn route(&self, query: &str) -> Result<Vec<RouteHit>> {
        self.route_with(query, RouteOptions::default()).await
    }

    pub async fn route_with(&self, query: &str, opts: RouteOptions) -> Result<Vec<RouteHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let threshold = opts.threshold.unwrap_or(self.config.default_threshold);
        let limit = opts.limit.unwrap_or(self.config.default_limit).max(1);
        let profile_name = opts
            .profile
            .unwrap_or_else(|| self.config.active_profile.clone());
        let profile = self
            .config
            .profiles
            .get(&profile_name)
            .cloned()
            .unwrap_or_else(ConfidenceProfile::balanced);

        let translated = self.translator.translate(query).await;

        let mut intent = classify(&translated);
        if let Some((provider, model)) = &self.intent_llm {
            if let Some(llm_intent) = classify_with_llm(provider, model, &translated).await {
                intent = llm_intent;
            }
        }

        let key = CacheKey {
            translated: translated.clone(),
            intent: intent.intent.as_str(),
            category: intent.category_filter.map(|c| c.as_str()),
            threshold_milli: (threshold * 1000.0) as i64,
            limit,
            profile: profile_name.clone(),
        };
        if self.config.cache_enabled {
            if let Some(hits) = self.cache_get(&key) {
                return Ok(hits);
            }
        }

        let candidates = self.retrieve(&translated, &intent, limit).await?;
        let hits = self.rank(candidates, &intent, threshold, limit, &profile);

        if self.config.cache_enabled {
            self.cache_put(key, hits.clone());
        }
        Ok(hits)
    }

    async fn retrieve(
        &self,
        translated: &str,
        intent: &IntentResult,
        limit: usize,
    ) -> Result<Vec<HybridRow>> {
        // Over-fetch so adaptive retry has candidates below the initial
        // threshold to admit without re-querying the index.
        let fetch = limit.saturating_mul(4).max(8);

        if intent.intent == SearchIntent::Exact {
            // Direct id hit first (skill.command typed verbatim), then
            // keyword-only retrieval on the tokenized query.
            if let Some(row) = self.store.get(SKILLS_TABLE, translated.trim()).await? {
                return Ok(vec![HybridRow {
                    id: row.id,
                    content: row.content,
                    metadata: row.metadata,
                    vector_score: 0.0,
                    keyword_score: 1.0,
                    final_score: 1.0,
                }]);
            }
            let keywords = crate::intent::tokenize(translated);
            let rows = self.store.search_keyword(SKILLS_TABLE, &keywords, fetch).await?;
            let total = rows.len();
            return Ok(rows
                .into_iter()
                .enumerate()
                .map(|(rank, row)| HybridRow {
                    id: row.id,
                    content: row.content,
                    metadata: row.metadata,
                    vector_score: 0.0,
                    keyword_score: 1.0 - rank as f64 / total.max(1) as f64,
                    // Keyword-only rank mapped through the same RRF curve.
                    final_score: (self.rrf().k + 1.0) / (self.rrf().k + (rank + 1) as f64),
                })
                .collect());
        }

        // `semantic` is reserved and currently retrieves like `hybrid`.
        let query_vec = self
            .embedder
            .embed(translated)
            .await
            .map_err(anyhow::Error::from)?;
        let keywords = crate::intent::tokenize(translated);
        match self
            .store
            .search_hybrid(SKILLS_TABLE, &query_vec, &keywords, fetch, &self.rrf())
            .await
        {
            Ok(rows) => Ok(rows),
            Err(e) => {
                // Vector-store failure degrades to empty, never aborts.
                tracing::warn!("hybrid search failed, returning no routes: {e}");
                Ok(Vec::new())
            }
        }
    }

    fn rrf(&self) -> RrfParams {
        RrfParams {
            k: self.config.rrf_k,
            vector_weight: self.config.semantic_weight,
            keyword_weight: self.config.keyword_weight,
        }
    }

    fn rank(
        &self,
        candidates: Vec<HybridRow>,
        intent: &IntentResult,
        threshold: f64,
        limit: usize,
        profile: &ConfidenceProfile,
    ) -> Vec<RouteHit> {
        let mut parsed: Vec<(String, String, HybridRow)> = candidates
            .into_iter()
            .map(|row| {
                let skill = row
                    .metadata
                    .get("skill")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let command = row
                    .metadata
                    .get("command")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                match (skill, command) {
                    (Some(skill), Some(command)) => (skill, command, row),
                    _ => {
                        let (skill, command) = parse_tool_id(&row.id);
                        (skill, command, row)
                    }
                }
            })
            // Skill-level meta rows never route.
            .filter(|(skill, command, _)| skill != command)
            .collect();

        // Category filter prefers matching rows; when nothing matches the
        // filter the unfiltered ranking stands.
        if let Some(CategoryFilter::FileDiscovery) = intent.category_filter {
            let any_match = parsed.iter().any(|(_, _, row)| {
                row.metadata.get("category").and_then(|v| v.as_str())
                    == Some(CategoryFilter::FileDiscovery.as_str())
            });
            if any_match {
                parsed.retain(|(_, _, row)| {
                    row.metadata.get("category").and_then(|v| v.as_str())
                        == Some(CategoryFilter::FileDiscovery.as_str())
                });
            }
        }

        // Dedupe by (skill, command), keeping the max final_score.
        let mut best: HashMap<(String, String), (String, String, HybridRow)> = HashMap::new();
        for (skill, command, row) in parsed {
            let key = (skill.clone(), command.clone());
            match best.get(&key) {
                Some((_, _, existing)) if existing.final_score >= row.final_score => {}
                _ => {
                    best.insert(key, (skill, command, row));
                }
            }
        }
        let mut ranked: Vec<(String, String, HybridRow)> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.2.final_score
                .total_cmp(&a.2.final_score)
                .then_with(|| a.2.id.cmp(&b.2.id))
        });

        // Adaptive retry: lower the threshold stepwise while too few
        // candidates qualify.
        let mut effective = threshold;
        let mut attempts = 0;
        loop {
            let qualifying = ranked
                .iter()
                .filter(|(_, _, row)| row.final_score >= effective)
                .count();
            if qualifying >= limit || attempts >= self.config.adaptive_max_attempts {
                break;
            }
            attempts += 1;
            effective = (effective - self.config.adaptive_threshold_step).max(0.0);
            tracing::debug!(
                "adaptive retry {attempts}: lowering threshold to {effective:.2}"
            );
        }

        ranked
            .into_iter()
            .filter(|(_, _, row)| row.final_score >= effective)
            .filter_map(|(skill, command, row)| {
                let (confidence, value) = label_confidence(row.final_score, profile)?;
                let routing_keywords = row
                    .metadata
                    .get("routing_keywords")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let input_schema = row
                    .metadata
                    .get("input_schema")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                Some(RouteHit {
                    skill_name: skill,
                    command_name: command,
                    score: row.vector_score.max(row.keyword_score),
                    final_score: row.final_score,
                    confidence,
                    confidence_value: value,
                    routing_keywords,
                    input_schema,
                })
            })
            .take(limit)
            .collect()
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Vec<RouteHit>> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(key)?;
        if entry.stored_at.elapsed() < ttl {
            Some(entry.hits.clone())
        } else {
            None
        }
    }

    fn cache_put(&self, key: CacheKey, hits: Vec<RouteHit>) {
        if let Ok(mut cache) = self.cache.lock() {
            let now = Instant::now();
            let ttl = Duration::from_secs(self.config.cache_ttl_secs);
            cache.retain(|_, entry| now.duration_since(entry.stored_at) < ttl);
            cache.insert(
                key,
                CacheEntry {
                    hits,
                    stored_at: now,
                },
            );
        }
    }
}

/// Map a fused score to (label, displayed value) through the profile
/// curve; scores under the low floor are filtered out entirely.
fn label_confidence(score: f64, profile: &ConfidenceProfile) -> Option<(Confidence, f64)> {
    if score >= profile.high_threshold {
        let value = (profile.high_base + profile.high_scale * (score - profile.high_threshold))
            .clamp(profile.high_base, profile.high_cap);
        Some((Confidence::High, value))
    } else if score >= profile.medium_threshold {
        let value = (profile.medium_base
            + profile.medium_scale * (score - profile.medium_threshold))
            .clamp(profile.medium_base, profile.medium_cap);
        Some((Confidence::Medium, value))
    } else if score >= profile.low_floor {
        Some((Confidence::Low, score))
    } else {
        None
    }
}
