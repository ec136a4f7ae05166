//! Query normalisation: routing works in English because SKILL.md routing
//! keywords are English-only. Non-English queries are translated through
//! the LLM; on failure a minimal English intent phrase is synthesized so
//! the keyword branch still has something to match.

use std::sync::Arc;

use omnihive_provider::{ChatMessage, ChatProvider, ChatRequest};

const TRANSLATE_SYSTEM: &str = "You are a translator. You must respond in English only.\n\n\
Task: Output exactly one short line: the English translation of the user's message. \
Keep URLs and paths unchanged.\n\n\
Rules: One line only. English only. No explanation, no title, no #.";

/// Heuristic: treat as English only if the non-URL part is mostly ASCII
/// letters. Any non-ASCII character outside URLs/paths means translate.
pub fn is_likely_english(text: &str) -> bool {
    let cleaned = strip_urls_and_paths(text);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return true;
    }
    if cleaned.chars().any(|c| !c.is_ascii()) {
        return false;
    }
    let tokens: Vec<&str> = cleaned
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return true;
    }
    let ascii_words = tokens
        .iter()
        .filter(|t| t.chars().all(|c| c.is_ascii_alphabetic()))
        .count();
    ascii_words as f64 / tokens.len() as f64 >= 0.5
}

fn strip_urls_and_paths(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| {
            !(token.starts_with("http://")
                || token.starts_with("https://")
                || looks_like_file(token))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_file(token: &str) -> bool {
    const EXTENSIONS: &[&str] = &[".py", ".rs", ".json", ".yaml", ".yml", ".md", ".toml"];
    let lowered = token.to_ascii_lowercase();
    EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
}

/// Extract the first URL, if any.
pub fn first_url(text: &str) -> Option<&str> {
    text.split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
}

/// Minimal English phrase built when LLM translation fails or stays
/// non-English; keeps the URL verbatim for downstream invocation.
fn routing_fallback(query: &str) -> Option<String> {
    first_url(query).map(|url| format!("research {url}"))
}

pub struct QueryTranslator {
    provider: Option<Arc<dyn ChatProvider>>,
    enabled: bool,
    model: String,
}

impl QueryTranslator {
    pub fn new(provider: Option<Arc<dyn ChatProvider>>, enabled: bool, model: String) -> Self {
        Self {
            provider,
            enabled,
            model,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, false, String::new())
    }

    /// Best-effort translation to English. English inputs pass through
    /// unchanged; failures fall back to the original query or, when that
    /// is still non-English, to a synthesized `research <url>` phrase.
    pub async fn translate(&self, query: &str) -> String {
        if query.trim().is_empty() || !self.enabled {
            return query.to_string();
        }
        if is_likely_english(query) {
            return query.to_string();
        }

        if let Some(provider) = &self.provider {
            let request = ChatRequest {
                model: self.model.clone(),
                system: Some(TRANSLATE_SYSTEM.to_string()),
                messages: vec![ChatMessage::user(query.trim())],
                max_tokens: 512,
                tools: vec![],
            };
            match provider.chat(request).await {
                Ok(response) => {
                    let line = response
                        .text
                        .lines()
                        .next()
                        .unwrap_or_default()
                        .trim()
                        .trim_start_matches("# ")
                        .trim()
                        .to_string();
                    if !line.is_empty() && line.is_ascii() {
                        tracing::debug!(original = query, translated = %line, "query translated");
                        return line;
                    }
                    tracing::debug!("translation still non-English, using fallback");
                }
                Err(e) => {
                    tracing::warn!("query translation failed, using original: {e}");
                }
            }
        }

        routing_fallback(query).unwrap_or_else(|| query.to_string())
    }
}
