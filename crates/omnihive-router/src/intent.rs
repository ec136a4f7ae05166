//! Rule-based intent classification for tool search, with an optional
//! LLM override that loses to the rules whenever it fails.

use std::sync::Arc;

use omnihive_provider::{ChatMessage, ChatProvider, ChatRequest};

/// Retrieval strategy. `Semantic` is reserved (conceptual queries) and
/// currently retrieves like `Hybrid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchIntent {
    Exact,
    Semantic,
    Hybrid,
}

impl SearchIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryFilter {
    FileDiscovery,
}

impl CategoryFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileDiscovery => "file_discovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentResult {
    pub intent: SearchIntent,
    pub category_filter: Option<CategoryFilter>,
}

const MIN_EXACT_LEN: usize = 3;
const MAX_EXACT_LEN: usize = 80;
const MAX_TOOL_ID_LEN: usize = 160;

const FILE_DISCOVERY_TERMS: &[&str] = &[
    "find",
    "list",
    "files",
    "file",
    "directory",
    "folder",
    "path",
    "glob",
    "extension",
];

/// Terms that mean "list tools or capabilities", not files.
const TOOL_CAPABILITY_TERMS: &[&str] = &[
    "tools",
    "commands",
    "capability",
    "capabilities",
    "skill",
    "skills",
    "available",
    "registry",
];

/// Lowercased alphanumeric tokens, keeping `*` and `.` inside tokens so
/// glob patterns like `*.py` survive.
pub fn tokenize(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in query.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '*' || c == '.' {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn is_tool_id(query: &str) -> bool {
    !query.is_empty()
        && query.len() <= MAX_TOOL_ID_LEN
        && query
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn is_file_discovery(query: &str) -> bool {
    let lowered = query.trim().to_lowercase();
    let tokens = tokenize(&lowered);
    let has_discovery_term = tokens
        .iter()
        .any(|t| FILE_DISCOVERY_TERMS.contains(&t.as_str()));
    // "list available tools" asks for capabilities, not files.
    if has_discovery_term
        && tokens
            .iter()
            .any(|t| TOOL_CAPABILITY_TERMS.contains(&t.as_str()))
    {
        return false;
    }
    if has_discovery_term {
        return true;
    }
    if tokens.iter().any(|t| t.starts_with("*.")) {
        return true;
    }
    lowered.contains(".py") || lowered.contains(".rs")
}

/// Rule-based classification:
/// - `exact` iff the query is a single 3–80 char token that looks like a
///   `skill.command` id (has a `.` and at least one letter).
/// - `file_discovery` category when the query is about locating files.
/// - everything else is `hybrid`.
pub fn classify(query: &str) -> IntentResult {
    let q = query.trim();
    let category = if is_file_discovery(q) {
        Some(CategoryFilter::FileDiscovery)
    } else {
        None
    };
    let hybrid = IntentResult {
        intent: SearchIntent::Hybrid,
        category_filter: category,
    };

    if q.len() < MIN_EXACT_LEN || q.len() > MAX_EXACT_LEN {
        return hybrid;
    }
    if q.contains(' ') {
        return hybrid;
    }
    if !is_tool_id(q) || !q.contains('.') || !q.chars().any(|c| c.is_ascii_alphabetic()) {
        return hybrid;
    }

    IntentResult {
        intent: SearchIntent::Exact,
        category_filter: None,
    }
}

const INTENT_LLM_SYSTEM: &str = r#"You classify the user's search intent for a tool/skill router.

Output exactly one JSON object with two keys:
- "intent": one of "exact", "semantic", "hybrid"
- "category_filter": null, or "file_discovery" when the query is about finding/listing files

Rules: One JSON line only. No markdown, no explanation. If unsure, use "hybrid" and null."#;

/// LLM-backed classification. Returns `None` on any failure so the
/// rule-based result stands.
pub async fn classify_with_llm(
    provider: &Arc<dyn ChatProvider>,
    model: &str,
    query: &str,
) -> Option<IntentResult> {
    if query.trim().is_empty() {
        return None;
    }
    let request = ChatRequest {
        model: model.to_string(),
        system: Some(INTENT_LLM_SYSTEM.to_string()),
        messages: vec![ChatMessage::user(query.trim())],
        max_tokens: 128,
        tools: vec![],
    };
    let response = match provider.chat(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("LLM intent classification failed, using rule-based: {e}");
            return None;
        }
    };

    let mut raw = response.text.trim().to_string();
    if let Some(stripped) = raw.strip_prefix("```") {
        raw = stripped
            .trim_start_matches("json")
            .trim_end_matches("```")
            .trim()
            .to_string();
    }
    let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let intent = match parsed.get("intent").and_then(|v| v.as_str()) {
        Some("exact") => SearchIntent::Exact,
        Some("semantic") => SearchIntent::Semantic,
        Some("hybrid") => SearchIntent::Hybrid,
        _ => SearchIntent::Hybrid,
    };
    let category_filter = match parsed.get("category_filter").and_then(|v| v.as_str()) {
        Some("file_discovery") => Some(CategoryFilter::FileDiscovery),
        _ => None,
    };
    Some(IntentResult {
        intent,
        category_filter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnihive_provider::ScriptedProvider;

    #[test]
    fn tool_id_is_exact() {
        let result = classify("git.commit");
        assert_eq!(result.intent, SearchIntent::Exact);
        assert!(result.category_filter.is_none());
    }

    #[test]
    fn natural_language_is_hybrid() {
        assert_eq!(classify("commit my changes").intent, SearchIntent::Hybrid);
        assert_eq!(classify("git commit").intent, SearchIntent::Hybrid);
    }

    #[test]
    fn single_char_query_is_hybrid() {
        assert_eq!(classify("a").intent, SearchIntent::Hybrid);
    }

    #[test]
    fn token_without_dot_is_hybrid() {
        assert_eq!(classify("commit").intent, SearchIntent::Hybrid);
    }

    #[test]
    fn numeric_only_token_is_hybrid() {
        assert_eq!(classify("1.2.3").intent, SearchIntent::Hybrid);
    }

    #[test]
    fn overlong_token_is_hybrid() {
        let long = format!("{}.cmd", "x".repeat(90));
        assert_eq!(classify(&long).intent, SearchIntent::Hybrid);
    }

    #[test]
    fn find_py_files_is_file_discovery() {
        let result = classify("find *.py files in current directory");
        assert_eq!(result.intent, SearchIntent::Hybrid);
        assert_eq!(result.category_filter, Some(CategoryFilter::FileDiscovery));
    }

    #[test]
    fn glob_token_triggers_file_discovery() {
        let result = classify("show me *.rs please");
        assert_eq!(result.category_filter, Some(CategoryFilter::FileDiscovery));
    }

    #[test]
    fn list_available_tools_is_not_file_discovery() {
        let result = classify("list available tools");
        assert_eq!(result.category_filter, None);
        let result = classify("list all skills");
        assert_eq!(result.category_filter, None);
    }

    #[test]
    fn extension_mention_triggers_file_discovery() {
        let result = classify("where does main.py live");
        assert_eq!(result.category_filter, Some(CategoryFilter::FileDiscovery));
    }

    #[tokio::test]
    async fn llm_classifier_parses_json() {
        let provider: Arc<dyn ChatProvider> = Arc::new(ScriptedProvider::with_replies(vec![
            r#"{"intent": "semantic", "category_filter": null}"#,
        ]));
        let result = classify_with_llm(&provider, "m", "explain checkpoints")
            .await
            .unwrap();
        assert_eq!(result.intent, SearchIntent::Semantic);
    }

    #[tokio::test]
    async fn llm_classifier_strips_code_fences() {
        let provider: Arc<dyn ChatProvider> = Arc::new(ScriptedProvider::with_replies(vec![
            "```json\n{\"intent\": \"hybrid\", \"category_filter\": \"file_discovery\"}\n```",
        ]));
        let result = classify_with_llm(&provider, "m", "find files")
            .await
            .unwrap();
        assert_eq!(result.category_filter, Some(CategoryFilter::FileDiscovery));
    }

    #[tokio::test]
    async fn llm_garbage_returns_none() {
        let provider: Arc<dyn ChatProvider> =
            Arc::new(ScriptedProvider::with_replies(vec!["not json at all"]));
        assert!(classify_with_llm(&provider, "m", "query").await.is_none());
    }
}
