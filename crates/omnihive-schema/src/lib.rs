pub mod config;
pub mod error;
pub mod state;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use config::RuntimeConfig;
pub use error::{CheckpointError, EmbeddingError, GraphError, SkillError, StoreError, SwarmError};
pub use state::{StateMessage, WorkflowState};

/// A routable command record: what the router returns and the executor
/// consumes. Identity is `skill_name.command_name`; records are immutable
/// per lookup and only replaced wholesale by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub skill_name: String,
    pub command_name: String,
    pub description: String,
    /// JSON-Schema subset: `{type: object, properties, required}`.
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub routing_keywords: Vec<String>,
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub file_path: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Result caching: TTL in seconds, 0 disables.
    #[serde(default)]
    pub cache_ttl_seconds: u64,
    /// Pure commands may be served from the result cache.
    #[serde(default)]
    pub pure: bool,
    /// Command must run in an isolated worker process.
    #[serde(default)]
    pub isolated: bool,
}

fn default_weight() -> f64 {
    1.0
}

impl ToolRecord {
    /// Fully-qualified tool id, `skill.command`.
    pub fn tool_id(&self) -> String {
        format!("{}.{}", self.skill_name, self.command_name)
    }

    /// Text embedded and keyword-indexed for routing.
    pub fn routing_text(&self) -> String {
        let mut parts = vec![self.description.clone()];
        parts.extend(self.routing_keywords.iter().cloned());
        parts.extend(self.intents.iter().cloned());
        parts.join(" ")
    }
}

/// Confidence label attached to a route hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// One ranked router result. Deduplicated by `(skill_name, command_name)`
/// keeping the max `final_score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteHit {
    pub skill_name: String,
    pub command_name: String,
    /// Raw retrieval score before fusion weighting.
    pub score: f64,
    /// Fused (RRF) score used for ranking and confidence mapping.
    pub final_score: f64,
    pub confidence: Confidence,
    /// Displayed confidence value from the active profile curve.
    pub confidence_value: f64,
    #[serde(default)]
    pub routing_keywords: Vec<String>,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// Envelope for the router's JSON output (`schema: "router.result.v1"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub schema: String,
    pub query: String,
    pub results: Vec<RouteHit>,
}

impl RouteResponse {
    pub fn new(query: impl Into<String>, results: Vec<RouteHit>) -> Self {
        Self {
            schema: "router.result.v1".to_string(),
            query: query.into(),
            results,
        }
    }
}

/// Delta delivered to registry `on_update` subscribers after a reload
/// cycle. Names are fully-qualified `skill.command` ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryUpdate {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl RegistryUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Skill names touched by this update, deduplicated.
    pub fn touched_skills(&self) -> Vec<String> {
        let mut skills: Vec<String> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
            .filter_map(|id| id.split('.').next())
            .map(|s| s.to_string())
            .collect();
        skills.sort();
        skills.dedup();
        skills
    }
}

/// Lifecycle of a skill bundle inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillState {
    Undiscovered,
    Loaded,
    Dirty,
    Reloaded,
    Removed,
}

/// Parse a fully-qualified tool id of the form `skill.command`.
///
/// The part after the *first* dot is the command; a bare name without a
/// dot is treated as `(name, name)` so skill-level rows can be filtered
/// by `skill_name == command_name`.
pub fn parse_tool_id(tool_id: &str) -> (String, String) {
    match tool_id.split_once('.') {
        Some((skill, command)) if !command.is_empty() => (skill.to_string(), command.to_string()),
        _ => (tool_id.to_string(), tool_id.to_string()),
    }
}

/// Canonical JSON serialization: objects with sorted keys, no
/// insignificant whitespace. Used for cache keys and checkpoint content so
/// byte equality is meaningful.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Per-node health snapshot reported by the subprocess pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub name: String,
    pub connected: bool,
    pub circuit: String,
    pub healthy: bool,
    #[serde(default)]
    pub ping_error: Option<String>,
    pub metrics: NodeMetricsSnapshot,
}

/// Point-in-time copy of a node's call metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetricsSnapshot {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub restarts: u64,
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Aggregated health report keyed by node name.
pub type SwarmHealthReport = HashMap<String, NodeHealth>;
