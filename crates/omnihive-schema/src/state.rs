use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One conversation entry inside workflow state. `messages` is the
/// canonical record of a session; everything else in the state map is
/// derived or advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

impl StateMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            tool_calls: None,
        }
    }
}

/// The workflow state: a single JSON object merged shallowly from node
/// outputs. `messages` is append-only: merging concatenates instead of
/// replacing; that is the only legal mutation of past entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowState(pub Map<String, Value>);

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_id(thread_id: impl Into<String>) -> Self {
        let mut state = Self::new();
        state
            .0
            .insert("thread_id".into(), Value::String(thread_id.into()));
        state
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.get_str("thread_id")
    }

    pub fn current_plan(&self) -> Option<&str> {
        self.get_str("current_plan")
    }

    pub fn error_count(&self) -> u64 {
        self.0
            .get("error_count")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn recalled_lessons(&self) -> Vec<String> {
        self.0
            .get("recalled_lessons")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<StateMessage> {
        self.0
            .get("messages")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn push_message(&mut self, message: StateMessage) {
        let entry = self
            .0
            .entry("messages")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(serde_json::to_value(message).unwrap_or(Value::Null));
        }
    }

    /// Shallow-merge a partial state. `messages` arrays concatenate; every
    /// other key is replaced by the partial's value.
    pub fn merge(&mut self, partial: WorkflowState) {
        for (key, value) in partial.0 {
            if key == "messages" {
                let existing = self
                    .0
                    .entry("messages")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let (Value::Array(current), Value::Array(incoming)) = (existing, value) {
                    current.extend(incoming);
                }
            } else {
                self.0.insert(key, value);
            }
        }
    }

    /// Canonical JSON for checkpoint content; byte-stable across runs.
    pub fn to_canonical_json(&self) -> String {
        crate::canonical_json(&Value::Object(self.0.clone()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl From<Map<String, Value>> for WorkflowState {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_replaces_plain_keys() {
        let mut state = WorkflowState::new();
        state.set("status", json!("pending"));
        let mut partial = WorkflowState::new();
        partial.set("status", json!("prepared"));
        state.merge(partial);
        assert_eq!(state.get_str("status"), Some("prepared"));
    }

    #[test]
    fn merge_appends_messages() {
        let mut state = WorkflowState::new();
        state.push_message(StateMessage::user("one"));
        let mut partial = WorkflowState::new();
        partial.push_message(StateMessage::assistant("two"));
        state.merge(partial);

        let messages = state.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "one");
        assert_eq!(messages[1].content, "two");
    }

    #[test]
    fn merge_never_rewrites_existing_messages() {
        let mut state = WorkflowState::new();
        state.push_message(StateMessage::user("first"));
        let snapshot = state.messages();

        let mut partial = WorkflowState::new();
        partial.push_message(StateMessage::assistant("second"));
        state.merge(partial);

        let merged = state.messages();
        assert_eq!(&merged[..1], &snapshot[..]);
    }

    #[test]
    fn canonical_json_roundtrip() {
        let mut state = WorkflowState::with_thread_id("t1");
        state.set("current_plan", json!("review the diff"));
        state.push_message(StateMessage::user("hello"));

        let raw = state.to_canonical_json();
        let restored = WorkflowState::from_json_str(&raw).unwrap();
        assert_eq!(restored.to_canonical_json(), raw);
        assert_eq!(restored.thread_id(), Some("t1"));
        assert_eq!(restored.current_plan(), Some("review the diff"));
    }

    #[test]
    fn accessors_default_when_absent() {
        let state = WorkflowState::new();
        assert_eq!(state.error_count(), 0);
        assert!(state.messages().is_empty());
        assert!(state.recalled_lessons().is_empty());
    }
}
