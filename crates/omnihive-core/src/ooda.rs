//! The OODA executor: Observe → Orient → Decide → Act, one LLM round at
//! a time, tools serialized, with a hard cognitive-closure guard.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use omnihive_provider::{ChatMessage, ChatProvider, ChatRequest};
use omnihive_router::SkillRouter;
use omnihive_runner::{RunOptions, SkillRunner};
use omnihive_schema::config::OodaConfig;
use uuid::Uuid;

use crate::context::{ContextConfig, ContextManager};
use crate::parser::{parse_response, ToolAction};
use crate::recall::{is_knowledge_intent, Librarian};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an orchestration agent. Decide one action per step. Reply with a single JSON \
object: {\"action\": \"tool_call\", \"tool\": \"skill.command\", \"args\": {...}} or \
{\"action\": \"finish\", \"answer\": \"...\"}.";

const RESULT_CAP: usize = 800;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const TRANSIENT_ATTEMPTS: usize = 2;

#[derive(Debug)]
pub struct OodaReport {
    pub session_id: String,
    pub answer: String,
    pub steps: usize,
    pub tool_calls: usize,
    pub errors: usize,
}

pub struct OodaExecutor {
    provider: Arc<dyn ChatProvider>,
    model: String,
    runner: Arc<SkillRunner>,
    router: Option<Arc<SkillRouter>>,
    librarian: Option<Librarian>,
    config: OodaConfig,
    system_prompt: String,
}

impl OodaExecutor {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        runner: Arc<SkillRunner>,
        config: OodaConfig,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            runner,
            router: None,
            librarian: None,
            config,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Consult the router before the first decision so candidate tools
    /// appear in the system context.
    pub fn with_router(mut self, router: Arc<SkillRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Enable lesson recall/harvesting and knowledge-intent RAG notes.
    pub fn with_librarian(mut self, librarian: Librarian) -> Self {
        self.librarian = Some(librarian);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Drive one task to completion. Terminates on `finish` (after the
    /// closure guard) or when `max_steps` is exhausted.
    pub async fn run(&self, task: &str) -> Result<OodaReport> {
        let session_id = Uuid::new_v4().to_string()[..8].to_string();
        let mut context = ContextManager::new(
            self.system_prompt.clone(),
            ContextConfig {
                max_tokens: self.config.max_context_tokens,
                retained_turns: self.config.retained_turns,
            },
        );

        self.orient(task, &mut context).await;

        let plan = self.formulate_plan(task, &context).await;
        if let Some(plan) = &plan {
            context.add_assistant(format!("Initial Plan: {plan}"));
        }
        context.add_user(task.to_string());

        let mut found_paths: Vec<String> = Vec::new();
        let mut read_artifacts: HashSet<String> = HashSet::new();
        let mut guarded_artifacts: HashSet<String> = HashSet::new();
        let mut last_error: Option<String> = None;
        let mut parse_failures = 0usize;
        let mut steps = 0usize;
        let mut tool_calls = 0usize;
        let mut errors = 0usize;

        while steps < self.config.max_steps {
            steps += 1;
            tracing::debug!(session_id = %session_id, step = steps, "ooda step");

            let decision_prompt = format!(
                "Current plan: {}\nDiscovered paths: {:?}\nDecide the next action.",
                plan.as_deref().unwrap_or("(none)"),
                found_paths
            );
            let reply = self.decide(&context, &decision_prompt).await?;

            let mut action = match parse_response(&reply, found_paths.last().map(String::as_str)) {
                Some(action) => action,
                None => {
                    parse_failures += 1;
                    if parse_failures == 1 {
                        // One structured-retry nudge; counts a step.
                        context.add_user(
                            "Could not parse that reply. Answer with exactly one JSON object \
                             of the form {\"action\": \"tool_call\"|\"finish\", ...}."
                                .to_string(),
                        );
                        continue;
                    }
                    tracing::warn!(session_id = %session_id, "unparseable reply, counting step");
                    context.add_user("Reply ignored (unparseable).".to_string());
                    continue;
                }
            };

            // Closure guard: never finish while a discovered artifact's
            // report has not entered the context. One override per artifact.
            if let ToolAction::Finish { .. } = &action {
                if let Some(artifact) = found_paths.last().cloned() {
                    if !read_artifacts.contains(&artifact)
                        && guarded_artifacts.insert(artifact.clone())
                    {
                        tracing::info!(
                            session_id = %session_id,
                            artifact = %artifact,
                            "closure guard: forcing report read before finish"
                        );
                        action = ToolAction::ToolCall {
                            tool: "filesystem.read_files".into(),
                            args: serde_json::json!({
                                "paths": [format!("{artifact}/index.md")]
                            }),
                        };
                    }
                }
            }

            match action {
                ToolAction::Finish { answer } => {
                    return Ok(OodaReport {
                        session_id,
                        answer,
                        steps,
                        tool_calls,
                        errors,
                    });
                }
                ToolAction::ToolCall { tool, args } => {
                    tool_calls += 1;
                    context.add_assistant(format!("Action: {tool}\nArgs: {args}"));

                    let result = self
                        .runner
                        .run_tool(
                            &tool,
                            args.clone(),
                            RunOptions {
                                timeout: Some(Duration::from_secs(
                                    self.config.tool_timeout_secs,
                                )),
                                ..RunOptions::default()
                            },
                        )
                        .await;

                    let rendered = match result {
                        Ok(value) => {
                            for path in extract_artifact_paths(&value.to_string()) {
                                if !found_paths.contains(&path) {
                                    tracing::debug!(path = %path, "captured artifact path");
                                    found_paths.push(path);
                                }
                            }
                            if tool == "filesystem.read_files" {
                                for artifact in &found_paths {
                                    if args.to_string().contains(artifact.as_str()) {
                                        read_artifacts.insert(artifact.clone());
                                    }
                                }
                            }
                            if let Some(failed) = last_error.take() {
                                self.try_harvest_lesson(&tool, &failed, &args).await;
                            }
                            value.to_string()
                        }
                        Err(e) => {
                            errors += 1;
                            last_error =
                                Some(format!("attempted {tool} with {args}, got: {e}"));
                            format!("ERROR [{}]: {e}", e.code())
                        }
                    };

                    context.add_user(format!(
                        "Tool Result ({tool}):\n{}",
                        cap_result(&rendered)
                    ));
                }
            }
        }

        Ok(OodaReport {
            session_id,
            answer: "Task reached maximum steps.".to_string(),
            steps,
            tool_calls,
            errors,
        })
    }

    /// Orient: recalled lessons, knowledge snippets and router candidates
    /// become system notes before the first decision.
    async fn orient(&self, task: &str, context: &mut ContextManager) {
        if let Some(librarian) = &self.librarian {
            match librarian.recall_lessons(task, self.config.recall_limit).await {
                Ok(lessons) if !lessons.is_empty() => {
                    context.add_system_note(format!(
                        "[HISTORICAL LESSONS]\n{}",
                        lessons.join("\n")
                    ));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("lesson recall failed: {e}"),
            }

            if is_knowledge_intent(task) {
                match librarian.recall(task, self.config.recall_limit).await {
                    Ok(snippets) if !snippets.is_empty() => {
                        context.add_system_note(format!(
                            "[RELEVANT CONTEXT]\n{}",
                            snippets.join("\n---\n")
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!("knowledge recall failed: {e}"),
                }
            }
        }

        if let Some(router) = &self.router {
            match router.route(task).await {
                Ok(hits) if !hits.is_empty() => {
                    let listing = hits
                        .iter()
                        .map(|hit| {
                            format!(
                                "- {}.{} (confidence: {})",
                                hit.skill_name,
                                hit.command_name,
                                hit.confidence.as_str()
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    context.add_system_note(format!("[CANDIDATE TOOLS]\n{listing}"));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("router consultation failed: {e}"),
            }
        }
    }

    async fn formulate_plan(&self, task: &str, context: &ContextManager) -> Option<String> {
        let prompt = format!(
            "Task: {task:?}. Formulate a short plan. If research is performed, the final \
             step MUST be reading the index.md in the output directory."
        );
        match self.chat_once(context.system_prompt(), vec![ChatMessage::user(prompt)]).await {
            Ok(reply) if !reply.trim().is_empty() => Some(reply.trim().to_string()),
            _ => None,
        }
    }

    async fn decide(&self, context: &ContextManager, prompt: &str) -> Result<String> {
        let mut messages = context.active_context();
        messages.push(ChatMessage::user(prompt));

        let mut backoff = BACKOFF_BASE;
        let mut attempts = 0usize;
        loop {
            match self.chat_once(context.system_prompt(), messages.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    let transient = e.to_string().contains("[retryable]");
                    if transient && attempts < TRANSIENT_ATTEMPTS {
                        attempts += 1;
                        tracing::warn!(
                            "transient llm error (attempt {attempts}), backing off {backoff:?}: {e}"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn chat_once(&self, system: String, messages: Vec<ChatMessage>) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            system: Some(system),
            messages,
            max_tokens: 1024,
            tools: vec![],
        };
        let timeout = Duration::from_secs(self.config.llm_timeout_secs);
        match tokio::time::timeout(timeout, self.provider.chat(request)).await {
            Ok(result) => result.map(|response| response.text),
            Err(_) => Err(anyhow!("llm call timed out after {timeout:?} [retryable]")),
        }
    }

    async fn try_harvest_lesson(&self, tool: &str, failed: &str, args: &serde_json::Value) {
        if let Some(librarian) = &self.librarian {
            let successful = format!("{tool} with {args} succeeded");
            if let Err(e) = librarian.harvest_lesson(tool, failed, &successful).await {
                tracing::debug!("lesson harvest failed: {e}");
            }
        }
    }
}

fn cap_result(rendered: &str) -> String {
    if rendered.len() > RESULT_CAP {
        let mut capped = rendered[..RESULT_CAP].to_string();
        capped.push_str("...");
        capped
    } else {
        rendered.to_string()
    }
}

/// Pull harvested-report directories out of tool output: any absolute or
/// project-relative path containing `/.data/harvested/`.
pub fn extract_artifact_paths(text: &str) -> Vec<String> {
    const MARKER: &str = ".data/harvested/";
    let mut paths = Vec::new();
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find(MARKER) {
        let marker_start = search_from + offset;

        let mut start = marker_start;
        while start > 0 && is_path_byte(bytes[start - 1]) {
            start -= 1;
        }
        let mut end = marker_start + MARKER.len();
        while end < bytes.len() && is_path_byte(bytes[end]) {
            end += 1;
        }

        let mut path = text[start..end].trim_end_matches(['/', '.']).to_string();
        // Keep only the report directory itself, not files inside it.
        if let Some(dir_end) = path[start_of_run(&path)..].find('/') {
            let keep = start_of_run(&path) + dir_end;
            path.truncate(keep);
        }
        if !path.is_empty() && !paths.contains(&path) {
            paths.push(path);
        }
        search_from = end.max(marker_start + MARKER.len());
    }
    paths
}

fn is_path_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'_' | b'-')
}

/// Byte index just past `.data/harvested/<run>` within `path`.
fn start_of_run(path: &str) -> usize {
    const MARKER: &str = ".data/harvested/";
    match path.find(MARKER) {
        Some(idx) => idx + MARKER.len(),
        None => path.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_harvest_dir_from_json_output() {
        let output = r#"{"status": "ok", "harvest_dir": "/work/.data/harvested/run-42"}"#;
        let paths = extract_artifact_paths(output);
        assert_eq!(paths, vec!["/work/.data/harvested/run-42"]);
    }

    #[test]
    fn extracts_relative_paths_and_dedupes() {
        let output = "wrote .data/harvested/abc/index.md and .data/harvested/abc/raw.json";
        let paths = extract_artifact_paths(output);
        assert_eq!(paths, vec![".data/harvested/abc"]);
    }

    #[test]
    fn ignores_text_without_marker() {
        assert!(extract_artifact_paths("nothing to see here").is_empty());
    }

    #[test]
    fn cap_result_adds_ellipsis() {
        let long = "x".repeat(1000);
        let capped = cap_result(&long);
        assert_eq!(capped.len(), RESULT_CAP + 3);
        assert!(capped.ends_with("..."));
        assert_eq!(cap_result("short"), "short");
    }
}
