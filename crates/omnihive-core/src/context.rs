//! Context window management for the executor loop.
//!
//! The full message log is append-only; pruning only shapes the *active
//! window* sent to the model: system messages survive, the last
//! `retained_turns` turns stay verbatim, and anything older (or anything
//! over the token budget) collapses into a single compression marker.

use omnihive_provider::ChatMessage;

/// Approximate token count from text (chars / 4). Rough, model-agnostic.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

fn estimate_message_tokens(message: &ChatMessage) -> usize {
    estimate_tokens(&message.text()).max(10)
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub retained_turns: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 32_000,
            retained_turns: 10,
        }
    }
}

pub struct ContextManager {
    system_prompt: String,
    system_notes: Vec<String>,
    log: Vec<ChatMessage>,
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(system_prompt: impl Into<String>, config: ContextConfig) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            system_notes: Vec::new(),
            log: Vec::new(),
            config,
        }
    }

    pub fn system_prompt(&self) -> String {
        if self.system_notes.is_empty() {
            self.system_prompt.clone()
        } else {
            format!("{}\n\n{}", self.system_prompt, self.system_notes.join("\n\n"))
        }
    }

    /// Inject an auxiliary system note (recalled lessons, RAG snippets).
    pub fn add_system_note(&mut self, note: impl Into<String>) {
        self.system_notes.push(note.into());
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.log.push(ChatMessage::user(content));
    }

    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.log.push(ChatMessage::assistant(content));
    }

    /// The append-only log; earlier entries never change.
    pub fn log(&self) -> &[ChatMessage] {
        &self.log
    }

    /// The window sent to the model: recent turns verbatim, everything
    /// older compressed into one marker.
    pub fn active_context(&self) -> Vec<ChatMessage> {
        let retained = self.config.retained_turns * 2;
        let total: usize = self.log.iter().map(estimate_message_tokens).sum();

        if total <= self.config.max_tokens && self.log.len() <= retained {
            return self.log.clone();
        }

        let keep_from = self.log.len().saturating_sub(retained);
        let elided = keep_from;
        let mut window = Vec::with_capacity(retained + 1);
        if elided > 0 {
            window.push(ChatMessage::system(format!(
                "[earlier context compressed: {elided} messages elided]"
            )));
        }
        window.extend(self.log[keep_from..].iter().cloned());
        window
    }
}
