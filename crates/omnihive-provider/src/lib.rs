pub mod openai_compat;
pub mod scripted;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

pub use openai_compat::OpenAiCompatProvider;
pub use scripted::ScriptedProvider;
pub use types::{ChatMessage, ChatRequest, ChatResponse, ContentBlock, ToolDef};

/// The chat-completion seam. The runtime never owns a wire format; any
/// endpoint with function-calling can sit behind this trait.
///
/// Transient failures should carry a `[retryable]` marker in the error
/// string so callers can distinguish them from structural errors.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ChatProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("provider not found: {id}"))
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}
