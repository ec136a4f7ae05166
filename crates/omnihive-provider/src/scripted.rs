//! Scripted provider for tests and offline runs: replays a queue of
//! canned responses, echoing the last user message once the queue drains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ChatRequest, ChatResponse};
use crate::ChatProvider;

pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ChatResponse>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ChatResponse>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_replies(texts: Vec<impl Into<String>>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|t| ChatResponse::from_text(t.into()))
                .collect(),
        )
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        Ok(next.unwrap_or_else(|| {
            let echo = request
                .messages
                .last()
                .map(|m| m.text())
                .unwrap_or_default();
            ChatResponse::from_text(echo)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            model: "test".into(),
            system: None,
            messages: vec![ChatMessage::user(text)],
            max_tokens: 64,
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_echoes() {
        let provider = ScriptedProvider::with_replies(vec!["one", "two"]);
        assert_eq!(provider.chat(request("a")).await.unwrap().text, "one");
        assert_eq!(provider.chat(request("b")).await.unwrap().text, "two");
        assert_eq!(provider.chat(request("echo me")).await.unwrap().text, "echo me");
        assert_eq!(provider.call_count(), 3);
    }
}
