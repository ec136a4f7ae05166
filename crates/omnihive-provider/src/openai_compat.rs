//! OpenAI-compatible chat-completions provider.
//!
//! Works against any endpoint that speaks the `/chat/completions` shape
//! (OpenAI, DeepSeek, Groq, Ollama, vLLM, ...); only the base URL and key
//! differ.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::types::{ChatRequest, ChatResponse, ContentBlock, ToolDef};
use crate::ChatProvider;

#[derive(Clone)]
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Ollama speaks the same shape locally and needs no real key.
    pub fn ollama(base_url: impl Into<String>) -> Self {
        Self::new("ollama", base_url)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireToolFunction,
}

#[derive(Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireCallFunction,
}

#[derive(Serialize, Deserialize)]
struct WireCallFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

fn to_wire_tool(def: &ToolDef) -> WireTool {
    WireTool {
        kind: "function".into(),
        function: WireToolFunction {
            name: def.name.clone(),
            description: def.description.clone(),
            parameters: def.input_schema.clone(),
        },
    }
}

fn to_wire_messages(request: &ChatRequest) -> Vec<WireMessage> {
    let mut wire = Vec::new();
    if let Some(system) = &request.system {
        wire.push(WireMessage {
            role: "system".into(),
            content: Some(system.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    for message in &request.messages {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text.clone()),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(WireToolCall {
                    id: id.clone(),
                    kind: "function".into(),
                    function: WireCallFunction {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    wire.push(WireMessage {
                        role: "tool".into(),
                        content: Some(content.clone()),
                        tool_calls: None,
                        tool_call_id: Some(tool_use_id.clone()),
                    });
                }
            }
        }
        if !text_parts.is_empty() || !tool_calls.is_empty() {
            wire.push(WireMessage {
                role: message.role.clone(),
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join("\n"))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            });
        }
    }
    wire
}

fn parse_wire_response(parsed: WireResponse) -> Result<ChatResponse> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("chat response contained no choices"))?;

    let mut content = Vec::new();
    let text = choice.message.content.clone().unwrap_or_default();
    if !text.is_empty() {
        content.push(ContentBlock::Text { text: text.clone() });
    }
    if let Some(calls) = choice.message.tool_calls {
        for call in calls {
            let input = serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::Null);
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
    }

    let stop_reason = choice.finish_reason.map(|reason| match reason.as_str() {
        "tool_calls" => "tool_use".to_string(),
        "stop" => "end_turn".to_string(),
        other => other.to_string(),
    });

    Ok(ChatResponse {
        text,
        content,
        input_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
        output_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
        stop_reason,
    })
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let wire = WireRequest {
            model: request.model.clone(),
            messages: to_wire_messages(&request),
            max_tokens: request.max_tokens,
            tools: request.tools.iter().map(to_wire_tool).collect(),
        };

        let response = self
            .client
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&wire)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    anyhow!("chat request failed [retryable]: {e}")
                } else {
                    anyhow!("chat request failed: {e}")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let marker = if status.as_u16() == 429 || status.is_server_error() {
                " [retryable]"
            } else {
                ""
            };
            return Err(anyhow!("chat api error ({status}){marker}: {body}"));
        }

        let parsed: WireResponse = response.json().await?;
        parse_wire_response(parsed)
    }
}
