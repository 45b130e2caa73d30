//! Anthropic Messages API backend. System turns become the `system`
//! parameter, content parts become content blocks, tool calls map onto
//! `tool_use`/`tool_result` blocks, and the event stream collapses onto
//! plain content/tool-fragment units.

use eventsource_stream::Eventsource;
use futures_util::future;
use futures_util::StreamExt;
use reqwest::{header, Client};
use serde_json::{json, Value};

use crate::backends::openai::upstream_error_message;
use crate::backends::{http_client, Backend, BackendCaps};
use crate::config::Config;
use crate::error::AdapterError;
use crate::normalize::{normalize, NormalizedMessage};
use crate::protocol::{
    ChatRequest, ContentPart, FinishReason, MessageContent, ModelDescriptor, Role, Usage,
};
use crate::stream::{ChatReply, ChatUnit, ToolCallFragment};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
// The Messages API requires max_tokens; used when the caller sent none.
const DEFAULT_MAX_TOKENS: u32 = 4096;

const CAPS: BackendCaps = BackendCaps {
    system_role: true,
    inline_image_parts: true,
    native_streaming: true,
    done_sentinel: false,
};

pub struct AnthropicBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicBackend {
    pub fn from_config(config: &Config) -> Result<Self, AdapterError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AdapterError::Config("missing API key".to_string()))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string());
        Ok(Self::new(http_client()?, base_url, api_key))
    }

    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        AnthropicBackend {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(header::CONTENT_TYPE, "application/json")
    }
}

fn content_blocks(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => vec![json!({"type": "text", "text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::ImageUrl { image_url } => match split_data_url(&image_url.url) {
                    Some((media_type, data)) => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": media_type, "data": data},
                    }),
                    // Remote URLs were inlined by the normalizer; anything
                    // else degrades to a textual reference.
                    None => json!({"type": "text", "text": image_url.url}),
                },
            })
            .collect(),
    }
}

fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type, data))
}

/// Messages become the `system` string plus user/assistant turns; tool
/// results ride as user-side `tool_result` blocks.
fn wire_messages(messages: &[NormalizedMessage]) -> (Option<String>, Vec<Value>) {
    let mut system = None;
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System if out.is_empty() && system.is_none() => {
                system = message
                    .content
                    .as_ref()
                    .and_then(|c| c.first_text())
                    .map(String::from);
            }
            Role::System | Role::User => {
                let blocks = message.content.as_ref().map(content_blocks).unwrap_or_default();
                if !blocks.is_empty() {
                    out.push(json!({"role": "user", "content": blocks}));
                }
            }
            Role::Assistant => {
                let mut blocks = message.content.as_ref().map(content_blocks).unwrap_or_default();
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::String(call.function.arguments.clone()));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id.clone().unwrap_or_else(|| call.function.name.clone()),
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                }
                if !blocks.is_empty() {
                    out.push(json!({"role": "assistant", "content": blocks}));
                }
            }
            Role::Tool => {
                let text = message
                    .content
                    .as_ref()
                    .and_then(|c| c.first_text())
                    .unwrap_or("");
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": text,
                    }],
                }));
            }
        }
    }
    (system, out)
}

/// OpenAI tool declarations → Anthropic `tools`.
fn wire_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            let function = tool.get("function")?;
            Some(json!({
                "name": function["name"],
                "description": function.get("description").cloned().unwrap_or(Value::Null),
                "input_schema": function.get("parameters").cloned().unwrap_or(json!({"type": "object"})),
            }))
        })
        .collect()
}

fn wire_tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(s) if s == "auto" => Some(json!({"type": "auto"})),
        Value::String(s) if s == "required" => Some(json!({"type": "any"})),
        Value::Object(obj) => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .map(|name| json!({"type": "tool", "name": name})),
        _ => None,
    }
}

fn map_stop_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "end_turn" | "stop_sequence" => Some(FinishReason::Stop),
        "max_tokens" => Some(FinishReason::Length),
        "tool_use" => Some(FinishReason::ToolCalls),
        "refusal" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

/// A complete (non-streamed) message object → terminal unit.
fn unit_from_message(v: &Value) -> ChatUnit {
    let mut text = String::new();
    let mut fragments = Vec::new();
    if let Some(blocks) = v["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(t) = block["text"].as_str() {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => fragments.push(ToolCallFragment {
                    id: block["id"].as_str().map(String::from),
                    name: block["name"].as_str().map(String::from),
                    arguments: block.get("input").cloned(),
                }),
                _ => {}
            }
        }
    }
    ChatUnit {
        role: Some(Role::Assistant),
        content: (!text.is_empty()).then_some(text),
        tool_calls: fragments,
        finish: v["stop_reason"].as_str().and_then(map_stop_reason),
        done: true,
        usage: v.get("usage").filter(|u| !u.is_null()).cloned(),
    }
}

/// One SSE event → at most one unit. Pings, block boundaries and the final
/// message_stop carry nothing the wire format needs.
fn unit_from_event(event: &str, data: &str) -> Option<Result<ChatUnit, AdapterError>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return Some(Err(AdapterError::backend(format!(
                "invalid stream payload: {e}"
            ))))
        }
    };
    match event {
        "message_start" => Some(Ok(ChatUnit {
            role: Some(Role::Assistant),
            ..Default::default()
        })),
        "content_block_start" => {
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                Some(Ok(ChatUnit {
                    tool_calls: vec![ToolCallFragment {
                        id: block["id"].as_str().map(String::from),
                        name: block["name"].as_str().map(String::from),
                        arguments: None,
                    }],
                    ..Default::default()
                }))
            } else {
                None
            }
        }
        "content_block_delta" => {
            let delta = &v["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => delta["text"].as_str().map(|t| {
                    Ok(ChatUnit {
                        content: Some(t.to_string()),
                        ..Default::default()
                    })
                }),
                Some("input_json_delta") => delta["partial_json"].as_str().map(|j| {
                    Ok(ChatUnit {
                        tool_calls: vec![ToolCallFragment {
                            id: None,
                            name: None,
                            arguments: Some(Value::String(j.to_string())),
                        }],
                        ..Default::default()
                    })
                }),
                _ => None,
            }
        }
        "message_delta" => Some(Ok(ChatUnit {
            finish: v
                .pointer("/delta/stop_reason")
                .and_then(|r| r.as_str())
                .and_then(map_stop_reason),
            done: true,
            usage: v.get("usage").filter(|u| !u.is_null()).cloned(),
            ..Default::default()
        })),
        "error" => Some(Err(AdapterError::backend(
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("backend stream error")
                .to_string(),
        ))),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn capabilities(&self) -> BackendCaps {
        CAPS
    }

    async fn probe(&self) -> Result<(), AdapterError> {
        self.request(reqwest::Method::GET, "/v1/models")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AdapterError::from)?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, AdapterError> {
        let resp = self
            .request(reqwest::Method::GET, "/v1/models?limit=1000")
            .send()
            .await
            .map_err(AdapterError::from)?;
        let status = resp.status();
        let text = resp.text().await.map_err(AdapterError::from)?;
        if !status.is_success() {
            return Err(AdapterError::backend_status(
                status,
                upstream_error_message(&text),
            ));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| AdapterError::backend(format!("invalid models response: {e}")))?;
        let models = v["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(|id| (id, m)))
                    .map(|(id, m)| {
                        let created = m["created_at"]
                            .as_str()
                            .map(crate::catalog::rfc3339_to_unix)
                            .unwrap_or(0);
                        ModelDescriptor::new(id, created)
                            .owned_by("anthropic")
                            .usage(Some(Usage::Llm))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatReply, AdapterError> {
        let nreq = normalize(req, &CAPS, &self.client).await?;
        let stream = nreq.stream;
        let (system, messages) = wire_messages(&nreq.messages);

        let mut body = json!({
            "model": nreq.model,
            "max_tokens": nreq.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(t) = nreq.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(t) = nreq.top_p {
            body["top_p"] = json!(t);
        }
        if let Some(tools) = &nreq.tools {
            body["tools"] = json!(wire_tools(tools));
            if let Some(mapped) = nreq.tool_choice.as_ref().and_then(wire_tool_choice) {
                body["tool_choice"] = mapped;
            }
        }

        let resp = self
            .request(reqwest::Method::POST, "/v1/messages")
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::backend_status(
                status,
                upstream_error_message(&text),
            ));
        }

        if stream {
            let units = resp.bytes_stream().eventsource().filter_map(|event| {
                future::ready(match event {
                    Ok(ev) => unit_from_event(&ev.event, &ev.data),
                    Err(e) => Some(Err(AdapterError::backend(format!("stream error: {e}")))),
                })
            });
            Ok(ChatReply::Stream(Box::pin(units)))
        } else {
            let v: Value = resp.json().await.map_err(AdapterError::from)?;
            Ok(ChatReply::Single(unit_from_message(&v)))
        }
    }
}
