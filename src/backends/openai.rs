//! OpenAI-compatible backend plugin. Covers OpenAI itself plus any endpoint
//! speaking the same wire protocol (Groq ships as a preset with its own base
//! URL and owner tag).

use eventsource_stream::Eventsource;
use futures_util::future;
use futures_util::StreamExt;
use reqwest::{header, Client};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::backends::{http_client, Backend, BackendCaps};
use crate::config::{BackendKind, Config};
use crate::error::AdapterError;
use crate::normalize::{normalize, NormalizedMessage};
use crate::protocol::{ChatRequest, FinishReason, MessageContent, ModelDescriptor, Role};
use crate::stream::{ChatReply, ChatUnit, ToolCallFragment};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

const CAPS: BackendCaps = BackendCaps {
    system_role: true,
    inline_image_parts: true,
    native_streaming: true,
    done_sentinel: false,
};

pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: String,
    name: &'static str,
    owner: &'static str,
}

impl OpenAiBackend {
    pub fn from_config(config: &Config) -> Result<Self, AdapterError> {
        let (name, owner, default_base) = match config.backend {
            BackendKind::Groq => ("groq", "groq", GROQ_BASE_URL),
            _ => ("openai", "openai", OPENAI_BASE_URL),
        };
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AdapterError::Config("missing API key".to_string()))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        Ok(Self::new(http_client()?, base_url, api_key, name, owner))
    }

    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        name: &'static str,
        owner: &'static str,
    ) -> Self {
        OpenAiBackend {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            name,
            owner,
        }
    }

    fn wire_messages(messages: &[NormalizedMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let mut obj = serde_json::Map::new();
                obj.insert("role".to_string(), json!(m.role));
                match &m.content {
                    Some(MessageContent::Text(text)) => {
                        obj.insert("content".to_string(), json!(text));
                    }
                    Some(MessageContent::Parts(parts)) => {
                        obj.insert(
                            "content".to_string(),
                            serde_json::to_value(parts).unwrap_or(Value::Null),
                        );
                    }
                    None => {}
                }
                if let Some(name) = &m.name {
                    obj.insert("name".to_string(), json!(name));
                }
                if let Some(tool_calls) = &m.tool_calls {
                    obj.insert(
                        "tool_calls".to_string(),
                        serde_json::to_value(tool_calls).unwrap_or(Value::Null),
                    );
                }
                if let Some(id) = &m.tool_call_id {
                    obj.insert("tool_call_id".to_string(), json!(id));
                }
                Value::Object(obj)
            })
            .collect()
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, AdapterError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(&self.api_key)
            .json(body)
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
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capabilities(&self) -> BackendCaps {
        CAPS
    }

    async fn probe(&self) -> Result<(), AdapterError> {
        self.client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AdapterError::from)?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, AdapterError> {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
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
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let models = v["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(|id| (id.to_string(), m)))
                    .map(|(id, m)| {
                        let usage = crate::catalog::openai_usage(&id);
                        ModelDescriptor::new(id, m["created"].as_i64().unwrap_or(now))
                            .owned_by(m["owned_by"].as_str().unwrap_or(self.owner))
                            .usage(usage)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatReply, AdapterError> {
        let nreq = normalize(req, &CAPS, &self.client).await?;
        let stream = nreq.stream;

        let mut body = json!({
            "model": nreq.model,
            "messages": Self::wire_messages(&nreq.messages),
            "stream": stream,
        });
        if let Some(t) = nreq.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(t) = nreq.top_p {
            body["top_p"] = json!(t);
        }
        if let Some(t) = nreq.max_tokens {
            body["max_tokens"] = json!(t);
        }
        if let Some(tools) = &nreq.tools {
            body["tools"] = json!(tools);
            if let Some(choice) = &nreq.tool_choice {
                body["tool_choice"] = choice.clone();
            }
        }
        for (k, v) in &nreq.extra {
            body[k.as_str()] = v.clone();
        }

        let resp = self.send(&body).await?;

        if stream {
            let units = resp
                .bytes_stream()
                .eventsource()
                .filter_map(|event| {
                    future::ready(match event {
                        Ok(ev) => {
                            if ev.data == "[DONE]" {
                                None
                            } else {
                                Some(
                                    serde_json::from_str::<Value>(&ev.data)
                                        .map(|v| unit_from_chunk(&v))
                                        .map_err(|e| {
                                            AdapterError::backend(format!(
                                                "invalid stream payload: {e}"
                                            ))
                                        }),
                                )
                            }
                        }
                        Err(e) => Some(Err(AdapterError::backend(format!("stream error: {e}")))),
                    })
                });
            Ok(ChatReply::Stream(Box::pin(units)))
        } else {
            let v: Value = resp.json().await.map_err(AdapterError::from)?;
            Ok(ChatReply::Single(unit_from_completion(&v)))
        }
    }

    async fn embeddings(&self, body: Value) -> Result<Value, AdapterError> {
        self.forward("/embeddings", body).await
    }

    async fn images(&self, body: Value) -> Result<Value, AdapterError> {
        self.forward("/images/generations", body).await
    }
}

impl OpenAiBackend {
    async fn forward(&self, path: &str, body: Value) -> Result<Value, AdapterError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(&self.api_key)
            .json(&body)
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
        serde_json::from_str(&text)
            .map_err(|e| AdapterError::backend(format!("invalid backend response: {e}")))
    }
}

/// Pull the human-readable message out of an OpenAI error envelope; fall
/// back to the raw body.
pub(crate) fn upstream_error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| text.to_string())
}

pub(crate) fn fragments_from_wire(tool_calls: Option<&Vec<Value>>) -> Vec<ToolCallFragment> {
    tool_calls
        .map(|arr| {
            arr.iter()
                .map(|tc| ToolCallFragment {
                    id: tc["id"].as_str().map(String::from),
                    name: tc["function"]["name"].as_str().map(String::from),
                    arguments: tc
                        .pointer("/function/arguments")
                        .filter(|a| !a.is_null())
                        .cloned(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One streamed chunk in OpenAI shape → unit.
pub(crate) fn unit_from_chunk(v: &Value) -> ChatUnit {
    let choice = &v["choices"][0];
    let delta = &choice["delta"];
    let finish = choice["finish_reason"].as_str();
    ChatUnit {
        role: delta["role"].as_str().and_then(Role::parse),
        content: delta["content"].as_str().map(String::from),
        tool_calls: fragments_from_wire(delta["tool_calls"].as_array()),
        finish: finish.and_then(FinishReason::parse),
        done: finish.is_some(),
        usage: v.get("usage").filter(|u| !u.is_null()).cloned(),
    }
}

/// A full completion object in OpenAI shape → terminal unit.
pub(crate) fn unit_from_completion(v: &Value) -> ChatUnit {
    let choice = &v["choices"][0];
    let message = &choice["message"];
    ChatUnit {
        role: message["role"].as_str().and_then(Role::parse),
        content: message["content"].as_str().map(String::from),
        tool_calls: fragments_from_wire(message["tool_calls"].as_array()),
        finish: choice["finish_reason"].as_str().and_then(FinishReason::parse),
        done: true,
        usage: v.get("usage").filter(|u| !u.is_null()).cloned(),
    }
}
