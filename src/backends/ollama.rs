//! Ollama backend. Chat goes through `/api/chat` without native streaming —
//! the core synthesizes a one-chunk stream when the caller asked for one.
//! Images travel in the `images` side-channel, there is no system role, and
//! the catalog comes from `/api/tags`.

use reqwest::{header, Client};
use serde_json::{json, Value};

use crate::backends::{http_client, Backend, BackendCaps};
use crate::config::Config;
use crate::error::AdapterError;
use crate::normalize::{normalize, top_level_argument_map, NormalizedMessage};
use crate::protocol::{ChatRequest, FinishReason, ModelDescriptor, Role};
use crate::stream::{ChatReply, ChatUnit, ToolCallFragment};

const CAPS: BackendCaps = BackendCaps {
    system_role: false,
    inline_image_parts: false,
    native_streaming: false,
    done_sentinel: false,
};

pub struct OllamaBackend {
    client: Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn from_config(config: &Config) -> Result<Self, AdapterError> {
        Ok(Self::new(
            http_client()?,
            format!("http://{}", config.ollama_host),
        ))
    }

    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        OllamaBackend {
            client,
            base_url: base_url.into(),
        }
    }

    fn wire_messages(messages: &[NormalizedMessage]) -> Result<Vec<Value>, AdapterError> {
        let mut out = Vec::with_capacity(messages.len());
        for m in messages {
            let mut obj = serde_json::Map::new();
            obj.insert("role".to_string(), json!(m.role));
            obj.insert(
                "content".to_string(),
                json!(m.content.as_ref().and_then(|c| c.first_text()).unwrap_or("")),
            );
            if !m.images.is_empty() {
                obj.insert("images".to_string(), json!(m.images));
            }
            if let Some(tool_calls) = &m.tool_calls {
                // Ollama takes arguments as an object; nested values must be
                // re-stringified or it mishandles them.
                let calls = tool_calls
                    .iter()
                    .map(|call| {
                        let arguments = top_level_argument_map(&call.function.arguments)?;
                        Ok(json!({
                            "function": {
                                "name": call.function.name,
                                "arguments": arguments,
                            }
                        }))
                    })
                    .collect::<Result<Vec<Value>, AdapterError>>()?;
                obj.insert("tool_calls".to_string(), json!(calls));
            }
            out.push(Value::Object(obj));
        }
        Ok(out)
    }
}

fn unit_from_response(v: &Value) -> ChatUnit {
    let message = &v["message"];
    let fragments = message["tool_calls"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .map(|tc| {
                    let name = tc["function"]["name"].as_str().map(String::from);
                    ToolCallFragment {
                        // Ollama has no call ids; the function name stands in.
                        id: name.clone(),
                        name,
                        arguments: tc
                            .pointer("/function/arguments")
                            .filter(|a| !a.is_null())
                            .cloned(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    let finish = match v["done_reason"].as_str() {
        Some("stop") => Some(FinishReason::Stop),
        Some("length") => Some(FinishReason::Length),
        _ => None,
    };
    ChatUnit {
        role: message["role"].as_str().and_then(Role::parse),
        content: message["content"].as_str().map(String::from),
        tool_calls: fragments,
        finish,
        done: true,
        usage: None,
    }
}

#[async_trait::async_trait]
impl Backend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn capabilities(&self) -> BackendCaps {
        CAPS
    }

    async fn probe(&self) -> Result<(), AdapterError> {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AdapterError::from)?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, AdapterError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AdapterError::from)?;
        let v: Value = resp.json().await.map_err(AdapterError::from)?;
        let models = v["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["model"].as_str().or_else(|| m["name"].as_str()).map(|id| (id, m)))
                    .map(|(id, m)| {
                        let created = m["modified_at"]
                            .as_str()
                            .map(crate::catalog::rfc3339_to_unix)
                            .unwrap_or(0);
                        ModelDescriptor::new(id, created).owned_by("local")
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatReply, AdapterError> {
        let nreq = normalize(req, &CAPS, &self.client).await?;

        let mut body = json!({
            "model": nreq.model,
            "messages": Self::wire_messages(&nreq.messages)?,
            "stream": false,
        });
        if let Some(tools) = &nreq.tools {
            body["tools"] = json!(tools);
        }
        let mut options = serde_json::Map::new();
        if let Some(t) = nreq.temperature {
            options.insert("temperature".to_string(), json!(t));
        }
        if let Some(t) = nreq.top_p {
            options.insert("top_p".to_string(), json!(t));
        }
        if let Some(t) = nreq.max_tokens {
            options.insert("num_predict".to_string(), json!(t));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(text);
            return Err(AdapterError::backend_status(status, message));
        }
        let v: Value = resp.json().await.map_err(AdapterError::from)?;
        Ok(ChatReply::Single(unit_from_response(&v)))
    }
}
