//! Relay backend: a control plane that already speaks the OpenAI wire
//! protocol under `/api/llm-proxy`, with its own catalog shape at
//! `/api/models` (an `items` array carrying a `usage` tag per model). The
//! request passes through largely untouched; its stream contract ends with
//! a `[DONE]` sentinel, which this plugin alone re-emits.

use eventsource_stream::Eventsource;
use futures_util::future;
use futures_util::StreamExt;
use reqwest::{header, Client};
use serde_json::Value;

use crate::backends::openai::{unit_from_chunk, unit_from_completion, upstream_error_message};
use crate::backends::{http_client, Backend, BackendCaps};
use crate::config::Config;
use crate::error::AdapterError;
use crate::protocol::{ChatRequest, ModelDescriptor, Usage};
use crate::stream::ChatReply;

const CAPS: BackendCaps = BackendCaps {
    system_role: true,
    inline_image_parts: true,
    native_streaming: true,
    done_sentinel: true,
};

pub struct RelayBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RelayBackend {
    pub fn from_config(config: &Config) -> Result<Self, AdapterError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| AdapterError::Config("missing relay base URL".to_string()))?;
        Ok(Self::new(http_client()?, base_url, config.api_key.clone()))
    }

    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        RelayBackend {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        rb
    }

    async fn forward(&self, path: &str, body: Value) -> Result<Value, AdapterError> {
        let resp = self
            .post(path)
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
            .map_err(|e| AdapterError::backend(format!("invalid relay response: {e}")))
    }
}

#[async_trait::async_trait]
impl Backend for RelayBackend {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn capabilities(&self) -> BackendCaps {
        CAPS
    }

    async fn probe(&self) -> Result<(), AdapterError> {
        self.client
            .get(format!("{}/api/models", self.base_url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AdapterError::from)?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, AdapterError> {
        let resp = self
            .client
            .get(format!("{}/api/models", self.base_url))
            .send()
            .await
            .map_err(AdapterError::from)?;
        let status = resp.status();
        let text = resp.text().await.map_err(AdapterError::from)?;
        if !status.is_success() {
            return Err(AdapterError::backend_status(status, text));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| AdapterError::backend(format!("invalid models response: {e}")))?;
        let models = v["items"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(|id| (id, m)))
                    .map(|(id, m)| {
                        let created = m["created"]
                            .as_str()
                            .map(crate::catalog::rfc3339_to_unix)
                            .unwrap_or(0);
                        // Unknown usage strings stay untagged, never guessed.
                        let usage = m["usage"].as_str().and_then(Usage::parse);
                        ModelDescriptor::new(id, created).usage(usage)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatReply, AdapterError> {
        // The relay speaks the same wire protocol; the request goes through
        // as-is rather than through the normalizer.
        let stream = req.stream;
        let body = serde_json::to_value(&req)
            .map_err(|e| AdapterError::ClientRequest(e.to_string()))?;

        let resp = self
            .post("/api/llm-proxy/chat/completions")
            .header(header::ACCEPT, "text/event-stream")
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
        self.forward("/api/llm-proxy/embeddings", body).await
    }

    async fn images(&self, body: Value) -> Result<Value, AdapterError> {
        self.forward("/api/llm-proxy/images/generations", body).await
    }
}
