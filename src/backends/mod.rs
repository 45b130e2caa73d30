pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::{BackendKind, Config};
use crate::error::AdapterError;
use crate::protocol::{ChatRequest, ModelDescriptor};
use crate::stream::ChatReply;

/// Per-backend capability flags consulted by the shared normalizer and the
/// stream emitter. Explicit flags, never runtime type probing.
#[derive(Clone, Copy, Debug)]
pub struct BackendCaps {
    /// Whether the backend accepts a system role; when false a leading
    /// system message is rewritten to user.
    pub system_role: bool,
    /// Whether image parts stay inline in message content; when false they
    /// travel in a side-channel list next to the text.
    pub inline_image_parts: bool,
    /// Whether chat() can return ChatReply::Stream; when false, streamed
    /// requests get a synthesized one-chunk stream.
    pub native_streaming: bool,
    /// Whether the backend's wire contract ends streams with a `[DONE]`
    /// sentinel frame. The core never fabricates one on its own.
    pub done_sentinel: bool,
}

/// The plugin seam: everything that varies per backend. The HTTP front,
/// normalizer, stream emitter and catalog envelope are shared.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> BackendCaps;

    /// Upfront liveness check, run once at startup. Failure is fatal.
    async fn probe(&self) -> Result<(), AdapterError>;

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, AdapterError>;

    async fn chat(&self, req: ChatRequest) -> Result<ChatReply, AdapterError>;

    async fn embeddings(&self, _body: Value) -> Result<Value, AdapterError> {
        Err(AdapterError::Unsupported(format!(
            "{} backend does not serve embeddings",
            self.name()
        )))
    }

    async fn images(&self, _body: Value) -> Result<Value, AdapterError> {
        Err(AdapterError::Unsupported(format!(
            "{} backend does not serve image generation",
            self.name()
        )))
    }
}

pub fn http_client() -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| AdapterError::Config(format!("building http client: {e}")))
}

pub fn build(config: &Config) -> Result<Arc<dyn Backend>, AdapterError> {
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::OpenAi | BackendKind::Groq => {
            Arc::new(openai::OpenAiBackend::from_config(config)?)
        }
        BackendKind::Anthropic => Arc::new(anthropic::AnthropicBackend::from_config(config)?),
        BackendKind::Ollama => Arc::new(ollama::OllamaBackend::from_config(config)?),
        BackendKind::Relay => Arc::new(relay::RelayBackend::from_config(config)?),
    };
    Ok(backend)
}
