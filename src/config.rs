use crate::error::AdapterError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    OpenAi,
    Groq,
    Anthropic,
    Ollama,
    Relay,
}

impl BackendKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(BackendKind::OpenAi),
            "groq" => Some(BackendKind::Groq),
            "anthropic" => Some(BackendKind::Anthropic),
            "ollama" => Some(BackendKind::Ollama),
            "relay" => Some(BackendKind::Relay),
            _ => None,
        }
    }
}

/// Read-only configuration, built once at startup and passed by reference.
/// Nothing else in the process reads the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub backend: BackendKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub ollama_host: String,
    pub port: u16,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, AdapterError> {
        let backend = match std::env::var("MODELGATE_BACKEND") {
            Ok(v) => BackendKind::parse(v.trim()).ok_or_else(|| {
                AdapterError::Config(format!(
                    "unknown MODELGATE_BACKEND '{v}' (expected openai, groq, anthropic, ollama or relay)"
                ))
            })?,
            Err(_) => {
                return Err(AdapterError::Config(
                    "MODELGATE_BACKEND is not set".to_string(),
                ))
            }
        };

        let api_key = non_empty(std::env::var("MODELGATE_API_KEY").ok());
        let base_url = non_empty(std::env::var("MODELGATE_BASE_URL").ok())
            .map(|u| u.trim_end_matches('/').to_string());

        match backend {
            BackendKind::OpenAi | BackendKind::Groq | BackendKind::Anthropic => {
                if api_key.is_none() {
                    return Err(AdapterError::Config(
                        "MODELGATE_API_KEY is required for this backend".to_string(),
                    ));
                }
            }
            BackendKind::Relay => {
                if base_url.is_none() {
                    return Err(AdapterError::Config(
                        "MODELGATE_BASE_URL is required for the relay backend".to_string(),
                    ));
                }
            }
            BackendKind::Ollama => {}
        }

        let port = match std::env::var("PORT") {
            Ok(v) => v
                .trim()
                .parse::<u16>()
                .map_err(|_| AdapterError::Config(format!("invalid PORT '{v}'")))?,
            Err(_) => 8000,
        };

        Ok(Config {
            backend,
            api_key,
            base_url,
            ollama_host: std::env::var("MODELGATE_OLLAMA_HOST")
                .unwrap_or_else(|_| "127.0.0.1:11434".to_string()),
            port,
            debug: std::env::var("DEBUG").map(|v| v == "true").unwrap_or(false),
        })
    }

    /// The gateway's own base URL, answered by the root probe endpoint.
    pub fn base_uri(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}
