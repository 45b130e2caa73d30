//! Request normalization shared by every backend plugin: same-role message
//! coalescing, content-part handling (remote images are fetched and inlined
//! before any backend call), parameter passthrough, and the top-level
//! argument marshalling some backends want for historical tool calls.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value};

use crate::backends::BackendCaps;
use crate::error::AdapterError;
use crate::protocol::{ChatRequest, ContentPart, Message, MessageContent, Role};

#[derive(Clone, Debug)]
pub struct NormalizedMessage {
    pub role: Role,
    pub content: Option<MessageContent>,
    /// Side-channel image payloads, populated only for backends that take
    /// images separately from the text (`inline_image_parts == false`).
    pub images: Vec<String>,
    pub name: Option<String>,
    pub tool_calls: Option<Vec<crate::protocol::ToolCall>>,
    pub tool_call_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NormalizedRequest {
    pub model: String,
    pub messages: Vec<NormalizedMessage>,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub extra: Map<String, Value>,
}

pub async fn normalize(
    req: ChatRequest,
    caps: &BackendCaps,
    http: &reqwest::Client,
) -> Result<NormalizedRequest, AdapterError> {
    let mut messages = req.messages;

    // A leading system turn is rewritten before coalescing so it can merge
    // with a following user turn, exactly like the downgraded role would.
    if !caps.system_role {
        if let Some(first) = messages.first_mut() {
            if first.role == Role::System {
                first.role = Role::User;
            }
        }
    }

    let messages = coalesce(messages);

    let mut normalized = Vec::with_capacity(messages.len());
    for message in messages {
        let (content, images) = match message.content {
            None => (None, Vec::new()),
            Some(MessageContent::Text(text)) => (Some(MessageContent::Text(text)), Vec::new()),
            Some(MessageContent::Parts(parts)) => {
                if caps.inline_image_parts {
                    (Some(MessageContent::Parts(inline_parts(parts, http).await?)), Vec::new())
                } else {
                    flatten_parts(parts, http).await?
                }
            }
        };
        normalized.push(NormalizedMessage {
            role: message.role,
            content,
            images,
            name: message.name,
            tool_calls: message.tool_calls,
            tool_call_id: message.tool_call_id,
        });
    }

    // Never force a tool-choice policy against an empty tool set.
    let tool_choice = if req.tools.is_some() {
        req.tool_choice
    } else {
        None
    };

    Ok(NormalizedRequest {
        model: req.model,
        messages: normalized,
        tools: req.tools,
        tool_choice,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        stream: req.stream,
        extra: req.extra,
    })
}

/// Merge runs of consecutive same-role messages into one. Plain-text bodies
/// join with a newline in original order; when typed parts are involved both
/// sides become parts and concatenate. Non-content fields take the values of
/// the last message in the run.
pub fn coalesce(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::new();
    for mut message in messages {
        match merged.last_mut() {
            Some(prev) if prev.role == message.role => {
                let content = join_content(prev.content.take(), message.content.take());
                *prev = Message { content, ..message };
            }
            _ => merged.push(message),
        }
    }
    merged
}

fn join_content(
    a: Option<MessageContent>,
    b: Option<MessageContent>,
) -> Option<MessageContent> {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(MessageContent::Text(x)), Some(MessageContent::Text(y))) => {
            Some(MessageContent::Text(format!("{x}\n{y}")))
        }
        (Some(a), Some(b)) => {
            let mut parts = a.into_parts();
            parts.extend(b.into_parts());
            Some(MessageContent::Parts(parts))
        }
    }
}

/// Inline every remote image part. Already-inline `data:` payloads pass
/// through byte-identical.
async fn inline_parts(
    parts: Vec<ContentPart>,
    http: &reqwest::Client,
) -> Result<Vec<ContentPart>, AdapterError> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            ContentPart::ImageUrl { mut image_url } => {
                if !image_url.url.starts_with("data:") {
                    let (b64, mime) = fetch_image(http, &image_url.url).await?;
                    let mime = mime.unwrap_or_else(|| "image/png".to_string());
                    image_url.url = format!("data:{mime};base64,{b64}");
                }
                out.push(ContentPart::ImageUrl { image_url });
            }
            text => out.push(text),
        }
    }
    Ok(out)
}

/// Split typed parts into the first text body plus a side list of image
/// payloads, for backends that take images out-of-band.
async fn flatten_parts(
    parts: Vec<ContentPart>,
    http: &reqwest::Client,
) -> Result<(Option<MessageContent>, Vec<String>), AdapterError> {
    let mut text: Option<String> = None;
    let mut images = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text: t } => {
                if text.is_none() {
                    text = Some(t);
                }
            }
            ContentPart::ImageUrl { image_url } => {
                if image_url.url.starts_with("data:") {
                    images.push(image_url.url);
                } else {
                    let (b64, _) = fetch_image(http, &image_url.url).await?;
                    images.push(b64);
                }
            }
        }
    }
    Ok((text.map(MessageContent::Text), images))
}

async fn fetch_image(
    http: &reqwest::Client,
    url: &str,
) -> Result<(String, Option<String>), AdapterError> {
    let resp = http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| AdapterError::Network(format!("fetching image {url}: {e}")))?;
    let mime = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| AdapterError::Network(format!("reading image {url}: {e}")))?;
    Ok((BASE64.encode(&bytes), mime))
}

/// Parse a JSON-encoded argument string into a top-level map whose nested
/// values are re-stringified. Some backends want arguments as an object but
/// choke on nested structures.
pub fn top_level_argument_map(arguments: &str) -> Result<Map<String, Value>, AdapterError> {
    let parsed: Value = serde_json::from_str(arguments)
        .map_err(|e| AdapterError::ClientRequest(format!("tool arguments are not JSON: {e}")))?;
    let Value::Object(obj) = parsed else {
        return Err(AdapterError::ClientRequest(
            "tool arguments must be a JSON object".to_string(),
        ));
    };
    let mut out = Map::with_capacity(obj.len());
    for (key, value) in obj {
        match value {
            Value::Object(_) | Value::Array(_) => {
                let s = serde_json::to_string(&value)
                    .map_err(|e| AdapterError::ClientRequest(e.to_string()))?;
                out.insert(key, Value::String(s));
            }
            scalar => {
                out.insert(key, scalar);
            }
        }
    }
    Ok(out)
}
