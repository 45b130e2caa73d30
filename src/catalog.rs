//! Usage-category inference for model catalogs. Unknown ids stay untagged
//! rather than guessed.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::protocol::Usage;

/// Prefix rules for OpenAI-style catalogs. Realtime models carry no tag at
/// all; fine-tuned variants keep their base model's category.
pub fn openai_usage(id: &str) -> Option<Usage> {
    let base = id.strip_prefix("ft:").unwrap_or(id);
    if base.contains("-realtime-") {
        None
    } else if base.starts_with("gpt-") || base.starts_with("o1-") {
        Some(Usage::Llm)
    } else if base.starts_with("text-embedding") {
        Some(Usage::TextEmbedding)
    } else if base.starts_with("dall-e") {
        Some(Usage::ImageGeneration)
    } else {
        None
    }
}

/// Backend catalog timestamps arrive as RFC3339 strings, sometimes with
/// nanosecond precision. Unparseable values become 0, matching the upstream
/// "created unknown" convention.
pub fn rfc3339_to_unix(timestamp: &str) -> i64 {
    OffsetDateTime::parse(timestamp, &Rfc3339)
        .map(|t| t.unix_timestamp())
        .unwrap_or(0)
}
