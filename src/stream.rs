//! Response/stream normalization. Every backend reply — a single object or
//! an iterator of partial units — collapses onto OpenAI chat-completion
//! chunks framed as SSE. Synthesized one-chunk streams and relayed
//! multi-chunk streams are indistinguishable except by chunk count.

use std::convert::Infallible;

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AdapterError;
use crate::protocol::{
    ChatCompletion, ChatCompletionChunk, ChunkChoice, CompletionChoice, CompletionMessage, Delta,
    FinishReason, FunctionDelta, Role, ToolCallDelta,
};

/// One incremental unit from a backend: a full response or one partial
/// chunk, already converted out of the backend's native shape by its plugin.
#[derive(Clone, Debug, Default)]
pub struct ChatUnit {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
    /// The backend's native stop reason, pre-mapped by the plugin.
    pub finish: Option<FinishReason>,
    /// Terminal unit marker.
    pub done: bool,
    pub usage: Option<Value>,
}

/// Tool-call data as the backend produced it; arguments stay a raw JSON
/// value here and are re-serialized to a string at emission time.
#[derive(Clone, Debug, Default)]
pub struct ToolCallFragment {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<Value>,
}

pub type UnitStream = BoxStream<'static, Result<ChatUnit, AdapterError>>;

/// The explicit tagged union over backend response shapes. Each plugin owns
/// a dedicated conversion into it; the shared code below never probes
/// runtime types.
pub enum ChatReply {
    Single(ChatUnit),
    Stream(UnitStream),
}

fn argument_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

fn tool_call_deltas(fragments: &[ToolCallFragment]) -> Option<Vec<ToolCallDelta>> {
    if fragments.is_empty() {
        return None;
    }
    // Indexes are zero-based positions within this unit, not a global
    // counter; callers position-match them across chunks.
    Some(
        fragments
            .iter()
            .enumerate()
            .map(|(index, f)| ToolCallDelta {
                index: index as u32,
                id: f.id.clone(),
                kind: "function".to_string(),
                function: FunctionDelta {
                    name: f.name.clone(),
                    arguments: f.arguments.as_ref().map(argument_string),
                },
            })
            .collect(),
    )
}

fn finish_reason(unit: &ChatUnit) -> Option<FinishReason> {
    if unit.done && !unit.tool_calls.is_empty() {
        Some(FinishReason::ToolCalls)
    } else if unit.finish.is_some() {
        unit.finish
    } else if unit.done {
        Some(FinishReason::Stop)
    } else {
        None
    }
}

fn chunk_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

pub fn chunk_from_unit(model: &str, unit: &ChatUnit) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: chunk_id(),
        object: "chat.completion.chunk".to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: Delta {
                role: unit.role,
                content: unit.content.clone(),
                tool_calls: tool_call_deltas(&unit.tool_calls),
            },
            finish_reason: finish_reason(unit),
        }],
    }
}

/// The non-streamed response object for `stream=false` requests.
pub fn completion_from_unit(model: &str, mut unit: ChatUnit) -> ChatCompletion {
    unit.done = true;
    ChatCompletion {
        id: chunk_id(),
        object: "chat.completion".to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message: CompletionMessage {
                role: unit.role.unwrap_or(Role::Assistant),
                content: unit.content.clone(),
                tool_calls: tool_call_deltas(&unit.tool_calls),
            },
            finish_reason: finish_reason(&unit),
        }],
        usage: unit.usage,
    }
}

/// Build the SSE response. Headers go out before the first backend byte is
/// awaited; the unit stream is only polled as frames are written.
pub fn sse_response(model: String, reply: ChatReply, done_sentinel: bool) -> Response {
    Sse::new(unit_events(model, reply, done_sentinel)).into_response()
}

fn frame(chunk: &ChatCompletionChunk) -> Result<Event, Infallible> {
    let json = serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string());
    tracing::debug!(chunk = %json, "emitting chunk");
    Ok(Event::default().data(json))
}

fn unit_events(
    model: String,
    reply: ChatReply,
    done_sentinel: bool,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    async_stream::stream! {
        let mut interrupted = false;
        match reply {
            ChatReply::Single(mut unit) => {
                unit.done = true;
                yield frame(&chunk_from_unit(&model, &unit));
            }
            ChatReply::Stream(mut units) => {
                while let Some(item) = units.next().await {
                    match item {
                        Ok(unit) => yield frame(&chunk_from_unit(&model, &unit)),
                        Err(err) => {
                            // Bytes already flushed cannot be rewritten; end
                            // the stream and let the caller's EOF detection
                            // take over.
                            tracing::warn!("backend stream interrupted: {err}");
                            interrupted = true;
                            break;
                        }
                    }
                }
            }
        }
        if done_sentinel && !interrupted {
            yield Ok(Event::default().data("[DONE]"));
        }
    }
}

/// Fold a unit stream into one terminal unit, position-matching tool-call
/// fragments by index. Used when a backend streams despite the caller
/// asking for a non-streamed response.
pub async fn collapse(mut units: UnitStream) -> Result<ChatUnit, AdapterError> {
    let mut folded = ChatUnit::default();
    while let Some(unit) = units.next().await.transpose()? {
        if folded.role.is_none() {
            folded.role = unit.role;
        }
        if let Some(delta) = unit.content {
            folded.content = Some(match folded.content.take() {
                Some(mut text) => {
                    text.push_str(&delta);
                    text
                }
                None => delta,
            });
        }
        for (index, fragment) in unit.tool_calls.into_iter().enumerate() {
            if let Some(existing) = folded.tool_calls.get_mut(index) {
                if fragment.id.is_some() {
                    existing.id = fragment.id;
                }
                if fragment.name.is_some() {
                    existing.name = fragment.name;
                }
                if let Some(args) = fragment.arguments {
                    let piece = argument_string(&args);
                    existing.arguments = Some(match existing.arguments.take() {
                        Some(Value::String(mut s)) => {
                            s.push_str(&piece);
                            Value::String(s)
                        }
                        _ => Value::String(piece),
                    });
                }
            } else {
                folded.tool_calls.push(fragment);
            }
        }
        if unit.finish.is_some() {
            folded.finish = unit.finish;
        }
        if unit.usage.is_some() {
            folded.usage = unit.usage;
        }
    }
    folded.done = true;
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn single_unit_without_reason_finishes_with_stop() {
        let unit = ChatUnit {
            role: Some(Role::Assistant),
            content: Some("hi".to_string()),
            done: true,
            ..Default::default()
        };
        let chunk = chunk_from_unit("m", &unit);
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
        assert_eq!(chunk.object, "chat.completion.chunk");
    }

    #[test]
    fn terminal_tool_calls_override_the_native_reason() {
        let unit = ChatUnit {
            tool_calls: vec![ToolCallFragment {
                id: Some("call_1".to_string()),
                name: Some("lookup".to_string()),
                arguments: Some(serde_json::json!({"a": 1})),
            }],
            finish: Some(FinishReason::Stop),
            done: true,
            ..Default::default()
        };
        let chunk = chunk_from_unit("m", &unit);
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn decoded_arguments_are_reserialized_to_a_string() {
        let unit = ChatUnit {
            tool_calls: vec![ToolCallFragment {
                id: None,
                name: Some("f".to_string()),
                arguments: Some(serde_json::json!({"a": 1})),
            }],
            done: true,
            ..Default::default()
        };
        let chunk = chunk_from_unit("m", &unit);
        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments.as_deref(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn string_arguments_pass_through_verbatim() {
        let unit = ChatUnit {
            tool_calls: vec![ToolCallFragment {
                id: None,
                name: None,
                arguments: Some(Value::String(r#"{"x": "#.to_string())),
            }],
            done: false,
            ..Default::default()
        };
        let chunk = chunk_from_unit("m", &unit);
        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments.as_deref(), Some(r#"{"x": "#));
        assert_eq!(chunk.choices[0].finish_reason, None);
    }

    #[test]
    fn tool_call_indexes_are_per_unit_positions() {
        let unit = ChatUnit {
            tool_calls: vec![
                ToolCallFragment {
                    name: Some("a".to_string()),
                    ..Default::default()
                },
                ToolCallFragment {
                    name: Some("b".to_string()),
                    ..Default::default()
                },
            ],
            done: true,
            ..Default::default()
        };
        let chunk = chunk_from_unit("m", &unit);
        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[1].index, 1);
    }

    #[test]
    fn completion_defaults_the_role_to_assistant() {
        let completion = completion_from_unit(
            "m",
            ChatUnit {
                content: Some("hello".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.choices[0].message.role, Role::Assistant);
        assert_eq!(
            completion.choices[0].finish_reason,
            Some(FinishReason::Stop)
        );
    }

    #[tokio::test]
    async fn collapse_folds_deltas_and_tool_arguments() {
        let units: Vec<Result<ChatUnit, AdapterError>> = vec![
            Ok(ChatUnit {
                role: Some(Role::Assistant),
                content: Some("he".to_string()),
                ..Default::default()
            }),
            Ok(ChatUnit {
                content: Some("llo".to_string()),
                tool_calls: vec![ToolCallFragment {
                    id: Some("call_1".to_string()),
                    name: Some("f".to_string()),
                    arguments: Some(Value::String(r#"{"a""#.to_string())),
                }],
                ..Default::default()
            }),
            Ok(ChatUnit {
                tool_calls: vec![ToolCallFragment {
                    arguments: Some(Value::String(r#":1}"#.to_string())),
                    ..Default::default()
                }],
                finish: Some(FinishReason::Stop),
                done: true,
                ..Default::default()
            }),
        ];
        let folded = collapse(Box::pin(stream::iter(units))).await.unwrap();
        assert_eq!(folded.content.as_deref(), Some("hello"));
        assert_eq!(folded.tool_calls.len(), 1);
        assert_eq!(
            folded.tool_calls[0].arguments,
            Some(Value::String(r#"{"a":1}"#.to_string()))
        );
        assert!(folded.done);
    }

    #[tokio::test]
    async fn collapse_propagates_backend_errors() {
        let units: Vec<Result<ChatUnit, AdapterError>> =
            vec![Err(AdapterError::backend("connection reset"))];
        assert!(collapse(Box::pin(stream::iter(units))).await.is_err());
    }
}
