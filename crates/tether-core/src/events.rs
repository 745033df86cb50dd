//! Provider events.
//!
//! [`ProviderEvent`] is the closed set of things a provider turn can emit.
//! Adapters decode their wire format into it exactly once, at the boundary;
//! everything downstream matches on it exhaustively.
//!
//! [`decode_stream_line`] understands the newline-delimited stream-json
//! output of the Claude Code CLI:
//!
//! | line `type` | produces |
//! |-------------|----------|
//! | `system` (subtype `init`) | [`ProviderEvent::Init`] |
//! | `assistant` | one [`ProviderEvent::ContentDelta`] per text block, one [`ProviderEvent::ToolUse`] per tool block |
//! | `user` | one [`ProviderEvent::ToolResult`] per tool result block |
//! | `result` | end of turn; [`ProviderEvent::Error`] when `is_error` |
//!
//! Unknown line and block types decode to nothing so newer CLI versions do
//! not break older adapters.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::DecodeError;

/// One event of a provider turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// The provider assigned (or confirmed) the session key.
    Init {
        /// Provider session key.
        session_key: String,
    },
    /// Assistant text.
    ContentDelta {
        /// Text fragment.
        text: String,
    },
    /// The assistant invoked a tool.
    ToolUse {
        /// Tool name.
        name: String,
        /// Tool arguments.
        args: Value,
    },
    /// A tool finished.
    ToolResult {
        /// Result payload as reported by the provider.
        payload: Value,
    },
    /// The turn failed.
    Error {
        /// Error description.
        message: String,
    },
}

impl ProviderEvent {
    /// Whether the event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Result of decoding one provider output line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamLine {
    /// Events carried by the line, in order.
    pub events: Vec<ProviderEvent>,
    /// The line closes the current turn.
    pub end_of_turn: bool,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: RawMessage,
    },
    User {
        message: RawMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        subtype: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: RawContent,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawBlock>),
}

impl Default for RawContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Decode one line of stream-json provider output.
pub fn decode_stream_line(line: &str) -> Result<StreamLine, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }

    let raw: RawLine = serde_json::from_str(line)?;
    let decoded = match raw {
        RawLine::System {
            subtype,
            session_id,
        } => match (subtype.as_deref(), session_id) {
            (Some("init"), Some(session_key)) => StreamLine {
                events: vec![ProviderEvent::Init { session_key }],
                end_of_turn: false,
            },
            _ => StreamLine::default(),
        },
        RawLine::Assistant { message } => StreamLine {
            events: assistant_events(message.content),
            end_of_turn: false,
        },
        RawLine::User { message } => StreamLine {
            events: tool_result_events(message.content),
            end_of_turn: false,
        },
        RawLine::Result {
            is_error,
            result,
            subtype,
        } => {
            let events = if is_error {
                let message = result
                    .or(subtype)
                    .unwrap_or_else(|| "provider reported an error".to_owned());
                vec![ProviderEvent::Error { message }]
            } else {
                Vec::new()
            };
            StreamLine {
                events,
                end_of_turn: true,
            }
        }
        RawLine::Other => StreamLine::default(),
    };
    Ok(decoded)
}

fn assistant_events(content: RawContent) -> Vec<ProviderEvent> {
    match content {
        RawContent::Text(text) => vec![ProviderEvent::ContentDelta { text }],
        RawContent::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(|block| match block {
                RawBlock::Text { text } => Some(ProviderEvent::ContentDelta { text }),
                RawBlock::ToolUse { name, input } => Some(ProviderEvent::ToolUse { name, args: input }),
                RawBlock::ToolResult { .. } | RawBlock::Other => None,
            })
            .collect(),
    }
}

fn tool_result_events(content: RawContent) -> Vec<ProviderEvent> {
    match content {
        // Plain user text is the echo of our own prompt.
        RawContent::Text(_) => Vec::new(),
        RawContent::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(|block| match block {
                RawBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(ProviderEvent::ToolResult {
                    payload: json!({
                        "toolUseId": tool_use_id,
                        "content": content,
                        "isError": is_error,
                    }),
                }),
                RawBlock::Text { .. } | RawBlock::ToolUse { .. } | RawBlock::Other => None,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn init_line() {
        let line = r#"{"type":"system","subtype":"init","session_id":"4f1c","cwd":"/srv"}"#;
        let decoded = decode_stream_line(line).unwrap();
        assert_eq!(
            decoded.events,
            vec![ProviderEvent::Init {
                session_key: "4f1c".into()
            }]
        );
        assert!(!decoded.end_of_turn);
    }

    #[test]
    fn system_line_without_init_is_ignored() {
        let decoded = decode_stream_line(r#"{"type":"system","subtype":"compact"}"#).unwrap();
        assert!(decoded.events.is_empty());
    }

    #[test]
    fn assistant_blocks_in_order() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"thinking","thinking":"hmm"},
            {"type":"text","text":"Reading the file."},
            {"type":"tool_use","id":"t1","name":"Read","input":{"path":"a.rs"}}
        ]}}"#;
        let decoded = decode_stream_line(&line.replace('\n', "")).unwrap();
        assert_eq!(decoded.events.len(), 2);
        assert_eq!(
            decoded.events[0],
            ProviderEvent::ContentDelta {
                text: "Reading the file.".into()
            }
        );
        assert_matches!(
            &decoded.events[1],
            ProviderEvent::ToolUse { name, args } if name == "Read" && args["path"] == "a.rs"
        );
    }

    #[test]
    fn assistant_plain_string_content() {
        let decoded =
            decode_stream_line(r#"{"type":"assistant","message":{"content":"hi"}}"#).unwrap();
        assert_eq!(
            decoded.events,
            vec![ProviderEvent::ContentDelta { text: "hi".into() }]
        );
    }

    #[test]
    fn user_tool_result() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#;
        let decoded = decode_stream_line(line).unwrap();
        assert_matches!(
            &decoded.events[..],
            [ProviderEvent::ToolResult { payload }] if payload["toolUseId"] == "t1" && payload["content"] == "ok"
        );
    }

    #[test]
    fn result_success_ends_turn() {
        let decoded =
            decode_stream_line(r#"{"type":"result","subtype":"success","is_error":false}"#).unwrap();
        assert!(decoded.end_of_turn);
        assert!(decoded.events.is_empty());
    }

    #[test]
    fn result_error_emits_error_event() {
        let decoded = decode_stream_line(
            r#"{"type":"result","subtype":"error_during_execution","is_error":true}"#,
        )
        .unwrap();
        assert!(decoded.end_of_turn);
        assert_eq!(
            decoded.events,
            vec![ProviderEvent::Error {
                message: "error_during_execution".into()
            }]
        );
        assert!(decoded.events[0].is_terminal());
    }

    #[test]
    fn unknown_type_decodes_to_nothing() {
        let decoded = decode_stream_line(r#"{"type":"stream_event","event":{}}"#).unwrap();
        assert_eq!(decoded, StreamLine::default());
    }

    #[test]
    fn invalid_lines_error() {
        assert_matches!(decode_stream_line("not json"), Err(DecodeError::Json(_)));
        assert_matches!(decode_stream_line(r#"{"no_type":1}"#), Err(DecodeError::Json(_)));
        assert_matches!(decode_stream_line("   "), Err(DecodeError::Empty));
    }

    #[test]
    fn provider_event_serde_tag() {
        let json = serde_json::to_value(ProviderEvent::ContentDelta { text: "x".into() }).unwrap();
        assert_eq!(json["type"], "content_delta");
        assert_eq!(json["text"], "x");
    }
}
