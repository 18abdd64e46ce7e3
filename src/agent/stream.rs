//! Output normaliser — pure functions from a raw agent stdout line to a
//! typed log line plus optional item events.
//!
//! Keeping this free of I/O makes every adapter's protocol quirks testable
//! without spawning a process.

use serde_json::Value;

use crate::store::LineType;

/// Upper bound on one stdout line. Longer lines are truncated and surfaced
/// as `agent.unparsed`.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Sentinel tool calls the agents use to signal their terminal intent
/// before the process exits.
pub const SENTINEL_COMPLETE: &str = "workflow_complete";
pub const SENTINEL_NEEDS_INPUT: &str = "workflow_needs_input";

#[derive(Debug, Clone, PartialEq)]
pub enum Sentinel {
    Complete { summary: String },
    NeedsInput { question: String },
}

/// One canonical item event derived from a structured protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    Started { kind: String, detail: Value },
    Delta { kind: String, detail: Value },
    Completed { kind: String, detail: Value },
    Unparsed { location: String, raw: String },
}

/// The normalised form of one stdout line.
#[derive(Debug, Clone)]
pub struct Normalised {
    pub line_type: LineType,
    pub content: String,
    pub events: Vec<ItemEvent>,
    pub session_id: Option<String>,
    pub sentinel: Option<Sentinel>,
}

impl Normalised {
    fn log(line_type: LineType, content: impl Into<String>) -> Self {
        Self {
            line_type,
            content: content.into(),
            events: Vec::new(),
            session_id: None,
            sentinel: None,
        }
    }

    fn unparsed(adapter: &str, raw: &str) -> Self {
        let mut n = Self::log(LineType::System, raw);
        n.events.push(ItemEvent::Unparsed {
            location: format!("{adapter} stdout"),
            raw: truncate(raw, 512).to_string(),
        });
        n
    }
}

/// Normalise one raw stdout line from the named adapter.
pub fn normalise(adapter_id: &str, raw: &str) -> Normalised {
    match adapter_id {
        "codex" => normalise_codex(raw),
        _ => normalise_claude(raw),
    }
}

// ─── Claude stream-json ───────────────────────────────────────────────────────

fn normalise_claude(raw: &str) -> Normalised {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Normalised::unparsed("claude", raw);
    };

    match value.get("type").and_then(Value::as_str) {
        Some("system") => {
            let mut n = Normalised::log(
                LineType::System,
                value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .map(|s| format!("agent session: {s}"))
                    .unwrap_or_else(|| "agent session event".to_string()),
            );
            n.session_id = value
                .get("session_id")
                .and_then(Value::as_str)
                .map(String::from);
            n
        }
        Some("assistant") => normalise_claude_assistant(&value, raw),
        // Tool results come back wrapped in a user-role message.
        Some("user") => normalise_claude_user(&value, raw),
        Some("tool_use") => {
            let name = value.get("name").and_then(Value::as_str).unwrap_or("");
            let input = value.get("input").cloned().unwrap_or(Value::Null);
            let mut n = Normalised::log(LineType::Tool, format!("tool call: {name}"));
            n.sentinel = sentinel_for(name, &input);
            n.events.push(ItemEvent::Started {
                kind: "tool_call".into(),
                detail: serde_json::json!({ "name": name, "arguments": input }),
            });
            n
        }
        Some("tool_result") => {
            let content = value.get("content").cloned().unwrap_or(Value::Null);
            let mut n = Normalised::log(
                LineType::Tool,
                format!("tool result: {}", truncate(&content.to_string(), 200)),
            );
            n.events.push(ItemEvent::Completed {
                kind: "tool_call".into(),
                detail: serde_json::json!({
                    "tool_use_id": value.get("tool_use_id").cloned().unwrap_or(Value::Null),
                    "output": content,
                }),
            });
            n
        }
        Some("result") => {
            let text = value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let mut n = Normalised::log(LineType::Output, text.clone());
            n.events.push(ItemEvent::Completed {
                kind: "message".into(),
                detail: serde_json::json!({
                    "text": text,
                    "is_error": value.get("is_error").cloned().unwrap_or(Value::Bool(false)),
                }),
            });
            n
        }
        _ => Normalised::unparsed("claude", raw),
    }
}

fn normalise_claude_assistant(value: &Value, raw: &str) -> Normalised {
    let blocks = value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut texts = Vec::new();
    let mut events = Vec::new();
    let mut sentinel = None;
    let mut line_type = LineType::Text;

    for block in &blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    texts.push(t.to_string());
                    events.push(ItemEvent::Delta {
                        kind: "message".into(),
                        detail: serde_json::json!({ "text": t }),
                    });
                }
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                if sentinel.is_none() {
                    sentinel = sentinel_for(name, &input);
                }
                line_type = LineType::Tool;
                texts.push(format!("tool call: {name}"));
                events.push(ItemEvent::Started {
                    kind: "tool_call".into(),
                    detail: serde_json::json!({ "name": name, "arguments": input }),
                });
            }
            _ => {}
        }
    }

    if texts.is_empty() {
        return Normalised::unparsed("claude", raw);
    }
    Normalised {
        line_type,
        content: texts.join("\n"),
        events,
        session_id: None,
        sentinel,
    }
}

fn normalise_claude_user(value: &Value, raw: &str) -> Normalised {
    let blocks = value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut texts = Vec::new();
    let mut events = Vec::new();
    for block in &blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
            let content = block.get("content").cloned().unwrap_or(Value::Null);
            texts.push(format!(
                "tool result: {}",
                truncate(&content.to_string(), 200)
            ));
            events.push(ItemEvent::Completed {
                kind: "tool_call".into(),
                detail: serde_json::json!({
                    "tool_use_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                    "output": content,
                }),
            });
        }
    }

    if texts.is_empty() {
        return Normalised::unparsed("claude", raw);
    }
    Normalised {
        line_type: LineType::Tool,
        content: texts.join("\n"),
        events,
        session_id: None,
        sentinel: None,
    }
}

// ─── Codex jsonl ──────────────────────────────────────────────────────────────

fn normalise_codex(raw: &str) -> Normalised {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Normalised::unparsed("codex", raw);
    };

    match value.get("type").and_then(Value::as_str) {
        Some("thread.started") => {
            let mut n = Normalised::log(LineType::System, "agent thread started");
            n.session_id = value
                .get("thread_id")
                .and_then(Value::as_str)
                .map(String::from);
            n
        }
        Some("turn.started") => Normalised::log(LineType::System, "turn started"),
        Some("turn.completed") => Normalised::log(LineType::Output, "turn completed"),
        Some(t @ ("item.started" | "item.updated" | "item.completed")) => {
            let item = value.get("item").cloned().unwrap_or(Value::Null);
            let kind = item
                .get("item_type")
                .or_else(|| item.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("item")
                .to_string();

            let mut n = match kind.as_str() {
                "agent_message" => Normalised::log(
                    LineType::Text,
                    item.get("text").and_then(Value::as_str).unwrap_or(""),
                ),
                "command_execution" => Normalised::log(
                    LineType::Tool,
                    format!(
                        "$ {}",
                        item.get("command").and_then(Value::as_str).unwrap_or("")
                    ),
                ),
                "error" => Normalised::log(
                    LineType::Error,
                    item.get("message").and_then(Value::as_str).unwrap_or(""),
                ),
                _ => Normalised::log(LineType::Tool, format!("{kind} {t}")),
            };

            if kind == "tool_call" || kind == "mcp_tool_call" {
                let name = item.get("name").and_then(Value::as_str).unwrap_or("");
                let input = item.get("arguments").cloned().unwrap_or(Value::Null);
                n.sentinel = sentinel_for(name, &input);
            }

            let event = match t {
                "item.started" => ItemEvent::Started {
                    kind: kind.clone(),
                    detail: item,
                },
                "item.updated" => ItemEvent::Delta {
                    kind: kind.clone(),
                    detail: item,
                },
                _ => ItemEvent::Completed {
                    kind: kind.clone(),
                    detail: item,
                },
            };
            n.events.push(event);
            n
        }
        Some("error") => Normalised::log(
            LineType::Error,
            value.get("message").and_then(Value::as_str).unwrap_or(raw),
        ),
        _ => Normalised::unparsed("codex", raw),
    }
}

// ─── Shared ───────────────────────────────────────────────────────────────────

fn sentinel_for(tool_name: &str, input: &Value) -> Option<Sentinel> {
    match tool_name {
        SENTINEL_COMPLETE => Some(Sentinel::Complete {
            summary: input
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        }),
        SENTINEL_NEEDS_INPUT => Some(Sentinel::NeedsInput {
            question: input
                .get("question")
                .or_else(|| input.get("prompt"))
                .and_then(Value::as_str)
                .unwrap_or("agent requested input")
                .to_string(),
        }),
        _ => None,
    }
}

pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_system_init_captures_session() {
        let raw = json!({"type": "system", "subtype": "init", "session_id": "sess-1"});
        let n = normalise("claude", &raw.to_string());
        assert_eq!(n.line_type, LineType::System);
        assert_eq!(n.session_id.as_deref(), Some("sess-1"));
        assert!(n.events.is_empty());
    }

    #[test]
    fn claude_assistant_text_is_delta() {
        let raw = json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": [{"type": "text", "text": "hello"}]}
        });
        let n = normalise("claude", &raw.to_string());
        assert_eq!(n.line_type, LineType::Text);
        assert_eq!(n.content, "hello");
        assert!(matches!(n.events[0], ItemEvent::Delta { .. }));
    }

    #[test]
    fn claude_tool_use_starts_tool_call() {
        let raw = json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": [
                {"type": "tool_use", "name": "bash", "input": {"command": "ls"}}
            ]}
        });
        let n = normalise("claude", &raw.to_string());
        assert_eq!(n.line_type, LineType::Tool);
        assert!(matches!(n.events[0], ItemEvent::Started { .. }));
        assert!(n.sentinel.is_none());
    }

    #[test]
    fn claude_tool_result_in_user_message() {
        let raw = json!({
            "type": "user",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "tu_1", "content": "file list"}
            ]}
        });
        let n = normalise("claude", &raw.to_string());
        assert_eq!(n.line_type, LineType::Tool);
        assert!(n.content.contains("file list"));
        assert!(matches!(n.events[0], ItemEvent::Completed { .. }));
    }

    #[test]
    fn claude_result_completes_message() {
        let raw = json!({"type": "result", "subtype": "success", "result": "all done"});
        let n = normalise("claude", &raw.to_string());
        assert_eq!(n.line_type, LineType::Output);
        assert_eq!(n.content, "all done");
        assert!(matches!(n.events[0], ItemEvent::Completed { .. }));
    }

    #[test]
    fn complete_sentinel_detected() {
        let raw = json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": [
                {"type": "tool_use", "name": "workflow_complete", "input": {"summary": "shipped"}}
            ]}
        });
        let n = normalise("claude", &raw.to_string());
        assert_eq!(
            n.sentinel,
            Some(Sentinel::Complete {
                summary: "shipped".into()
            })
        );
    }

    #[test]
    fn needs_input_sentinel_carries_question() {
        let raw = json!({
            "type": "tool_use",
            "name": "workflow_needs_input",
            "input": {"question": "choose A or B"}
        });
        let n = normalise("claude", &raw.to_string());
        assert_eq!(
            n.sentinel,
            Some(Sentinel::NeedsInput {
                question: "choose A or B".into()
            })
        );
    }

    #[test]
    fn unknown_kind_is_unparsed() {
        let n = normalise("claude", r#"{"type": "telemetry", "x": 1}"#);
        assert!(matches!(n.events[0], ItemEvent::Unparsed { .. }));
    }

    #[test]
    fn non_json_is_unparsed() {
        let n = normalise("claude", "plain text progress...");
        assert_eq!(n.line_type, LineType::System);
        assert!(matches!(n.events[0], ItemEvent::Unparsed { .. }));
    }

    #[test]
    fn codex_thread_started_captures_session() {
        let raw = json!({"type": "thread.started", "thread_id": "th-9"});
        let n = normalise("codex", &raw.to_string());
        assert_eq!(n.session_id.as_deref(), Some("th-9"));
    }

    #[test]
    fn codex_agent_message_is_text() {
        let raw = json!({
            "type": "item.completed",
            "item": {"type": "agent_message", "text": "working on it"}
        });
        let n = normalise("codex", &raw.to_string());
        assert_eq!(n.line_type, LineType::Text);
        assert_eq!(n.content, "working on it");
        assert!(matches!(n.events[0], ItemEvent::Completed { .. }));
    }

    #[test]
    fn codex_command_execution_is_tool() {
        let raw = json!({
            "type": "item.started",
            "item": {"type": "command_execution", "command": "cargo test"}
        });
        let n = normalise("codex", &raw.to_string());
        assert_eq!(n.line_type, LineType::Tool);
        assert_eq!(n.content, "$ cargo test");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
    }
}
