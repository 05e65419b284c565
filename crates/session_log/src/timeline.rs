use serde::Serialize;
use serde_json::Value;

const USER_TEXT_LIMIT: usize = 4_000;
const ASSISTANT_TEXT_LIMIT: usize = 6_000;
const REASONING_TEXT_LIMIT: usize = 2_000;
const TOOL_ARGS_LIMIT: usize = 1_800;
const TOOL_OUTPUT_LIMIT: usize = 2_200;

/// UI category of a timeline item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TimelineItemKind {
    Status,
    User,
    Assistant,
    Reasoning,
    ToolCall,
    ToolResult,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    #[serde(rename = "type")]
    pub kind: TimelineItemKind,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub text: String,
    pub raw_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Parses session-file lines into UI timeline items.
///
/// Line-oriented and lossy on purpose: unparsable lines and unknown
/// record types are skipped. Tracks the active turn id from any payload
/// that carries one, clears it when a matching `task_complete` or
/// `turn_aborted` arrives, collapses identical consecutive items, and
/// returns the most recent `limit` items.
pub fn parse_timeline<I, S>(lines: I, thread_id: &str, limit: usize) -> Vec<TimelineItem>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut items: Vec<TimelineItem> = Vec::new();
    let mut active_turn_id: Option<String> = None;

    for line in lines {
        let line = line.as_ref();
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        let record_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);
        let timestamp = value
            .get("timestamp")
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        // Terminal events compare against the turn that was active
        // before this line, not the id the line itself just set.
        let previous_turn_id = active_turn_id.clone();
        if let Some(turn_id) = payload.get("turn_id").and_then(Value::as_str) {
            active_turn_id = Some(turn_id.to_string());
        }

        let item = match record_type {
            "event_msg" => event_msg_item(
                &payload,
                thread_id,
                &mut active_turn_id,
                previous_turn_id,
                timestamp,
            ),
            "response_item" => response_item(&payload, thread_id, &active_turn_id, timestamp),
            _ => None,
        };

        let Some(item) = item else { continue };

        // Collapse identical consecutive items.
        if let Some(last) = items.last() {
            if last.kind == item.kind
                && last.turn_id == item.turn_id
                && last.text == item.text
                && last.raw_type == item.raw_type
            {
                continue;
            }
        }
        items.push(item);
    }

    if items.len() > limit {
        items.split_off(items.len() - limit)
    } else {
        items
    }
}

fn event_msg_item(
    payload: &Value,
    thread_id: &str,
    active_turn_id: &mut Option<String>,
    previous_turn_id: Option<String>,
    timestamp: Option<String>,
) -> Option<TimelineItem> {
    let payload_type = payload.get("type").and_then(Value::as_str)?;
    let turn_id = active_turn_id.clone();

    let item = match payload_type {
        "task_started" => status_item(thread_id, payload_type, turn_id, timestamp),
        "task_complete" | "turn_aborted" => {
            let item = status_item(thread_id, payload_type, turn_id, timestamp);
            // Clear tracking only when the terminal names the turn that
            // was active before this line (or names none at all). A
            // stale terminal for an older turn leaves the newer one
            // tracked.
            let ended = payload.get("turn_id").and_then(Value::as_str);
            match (ended, previous_turn_id) {
                (Some(ended), Some(previous)) if ended != previous => {
                    *active_turn_id = Some(previous);
                }
                _ => *active_turn_id = None,
            }
            item
        }
        "user_message" => text_item(
            TimelineItemKind::User,
            thread_id,
            payload_type,
            payload.get("message"),
            turn_id,
            timestamp,
            USER_TEXT_LIMIT,
        )?,
        "agent_message" => text_item(
            TimelineItemKind::Assistant,
            thread_id,
            payload_type,
            payload.get("message"),
            turn_id,
            timestamp,
            ASSISTANT_TEXT_LIMIT,
        )?,
        "agent_reasoning" => text_item(
            TimelineItemKind::Reasoning,
            thread_id,
            payload_type,
            payload.get("text"),
            turn_id,
            timestamp,
            REASONING_TEXT_LIMIT,
        )?,
        _ => return None,
    };
    Some(item)
}

fn response_item(
    payload: &Value,
    thread_id: &str,
    active_turn_id: &Option<String>,
    timestamp: Option<String>,
) -> Option<TimelineItem> {
    let payload_type = payload.get("type").and_then(Value::as_str)?;
    let turn_id = active_turn_id.clone();

    match payload_type {
        "function_call" | "custom_tool_call" => {
            let name = payload
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("tool");
            let args = payload
                .get("arguments")
                .or_else(|| payload.get("input"))
                .map(value_text)
                .unwrap_or_default();
            Some(TimelineItem {
                kind: TimelineItemKind::ToolCall,
                thread_id: thread_id.to_string(),
                turn_id,
                text: format!("{name}({})", truncate(&args, TOOL_ARGS_LIMIT)),
                raw_type: payload_type.to_string(),
                timestamp,
            })
        }
        "local_shell_call" => {
            let command = payload
                .get("action")
                .and_then(|action| action.get("command"))
                .map(value_text)
                .unwrap_or_default();
            Some(TimelineItem {
                kind: TimelineItemKind::ToolCall,
                thread_id: thread_id.to_string(),
                turn_id,
                text: format!("shell({})", truncate(&command, TOOL_ARGS_LIMIT)),
                raw_type: payload_type.to_string(),
                timestamp,
            })
        }
        "function_call_output" | "custom_tool_call_output" => {
            let output = payload.get("output").map(value_text).unwrap_or_default();
            Some(TimelineItem {
                kind: TimelineItemKind::ToolResult,
                thread_id: thread_id.to_string(),
                turn_id,
                text: truncate(&output, TOOL_OUTPUT_LIMIT),
                raw_type: payload_type.to_string(),
                timestamp,
            })
        }
        _ => None,
    }
}

fn status_item(
    thread_id: &str,
    payload_type: &str,
    turn_id: Option<String>,
    timestamp: Option<String>,
) -> TimelineItem {
    TimelineItem {
        kind: TimelineItemKind::Status,
        thread_id: thread_id.to_string(),
        turn_id,
        text: payload_type.to_string(),
        raw_type: payload_type.to_string(),
        timestamp,
    }
}

#[allow(clippy::too_many_arguments)]
fn text_item(
    kind: TimelineItemKind,
    thread_id: &str,
    payload_type: &str,
    raw: Option<&Value>,
    turn_id: Option<String>,
    timestamp: Option<String>,
    limit: usize,
) -> Option<TimelineItem> {
    let text = raw.map(value_text)?;
    Some(TimelineItem {
        kind,
        thread_id: thread_id.to_string(),
        turn_id,
        text: truncate(&text, limit),
        raw_type: payload_type.to_string(),
        timestamp,
    })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{truncated}…")
}
