//! Turn event stream (spec §4.1 "Event types and ordering"). Both the
//! non-stream `{reply, events[]}` result and the SSE frame payloads serialize
//! the same [`TurnEvent`] values — grounded in the teacher's `ServerEvent`
//! shape (`engine::streaming`), reworked from a shared broadcast topic into a
//! per-request sequence because the ordering/cancellation guarantees here are
//! per-turn, not process-wide.

use serde::Serialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    StepStarted {
        step: u32,
    },
    ToolCall {
        step: u32,
        id: String,
        name: String,
        arguments: JsonValue,
    },
    ToolResult {
        step: u32,
        id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<JsonValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AssistantDelta {
        step: u32,
        text: String,
    },
    Completed {
        reply: String,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Frames one event as an SSE `data:` line (spec §6 "SSE stream").
pub fn to_sse_data(event: &TurnEvent) -> String {
    format!("data: {}\n\n", serde_json::to_string(event).expect("TurnEvent serializes"))
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_started_serializes_with_tag() {
        let event = TurnEvent::StepStarted { step: 1 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_started");
        assert_eq!(json["step"], 1);
    }

    #[test]
    fn to_sse_data_wraps_in_data_line() {
        let frame = to_sse_data(&TurnEvent::Completed { reply: "hi".to_string() });
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
    }
}
