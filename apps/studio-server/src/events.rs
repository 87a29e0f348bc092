// [[STUDIO]]/apps/studio-server/src/events.rs
// Purpose: Event definitions for the run stream consumed by the studio viewer.
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminated payload of a run event. Serialized with an `event_type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    /// A step began executing
    NodeStart { node_id: String },
    /// A step finished executing
    NodeEnd { node_id: String },
    /// A transition was taken. `target_node_id` is `None` when only a
    /// dynamically chosen successor is known.
    EdgeTaken {
        source_node_id: String,
        target_node_id: Option<String>,
    },
    /// A step started a side-effecting sub-operation
    ToolCall {
        node_id: String,
        tool_name: String,
        call_id: String,
        arguments: Value,
    },
    /// The sub-operation identified by `call_id` returned
    ToolResult {
        node_id: String,
        tool_name: String,
        call_id: String,
        output: Value,
        #[serde(default = "default_success")]
        success: bool,
    },
    /// A step is suspended waiting for an external decision
    InputRequest {
        node_id: String,
        request_id: String,
        prompt: String,
        options: Vec<String>,
        #[serde(default)]
        context: Option<Value>,
    },
    /// The decision for `request_id` arrived
    InputResponse {
        node_id: String,
        request_id: String,
        response: String,
    },
    /// Terminal: the run reached its end
    RunEnd,
    /// Terminal: the run aborted
    Error {
        message: String,
        #[serde(default)]
        node_id: Option<String>,
    },
}

fn default_success() -> bool {
    true
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::RunEnd | EventKind::Error { .. })
    }

    /// Wire name of the variant, as written in the `event_type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::NodeStart { .. } => "node_start",
            EventKind::NodeEnd { .. } => "node_end",
            EventKind::EdgeTaken { .. } => "edge_taken",
            EventKind::ToolCall { .. } => "tool_call",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::InputRequest { .. } => "input_request",
            EventKind::InputResponse { .. } => "input_response",
            EventKind::RunEnd => "run_end",
            EventKind::Error { .. } => "error",
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            EventKind::NodeStart { node_id }
            | EventKind::NodeEnd { node_id }
            | EventKind::ToolCall { node_id, .. }
            | EventKind::ToolResult { node_id, .. }
            | EventKind::InputRequest { node_id, .. }
            | EventKind::InputResponse { node_id, .. } => Some(node_id),
            EventKind::EdgeTaken { source_node_id, .. } => Some(source_node_id),
            EventKind::Error { node_id, .. } => node_id.as_deref(),
            EventKind::RunEnd => None,
        }
    }

    pub fn error(message: impl Into<String>, node_id: Option<String>) -> Self {
        EventKind::Error {
            message: message.into(),
            node_id,
        }
    }
}

/// One entry of a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeEvent {
    pub run_id: String,
    /// Position in the run's stream, starting at 0
    pub seq: u64,
    pub timestamp: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RuntimeEvent {
    pub fn new(run_id: &str, seq: u64, kind: EventKind) -> Self {
        Self {
            run_id: run_id.to_string(),
            seq,
            timestamp: Utc::now().to_rfc3339(),
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_with_event_type_tag() {
        let event = RuntimeEvent::new(
            "run-1",
            3,
            EventKind::EdgeTaken {
                source_node_id: "First".to_string(),
                target_node_id: None,
            },
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event_type"], "edge_taken");
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["source_node_id"], "First");
        assert!(value["target_node_id"].is_null());
    }

    #[test]
    fn test_run_end_has_no_payload_fields() {
        let value = serde_json::to_value(RuntimeEvent::new("r", 0, EventKind::RunEnd)).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<_> = object.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["event_type", "run_id", "seq", "timestamp"]);
    }

    #[test]
    fn test_tool_result_success_defaults_to_true() {
        let raw = json!({
            "run_id": "r",
            "seq": 1,
            "timestamp": "2024-01-01T00:00:00Z",
            "event_type": "tool_result",
            "node_id": "CallTool",
            "tool_name": "lookup",
            "call_id": "c1",
            "output": "ok"
        });
        let event: RuntimeEvent = serde_json::from_value(raw).unwrap();
        match event.kind {
            EventKind::ToolResult { success, .. } => assert!(success),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_terminal_variants() {
        assert!(EventKind::RunEnd.is_terminal());
        assert!(EventKind::error("boom", None).is_terminal());
        assert!(!EventKind::NodeStart { node_id: "a".into() }.is_terminal());
        assert_eq!(EventKind::error("boom", Some("A".into())).node_id(), Some("A"));
    }
}
