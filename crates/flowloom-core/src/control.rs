use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::{Edge, Node};
use crate::error::{FlowloomError, Result};
use crate::vars::StoreVars;

/// External influence on a running interpreter.
///
/// Delivered as a message and consumed by the owning task at its next
/// suspension point; nothing outside that task mutates run state directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ControlMessage {
    StopWorkflow,
    Resume { node_id: String },
    /// Full replace, not merge.
    UpdateStoreVars { vars: StoreVars },
    /// Partial replace: a missing field keeps its prior value.
    UpdateWorkflow {
        #[serde(default)]
        nodes: Option<Vec<Node>>,
        #[serde(default)]
        edges: Option<Vec<Edge>>,
    },
}

impl ControlMessage {
    pub const EVENTS: [&'static str; 4] =
        ["stop_workflow", "resume", "update_store_vars", "update_workflow"];

    /// Build a message from a transport-level `(event, payload)` pair.
    pub fn from_parts(event: &str, payload: Value) -> Result<Self> {
        if !Self::EVENTS.contains(&event) {
            return Err(FlowloomError::UnknownControlEvent(event.to_string()));
        }
        if event == "stop_workflow" {
            return Ok(Self::StopWorkflow);
        }
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        serde_json::from_value(serde_json::json!({ "event": event, "payload": payload }))
            .map_err(|e| FlowloomError::InvalidPayload {
                event: event.to_string(),
                message: e.to_string(),
            })
    }

    /// Parse a line typed at a terminal.
    ///
    /// Accepts a JSON object `{"event": ..., "payload": ...}` or the
    /// shorthands `resume <nodeId>` and `stop`. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.starts_with('{') {
            let value: Value =
                serde_json::from_str(line).map_err(|e| FlowloomError::InvalidPayload {
                    event: "control".to_string(),
                    message: e.to_string(),
                })?;
            let event = value.get("event").and_then(Value::as_str).ok_or_else(|| {
                FlowloomError::InvalidPayload {
                    event: "control".to_string(),
                    message: "missing `event`".to_string(),
                }
            })?;
            let payload = value.get("payload").cloned().unwrap_or(Value::Null);
            return Self::from_parts(event, payload).map(Some);
        }

        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => Ok(None),
            (Some("stop"), None) => Ok(Some(Self::StopWorkflow)),
            (Some("resume"), Some(node_id)) => Ok(Some(Self::Resume {
                node_id: node_id.to_string(),
            })),
            (Some(word), _) => Err(FlowloomError::UnknownControlEvent(word.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StopWorkflow => "stop_workflow",
            Self::Resume { .. } => "resume",
            Self::UpdateStoreVars { .. } => "update_store_vars",
            Self::UpdateWorkflow { .. } => "update_workflow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_parts_resume() {
        let msg = ControlMessage::from_parts("resume", json!({"nodeId": "A"})).unwrap();
        assert_eq!(msg, ControlMessage::Resume { node_id: "A".into() });
    }

    #[test]
    fn test_from_parts_stop_ignores_payload() {
        let msg = ControlMessage::from_parts("stop_workflow", Value::Null).unwrap();
        assert_eq!(msg, ControlMessage::StopWorkflow);
    }

    #[test]
    fn test_from_parts_partial_workflow_update() {
        let msg = ControlMessage::from_parts(
            "update_workflow",
            json!({"edges": [{"id": "e", "sourceNodeId": "a", "targetNodeId": "b"}]}),
        )
        .unwrap();
        match msg {
            ControlMessage::UpdateWorkflow { nodes, edges } => {
                assert!(nodes.is_none());
                assert_eq!(edges.map(|e| e.len()), Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_from_parts_vars_are_normalized() {
        let msg =
            ControlMessage::from_parts("update_store_vars", json!({"vars": {"Total Count": 3}}))
                .unwrap();
        match msg {
            ControlMessage::UpdateStoreVars { vars } => {
                assert_eq!(vars.get("total_count"), Some(&json!(3)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_from_parts_errors() {
        assert!(matches!(
            ControlMessage::from_parts("explode", Value::Null),
            Err(FlowloomError::UnknownControlEvent(_))
        ));
        assert!(matches!(
            ControlMessage::from_parts("resume", json!({"wrong": 1})),
            Err(FlowloomError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(ControlMessage::parse_line("  ").unwrap(), None);
        assert_eq!(
            ControlMessage::parse_line("resume A").unwrap(),
            Some(ControlMessage::Resume { node_id: "A".into() })
        );
        assert_eq!(
            ControlMessage::parse_line("stop").unwrap(),
            Some(ControlMessage::StopWorkflow)
        );
        let line = r#"{"event": "update_store_vars", "payload": {"vars": {"x": 1}}}"#;
        match ControlMessage::parse_line(line).unwrap() {
            Some(ControlMessage::UpdateStoreVars { vars }) => {
                assert_eq!(vars.get("x"), Some(&json!(1)))
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            ControlMessage::parse_line("resume"),
            Err(FlowloomError::UnknownControlEvent(_))
        ));
        assert!(matches!(
            ControlMessage::parse_line(r#"{"payload": {}}"#),
            Err(FlowloomError::InvalidPayload { .. })
        ));
    }
}
