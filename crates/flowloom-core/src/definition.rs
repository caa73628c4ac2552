use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A step in the workflow graph.
///
/// `script_body` holds the Lua source executed when the node is visited;
/// without one the node is a pass-through unless a catalog script matches
/// its display label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_body: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script_body: None,
            config: Map::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script_body = Some(script.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.metadata
            .insert("label".to_string(), Value::String(label.into()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Label shown in the editor, falling back to the node id.
    pub fn display_label(&self) -> &str {
        ["label", "name", "title"]
            .iter()
            .find_map(|k| {
                self.metadata
                    .get(*k)
                    .or_else(|| self.config.get(*k))
                    .and_then(Value::as_str)
            })
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.id)
    }

    /// Explicit branch variable declared in metadata as `checkVar`
    /// (optionally with `checkPath`).
    pub fn check_var(&self) -> Option<(&str, Option<&str>)> {
        let var = self
            .metadata
            .get("checkVar")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())?;
        let path = self
            .metadata
            .get("checkPath")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty());
        Some((var, path))
    }

    /// Whether the node carries its own script.
    pub fn has_script(&self) -> bool {
        self.script_body
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }
}

/// A directed transition between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    #[serde(alias = "source")]
    pub source_node_id: String,
    #[serde(alias = "target")]
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    /// Create an unlabeled edge.
    pub fn new(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_node_id: from.into(),
            target_node_id: to.into(),
            label: None,
        }
    }

    /// Create a labeled edge.
    pub fn labeled(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::new(id, from, to)
        }
    }

    /// Trimmed label, or `""` when absent.
    pub fn label_text(&self) -> &str {
        self.label.as_deref().map(str::trim).unwrap_or("")
    }
}

/// Nodes plus edges: everything the interpreter needs to walk a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of `node_id`, in definition order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.source_node_id == node_id)
            .collect()
    }

    /// First node (definition order) with no incoming edge, else the first node.
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| !self.edges.iter().any(|e| e.target_node_id == n.id))
            .or_else(|| self.nodes.first())
    }

    /// Partial replace: absent parts keep their prior value.
    pub fn apply_update(&mut self, nodes: Option<Vec<Node>>, edges: Option<Vec<Edge>>) {
        if let Some(nodes) = nodes {
            self.nodes = nodes;
        }
        if let Some(edges) = edges {
            self.edges = edges;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_node_is_first_without_incoming() {
        let def = WorkflowDefinition::new(
            vec![Node::new("b"), Node::new("a"), Node::new("c")],
            vec![Edge::new("e1", "a", "b"), Edge::new("e2", "b", "c")],
        );
        assert_eq!(def.start_node().map(|n| n.id.as_str()), Some("a"));
    }

    #[test]
    fn test_start_node_falls_back_to_first_in_cycle() {
        let def = WorkflowDefinition::new(
            vec![Node::new("x"), Node::new("y")],
            vec![Edge::new("e1", "x", "y"), Edge::new("e2", "y", "x")],
        );
        assert_eq!(def.start_node().map(|n| n.id.as_str()), Some("x"));
        assert!(WorkflowDefinition::default().start_node().is_none());
    }

    #[test]
    fn test_outgoing_keeps_definition_order() {
        let def = WorkflowDefinition::new(
            vec![Node::new("a"), Node::new("b"), Node::new("c")],
            vec![
                Edge::labeled("e2", "a", "c", "else"),
                Edge::new("e3", "b", "c"),
                Edge::labeled("e1", "a", "b", "x === 1"),
            ],
        );
        let ids: Vec<_> = def.outgoing("a").iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e1"]);
    }

    #[test]
    fn test_apply_update_is_partial() {
        let mut def = WorkflowDefinition::new(vec![Node::new("a")], vec![]);
        def.apply_update(None, Some(vec![Edge::new("e", "a", "a")]));
        assert_eq!(def.nodes.len(), 1);
        assert_eq!(def.edges.len(), 1);
        def.apply_update(Some(vec![]), None);
        assert!(def.is_empty());
        assert_eq!(def.edges.len(), 1);
    }

    #[test]
    fn test_display_label_and_check_var() {
        let node = Node::new("n1")
            .with_label("If status is done")
            .with_metadata("checkVar", json!("status"))
            .with_metadata("checkPath", json!("state"));
        assert_eq!(node.display_label(), "If status is done");
        assert_eq!(node.check_var(), Some(("status", Some("state"))));
        assert_eq!(Node::new("bare").display_label(), "bare");
    }

    #[test]
    fn test_edge_wire_format() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1", "source": "a", "target": "b", "label": "else"
        }))
        .unwrap();
        assert_eq!(edge.source_node_id, "a");
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["sourceNodeId"], "a");
        assert_eq!(json["targetNodeId"], "b");
    }
}
