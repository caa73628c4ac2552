use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{Edge, Node, WorkflowDefinition};
use crate::vars::StoreVars;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Completed,
    Error,
}

impl RunStatus {
    /// `starting` or `running`: an interpreter is (or should be) behind it.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Bookkeeping for one run, owned by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    /// Logical project (definition reference) this run executes.
    pub project_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_vars: Option<StoreVars>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<Node>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<Edge>>,
    /// Failure message when `status == error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunRecord {
    pub fn new(
        project_id: impl Into<String>,
        definition: &WorkflowDefinition,
        vars: &StoreVars,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            project_id: project_id.into(),
            status: RunStatus::Starting,
            started_at: now,
            last_heartbeat: now,
            current_node_id: None,
            store_vars: Some(vars.clone()),
            nodes: Some(definition.nodes.clone()),
            edges: Some(definition.edges.clone()),
            message: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Copy suitable for the durable registry.
    ///
    /// Vars and the node/edge lists are only kept while the run is active.
    pub fn persisted(&self) -> RunRecord {
        let mut record = self.clone();
        if !record.status.is_active() {
            record.store_vars = None;
            record.nodes = None;
            record.edges = None;
        }
        record
    }
}

/// Severity attached to `node_log` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Outbound request issued by a node script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            json: None,
        }
    }
}

/// Response handed back to the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// Body parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Desired state of a live project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Running,
    #[default]
    Stopped,
}

/// A live project as supplied by a [`crate::traits::ProjectSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    pub id: String,
    #[serde(default)]
    pub desired_status: DesiredStatus,
    #[serde(default)]
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub vars: StoreVars,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classes() {
        assert!(RunStatus::Starting.is_active());
        assert!(RunStatus::Running.is_active());
        assert!(!RunStatus::Stopping.is_active());
        assert!(!RunStatus::Stopping.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert_eq!(RunStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_persisted_strips_terminal_records() {
        let def = WorkflowDefinition::new(vec![Node::new("a")], vec![]);
        let mut vars = StoreVars::new();
        vars.set("x", json!(1));
        let mut record = RunRecord::new("p1", &def, &vars);

        let active = record.persisted();
        assert!(active.store_vars.is_some());
        assert_eq!(active.nodes.as_ref().map(Vec::len), Some(1));

        record.status = RunStatus::Completed;
        let done = record.persisted();
        assert!(done.store_vars.is_none());
        assert!(done.nodes.is_none());
        assert!(done.edges.is_none());
        // The in-memory record keeps its final snapshot.
        assert!(record.store_vars.is_some());
    }

    #[test]
    fn test_record_wire_format() {
        let record = RunRecord::new("p1", &WorkflowDefinition::default(), &StoreVars::new());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["projectId"], "p1");
        assert_eq!(json["status"], "starting");
        assert!(json.get("runId").is_some());
        assert!(json.get("lastHeartbeat").is_some());
    }

    #[test]
    fn test_project_spec_defaults() {
        let spec: ProjectSpec = serde_json::from_value(json!({"id": "p"})).unwrap();
        assert_eq!(spec.desired_status, DesiredStatus::Stopped);
        assert!(spec.definition.is_empty());
    }
}
