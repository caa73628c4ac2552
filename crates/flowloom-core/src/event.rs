use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{LogLevel, RunId, RunStatus};
use crate::vars::StoreVars;

/// State change emitted by an interpreter or the run supervisor.
///
/// Serializes as `{"event": "<snake_case name>", "payload": {...}}` with
/// camelCase payload fields, which is the wire shape watchers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum FlowEvent {
    /// A node is about to run.
    NodeStart { node_id: String },
    /// A script wrote to its logging sink.
    NodeLog {
        node_id: String,
        level: LogLevel,
        args: Vec<Value>,
    },
    /// A script failed; the run continues.
    NodeError { node_id: String, error: String },
    /// The run is blocked until `resume {nodeId}` arrives.
    NodeWait {
        node_id: String,
        reason: Option<String>,
    },
    /// An edge was chosen and is being followed.
    EdgeStart { edge_id: String },
    /// Full snapshot after any write.
    StoreVarsUpdate { vars: StoreVars },
    /// Traversal loop exited, for any reason.
    WorkflowComplete {},
    RunStarted { run_id: RunId },
    RunCompleted { run_id: RunId },
    RunError { run_id: RunId, message: String },
    RunStopped { run_id: RunId },
    /// Synthesized for a new watcher: where the subject stands.
    CurrentStatus {
        run_id: Option<RunId>,
        status: Option<RunStatus>,
    },
    /// Synthesized for a new watcher of an active run.
    ExecutionState {
        run_id: RunId,
        current_node_id: Option<String>,
        vars: StoreVars,
    },
}

impl FlowEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeStart { .. } => "node_start",
            Self::NodeLog { .. } => "node_log",
            Self::NodeError { .. } => "node_error",
            Self::NodeWait { .. } => "node_wait",
            Self::EdgeStart { .. } => "edge_start",
            Self::StoreVarsUpdate { .. } => "store_vars_update",
            Self::WorkflowComplete {} => "workflow_complete",
            Self::RunStarted { .. } => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunError { .. } => "run_error",
            Self::RunStopped { .. } => "run_stopped",
            Self::CurrentStatus { .. } => "current_status",
            Self::ExecutionState { .. } => "execution_state",
        }
    }

    /// Payload object as it appears on the wire.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(Value::take))
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Terminal run-lifecycle event.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunError { .. } | Self::RunStopped { .. }
        )
    }
}

/// An event addressed to a subject (a run id or a project id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub subject: String,
    #[serde(flatten)]
    pub event: FlowEvent,
}

impl Envelope {
    pub fn new(subject: impl Into<String>, event: FlowEvent) -> Self {
        Self {
            subject: subject.into(),
            event,
        }
    }
}

/// Process-wide firehose of every published envelope, backed by a tokio
/// broadcast channel. All subscribers receive all envelopes.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, envelope: Envelope) {
        // Ignore error if no receivers
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
