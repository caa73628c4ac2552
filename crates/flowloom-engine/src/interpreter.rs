use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowloom_core::config::InterpreterConfig;
use flowloom_core::control::ControlMessage;
use flowloom_core::definition::{Node, WorkflowDefinition};
use flowloom_core::error::Result;
use flowloom_core::event::FlowEvent;
use flowloom_core::traits::{EmptyCatalog, EventSink, ScriptCatalog};
use flowloom_core::vars::StoreVars;

use crate::condition::choose_edge;
use crate::sandbox::ScriptSandbox;

/// How a traversal ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached a node with no chosen edge, or the definition had nothing to do.
    Completed,
    /// Stopped by an abort request.
    Aborted,
}

/// Result of one traversal.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Final variable snapshot.
    pub vars: StoreVars,
    /// Last node that emitted `node_start`.
    pub last_node_id: Option<String>,
    /// Number of nodes visited.
    pub steps: usize,
}

/// Walks one graph instance from its start node to a terminal node.
///
/// The interpreter owns its vars and its view of the definition. Everything
/// from outside arrives through the control channel and is applied at the
/// next suspension point; abort is a [`CancellationToken`] shared with
/// whoever started the run.
pub struct Interpreter {
    definition: WorkflowDefinition,
    vars: StoreVars,
    sandbox: ScriptSandbox,
    catalog: Arc<dyn ScriptCatalog>,
    sink: Arc<dyn EventSink>,
    config: InterpreterConfig,
    control: Option<mpsc::Receiver<ControlMessage>>,
    cancel: CancellationToken,
}

impl Interpreter {
    pub fn new(
        definition: WorkflowDefinition,
        vars: StoreVars,
        sandbox: ScriptSandbox,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            definition,
            vars,
            sandbox,
            catalog: Arc::new(EmptyCatalog),
            sink,
            config: InterpreterConfig::default(),
            control: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ScriptCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_control(mut self, control: mpsc::Receiver<ControlMessage>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts this interpreter when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the traversal to completion.
    ///
    /// `workflow_complete` is emitted on every exit path.
    pub async fn run(mut self) -> Result<RunReport> {
        let mut steps = 0usize;
        let mut last_node_id = None;

        let outcome = match self.definition.start_node().map(|n| n.id.clone()) {
            None => {
                debug!("Workflow has no nodes, nothing to do");
                RunOutcome::Completed
            }
            Some(start) => self.traverse(start, &mut steps, &mut last_node_id).await,
        };

        info!(?outcome, steps, "Workflow traversal finished");
        self.emit(FlowEvent::WorkflowComplete {});

        Ok(RunReport {
            outcome,
            vars: self.vars,
            last_node_id,
            steps,
        })
    }

    async fn traverse(
        &mut self,
        start: String,
        steps: &mut usize,
        last_node_id: &mut Option<String>,
    ) -> RunOutcome {
        let mut current = start;

        loop {
            // Node boundary: apply queued edits before reading the definition.
            self.drain_control();

            let Some(node) = self.definition.node(&current).cloned() else {
                warn!(node_id = %current, "Edge target does not exist, ending run");
                return RunOutcome::Completed;
            };

            if self.config.max_steps > 0 && *steps >= self.config.max_steps {
                warn!(max_steps = self.config.max_steps, "Step limit reached, ending run");
                return RunOutcome::Completed;
            }
            *steps += 1;
            *last_node_id = Some(node.id.clone());

            debug!(node_id = %node.id, label = %node.display_label(), "Entering node");
            self.emit(FlowEvent::NodeStart {
                node_id: node.id.clone(),
            });

            if self.cancel.is_cancelled() {
                return RunOutcome::Aborted;
            }

            if let Some(script) = self.resolve_script(&node) {
                self.run_script(&node, &script).await;
            }

            if self.vars.is_waiting() {
                let reason = self.vars.wait_reason();
                info!(node_id = %node.id, reason = ?reason, "Node waiting for resume");
                self.emit(FlowEvent::NodeWait {
                    node_id: node.id.clone(),
                    reason,
                });
                if !self.wait_for_resume(&node.id).await {
                    return RunOutcome::Aborted;
                }
            }

            if !self.pause(self.config.step_delay()).await {
                return RunOutcome::Aborted;
            }

            let chosen = {
                let outgoing = self.definition.outgoing(&node.id);
                choose_edge(&outgoing, &self.vars, &node).cloned()
            };
            let Some(edge) = chosen else {
                debug!(node_id = %node.id, "No edge chosen, workflow complete");
                return RunOutcome::Completed;
            };

            debug!(edge_id = %edge.id, to = %edge.target_node_id, "Following edge");
            self.emit(FlowEvent::EdgeStart {
                edge_id: edge.id.clone(),
            });

            if !self.pause(self.config.edge_delay()).await {
                return RunOutcome::Aborted;
            }

            current = edge.target_node_id;
        }
    }

    /// The node's own script, else a catalog script matching its label.
    fn resolve_script(&self, node: &Node) -> Option<String> {
        if node.has_script() {
            return node.script_body.clone();
        }
        let found = self.catalog.lookup(node.display_label());
        if found.is_some() {
            debug!(node_id = %node.id, label = %node.display_label(), "Using catalog script");
        }
        found
    }

    async fn run_script(&mut self, node: &Node, script: &str) {
        let vars = std::mem::take(&mut self.vars);
        let outcome = self
            .sandbox
            .execute(&node.id, script, vars, self.sink.clone())
            .await;
        self.vars = outcome.vars;

        if let Some(error) = outcome.error {
            self.vars
                .set(&StoreVars::error_key(&node.id), Value::String(error.clone()));
            self.emit(FlowEvent::NodeError {
                node_id: node.id.clone(),
                error,
            });
            self.emit_vars();
        }
    }

    /// Block until `resume` for `node_id`. Returns `false` on abort or when
    /// the control channel is gone.
    async fn wait_for_resume(&mut self, node_id: &str) -> bool {
        let cancel = self.cancel.clone();
        let Some(mut rx) = self.control.take() else {
            // Nobody can resume us; only abort ends the wait.
            cancel.cancelled().await;
            return false;
        };

        let resumed = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break false,
                msg = rx.recv() => match msg {
                    None => {
                        warn!(node_id = %node_id, "Control channel closed while waiting");
                        break false;
                    }
                    Some(ControlMessage::Resume { node_id: id }) if id == node_id => {
                        info!(node_id = %node_id, "Resuming");
                        break true;
                    }
                    Some(other) => self.apply(other),
                },
            }
        };

        self.control = Some(rx);
        if resumed {
            self.vars.clear_wait();
            self.emit_vars();
        }
        resumed && !cancel.is_cancelled()
    }

    /// Sleep for `delay` while still consuming control messages.
    /// Returns `false` if aborted.
    async fn pause(&mut self, delay: Duration) -> bool {
        let cancel = self.cancel.clone();
        if cancel.is_cancelled() {
            return false;
        }
        let Some(mut rx) = self.control.take() else {
            return tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
        };

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut open = true;

        let finished = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break false,
                msg = rx.recv(), if open => match msg {
                    Some(msg) => self.apply(msg),
                    None => open = false,
                },
                _ = &mut sleep => break true,
            }
        };

        self.control = Some(rx);
        finished && !cancel.is_cancelled()
    }

    fn drain_control(&mut self) {
        let Some(mut rx) = self.control.take() else {
            return;
        };
        while let Ok(msg) = rx.try_recv() {
            self.apply(msg);
        }
        self.control = Some(rx);
    }

    fn apply(&mut self, msg: ControlMessage) {
        debug!(event = msg.name(), "Applying control message");
        match msg {
            ControlMessage::StopWorkflow => self.cancel.cancel(),
            ControlMessage::Resume { node_id } => {
                debug!(node_id = %node_id, "Resume for a node that is not waiting, ignored");
            }
            ControlMessage::UpdateStoreVars { vars } => {
                self.vars.replace(vars);
                self.emit_vars();
            }
            ControlMessage::UpdateWorkflow { nodes, edges } => {
                self.definition.apply_update(nodes, edges);
            }
        }
    }

    fn emit_vars(&self) {
        self.emit(FlowEvent::StoreVarsUpdate {
            vars: self.vars.clone(),
        });
    }

    fn emit(&self, event: FlowEvent) {
        self.sink.emit(event);
    }
}
