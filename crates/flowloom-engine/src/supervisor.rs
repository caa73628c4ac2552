use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowloom_core::config::{AppConfig, InterpreterConfig};
use flowloom_core::control::ControlMessage;
use flowloom_core::definition::WorkflowDefinition;
use flowloom_core::error::{FlowloomError, Result};
use flowloom_core::event::FlowEvent;
use flowloom_core::traits::ScriptCatalog;
use flowloom_core::types::{RunRecord, RunStatus};
use flowloom_core::vars::StoreVars;

use crate::broadcast::{Broadcaster, WatcherHandle};
use crate::interpreter::{Interpreter, RunOutcome, RunReport};
use crate::journal::RunJournal;
use crate::registry::RunRegistry;
use crate::sandbox::ScriptSandbox;

struct RunHandle {
    record: RunRecord,
    /// Dropped once the run reaches a terminal status.
    control: Option<mpsc::Sender<ControlMessage>>,
    cancel: CancellationToken,
    /// Cancelled once the run's terminal event has been published.
    finished: CancellationToken,
}

impl RunHandle {
    fn restored(record: RunRecord) -> Self {
        let finished = CancellationToken::new();
        finished.cancel();
        Self {
            record,
            control: None,
            cancel: CancellationToken::new(),
            finished,
        }
    }
}

/// Tracks concurrent runs, persists their records, and routes control
/// messages to them.
///
/// The supervisor never touches a run's vars or position directly. It sees
/// them only through the run's event stream, which it forwards in order to
/// the run's subject and its project's subject.
pub struct RunSupervisor {
    runs: RwLock<HashMap<String, RunHandle>>,
    /// Serializes `start_run` so the per-project check and insert are atomic.
    start_lock: Mutex<()>,
    /// Held from snapshot to write so the file never goes back in time.
    persist_lock: Mutex<()>,
    registry: RunRegistry,
    broadcaster: Arc<Broadcaster>,
    sandbox: ScriptSandbox,
    catalog: Arc<dyn ScriptCatalog>,
    interpreter_config: InterpreterConfig,
    control_buffer: usize,
    heartbeat_interval: Duration,
    keep_finished: usize,
    journal: Option<(PathBuf, u8)>,
    shutdown: CancellationToken,
}

impl RunSupervisor {
    pub fn new(
        config: &AppConfig,
        broadcaster: Arc<Broadcaster>,
        sandbox: ScriptSandbox,
        catalog: Arc<dyn ScriptCatalog>,
    ) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            start_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
            registry: RunRegistry::new(config.supervisor.registry_path()),
            broadcaster,
            sandbox,
            catalog,
            interpreter_config: config.interpreter.clone(),
            control_buffer: config.supervisor.control_buffer.max(1),
            heartbeat_interval: config.supervisor.heartbeat_interval(),
            keep_finished: config.supervisor.keep_finished_per_project,
            journal: config
                .log
                .journal_dir()
                .map(|dir| (dir, config.log.journal_level)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    /// Reload the registry after a restart.
    ///
    /// Interrupted runs come back as `stopped` and the downgrade is written
    /// back immediately. Returns the number of records loaded.
    pub async fn restore(&self) -> usize {
        let records = match self.registry.load().await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Failed to load run registry");
                return 0;
            }
        };
        let count = records.len();
        {
            let mut runs = self.runs.write().await;
            for record in records {
                runs.insert(record.run_id.to_string(), RunHandle::restored(record));
            }
        }
        self.persist().await;
        info!(count, "Run registry restored");
        count
    }

    /// Start a run of `definition` for `project_id`.
    ///
    /// If the project already has an active run, that run's record is
    /// returned and nothing new is started. Otherwise the project's oldest
    /// finished records beyond `keep_finished_per_project` are dropped.
    pub async fn start_run(
        self: &Arc<Self>,
        project_id: &str,
        definition: WorkflowDefinition,
        vars: StoreVars,
    ) -> Result<RunRecord> {
        let _guard = self.start_lock.lock().await;

        if let Some(existing) = self.active_run_for(project_id).await {
            debug!(project_id = %project_id, run_id = %existing.run_id, "Run already active");
            return Ok(existing);
        }

        let mut record = RunRecord::new(project_id, &definition, &vars);
        let run_id = record.run_id.to_string();
        let cancel = self.shutdown.child_token();
        let finished = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(self.control_buffer);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let sink = Arc::new(event_tx);
        let interpreter = Interpreter::new(definition, vars, self.sandbox.clone(), sink)
            .with_catalog(self.catalog.clone())
            .with_config(self.interpreter_config.clone())
            .with_control(control_rx)
            .with_cancel(cancel.clone());

        record.status = RunStatus::Running;
        {
            let mut runs = self.runs.write().await;
            let pruned = prune_finished(&mut runs, project_id, self.keep_finished);
            if pruned > 0 {
                debug!(project_id = %project_id, pruned, "Dropped old finished runs");
            }
            runs.insert(
                run_id.clone(),
                RunHandle {
                    record: record.clone(),
                    control: Some(control_tx),
                    cancel,
                    finished: finished.clone(),
                },
            );
        }
        self.persist().await;

        if let Some((dir, level)) = &self.journal {
            let watcher = self.broadcaster.subscribe(&run_id, vec![]).await;
            let journal = RunJournal::new(dir.clone(), *level);
            tokio::spawn(journal.run(watcher, self.broadcaster.clone(), finished));
        }

        info!(run_id = %run_id, project_id = %project_id, "Run started");
        self.publish(
            &record,
            FlowEvent::RunStarted {
                run_id: record.run_id.clone(),
            },
        )
        .await;

        let task = tokio::spawn(interpreter.run());
        tokio::spawn(self.clone().drive(record.clone(), event_rx, task));

        Ok(record)
    }

    /// Abort a run. The record becomes `stopped` and `run_stopped` is
    /// published right away, whether or not the interpreter has noticed yet.
    pub async fn stop_run(&self, run_id: &str) -> Result<RunRecord> {
        let record = {
            let mut runs = self.runs.write().await;
            let handle = runs
                .get_mut(run_id)
                .ok_or_else(|| FlowloomError::RunNotFound(run_id.to_string()))?;
            if !handle.record.status.is_active() {
                return Ok(handle.record.clone());
            }
            handle.cancel.cancel();
            handle.record.status = RunStatus::Stopped;
            handle.record.touch();
            handle.record.clone()
        };

        info!(run_id = %run_id, "Run stopped");
        self.persist().await;
        self.publish(
            &record,
            FlowEvent::RunStopped {
                run_id: record.run_id.clone(),
            },
        )
        .await;
        Ok(record)
    }

    /// Snapshot of a run, addressed by run id or by project id (the
    /// project's active run, else its most recent one).
    pub async fn get_run_status(&self, id: &str) -> Result<RunRecord> {
        self.lookup(id)
            .await
            .ok_or_else(|| FlowloomError::RunNotFound(id.to_string()))
    }

    /// Forward a transport-level control event to a run.
    pub async fn route_control_event(
        &self,
        run_id: &str,
        event: &str,
        payload: Value,
    ) -> Result<()> {
        let msg = ControlMessage::from_parts(event, payload).map_err(|e| {
            warn!(run_id = %run_id, event = %event, error = %e, "Rejected control event");
            e
        })?;

        if msg == ControlMessage::StopWorkflow {
            return self.stop_run(run_id).await.map(|_| ());
        }

        let tx = {
            let runs = self.runs.read().await;
            let handle = runs
                .get(run_id)
                .ok_or_else(|| FlowloomError::RunNotFound(run_id.to_string()))?;
            handle
                .control
                .clone()
                .filter(|_| handle.record.status.is_active())
        };
        let Some(tx) = tx else {
            warn!(run_id = %run_id, event = %event, "Control event for inactive run dropped");
            return Err(FlowloomError::RunNotFound(run_id.to_string()));
        };

        debug!(run_id = %run_id, event = %event, "Routing control event");
        tx.send(msg)
            .await
            .map_err(|_| FlowloomError::RunNotFound(run_id.to_string()))
    }

    /// All records, newest first.
    pub async fn list_runs(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self
            .runs
            .read()
            .await
            .values()
            .map(|h| h.record.clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    /// Forget a finished run.
    pub async fn remove_run(&self, run_id: &str) -> Result<RunRecord> {
        let removed = {
            let mut runs = self.runs.write().await;
            match runs.get(run_id) {
                None => return Err(FlowloomError::RunNotFound(run_id.to_string())),
                Some(h) if h.record.status.is_active() => {
                    return Err(FlowloomError::RunActive(run_id.to_string()))
                }
                Some(_) => runs.remove(run_id).map(|h| h.record),
            }
        };
        self.persist().await;
        removed.ok_or_else(|| FlowloomError::RunNotFound(run_id.to_string()))
    }

    /// The active run of `project_id`, if any.
    pub async fn active_run_for(&self, project_id: &str) -> Option<RunRecord> {
        self.runs
            .read()
            .await
            .values()
            .find(|h| h.record.project_id == project_id && h.record.status.is_active())
            .map(|h| h.record.clone())
    }

    /// Subscribe to a run or project. The watcher first receives
    /// `current_status`, then `execution_state` if the run is active.
    pub async fn watch(&self, subject: &str) -> WatcherHandle {
        let greeting = match self.lookup(subject).await {
            Some(record) => {
                let mut events = vec![FlowEvent::CurrentStatus {
                    run_id: Some(record.run_id.clone()),
                    status: Some(record.status),
                }];
                if record.status.is_active() {
                    events.push(FlowEvent::ExecutionState {
                        run_id: record.run_id.clone(),
                        current_node_id: record.current_node_id.clone(),
                        vars: record.store_vars.clone().unwrap_or_default(),
                    });
                }
                events
            }
            None => vec![FlowEvent::CurrentStatus {
                run_id: None,
                status: None,
            }],
        };
        self.broadcaster.subscribe(subject, greeting).await
    }

    /// Stop every active run. Used on process shutdown.
    pub async fn shutdown(&self) {
        let active: Vec<String> = self
            .runs
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.record.status.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        for run_id in active {
            if let Err(e) = self.stop_run(&run_id).await {
                warn!(run_id = %run_id, error = %e, "Failed to stop run during shutdown");
            }
        }
        self.shutdown.cancel();
    }

    async fn lookup(&self, id: &str) -> Option<RunRecord> {
        let runs = self.runs.read().await;
        if let Some(handle) = runs.get(id) {
            return Some(handle.record.clone());
        }
        runs.values()
            .filter(|h| h.record.project_id == id)
            .max_by_key(|h| (h.record.status.is_active(), h.record.started_at))
            .map(|h| h.record.clone())
    }

    /// Forward one run's events in order, then settle its final status.
    ///
    /// Between events the heartbeat is refreshed on a fixed interval, so a
    /// run parked on `wait()` still shows as alive on disk.
    async fn drive(
        self: Arc<Self>,
        record: RunRecord,
        mut events: mpsc::UnboundedReceiver<FlowEvent>,
        task: JoinHandle<Result<RunReport>>,
    ) {
        let run_id = record.run_id.to_string();
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.observe(&run_id, &event).await {
                        self.persist().await;
                    }
                    self.publish(&record, event).await;
                }
                _ = heartbeat.tick() => {
                    if self.beat(&run_id).await {
                        self.persist().await;
                    }
                }
            }
        }

        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(FlowloomError::Internal(format!("interpreter task failed: {}", e))),
        };
        self.finish(&run_id, result).await;
    }

    /// Fold an event into the run's record. Returns whether to persist.
    async fn observe(&self, run_id: &str, event: &FlowEvent) -> bool {
        let mut runs = self.runs.write().await;
        let Some(handle) = runs.get_mut(run_id) else {
            return false;
        };
        let record = &mut handle.record;
        record.touch();
        match event {
            FlowEvent::NodeStart { node_id } => {
                record.current_node_id = Some(node_id.clone());
                true
            }
            FlowEvent::StoreVarsUpdate { vars } => {
                record.store_vars = Some(vars.clone());
                false
            }
            FlowEvent::NodeWait { .. } => true,
            _ => false,
        }
    }

    /// Refresh an active run's heartbeat. Returns whether to persist.
    async fn beat(&self, run_id: &str) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(handle) if handle.record.status.is_active() => {
                handle.record.touch();
                true
            }
            _ => false,
        }
    }

    async fn finish(&self, run_id: &str, result: Result<RunReport>) {
        let (record, terminal, finished) = {
            let mut runs = self.runs.write().await;
            let Some(handle) = runs.get_mut(run_id) else {
                return;
            };
            handle.control = None;
            let record = &mut handle.record;
            record.touch();

            let terminal = match result {
                Ok(report) => {
                    record.store_vars = Some(report.vars);
                    if report.last_node_id.is_some() {
                        record.current_node_id = report.last_node_id;
                    }
                    match (record.status, report.outcome) {
                        // stop_run already settled the record and announced it.
                        (RunStatus::Stopped, _) => None,
                        (_, RunOutcome::Completed) => {
                            record.status = RunStatus::Completed;
                            Some(FlowEvent::RunCompleted {
                                run_id: record.run_id.clone(),
                            })
                        }
                        (_, RunOutcome::Aborted) => {
                            record.status = RunStatus::Stopped;
                            Some(FlowEvent::RunStopped {
                                run_id: record.run_id.clone(),
                            })
                        }
                    }
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Run failed");
                    record.status = RunStatus::Error;
                    record.message = Some(e.to_string());
                    Some(FlowEvent::RunError {
                        run_id: record.run_id.clone(),
                        message: e.to_string(),
                    })
                }
            };
            (record.clone(), terminal, handle.finished.clone())
        };

        info!(run_id = %run_id, status = %record.status, "Run finished");
        self.persist().await;
        if let Some(event) = terminal {
            self.publish(&record, event).await;
        }
        finished.cancel();
    }

    async fn publish(&self, record: &RunRecord, event: FlowEvent) {
        let run_id = record.run_id.as_str();
        if record.project_id != run_id {
            self.broadcaster
                .publish(&record.project_id, event.clone())
                .await;
        }
        self.broadcaster.publish(run_id, event).await;
    }

    /// Write the whole table. Failures are logged, never propagated.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let records: Vec<RunRecord> = self
            .runs
            .read()
            .await
            .values()
            .map(|h| h.record.clone())
            .collect();
        if let Err(e) = self.registry.save(&records).await {
            error!(
                error = %e,
                path = %self.registry.path().display(),
                "Failed to persist run registry"
            );
        }
    }
}

/// Drop the oldest finished records of `project_id`, keeping `keep` of them.
fn prune_finished(runs: &mut HashMap<String, RunHandle>, project_id: &str, keep: usize) -> usize {
    let mut finished: Vec<(chrono::DateTime<chrono::Utc>, String)> = runs
        .iter()
        .filter(|(_, h)| h.record.project_id == project_id && h.record.status.is_terminal())
        .map(|(id, h)| (h.record.started_at, id.clone()))
        .collect();
    if finished.len() <= keep {
        return 0;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
    excess
}
