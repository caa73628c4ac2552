use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowloom_core::config::CoordinatorConfig;
use flowloom_core::error::{FlowloomError, Result};
use flowloom_core::traits::ProjectSource;
use flowloom_core::types::{DesiredStatus, ProjectSpec};

use crate::supervisor::RunSupervisor;

struct ProjectEntry {
    spec: ProjectSpec,
    /// Bumped whenever the definition changes.
    revision: u64,
    /// Revision the current (or last) run was started from.
    started_revision: Option<u64>,
}

/// Keeps live projects converged on their desired status.
///
/// Clients only flip a project's desired status; a single polling task
/// starts, stops and restarts runs until reality matches. Runs that finish
/// while their project is still desired `running` are started again on the
/// next tick, and a definition change stops the current run so the next
/// tick starts one from the new definition.
pub struct ProjectCoordinator {
    supervisor: Arc<RunSupervisor>,
    projects: Mutex<HashMap<String, ProjectEntry>>,
    source: Option<Arc<dyn ProjectSource>>,
    interval: Duration,
    cancel: CancellationToken,
}

/// What one tick decided for one project.
enum Action {
    Start(ProjectSpec, u64),
    Stop(String),
}

impl ProjectCoordinator {
    pub fn new(
        supervisor: Arc<RunSupervisor>,
        config: &CoordinatorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            supervisor,
            projects: Mutex::new(HashMap::new()),
            source: None,
            interval: config.poll_interval(),
            cancel,
        }
    }

    /// Reload the full project set from `source` on every tick. Projects
    /// missing from a successful load are removed.
    pub fn with_source(mut self, source: Arc<dyn ProjectSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Add or replace a project.
    pub async fn upsert_project(&self, spec: ProjectSpec) {
        let mut projects = self.projects.lock().await;
        match projects.get_mut(&spec.id) {
            Some(entry) => {
                if entry.spec.definition != spec.definition {
                    entry.revision += 1;
                    debug!(project_id = %spec.id, revision = entry.revision, "Project definition changed");
                }
                entry.spec = spec;
            }
            None => {
                debug!(project_id = %spec.id, "Project added");
                projects.insert(
                    spec.id.clone(),
                    ProjectEntry {
                        spec,
                        revision: 0,
                        started_revision: None,
                    },
                );
            }
        }
    }

    pub async fn set_desired_status(&self, project_id: &str, status: DesiredStatus) -> Result<()> {
        let mut projects = self.projects.lock().await;
        let entry = projects
            .get_mut(project_id)
            .ok_or_else(|| FlowloomError::ProjectNotFound(project_id.to_string()))?;
        entry.spec.desired_status = status;
        Ok(())
    }

    /// Forget a project, stopping its active run.
    pub async fn remove_project(&self, project_id: &str) -> Option<ProjectSpec> {
        let removed = self.projects.lock().await.remove(project_id)?;
        self.stop_active(project_id).await;
        Some(removed.spec)
    }

    pub async fn projects(&self) -> Vec<ProjectSpec> {
        self.projects
            .lock()
            .await
            .values()
            .map(|e| e.spec.clone())
            .collect()
    }

    /// Run the reconciliation loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Project coordinator started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Project coordinator shutting down");
                    break;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// One reconciliation pass.
    pub async fn tick(&self) {
        if let Some(source) = &self.source {
            match source.load().await {
                Ok(specs) => self.replace_all(specs).await,
                Err(e) => warn!(error = %e, "Failed to load projects, keeping previous set"),
            }
        }

        for action in self.plan().await {
            match action {
                Action::Start(spec, revision) => {
                    let project_id = spec.id.clone();
                    match self
                        .supervisor
                        .start_run(&project_id, spec.definition, spec.vars)
                        .await
                    {
                        Ok(record) => {
                            info!(project_id = %project_id, run_id = %record.run_id, revision, "Started live run");
                            if let Some(entry) = self.projects.lock().await.get_mut(&project_id) {
                                entry.started_revision = Some(revision);
                            }
                        }
                        Err(e) => error!(project_id = %project_id, error = %e, "Failed to start live run"),
                    }
                }
                Action::Stop(project_id) => self.stop_active(&project_id).await,
            }
        }
    }

    async fn plan(&self) -> Vec<Action> {
        let projects = self.projects.lock().await;
        let mut actions = Vec::new();
        for (id, entry) in projects.iter() {
            let active = self.supervisor.active_run_for(id).await.is_some();
            match entry.spec.desired_status {
                DesiredStatus::Running if !active => {
                    actions.push(Action::Start(entry.spec.clone(), entry.revision));
                }
                DesiredStatus::Running if entry.started_revision != Some(entry.revision) => {
                    info!(project_id = %id, "Definition changed, restarting live run");
                    actions.push(Action::Stop(id.clone()));
                }
                DesiredStatus::Stopped if active => actions.push(Action::Stop(id.clone())),
                _ => {}
            }
        }
        actions
    }

    async fn replace_all(&self, specs: Vec<ProjectSpec>) {
        let keep: Vec<String> = specs.iter().map(|s| s.id.clone()).collect();
        for spec in specs {
            self.upsert_project(spec).await;
        }
        let gone: Vec<String> = self
            .projects
            .lock()
            .await
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        for id in gone {
            info!(project_id = %id, "Project disappeared from source");
            self.remove_project(&id).await;
        }
    }

    async fn stop_active(&self, project_id: &str) {
        let Some(record) = self.supervisor.active_run_for(project_id).await else {
            return;
        };
        if let Err(e) = self.supervisor.stop_run(record.run_id.as_str()).await {
            error!(project_id = %project_id, error = %e, "Failed to stop live run");
        }
    }
}

/// Projects stored as `*.json` files in a directory, one project per file.
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ProjectSource for DirectorySource {
    fn load(&self) -> BoxFuture<'_, Result<Vec<ProjectSpec>>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            let mut specs = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = tokio::fs::read_to_string(&path).await?;
                match serde_json::from_str::<ProjectSpec>(&content) {
                    Ok(spec) => specs.push(spec),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed project file"),
                }
            }
            specs.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(specs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_directory_source_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            json!({"id": "b", "desiredStatus": "running", "definition": {"nodes": [{"id": "x"}]}})
                .to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("a.json"), json!({"id": "a"}).to_string()).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let specs = DirectorySource::new(dir.path()).load().await.unwrap();
        let ids: Vec<_> = specs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(specs[1].desired_status, DesiredStatus::Running);
        assert_eq!(specs[1].definition.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = DirectorySource::new(dir.path().join("missing")).load().await;
        assert!(matches!(result, Err(FlowloomError::Io(_))));
    }
}
