use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use flowloom_core::error::{FlowloomError, Result};
use flowloom_core::types::{RunRecord, RunStatus};

/// On-disk shape of the registry file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    runs: Vec<RunRecord>,
}

/// Durable run table stored as a single JSON document.
///
/// Every save rewrites the whole file through a temp file and a rename, so
/// a crash mid-write leaves the previous version intact. Saves are
/// serialized by an internal lock.
pub struct RunRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record.
    ///
    /// A missing or empty file is an empty table. Records that were active
    /// when the file was written have no interpreter behind them any more,
    /// so they come back as `stopped`.
    pub async fn load(&self) -> Result<Vec<RunRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No run registry yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(FlowloomError::Registry(e.to_string())),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let file: RegistryFile = serde_json::from_str(&content)
            .map_err(|e| FlowloomError::Registry(format!("{}: {}", self.path.display(), e)))?;

        let mut recovered = 0usize;
        let runs = file
            .runs
            .into_iter()
            .map(|mut record| {
                if record.status.is_active() || record.status == RunStatus::Stopping {
                    record.status = RunStatus::Stopped;
                    recovered += 1;
                }
                record.persisted()
            })
            .collect::<Vec<_>>();

        if recovered > 0 {
            info!(count = recovered, "Marked interrupted runs as stopped");
        }
        Ok(runs)
    }

    /// Replace the stored table with `records`.
    pub async fn save(&self, records: &[RunRecord]) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| FlowloomError::Registry(e.to_string()))?;
            }
        }

        let file = RegistryFile {
            runs: records.iter().map(RunRecord::persisted).collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| FlowloomError::Registry(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| FlowloomError::Registry(e.to_string()))?;

        debug!(path = %self.path.display(), count = records.len(), "Run registry saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowloom_core::definition::WorkflowDefinition;
    use flowloom_core::vars::StoreVars;
    use flowloom_test_utils::{linear_definition, temp_registry, vars};
    use serde_json::json;

    fn record(project: &str, status: RunStatus) -> RunRecord {
        let mut r = RunRecord::new(project, &linear_definition(2), &vars(&[("x", json!(1))]));
        r.status = status;
        r
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let (_dir, path) = temp_registry();
        let registry = RunRegistry::new(&path);
        assert!(registry.load().await.unwrap().is_empty());

        tokio::fs::write(&path, "  \n").await.unwrap();
        assert!(registry.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_roundtrip_recovers_active_runs_as_stopped() {
        let (_dir, path) = temp_registry();
        let registry = RunRegistry::new(&path);
        let running = record("p1", RunStatus::Running);
        let done = record("p2", RunStatus::Completed);
        registry.save(&[running.clone(), done.clone()]).await.unwrap();

        // Active records keep their vars and definition on disk.
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["runs"][0].get("storeVars").is_some());
        assert!(raw["runs"][1].get("storeVars").is_none());

        let loaded = RunRegistry::new(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].run_id, running.run_id);
        assert_eq!(loaded[0].status, RunStatus::Stopped);
        assert!(loaded[0].store_vars.is_none());
        assert_eq!(loaded[1].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let (dir, _) = temp_registry();
        let path = dir.path().join("nested/deeper/runs.json");
        let registry = RunRegistry::new(&path);
        registry
            .save(&[RunRecord::new("p", &WorkflowDefinition::default(), &StoreVars::new())])
            .await
            .unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_registry_error() {
        let (_dir, path) = temp_registry();
        tokio::fs::write(&path, "{not json").await.unwrap();
        let err = RunRegistry::new(&path).load().await.unwrap_err();
        assert!(matches!(err, FlowloomError::Registry(_)));
    }
}
