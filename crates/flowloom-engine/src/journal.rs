use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowloom_core::event::{Envelope, FlowEvent};

use crate::broadcast::{Broadcaster, WatcherHandle};

/// Append-only JSONL journal of one run.
///
/// Runs as a watcher on the run's subject and writes one line per event to
/// `{dir}/{run_id}.jsonl`, flushing after each line so a crash never loses
/// what was already written. Stops after the run's terminal event, or once
/// `finished` fires and whatever is still queued has been written. The
/// second exit covers a terminal event dropped by a full watcher queue.
pub struct RunJournal {
    dir: PathBuf,
    level: u8,
}

/// A single line of the journal.
#[derive(Serialize)]
struct JournalEntry<'a> {
    timestamp: String,
    subject: &'a str,
    event: &'static str,
    payload: serde_json::Value,
}

impl RunJournal {
    /// `level` controls verbosity: 1 = run lifecycle, 2 = + node and edge
    /// transitions, 3 = + script logs and var snapshots.
    pub fn new(dir: PathBuf, level: u8) -> Self {
        Self { dir, level }
    }

    pub async fn run(
        self,
        mut watcher: WatcherHandle,
        broadcaster: Arc<Broadcaster>,
        finished: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            error!(error = %e, "Failed to create journal directory");
            broadcaster.unsubscribe(&watcher.subject, watcher.id).await;
            return;
        }

        let path = self.dir.join(format!("{}.jsonl", watcher.subject));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open journal");
                broadcaster.unsubscribe(&watcher.subject, watcher.id).await;
                return;
            }
        };

        info!(path = %path.display(), "Run journal started");
        let mut writer = BufWriter::new(file);

        loop {
            tokio::select! {
                biased;
                received = watcher.recv() => {
                    let Some(envelope) = received else { break };
                    let written = self.append(&mut writer, &envelope).await;
                    if !written || envelope.event.is_run_terminal() {
                        break;
                    }
                }
                _ = finished.cancelled() => {
                    while let Some(envelope) = watcher.try_recv() {
                        if !self.append(&mut writer, &envelope).await {
                            break;
                        }
                    }
                    break;
                }
            }
        }

        writer.flush().await.ok();
        broadcaster.unsubscribe(&watcher.subject, watcher.id).await;
        debug!(path = %path.display(), "Run journal finished");
    }

    /// Write one entry. Returns false if the file can no longer be written.
    async fn append(&self, writer: &mut BufWriter<tokio::fs::File>, envelope: &Envelope) -> bool {
        let Some(line) = self.line_for(envelope) else {
            return true;
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(error = %e, "Failed to write journal entry");
            return false;
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, "Failed to flush journal");
        }
        true
    }

    /// Serialized line for `envelope`, or `None` if filtered by level.
    fn line_for(&self, envelope: &Envelope) -> Option<String> {
        if self.level < level_of(&envelope.event) {
            return None;
        }
        let entry = JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            subject: &envelope.subject,
            event: envelope.event.name(),
            payload: envelope.event.payload(),
        };
        serde_json::to_string(&entry).ok().map(|json| json + "\n")
    }
}

/// Minimum journal level at which an event is written.
fn level_of(event: &FlowEvent) -> u8 {
    match event {
        FlowEvent::RunStarted { .. }
        | FlowEvent::RunCompleted { .. }
        | FlowEvent::RunError { .. }
        | FlowEvent::RunStopped { .. }
        | FlowEvent::WorkflowComplete {} => 1,
        FlowEvent::NodeStart { .. }
        | FlowEvent::NodeWait { .. }
        | FlowEvent::NodeError { .. }
        | FlowEvent::EdgeStart { .. } => 2,
        FlowEvent::NodeLog { .. } | FlowEvent::StoreVarsUpdate { .. } => 3,
        // Watcher greetings are not part of the run's history.
        FlowEvent::CurrentStatus { .. } | FlowEvent::ExecutionState { .. } => u8::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowloom_core::event::EventBus;
    use flowloom_core::types::RunId;

    fn envelope(event: FlowEvent) -> Envelope {
        Envelope::new("run-1", event)
    }

    #[test]
    fn test_level_filtering() {
        let quiet = RunJournal::new(PathBuf::from("/tmp"), 1);
        let chatty = RunJournal::new(PathBuf::from("/tmp"), 3);

        let node = envelope(FlowEvent::NodeStart { node_id: "a".into() });
        let log = envelope(FlowEvent::NodeLog {
            node_id: "a".into(),
            level: flowloom_core::types::LogLevel::Info,
            args: vec![],
        });
        let done = envelope(FlowEvent::WorkflowComplete {});

        assert!(quiet.line_for(&node).is_none());
        assert!(quiet.line_for(&done).is_some());
        assert!(chatty.line_for(&log).is_some());
        assert!(RunJournal::new(PathBuf::from("/tmp"), 2).line_for(&log).is_none());
    }

    #[test]
    fn test_line_format() {
        let journal = RunJournal::new(PathBuf::from("/tmp"), 2);
        let line = journal
            .line_for(&envelope(FlowEvent::NodeStart { node_id: "a".into() }))
            .unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["subject"], "run-1");
        assert_eq!(value["event"], "node_start");
        assert_eq!(value["payload"]["nodeId"], "a");
        assert!(value.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_writes_until_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let broadcaster = Arc::new(Broadcaster::new(16, Arc::new(EventBus::default())));
        let watcher = broadcaster.subscribe("run-1", vec![]).await;
        let task = tokio::spawn(RunJournal::new(dir.path().to_path_buf(), 2).run(
            watcher,
            broadcaster.clone(),
            CancellationToken::new(),
        ));

        let run_id = RunId::from_string("run-1");
        broadcaster
            .publish("run-1", FlowEvent::RunStarted { run_id: run_id.clone() })
            .await;
        broadcaster
            .publish("run-1", FlowEvent::NodeStart { node_id: "a".into() })
            .await;
        broadcaster
            .publish("run-1", FlowEvent::RunCompleted { run_id })
            .await;
        task.await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("run-1.jsonl")).unwrap();
        let events: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"].to_string())
            .collect();
        assert_eq!(events, vec!["\"run_started\"", "\"node_start\"", "\"run_completed\""]);
        assert_eq!(broadcaster.watcher_count("run-1").await, 0);
    }

    #[tokio::test]
    async fn test_stops_when_terminal_event_was_dropped() {
        let dir = tempfile::tempdir().unwrap();
        // One slot: the second event overflows and is dropped.
        let broadcaster = Arc::new(Broadcaster::new(1, Arc::new(EventBus::default())));
        let watcher = broadcaster.subscribe("run-1", vec![]).await;

        let run_id = RunId::from_string("run-1");
        broadcaster
            .publish("run-1", FlowEvent::RunStarted { run_id: run_id.clone() })
            .await;
        broadcaster
            .publish("run-1", FlowEvent::RunCompleted { run_id })
            .await;

        let finished = CancellationToken::new();
        let task = tokio::spawn(RunJournal::new(dir.path().to_path_buf(), 1).run(
            watcher,
            broadcaster.clone(),
            finished.clone(),
        ));
        finished.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("journal should stop once the run is finished")
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("run-1.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("run_started"));
        assert_eq!(broadcaster.watcher_count("run-1").await, 0);
    }
}
