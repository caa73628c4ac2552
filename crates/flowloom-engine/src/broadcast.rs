use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use flowloom_core::event::{Envelope, EventBus, FlowEvent};

/// A subscription to one subject.
pub struct WatcherHandle {
    pub id: u64,
    pub subject: String,
    rx: mpsc::Receiver<Envelope>,
}

impl WatcherHandle {
    /// Next event, or `None` once the watcher has been removed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

struct Watcher {
    id: u64,
    tx: mpsc::Sender<Envelope>,
}

/// Maps subjects (run ids and project ids) to watchers and fans events out.
///
/// Each watcher has its own bounded queue. A watcher that falls behind loses
/// events instead of slowing the publisher; a watcher whose receiver is
/// gone is dropped on the next publish. Every published envelope also goes
/// to the [`EventBus`] firehose.
pub struct Broadcaster {
    subjects: Mutex<HashMap<String, Vec<Watcher>>>,
    next_id: AtomicU64,
    buffer: usize,
    event_bus: Arc<EventBus>,
}

impl Broadcaster {
    pub fn new(buffer: usize, event_bus: Arc<EventBus>) -> Self {
        Self {
            subjects: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            event_bus,
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Register a watcher on `subject`.
    ///
    /// `greeting` is queued ahead of any event published after this call.
    pub async fn subscribe(&self, subject: &str, greeting: Vec<FlowEvent>) -> WatcherHandle {
        let (tx, rx) = mpsc::channel(self.buffer.max(greeting.len()));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subjects = self.subjects.lock().await;
        for event in greeting {
            // Capacity covers the greeting.
            let _ = tx.try_send(Envelope::new(subject, event));
        }
        subjects
            .entry(subject.to_string())
            .or_default()
            .push(Watcher { id, tx });

        debug!(subject = %subject, watcher_id = id, "Watcher subscribed");
        WatcherHandle {
            id,
            subject: subject.to_string(),
            rx,
        }
    }

    /// Remove a watcher. Returns whether it was registered.
    pub async fn unsubscribe(&self, subject: &str, id: u64) -> bool {
        let mut subjects = self.subjects.lock().await;
        let Some(watchers) = subjects.get_mut(subject) else {
            return false;
        };
        let before = watchers.len();
        watchers.retain(|w| w.id != id);
        let removed = watchers.len() != before;
        if watchers.is_empty() {
            subjects.remove(subject);
        }
        removed
    }

    /// Deliver `event` to every watcher of `subject`.
    pub async fn publish(&self, subject: &str, event: FlowEvent) {
        let envelope = Envelope::new(subject, event);
        {
            let mut subjects = self.subjects.lock().await;
            if let Some(watchers) = subjects.get_mut(subject) {
                watchers.retain(|w| match w.tx.try_send(envelope.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            subject = %subject,
                            watcher_id = w.id,
                            event = envelope.event.name(),
                            "Watcher lagging, event dropped"
                        );
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(subject = %subject, watcher_id = w.id, "Watcher gone");
                        false
                    }
                });
                if watchers.is_empty() {
                    subjects.remove(subject);
                }
            }
        }
        self.event_bus.publish(envelope);
    }

    pub async fn watcher_count(&self, subject: &str) -> usize {
        self.subjects
            .lock()
            .await
            .get(subject)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn subjects(&self) -> Vec<String> {
        self.subjects.lock().await.keys().cloned().collect()
    }
}
