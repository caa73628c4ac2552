use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::{Envelope, EventBus, FlowEvent};
use crate::types::{HttpRequest, HttpResponse, ProjectSpec};

/// Where an interpreter sends its events. The interpreter never learns how
/// (or whether) they are delivered.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: FlowEvent);
}

impl EventSink for mpsc::UnboundedSender<FlowEvent> {
    fn emit(&self, event: FlowEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Publishes every event on the firehose under a fixed subject.
pub struct BusSink {
    pub subject: String,
    pub bus: std::sync::Arc<EventBus>,
}

impl EventSink for BusSink {
    fn emit(&self, event: FlowEvent) {
        self.bus.publish(Envelope::new(self.subject.clone(), event));
    }
}

/// Network capability injected into node scripts.
pub trait NetworkClient: Send + Sync + 'static {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

/// Reusable scripts looked up by node display name when a node has no
/// script of its own.
pub trait ScriptCatalog: Send + Sync + 'static {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Catalog with nothing in it.
pub struct EmptyCatalog;

impl ScriptCatalog for EmptyCatalog {
    fn lookup(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Supplies live projects to the coordinator on every poll.
pub trait ProjectSource: Send + Sync + 'static {
    fn load(&self) -> BoxFuture<'_, Result<Vec<ProjectSpec>>>;
}
