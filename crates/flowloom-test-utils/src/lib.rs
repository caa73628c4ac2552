//! Shared fixtures for flowloom tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use flowloom_core::config::{AppConfig, InterpreterConfig};
use flowloom_core::definition::{Edge, Node, WorkflowDefinition};
use flowloom_core::error::{FlowloomError, Result};
use flowloom_core::event::FlowEvent;
use flowloom_core::traits::{EventSink, NetworkClient};
use flowloom_core::types::{HttpRequest, HttpResponse};
use flowloom_core::vars::StoreVars;

// ── Sinks ───────────────────────────────────────────────────────

/// Records every emitted event in order.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<FlowEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wire names of the recorded events.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(FlowEvent::name).collect()
    }

    /// Ids of nodes that emitted `node_start`, in order.
    pub fn visited(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                FlowEvent::NodeStart { node_id } => Some(node_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(&name)
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: FlowEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ── Network ─────────────────────────────────────────────────────

/// Canned responses keyed by URL. Unknown URLs fail with a network error.
#[derive(Default)]
pub struct MockNetwork {
    responses: HashMap<String, HttpResponse>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, url: impl Into<String>, response: HttpResponse) -> Self {
        self.responses.insert(url.into(), response);
        self
    }

    pub fn respond_json(self, url: impl Into<String>, body: Value) -> Self {
        self.respond(
            url,
            HttpResponse {
                status: 200,
                headers: Default::default(),
                body: body.to_string(),
            },
        )
    }

    /// Shared log of requests seen so far.
    pub fn requests(&self) -> Arc<Mutex<Vec<HttpRequest>>> {
        self.requests.clone()
    }
}

impl NetworkClient for MockNetwork {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let response = self.responses.get(&request.url).cloned();
            let url = request.url.clone();
            self.requests.lock().unwrap().push(request);
            response.ok_or_else(|| FlowloomError::Network(format!("no route to {}", url)))
        })
    }
}

// ── Definitions ─────────────────────────────────────────────────

/// `n0 -> n1 -> ... -> n{count-1}` with unlabeled edges and no scripts.
pub fn linear_definition(count: usize) -> WorkflowDefinition {
    let nodes = (0..count).map(|i| Node::new(format!("n{}", i))).collect();
    let edges = (1..count)
        .map(|i| Edge::new(format!("e{}", i), format!("n{}", i - 1), format!("n{}", i)))
        .collect();
    WorkflowDefinition::new(nodes, edges)
}

/// Build vars from `(key, value)` pairs.
pub fn vars(pairs: &[(&str, Value)]) -> StoreVars {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ── Config ──────────────────────────────────────────────────────

/// Config with no interpreter delays and a short coordinator poll.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.interpreter = InterpreterConfig::immediate();
    config.coordinator.poll_interval_ms = 20;
    config
}

/// Fresh temp dir plus a registry path inside it. Keep the dir alive for
/// the duration of the test.
pub fn temp_registry() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.json");
    (dir, path)
}
