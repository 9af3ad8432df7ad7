//! The read-only snapshot a `Processor` sees while handling one event.

use crate::event::Event;
use crate::node::Metrics;
use serde_json::Value;

/// Built fresh for every `update()` call from the node's current state;
/// mirrors the dict the original engine assembled in `_build_context`.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub node_id: String,
    pub node_type: String,
    pub config: Value,
    pub current_data: Option<Value>,
    pub incoming_nodes: Vec<String>,
    pub outgoing_nodes: Vec<String>,
    pub metrics: Metrics,
    pub recent_events: Vec<Event>,
}
