//! `ObserverGraph`: the node registry that owns every `Arc<dyn GraphNode>`
//! canonically, wires edges between nodes, and drives events into it.

use crate::error::GraphError;
use crate::event::Event;
use crate::node::{GraphNode, Middleware};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct ObserverGraph {
    nodes: Mutex<HashMap<String, Arc<dyn GraphNode>>>,
    // Insertion order, so `start`/`stop` iterate lifecycle-capable nodes
    // in registration order as the spec requires.
    insertion_order: Mutex<Vec<String>>,
    global_middleware: Mutex<Vec<Arc<dyn Middleware>>>,
}

impl Default for ObserverGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverGraph {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            insertion_order: Mutex::new(Vec::new()),
            global_middleware: Mutex::new(Vec::new()),
        }
    }

    /// Register `node`. Global middleware already registered is attached
    /// to it immediately, matching the order new nodes would otherwise
    /// miss middleware added before they joined the graph.
    pub async fn add_node(&self, node: Arc<dyn GraphNode>) -> Result<(), GraphError> {
        let id = node.id().to_string();
        {
            let nodes = self.nodes.lock().expect("nodes lock poisoned");
            if nodes.contains_key(&id) {
                return Err(GraphError::DuplicateNode(id));
            }
        }

        if let Some(base) = node_as_base(&node) {
            for mw in self.global_middleware.lock().expect("middleware lock poisoned").iter() {
                base.add_middleware(mw.clone()).await;
            }
        }

        info!(node = %id, node_type = %node.node_type(), "added node");
        self.nodes.lock().expect("nodes lock poisoned").insert(id.clone(), node);
        self.insertion_order.lock().expect("insertion_order lock poisoned").push(id);
        Ok(())
    }

    /// Start every lifecycle-capable node (MQTT subscriber/publisher,
    /// notably) in registration order. The first failure aborts the
    /// remaining starts and is returned to the caller.
    pub async fn start(&self) -> Result<(), GraphError> {
        for node in self.lifecycle_nodes() {
            if let Some(lifecycle) = node.as_lifecycle() {
                lifecycle
                    .start()
                    .await
                    .map_err(|e| GraphError::StartFailed(node.id().to_string(), e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Stop every lifecycle-capable node in registration order. Failures
    /// are logged and collected but do not prevent stopping the rest —
    /// shutdown should make a best effort to release every connection.
    pub async fn stop(&self) -> Result<(), GraphError> {
        let mut first_err = None;
        for node in self.lifecycle_nodes() {
            if let Some(lifecycle) = node.as_lifecycle() {
                if let Err(e) = lifecycle.stop().await {
                    tracing::error!(node = node.id(), error = %e, "node failed to stop");
                    first_err.get_or_insert(GraphError::StopFailed(node.id().to_string(), e.to_string()));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lifecycle_nodes(&self) -> Vec<Arc<dyn GraphNode>> {
        let order = self.insertion_order.lock().expect("insertion_order lock poisoned").clone();
        let nodes = self.nodes.lock().expect("nodes lock poisoned");
        order
            .into_iter()
            .filter_map(|id| nodes.get(&id).cloned())
            .collect()
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<dyn GraphNode>> {
        self.nodes.lock().expect("nodes lock poisoned").get(node_id).cloned()
    }

    /// Wire a directed edge `from_id -> to_id`: `from` gains `to` as an
    /// outgoing edge and observer, `to` gains `from` as an incoming
    /// (weak) back-reference.
    pub fn add_edge(&self, from_id: &str, to_id: &str) -> Result<(), GraphError> {
        let from = self
            .get_node(from_id)
            .ok_or_else(|| GraphError::UnknownNode(from_id.to_string()))?;
        let to = self
            .get_node(to_id)
            .ok_or_else(|| GraphError::UnknownNode(to_id.to_string()))?;

        from.add_edge_to(to.clone());
        to.install_incoming(Arc::downgrade(&from));

        info!(from = from_id, to = to_id, "added edge");
        Ok(())
    }

    /// Reverse of [`ObserverGraph::add_edge`]: restores the pre-edge state
    /// of `from`'s outgoing/observer sets and `to`'s incoming set.
    pub fn remove_edge(&self, from_id: &str, to_id: &str) -> Result<(), GraphError> {
        let from = self
            .get_node(from_id)
            .ok_or_else(|| GraphError::UnknownNode(from_id.to_string()))?;
        let to = self
            .get_node(to_id)
            .ok_or_else(|| GraphError::UnknownNode(to_id.to_string()))?;

        from.remove_edge_to(to_id);
        to.remove_incoming(from_id);

        info!(from = from_id, to = to_id, "removed edge");
        Ok(())
    }

    /// Register middleware that applies to every node already in the
    /// graph and to any node added afterward.
    pub async fn add_global_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.global_middleware.lock().expect("middleware lock poisoned").push(middleware.clone());
        let nodes: Vec<Arc<dyn GraphNode>> = self
            .nodes
            .lock()
            .expect("nodes lock poisoned")
            .values()
            .cloned()
            .collect();
        for node in nodes {
            if let Some(base) = node_as_base(&node) {
                base.add_middleware(middleware.clone()).await;
            }
        }
    }

    /// Deliver `event` to the node `node_id`. A silent no-op if the node
    /// doesn't exist, matching the engine's default propagation policy —
    /// see [`ObserverGraph::trigger_event_checked`] for a variant that
    /// surfaces the unknown-id case.
    pub async fn trigger_event(&self, node_id: &str, event: Event) {
        if let Some(node) = self.get_node(node_id) {
            node.update(event).await;
        }
    }

    /// Like [`ObserverGraph::trigger_event`], but returns
    /// `Err(GraphError::UnknownNode)` instead of silently dropping the
    /// event when `node_id` isn't registered.
    pub async fn trigger_event_checked(&self, node_id: &str, event: Event) -> Result<(), GraphError> {
        let node = self
            .get_node(node_id)
            .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))?;
        node.update(event).await;
        Ok(())
    }

    pub fn summary(&self) -> Value {
        let nodes = self.nodes.lock().expect("nodes lock poisoned");
        let mut node_summaries = serde_json::Map::new();
        let mut edges = Vec::new();
        for (id, node) in nodes.iter() {
            let info = node.info();
            node_summaries.insert(
                id.clone(),
                json!({
                    "id": info.id,
                    "type": info.node_type,
                    "state": info.state,
                    "metrics": {
                        "events_processed": info.metrics.events_processed,
                        "events_sent": info.metrics.events_sent,
                        "errors": info.metrics.errors,
                        "last_activity": info.metrics.last_activity,
                    },
                    "processors": info.processor_count,
                    "middleware": info.middleware_count,
                }),
            );
            for target_id in node.outgoing_ids() {
                edges.push(json!({"from": id, "to": target_id}));
            }
        }
        json!({
            "total_nodes": nodes.len(),
            "nodes": node_summaries,
            "edges": edges,
        })
    }
}

/// Down-cast a `GraphNode` trait object to a `BaseNode` when the concrete
/// node happens to wrap one directly, so middleware can be attached to
/// plain processor nodes without every wrapper re-exposing the method.
fn node_as_base(node: &Arc<dyn GraphNode>) -> Option<&crate::node::BaseNode> {
    node.as_any().downcast_ref::<crate::node::BaseNode>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::node::BaseNode;

    #[tokio::test]
    async fn add_node_and_edge_wires_fanout() {
        let graph = ObserverGraph::new();
        graph.add_node(Arc::new(BaseNode::new("a", "test"))).await.unwrap();
        graph.add_node(Arc::new(BaseNode::new("b", "test"))).await.unwrap();
        graph.add_edge("a", "b").unwrap();

        graph
            .trigger_event("a", Event::new(EventType::DataChange, json!({})))
            .await;

        let b = graph.get_node("b").unwrap();
        assert_eq!(b.info().metrics.events_processed, 1);
    }

    #[tokio::test]
    async fn duplicate_node_rejected() {
        let graph = ObserverGraph::new();
        graph.add_node(Arc::new(BaseNode::new("a", "test"))).await.unwrap();
        let err = graph.add_node(Arc::new(BaseNode::new("a", "test"))).await;
        assert!(matches!(err, Err(GraphError::DuplicateNode(_))));
    }

    #[tokio::test]
    async fn unknown_node_trigger_is_silent_noop() {
        let graph = ObserverGraph::new();
        graph.trigger_event("missing", Event::new(EventType::DataChange, json!({}))).await;
    }

    #[tokio::test]
    async fn trigger_event_checked_surfaces_unknown_node() {
        let graph = ObserverGraph::new();
        let result = graph
            .trigger_event_checked("missing", Event::new(EventType::DataChange, json!({})))
            .await;
        assert!(matches!(result, Err(GraphError::UnknownNode(_))));
    }
}
