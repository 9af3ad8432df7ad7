//! Node primitives: the pluggable `Processor`/`Middleware`/`Lifecycle`
//! capabilities, the `GraphNode` trait every graph member implements, and
//! `BaseNode`, the concrete processing-pipeline node most node types are
//! built from by composition.

pub mod context;

use crate::error::ProcessorError;
use crate::event::{Event, NodeState};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub use context::ProcessingContext;

const HISTORY_CAPACITY: usize = 100;
const RECENT_EVENTS_IN_CONTEXT: usize = 10;

/// A single pipeline stage: decides whether it applies to an event, and
/// if so produces at most one resulting event.
#[async_trait]
pub trait Processor: Send + Sync {
    fn can_handle(&self, event: &Event) -> bool;

    async fn process(
        &self,
        event: &Event,
        ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError>;

    /// A human-readable name used in logs; defaults to the type name.
    fn name(&self) -> &str {
        "processor"
    }
}

/// Cross-cutting wrapper run before and after the matched processor.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before_process(&self, event: Event, node_id: &str) -> Result<Event, ProcessorError>;

    async fn after_process(
        &self,
        original: &Event,
        result: Option<Event>,
        node_id: &str,
    ) -> Result<Option<Event>, ProcessorError>;
}

/// Optional start/stop capability for nodes backed by a live connection
/// (MQTT subscriber/publisher today).
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self) -> Result<(), ProcessorError>;
    async fn stop(&self) -> Result<(), ProcessorError>;
    fn is_running(&self) -> bool;
}

/// A predicate an event must satisfy before a node will process it at all.
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub events_processed: u64,
    pub events_sent: u64,
    pub errors: u64,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: String,
    pub node_type: String,
    pub state: NodeState,
    pub metrics: Metrics,
    pub processor_count: usize,
    pub middleware_count: usize,
}

/// Every member of an `ObserverGraph` implements this. `BaseNode` is the
/// default implementation; node types that need bespoke fan-out (notably
/// `SwitchNode`) implement it directly, delegating most of it to an
/// inner `BaseNode`.
#[async_trait]
pub trait GraphNode: Send + Sync {
    fn id(&self) -> &str;
    fn node_type(&self) -> &str;
    fn state(&self) -> NodeState;
    fn info(&self) -> NodeInfo;

    /// Receive an event as an observer. Never returns an error: failures
    /// inside processing are converted into an `Error` event and fanned
    /// out like any other result, matching the engine's policy that a
    /// caller driving the graph never sees an exception.
    async fn update(&self, event: Event);

    /// Fan out `event` to this node's observers.
    async fn notify_observers(&self, event: Event);

    /// Wire `self -> target`: idempotently add `target` to `self`'s
    /// outgoing and observer sets. Does not install the reverse
    /// back-reference; see [`GraphNode::install_incoming`].
    fn add_edge_to(&self, target: Arc<dyn GraphNode>);

    /// Reverse of [`GraphNode::add_edge_to`] (outgoing + observer sides).
    fn remove_edge_to(&self, target_id: &str);

    /// Record `source` as an incoming back-reference (the `to` side of
    /// `ObserverGraph::add_edge`, which holds the canonical `Arc` needed
    /// to build the `Weak`).
    fn install_incoming(&self, source: Weak<dyn GraphNode>);

    /// Reverse of [`GraphNode::install_incoming`].
    fn remove_incoming(&self, source_id: &str);

    fn outgoing_ids(&self) -> Vec<String>;
    fn incoming_ids(&self) -> Vec<String>;

    /// Attach middleware that should wrap this node's pipeline. Wrapper
    /// node types that compose an inner `BaseNode` delegate to it.
    async fn attach_middleware(&self, middleware: Arc<dyn Middleware>);

    /// Enable/disable dynamic downcast so the registry can reach
    /// `BaseNode`-specific setup (e.g. attaching middleware, processors)
    /// without every wrapper node re-exposing each method.
    fn as_any(&self) -> &dyn std::any::Any;

    /// `Some` for nodes that additionally implement [`Lifecycle`] (the
    /// MQTT subscriber/publisher). `ObserverGraph::start`/`stop` iterate
    /// only the nodes for which this returns `Some`.
    fn as_lifecycle(&self) -> Option<&dyn Lifecycle> {
        None
    }
}

/// The concrete processing-pipeline node: event filter, middleware chain,
/// first-matching processor, middleware chain again, then fan-out.
pub struct BaseNode {
    id: String,
    node_type: String,
    config: Value,
    data: Mutex<Option<Value>>,
    state: StdMutex<NodeState>,
    processors: Mutex<Vec<Arc<dyn Processor>>>,
    middleware: Mutex<Vec<Arc<dyn Middleware>>>,
    filters: Mutex<Vec<EventFilter>>,
    observers: StdMutex<Vec<Arc<dyn GraphNode>>>,
    outgoing: StdMutex<Vec<Arc<dyn GraphNode>>>,
    incoming: StdMutex<Vec<Weak<dyn GraphNode>>>,
    history: Mutex<VecDeque<Event>>,
    events_processed: AtomicU64,
    events_sent: AtomicU64,
    errors: AtomicU64,
    last_activity: StdMutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl BaseNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: Value::Null,
            data: Mutex::new(None),
            state: StdMutex::new(NodeState::Idle),
            processors: Mutex::new(Vec::new()),
            middleware: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            observers: StdMutex::new(Vec::new()),
            outgoing: StdMutex::new(Vec::new()),
            incoming: StdMutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            events_processed: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_activity: StdMutex::new(None),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_initial_data(self, data: Value) -> Self {
        *self.data.try_lock().expect("node not yet shared") = Some(data);
        self
    }

    pub async fn add_processor(&self, processor: Arc<dyn Processor>) {
        self.processors.lock().await.push(processor);
    }

    pub async fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.lock().await.push(middleware);
    }

    pub async fn add_event_filter(&self, filter: EventFilter) {
        self.filters.lock().await.push(filter);
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Disable the node: every subsequent `update` drops its event without
    /// a state transition, per the engine's DISABLED semantics.
    pub fn disable(&self) {
        *self.state.lock().expect("state lock poisoned") = NodeState::Disabled;
    }

    pub fn enable(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == NodeState::Disabled {
            *state = NodeState::Idle;
        }
    }

    async fn passes_filters(&self, event: &Event) -> bool {
        for filter in self.filters.lock().await.iter() {
            if !filter(event) {
                return false;
            }
        }
        true
    }

    async fn build_context(&self) -> ProcessingContext {
        let history = self.history.lock().await;
        let recent: Vec<Event> = history
            .iter()
            .rev()
            .take(RECENT_EVENTS_IN_CONTEXT)
            .rev()
            .cloned()
            .collect();
        ProcessingContext {
            node_id: self.id.clone(),
            node_type: self.node_type.clone(),
            config: self.config.clone(),
            current_data: self.data.lock().await.clone(),
            incoming_nodes: self.incoming_ids(),
            outgoing_nodes: self.outgoing_ids(),
            metrics: self.snapshot_metrics(),
            recent_events: recent,
        }
    }

    fn snapshot_metrics(&self) -> Metrics {
        Metrics {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_activity: *self
                .last_activity
                .lock()
                .expect("last_activity lock poisoned"),
        }
    }

    async fn record_sent(&self, event: &Event) {
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(event.clone());
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        *self
            .last_activity
            .lock()
            .expect("last_activity lock poisoned") = Some(chrono::Utc::now());
    }

    /// Snapshot of this node's observers, for wrapper types (`SwitchNode`)
    /// that need to pick a single observer to deliver to instead of
    /// broadcasting through [`GraphNode::notify_observers`].
    pub(crate) fn observers_snapshot(&self) -> Vec<Arc<dyn GraphNode>> {
        self.observers
            .lock()
            .expect("observers lock poisoned")
            .clone()
    }

    /// Stamp `source_node` and append to history/metrics without fanning
    /// out, so a wrapper type can replicate `notify_observers`'s
    /// bookkeeping while delivering to a subset of observers.
    pub(crate) async fn record_delivery(&self, event: &mut Event) {
        event.source_node = Some(self.id.clone());
        self.record_sent(event).await;
    }

    fn outgoing_ids_inner(&self) -> Vec<String> {
        self.outgoing
            .lock()
            .map(|g| g.iter().map(|n| n.id().to_string()).collect())
            .unwrap_or_default()
    }

    fn incoming_ids_inner(&self) -> Vec<String> {
        self.incoming
            .lock()
            .map(|g| {
                g.iter()
                    .filter_map(|w| w.upgrade())
                    .map(|n| n.id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphNode for BaseNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn state(&self) -> NodeState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: self.node_type.clone(),
            state: self.state(),
            metrics: self.snapshot_metrics(),
            processor_count: self
                .processors
                .try_lock()
                .map(|g| g.len())
                .unwrap_or_default(),
            middleware_count: self
                .middleware
                .try_lock()
                .map(|g| g.len())
                .unwrap_or_default(),
        }
    }

    async fn update(&self, event: Event) {
        if self.state() == NodeState::Disabled {
            return;
        }
        if !self.passes_filters(&event).await {
            return;
        }

        *self.state.lock().expect("state lock poisoned") = NodeState::Processing;
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        let outcome = self.run_pipeline(event.clone()).await;

        match outcome {
            Ok(Some(result)) => {
                self.notify_observers(result).await;
                *self.state.lock().expect("state lock poisoned") = NodeState::Idle;
            }
            Ok(None) => {
                *self.state.lock().expect("state lock poisoned") = NodeState::Idle;
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                *self.state.lock().expect("state lock poisoned") = NodeState::Error;
                tracing::error!(node = %self.id, error = %err, "node processing failed");
                let error_event = Event::error(&self.id, &event, err.to_string());
                self.notify_observers(error_event).await;
            }
        }
        *self
            .last_activity
            .lock()
            .expect("last_activity lock poisoned") = Some(chrono::Utc::now());
    }

    async fn notify_observers(&self, mut event: Event) {
        event.source_node = Some(self.id.clone());
        self.record_sent(&event).await;

        let observers = self
            .observers
            .lock()
            .expect("observers lock poisoned")
            .clone();
        info!(
            node = %self.id,
            event_type = %event.event_type,
            observer_count = observers.len(),
            "fanning out event"
        );
        for observer in observers {
            observer.update(event.clone()).await;
        }
    }

    fn add_edge_to(&self, target: Arc<dyn GraphNode>) {
        {
            let mut outgoing = self.outgoing.lock().expect("outgoing lock poisoned");
            if !outgoing.iter().any(|o| o.id() == target.id()) {
                outgoing.push(target.clone());
            }
        }
        let mut observers = self.observers.lock().expect("observers lock poisoned");
        if !observers.iter().any(|o| o.id() == target.id()) {
            observers.push(target);
        }
    }

    fn remove_edge_to(&self, target_id: &str) {
        self.outgoing
            .lock()
            .expect("outgoing lock poisoned")
            .retain(|o| o.id() != target_id);
        self.observers
            .lock()
            .expect("observers lock poisoned")
            .retain(|o| o.id() != target_id);
    }

    fn install_incoming(&self, source: Weak<dyn GraphNode>) {
        let already = self
            .incoming
            .lock()
            .expect("incoming lock poisoned")
            .iter()
            .filter_map(|w| w.upgrade())
            .any(|n| source.upgrade().map(|s| s.id() == n.id()).unwrap_or(false));
        if !already {
            self.incoming
                .lock()
                .expect("incoming lock poisoned")
                .push(source);
        }
    }

    fn remove_incoming(&self, source_id: &str) {
        self.incoming
            .lock()
            .expect("incoming lock poisoned")
            .retain(|w| w.upgrade().map(|n| n.id().to_string()).as_deref() != Some(source_id));
    }

    fn outgoing_ids(&self) -> Vec<String> {
        self.outgoing_ids_inner()
    }

    fn incoming_ids(&self) -> Vec<String> {
        self.incoming_ids_inner()
    }

    async fn attach_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.add_middleware(middleware).await;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl BaseNode {
    async fn run_pipeline(&self, event: Event) -> Result<Option<Event>, ProcessorError> {
        let middleware = self.middleware.lock().await.clone();

        let mut processed = event;
        for mw in &middleware {
            processed = mw.before_process(processed, &self.id).await?;
        }

        let ctx = self.build_context().await;
        let mut result = None;
        for processor in self.processors.lock().await.iter() {
            if processor.can_handle(&processed) {
                result = processor.process(&processed, &ctx).await?;
                break;
            } else {
                warn!(node = %self.id, processor = processor.name(), "processor skipped event");
            }
        }

        for mw in &middleware {
            result = mw.after_process(&processed, result, &self.id).await?;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::graph::ObserverGraph;
    use async_trait::async_trait;

    struct EchoProcessor;

    #[async_trait]
    impl Processor for EchoProcessor {
        fn can_handle(&self, event: &Event) -> bool {
            event.event_type == EventType::DataChange
        }

        async fn process(
            &self,
            event: &Event,
            _ctx: &ProcessingContext,
        ) -> Result<Option<Event>, ProcessorError> {
            Ok(Some(event.derive(EventType::ComputationResult, event.data.clone())))
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl Processor for FailingProcessor {
        fn can_handle(&self, _event: &Event) -> bool {
            true
        }

        async fn process(
            &self,
            _event: &Event,
            _ctx: &ProcessingContext,
        ) -> Result<Option<Event>, ProcessorError> {
            Err(ProcessorError::validation("always fails"))
        }
    }

    struct CapturingProcessor(std::sync::Mutex<Option<Event>>);

    #[async_trait]
    impl Processor for CapturingProcessor {
        fn can_handle(&self, _event: &Event) -> bool {
            true
        }

        async fn process(
            &self,
            event: &Event,
            _ctx: &ProcessingContext,
        ) -> Result<Option<Event>, ProcessorError> {
            *self.0.lock().expect("capture lock poisoned") = Some(event.clone());
            Ok(None)
        }
    }

    #[tokio::test]
    async fn pipeline_runs_matching_processor_and_fans_out() {
        let graph = ObserverGraph::new();
        let upstream = Arc::new(BaseNode::new("a", "test"));
        let downstream = Arc::new(BaseNode::new("b", "test"));
        upstream.add_processor(Arc::new(EchoProcessor)).await;

        graph.add_node(upstream.clone()).await.unwrap();
        graph.add_node(downstream.clone()).await.unwrap();
        graph.add_edge("a", "b").unwrap();

        upstream
            .update(Event::new(EventType::DataChange, serde_json::json!({"x": 1})))
            .await;

        let info = downstream.info();
        assert_eq!(info.metrics.events_processed, 1);
    }

    #[tokio::test]
    async fn processor_error_becomes_error_event() {
        let graph = ObserverGraph::new();
        let node = Arc::new(BaseNode::new("a", "test"));
        let sink = Arc::new(BaseNode::new("sink", "test"));
        node.add_processor(Arc::new(FailingProcessor)).await;
        let capture = Arc::new(CapturingProcessor(std::sync::Mutex::new(None)));
        sink.add_processor(capture.clone()).await;

        graph.add_node(node.clone()).await.unwrap();
        graph.add_node(sink.clone()).await.unwrap();
        graph.add_edge("a", "sink").unwrap();

        let triggering = Event::new(EventType::DataChange, serde_json::json!({"x": 1}))
            .with_metadata("trace_id", serde_json::json!("t-1"));
        node.update(triggering).await;

        assert_eq!(node.info().metrics.errors, 1);
        assert_eq!(node.state(), NodeState::Error);
        assert_eq!(sink.info().metrics.events_processed, 1);

        let received = capture.0.lock().expect("capture lock poisoned").clone().expect("sink never ran");
        assert_eq!(received.event_type, EventType::Error);
        assert_eq!(received.data["error"], "validation failed: always fails");
        assert_eq!(received.data["original_request"], serde_json::json!({"x": 1}));
        assert_eq!(received.metadata["status"], "error");
        assert_eq!(received.metadata["trace_id"], "t-1");
    }

    #[tokio::test]
    async fn event_filter_blocks_processing() {
        let node = Arc::new(BaseNode::new("a", "test"));
        node.add_event_filter(Box::new(|e: &Event| e.event_type != EventType::Alert))
            .await;
        node.add_processor(Arc::new(EchoProcessor)).await;

        node.update(Event::new(EventType::Alert, serde_json::json!({})))
            .await;
        assert_eq!(node.info().metrics.events_processed, 0);
    }

    #[tokio::test]
    async fn disabled_node_drops_events_silently() {
        let node = Arc::new(BaseNode::new("a", "test"));
        node.add_processor(Arc::new(EchoProcessor)).await;
        node.disable();

        node.update(Event::new(EventType::DataChange, serde_json::json!({})))
            .await;
        assert_eq!(node.info().metrics.events_processed, 0);
        assert_eq!(node.state(), NodeState::Disabled);
    }

    #[tokio::test]
    async fn add_edge_then_remove_restores_collections() {
        let graph = ObserverGraph::new();
        let a = Arc::new(BaseNode::new("a", "test"));
        let b = Arc::new(BaseNode::new("b", "test"));
        graph.add_node(a.clone()).await.unwrap();
        graph.add_node(b.clone()).await.unwrap();

        graph.add_edge("a", "b").unwrap();
        assert_eq!(a.outgoing_ids(), vec!["b".to_string()]);
        assert_eq!(b.incoming_ids(), vec!["a".to_string()]);

        graph.remove_edge("a", "b").unwrap();
        assert!(a.outgoing_ids().is_empty());
        assert!(b.incoming_ids().is_empty());
    }
}
