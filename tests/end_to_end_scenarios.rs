//! Literal end-to-end scenarios from the engine's testable-properties
//! list, exercised against the public graph/node API the way a host
//! application would assemble a graph in code.

use async_trait::async_trait;
use graphflow::{BaseNode, Event, EventType, GraphNode, ObserverGraph, Processor, ProcessingContext, ProcessorError};
use serde_json::json;
use std::sync::Arc;

/// `result = data * factor + offset`, mirroring the bundled CLI demo's
/// numeric transform so this suite doesn't need a YAML definition file.
struct Scale {
    factor: f64,
    offset: f64,
}

#[async_trait]
impl Processor for Scale {
    fn can_handle(&self, event: &Event) -> bool {
        event.data.is_number()
    }

    async fn process(&self, event: &Event, _ctx: &ProcessingContext) -> Result<Option<Event>, ProcessorError> {
        let input = event.data.as_f64().ok_or_else(|| ProcessorError::validation("expected a number"))?;
        let result = input * self.factor + self.offset;
        Ok(Some(event.derive(EventType::ComputationResult, json!(result))))
    }
}

#[tokio::test]
async fn double_add_ten_fan_out() {
    let graph = ObserverGraph::new();

    let double = Arc::new(BaseNode::new("double", "scale"));
    double.add_processor(Arc::new(Scale { factor: 2.0, offset: 0.0 })).await;
    let add_ten_a = Arc::new(BaseNode::new("add_ten_a", "scale"));
    add_ten_a.add_processor(Arc::new(Scale { factor: 1.0, offset: 10.0 })).await;
    let add_ten_b = Arc::new(BaseNode::new("add_ten_b", "scale"));
    add_ten_b.add_processor(Arc::new(Scale { factor: 1.0, offset: 10.0 })).await;
    let collector = Arc::new(BaseNode::new("collector", "sink"));

    graph.add_node(double.clone()).await.unwrap();
    graph.add_node(add_ten_a.clone()).await.unwrap();
    graph.add_node(add_ten_b.clone()).await.unwrap();
    graph.add_node(collector.clone()).await.unwrap();

    graph.add_edge("double", "add_ten_a").unwrap();
    graph.add_edge("double", "add_ten_b").unwrap();
    graph.add_edge("add_ten_a", "collector").unwrap();
    graph.add_edge("add_ten_b", "collector").unwrap();

    graph.trigger_event("double", Event::new(EventType::DataChange, json!(5))).await;

    assert_eq!(double.info().metrics.events_processed, 1);
    assert_eq!(add_ten_a.info().metrics.events_processed, 1);
    assert_eq!(add_ten_b.info().metrics.events_processed, 1);
    assert_eq!(collector.info().metrics.events_processed, 2);
}

#[tokio::test]
async fn switch_routing_sends_to_exactly_one_branch() {
    use graphflow::switch::{SwitchConfig, SwitchNode, SwitchRule};

    let graph = ObserverGraph::new();
    let router = SwitchNode::new(
        "router",
        SwitchConfig {
            rules: vec![
                SwitchRule { name: "r1".into(), condition: json!({">": [{"var": "value"}, 5]}), then: "big".into() },
                SwitchRule { name: "r2".into(), condition: json!({"<=": [{"var": "value"}, 5]}), then: "small".into() },
            ],
            default_target: None,
        },
    )
    .await;
    let big = Arc::new(BaseNode::new("big", "sink"));
    let small = Arc::new(BaseNode::new("small", "sink"));

    graph.add_node(router.clone()).await.unwrap();
    graph.add_node(big.clone()).await.unwrap();
    graph.add_node(small.clone()).await.unwrap();
    graph.add_edge("router", "big").unwrap();
    graph.add_edge("router", "small").unwrap();

    graph.trigger_event("router", Event::new(EventType::DataChange, json!({"value": 7}))).await;
    assert_eq!(big.info().metrics.events_processed, 1);
    assert_eq!(small.info().metrics.events_processed, 0);

    graph.trigger_event("router", Event::new(EventType::DataChange, json!({"value": 3}))).await;
    assert_eq!(big.info().metrics.events_processed, 1);
    assert_eq!(small.info().metrics.events_processed, 1);
}

#[tokio::test]
async fn mapper_object_mode_errors_on_missing_required_field() {
    use graphflow::mapper::{ErrorHandling, FieldMapping, MapperConfig, MapperProcessor, OnMissingRequired, OnTransformError};

    let config = MapperConfig {
        mappings: vec![
            FieldMapping { source: "user.name".into(), target: "n".into(), default: None, required: false, transform: None },
            FieldMapping { source: "user.email".into(), target: "e".into(), default: None, required: true, transform: None },
        ],
        error_handling: ErrorHandling { on_missing_required: OnMissingRequired::Error, on_transform_error: OnTransformError::Skip },
        ..Default::default()
    };
    let node = Arc::new(BaseNode::new("mapper", "mapper"));
    node.add_processor(Arc::new(MapperProcessor::new(config))).await;

    node.update(Event::new(EventType::DataChange, json!({"user": {"name": "Ada", "email": "a@x"}}))).await;
    assert_eq!(node.info().metrics.events_processed, 1);
    assert_eq!(node.info().metrics.errors, 0);

    node.update(Event::new(EventType::DataChange, json!({"user": {"name": "Ada"}}))).await;
    assert_eq!(node.info().metrics.errors, 1);
}

#[tokio::test]
async fn reconnect_backoff_clamps_to_max_delay() {
    use graphflow::retry::exponential_backoff_delay;
    use std::time::Duration;

    let base = Duration::from_secs(1);
    let max = Duration::from_secs(10);
    let delays: Vec<u64> = (1..=5)
        .map(|attempt| exponential_backoff_delay(attempt, base, 2.0, max).as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 10]);
}
