//! `SwitchNode`: first-match-wins rule routing with a fan-out override
//! that addresses a single observer instead of broadcasting.

use crate::error::ProcessorError;
use crate::event::{Event, EventType, NodeState};
use crate::node::{BaseNode, GraphNode, Lifecycle, Metrics, Middleware, NodeInfo, Processor, ProcessingContext};
use crate::predicate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// One rule in a `SwitchNode`'s routing table: a JsonLogic `condition`
/// evaluated against the triggering event's `data`, and the `then`
/// target node id to route to when it matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRule {
    pub name: String,
    pub condition: Value,
    pub then: String,
}

/// Config recognized by [`SwitchProcessor`]/[`SwitchNode`]: an ordered
/// rule list plus an optional fallback target for the no-rule-matched
/// case (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SwitchConfig {
    #[serde(default)]
    pub rules: Vec<SwitchRule>,
    #[serde(default)]
    pub default_target: Option<String>,
}

/// The routing processor: evaluates `rules` in order, emits a single
/// `ROUTING_DECISION` event naming the winning target (or `no_match`).
pub struct SwitchProcessor {
    config: SwitchConfig,
}

impl SwitchProcessor {
    pub fn new(config: SwitchConfig) -> Self {
        Self { config }
    }

    fn evaluate(&self, data: &Value) -> Option<&SwitchRule> {
        self.config.rules.iter().find(|rule| predicate::evaluate_bool(&rule.condition, data))
    }
}

#[async_trait]
impl Processor for SwitchProcessor {
    fn can_handle(&self, _event: &Event) -> bool {
        true
    }

    async fn process(
        &self,
        event: &Event,
        _ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        if let Some(rule) = self.evaluate(&event.data) {
            info!(rule = %rule.name, target = %rule.then, "switch rule matched");
            return Ok(Some(routing_event(
                event,
                Some(&rule.then),
                Some(&rule.name),
                Some(&rule.condition),
                "routed",
            )));
        }

        if let Some(target) = &self.config.default_target {
            info!(target = %target, "switch falling back to default target");
            return Ok(Some(routing_event(event, Some(target), None, None, "routed")));
        }

        warn!("no switch rule matched and no default_target configured");
        Ok(Some(routing_event(event, None, None, None, "no_match")))
    }

    fn name(&self) -> &str {
        "switch_processor"
    }
}

/// `Some(target)` when `event` is a `ROUTING_DECISION` naming a concrete
/// `target_node`, triggering the single-observer delivery override;
/// `None` for every other event (including a `no_match` routing
/// decision), which fans out through the normal `BaseNode` path.
fn routing_target(event: &Event) -> Option<&str> {
    if event.event_type != EventType::RoutingDecision {
        return None;
    }
    event.data.get("target_node")?.as_str()
}

fn routing_event(
    original: &Event,
    target: Option<&str>,
    rule_name: Option<&str>,
    condition: Option<&Value>,
    status: &str,
) -> Event {
    let mut evt = original.derive(
        EventType::RoutingDecision,
        json!({
            "original_data": original.data,
            "target_node": target,
            "rule_name": rule_name,
            "condition": condition,
            "routing_type": "jsonlogic_switch",
            "status": status,
        }),
    );
    evt.metadata.insert("status".to_string(), json!(status));
    evt
}

/// A `BaseNode` wrapping a single `SwitchProcessor`, whose `notify_observers`
/// is overridden: a `ROUTING_DECISION` event goes only to the observer
/// whose id matches `event.data.target_node`; every other event type
/// fans out normally (spec §4.3's "Fan-out override").
pub struct SwitchNode {
    inner: BaseNode,
}

impl SwitchNode {
    pub async fn new(id: impl Into<String>, config: SwitchConfig) -> Arc<Self> {
        let raw_config = serde_json::to_value(&config).unwrap_or(Value::Null);
        let inner = BaseNode::new(id, "switch_node").with_config(raw_config);
        inner.add_processor(Arc::new(SwitchProcessor::new(config))).await;
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl GraphNode for SwitchNode {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn node_type(&self) -> &str {
        self.inner.node_type()
    }

    fn state(&self) -> NodeState {
        self.inner.state()
    }

    fn info(&self) -> NodeInfo {
        self.inner.info()
    }

    async fn update(&self, event: Event) {
        self.inner.update(event).await;
    }

    async fn notify_observers(&self, mut event: Event) {
        let Some(target) = routing_target(&event).map(str::to_string) else {
            self.inner.notify_observers(event).await;
            return;
        };

        self.inner.record_delivery(&mut event).await;
        let observers = self.inner.observers_snapshot();
        match observers.into_iter().find(|o| o.id() == target) {
            Some(observer) => observer.update(event).await,
            None => warn!(target = %target, "routing target has no matching observer"),
        }
    }

    fn add_edge_to(&self, target: Arc<dyn GraphNode>) {
        self.inner.add_edge_to(target);
    }

    fn remove_edge_to(&self, target_id: &str) {
        self.inner.remove_edge_to(target_id);
    }

    fn install_incoming(&self, source: Weak<dyn GraphNode>) {
        self.inner.install_incoming(source);
    }

    fn remove_incoming(&self, source_id: &str) {
        self.inner.remove_incoming(source_id);
    }

    fn outgoing_ids(&self) -> Vec<String> {
        self.inner.outgoing_ids()
    }

    fn incoming_ids(&self) -> Vec<String> {
        self.inner.incoming_ids()
    }

    async fn attach_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.attach_middleware(middleware).await;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        // Deliberately not `&self.inner`: downcasting a SwitchNode to
        // BaseNode would let the graph attach global middleware directly
        // to the inner node, bypassing this type's fan-out override. The
        // graph's `node_as_base` helper only reaches plain `BaseNode`s.
        self
    }

    fn as_lifecycle(&self) -> Option<&dyn Lifecycle> {
        None
    }
}
