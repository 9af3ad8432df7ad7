//! Graph-definition loading for the `graphflow-run` demo binary: a YAML
//! description of nodes/edges/an optional trigger, turned into a live
//! [`crate::graph::ObserverGraph`].
//!
//! This is deliberately the thinnest possible composition layer over the
//! library's node types — a host application embedding `graphflow`
//! would typically build its graph in code instead, the way the bundled
//! CLI's own [`NumericTransformProcessor`] isn't part of the engine's
//! node-type catalog.

use crate::convert::{CsvConfig, JsonToCsvProcessor, JsonToHtmlProcessor, JsonToXmlProcessor, XmlConfig};
use crate::email::{EmailConfig, EmailSenderProcessor, EmailValidationMiddleware};
use crate::error::{ConfigError, GraphError, ProcessorError};
use crate::event::{Event, EventType};
use crate::graph::ObserverGraph;
use crate::http::{HttpConfig, HttpProcessor};
use crate::lorawan::{LoRaWanConfig, LoRaWanProcessor, LoRaWanValidationMiddleware};
use crate::mapper::{MapperConfig, MapperProcessor};
use crate::mqtt::{MqttConfig, MqttPublisherNode, MqttSubscriberNode};
use crate::node::{BaseNode, GraphNode, Processor, ProcessingContext};
use crate::switch::{SwitchConfig, SwitchNode};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct GraphDefinition {
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    #[serde(default)]
    pub trigger: Option<TriggerDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct TriggerDefinition {
    pub node: String,
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// A demo-only transform: `result = data * factor + offset` over a
/// numeric `DataChange` payload, emitted as `ComputationResult`. Exists
/// so the bundled demo graphs (`demos/*.yaml`) can show fan-out without
/// requiring a host application to register a custom processor in code
/// first.
struct NumericTransformProcessor {
    factor: f64,
    offset: f64,
}

#[async_trait]
impl Processor for NumericTransformProcessor {
    fn can_handle(&self, event: &Event) -> bool {
        event.data.as_f64().is_some() || event.data.as_i64().is_some()
    }

    async fn process(
        &self,
        event: &Event,
        _ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        let input = event
            .data
            .as_f64()
            .ok_or_else(|| ProcessorError::validation("expected a numeric payload"))?;
        let result = input * self.factor + self.offset;
        Ok(Some(event.derive(EventType::ComputationResult, serde_json::json!(result))))
    }

    fn name(&self) -> &str {
        "numeric_transform"
    }
}

fn config_field<T: serde::de::DeserializeOwned + Default>(config: &Value) -> Result<T, ConfigError> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone()).map_err(|e| ConfigError::Deserialize(e.to_string()))
}

fn config_field_required<T: serde::de::DeserializeOwned>(config: &Value) -> Result<T, ConfigError> {
    serde_json::from_value(config.clone()).map_err(|e| ConfigError::Deserialize(e.to_string()))
}

/// Build one node from its definition. `kind` selects which of the
/// engine's bundled processors/sinks it wraps; unrecognized kinds are a
/// config error rather than a silently empty passthrough node.
async fn build_node(def: &NodeDefinition) -> Result<Arc<dyn GraphNode>, GraphError> {
    let node: Arc<dyn GraphNode> = match def.kind.as_str() {
        "passthrough" | "sink" => Arc::new(BaseNode::new(&def.id, &def.kind)),

        "numeric_transform" => {
            let factor = def.config.get("factor").and_then(Value::as_f64).unwrap_or(1.0);
            let offset = def.config.get("offset").and_then(Value::as_f64).unwrap_or(0.0);
            let base = BaseNode::new(&def.id, "numeric_transform");
            base.add_processor(Arc::new(NumericTransformProcessor { factor, offset })).await;
            Arc::new(base)
        }

        "switch" => {
            let config: SwitchConfig = config_field(&def.config).map_err(GraphError::Config)?;
            SwitchNode::new(&def.id, config).await
        }

        "mapper" => {
            let config: MapperConfig = config_field(&def.config).map_err(GraphError::Config)?;
            let base = BaseNode::new(&def.id, "mapper");
            base.add_processor(Arc::new(MapperProcessor::new(config))).await;
            Arc::new(base)
        }

        "convert_csv" => {
            let config: CsvConfig = config_field(&def.config).map_err(GraphError::Config)?;
            let base = BaseNode::new(&def.id, "convert_csv");
            base.add_processor(Arc::new(JsonToCsvProcessor::new(config))).await;
            Arc::new(base)
        }
        "convert_xml" => {
            let config: XmlConfig = config_field(&def.config).map_err(GraphError::Config)?;
            let base = BaseNode::new(&def.id, "convert_xml");
            base.add_processor(Arc::new(JsonToXmlProcessor::new(config))).await;
            Arc::new(base)
        }
        "convert_html" => {
            let base = BaseNode::new(&def.id, "convert_html");
            base.add_processor(Arc::new(JsonToHtmlProcessor)).await;
            Arc::new(base)
        }

        "http_get" | "http_post" | "http_put" | "http_patch" | "http_delete" => {
            let config: HttpConfig = config_field(&def.config).map_err(GraphError::Config)?;
            let processor = match def.kind.as_str() {
                "http_get" => HttpProcessor::get(config),
                "http_post" => HttpProcessor::post(config),
                "http_put" => HttpProcessor::put(config),
                "http_patch" => HttpProcessor::patch(config),
                _ => HttpProcessor::delete(config),
            }
            .map_err(GraphError::Processor)?;
            let base = BaseNode::new(&def.id, &def.kind);
            base.add_processor(Arc::new(processor)).await;
            Arc::new(base)
        }

        "mqtt_subscriber" => {
            let config: MqttConfig = config_field_required(&def.config).map_err(GraphError::Config)?;
            MqttSubscriberNode::new(&def.id, config)
        }
        "mqtt_publisher" => {
            let config: MqttConfig = config_field_required(&def.config).map_err(GraphError::Config)?;
            let default_topic = config
                .subscription
                .topics
                .first()
                .cloned()
                .ok_or_else(|| GraphError::Config(ConfigError::Invalid("mqtt_publisher requires subscription.topics[0] as the default topic".into())))?;
            MqttPublisherNode::new(&def.id, config, default_topic)
        }

        "email_sender" => {
            let config: EmailConfig = config_field_required(&def.config).map_err(GraphError::Config)?;
            let base = BaseNode::new(&def.id, "email_sender");
            base.add_middleware(Arc::new(EmailValidationMiddleware::new(config.clone()))).await;
            base.add_processor(Arc::new(EmailSenderProcessor::new(config))).await;
            Arc::new(base)
        }

        "lorawan" => {
            let config: LoRaWanConfig = config_field_required(&def.config).map_err(GraphError::Config)?;
            let base = BaseNode::new(&def.id, "lorawan");
            base.add_middleware(Arc::new(LoRaWanValidationMiddleware::new(config.clone()))).await;
            base.add_processor(Arc::new(LoRaWanProcessor::new(config).map_err(GraphError::Processor)?))
                .await;
            Arc::new(base)
        }

        other => {
            return Err(GraphError::Config(ConfigError::Invalid(format!("unknown node kind {other:?}"))));
        }
    };
    Ok(node)
}

/// Build a fully-wired [`ObserverGraph`] from a parsed definition:
/// register every node, then install every edge.
pub async fn build_graph(def: &GraphDefinition) -> Result<ObserverGraph, GraphError> {
    let graph = ObserverGraph::new();
    for node_def in &def.nodes {
        let node = build_node(node_def).await?;
        graph.add_node(node).await?;
    }
    for edge in &def.edges {
        graph.add_edge(&edge.from, &edge.to)?;
    }
    Ok(graph)
}

/// Parse `{event_type, data}` into the triggering [`Event`], falling
/// back to `Custom(event_type)` for a string the canonical enum doesn't
/// recognize (same leniency as the wire (de)serialization).
pub fn trigger_event(def: &TriggerDefinition) -> Event {
    let event_type = serde_json::from_value(Value::String(def.event_type.clone()))
        .unwrap_or_else(|_| EventType::Custom(def.event_type.clone()));
    Event::new(event_type, def.data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn builds_and_wires_a_simple_fan_out_graph() {
        let def = GraphDefinition {
            nodes: vec![
                NodeDefinition { id: "double".into(), kind: "numeric_transform".into(), config: json!({"factor": 2.0}) },
                NodeDefinition { id: "sink_a".into(), kind: "sink".into(), config: Value::Null },
                NodeDefinition { id: "sink_b".into(), kind: "sink".into(), config: Value::Null },
            ],
            edges: vec![
                EdgeDefinition { from: "double".into(), to: "sink_a".into() },
                EdgeDefinition { from: "double".into(), to: "sink_b".into() },
            ],
            trigger: Some(TriggerDefinition {
                node: "double".into(),
                event_type: "data_change".into(),
                data: json!(5),
            }),
        };

        let graph = build_graph(&def).await.unwrap();
        let trigger = def.trigger.as_ref().unwrap();
        graph.trigger_event(&trigger.node, trigger_event(trigger)).await;

        let a = graph.get_node("sink_a").unwrap();
        let b = graph.get_node("sink_b").unwrap();
        assert_eq!(a.info().metrics.events_processed, 1);
        assert_eq!(b.info().metrics.events_processed, 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_a_config_error() {
        let def = GraphDefinition {
            nodes: vec![NodeDefinition { id: "n".into(), kind: "not_a_real_kind".into(), config: Value::Null }],
            edges: vec![],
            trigger: None,
        };
        assert!(build_graph(&def).await.is_err());
    }
}
