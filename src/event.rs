//! The immutable `Event` flowing through the graph, and the enums that
//! classify it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// The canonical set of event types a graph built on this engine can carry.
///
/// `Custom(String)` is the escape hatch for application-specific event
/// kinds that don't warrant their own variant. (De)serializes as a plain
/// snake_case string, so an unrecognized string round-trips into
/// `Custom` instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    DataChange,
    ComputationResult,
    LlmRequest,
    LlmResponse,
    LlmToken,
    Error,
    Alert,
    Notification,
    RoutingDecision,
    MqttMessage,
    MqttPublish,
    MqttConnected,
    MqttDisconnected,
    FileConverted,
    Custom(String),
}

impl EventType {
    fn as_str(&self) -> &str {
        match self {
            EventType::DataChange => "data_change",
            EventType::ComputationResult => "computation_result",
            EventType::LlmRequest => "llm_request",
            EventType::LlmResponse => "llm_response",
            EventType::LlmToken => "llm_token",
            EventType::Error => "error",
            EventType::Alert => "alert",
            EventType::Notification => "notification",
            EventType::RoutingDecision => "routing_decision",
            EventType::MqttMessage => "mqtt_message",
            EventType::MqttPublish => "mqtt_publish",
            EventType::MqttConnected => "mqtt_connected",
            EventType::MqttDisconnected => "mqtt_disconnected",
            EventType::FileConverted => "file_converted",
            EventType::Custom(s) => s.as_str(),
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "data_change" => EventType::DataChange,
            "computation_result" => EventType::ComputationResult,
            "llm_request" => EventType::LlmRequest,
            "llm_response" => EventType::LlmResponse,
            "llm_token" => EventType::LlmToken,
            "error" => EventType::Error,
            "alert" => EventType::Alert,
            "notification" => EventType::Notification,
            "routing_decision" => EventType::RoutingDecision,
            "mqtt_message" => EventType::MqttMessage,
            "mqtt_publish" => EventType::MqttPublish,
            "mqtt_connected" => EventType::MqttConnected,
            "mqtt_disconnected" => EventType::MqttDisconnected,
            "file_converted" => EventType::FileConverted,
            other => EventType::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::from_str(&s))
    }
}

/// An immutable unit of data flowing through the graph.
///
/// Events are never mutated in place: a node that wants to pass on a
/// changed event constructs a new one (typically via [`Event::derive`])
/// that carries a fresh id but references `source_id` as its lineage
/// pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// Id of the event this one was derived from, if any.
    pub source_id: Option<Uuid>,
    /// Id of the node that produced this event, if any.
    pub source_node: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            data,
            timestamp: Utc::now(),
            source_id: None,
            source_node: None,
            metadata: HashMap::new(),
        }
    }

    /// Build a new event carrying `data` whose lineage points back at `self`.
    pub fn derive(&self, event_type: EventType, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            data,
            timestamp: Utc::now(),
            source_id: Some(self.id),
            source_node: self.source_node.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Construct the node-boundary `Error` event (§4.1 step 10): payload
    /// `{error, original_request}`, metadata layers `{status: "error"}`
    /// over `original`'s own metadata, matching the shape every other
    /// error path in this tree emits (`http.rs`, `mapper.rs`, `email.rs`,
    /// `lorawan.rs`).
    pub fn error(node_id: &str, original: &Event, message: impl Into<String>) -> Self {
        let mut evt = original.derive(
            EventType::Error,
            serde_json::json!({
                "error": message.into(),
                "original_request": original.data,
            }),
        );
        evt.source_node = Some(node_id.to_string());
        evt.metadata.insert("status".to_string(), serde_json::json!("error"));
        evt
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_source_node(mut self, node_id: impl Into<String>) -> Self {
        self.source_node = Some(node_id.into());
        self
    }
}

/// Processing state of a node's own pipeline (`BaseNode::update`), distinct
/// from the separate `Lifecycle::start`/`stop`/`is_running` a long-lived
/// node (MQTT subscriber/publisher) additionally exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Idle,
    Processing,
    Error,
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_carries_lineage() {
        let root = Event::new(EventType::DataChange, serde_json::json!({"x": 1}));
        let child = root.derive(EventType::ComputationResult, serde_json::json!({"x": 2}));
        assert_eq!(child.source_id, Some(root.id));
        assert_ne!(child.id, root.id);
    }

    #[test]
    fn error_event_carries_original_request_and_status() {
        let original = Event::new(EventType::DataChange, serde_json::json!({"x": 1}))
            .with_metadata("trace_id", serde_json::json!("abc"));
        let evt = Event::error("n1", &original, "missing field");
        assert_eq!(evt.event_type, EventType::Error);
        assert_eq!(evt.data["error"], "missing field");
        assert_eq!(evt.data["original_request"], serde_json::json!({"x": 1}));
        assert_eq!(evt.metadata["status"], "error");
        assert_eq!(evt.metadata["trace_id"], "abc");
        assert_eq!(evt.source_node.as_deref(), Some("n1"));
    }

    #[test]
    fn display_matches_snake_case() {
        assert_eq!(EventType::RoutingDecision.to_string(), "routing_decision");
        assert_eq!(EventType::Custom("widget".into()).to_string(), "widget");
    }
}
