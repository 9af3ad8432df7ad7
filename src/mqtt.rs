//! MQTT connection manager plus subscriber/publisher lifecycle nodes
//! (§4.6): exponential-backoff (re)connect, subscribe-on-connect, a
//! listen loop that surfaces messages and connection state as events,
//! and a publish path usable either from config defaults or per-event.

use crate::error::{MqttError, ProcessorError};
use crate::event::{Event, EventType, NodeState};
use crate::node::{BaseNode, GraphNode, Lifecycle, Metrics, Middleware, NodeInfo};
use crate::retry::exponential_backoff_delay;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event as MqttPollEvent, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsSettings {
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default)]
    pub client_cert_path: Option<String>,
    #[serde(default)]
    pub client_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSettings {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub tls: TlsSettings,
}

fn default_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub client_id: String,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_keepalive() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub reconnect_on_failure: bool,
}

fn default_retry_delay() -> u64 {
    1
}
fn default_backoff() -> f64 {
    2.0
}
fn default_max_retry_delay() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay(),
            backoff: default_backoff(),
            max_retry_delay_secs: default_max_retry_delay(),
            max_retries: default_max_retries(),
            reconnect_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SubscriptionSettings {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub qos: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub credential: CredentialSettings,
    pub client: ClientSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub subscription: SubscriptionSettings,
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Owns exactly one `rumqttc` client/eventloop pair per spec §5 ("an MQTT
/// manager owns exactly one client; it is not shared across nodes").
pub struct MqttConnectionManager {
    config: MqttConfig,
    client: AsyncMutex<Option<AsyncClient>>,
    eventloop: AsyncMutex<Option<EventLoop>>,
}

impl MqttConnectionManager {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            client: AsyncMutex::new(None),
            eventloop: AsyncMutex::new(None),
        }
    }

    fn build_options(&self) -> MqttOptions {
        let cred = &self.config.credential;
        let mut opts = MqttOptions::new(&self.config.client.client_id, &cred.hostname, cred.port);
        opts.set_keep_alive(Duration::from_secs(self.config.client.keepalive_secs));
        opts.set_clean_session(self.config.client.clean_session);
        if let (Some(user), Some(pass)) = (&cred.username, &cred.password) {
            opts.set_credentials(user, pass);
        }
        if cred.use_tls {
            opts.set_transport(Transport::Tls(Default::default()));
        }
        opts
    }

    /// Connect with exponential backoff: `delay(n) = min(retry_delay *
    /// backoff^(n-1), max_retry_delay)`, giving up after `max_retries`
    /// (spec §4.6, scenario 6).
    async fn connect_with_retry(&self) -> Result<(AsyncClient, EventLoop), MqttError> {
        let retry = &self.config.retry;
        let base = Duration::from_secs(retry.retry_delay_secs);
        let max_delay = Duration::from_secs(retry.max_retry_delay_secs);

        let mut last_err = None;
        for attempt in 1..=retry.max_retries.max(1) {
            let options = self.build_options();
            let (client, mut eventloop) = AsyncClient::new(options, 64);
            match eventloop.poll().await {
                Ok(MqttPollEvent::Incoming(Packet::ConnAck(_))) => {
                    info!(attempt, "mqtt connected");
                    return Ok((client, eventloop));
                }
                Ok(_) => {
                    warn!(attempt, "unexpected event while waiting for CONNACK");
                    last_err = Some(MqttError::Connect("unexpected handshake event".into()));
                }
                Err(e) => {
                    last_err = Some(MqttError::Connect(e.to_string()));
                }
            }

            if attempt == retry.max_retries.max(1) {
                break;
            }
            let delay = exponential_backoff_delay(attempt, base, retry.backoff, max_delay);
            debug!(attempt, delay_secs = delay.as_secs(), "retrying mqtt connect");
            tokio::time::sleep(delay).await;
        }
        Err(last_err.unwrap_or(MqttError::Connect("exhausted retries".into())))
    }

    pub async fn connect(&self) -> Result<(), MqttError> {
        let (client, eventloop) = self.connect_with_retry().await?;
        for topic in &self.config.subscription.topics {
            client
                .subscribe(topic, qos_from_u8(self.config.subscription.qos))
                .await
                .map_err(|e| MqttError::Subscribe { topic: topic.clone(), reason: e.to_string() })?;
        }
        *self.client.lock().await = Some(client);
        *self.eventloop.lock().await = Some(eventloop);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), MqttError> {
        self.connect().await
    }

    fn reconnect_on_failure(&self) -> bool {
        self.config.retry.reconnect_on_failure
    }

    pub async fn disconnect(&self) {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
        self.eventloop.lock().await.take();
    }

    /// One step of the listen loop. Crate-internal: callers outside this
    /// module drive the loop through [`MqttSubscriberNode::start`] rather
    /// than polling directly.
    pub(crate) async fn poll(&self) -> Result<MqttPollEvent, MqttError> {
        let mut guard = self.eventloop.lock().await;
        let eventloop = guard.as_mut().ok_or(MqttError::NotConnected)?;
        eventloop.poll().await.map_err(|e| MqttError::Client(e.to_string()))
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> Result<(), MqttError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(MqttError::NotConnected)?;
        client
            .publish(topic, qos_from_u8(qos), retain, payload)
            .await
            .map_err(|e| MqttError::Publish { topic: topic.to_string(), reason: e.to_string() })
    }

    pub fn default_topic(&self) -> Option<&str> {
        self.config.subscription.topics.first().map(String::as_str)
    }
}

/// Decode an incoming payload: UTF-8 text, then JSON if the text parses,
/// falling back to a base64 string for non-UTF-8 bytes (spec §4.6).
fn decode_payload(bytes: &[u8]) -> (Value, Value) {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let parsed = serde_json::from_str::<Value>(text).unwrap_or_else(|_| json!(text));
            (parsed, json!(text))
        }
        Err(_) => {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            let encoded = STANDARD.encode(bytes);
            (json!(encoded.clone()), json!(encoded))
        }
    }
}

/// Wraps a [`MqttConnectionManager`] as a lifecycle-capable source node:
/// each incoming message and connection-state change is emitted directly
/// to observers, bypassing the processor pipeline — there is no inbound
/// event to process, the node itself originates events from the broker.
pub struct MqttSubscriberNode {
    inner: BaseNode,
    manager: Arc<MqttConnectionManager>,
    running: Arc<AtomicBool>,
    broker: String,
    self_ref: StdMutex<Weak<MqttSubscriberNode>>,
    listen_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl MqttSubscriberNode {
    pub fn new(id: impl Into<String>, config: MqttConfig) -> Arc<Self> {
        let broker = config.credential.hostname.clone();
        let raw_config = serde_json::to_value(&config).unwrap_or(Value::Null);
        Arc::new_cyclic(|weak| Self {
            inner: BaseNode::new(id, "mqtt_subscriber").with_config(raw_config),
            manager: Arc::new(MqttConnectionManager::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            broker,
            self_ref: StdMutex::new(weak.clone()),
            listen_task: AsyncMutex::new(None),
        })
    }

    async fn emit(&self, event: Event) {
        self.inner.notify_observers(event).await;
    }

    /// Spawned as a background task by `start`; polls the broker
    /// connection, translating publishes into `MQTT_MESSAGE` events and
    /// reconnecting (or giving up) on disconnect per
    /// `retry.reconnect_on_failure`.
    async fn listen_loop(weak: Weak<MqttSubscriberNode>) {
        loop {
            let Some(node) = weak.upgrade() else { return };
            if !node.running.load(Ordering::SeqCst) {
                return;
            }
            match node.manager.poll().await {
                Ok(MqttPollEvent::Incoming(Packet::Publish(publish))) => {
                    let (data, raw) = decode_payload(&publish.payload);
                    let event = Event::new(
                        EventType::MqttMessage,
                        json!({"topic": publish.topic, "payload": data, "raw_payload": raw}),
                    )
                    .with_metadata("qos", json!(publish.qos as u8))
                    .with_metadata("retain", json!(publish.retain))
                    .with_metadata("broker", json!(node.broker.clone()));
                    node.emit(event).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(node = %node.inner.id(), error = %err, "mqtt connection lost");
                    node.emit(Event::new(EventType::MqttDisconnected, json!({"broker": node.broker}))).await;
                    if !node.manager.reconnect_on_failure() {
                        node.running.store(false, Ordering::SeqCst);
                        return;
                    }
                    if node.manager.reconnect().await.is_err() {
                        error!(node = %node.inner.id(), "mqtt reconnect exhausted retries, stopping");
                        node.running.store(false, Ordering::SeqCst);
                        return;
                    }
                    node.emit(Event::new(EventType::MqttConnected, json!({"broker": node.broker}))).await;
                }
            }
        }
    }
}

#[async_trait]
impl GraphNode for MqttSubscriberNode {
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
    async fn notify_observers(&self, event: Event) {
        self.inner.notify_observers(event).await;
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
        self
    }
    fn as_lifecycle(&self) -> Option<&dyn Lifecycle> {
        Some(self)
    }
}

#[async_trait]
impl Lifecycle for MqttSubscriberNode {
    async fn start(&self) -> Result<(), ProcessorError> {
        self.manager.connect().await?;
        self.running.store(true, Ordering::SeqCst);
        self.emit(Event::new(EventType::MqttConnected, json!({"broker": self.broker}))).await;

        let weak = self.self_ref.lock().expect("self_ref lock poisoned").clone();
        let task = tokio::spawn(Self::listen_loop(weak));
        *self.listen_task.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessorError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.listen_task.lock().await.take() {
            task.abort();
        }
        self.manager.disconnect().await;
        self.emit(Event::new(EventType::MqttDisconnected, json!({"broker": self.broker}))).await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Implements `update` directly (spec §4.6) rather than going through the
/// processor pipeline: an `MQTT_PUBLISH` event supplies `{topic, payload,
/// qos, retain}` explicitly; any other event type publishes its `data`
/// (JSON-encoded unless already a string) to the configured default
/// topic at QoS 1.
pub struct MqttPublisherNode {
    inner: BaseNode,
    manager: Arc<MqttConnectionManager>,
    running: AtomicBool,
    default_topic: String,
}

impl MqttPublisherNode {
    pub fn new(id: impl Into<String>, config: MqttConfig, default_topic: impl Into<String>) -> Arc<Self> {
        let raw_config = serde_json::to_value(&config).unwrap_or(Value::Null);
        Arc::new(Self {
            inner: BaseNode::new(id, "mqtt_publisher").with_config(raw_config),
            manager: Arc::new(MqttConnectionManager::new(config)),
            running: AtomicBool::new(false),
            default_topic: default_topic.into(),
        })
    }

    fn encode_payload(payload: &Value) -> Vec<u8> {
        match payload {
            Value::String(s) => s.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        }
    }
}

#[async_trait]
impl GraphNode for MqttPublisherNode {
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
        if self.inner.state() == NodeState::Disabled {
            return;
        }

        let (topic, payload, qos, retain) = if event.event_type == EventType::MqttPublish {
            let topic = event
                .data
                .get("topic")
                .and_then(Value::as_str)
                .unwrap_or(&self.default_topic)
                .to_string();
            let payload = event.data.get("payload").cloned().unwrap_or(Value::Null);
            let qos = event.data.get("qos").and_then(Value::as_u64).unwrap_or(1) as u8;
            let retain = event.data.get("retain").and_then(Value::as_bool).unwrap_or(false);
            (topic, payload, qos, retain)
        } else {
            (self.default_topic.clone(), event.data.clone(), 1u8, false)
        };

        let result = self
            .manager
            .publish(&topic, Self::encode_payload(&payload), qos, retain)
            .await;

        let result_event = match result {
            Ok(()) => event.derive(EventType::ComputationResult, json!({"topic": topic, "published": true})),
            Err(err) => {
                error!(node = %self.inner.id(), error = %err, "mqtt publish failed");
                let mut evt = event.derive(EventType::Error, json!({"error": err.to_string(), "topic": topic}));
                evt.metadata.insert("status".to_string(), json!("error"));
                evt
            }
        };
        self.inner.notify_observers(result_event).await;
    }

    async fn notify_observers(&self, event: Event) {
        self.inner.notify_observers(event).await;
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
        self
    }
    fn as_lifecycle(&self) -> Option<&dyn Lifecycle> {
        Some(self)
    }
}

#[async_trait]
impl Lifecycle for MqttPublisherNode {
    async fn start(&self) -> Result<(), ProcessorError> {
        self.manager.connect().await?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessorError> {
        self.manager.disconnect().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_payload_prefers_json_then_text() {
        let (parsed, _) = decode_payload(br#"{"x":1}"#);
        assert_eq!(parsed, json!({"x": 1}));
        let (parsed, _) = decode_payload(b"plain text");
        assert_eq!(parsed, json!("plain text"));
    }

    #[test]
    fn encode_payload_uses_raw_string_bytes_not_quoted_json() {
        let bytes = MqttPublisherNode::encode_payload(&json!("hello"));
        assert_eq!(bytes, b"hello".to_vec());
        let bytes = MqttPublisherNode::encode_payload(&json!({"x": 1}));
        assert_eq!(bytes, br#"{"x":1}"#.to_vec());
    }

    #[test]
    fn qos_mapping_matches_mqtt_levels() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }
}
