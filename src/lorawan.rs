//! LoRaWAN downlink sink: base64-encodes a hex or text payload and POSTs
//! a provider-shaped body (TTN/ChirpStack/Helium) with retries (§4.7,
//! §4.10).

use crate::error::ProcessorError;
use crate::event::{Event, EventType};
use crate::node::{Middleware, Processor, ProcessingContext};
use crate::retry::{retry_with_delay, RetryConfig};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const MAX_PAYLOAD_BYTES: usize = 242;
const TYPICAL_MAX_PAYLOAD_BYTES: usize = 51;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum NetworkProvider {
    #[default]
    Ttn,
    ChirpStack,
    Helium,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoRaWanConfig {
    #[serde(default)]
    pub network_provider: NetworkProvider,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    pub device_id: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_f_port")]
    pub f_port: u8,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_true")]
    pub warn_on_large_payload: bool,
}

fn default_f_port() -> u8 {
    1
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retries() -> usize {
    3
}
fn default_retry_delay_secs() -> u64 {
    1
}
fn default_true() -> bool {
    true
}

/// Checks `api_url`/`api_key`/`device_id` are present and the resolved
/// payload (config default, overridden by `event.data.payload`) is
/// within LoRaWAN's downlink size limits before the processor encodes
/// and POSTs it.
pub struct LoRaWanValidationMiddleware {
    config: LoRaWanConfig,
}

impl LoRaWanValidationMiddleware {
    pub fn new(config: LoRaWanConfig) -> Self {
        Self { config }
    }

    fn resolved_payload<'a>(&'a self, event_data: &'a Value) -> &'a str {
        event_data.get("payload").and_then(Value::as_str).unwrap_or(&self.config.payload)
    }
}

#[async_trait]
impl Middleware for LoRaWanValidationMiddleware {
    async fn before_process(&self, event: Event, node_id: &str) -> Result<Event, ProcessorError> {
        let mut errors = Vec::new();
        if self.config.api_url.is_empty() {
            errors.push("missing required field: api_url".to_string());
        }
        if self.config.api_key.is_empty() {
            errors.push("missing required field: api_key".to_string());
        }
        if self.config.device_id.is_empty() {
            errors.push("missing required field: device_id".to_string());
        }

        let payload = self.resolved_payload(&event.data);
        if !payload.is_empty() {
            let bytes = payload_bytes(payload);
            if bytes.len() > MAX_PAYLOAD_BYTES {
                errors.push(format!(
                    "payload size ({} bytes) exceeds LoRaWAN maximum ({MAX_PAYLOAD_BYTES} bytes)",
                    bytes.len()
                ));
            } else if bytes.len() > TYPICAL_MAX_PAYLOAD_BYTES && self.config.warn_on_large_payload {
                warn!(
                    node_id,
                    bytes = bytes.len(),
                    "LoRaWAN payload may be too large for low data rates"
                );
            }
        }

        if !errors.is_empty() {
            let message = errors.join("; ");
            warn!(node_id, error = %message, "lorawan validation failed");
            let mut err_evt = event.derive(
                EventType::Error,
                json!({"error": message, "validation_errors": errors, "original_request": event.data}),
            );
            err_evt.metadata.insert("status".to_string(), json!("validation_error"));
            return Ok(err_evt);
        }

        Ok(event)
    }

    async fn after_process(
        &self,
        _original: &Event,
        result: Option<Event>,
        _node_id: &str,
    ) -> Result<Option<Event>, ProcessorError> {
        Ok(result)
    }
}

/// Hex (`0x...` or bare) payloads decode to raw bytes; anything else is
/// treated as UTF-8 text, matching the original's `_encode_payload`.
fn payload_bytes(payload: &str) -> Vec<u8> {
    let candidate = payload.strip_prefix("0x").unwrap_or(payload);
    if !candidate.is_empty() && candidate.len() % 2 == 0 && candidate.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Ok(bytes) = hex_decode(candidate) {
            return bytes;
        }
    }
    payload.as_bytes().to_vec()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, std::num::ParseIntError> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
        .collect()
}

/// Sends a downlink to a LoRaWAN network server. `can_handle` mirrors the
/// original's `DATA_CHANGE`/`CUSTOM` dispatch.
pub struct LoRaWanProcessor {
    config: LoRaWanConfig,
    client: Client,
}

impl LoRaWanProcessor {
    pub fn new(config: LoRaWanConfig) -> Result<Self, ProcessorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProcessorError::io(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn request_body(&self, base64_payload: &str) -> Value {
        let f_port = self.config.f_port;
        match self.config.network_provider {
            NetworkProvider::Ttn => json!({
                "downlinks": [{"f_port": f_port, "frm_payload": base64_payload, "priority": "NORMAL"}]
            }),
            NetworkProvider::ChirpStack => json!({
                "deviceQueueItem": {"data": base64_payload, "fPort": f_port, "confirmed": false}
            }),
            NetworkProvider::Helium => json!({
                "payload_raw": base64_payload, "port": f_port, "confirmed": false
            }),
        }
    }

    fn auth_header_name(&self) -> &'static str {
        match self.config.network_provider {
            NetworkProvider::ChirpStack => "Grpc-Metadata-Authorization",
            _ => "Authorization",
        }
    }

    async fn attempt(&self, body: &Value) -> Result<(Value, u16), ProcessorError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .header("Content-Type", "application/json")
            .header(self.auth_header_name(), format!("Bearer {}", self.config.api_key))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProcessorError::protocol(format!("downlink rejected: HTTP {status}")));
        }
        let status_code = status.as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = response.bytes().await?;
        let content = if content_type.contains("application/json") {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
        } else {
            json!(String::from_utf8_lossy(&bytes))
        };
        Ok((content, status_code))
    }
}

#[async_trait]
impl Processor for LoRaWanProcessor {
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.event_type, EventType::DataChange | EventType::Custom(_))
    }

    async fn process(
        &self,
        event: &Event,
        _ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        let payload = event.data.get("payload").and_then(Value::as_str).unwrap_or(&self.config.payload);
        let base64_payload = STANDARD.encode(payload_bytes(payload));
        let body = self.request_body(&base64_payload);

        let retry_config = RetryConfig::new(
            self.config.retries.max(1),
            Duration::from_secs(self.config.retry_delay_secs),
        );

        match retry_with_delay(&retry_config, "lorawan_downlink", |_| self.attempt(&body)).await {
            Ok(((content, status), attempt)) => {
                info!(device = %self.config.device_id, attempt, "lorawan downlink sent");
                let mut evt = event.derive(
                    EventType::ComputationResult,
                    json!({
                        "content": content,
                        "status": status,
                        "device_id": self.config.device_id,
                        "payload_sent": base64_payload,
                    }),
                );
                evt.metadata.insert("attempt".to_string(), json!(attempt));
                Ok(Some(evt))
            }
            Err(err) => Ok(Some(error_event(event, &self.config.device_id, &err))),
        }
    }

    fn name(&self) -> &str {
        "lorawan_processor"
    }
}

fn error_event(original: &Event, device_id: &str, err: &ProcessorError) -> Event {
    let mut evt = original.derive(
        EventType::Error,
        json!({"error": err.to_string(), "original_request": original.data, "device_id": device_id}),
    );
    evt.metadata.insert("status".to_string(), json!("error"));
    evt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LoRaWanConfig {
        LoRaWanConfig {
            network_provider: NetworkProvider::Ttn,
            api_url: "https://example.com/downlink".into(),
            api_key: "key".into(),
            device_id: "dev-1".into(),
            payload: "deadbeef".into(),
            f_port: 1,
            timeout_secs: 5,
            retries: 2,
            retry_delay_secs: 0,
            warn_on_large_payload: true,
        }
    }

    #[test]
    fn hex_payload_decodes_to_bytes() {
        assert_eq!(payload_bytes("0xdeadbeef"), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(payload_bytes("deadbeef"), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn non_hex_payload_is_utf8_text() {
        assert_eq!(payload_bytes("hello"), b"hello".to_vec());
    }

    #[test]
    fn ttn_request_body_shape() {
        let processor = LoRaWanProcessor::new(config()).unwrap();
        let body = processor.request_body("3q2+7w==");
        assert_eq!(body["downlinks"][0]["frm_payload"], "3q2+7w==");
    }

    #[tokio::test]
    async fn validation_middleware_rejects_missing_api_url() {
        let mut cfg = config();
        cfg.api_url = String::new();
        let mw = LoRaWanValidationMiddleware::new(cfg);
        let event = Event::new(EventType::DataChange, json!({}));
        let result = mw.before_process(event, "lora").await.unwrap();
        assert_eq!(result.event_type, EventType::Error);
    }

    #[tokio::test]
    async fn validation_middleware_rejects_oversized_payload() {
        let mut cfg = config();
        cfg.payload = "a".repeat(500);
        let mw = LoRaWanValidationMiddleware::new(cfg);
        let event = Event::new(EventType::DataChange, json!({}));
        let result = mw.before_process(event, "lora").await.unwrap();
        assert_eq!(result.event_type, EventType::Error);
        assert_eq!(result.metadata.get("status").unwrap(), "validation_error");
    }

    #[tokio::test]
    async fn validation_middleware_passes_valid_config() {
        let mw = LoRaWanValidationMiddleware::new(config());
        let event = Event::new(EventType::DataChange, json!({}));
        let result = mw.before_process(event, "lora").await.unwrap();
        assert_ne!(result.event_type, EventType::Error);
    }
}
