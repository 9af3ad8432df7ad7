//! Retrying HTTP request processors (GET/POST/PUT/PATCH/DELETE), sharing
//! one request/retry/response-decoding core per verb shape (§4.5, §4.11).

use crate::error::ProcessorError;
use crate::event::{Event, EventType};
use crate::node::{Processor, ProcessingContext};
use crate::retry::{retry_with_delay, RetryConfig};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default)]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_retries() -> usize {
    1
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            retry_delay_secs: 0,
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpVerb {
    fn as_str(self) -> &'static str {
        match self {
            HttpVerb::Get => "GET",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Patch => "PATCH",
            HttpVerb::Delete => "DELETE",
        }
    }

    /// GET/DELETE carry no request body; POST/PUT/PATCH forward `data`.
    fn carries_body(self) -> bool {
        matches!(self, HttpVerb::Post | HttpVerb::Put | HttpVerb::Patch)
    }
}

/// Shared by the five verb processors below. `can_handle` accepts any
/// event whose `data.url` is an `http(s)://` string; `data.data` is the
/// optional request body for verbs that carry one.
pub struct HttpProcessor {
    verb: HttpVerb,
    config: HttpConfig,
    client: Client,
}

impl HttpProcessor {
    pub fn new(verb: HttpVerb, config: HttpConfig) -> Result<Self, ProcessorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProcessorError::io(e.to_string()))?;
        Ok(Self { verb, config, client })
    }

    pub fn get(config: HttpConfig) -> Result<Self, ProcessorError> {
        Self::new(HttpVerb::Get, config)
    }
    pub fn post(config: HttpConfig) -> Result<Self, ProcessorError> {
        Self::new(HttpVerb::Post, config)
    }
    pub fn put(config: HttpConfig) -> Result<Self, ProcessorError> {
        Self::new(HttpVerb::Put, config)
    }
    pub fn patch(config: HttpConfig) -> Result<Self, ProcessorError> {
        Self::new(HttpVerb::Patch, config)
    }
    pub fn delete(config: HttpConfig) -> Result<Self, ProcessorError> {
        Self::new(HttpVerb::Delete, config)
    }

    fn validate(&self, data: &Value) -> Result<(String, Option<Value>), ProcessorError> {
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ProcessorError::validation("missing 'url' field"))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ProcessorError::validation(format!(
                "url must begin with http:// or https://, got {url:?}"
            )));
        }
        let body = if self.verb.carries_body() { data.get("data").cloned() } else { None };
        Ok((url.to_string(), body))
    }

    async fn attempt(&self, url: &str, body: &Option<Value>) -> Result<(Value, u16), ProcessorError> {
        let mut request = match self.verb {
            HttpVerb::Get => self.client.get(url),
            HttpVerb::Post => self.client.post(url),
            HttpVerb::Put => self.client.put(url),
            HttpVerb::Patch => self.client.patch(url),
            HttpVerb::Delete => self.client.delete(url),
        };
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?.error_for_status()?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let bytes = response.bytes().await?;
        let content = if content_type.contains("application/json") {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
        } else if let Ok(text) = std::str::from_utf8(&bytes) {
            json!(text)
        } else {
            json!(STANDARD.encode(&bytes))
        };
        Ok((content, status))
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    fn can_handle(&self, event: &Event) -> bool {
        event.data.get("url").and_then(Value::as_str).is_some()
    }

    async fn process(
        &self,
        event: &Event,
        _ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        let (url, body) = match self.validate(&event.data) {
            Ok(v) => v,
            Err(err) => return Ok(Some(error_event(event, &err))),
        };

        let retry_config = RetryConfig::new(
            self.config.retries.max(1),
            Duration::from_secs(self.config.retry_delay_secs),
        );

        match retry_with_delay(&retry_config, self.verb.as_str(), |_attempt| self.attempt(&url, &body)).await {
            Ok(((content, status), attempt)) => {
                let mut evt = event.derive(EventType::ComputationResult, json!({"content": content, "status": status}));
                evt.metadata.insert("attempt".to_string(), json!(attempt));
                Ok(Some(evt))
            }
            Err(err) => Ok(Some(error_event(event, &err))),
        }
    }

    fn name(&self) -> &str {
        match self.verb {
            HttpVerb::Get => "http_get_processor",
            HttpVerb::Post => "http_post_processor",
            HttpVerb::Put => "http_put_processor",
            HttpVerb::Patch => "http_patch_processor",
            HttpVerb::Delete => "http_delete_processor",
        }
    }
}

fn error_event(original: &Event, err: &ProcessorError) -> Event {
    let mut evt = original.derive(
        EventType::Error,
        json!({"error": err.to_string(), "original_request": original.data}),
    );
    evt.metadata.insert("status".to_string(), json!("error"));
    evt
}
