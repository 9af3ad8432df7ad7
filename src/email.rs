//! SMTP email sink: a validating middleware in front of a processor that
//! merges per-event fields over config defaults, builds a multipart
//! message, and sends it over `lettre` (§4.7, §4.9).

use crate::error::ProcessorError;
use crate::event::{Event, EventType};
use crate::node::{Middleware, Processor, ProcessingContext};
use async_trait::async_trait;
use lettre::message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpCredentials {
    pub server_name: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub use_tls: bool,
}

fn default_port() -> u16 {
    25
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EmailConfig {
    pub credential: SmtpCredentials,
    /// Defaults layered under every event's data (event wins), mirroring
    /// `config_email_settings` in the original processor.
    #[serde(default)]
    pub email_settings: Value,
    #[serde(default)]
    pub default_from: Option<String>,
}

impl Default for SmtpCredentials {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            server_port: default_port(),
            username: None,
            password: None,
            use_ssl: false,
            use_tls: false,
        }
    }
}

/// Rejects an event missing `to`/`subject` before a socket is ever
/// opened, mirroring `_validate_request_data` running ahead of
/// `_connect` in the original processor.
pub struct EmailValidationMiddleware {
    config: EmailConfig,
}

impl EmailValidationMiddleware {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn merge(&self, event_data: &Value) -> Value {
        let mut merged = self.config.email_settings.clone();
        if !merged.is_object() {
            merged = json!({});
        }
        crate::config::deep_merge(&mut merged, event_data);
        if merged.get("from").is_none() {
            let from = self
                .config
                .default_from
                .clone()
                .or_else(|| self.config.credential.username.clone())
                .unwrap_or_else(|| "noreply@localhost".to_string());
            merged["from"] = json!(from);
        }
        merged
    }
}

#[async_trait]
impl Middleware for EmailValidationMiddleware {
    async fn before_process(&self, mut event: Event, node_id: &str) -> Result<Event, ProcessorError> {
        let merged = self.merge(&event.data);
        let mut errors = Vec::new();
        if merged.get("to").and_then(non_empty).is_none() {
            errors.push("missing required field: to".to_string());
        }
        if merged.get("subject").and_then(non_empty).is_none() {
            errors.push("missing required field: subject".to_string());
        }

        if !errors.is_empty() {
            warn!(node_id, errors = ?errors, "email validation failed");
            let mut err_evt = event.derive(
                EventType::Error,
                json!({"error": errors.join("; "), "original_request": event.data}),
            );
            err_evt.metadata.insert("status".to_string(), json!("error"));
            return Ok(err_evt);
        }

        event.data = merged;
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

fn non_empty(v: &Value) -> Option<&Value> {
    match v {
        Value::String(s) if s.trim().is_empty() => None,
        Value::Null => None,
        other => Some(other),
    }
}

/// Sends a (possibly already-validated-and-merged) email over SMTP.
/// `can_handle` accepts any event — the validation middleware, not this
/// processor, is responsible for rejecting malformed requests.
pub struct EmailSenderProcessor {
    config: EmailConfig,
}

impl EmailSenderProcessor {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn recipients(data: &Value, field: &str) -> Vec<String> {
        match data.get(field) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            _ => Vec::new(),
        }
    }

    fn mailbox(addr: &str) -> Result<Mailbox, ProcessorError> {
        addr.parse()
            .map_err(|e| ProcessorError::validation(format!("invalid address {addr:?}: {e}")))
    }

    fn build_message(&self, data: &Value) -> Result<Message, ProcessorError> {
        let from = data
            .get("from")
            .and_then(Value::as_str)
            .ok_or_else(|| ProcessorError::validation("missing from address"))?;
        let to = Self::recipients(data, "to");
        if to.is_empty() {
            return Err(ProcessorError::validation("no 'to' recipients"));
        }
        let subject = data
            .get("subject")
            .and_then(Value::as_str)
            .ok_or_else(|| ProcessorError::validation("missing subject"))?;

        let mut builder = Message::builder().from(Self::mailbox(from)?).subject(subject);
        for addr in &to {
            builder = builder.to(Self::mailbox(addr)?);
        }
        for addr in Self::recipients(data, "cc") {
            builder = builder.cc(Self::mailbox(&addr)?);
        }
        for addr in Self::recipients(data, "bcc") {
            builder = builder.bcc(Self::mailbox(&addr)?);
        }

        let body = data
            .get("body")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "No content provided".to_string());

        let mut multipart = if let Some(html_body) = data.get("html_body").and_then(Value::as_str) {
            MultiPart::alternative()
                .singlepart(SinglePart::plain(body))
                .singlepart(SinglePart::html(html_body.to_string()))
        } else {
            MultiPart::mixed().singlepart(SinglePart::plain(body))
        };

        if let Some(attachments) = data.get("attachments").and_then(Value::as_array) {
            for att in attachments {
                let filename = att.get("filename").and_then(Value::as_str).unwrap_or("attachment");
                let content = att.get("content").and_then(Value::as_str).unwrap_or("");
                let part = Attachment::new(filename.to_string())
                    .body(content.as_bytes().to_vec(), ContentType::parse("application/octet-stream").unwrap());
                multipart = multipart.singlepart(part);
            }
        }

        builder
            .multipart(multipart)
            .map_err(|e| ProcessorError::validation(format!("failed to build message: {e}")))
    }

    async fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, ProcessorError> {
        let cred = &self.config.credential;
        let builder = if cred.use_ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cred.server_name)
        } else if cred.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cred.server_name)
        } else {
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cred.server_name))
        }
        .map_err(|e| ProcessorError::protocol(e.to_string()))?
        .port(cred.server_port);

        let builder = match (&cred.username, &cred.password) {
            (Some(user), Some(pass)) => builder.credentials(Credentials::new(user.clone(), pass.clone())),
            _ => {
                info!("no SMTP credentials provided, skipping authentication");
                builder
            }
        };
        Ok(builder.build())
    }
}

#[async_trait]
impl Processor for EmailSenderProcessor {
    fn can_handle(&self, _event: &Event) -> bool {
        true
    }

    async fn process(
        &self,
        event: &Event,
        ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        let message = match self.build_message(&event.data) {
            Ok(m) => m,
            Err(err) => return Ok(Some(error_event(event, &ctx.node_id, &err))),
        };

        let transport = self.transport().await?;
        match transport.send(message).await {
            Ok(_) => {
                info!(node = %ctx.node_id, "email sent successfully");
                let mut evt = event.derive(EventType::ComputationResult, json!({"status": "sent", "message": "Email sent successfully"}));
                evt.metadata.insert("status".to_string(), json!("success"));
                Ok(Some(evt))
            }
            Err(err) => {
                error!(node = %ctx.node_id, error = %err, "email sending failed");
                Ok(Some(error_event(event, &ctx.node_id, &ProcessorError::io(err.to_string()))))
            }
        }
    }

    fn name(&self) -> &str {
        "email_sender_processor"
    }
}

fn error_event(original: &Event, node_id: &str, err: &ProcessorError) -> Event {
    let mut evt = original.derive(
        EventType::Error,
        json!({"error": format!("email sending failed: {err}"), "original_request": original.data}),
    );
    evt.source_node = Some(node_id.to_string());
    evt.metadata.insert("status".to_string(), json!("error"));
    evt
}
