//! Error types for the graph engine.
//!
//! Every module boundary converts its failures into one of these enums
//! before they cross into code that must not assume a particular cause.
//! `GraphError` is the top-level type returned by `ObserverGraph` and
//! `BaseNode` entry points; `ProcessorError` is the type `Processor`/
//! `Middleware` implementations return, and is folded into an `Error`
//! event rather than propagated past `BaseNode::update`.

use thiserror::Error;

/// Errors a `Processor` or `Middleware` can raise while handling an event.
#[derive(Debug, Error, Clone)]
pub enum ProcessorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("mapping error: {0}")]
    Mapping(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0}")]
    Other(String),
}

impl ProcessorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// The taxonomy kind name, used as the `Error` event's `kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Io(_) => "io",
            Self::Mapping(_) => "mapping",
            Self::Protocol(_) => "protocol",
            Self::Timeout(_) => "timeout",
            Self::Other(_) => "other",
        }
    }
}

impl crate::retry::Retryable for ProcessorError {
    /// Transient I/O failures and timeouts are retried; validation,
    /// mapping, and protocol failures are not (spec §7 taxonomy).
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for ProcessorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProcessorError::Timeout(std::time::Duration::from_secs(0))
        } else {
            ProcessorError::Io(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(e: serde_json::Error) -> Self {
        ProcessorError::Mapping(e.to_string())
    }
}

impl From<std::io::Error> for ProcessorError {
    fn from(e: std::io::Error) -> Self {
        ProcessorError::Io(e.to_string())
    }
}

/// Errors raised by the graph registry / node lifecycle machinery itself,
/// as opposed to errors raised while processing a particular event.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no node registered with id {0:?}")]
    UnknownNode(String),

    #[error("node {0:?} is already registered")]
    DuplicateNode(String),

    #[error("node {0:?} failed to start: {1}")]
    StartFailed(String, String),

    #[error("node {0:?} failed to stop: {1}")]
    StopFailed(String, String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),
}

/// Errors from loading and merging YAML graph/node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path:?}: {source}")]
    Parse {
        path: std::path::PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to deserialize configuration: {0}")]
    Deserialize(String),
}

/// Errors raised by the MQTT connection manager.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("not connected")]
    NotConnected,

    #[error("subscribe failed on {topic:?}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("publish failed on {topic:?}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("client error: {0}")]
    Client(String),
}

impl From<MqttError> for ProcessorError {
    fn from(e: MqttError) -> Self {
        ProcessorError::Protocol(e.to_string())
    }
}
