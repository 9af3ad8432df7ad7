//! `MapperProcessor`: object/array reshaping via JMESPath source
//! extraction, dotted-path target assembly, and a small closed set of
//! scalar transforms.

use crate::error::ProcessorError;
use crate::event::{Event, EventType};
use crate::node::ProcessingContext;
use crate::node::Processor;
use crate::predicate;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transform: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ArraySettings {
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub item_mappings: Vec<FieldMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissingRequired {
    Error,
    Skip,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTransformError {
    Error,
    Skip,
    Original,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorHandling {
    #[serde(default = "default_on_missing_required")]
    pub on_missing_required: OnMissingRequired,
    #[serde(default = "default_on_transform_error")]
    pub on_transform_error: OnTransformError,
}

fn default_on_missing_required() -> OnMissingRequired {
    OnMissingRequired::Error
}
fn default_on_transform_error() -> OnTransformError {
    OnTransformError::Skip
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            on_missing_required: default_on_missing_required(),
            on_transform_error: default_on_transform_error(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapperMode {
    Object,
    Array,
}

impl Default for MapperMode {
    fn default() -> Self {
        MapperMode::Object
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MapperConfig {
    #[serde(default)]
    pub mode: MapperMode,
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub array_settings: ArraySettings,
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

struct MissingRequired(String);

/// JMESPath expressions are compiled fresh per lookup rather than cached
/// as a struct field: `jmespath::Expression` is `Rc`-backed and therefore
/// neither `Send` nor `Sync`, while `Processor` requires both so the node
/// can hold `Arc<dyn Processor>` across the async pipeline. Construction
/// still eagerly validates every configured path so a malformed
/// expression warns once up front instead of silently on first use,
/// mirroring the original engine's `_compile_mappings` pass.
pub struct MapperProcessor {
    config: MapperConfig,
}

impl MapperProcessor {
    pub fn new(config: MapperConfig) -> Self {
        for mapping in config.mappings.iter().chain(config.array_settings.item_mappings.iter()) {
            if jmespath::compile(&mapping.source).is_err() {
                warn!(source = %mapping.source, "invalid JMESPath expression, will resolve to null");
            }
        }
        Self { config }
    }

    fn search(source: &str, data: &Value) -> Option<Value> {
        let expr = jmespath::compile(source).ok()?;
        let result = expr.search(data.clone()).ok()?;
        serde_json::to_value(&*result).ok().filter(|v| !v.is_null())
    }

    fn extract_value(mapping: &FieldMapping, data: &Value) -> Result<Value, MissingRequired> {
        match Self::search(&mapping.source, data) {
            Some(v) => Ok(v),
            None if mapping.required => Err(MissingRequired(mapping.source.clone())),
            None => Ok(mapping.default.clone().unwrap_or(Value::Null)),
        }
    }

    fn apply_transform(
        &self,
        value: Value,
        transform: &str,
    ) -> Result<Value, ProcessorError> {
        if value.is_null() {
            return Ok(value);
        }
        let transformed = match transform {
            "string" => Some(json!(to_display_string(&value))),
            "number" => {
                let s = to_display_string(&value);
                if s.contains('.') {
                    s.parse::<f64>().ok().map(|f| json!(f))
                } else {
                    s.parse::<i64>().ok().map(|i| json!(i))
                }
            }
            "integer" => as_i64(&value).map(|i| json!(i)),
            "float" => as_f64(&value).map(|f| json!(f)),
            "boolean" => Some(json!(predicate::is_truthy(&value))),
            "lowercase" => Some(json!(to_display_string(&value).to_lowercase())),
            "uppercase" => Some(json!(to_display_string(&value).to_uppercase())),
            "trim" => Some(json!(to_display_string(&value).trim().to_string())),
            other => {
                warn!(transform = other, "unknown transform, passing value through unchanged");
                return Ok(value);
            }
        };

        match transformed {
            Some(v) => Ok(v),
            None => match self.config.error_handling.on_transform_error {
                OnTransformError::Error => {
                    Err(ProcessorError::mapping(format!("transform '{transform}' failed")))
                }
                OnTransformError::Original => Ok(value),
                OnTransformError::Skip => Ok(Value::Null),
            },
        }
    }

    fn process_object(&self, data: &Value) -> Result<Value, ProcessorError> {
        let mut result = Map::new();
        for mapping in &self.config.mappings {
            let value = match Self::extract_value(mapping, data) {
                Ok(v) => v,
                Err(MissingRequired(source)) => match self.config.error_handling.on_missing_required {
                    OnMissingRequired::Error => {
                        return Err(ProcessorError::mapping(format!(
                            "required field '{source}' not found"
                        )))
                    }
                    OnMissingRequired::Null => {
                        set_nested(&mut result, &mapping.target, Value::Null);
                        continue;
                    }
                    OnMissingRequired::Skip => continue,
                },
            };

            let value = if value.is_null() {
                value
            } else if let Some(transform) = &mapping.transform {
                self.apply_transform(value, transform)?
            } else {
                value
            };

            if !value.is_null() {
                set_nested(&mut result, &mapping.target, value);
            } else if let Some(default) = &mapping.default {
                set_nested(&mut result, &mapping.target, default.clone());
            }
        }
        Ok(Value::Object(result))
    }

    fn process_array(&self, data: &Value) -> Result<Value, ProcessorError> {
        let settings = &self.config.array_settings;
        let source_array = if settings.source_path.is_empty() {
            data.clone()
        } else {
            Self::search(&settings.source_path, data).unwrap_or(Value::Null)
        };
        let Value::Array(mut items) = source_array else {
            return Err(ProcessorError::mapping(format!(
                "source path '{}' did not resolve to an array",
                settings.source_path
            )));
        };

        if let Some(filter) = &settings.filter {
            items.retain(|item| predicate::evaluate_bool(filter, item));
        }

        if settings.item_mappings.is_empty() {
            return Ok(Value::Array(items));
        }

        let mut mapped = Vec::with_capacity(items.len());
        for item in &items {
            let mut out = Map::new();
            for mapping in &settings.item_mappings {
                match Self::extract_value(mapping, item) {
                    Ok(value) if !value.is_null() => {
                        let value = match &mapping.transform {
                            Some(t) => self.apply_transform(value, t)?,
                            None => value,
                        };
                        set_nested(&mut out, &mapping.target, value);
                    }
                    Ok(_) => {
                        if let Some(default) = &mapping.default {
                            set_nested(&mut out, &mapping.target, default.clone());
                        }
                    }
                    Err(MissingRequired(source)) => {
                        return Err(ProcessorError::mapping(format!(
                            "required field '{source}' not found"
                        )))
                    }
                }
            }
            mapped.push(Value::Object(out));
        }
        Ok(Value::Array(mapped))
    }
}

#[async_trait]
impl Processor for MapperProcessor {
    fn can_handle(&self, event: &Event) -> bool {
        !event.data.is_null()
    }

    async fn process(
        &self,
        event: &Event,
        _ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        let result = match self.config.mode {
            MapperMode::Object => self.process_object(&event.data),
            MapperMode::Array => self.process_array(&event.data),
        };

        match result {
            Ok(data) => {
                let mappings_applied = match self.config.mode {
                    MapperMode::Object => self.config.mappings.len(),
                    MapperMode::Array => self.config.array_settings.item_mappings.len(),
                };
                let mut evt = event.derive(EventType::ComputationResult, data);
                evt.metadata.insert("status".to_string(), json!("success"));
                evt.metadata.insert(
                    "mapper_mode".to_string(),
                    json!(match self.config.mode {
                        MapperMode::Object => "object",
                        MapperMode::Array => "array",
                    }),
                );
                evt.metadata.insert("mappings_applied".to_string(), json!(mappings_applied));
                Ok(Some(evt))
            }
            Err(err) => {
                let mut evt = event.derive(
                    EventType::Error,
                    json!({"error": err.to_string(), "original_data": event.data}),
                );
                evt.metadata.insert("status".to_string(), json!("error"));
                Ok(Some(evt))
            }
        }
    }

    fn name(&self) -> &str {
        "mapper_processor"
    }
}

fn set_nested(obj: &mut Map<String, Value>, path: &str, value: Value) {
    let mut keys = path.split('.').peekable();
    let mut current = obj;
    while let Some(key) = keys.next() {
        if keys.peek().is_none() {
            current.insert(key.to_string(), value);
            return;
        }
        let entry = current.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
}

fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1 } else { 0 }),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ProcessingContext {
        ProcessingContext {
            node_id: "mapper".into(),
            node_type: "mapper".into(),
            config: Value::Null,
            current_data: None,
            incoming_nodes: vec![],
            outgoing_nodes: vec![],
            metrics: Default::default(),
            recent_events: vec![],
        }
    }

    #[tokio::test]
    async fn object_mode_maps_nested_fields() {
        let processor = MapperProcessor::new(MapperConfig {
            mode: MapperMode::Object,
            mappings: vec![
                FieldMapping {
                    source: "user.name".into(),
                    target: "n".into(),
                    default: None,
                    required: false,
                    transform: None,
                },
                FieldMapping {
                    source: "user.email".into(),
                    target: "e".into(),
                    default: None,
                    required: true,
                    transform: None,
                },
            ],
            array_settings: ArraySettings::default(),
            error_handling: ErrorHandling::default(),
        });
        let event = Event::new(
            EventType::DataChange,
            json!({"user": {"name": "Ada", "email": "a@x"}}),
        );
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        assert_eq!(result.data, json!({"n": "Ada", "e": "a@x"}));
    }

    #[tokio::test]
    async fn missing_required_field_with_error_policy_emits_error_event() {
        let processor = MapperProcessor::new(MapperConfig {
            mode: MapperMode::Object,
            mappings: vec![FieldMapping {
                source: "user.email".into(),
                target: "e".into(),
                default: None,
                required: true,
                transform: None,
            }],
            array_settings: ArraySettings::default(),
            error_handling: ErrorHandling::default(),
        });
        let event = Event::new(EventType::DataChange, json!({"user": {"name": "Ada"}}));
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        assert_eq!(result.event_type, EventType::Error);
    }

    #[tokio::test]
    async fn transform_lowercases_and_trims() {
        let processor = MapperProcessor::new(MapperConfig {
            mode: MapperMode::Object,
            mappings: vec![FieldMapping {
                source: "tag".into(),
                target: "tag".into(),
                default: None,
                required: false,
                transform: Some("lowercase".into()),
            }],
            array_settings: ArraySettings::default(),
            error_handling: ErrorHandling::default(),
        });
        let event = Event::new(EventType::DataChange, json!({"tag": "ACTIVE"}));
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        assert_eq!(result.data, json!({"tag": "active"}));
    }

    #[tokio::test]
    async fn array_mode_filters_and_maps_items() {
        let processor = MapperProcessor::new(MapperConfig {
            mode: MapperMode::Array,
            mappings: vec![],
            array_settings: ArraySettings {
                source_path: "items".into(),
                filter: Some(json!({">": [{"var": "price"}, 10]})),
                item_mappings: vec![FieldMapping {
                    source: "name".into(),
                    target: "label".into(),
                    default: None,
                    required: false,
                    transform: None,
                }],
            },
            error_handling: ErrorHandling::default(),
        });
        let event = Event::new(
            EventType::DataChange,
            json!({"items": [{"name": "cheap", "price": 5}, {"name": "pricey", "price": 20}]}),
        );
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        assert_eq!(result.data, json!([{"label": "pricey"}]));
    }

    #[tokio::test]
    async fn identity_mapping_is_a_noop_on_declared_subset() {
        let processor = MapperProcessor::new(MapperConfig {
            mode: MapperMode::Object,
            mappings: vec![FieldMapping {
                source: "a".into(),
                target: "a".into(),
                default: None,
                required: false,
                transform: None,
            }],
            array_settings: ArraySettings::default(),
            error_handling: ErrorHandling::default(),
        });
        let event = Event::new(EventType::DataChange, json!({"a": 1, "b": 2}));
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        assert_eq!(result.data, json!({"a": 1}));
    }

    #[test]
    fn can_handle_rejects_null_data() {
        let processor = MapperProcessor::new(MapperConfig::default());
        let event = Event::new(EventType::DataChange, Value::Null);
        assert!(!processor.can_handle(&event));
    }
}
