//! Format converters: plain `Processor`s that turn a JSON payload into a
//! `FileConverted` event carrying rendered CSV/XML/HTML text.

use crate::error::ProcessorError;
use crate::event::{Event, EventType};
use crate::node::{Processor, ProcessingContext};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

fn rows_of(data: &Value) -> Option<Vec<&Map<String, Value>>> {
    match data {
        Value::Array(items) => items.iter().map(|v| v.as_object()).collect(),
        Value::Object(obj) => Some(vec![obj]),
        _ => None,
    }
}

fn flatten(prefix: &str, value: &Value, sep: &str, out: &mut Map<String, Value>) {
    match value {
        Value::Object(obj) => {
            for (k, v) in obj {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}{sep}{k}") };
                flatten(&key, v, sep, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsvConfig {
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_true")]
    pub include_headers: bool,
    #[serde(default)]
    pub sort_headers: bool,
}

fn default_separator() -> String {
    ",".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self { separator: default_separator(), include_headers: true, sort_headers: false }
    }
}

/// JSON → CSV: flattens nested objects with `.`-joined keys, quotes any
/// cell containing the separator, a quote, or a newline.
pub struct JsonToCsvProcessor {
    config: CsvConfig,
}

impl JsonToCsvProcessor {
    pub fn new(config: CsvConfig) -> Self {
        Self { config }
    }

    fn quote_if_needed(&self, cell: &str) -> String {
        if cell.contains(&self.config.separator) || cell.contains('"') || cell.contains('\n') {
            format!("\"{}\"", cell.replace('"', "\"\""))
        } else {
            cell.to_string()
        }
    }

    fn render(&self, data: &Value) -> Result<String, ProcessorError> {
        let rows = rows_of(data)
            .ok_or_else(|| ProcessorError::validation("CSV conversion requires an object or array of objects"))?;

        let flattened: Vec<Map<String, Value>> = rows
            .iter()
            .map(|row| {
                let mut out = Map::new();
                flatten("", &Value::Object((*row).clone()), ".", &mut out);
                out
            })
            .collect();

        let mut headers: Vec<String> = {
            let mut seen = BTreeSet::new();
            let mut ordered = Vec::new();
            for row in &flattened {
                for key in row.keys() {
                    if seen.insert(key.clone()) {
                        ordered.push(key.clone());
                    }
                }
            }
            ordered
        };
        if self.config.sort_headers {
            headers.sort();
        }

        let mut lines = Vec::new();
        if self.config.include_headers {
            lines.push(
                headers.iter().map(|h| self.quote_if_needed(h)).collect::<Vec<_>>().join(&self.config.separator),
            );
        }
        for row in &flattened {
            let cells: Vec<String> = headers
                .iter()
                .map(|h| self.quote_if_needed(&row.get(h).map(cell_to_string).unwrap_or_default()))
                .collect();
            lines.push(cells.join(&self.config.separator));
        }
        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl Processor for JsonToCsvProcessor {
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.event_type, EventType::ComputationResult | EventType::DataChange)
            && rows_of(&event.data).is_some()
    }

    async fn process(
        &self,
        event: &Event,
        _ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        let content = self.render(&event.data)?;
        Ok(Some(converted_event(event, content, "csv")))
    }

    fn name(&self) -> &str {
        "json_to_csv_processor"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct XmlConfig {
    #[serde(default = "default_root_element")]
    pub root_element: String,
    #[serde(default = "default_item_element")]
    pub item_element: String,
}

fn default_root_element() -> String {
    "root".to_string()
}
fn default_item_element() -> String {
    "item".to_string()
}

impl Default for XmlConfig {
    fn default() -> Self {
        Self { root_element: default_root_element(), item_element: default_item_element() }
    }
}

/// JSON → XML: recursive element-per-key rendering; arrays become
/// repeated sibling elements named after the parent key's singular form
/// (falls back to `item_element` when the parent key is itself `root`).
pub struct JsonToXmlProcessor {
    config: XmlConfig,
}

impl JsonToXmlProcessor {
    pub fn new(config: XmlConfig) -> Self {
        Self { config }
    }

    fn render(&self, data: &Value) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&self.element(&self.config.root_element, data));
        out
    }

    fn element(&self, tag: &str, value: &Value) -> String {
        match value {
            Value::Object(obj) => {
                let mut inner = String::new();
                for (k, v) in obj {
                    inner.push_str(&self.element(k, v));
                }
                format!("<{tag}>{inner}</{tag}>")
            }
            Value::Array(items) => {
                let mut out = String::new();
                for item in items {
                    out.push_str(&self.element(&self.config.item_element, item));
                }
                format!("<{tag}>{out}</{tag}>")
            }
            Value::Null => format!("<{tag}/>"),
            other => format!("<{tag}>{}</{tag}>", escape_xml(&cell_to_string(other))),
        }
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[async_trait]
impl Processor for JsonToXmlProcessor {
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.event_type, EventType::ComputationResult | EventType::DataChange)
            && !event.data.is_null()
    }

    async fn process(
        &self,
        event: &Event,
        _ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        let content = self.render(&event.data);
        Ok(Some(converted_event(event, content, "xml")))
    }

    fn name(&self) -> &str {
        "json_to_xml_processor"
    }
}

/// JSON → HTML: a `<table>` for an array of objects, a `<dl>` definition
/// list for a single object. Cell text is HTML-escaped.
pub struct JsonToHtmlProcessor;

impl JsonToHtmlProcessor {
    pub fn new() -> Self {
        Self
    }

    fn render(&self, data: &Value) -> Result<String, ProcessorError> {
        match data {
            Value::Array(_) => {
                let rows = rows_of(data)
                    .ok_or_else(|| ProcessorError::validation("HTML table conversion requires an array of objects"))?;
                let mut headers: Vec<String> = Vec::new();
                let mut seen = BTreeSet::new();
                for row in &rows {
                    for key in row.keys() {
                        if seen.insert(key.clone()) {
                            headers.push(key.clone());
                        }
                    }
                }
                let mut out = String::from("<table>\n  <thead><tr>");
                for h in &headers {
                    out.push_str(&format!("<th>{}</th>", escape_html(h)));
                }
                out.push_str("</tr></thead>\n  <tbody>\n");
                for row in &rows {
                    out.push_str("    <tr>");
                    for h in &headers {
                        let cell = row.get(h).map(cell_to_string).unwrap_or_default();
                        out.push_str(&format!("<td>{}</td>", escape_html(&cell)));
                    }
                    out.push_str("</tr>\n");
                }
                out.push_str("  </tbody>\n</table>");
                Ok(out)
            }
            Value::Object(obj) => {
                let mut out = String::from("<dl>\n");
                for (k, v) in obj {
                    out.push_str(&format!(
                        "  <dt>{}</dt><dd>{}</dd>\n",
                        escape_html(k),
                        escape_html(&cell_to_string(v))
                    ));
                }
                out.push_str("</dl>");
                Ok(out)
            }
            _ => Err(ProcessorError::validation("HTML conversion requires an object or array of objects")),
        }
    }
}

impl Default for JsonToHtmlProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[async_trait]
impl Processor for JsonToHtmlProcessor {
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.event_type, EventType::ComputationResult | EventType::DataChange)
            && (event.data.is_object() || event.data.is_array())
    }

    async fn process(
        &self,
        event: &Event,
        _ctx: &ProcessingContext,
    ) -> Result<Option<Event>, ProcessorError> {
        let content = self.render(&event.data)?;
        Ok(Some(converted_event(event, content, "html")))
    }

    fn name(&self) -> &str {
        "json_to_html_processor"
    }
}

fn converted_event(original: &Event, content: String, format: &str) -> Event {
    original.derive(
        EventType::FileConverted,
        serde_json::json!({
            "content": content,
            "format": format,
            "filename_hint": format!("output.{format}"),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ProcessingContext {
        ProcessingContext {
            node_id: "convert".into(),
            node_type: "convert".into(),
            config: Value::Null,
            current_data: None,
            incoming_nodes: vec![],
            outgoing_nodes: vec![],
            metrics: Default::default(),
            recent_events: vec![],
        }
    }

    #[tokio::test]
    async fn csv_flattens_nested_fields_and_unions_headers() {
        let processor = JsonToCsvProcessor::new(CsvConfig::default());
        let event = Event::new(
            EventType::ComputationResult,
            json!([
                {"name": "Ada", "address": {"city": "London"}},
                {"name": "Lin", "age": 40}
            ]),
        );
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        let content = result.data["content"].as_str().unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap();
        assert!(header.contains("name"));
        assert!(header.contains("address.city"));
        assert!(header.contains("age"));
    }

    #[tokio::test]
    async fn csv_quotes_cells_containing_separator() {
        let processor = JsonToCsvProcessor::new(CsvConfig::default());
        let event = Event::new(EventType::ComputationResult, json!([{"note": "a,b"}]));
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        let content = result.data["content"].as_str().unwrap();
        assert!(content.contains("\"a,b\""));
    }

    #[tokio::test]
    async fn xml_wraps_keys_and_recurses_arrays() {
        let processor = JsonToXmlProcessor::new(XmlConfig::default());
        let event = Event::new(EventType::ComputationResult, json!({"tags": ["a", "b"]}));
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        let content = result.data["content"].as_str().unwrap();
        assert!(content.contains("<root><tags><item>a</item><item>b</item></tags></root>"));
    }

    #[tokio::test]
    async fn xml_escapes_reserved_characters() {
        let processor = JsonToXmlProcessor::new(XmlConfig::default());
        let event = Event::new(EventType::ComputationResult, json!({"note": "a < b & c"}));
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        let content = result.data["content"].as_str().unwrap();
        assert!(content.contains("a &lt; b &amp; c"));
    }

    #[tokio::test]
    async fn html_renders_table_for_array_of_objects() {
        let processor = JsonToHtmlProcessor::new();
        let event = Event::new(EventType::ComputationResult, json!([{"a": 1}, {"a": 2}]));
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        let content = result.data["content"].as_str().unwrap();
        assert!(content.starts_with("<table>"));
        assert!(content.contains("<td>1</td>"));
    }

    #[tokio::test]
    async fn html_renders_definition_list_for_single_object() {
        let processor = JsonToHtmlProcessor::new();
        let event = Event::new(EventType::ComputationResult, json!({"name": "Ada <3"}));
        let result = processor.process(&event, &ctx()).await.unwrap().unwrap();
        let content = result.data["content"].as_str().unwrap();
        assert!(content.starts_with("<dl>"));
        assert!(content.contains("Ada &lt;3"));
    }
}
