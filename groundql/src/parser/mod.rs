//! Turning raw content bytes into plain structured records.

use crate::error::ParseError;
use serde_json::{Map, Value};

/// Converts between raw content and a plain JSON object.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &str, bytes: &[u8]) -> Result<Value, ParseError>;

    fn stringify(&self, path: &str, value: &Value) -> Result<Vec<u8>, ParseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Markdown,
    Json,
    Yaml,
}

fn format_of(path: &str) -> Option<Format> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "md" | "mdx" | "markdown" => Some(Format::Markdown),
        "json" => Some(Format::Json),
        "yaml" | "yml" => Some(Format::Yaml),
        _ => None,
    }
}

/// Markdown with optional YAML front matter, plus plain JSON and YAML files.
///
/// The Markdown body (everything after the closing `---`) is stored under
/// `body_field` when it is not blank.
#[derive(Debug, Clone)]
pub struct FrontMatterParser {
    body_field: String,
}

impl Default for FrontMatterParser {
    fn default() -> Self {
        FrontMatterParser {
            body_field: "body".to_string(),
        }
    }
}

impl FrontMatterParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body_field(body_field: impl Into<String>) -> Self {
        FrontMatterParser {
            body_field: body_field.into(),
        }
    }

    pub fn body_field(&self) -> &str {
        &self.body_field
    }

    fn parse_markdown(&self, path: &str, text: &str) -> Result<Value, ParseError> {
        let (front, body) = split_front_matter(text);
        let mut object = match front {
            Some(yaml) => yaml_object(path, yaml)?,
            None => Map::new(),
        };
        let body = body.trim_start_matches(['\r', '\n']);
        if !body.trim().is_empty() {
            object.insert(self.body_field.clone(), Value::String(body.to_string()));
        }
        Ok(Value::Object(object))
    }

    fn stringify_markdown(&self, path: &str, value: &Value) -> Result<Vec<u8>, ParseError> {
        let mut object = as_object(path, value)?.clone();
        let body = match object.remove(&self.body_field) {
            Some(Value::String(body)) => body,
            Some(other) => {
                return Err(error(path, format!("'{}' must be a string, got {other}", self.body_field)))
            }
            None => String::new(),
        };
        let mut out = String::new();
        if !object.is_empty() {
            let yaml = serde_yaml::to_string(&object).map_err(|e| error(path, e.to_string()))?;
            out.push_str("---\n");
            out.push_str(&yaml);
            out.push_str("---\n");
        }
        out.push_str(&body);
        Ok(out.into_bytes())
    }
}

impl DocumentParser for FrontMatterParser {
    fn parse(&self, path: &str, bytes: &[u8]) -> Result<Value, ParseError> {
        let format = format_of(path).ok_or_else(|| error(path, "unsupported file format"))?;
        let text = std::str::from_utf8(bytes).map_err(|e| error(path, format!("not UTF-8: {e}")))?;
        match format {
            Format::Markdown => self.parse_markdown(path, text),
            Format::Json => {
                let value: Value = serde_json::from_str(text).map_err(|e| error(path, e.to_string()))?;
                as_object(path, &value)?;
                Ok(value)
            }
            Format::Yaml => Ok(Value::Object(yaml_object(path, text)?)),
        }
    }

    fn stringify(&self, path: &str, value: &Value) -> Result<Vec<u8>, ParseError> {
        let format = format_of(path).ok_or_else(|| error(path, "unsupported file format"))?;
        match format {
            Format::Markdown => self.stringify_markdown(path, value),
            Format::Json => serde_json::to_vec_pretty(as_object(path, value)?)
                .map_err(|e| error(path, e.to_string())),
            Format::Yaml => serde_yaml::to_string(as_object(path, value)?)
                .map(String::into_bytes)
                .map_err(|e| error(path, e.to_string())),
        }
    }
}

/// Split `---`-delimited front matter from the rest of a Markdown file.
fn split_front_matter(text: &str) -> (Option<&str>, &str) {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return (None, text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return (Some(&rest[..offset]), &rest[offset + line.len()..]);
        }
        offset += line.len();
    }
    (None, text)
}

fn yaml_object(path: &str, yaml: &str) -> Result<Map<String, Value>, ParseError> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| error(path, e.to_string()))?;
    match serde_json::to_value(parsed).map_err(|e| error(path, e.to_string()))? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(error(path, format!("expected a mapping, got {other}"))),
    }
}

fn as_object<'a>(path: &str, value: &'a Value) -> Result<&'a Map<String, Value>, ParseError> {
    value
        .as_object()
        .ok_or_else(|| error(path, "document must be an object"))
}

fn error(path: &str, message: impl Into<String>) -> ParseError {
    ParseError {
        path: path.to_string(),
        message: message.into(),
    }
}
