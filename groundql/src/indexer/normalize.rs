//! Turning a parsed document into a [`DocumentRecord`].

use crate::config::TemplateMatchPolicy;
use crate::error::SkipReason;
use crate::graph::{CollectionType, FieldKind, TemplateType, TypeGraph, SYSTEM_TEMPLATE};
use crate::record::{DocumentRecord, FieldValue, ObjectValue, RefTarget};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A normalized record plus the non-fatal issues found on the way.
#[derive(Debug)]
pub struct Normalized {
    pub record: DocumentRecord,
    pub warnings: Vec<String>,
}

struct Context<'a> {
    graph: &'a TypeGraph,
    policy: TemplateMatchPolicy,
    strict: bool,
    path: &'a str,
    warnings: Vec<String>,
}

pub fn normalize_document(
    graph: &TypeGraph,
    collection: &CollectionType,
    path: &str,
    raw: &Value,
    content_hash: String,
    policy: TemplateMatchPolicy,
) -> Result<Normalized, SkipReason> {
    let object = raw.as_object().ok_or_else(|| SkipReason::TemplateMismatch {
        message: "document is not an object".into(),
    })?;

    let mut ctx = Context {
        graph,
        policy,
        strict: collection.strict,
        path,
        warnings: Vec::new(),
    };

    let template = select_template(&collection.templates, object, policy).map_err(|message| {
        SkipReason::TemplateMismatch {
            message: format!("{message} in collection '{}'", collection.name),
        }
    })?;

    let fields = ctx
        .normalize_fields(template, object, "")
        .map_err(|e| e.into_skip())?;

    Ok(Normalized {
        record: DocumentRecord {
            collection: collection.name.clone(),
            path: path.to_string(),
            template: template.name.clone(),
            fields,
            content_hash,
        },
        warnings: ctx.warnings,
    })
}

/// Keys with a non-null value, minus the discriminator.
fn present_keys(object: &Map<String, Value>) -> Vec<&str> {
    object
        .iter()
        .filter(|(key, value)| !value.is_null() && key.as_str() != SYSTEM_TEMPLATE)
        .map(|(key, _)| key.as_str())
        .collect()
}

/// Pick the template for an object. An explicit `_template` key wins;
/// otherwise the policy decides.
pub fn select_template<'t>(
    templates: &'t [TemplateType],
    object: &Map<String, Value>,
    policy: TemplateMatchPolicy,
) -> Result<&'t TemplateType, String> {
    if let Some(explicit) = object.get(SYSTEM_TEMPLATE) {
        let name = explicit
            .as_str()
            .ok_or_else(|| format!("'{SYSTEM_TEMPLATE}' must be a string"))?;
        return templates
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| format!("unknown template '{name}'"));
    }

    let present = present_keys(object);
    match_template(templates, &present, policy).ok_or_else(|| {
        let mut keys = present.clone();
        keys.sort_unstable();
        format!("no template accepts fields [{}]", keys.join(", "))
    })
}

/// Template disambiguation over the keys present in a document.
pub fn match_template<'t>(
    templates: &'t [TemplateType],
    present: &[&str],
    policy: TemplateMatchPolicy,
) -> Option<&'t TemplateType> {
    let has_required = |t: &&TemplateType| t.required_fields().all(|f| present.contains(&f.name.as_str()));

    if policy == TemplateMatchPolicy::BestFit {
        let covering = templates
            .iter()
            .filter(has_required)
            .find(|t| present.iter().all(|key| t.field(key).is_some()));
        if covering.is_some() {
            return covering;
        }
    }
    templates.iter().find(has_required)
}

struct FieldError {
    field: String,
    message: String,
    template_mismatch: bool,
}

impl FieldError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        FieldError {
            field: field.to_string(),
            message: message.into(),
            template_mismatch: false,
        }
    }

    fn mismatch(field: &str, message: impl Into<String>) -> Self {
        FieldError {
            field: field.to_string(),
            message: message.into(),
            template_mismatch: true,
        }
    }

    fn into_skip(self) -> SkipReason {
        if self.template_mismatch {
            let location = if self.field.is_empty() {
                String::new()
            } else {
                format!(" at '{}'", self.field)
            };
            SkipReason::TemplateMismatch {
                message: format!("{}{location}", self.message),
            }
        } else {
            SkipReason::InvalidValue {
                field: self.field,
                message: self.message,
            }
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl Context<'_> {
    fn normalize_fields(
        &mut self,
        template: &TemplateType,
        object: &Map<String, Value>,
        prefix: &str,
    ) -> Result<BTreeMap<String, FieldValue>, FieldError> {
        for key in present_keys(object) {
            if template.field(key).is_some() {
                continue;
            }
            let location = join(prefix, key);
            if self.strict {
                return Err(FieldError::mismatch(
                    &location,
                    format!("field is not declared on template '{}'", template.name),
                ));
            }
            self.warnings.push(format!(
                "{}: dropped undeclared field '{location}' (template '{}')",
                self.path, template.name
            ));
        }

        let mut fields = BTreeMap::new();
        for field in &template.fields {
            let location = join(prefix, &field.name);
            match object.get(&field.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    let normalized = self.normalize_value(&location, &field.kind, value)?;
                    fields.insert(field.name.clone(), normalized);
                }
                None if field.required => {
                    return Err(FieldError::mismatch(
                        &location,
                        format!("required field missing for template '{}'", template.name),
                    ));
                }
                None => {}
            }
        }
        Ok(fields)
    }

    fn normalize_value(
        &mut self,
        field: &str,
        kind: &FieldKind,
        value: &Value,
    ) -> Result<FieldValue, FieldError> {
        let expected = |what: &str| FieldError::invalid(field, format!("expected {what}, got {}", type_name(value)));
        match kind {
            FieldKind::String => value
                .as_str()
                .map(|s| FieldValue::String(s.to_string()))
                .ok_or_else(|| expected("string")),
            FieldKind::Number => {
                let n = value
                    .as_f64()
                    .filter(|n| n.is_finite())
                    .ok_or_else(|| expected("number"))?;
                let exact = match (value.as_i64(), value.as_u64()) {
                    (Some(i), _) => n as i128 == i128::from(i),
                    (None, Some(u)) => n as i128 == i128::from(u),
                    (None, None) => true,
                };
                if !exact {
                    self.warnings.push(format!(
                        "{}: '{field}' {value} cannot be stored exactly, indexed as {n}",
                        self.path
                    ));
                }
                Ok(FieldValue::Number(n))
            }
            FieldKind::Boolean => value
                .as_bool()
                .map(FieldValue::Boolean)
                .ok_or_else(|| expected("boolean")),
            FieldKind::Datetime => {
                let text = value.as_str().ok_or_else(|| expected("datetime string"))?;
                normalize_datetime(text)
                    .map(FieldValue::Datetime)
                    .ok_or_else(|| FieldError::invalid(field, format!("'{text}' is not a date or datetime")))
            }
            FieldKind::RichText => Ok(FieldValue::RichText(value.clone())),
            FieldKind::Reference { collections } => {
                let target = value.as_str().ok_or_else(|| expected("document path"))?;
                let target = target.trim_start_matches("./");
                if target.is_empty() {
                    return Err(FieldError::invalid(field, "reference path is empty"));
                }
                let collection = collections
                    .iter()
                    .filter_map(|name| self.graph.collection(name))
                    .find(|c| c.contains_path(target))
                    .map(|c| c.name.clone());
                Ok(FieldValue::Reference(RefTarget {
                    collection,
                    path: target.to_string(),
                }))
            }
            FieldKind::List { items } => {
                let elements = value.as_array().ok_or_else(|| expected("list"))?;
                let mut out = Vec::with_capacity(elements.len());
                for (i, element) in elements.iter().enumerate() {
                    let location = format!("{field}[{i}]");
                    if element.is_null() {
                        return Err(FieldError::invalid(&location, "list elements cannot be null"));
                    }
                    out.push(self.normalize_value(&location, items, element)?);
                }
                Ok(FieldValue::List(out))
            }
            FieldKind::Object { templates } => {
                let object = value.as_object().ok_or_else(|| expected("object"))?;
                let template = select_template(templates, object, self.policy)
                    .map_err(|message| FieldError::invalid(field, message))?;
                let fields = self.normalize_fields(template, object, field)?;
                Ok(FieldValue::Object(ObjectValue {
                    template: template.name.clone(),
                    fields,
                }))
            }
        }
    }
}

/// Canonical UTC form of an RFC 3339 datetime, a naive datetime (taken as
/// UTC) or a plain date (midnight UTC).
pub fn normalize_datetime(text: &str) -> Option<String> {
    let text = text.trim();
    let utc = if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        dt.with_timezone(&Utc)
    } else if let Some(naive) = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
    {
        naive.and_utc()
    } else {
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?
            .and_utc()
    };
    Some(utc.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::compile;
    use crate::schema::parse_schema_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn graph() -> TypeGraph {
        compile(
            &parse_schema_str(
                r#"
collections:
  - name: posts
    path: posts
    fields:
      - { name: title, type: string, required: true }
      - { name: published, type: datetime }
      - { name: rank, type: number }
      - { name: author, type: reference, collections: [authors] }
      - { name: tags, type: list, items: string }
      - name: blocks
        type: list
        items:
          type: object
          templates:
            - name: quote
              fields:
                - { name: text, type: string, required: true }
                - { name: cite, type: reference, collections: [authors] }
            - name: image
              fields:
                - { name: src, type: string, required: true }
  - name: authors
    path: authors
    fields:
      - { name: name, type: string }
  - name: pages
    path: pages
    strict: true
    templates:
      - name: b
        fields:
          - { name: x, type: string, required: true }
          - { name: y, type: string, required: true }
      - name: a
        fields:
          - { name: x, type: string, required: true }
"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn normalize(graph: &TypeGraph, collection: &str, raw: Value) -> Result<Normalized, SkipReason> {
        let collection = graph.collection(collection).unwrap();
        normalize_document(
            graph,
            collection,
            "posts/a.md",
            &raw,
            "hash".into(),
            TemplateMatchPolicy::FirstMatch,
        )
    }

    #[test]
    fn test_normalize_datetime() {
        assert_eq!(
            normalize_datetime("2024-03-01T10:00:00+02:00").as_deref(),
            Some("2024-03-01T08:00:00.000Z")
        );
        assert_eq!(
            normalize_datetime("2024-03-01").as_deref(),
            Some("2024-03-01T00:00:00.000Z")
        );
        assert_eq!(
            normalize_datetime("2024-03-01 12:30:05.5").as_deref(),
            Some("2024-03-01T12:30:05.500Z")
        );
        assert_eq!(normalize_datetime("yesterday"), None);
    }

    #[test]
    fn test_normalize_full_document() {
        let graph = graph();
        let out = normalize(
            &graph,
            "posts",
            json!({
                "title": "Hello",
                "published": "2024-01-02",
                "rank": 2,
                "author": "authors/jane.md",
                "tags": ["a", "b"],
                "blocks": [
                    { "text": "hi", "cite": "authors/joe.md" },
                    { "src": "x.png" }
                ],
                "extra": true,
                "empty": null,
            }),
        )
        .unwrap();

        let record = out.record;
        assert_eq!(record.template, "posts");
        assert_eq!(
            record.fields["published"],
            FieldValue::Datetime("2024-01-02T00:00:00.000Z".into())
        );
        assert_eq!(record.fields["rank"], FieldValue::Number(2.0));
        assert_eq!(
            record.fields["author"],
            FieldValue::Reference(RefTarget {
                collection: Some("authors".into()),
                path: "authors/jane.md".into(),
            })
        );
        let FieldValue::List(blocks) = &record.fields["blocks"] else {
            panic!("blocks should be a list");
        };
        assert!(matches!(&blocks[0], FieldValue::Object(o) if o.template == "quote"));
        assert!(matches!(&blocks[1], FieldValue::Object(o) if o.template == "image"));
        assert!(!record.fields.contains_key("extra"));
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("'extra'"));
    }

    #[test]
    fn test_reference_outside_allowed_collections() {
        let graph = graph();
        let out = normalize(&graph, "posts", json!({ "title": "x", "author": "pages/p.md" })).unwrap();
        assert_eq!(
            out.record.fields["author"],
            FieldValue::Reference(RefTarget {
                collection: None,
                path: "pages/p.md".into(),
            })
        );
    }

    #[test]
    fn test_invalid_values() {
        let graph = graph();
        let err = normalize(&graph, "posts", json!({ "title": 5 })).unwrap_err();
        assert_eq!(
            err,
            SkipReason::InvalidValue {
                field: "title".into(),
                message: "expected string, got number".into(),
            }
        );

        let err = normalize(&graph, "posts", json!({ "title": "x", "tags": ["a", null] })).unwrap_err();
        assert!(matches!(err, SkipReason::InvalidValue { ref field, .. } if field == "tags[1]"));

        let err = normalize(&graph, "posts", json!({ "title": "x", "published": "soon" })).unwrap_err();
        assert!(matches!(err, SkipReason::InvalidValue { ref field, .. } if field == "published"));
    }

    #[test]
    fn test_large_integer_warns_on_precision_loss() {
        let graph = graph();
        let out = normalize(&graph, "posts", json!({ "title": "x", "rank": 9007199254740993u64 })).unwrap();
        assert_eq!(out.record.fields["rank"], FieldValue::Number(9007199254740992.0));
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("'rank' 9007199254740993"), "{}", out.warnings[0]);

        let out = normalize(&graph, "posts", json!({ "title": "x", "rank": -9007199254740992i64 })).unwrap();
        assert!(out.warnings.is_empty());
        let out = normalize(&graph, "posts", json!({ "title": "x", "rank": 2.5 })).unwrap();
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_missing_required_is_template_mismatch() {
        let graph = graph();
        let err = normalize(&graph, "posts", json!({ "rank": 1 })).unwrap_err();
        assert!(matches!(err, SkipReason::TemplateMismatch { .. }));
    }

    #[test]
    fn test_template_disambiguation_first_match() {
        let graph = graph();
        let both = normalize(&graph, "pages", json!({ "x": "1", "y": "2" })).unwrap();
        assert_eq!(both.record.template, "b");
        let only_x = normalize(&graph, "pages", json!({ "x": "1" })).unwrap();
        assert_eq!(only_x.record.template, "a");
        let explicit = normalize(&graph, "pages", json!({ "_template": "a", "x": "1" })).unwrap();
        assert_eq!(explicit.record.template, "a");
    }

    #[test]
    fn test_strict_collection_rejects_undeclared_keys() {
        let graph = graph();
        let err = normalize(&graph, "pages", json!({ "_template": "a", "x": "1", "z": 1 })).unwrap_err();
        assert!(matches!(err, SkipReason::TemplateMismatch { ref message } if message.contains("'z'")));
    }

    #[test]
    fn test_best_fit_policy() {
        let a = TemplateType {
            name: "a".into(),
            fields: vec![crate::graph::FieldDescriptor {
                name: "x".into(),
                kind: FieldKind::String,
                required: true,
                indexed: true,
            }],
        };
        let mut b = a.clone();
        b.name = "b".into();
        b.fields.push(crate::graph::FieldDescriptor {
            name: "y".into(),
            kind: FieldKind::String,
            required: false,
            indexed: true,
        });
        let templates = vec![a, b];

        let first = match_template(&templates, &["x", "y"], TemplateMatchPolicy::FirstMatch).unwrap();
        assert_eq!(first.name, "a");
        let best = match_template(&templates, &["x", "y"], TemplateMatchPolicy::BestFit).unwrap();
        assert_eq!(best.name, "b");
        let fallback = match_template(&templates, &["x", "z"], TemplateMatchPolicy::BestFit).unwrap();
        assert_eq!(fallback.name, "a");
        assert!(match_template(&templates, &["y"], TemplateMatchPolicy::FirstMatch).is_none());
    }
}
