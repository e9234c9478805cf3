//! Record filters, type-checked against a collection before evaluation.

use crate::error::ResolveError;
use crate::graph::{CollectionType, FieldKind, SYSTEM_COLLECTION, SYSTEM_PATH, SYSTEM_TEMPLATE};
use crate::indexer::normalize_datetime;
use crate::record::{DocumentRecord, FieldValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A filter over top-level fields, e.g. `{"gt": {"field": "rank", "value": 2}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    StartsWith { field: String, prefix: String },
    Exists { field: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Exists { field: field.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Collection,
    Path,
    Template,
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandKind {
    Str,
    Datetime,
    Num,
    Bool,
}

/// A filter compiled against one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate(Node);

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Compare(Target, Op, Operand),
    In(Target, Vec<Operand>),
    StartsWith(Target, String),
    Exists(Target),
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

impl Predicate {
    pub fn compile(filter: &Filter, collection: &CollectionType) -> Result<Self, ResolveError> {
        compile_node(filter, collection).map(Predicate)
    }

    pub fn matches(&self, record: &DocumentRecord) -> bool {
        eval(&self.0, record)
    }
}

fn target_of(field: &str, collection: &CollectionType) -> Result<(Target, OperandKind), ResolveError> {
    match field {
        SYSTEM_COLLECTION => return Ok((Target::Collection, OperandKind::Str)),
        SYSTEM_PATH => return Ok((Target::Path, OperandKind::Str)),
        SYSTEM_TEMPLATE => return Ok((Target::Template, OperandKind::Str)),
        _ => {}
    }
    let descriptor = collection.field(field).ok_or_else(|| ResolveError::UnknownField {
        owner: collection.name.clone(),
        field: field.to_string(),
    })?;
    let kind = match &descriptor.kind {
        FieldKind::String | FieldKind::Reference { .. } => OperandKind::Str,
        FieldKind::Datetime => OperandKind::Datetime,
        FieldKind::Number => OperandKind::Num,
        FieldKind::Boolean => OperandKind::Bool,
        other => {
            return Err(ResolveError::InvalidFilter(format!(
                "'{field}' is a {} field and cannot be filtered",
                other.label()
            )))
        }
    };
    Ok((Target::Field(field.to_string()), kind))
}

fn operand(field: &str, kind: OperandKind, value: &Value) -> Result<Operand, ResolveError> {
    let mismatch = || ResolveError::InvalidFilter(format!("'{field}' cannot be compared with {value}"));
    match kind {
        OperandKind::Str => value.as_str().map(|s| Operand::Str(s.to_string())).ok_or_else(mismatch),
        OperandKind::Datetime => value
            .as_str()
            .and_then(normalize_datetime)
            .map(Operand::Str)
            .ok_or_else(mismatch),
        OperandKind::Num => value.as_f64().map(Operand::Num).ok_or_else(mismatch),
        OperandKind::Bool => value.as_bool().map(Operand::Bool).ok_or_else(mismatch),
    }
}

fn compile_node(filter: &Filter, collection: &CollectionType) -> Result<Node, ResolveError> {
    let comparison = |field: &str, op: Op, value: &Value| -> Result<Node, ResolveError> {
        let (target, kind) = target_of(field, collection)?;
        Ok(Node::Compare(target, op, operand(field, kind, value)?))
    };
    match filter {
        Filter::Eq { field, value } => comparison(field, Op::Eq, value),
        Filter::Ne { field, value } => comparison(field, Op::Ne, value),
        Filter::Lt { field, value } => comparison(field, Op::Lt, value),
        Filter::Lte { field, value } => comparison(field, Op::Lte, value),
        Filter::Gt { field, value } => comparison(field, Op::Gt, value),
        Filter::Gte { field, value } => comparison(field, Op::Gte, value),
        Filter::In { field, values } => {
            let (target, kind) = target_of(field, collection)?;
            let operands = values
                .iter()
                .map(|v| operand(field, kind, v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Node::In(target, operands))
        }
        Filter::StartsWith { field, prefix } => {
            let (target, kind) = target_of(field, collection)?;
            if kind != OperandKind::Str && kind != OperandKind::Datetime {
                return Err(ResolveError::InvalidFilter(format!(
                    "starts_with needs a text field, '{field}' is not one"
                )));
            }
            Ok(Node::StartsWith(target, prefix.clone()))
        }
        Filter::Exists { field } => Ok(Node::Exists(target_of(field, collection)?.0)),
        Filter::And(filters) => filters
            .iter()
            .map(|f| compile_node(f, collection))
            .collect::<Result<_, _>>()
            .map(Node::And),
        Filter::Or(filters) => filters
            .iter()
            .map(|f| compile_node(f, collection))
            .collect::<Result<_, _>>()
            .map(Node::Or),
        Filter::Not(inner) => Ok(Node::Not(Box::new(compile_node(inner, collection)?))),
    }
}

enum Scalar<'a> {
    Str(&'a str),
    Num(f64),
    Bool(bool),
}

fn read<'r>(target: &Target, record: &'r DocumentRecord) -> Option<Scalar<'r>> {
    let value = match target {
        Target::Collection => return Some(Scalar::Str(&record.collection)),
        Target::Path => return Some(Scalar::Str(&record.path)),
        Target::Template => return Some(Scalar::Str(&record.template)),
        Target::Field(name) => record.fields.get(name)?,
    };
    match value {
        FieldValue::String(s) | FieldValue::Datetime(s) => Some(Scalar::Str(s)),
        FieldValue::Reference(target) => Some(Scalar::Str(&target.path)),
        FieldValue::Number(n) => Some(Scalar::Num(*n)),
        FieldValue::Boolean(b) => Some(Scalar::Bool(*b)),
        _ => None,
    }
}

fn compare(left: &Scalar<'_>, right: &Operand) -> Option<Ordering> {
    match (left, right) {
        (Scalar::Str(a), Operand::Str(b)) => Some((*a).cmp(b.as_str())),
        (Scalar::Num(a), Operand::Num(b)) => a.partial_cmp(b),
        (Scalar::Bool(a), Operand::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn eval(node: &Node, record: &DocumentRecord) -> bool {
    match node {
        Node::Compare(target, op, operand) => {
            let Some(value) = read(target, record) else {
                // a missing value differs from everything
                return *op == Op::Ne;
            };
            let Some(ordering) = compare(&value, operand) else {
                return false;
            };
            match op {
                Op::Eq => ordering == Ordering::Equal,
                Op::Ne => ordering != Ordering::Equal,
                Op::Lt => ordering == Ordering::Less,
                Op::Lte => ordering != Ordering::Greater,
                Op::Gt => ordering == Ordering::Greater,
                Op::Gte => ordering != Ordering::Less,
            }
        }
        Node::In(target, operands) => read(target, record).map_or(false, |value| {
            operands
                .iter()
                .any(|o| compare(&value, o) == Some(Ordering::Equal))
        }),
        Node::StartsWith(target, prefix) => {
            matches!(read(target, record), Some(Scalar::Str(s)) if s.starts_with(prefix.as_str()))
        }
        Node::Exists(target) => read(target, record).is_some(),
        Node::And(nodes) => nodes.iter().all(|n| eval(n, record)),
        Node::Or(nodes) => nodes.iter().any(|n| eval(n, record)),
        Node::Not(inner) => !eval(inner, record),
    }
}
