//! Answering structured queries from the active index generation.
//!
//! Every call reads `meta/active` once and works against that generation
//! only, so a rebuild swapping in mid-call is never observed.

pub mod cursor;
pub mod filter;
pub mod request;

pub use filter::{Filter, Predicate};
pub use request::{PageInfo, QueryRequest, QueryResult, Selection, Sort, SortOrder, Warning};

use crate::config::DatabaseConfig;
use crate::error::{ResolveError, StorageError};
use crate::graph::{
    CollectionType, FieldKind, TemplateType, TypeGraph, SYSTEM_COLLECTION, SYSTEM_PATH, SYSTEM_TEMPLATE,
};
use crate::record::{DocumentRecord, FieldValue, ObjectValue, RefTarget};
use crate::storage::keys::{self, RefSource};
use crate::storage::namespace::{active_pointer, read_info};
use crate::storage::{Direction, KeyRange, ScanIter, StorageBackend};
use serde_json::{Map, Value};

fn is_system_field(name: &str) -> bool {
    matches!(name, SYSTEM_COLLECTION | SYSTEM_PATH | SYSTEM_TEMPLATE)
}

fn join(location: &str, name: &str) -> String {
    if location.is_empty() {
        name.to_string()
    } else {
        format!("{location}.{name}")
    }
}

/// Where a list query reads from.
struct Scan {
    prefix: Vec<u8>,
    direction: Direction,
    /// Entries hold a path to look up rather than the record itself
    via_sort_index: bool,
    signature: String,
}

pub struct Resolver<'a> {
    graph: &'a TypeGraph,
    storage: &'a dyn StorageBackend,
    config: &'a DatabaseConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(graph: &'a TypeGraph, storage: &'a dyn StorageBackend, config: &'a DatabaseConfig) -> Self {
        Resolver {
            graph,
            storage,
            config,
        }
    }

    pub fn resolve(&self, request: &QueryRequest) -> Result<QueryResult, ResolveError> {
        let collection = self.collection(&request.collection)?;
        self.validate_fields(
            &collection.name,
            &[collection.templates.as_slice()],
            &request.selection,
            true,
        )?;

        match &request.path {
            Some(path) => self.lookup(collection, path, &request.selection),
            None => self.list(collection, request),
        }
    }

    /// Documents whose reference fields point at `collection`/`path`.
    pub fn referenced_by(&self, collection: &str, path: &str) -> Result<Vec<RefSource>, ResolveError> {
        self.collection(collection)?;
        let Some(generation) = self.snapshot()? else {
            return Ok(Vec::new());
        };
        let prefix = keys::ref_prefix(generation, collection, path);
        let mut sources = Vec::new();
        for entry in ScanIter::new(self.storage, KeyRange::prefix(prefix.clone()), Direction::Forward) {
            let (key, _) = entry?;
            let source = keys::parse_ref_suffix(&key[prefix.len()..]).ok_or_else(|| StorageError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                message: "malformed reference entry".into(),
            })?;
            sources.push(source);
        }
        Ok(sources)
    }

    fn collection(&self, name: &str) -> Result<&'a CollectionType, ResolveError> {
        self.graph
            .collection(name)
            .ok_or_else(|| ResolveError::UnknownCollection {
                collection: name.to_string(),
            })
    }

    /// The generation this call reads, checked against the resolver's graph.
    fn snapshot(&self) -> Result<Option<u64>, ResolveError> {
        let (Some(generation), _) = active_pointer(self.storage)? else {
            return Ok(None);
        };
        match read_info(self.storage, generation)? {
            Some(info) if info.schema_version == self.graph.version() => Ok(Some(generation)),
            other => Err(ResolveError::SchemaMismatch {
                expected: self.graph.version().to_string(),
                found: other.map(|i| i.schema_version),
            }),
        }
    }

    fn load(&self, generation: u64, collection: &str, path: &str) -> Result<Option<DocumentRecord>, ResolveError> {
        let key = keys::doc_key(generation, collection, path);
        match self.storage.get(&key)? {
            Some(bytes) => Ok(Some(DocumentRecord::from_bytes(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    // ── Selection checks ─────────────────────────────────────────────

    /// Every selected name must exist in at least one of `scopes`. A
    /// reference to several collections is checked against all of them.
    fn validate_fields(
        &self,
        owner: &str,
        scopes: &[&[TemplateType]],
        selection: &Selection,
        document: bool,
    ) -> Result<(), ResolveError> {
        for (name, sub) in selection.iter() {
            let system = if document {
                is_system_field(name)
            } else {
                name == SYSTEM_TEMPLATE
            };
            if system {
                if !sub.is_empty() {
                    return Err(ResolveError::InvalidSelection {
                        field: join(owner, name),
                        message: "system fields have no sub-fields".into(),
                    });
                }
                continue;
            }

            let mut found = false;
            for templates in scopes {
                for field in templates.iter().filter_map(|t| t.field(name)) {
                    found = true;
                    self.validate_kind(&join(owner, name), &field.kind, sub)?;
                }
            }
            if !found {
                return Err(ResolveError::UnknownField {
                    owner: owner.to_string(),
                    field: name.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_kind(&self, label: &str, kind: &FieldKind, sub: &Selection) -> Result<(), ResolveError> {
        if sub.is_empty() {
            return Ok(());
        }
        match kind {
            FieldKind::Reference { collections } => {
                let scopes: Vec<&[TemplateType]> = collections
                    .iter()
                    .filter_map(|name| self.graph.collection(name))
                    .map(|c| c.templates.as_slice())
                    .collect();
                self.validate_fields(label, &scopes, sub, true)
            }
            FieldKind::List { items } => self.validate_kind(label, items, sub),
            FieldKind::Object { templates } => self.validate_fields(label, &[templates.as_slice()], sub, false),
            other => Err(ResolveError::InvalidSelection {
                field: label.to_string(),
                message: format!("{} fields have no sub-fields", other.label()),
            }),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    fn lookup(&self, collection: &CollectionType, path: &str, selection: &Selection) -> Result<QueryResult, ResolveError> {
        let not_found = || ResolveError::NotFound {
            collection: collection.name.clone(),
            path: path.to_string(),
        };
        let generation = self.snapshot()?.ok_or_else(not_found)?;
        let record = self.load(generation, &collection.name, path)?.ok_or_else(not_found)?;

        let mut warnings = Vec::new();
        let data = self.project_document(generation, collection, &record, selection, "", &mut warnings)?;
        Ok(QueryResult {
            data,
            page: None,
            warnings,
        })
    }

    fn plan_scan(&self, collection: &CollectionType, sort: Option<&Sort>, generation: u64) -> Result<Scan, ResolveError> {
        let Some(sort) = sort else {
            return Ok(Scan {
                prefix: keys::doc_prefix(generation, &collection.name),
                direction: Direction::Forward,
                via_sort_index: false,
                signature: format!("{SYSTEM_PATH}:asc"),
            });
        };
        let order = match sort.order {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        };
        let signature = format!("{}:{order}", sort.field);

        if sort.field == SYSTEM_PATH {
            return Ok(Scan {
                prefix: keys::doc_prefix(generation, &collection.name),
                direction: match sort.order {
                    SortOrder::Asc => Direction::Forward,
                    SortOrder::Desc => Direction::Reverse,
                },
                via_sort_index: false,
                signature,
            });
        }

        if !collection.sortable_fields().iter().any(|f| f.name == sort.field) {
            return Err(ResolveError::InvalidSort(format!(
                "'{}' is not an indexed scalar field of '{}'",
                sort.field, collection.name
            )));
        }
        Ok(Scan {
            prefix: keys::sort_prefix(
                generation,
                &collection.name,
                &sort.field,
                sort.order == SortOrder::Desc,
            ),
            direction: Direction::Forward,
            via_sort_index: true,
            signature,
        })
    }

    fn list(&self, collection: &CollectionType, request: &QueryRequest) -> Result<QueryResult, ResolveError> {
        let page_size = request.page_size.unwrap_or(self.config.default_page_size);
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(ResolveError::InvalidPageSize {
                size: page_size,
                max: self.config.max_page_size,
            });
        }
        let predicate = request
            .filter
            .as_ref()
            .map(|f| Predicate::compile(f, collection))
            .transpose()?;
        let sort = request
            .sort
            .clone()
            .or_else(|| collection.default_sort.as_deref().map(Sort::asc));

        // Validate sort and cursor before touching the index.
        let scan = self.plan_scan(collection, sort.as_ref(), 0)?;
        let after = request
            .cursor
            .as_deref()
            .map(|c| cursor::decode(c, &collection.name, &scan.signature))
            .transpose()?;

        let Some(generation) = self.snapshot()? else {
            return Ok(QueryResult {
                data: Value::Array(Vec::new()),
                page: Some(PageInfo {
                    end_cursor: None,
                    has_next_page: false,
                }),
                warnings: Vec::new(),
            });
        };
        let scan = self.plan_scan(collection, sort.as_ref(), generation)?;

        let whole = KeyRange::prefix(scan.prefix.clone());
        let range = match &after {
            Some(suffix) => {
                let mut key = scan.prefix.clone();
                key.extend_from_slice(suffix);
                match scan.direction {
                    Direction::Forward => whole.after(&key),
                    Direction::Reverse => whole.before(&key),
                }
            }
            None => whole,
        };

        let mut items = Vec::new();
        let mut warnings = Vec::new();
        let mut last_suffix: Option<Vec<u8>> = None;
        let mut has_next_page = false;
        for entry in ScanIter::new(self.storage, range, scan.direction) {
            let (key, value) = entry?;
            let record = if scan.via_sort_index {
                let path = String::from_utf8(value).map_err(|e| StorageError::Corrupt {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    message: e.to_string(),
                })?;
                match self.load(generation, &collection.name, &path)? {
                    Some(record) => record,
                    // written by an incremental run between our reads
                    None => continue,
                }
            } else {
                DocumentRecord::from_bytes(&key, &value)?
            };

            if let Some(predicate) = &predicate {
                if !predicate.matches(&record) {
                    continue;
                }
            }
            if items.len() == page_size {
                has_next_page = true;
                break;
            }
            let location = format!("[{}]", items.len());
            items.push(self.project_document(generation, collection, &record, &request.selection, &location, &mut warnings)?);
            last_suffix = Some(key[scan.prefix.len()..].to_vec());
        }

        Ok(QueryResult {
            data: Value::Array(items),
            page: Some(PageInfo {
                end_cursor: last_suffix.map(|s| cursor::encode(&collection.name, &scan.signature, &s)),
                has_next_page,
            }),
            warnings,
        })
    }

    // ── Projection ───────────────────────────────────────────────────

    fn project_document(
        &self,
        generation: u64,
        collection: &CollectionType,
        record: &DocumentRecord,
        selection: &Selection,
        location: &str,
        warnings: &mut Vec<Warning>,
    ) -> Result<Value, ResolveError> {
        let template = collection.template(&record.template);
        let mut out = Map::new();

        if selection.is_empty() {
            out = record.fields_json();
        } else {
            for (name, sub) in selection.iter() {
                let value = match name.as_str() {
                    SYSTEM_COLLECTION => Value::String(record.collection.clone()),
                    SYSTEM_PATH => Value::String(record.path.clone()),
                    SYSTEM_TEMPLATE => Value::String(record.template.clone()),
                    _ => match (template.and_then(|t| t.field(name)), record.fields.get(name)) {
                        (Some(field), Some(value)) => {
                            self.project_value(generation, &field.kind, value, sub, &join(location, name), warnings)?
                        }
                        // not on the matched template, or not set
                        _ => Value::Null,
                    },
                };
                out.insert(name.clone(), value);
            }
        }

        if collection.is_polymorphic() && !out.contains_key(SYSTEM_TEMPLATE) {
            out.insert(SYSTEM_TEMPLATE.to_string(), Value::String(record.template.clone()));
        }
        Ok(Value::Object(out))
    }

    fn project_object(
        &self,
        generation: u64,
        templates: &[TemplateType],
        object: &ObjectValue,
        selection: &Selection,
        location: &str,
        warnings: &mut Vec<Warning>,
    ) -> Result<Value, ResolveError> {
        let template = templates.iter().find(|t| t.name == object.template);
        let mut out = Map::new();

        if selection.is_empty() {
            for (name, value) in &object.fields {
                out.insert(name.clone(), value.to_json());
            }
        } else {
            for (name, sub) in selection.iter() {
                let value = if name == SYSTEM_TEMPLATE {
                    Value::String(object.template.clone())
                } else {
                    match (template.and_then(|t| t.field(name)), object.fields.get(name)) {
                        (Some(field), Some(value)) => {
                            self.project_value(generation, &field.kind, value, sub, &join(location, name), warnings)?
                        }
                        _ => Value::Null,
                    }
                };
                out.insert(name.clone(), value);
            }
        }

        if templates.len() > 1 && !out.contains_key(SYSTEM_TEMPLATE) {
            out.insert(SYSTEM_TEMPLATE.to_string(), Value::String(object.template.clone()));
        }
        Ok(Value::Object(out))
    }

    fn project_value(
        &self,
        generation: u64,
        kind: &FieldKind,
        value: &FieldValue,
        selection: &Selection,
        location: &str,
        warnings: &mut Vec<Warning>,
    ) -> Result<Value, ResolveError> {
        match (kind, value) {
            (FieldKind::Reference { collections }, FieldValue::Reference(target)) if !selection.is_empty() => {
                self.follow(generation, collections, target, selection, location, warnings)
            }
            (FieldKind::List { items }, FieldValue::List(values)) => {
                let mut out = Vec::with_capacity(values.len());
                for (i, item) in values.iter().enumerate() {
                    out.push(self.project_value(generation, items, item, selection, &format!("{location}[{i}]"), warnings)?);
                }
                Ok(Value::Array(out))
            }
            (FieldKind::Object { templates }, FieldValue::Object(object)) => {
                self.project_object(generation, templates, object, selection, location, warnings)
            }
            _ => Ok(value.to_json()),
        }
    }

    /// Dereference a reference. A missing target is a warning and `null`; a
    /// target outside the allowed collections is an error.
    fn follow(
        &self,
        generation: u64,
        allowed: &[String],
        target: &RefTarget,
        selection: &Selection,
        location: &str,
        warnings: &mut Vec<Warning>,
    ) -> Result<Value, ResolveError> {
        let owner = target
            .collection
            .as_ref()
            .filter(|c| allowed.contains(*c))
            .and_then(|c| self.graph.collection(c))
            .ok_or_else(|| ResolveError::InvalidReference {
                field: location.to_string(),
                target: target.path.clone(),
                allowed: allowed.to_vec(),
            })?;

        match self.load(generation, &owner.name, &target.path)? {
            Some(record) => self.project_document(generation, owner, &record, selection, location, warnings),
            None => {
                log::warn!("Dangling reference at {location}: {} is not indexed", target.path);
                warnings.push(Warning {
                    path: location.to_string(),
                    message: format!("referenced document '{}' was not found in '{}'", target.path, owner.name),
                });
                Ok(Value::Null)
            }
        }
    }
}
