use super::model::{
    CollectionType, FieldDescriptor, FieldKind, ReferenceEdge, TemplateType, TypeGraph,
};
use crate::error::{SchemaError, SchemaErrorKind};
use crate::schema::{
    CollectionDefinition, FieldDefinition, FieldShape, FieldType, SchemaDefinition,
    TemplateDefinition,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Compile a schema definition into a type graph.
///
/// Compilation is pure: the same definition always yields an equal graph
/// with the same [`version`](TypeGraph::version). On error nothing is
/// returned, so a half-compiled graph can never be installed.
pub fn compile(schema: &SchemaDefinition) -> Result<TypeGraph, SchemaError> {
    let mut names = HashSet::new();
    for collection in &schema.collections {
        check_name(&collection.name, &collection.name, "collection")?;
        if !names.insert(collection.name.as_str()) {
            return Err(SchemaError::new(
                SchemaErrorKind::DuplicateCollection,
                &collection.name,
                format!("collection '{}' is declared more than once", collection.name),
            ));
        }
    }

    let mut collections = Vec::with_capacity(schema.collections.len());
    for definition in &schema.collections {
        collections.push(compile_collection(definition, &names)?);
    }

    let mut reverse_refs: BTreeMap<String, Vec<ReferenceEdge>> = BTreeMap::new();
    for collection in &collections {
        for template in &collection.templates {
            for field in &template.fields {
                collect_edges(&field.kind, &collection.name, &template.name, &field.name, &mut reverse_refs);
            }
        }
    }
    for edges in reverse_refs.values_mut() {
        edges.sort();
        edges.dedup();
    }

    let by_name: HashMap<String, usize> = collections
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.clone(), i))
        .collect();

    let mut graph = TypeGraph {
        collections,
        reverse_refs,
        by_name,
        version: String::new(),
    };
    graph.version = fingerprint(&graph)?;
    Ok(graph)
}

fn fingerprint(graph: &TypeGraph) -> Result<String, SchemaError> {
    let canonical = serde_json::to_vec(graph).map_err(|e| {
        SchemaError::new(SchemaErrorKind::InvalidDefinition, "", format!("cannot serialize graph: {e}"))
    })?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn compile_collection(
    definition: &CollectionDefinition,
    collection_names: &HashSet<&str>,
) -> Result<CollectionType, SchemaError> {
    let name = &definition.name;
    let path = definition.path.trim_matches('/').to_string();
    if path.is_empty() || path.contains('\0') {
        return Err(SchemaError::new(
            SchemaErrorKind::InvalidDefinition,
            name,
            "collection path must be a non-empty directory prefix",
        ));
    }

    let pattern = match &definition.match_glob {
        Some(glob) => Some(glob::Pattern::new(glob).map_err(|e| {
            SchemaError::new(
                SchemaErrorKind::InvalidDefinition,
                format!("{name}.match"),
                format!("invalid glob '{glob}': {e}"),
            )
        })?),
        None => None,
    };

    let template_defs: Vec<TemplateDefinition> = match (
        definition.fields.is_empty(),
        definition.templates.is_empty(),
    ) {
        (false, false) => {
            return Err(SchemaError::new(
                SchemaErrorKind::InvalidDefinition,
                name,
                "a collection declares either fields or templates, not both",
            ))
        }
        (true, true) => {
            return Err(SchemaError::new(
                SchemaErrorKind::EmptyCollection,
                name,
                "collection declares no templates",
            ))
        }
        (false, true) => vec![TemplateDefinition {
            name: name.clone(),
            fields: definition.fields.clone(),
        }],
        (true, false) => definition.templates.clone(),
    };

    let templates = compile_templates(&template_defs, name, collection_names)?;

    let collection = CollectionType {
        name: name.clone(),
        path,
        match_glob: definition.match_glob.clone(),
        format: definition.format.as_ref().map(|f| f.trim_start_matches('.').to_string()),
        strict: definition.strict,
        default_sort: definition.default_sort.clone(),
        templates,
        pattern,
    };

    if let Some(sort) = &collection.default_sort {
        match collection.field(sort) {
            Some(field) if field.is_sortable() => {}
            Some(field) => {
                return Err(SchemaError::new(
                    SchemaErrorKind::InvalidDefinition,
                    format!("{name}.default_sort"),
                    format!("field '{sort}' ({}) is not an indexed scalar", field.kind.label()),
                ))
            }
            None => {
                return Err(SchemaError::new(
                    SchemaErrorKind::InvalidDefinition,
                    format!("{name}.default_sort"),
                    format!("no template declares field '{sort}'"),
                ))
            }
        }
    }

    Ok(collection)
}

/// Compile a template group (a collection's templates or an object field's
/// templates) and check it can be read as a tagged union.
fn compile_templates(
    definitions: &[TemplateDefinition],
    owner: &str,
    collection_names: &HashSet<&str>,
) -> Result<Vec<TemplateType>, SchemaError> {
    let mut templates: Vec<TemplateType> = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let path = format!("{owner}.{}", definition.name);
        check_name(&definition.name, &path, "template")?;
        if templates.iter().any(|t| t.name == definition.name) {
            return Err(SchemaError::new(
                SchemaErrorKind::DuplicateTemplate,
                &path,
                format!("template '{}' is declared more than once", definition.name),
            ));
        }
        let fields = compile_fields(&definition.fields, &path, collection_names)?;
        templates.push(TemplateType {
            name: definition.name.clone(),
            fields,
        });
    }

    for (i, template) in templates.iter().enumerate() {
        for other in &templates[i + 1..] {
            for field in &template.fields {
                if let Some(clash) = other.field(&field.name) {
                    if field.kind.conflicts_with(&clash.kind) {
                        return Err(SchemaError::new(
                            SchemaErrorKind::AmbiguousTemplate,
                            format!("{owner}.{}", field.name),
                            format!(
                                "'{}' is {} on template '{}' but {} on template '{}'",
                                field.name,
                                field.kind.label(),
                                template.name,
                                clash.kind.label(),
                                other.name
                            ),
                        ));
                    }
                }
            }
        }
    }

    Ok(templates)
}

fn compile_fields(
    definitions: &[FieldDefinition],
    owner: &str,
    collection_names: &HashSet<&str>,
) -> Result<Vec<FieldDescriptor>, SchemaError> {
    let mut fields: Vec<FieldDescriptor> = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let path = format!("{owner}.{}", definition.name);
        check_name(&definition.name, &path, "field")?;
        if definition.name.starts_with('_') {
            return Err(SchemaError::new(
                SchemaErrorKind::InvalidField,
                &path,
                "field names starting with '_' are reserved",
            ));
        }
        if fields.iter().any(|f| f.name == definition.name) {
            return Err(SchemaError::new(
                SchemaErrorKind::DuplicateField,
                &path,
                format!("field '{}' is declared more than once", definition.name),
            ));
        }

        let kind = compile_kind(&definition.shape, &path, collection_names)?;
        let indexed = match definition.shape.indexed {
            Some(true) if !kind.is_scalar() => {
                return Err(SchemaError::new(
                    SchemaErrorKind::InvalidField,
                    &path,
                    format!("{} fields cannot be indexed", kind.label()),
                ))
            }
            Some(indexed) => indexed,
            None => kind.is_scalar(),
        };

        fields.push(FieldDescriptor {
            name: definition.name.clone(),
            kind,
            required: definition.shape.required,
            indexed,
        });
    }
    Ok(fields)
}

fn compile_kind(
    shape: &FieldShape,
    path: &str,
    collection_names: &HashSet<&str>,
) -> Result<FieldKind, SchemaError> {
    let kind = match shape.field_type {
        FieldType::String => FieldKind::String,
        FieldType::Number => FieldKind::Number,
        FieldType::Boolean => FieldKind::Boolean,
        FieldType::Datetime => FieldKind::Datetime,
        FieldType::RichText => FieldKind::RichText,
        FieldType::Reference => {
            if shape.collections.is_empty() {
                return Err(SchemaError::new(
                    SchemaErrorKind::InvalidField,
                    path,
                    "reference fields must name at least one target collection",
                ));
            }
            let mut targets: Vec<String> = Vec::with_capacity(shape.collections.len());
            for target in &shape.collections {
                if !collection_names.contains(target.as_str()) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::DanglingReference,
                        path,
                        format!("target collection '{target}' does not exist"),
                    ));
                }
                if !targets.contains(target) {
                    targets.push(target.clone());
                }
            }
            FieldKind::Reference {
                collections: targets,
            }
        }
        FieldType::List => {
            let items = shape.items.as_ref().ok_or_else(|| {
                SchemaError::new(SchemaErrorKind::InvalidField, path, "list fields must declare items")
            })?;
            let item_kind = compile_kind(&items.shape(), &format!("{path}[]"), collection_names)?;
            FieldKind::List {
                items: Box::new(item_kind),
            }
        }
        FieldType::Object => {
            let templates = match (shape.fields.is_empty(), shape.templates.is_empty()) {
                (false, false) => {
                    return Err(SchemaError::new(
                        SchemaErrorKind::InvalidField,
                        path,
                        "an object declares either fields or templates, not both",
                    ))
                }
                (true, true) => {
                    return Err(SchemaError::new(
                        SchemaErrorKind::InvalidField,
                        path,
                        "object fields must declare fields or templates",
                    ))
                }
                (false, true) => {
                    let leaf = path.rsplit('.').next().unwrap_or(path).trim_end_matches("[]");
                    vec![TemplateDefinition {
                        name: leaf.to_string(),
                        fields: shape.fields.clone(),
                    }]
                }
                (true, false) => shape.templates.clone(),
            };
            FieldKind::Object {
                templates: compile_templates(&templates, path, collection_names)?,
            }
        }
    };
    Ok(kind)
}

fn check_name(name: &str, path: &str, what: &str) -> Result<(), SchemaError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        let kind = if what == "field" {
            SchemaErrorKind::InvalidField
        } else {
            SchemaErrorKind::InvalidDefinition
        };
        Err(SchemaError::new(
            kind,
            path,
            format!("{what} name '{name}' must be non-empty and use only [A-Za-z0-9_-]"),
        ))
    }
}

fn collect_edges(
    kind: &FieldKind,
    collection: &str,
    template: &str,
    field_path: &str,
    out: &mut BTreeMap<String, Vec<ReferenceEdge>>,
) {
    match kind {
        FieldKind::Reference { collections } => {
            for target in collections {
                out.entry(target.clone()).or_default().push(ReferenceEdge {
                    collection: collection.to_string(),
                    template: template.to_string(),
                    field: field_path.to_string(),
                });
            }
        }
        FieldKind::List { items } => collect_edges(items, collection, template, field_path, out),
        FieldKind::Object { templates } => {
            for nested in templates {
                for field in &nested.fields {
                    let path = format!("{field_path}.{}", field.name);
                    collect_edges(&field.kind, collection, template, &path, out);
                }
            }
        }
        _ => {}
    }
}
