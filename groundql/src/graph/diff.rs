use super::model::{CollectionType, TypeGraph};

/// A single difference between two compiled schema versions.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    CollectionAdded { name: String },
    CollectionRemoved { name: String },
    LocationChanged { collection: String },
    TemplateAdded { collection: String, template: String },
    TemplateRemoved { collection: String, template: String },
    FieldAdded {
        collection: String,
        template: String,
        field: String,
        required: bool,
    },
    FieldRemoved {
        collection: String,
        template: String,
        field: String,
    },
    FieldKindChanged {
        collection: String,
        template: String,
        field: String,
    },
    FieldFlagsChanged {
        collection: String,
        template: String,
        field: String,
    },
    StrictnessChanged { collection: String },
    DefaultSortChanged { collection: String },
}

impl SchemaChange {
    /// Whether existing index records may be wrong under the new schema.
    /// Only resolve-time settings can change without a full rebuild.
    pub fn requires_reindex(&self) -> bool {
        !matches!(self, SchemaChange::DefaultSortChanged { .. })
    }

    /// Human-readable description of this change.
    pub fn describe(&self) -> String {
        match self {
            SchemaChange::CollectionAdded { name } => format!("Collection '{name}' added"),
            SchemaChange::CollectionRemoved { name } => format!("Collection '{name}' removed"),
            SchemaChange::LocationChanged { collection } => {
                format!("Path, match or format of '{collection}' changed")
            }
            SchemaChange::TemplateAdded { collection, template } => {
                format!("Template '{collection}.{template}' added")
            }
            SchemaChange::TemplateRemoved { collection, template } => {
                format!("Template '{collection}.{template}' removed")
            }
            SchemaChange::FieldAdded {
                collection,
                template,
                field,
                required,
            } => {
                let qualifier = if *required { " (required)" } else { "" };
                format!("Field '{collection}.{template}.{field}' added{qualifier}")
            }
            SchemaChange::FieldRemoved {
                collection,
                template,
                field,
            } => format!("Field '{collection}.{template}.{field}' removed"),
            SchemaChange::FieldKindChanged {
                collection,
                template,
                field,
            } => format!("Field '{collection}.{template}.{field}' changed shape"),
            SchemaChange::FieldFlagsChanged {
                collection,
                template,
                field,
            } => format!("Field '{collection}.{template}.{field}' changed required/indexed flags"),
            SchemaChange::StrictnessChanged { collection } => {
                format!("Strict mode of '{collection}' changed")
            }
            SchemaChange::DefaultSortChanged { collection } => {
                format!("Default sort of '{collection}' changed")
            }
        }
    }
}

/// Compare two compiled graphs. The result is ordered by the new graph's
/// declaration order, then removals.
pub fn diff_graphs(old: &TypeGraph, new: &TypeGraph) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    for collection in new.collections() {
        match old.collection(&collection.name) {
            None => changes.push(SchemaChange::CollectionAdded {
                name: collection.name.clone(),
            }),
            Some(previous) => diff_collection(previous, collection, &mut changes),
        }
    }

    for collection in old.collections() {
        if new.collection(&collection.name).is_none() {
            changes.push(SchemaChange::CollectionRemoved {
                name: collection.name.clone(),
            });
        }
    }

    changes
}

/// Whether any change in the list invalidates the current index.
pub fn needs_reindex(changes: &[SchemaChange]) -> bool {
    changes.iter().any(SchemaChange::requires_reindex)
}

fn diff_collection(old: &CollectionType, new: &CollectionType, changes: &mut Vec<SchemaChange>) {
    let name = &new.name;

    if old.path != new.path || old.match_glob != new.match_glob || old.format != new.format {
        changes.push(SchemaChange::LocationChanged {
            collection: name.clone(),
        });
    }
    if old.strict != new.strict {
        changes.push(SchemaChange::StrictnessChanged {
            collection: name.clone(),
        });
    }
    if old.default_sort != new.default_sort {
        changes.push(SchemaChange::DefaultSortChanged {
            collection: name.clone(),
        });
    }

    for template in &new.templates {
        let Some(previous) = old.template(&template.name) else {
            changes.push(SchemaChange::TemplateAdded {
                collection: name.clone(),
                template: template.name.clone(),
            });
            continue;
        };

        for field in &template.fields {
            match previous.field(&field.name) {
                None => changes.push(SchemaChange::FieldAdded {
                    collection: name.clone(),
                    template: template.name.clone(),
                    field: field.name.clone(),
                    required: field.required,
                }),
                Some(before) if before.kind != field.kind => {
                    changes.push(SchemaChange::FieldKindChanged {
                        collection: name.clone(),
                        template: template.name.clone(),
                        field: field.name.clone(),
                    })
                }
                Some(before) if before.required != field.required || before.indexed != field.indexed => {
                    changes.push(SchemaChange::FieldFlagsChanged {
                        collection: name.clone(),
                        template: template.name.clone(),
                        field: field.name.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        for field in &previous.fields {
            if template.field(&field.name).is_none() {
                changes.push(SchemaChange::FieldRemoved {
                    collection: name.clone(),
                    template: template.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
    }

    for template in &old.templates {
        if new.template(&template.name).is_none() {
            changes.push(SchemaChange::TemplateRemoved {
                collection: name.clone(),
                template: template.name.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::compile;
    use crate::schema::parse_schema_str;

    fn graph(yaml: &str) -> TypeGraph {
        compile(&parse_schema_str(yaml).unwrap()).unwrap()
    }

    const BASE: &str = r#"
collections:
  - name: users
    path: users
    fields:
      - { name: name, type: string, required: true }
"#;

    #[test]
    fn test_diff_no_changes() {
        let schema = graph(BASE);
        let diffs = diff_graphs(&schema, &schema);
        assert!(diffs.is_empty());
        assert!(!needs_reindex(&diffs));
    }

    #[test]
    fn test_diff_new_field() {
        let new = graph(
            r#"
collections:
  - name: users
    path: users
    fields:
      - { name: name, type: string, required: true }
      - { name: role, type: string }
"#,
        );
        let diffs = diff_graphs(&graph(BASE), &new);
        assert_eq!(
            diffs,
            vec![SchemaChange::FieldAdded {
                collection: "users".into(),
                template: "users".into(),
                field: "role".into(),
                required: false,
            }]
        );
        assert!(needs_reindex(&diffs));
    }

    #[test]
    fn test_diff_kind_change_and_removed_collection() {
        let old = graph(
            r#"
collections:
  - name: users
    path: users
    fields:
      - { name: name, type: string, required: true }
  - name: tags
    path: tags
    fields:
      - { name: label, type: string }
"#,
        );
        let new = graph(
            r#"
collections:
  - name: users
    path: users
    fields:
      - { name: name, type: number, required: true }
"#,
        );
        let diffs = diff_graphs(&old, &new);
        assert_eq!(diffs.len(), 2);
        assert!(matches!(diffs[0], SchemaChange::FieldKindChanged { .. }));
        assert_eq!(
            diffs[1],
            SchemaChange::CollectionRemoved {
                name: "tags".into()
            }
        );
        assert!(diffs[1].describe().contains("tags"));
    }

    #[test]
    fn test_default_sort_change_does_not_require_reindex() {
        let new = graph(
            r#"
collections:
  - name: users
    path: users
    default_sort: name
    fields:
      - { name: name, type: string, required: true }
"#,
        );
        let old = graph(BASE);
        let diffs = diff_graphs(&old, &new);
        assert_eq!(
            diffs,
            vec![SchemaChange::DefaultSortChanged {
                collection: "users".into()
            }]
        );
        assert!(!needs_reindex(&diffs));
        assert_eq!(old.version(), new.version());
    }
}
