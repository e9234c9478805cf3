use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// System fields every document exposes next to its declared fields.
pub const SYSTEM_COLLECTION: &str = "_collection";
pub const SYSTEM_PATH: &str = "_path";
pub const SYSTEM_TEMPLATE: &str = "_template";

/// The compiled, immutable type graph for one schema version.
///
/// Produced by [`compile`](super::compile). Indexing and resolution read the
/// same graph for a run; it is shared behind an `Arc` and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeGraph {
    pub(crate) collections: Vec<CollectionType>,
    pub(crate) reverse_refs: BTreeMap<String, Vec<ReferenceEdge>>,
    #[serde(skip)]
    pub(crate) by_name: HashMap<String, usize>,
    #[serde(skip)]
    pub(crate) version: String,
}

impl TypeGraph {
    /// Stable fingerprint of everything that affects the index layout.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Collections in declaration order
    pub fn collections(&self) -> &[CollectionType] {
        &self.collections
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionType> {
        self.by_name.get(name).map(|&i| &self.collections[i])
    }

    /// The first collection (in declaration order) that owns a content path.
    pub fn collection_for_path(&self, path: &str) -> Option<&CollectionType> {
        self.collections.iter().find(|c| c.contains_path(path))
    }

    /// Reference fields, anywhere in the schema, that may point at `collection`.
    pub fn referenced_by(&self, collection: &str) -> &[ReferenceEdge] {
        self.reverse_refs
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A collection: a path space plus a closed set of template variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionType {
    pub name: String,
    pub path: String,
    pub match_glob: Option<String>,
    pub format: Option<String>,
    pub strict: bool,
    /// Resolve-time only, so it is left out of the version fingerprint.
    #[serde(skip)]
    pub default_sort: Option<String>,
    pub templates: Vec<TemplateType>,
    #[serde(skip)]
    pub(crate) pattern: Option<glob::Pattern>,
}

impl CollectionType {
    /// More than one template: records carry a `_template` discriminator.
    pub fn is_polymorphic(&self) -> bool {
        self.templates.len() > 1
    }

    pub fn template(&self, name: &str) -> Option<&TemplateType> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// First declaration of `name` across the templates. Compilation
    /// guarantees every declaration shares the same kind.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.templates.iter().find_map(|t| t.field(name))
    }

    /// Indexed scalar field names across all templates, deduplicated, in
    /// declaration order. Every record gets a sort entry for each of them.
    pub fn sortable_fields(&self) -> Vec<&FieldDescriptor> {
        let mut seen = Vec::<&FieldDescriptor>::new();
        for template in &self.templates {
            for field in &template.fields {
                if field.is_sortable() && !seen.iter().any(|f| f.name == field.name) {
                    seen.push(field);
                }
            }
        }
        seen
    }

    /// Whether a content path belongs to this collection
    pub fn contains_path(&self, path: &str) -> bool {
        let rest = match path.strip_prefix(self.path.as_str()) {
            Some(rest) => match rest.strip_prefix('/') {
                Some(rest) if !rest.is_empty() => rest,
                _ => return false,
            },
            None => return false,
        };

        if let Some(format) = &self.format {
            let ext = rest.rsplit_once('.').map(|(_, ext)| ext);
            if ext != Some(format.as_str()) {
                return false;
            }
        }

        match &self.pattern {
            Some(pattern) => pattern.matches_with(
                rest,
                glob::MatchOptions {
                    case_sensitive: true,
                    require_literal_separator: true,
                    require_literal_leading_dot: false,
                },
            ),
            None => true,
        }
    }
}

/// One variant shape. Field order is declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateType {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl TemplateType {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.required)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub indexed: bool,
}

impl FieldDescriptor {
    pub fn is_sortable(&self) -> bool {
        self.indexed && self.kind.is_scalar()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Datetime,
    RichText,
    Reference { collections: Vec<String> },
    List { items: Box<FieldKind> },
    Object { templates: Vec<TemplateType> },
}

impl FieldKind {
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            FieldKind::String | FieldKind::Number | FieldKind::Boolean | FieldKind::Datetime
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Datetime => "datetime",
            FieldKind::RichText => "rich-text",
            FieldKind::Reference { .. } => "reference",
            FieldKind::List { .. } => "list",
            FieldKind::Object { .. } => "object",
        }
    }

    /// Two declarations of the same field name would make a union read
    /// ambiguous when their shapes differ. Reference targets and object
    /// members may differ; the outer kind (and list item kind) may not.
    pub fn conflicts_with(&self, other: &FieldKind) -> bool {
        match (self, other) {
            (FieldKind::List { items: a }, FieldKind::List { items: b }) => a.conflicts_with(b),
            (a, b) => a.label() != b.label(),
        }
    }
}

/// A reference field somewhere in the schema that may point at a collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ReferenceEdge {
    pub collection: String,
    pub template: String,
    /// Dotted path from the document root, e.g. `blocks.author`
    pub field: String,
}
