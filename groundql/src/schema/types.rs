use serde::{Deserialize, Serialize};

/// Top-level schema definition parsed from schema.yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub collections: Vec<CollectionDefinition>,
}

/// Definition of a single collection.
///
/// A collection declares either `fields` (one implicit template named after
/// the collection) or a list of `templates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    pub name: String,
    /// Directory prefix in the content source, e.g. `content/posts`
    pub path: String,
    /// Optional glob applied to paths relative to `path`
    #[serde(rename = "match", default)]
    pub match_glob: Option<String>,
    /// Optional file extension filter, e.g. `md`
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub default_sort: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub templates: Vec<TemplateDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

/// Definition of a single named field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(flatten)]
    pub shape: FieldShape,
}

/// Everything about a field except its name. List items reuse this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldShape {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub indexed: Option<bool>,
    /// Allowed target collections of a reference
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub items: Option<ItemType>,
    /// Fields of an object with a single shape
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    /// Variants of a polymorphic object group
    #[serde(default)]
    pub templates: Vec<TemplateDefinition>,
}

impl FieldShape {
    pub fn of(field_type: FieldType) -> Self {
        FieldShape {
            field_type,
            required: false,
            indexed: None,
            collections: Vec::new(),
            items: None,
            fields: Vec::new(),
            templates: Vec::new(),
        }
    }
}

/// Field type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    #[serde(alias = "date")]
    Datetime,
    #[serde(alias = "rich_text", alias = "richtext")]
    RichText,
    #[serde(alias = "ref")]
    Reference,
    List,
    Object,
}

/// Item type for lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemType {
    Simple(FieldType),
    Complex(Box<FieldShape>),
}

impl ItemType {
    pub fn shape(&self) -> FieldShape {
        match self {
            ItemType::Simple(field_type) => FieldShape::of(*field_type),
            ItemType::Complex(shape) => (**shape).clone(),
        }
    }
}
