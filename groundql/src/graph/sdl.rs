use super::model::{CollectionType, FieldDescriptor, FieldKind, TemplateType, TypeGraph};
use heck::{ToLowerCamelCase, ToPascalCase};
use std::fmt::Write;

/// Document type name of a collection, e.g. "blog_posts" -> "BlogPosts"
pub fn collection_type_name(collection: &str) -> String {
    collection.to_pascal_case()
}

/// Object type name of one template variant, e.g. ("pages", "article") -> "PagesArticle"
pub fn variant_type_name(owner: &str, template: &str) -> String {
    format!("{}{}", owner.to_pascal_case(), template.to_pascal_case())
}

/// Root query field for a collection, e.g. "blog_posts" -> "blogPosts"
pub fn query_field_name(collection: &str) -> String {
    collection.to_lower_camel_case()
}

impl TypeGraph {
    /// Render the graph as GraphQL-style SDL.
    ///
    /// Every polymorphic collection (and polymorphic object group) becomes a
    /// `union` of one object type per template; references become the
    /// target collection's type, or a union when several targets are allowed.
    pub fn to_sdl(&self) -> String {
        let mut out = SdlWriter::default();
        out.line("scalar DateTime");
        out.line("scalar JSON");
        out.blank();

        for collection in &self.collections {
            out.collection(collection);
        }

        out.line("type Query {");
        for collection in &self.collections {
            let field = query_field_name(&collection.name);
            let ty = collection_type_name(&collection.name);
            out.line(&format!("  {field}(path: String!): {ty}"));
            out.line(&format!(
                "  {field}Connection(filter: JSON, sort: String, after: String, first: Int): {ty}Connection!"
            ));
        }
        out.line("}");
        out.finish()
    }
}

#[derive(Default)]
struct SdlWriter {
    buf: String,
    deferred: Vec<String>,
}

impl SdlWriter {
    fn line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
    }

    fn blank(&mut self) {
        self.buf.push('\n');
    }

    fn finish(mut self) -> String {
        for block in std::mem::take(&mut self.deferred) {
            self.buf.push_str(&block);
        }
        self.buf
    }

    fn collection(&mut self, collection: &CollectionType) {
        let ty = collection_type_name(&collection.name);
        if collection.is_polymorphic() {
            let members: Vec<String> = collection
                .templates
                .iter()
                .map(|t| variant_type_name(&collection.name, &t.name))
                .collect();
            self.line(&format!("union {ty} = {}", members.join(" | ")));
            self.blank();
            for template in &collection.templates {
                let name = variant_type_name(&collection.name, &template.name);
                self.object(&name, template, true);
            }
        } else {
            self.object(&ty, &collection.templates[0], true);
        }

        self.line(&format!("type {ty}Connection {{"));
        self.line(&format!("  items: [{ty}!]!"));
        self.line("  endCursor: String");
        self.line("  hasNextPage: Boolean!");
        self.line("}");
        self.blank();
    }

    fn object(&mut self, name: &str, template: &TemplateType, document: bool) {
        let mut block = String::new();
        let _ = writeln!(block, "type {name} {{");
        if document {
            block.push_str("  _collection: String!\n  _path: String!\n");
        }
        block.push_str("  _template: String!\n");
        for field in &template.fields {
            let ty = self.field_type(name, field, &field.kind);
            let bang = if field.required { "!" } else { "" };
            let _ = writeln!(block, "  {}: {ty}{bang}", field.name);
        }
        block.push_str("}\n\n");
        self.buf.push_str(&block);
    }

    fn field_type(&mut self, owner: &str, field: &FieldDescriptor, kind: &FieldKind) -> String {
        match kind {
            FieldKind::String => "String".into(),
            FieldKind::Number => "Float".into(),
            FieldKind::Boolean => "Boolean".into(),
            FieldKind::Datetime => "DateTime".into(),
            FieldKind::RichText => "JSON".into(),
            FieldKind::Reference { collections } if collections.len() == 1 => {
                collection_type_name(&collections[0])
            }
            FieldKind::Reference { collections } => {
                let union = format!("{owner}{}Reference", field.name.to_pascal_case());
                let members: Vec<String> =
                    collections.iter().map(|c| collection_type_name(c)).collect();
                self.deferred
                    .push(format!("union {union} = {}\n\n", members.join(" | ")));
                union
            }
            FieldKind::List { items } => format!("[{}]", self.field_type(owner, field, items)),
            FieldKind::Object { templates } => {
                let base = format!("{owner}{}", field.name.to_pascal_case());
                if templates.len() == 1 {
                    let mut nested = SdlWriter::default();
                    nested.object(&base, &templates[0], false);
                    self.deferred.push(nested.finish());
                    base
                } else {
                    let mut nested = SdlWriter::default();
                    let members: Vec<String> = templates
                        .iter()
                        .map(|t| format!("{base}{}", t.name.to_pascal_case()))
                        .collect();
                    nested.line(&format!("union {base} = {}", members.join(" | ")));
                    nested.blank();
                    for (template, member) in templates.iter().zip(&members) {
                        nested.object(member, template, false);
                    }
                    self.deferred.push(nested.finish());
                    base
                }
            }
        }
    }
}
