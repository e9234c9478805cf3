//! The compiled type graph: collections, template variants, field kinds and
//! reference edges derived from a [`SchemaDefinition`](crate::schema::SchemaDefinition).

mod compiler;
mod diff;
mod model;
mod sdl;

pub use compiler::compile;
pub use diff::{diff_graphs, needs_reindex, SchemaChange};
pub use model::*;
pub use sdl::{collection_type_name, query_field_name, variant_type_name};
