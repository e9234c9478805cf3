pub mod parser;
pub mod types;

pub use parser::{parse_schema, parse_schema_str};
pub use types::*;
