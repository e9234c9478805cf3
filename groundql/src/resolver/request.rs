use super::filter::Filter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A nested field selection. An empty selection on a document or object
/// returns all of its stored fields; on a reference it returns the target
/// path without following it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selection(pub BTreeMap<String, Selection>);

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaf selection of the given field names.
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection(names.into_iter().map(|n| (n.into(), Selection::new())).collect())
    }

    /// Add (or replace) one field with a sub-selection.
    pub fn with(mut self, name: impl Into<String>, sub: Selection) -> Self {
        self.0.insert(name.into(), sub);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Selection)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Sort {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Sort {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// A structured query against one collection. With `path` set it is a
/// single-document lookup; otherwise a paginated list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub collection: String,
    pub path: Option<String>,
    pub selection: Selection,
    pub filter: Option<Filter>,
    pub sort: Option<Sort>,
    /// `end_cursor` of the previous page
    pub cursor: Option<String>,
    pub page_size: Option<usize>,
}

impl QueryRequest {
    pub fn get(collection: impl Into<String>, path: impl Into<String>, selection: Selection) -> Self {
        QueryRequest {
            collection: collection.into(),
            path: Some(path.into()),
            selection,
            ..Default::default()
        }
    }

    pub fn list(collection: impl Into<String>, selection: Selection) -> Self {
        QueryRequest {
            collection: collection.into(),
            selection,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// A non-fatal problem found while resolving, e.g. a dangling reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Location in the result data, e.g. `items[2].author`
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// An object for lookups, an array of objects for lists
    pub data: serde_json::Value,
    pub page: Option<PageInfo>,
    pub warnings: Vec<Warning>,
}

impl QueryResult {
    /// Items of a list result
    pub fn items(&self) -> &[serde_json::Value] {
        self.data.as_array().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn end_cursor(&self) -> Option<String> {
        self.page.as_ref().and_then(|p| p.end_cursor.clone())
    }

    pub fn has_next_page(&self) -> bool {
        self.page.as_ref().map_or(false, |p| p.has_next_page)
    }
}
