use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a document is matched to one template of its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateMatchPolicy {
    /// First template, in declaration order, whose required fields are all present.
    #[default]
    FirstMatch,
    /// First template whose required fields are present and whose field set
    /// covers every key in the document. Falls back to `FirstMatch`.
    BestFit,
}

/// Runtime settings for a [`Database`](crate::Database). Every field has a
/// default, so an empty YAML document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// A rebuild lock older than this may be taken over by another rebuild.
    pub lock_ttl_secs: u64,
    pub template_policy: TemplateMatchPolicy,
    /// Parse and normalize documents on the rayon pool during full rebuilds.
    pub parallel: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            default_page_size: 50,
            max_page_size: 1000,
            lock_ttl_secs: 600,
            template_policy: TemplateMatchPolicy::FirstMatch,
            parallel: true,
        }
    }
}

impl DatabaseConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }
}
