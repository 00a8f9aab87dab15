//! Core data types shared by the orchestrator, the backends, and the
//! renderers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CatalogueError;

/// Which index field a search runs against.
///
/// `Simple` is a plain full-text query; the three vector modes each map to
/// one embedding field stored on every catalogue record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Simple,
    Marc,
    Prose,
    Json,
}

impl SearchMode {
    /// Modes that carry a vector, in the order they are offered to users.
    pub const VECTOR_MODES: [SearchMode; 3] = [SearchMode::Marc, SearchMode::Prose, SearchMode::Json];

    /// Option value used on the wire (`"simple"`, `"marc"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Simple => "simple",
            SearchMode::Marc => "marc",
            SearchMode::Prose => "prose",
            SearchMode::Json => "json",
        }
    }

    /// Human-readable choice label shown in the command picker.
    pub fn label(&self) -> &'static str {
        match self {
            SearchMode::Simple => "Simple Elastic Query",
            SearchMode::Marc => "Marc Vector",
            SearchMode::Prose => "Prose Vector",
            SearchMode::Json => "JSON Vector",
        }
    }

    /// Index field holding the embedding for this mode, if any.
    pub fn embedding_field(&self) -> Option<&'static str> {
        match self {
            SearchMode::Simple => None,
            SearchMode::Marc => Some("embedding_marc"),
            SearchMode::Prose => Some("embedding_prose"),
            SearchMode::Json => Some("embedding_json"),
        }
    }

    pub fn requires_embedding(&self) -> bool {
        !matches!(self, SearchMode::Simple)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = CatalogueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(SearchMode::Simple),
            "marc" => Ok(SearchMode::Marc),
            "prose" => Ok(SearchMode::Prose),
            "json" => Ok(SearchMode::Json),
            other => Err(CatalogueError::InvalidOption(format!(
                "Unknown search type {}",
                other
            ))),
        }
    }
}

/// A person attributed to a record (author, editor, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// A catalogue record as returned by the search backend.
///
/// The core only reads `id`, `title`, and the embedding fields. Persons and
/// record identifiers feed the result cards; `source` keeps the raw index
/// document for the plain-text template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_marc: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_prose: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_json: Option<Vec<f32>>,
    /// Persons grouped by role, role names as they appear in the record.
    #[serde(default)]
    pub persons: BTreeMap<String, Vec<Person>>,
    #[serde(default)]
    pub record_identifiers: Vec<String>,
    #[serde(default)]
    pub source: serde_json::Value,
}

impl Document {
    /// Returns the stored embedding for `mode`, or `None` if the field is
    /// missing or empty. `Simple` never has one.
    pub fn embedding(&self, mode: SearchMode) -> Option<&[f32]> {
        let field = match mode {
            SearchMode::Simple => None,
            SearchMode::Marc => self.embedding_marc.as_deref(),
            SearchMode::Prose => self.embedding_prose.as_deref(),
            SearchMode::Json => self.embedding_json.as_deref(),
        };
        field.filter(|v| !v.is_empty())
    }
}

/// One page of results plus the backend's total hit count.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub total: u64,
    pub docs: Vec<Document>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_roundtrip_through_option_value() {
        for mode in [
            SearchMode::Simple,
            SearchMode::Marc,
            SearchMode::Prose,
            SearchMode::Json,
        ] {
            assert_eq!(mode.as_str().parse::<SearchMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_unknown_mode_is_invalid_option() {
        let err = "vectorZ".parse::<SearchMode>().unwrap_err();
        assert!(matches!(err, CatalogueError::InvalidOption(_)));
    }

    #[test]
    fn test_embedding_ignores_empty_field() {
        let doc = Document {
            embedding_marc: Some(vec![]),
            embedding_prose: Some(vec![0.5, 0.5]),
            ..Default::default()
        };
        assert!(doc.embedding(SearchMode::Marc).is_none());
        assert!(doc.embedding(SearchMode::Json).is_none());
        assert_eq!(doc.embedding(SearchMode::Prose), Some(&[0.5, 0.5][..]));
        assert!(doc.embedding(SearchMode::Simple).is_none());
    }

    #[test]
    fn test_only_simple_skips_embedding() {
        assert!(!SearchMode::Simple.requires_embedding());
        for mode in SearchMode::VECTOR_MODES {
            assert!(mode.requires_embedding());
            assert!(mode.embedding_field().is_some());
        }
    }
}
