//! Versioned asset store abstraction.
//!
//! The [`VersionStore`] trait is the only surface integration needs from
//! "the database": project, asset, subset, version and representation
//! documents addressed by generated ids. Backends:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`memory::InMemoryStore`] | Tests and dry runs |
//! | [`crate::sqlite_store::SqliteStore`] | Shared SQLite file on the pipeline server |

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Project,
    Asset,
    Subset,
    Version,
    Representation,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Project => "project",
            DocType::Asset => "asset",
            DocType::Subset => "subset",
            DocType::Version => "version",
            DocType::Representation => "representation",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "project" => DocType::Project,
            "asset" => DocType::Asset,
            "subset" => DocType::Subset,
            "version" => DocType::Version,
            "representation" => DocType::Representation,
            other => bail!("Unknown document type: '{}'", other),
        })
    }
}

/// One stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: DocType,
    pub parent: Option<String>,
    pub name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(
        doc_type: DocType,
        parent: Option<&str>,
        name: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            id: crate::ids::new_id(),
            doc_type,
            parent: parent.map(str::to_string),
            name: name.into(),
            data,
        }
    }
}

/// Equality filter over document fields and top-level `data` keys.
#[derive(Debug, Clone, Default)]
pub struct DocFilter {
    pub doc_type: Option<DocType>,
    pub parent: Option<String>,
    pub name: Option<String>,
    pub data_eq: Vec<(String, Value)>,
}

impl DocFilter {
    pub fn of(doc_type: DocType) -> Self {
        Self {
            doc_type: Some(doc_type),
            ..Default::default()
        }
    }

    pub fn id_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn data_eq(mut self, key: &str, value: Value) -> Self {
        self.data_eq.push((key.to_string(), value));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if self.doc_type.is_some_and(|t| t != doc.doc_type) {
            return false;
        }
        if self.parent.is_some() && self.parent != doc.parent {
            return false;
        }
        if self.name.as_ref().is_some_and(|n| *n != doc.name) {
            return false;
        }
        self.data_eq
            .iter()
            .all(|(key, value)| doc.data.get(key) == Some(value))
    }
}

/// Document store backing integration.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`find_one`](VersionStore::find_one) | First document matching a filter |
/// | [`find`](VersionStore::find) | All matches, in insertion order |
/// | [`insert_one`](VersionStore::insert_one) | Insert a document, returning its id |
/// | [`update_many`](VersionStore::update_many) | Set `data` keys on every match |
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn find_one(&self, filter: &DocFilter) -> Result<Option<Document>>;

    async fn find(&self, filter: &DocFilter) -> Result<Vec<Document>>;

    async fn insert_one(&self, doc: Document) -> Result<String>;

    /// Returns the number of documents updated.
    async fn update_many(&self, filter: &DocFilter, set: &Map<String, Value>) -> Result<u64>;
}

/// Highest integrated version number under a subset, if any.
pub async fn latest_version(store: &dyn VersionStore, subset_id: &str) -> Result<Option<u32>> {
    let versions = store
        .find(&DocFilter::of(DocType::Version).id_parent(subset_id))
        .await?;
    Ok(versions
        .iter()
        .filter_map(|v| v.data.get("version").and_then(Value::as_u64))
        .map(|v| v as u32)
        .max())
}
