//! Read-only views over dumps and published versions.
//!
//! A cancelled or failed farm job leaves its dumps behind with no other
//! trace; [`list_dumps`] is how those publishes are found.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::json;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::dump::DumpSerializer;
use crate::store::{DocFilter, DocType, Document, VersionStore};

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub id: String,
    pub name: String,
    pub version: Option<u32>,
    /// Representations whose extractor is not done yet.
    pub pending: Vec<String>,
    /// Set when the instance dump could not be loaded.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DumpStatus {
    pub path: PathBuf,
    pub session_id: String,
    pub by: String,
    pub date: String,
    pub instances: Vec<InstanceStatus>,
}

impl DumpStatus {
    /// Every instance loaded and has nothing left to extract.
    pub fn is_extracted(&self) -> bool {
        self.instances
            .iter()
            .all(|i| i.error.is_none() && i.pending.is_empty())
    }
}

fn context_globset() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new("**/.context.*.json")?);
    Ok(builder.build()?)
}

/// Context dumps under `<root>/dumps`, oldest session first.
pub fn list_dumps(root: &Path) -> Result<Vec<DumpStatus>> {
    let dumps = DumpSerializer::new(root);
    let dir = dumps.dumps_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let matcher = context_globset()?;

    let mut out = Vec::new();
    for entry in WalkDir::new(&dir).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() || !matcher.is_match(entry.path()) {
            continue;
        }
        let context = match dumps.load_context(entry.path()) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), "skipping unreadable context dump: {}", e);
                continue;
            }
        };

        let instances = context
            .instances
            .iter()
            .map(|summary| match dumps.load_instance(Path::new(&summary.dump)) {
                Ok(doc) => InstanceStatus {
                    id: summary.id.clone(),
                    name: summary.name.clone(),
                    version: summary.version,
                    pending: doc
                        .extractors
                        .iter()
                        .filter(|(_, d)| !d.done)
                        .map(|(name, _)| name.clone())
                        .collect(),
                    error: None,
                },
                Err(e) => InstanceStatus {
                    id: summary.id.clone(),
                    name: summary.name.clone(),
                    version: summary.version,
                    pending: Vec::new(),
                    error: Some(e.message),
                },
            })
            .collect();

        out.push(DumpStatus {
            path: entry.path().to_path_buf(),
            session_id: context.id,
            by: context.by,
            date: context.date,
            instances,
        });
    }

    // Session ids are time-sortable.
    out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Ok(out)
}

/// Integrated versions of one subset, in commit order.
pub async fn list_versions(
    store: &dyn VersionStore,
    project: &str,
    asset: &str,
    subset: &str,
) -> Result<Vec<Document>> {
    let Some(project_doc) = store
        .find_one(&DocFilter::of(DocType::Project).name(project))
        .await?
    else {
        return Ok(Vec::new());
    };
    let Some(asset_doc) = store
        .find_one(&DocFilter::of(DocType::Asset).id_parent(&project_doc.id).name(asset))
        .await?
    else {
        return Ok(Vec::new());
    };
    let Some(subset_doc) = store
        .find_one(&DocFilter::of(DocType::Subset).id_parent(&asset_doc.id).name(subset))
        .await?
    else {
        return Ok(Vec::new());
    };
    store
        .find(&DocFilter::of(DocType::Version).id_parent(&subset_doc.id))
        .await
}

/// Versions still flagged pending (integration interrupted).
pub async fn pending_versions(store: &dyn VersionStore) -> Result<Vec<Document>> {
    store
        .find(&DocFilter::of(DocType::Version).data_eq("pending", json!(true)))
        .await
}
