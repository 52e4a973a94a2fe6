//! Version integration into the store and the publish tree.
//!
//! Layout of one integrated version:
//!
//! ```text
//! <root>/<project>/<asset>/publish/<subset>/v003/
//!     .instance.json          (only for delegated publishes)
//!     Alembic/chair.abc       (moved from .stage/Alembic/)
//!     FBXCache/big.fbx        (hardlink)
//! ```
//!
//! Documents are inserted with `pending = true` before any file moves and
//! flipped to `false` once the files are in place, so a crash in between
//! leaves a visibly incomplete version that a rerun completes.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dump::EXTRACTOR_DUMP_NAME;
use crate::error::{ErrorKind, PublishError, PublishResult};
use crate::instance::InstanceRecord;
use crate::session::SessionContext;
use crate::store::{latest_version, DocFilter, DocType, Document, VersionStore};
use crate::traits::Integrates;

/// A version committed (or being committed) for one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegratedVersion {
    pub instance_id: String,
    pub subset_id: String,
    pub version_id: String,
    pub version: u32,
    pub name: String,
    pub representations: Vec<String>,
    pub pending: bool,
}

pub fn version_name(version: u32) -> String {
    format!("v{:03}", version)
}

/// `<root>/<project>/<asset>/publish/<subset>`
pub fn subset_dir(root: &Path, project: &str, asset: &str, subset: &str) -> PathBuf {
    root.join(project).join(asset).join("publish").join(subset)
}

fn store_err(err: anyhow::Error) -> PublishError {
    PublishError::from_anyhow(ErrorKind::Integration, &err)
}

pub struct VersionIntegrator {
    store: Arc<dyn VersionStore>,
}

impl VersionIntegrator {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    /// Project and asset an instance integrates under.
    fn location<'a>(
        instance: &'a InstanceRecord,
        context: &'a SessionContext,
    ) -> PublishResult<(&'a str, &'a str)> {
        let project = context.project.as_deref().ok_or_else(|| {
            PublishError::integration("session has no project to integrate into")
        })?;
        let asset = instance
            .asset()
            .or(context.asset.as_deref())
            .ok_or_else(|| {
                PublishError::integration(format!("'{}' has no asset", instance.name))
            })?;
        Ok((project, asset))
    }

    async fn find_or_insert(
        &self,
        doc_type: DocType,
        parent: Option<&str>,
        name: &str,
        data: Map<String, Value>,
    ) -> PublishResult<String> {
        let mut filter = DocFilter::of(doc_type).name(name);
        if let Some(parent) = parent {
            filter = filter.id_parent(parent);
        }
        if let Some(doc) = self.store.find_one(&filter).await.map_err(store_err)? {
            return Ok(doc.id);
        }
        self.store
            .insert_one(Document::new(doc_type, parent, name, data))
            .await
            .map_err(store_err)
    }

    async fn find_subset(&self, project: &str, asset: &str, subset: &str) -> PublishResult<Option<String>> {
        let Some(project_doc) = self
            .store
            .find_one(&DocFilter::of(DocType::Project).name(project))
            .await
            .map_err(store_err)?
        else {
            return Ok(None);
        };
        let Some(asset_doc) = self
            .store
            .find_one(&DocFilter::of(DocType::Asset).id_parent(&project_doc.id).name(asset))
            .await
            .map_err(store_err)?
        else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_one(&DocFilter::of(DocType::Subset).id_parent(&asset_doc.id).name(subset))
            .await
            .map_err(store_err)?
            .map(|d| d.id))
    }

    async fn version_for_instance(&self, instance_id: &str) -> PublishResult<Option<IntegratedVersion>> {
        let Some(doc) = self
            .store
            .find_one(&DocFilter::of(DocType::Version).data_eq("instanceId", json!(instance_id)))
            .await
            .map_err(store_err)?
        else {
            return Ok(None);
        };
        let representations = self
            .store
            .find(&DocFilter::of(DocType::Representation).id_parent(&doc.id))
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|d| d.name)
            .collect();
        Ok(Some(IntegratedVersion {
            instance_id: instance_id.to_string(),
            subset_id: doc.parent.clone().unwrap_or_default(),
            version: doc.data.get("version").and_then(Value::as_u64).unwrap_or(0) as u32,
            pending: doc.data.get("pending").and_then(Value::as_bool).unwrap_or(false),
            version_id: doc.id,
            name: doc.name,
            representations,
        }))
    }

    async fn insert_documents(
        &self,
        instance: &InstanceRecord,
        context: &SessionContext,
        version: u32,
    ) -> PublishResult<IntegratedVersion> {
        let (project, asset) = Self::location(instance, context)?;
        let version_dir = instance.version_dir().unwrap_or_default();

        let project_id = self
            .find_or_insert(DocType::Project, None, project, Map::new())
            .await?;
        let asset_id = self
            .find_or_insert(DocType::Asset, Some(&project_id), asset, Map::new())
            .await?;
        let mut subset_data = Map::new();
        subset_data.insert("family".into(), json!(instance.family));
        let subset_id = self
            .find_or_insert(DocType::Subset, Some(&asset_id), instance.subset(), subset_data)
            .await?;

        let name = version_name(version);
        let taken = self
            .store
            .find_one(&DocFilter::of(DocType::Version).id_parent(&subset_id).name(&name))
            .await
            .map_err(store_err)?;
        if taken.is_some() {
            return Err(PublishError::integration(format!(
                "{} of {}/{}/{} already exists",
                name,
                project,
                asset,
                instance.subset()
            )));
        }

        let mut families = vec![instance.family.clone()];
        families.extend(instance.families.iter().cloned());
        let dependencies: Map<String, Value> = instance
            .dependencies
            .iter()
            .chain(instance.future_dependencies.iter())
            .map(|(id, d)| {
                (
                    id.clone(),
                    json!({ "family": d.family, "subset": d.subset, "version": d.version }),
                )
            })
            .collect();

        let mut data = Map::new();
        data.insert("version".into(), json!(version));
        data.insert("instanceId".into(), json!(instance.id));
        data.insert("families".into(), json!(families));
        data.insert(
            "source".into(),
            json!(context
                .source_file
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())),
        );
        data.insert("author".into(), json!(context.user));
        data.insert("time".into(), json!(chrono::Utc::now().to_rfc3339()));
        data.insert("comment".into(), json!(context.comment));
        data.insert("dependencies".into(), Value::Object(dependencies));
        data.insert("pending".into(), json!(true));

        let version_id = self
            .store
            .insert_one(Document::new(DocType::Version, Some(&subset_id), &name, data))
            .await
            .map_err(|e| {
                PublishError::integration(format!("failed to commit {}: {:#}", name, e))
            })?;

        let mut representations = Vec::new();
        for repr in instance.pending_extractors.keys() {
            let repr_dir = version_dir.join(repr);
            let files: Vec<String> = instance
                .filepaths()
                .into_iter()
                .filter(|f| Path::new(f).starts_with(&repr_dir))
                .collect();
            let mut repr_data = Map::new();
            repr_data.insert("files".into(), json!(files));
            repr_data.insert("pending".into(), json!(true));
            self.store
                .insert_one(Document::new(
                    DocType::Representation,
                    Some(&version_id),
                    repr,
                    repr_data,
                ))
                .await
                .map_err(store_err)?;
            representations.push(repr.clone());
        }

        Ok(IntegratedVersion {
            instance_id: instance.id.clone(),
            subset_id,
            version_id,
            version,
            name,
            representations,
            pending: true,
        })
    }
}

/// Move staged outputs into `<version-dir>/<repr>` and create hardlinks.
/// Safe to run again after a partial run.
fn transfer_files(instance: &InstanceRecord, version_dir: &Path) -> anyhow::Result<()> {
    let stage_root = version_dir.join(".stage");
    for repr in instance.pending_extractors.keys() {
        let stage = stage_root.join(repr);
        let dest = version_dir.join(repr);
        std::fs::create_dir_all(&dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        if !stage.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&stage)? {
            let entry = entry?;
            if entry.file_name() == EXTRACTOR_DUMP_NAME {
                continue;
            }
            let target = dest.join(entry.file_name());
            std::fs::rename(entry.path(), &target).with_context(|| {
                format!("Failed to move {} to {}", entry.path().display(), target.display())
            })?;
        }
    }

    for (src, dst) in instance.hardlinks() {
        let dst = PathBuf::from(dst);
        if dst.exists() {
            continue;
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::hard_link(&src, &dst)
            .with_context(|| format!("Failed to hardlink {} to {}", src, dst.display()))?;
    }

    if stage_root.is_dir() {
        if let Err(e) = std::fs::remove_dir_all(&stage_root) {
            tracing::warn!(path = %stage_root.display(), "could not remove stage dir: {}", e);
        }
    }
    Ok(())
}

#[async_trait]
impl Integrates for VersionIntegrator {
    fn name(&self) -> &str {
        "IntegrateVersion"
    }

    async fn reserve_version(
        &self,
        instance: &InstanceRecord,
        context: &SessionContext,
    ) -> PublishResult<(u32, PathBuf)> {
        let (project, asset) = Self::location(instance, context)?;
        let subset = instance.subset();
        let latest = match self.find_subset(project, asset, subset).await? {
            Some(subset_id) => latest_version(self.store.as_ref(), &subset_id)
                .await
                .map_err(store_err)?
                .unwrap_or(0),
            None => 0,
        };

        // The version directory is the reservation: creating it is atomic,
        // and delegated publishes own theirs long before any document exists.
        let dir = subset_dir(&context.root, project, asset, subset);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))
            .map_err(store_err)?;
        let mut next = latest + 1;
        loop {
            let candidate = dir.join(version_name(next));
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok((next, candidate)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => next += 1,
                Err(e) => {
                    return Err(PublishError::integration(format!(
                        "cannot reserve {}: {}",
                        candidate.display(),
                        e
                    )))
                }
            }
        }
    }

    async fn already_integrated(&self, instance_id: &str) -> PublishResult<Option<IntegratedVersion>> {
        Ok(self
            .version_for_instance(instance_id)
            .await?
            .filter(|v| !v.pending))
    }

    async fn integrate(
        &self,
        instance: &InstanceRecord,
        context: &SessionContext,
    ) -> PublishResult<IntegratedVersion> {
        let (Some(version), Some(version_dir)) = (instance.version(), instance.version_dir()) else {
            return Err(PublishError::integration(format!(
                "'{}' has no reserved version",
                instance.name
            )));
        };
        if !instance.is_fully_extracted() {
            return Err(PublishError::integration(format!(
                "'{}' still has pending extractors: {}",
                instance.name,
                instance.undone_extractors().join(", ")
            )));
        }

        let mut integrated = match self.version_for_instance(&instance.id).await? {
            Some(existing) if !existing.pending => return Ok(existing),
            Some(existing) => {
                tracing::info!(instance = %instance.name, version = %existing.name, "completing pending version");
                existing
            }
            None => self.insert_documents(instance, context, version).await?,
        };

        transfer_files(instance, &version_dir).map_err(store_err)?;

        let mut done = Map::new();
        done.insert("pending".into(), json!(false));
        self.store
            .update_many(
                &DocFilter::of(DocType::Representation).id_parent(&integrated.version_id),
                &done,
            )
            .await
            .map_err(store_err)?;
        self.store
            .update_many(
                &DocFilter::of(DocType::Version).data_eq("instanceId", json!(instance.id)),
                &done,
            )
            .await
            .map_err(store_err)?;
        integrated.pending = false;

        tracing::info!(
            instance = %instance.name,
            subset = %instance.subset(),
            version = %integrated.name,
            "integrated"
        );
        Ok(integrated)
    }
}
