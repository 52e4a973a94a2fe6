//! Builtin phase plugins.
//!
//! A host application hands its publishable content to the core as a JSON
//! manifest:
//!
//! ```json
//! {
//!   "project": "show", "asset": "chair", "comment": "first pass",
//!   "source": "/work/chair_v012.ma",
//!   "instances": [{
//!     "name": "modelDefault", "family": "model",
//!     "members": ["|chair_GEO"],
//!     "meshes": [{ "id": "chairShape", "points": [[0,0,0]] }],
//!     "representations": [{ "name": "Alembic", "func": "copy_files", "args": ["/tmp/chair.abc"] }],
//!     "contractor": "farm",
//!     "upstream": []
//!   }]
//! }
//! ```
//!
//! Everything past collection reads only the resulting [`InstanceRecord`]s.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{PublishError, PublishResult};
use crate::fingerprint::{profile, FingerprintProfile, MeshContent};
use crate::instance::{DependencyDescriptor, DependencyStatus, InstanceRecord};
use crate::session::{PublishSession, SessionContext};
use crate::traits::{Collects, Extracts, Host, Validates};

/// Data key holding the fingerprint profile computed from `meshes`.
pub const MODEL_PROFILE_KEY: &str = "modelProfile";

pub const LOOKDEV_FAMILY: &str = "lookdev";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishManifest {
    pub project: Option<String>,
    pub asset: Option<String>,
    pub user: Option<String>,
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub instances: Vec<ManifestInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInstance {
    pub name: String,
    pub family: String,
    #[serde(default)]
    pub families: Vec<String>,
    pub asset: Option<String>,
    pub subset: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub contractor: Option<String>,
    #[serde(default)]
    pub meshes: Vec<MeshContent>,
    #[serde(default)]
    pub representations: Vec<RepresentationSpec>,
    /// Names of in-session instances this one depends on.
    #[serde(default)]
    pub upstream: Vec<String>,
    /// Already-published dependencies, keyed by upstream id.
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyDescriptor>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RepresentationSpec {
    pub name: String,
    pub func: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

pub fn load_manifest(path: &Path) -> PublishResult<PublishManifest> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PublishError::collection(format!("cannot read manifest {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        PublishError::collection(format!("malformed manifest {}: {}", path.display(), e))
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> PublishResult<Value> {
    serde_json::to_value(value).map_err(|e| PublishError::internal(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════
// Collectors
// ═══════════════════════════════════════════════════════════════════════

/// Reads a publish manifest into the session.
pub struct ManifestCollector {
    path: PathBuf,
}

impl ManifestCollector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Collects for ManifestCollector {
    fn name(&self) -> &str {
        "CollectManifest"
    }

    fn collect(&self, session: &mut PublishSession, host: &dyn Host) -> PublishResult<()> {
        let manifest = load_manifest(&self.path)?;
        apply_manifest(&mut session.context, &manifest, host);

        for entry in manifest.instances {
            let record = instance_from_manifest(entry, manifest.asset.as_deref())?;
            tracing::debug!(instance = %record.name, family = %record.family, "collected");
            session.add_instance(record);
        }
        Ok(())
    }
}

fn apply_manifest(context: &mut SessionContext, manifest: &PublishManifest, host: &dyn Host) {
    if manifest.project.is_some() {
        context.project = manifest.project.clone();
    }
    if manifest.asset.is_some() {
        context.asset = manifest.asset.clone();
    }
    if let Some(user) = &manifest.user {
        context.user = user.clone();
    }
    if context.comment.is_empty() {
        context.comment = manifest.comment.clone();
    }
    context.source_file = manifest.source.clone().or_else(|| host.current_file());
    for (k, v) in &manifest.data {
        context.data.insert(k.clone(), v.clone());
    }
}

fn instance_from_manifest(
    entry: ManifestInstance,
    default_asset: Option<&str>,
) -> PublishResult<InstanceRecord> {
    let mut record = InstanceRecord::new(entry.name, entry.family);
    record.families = entry.families;
    record.members = entry.members;
    record.data = entry.data;

    if let Some(asset) = entry.asset.as_deref().or(default_asset) {
        record.data.insert("asset".into(), Value::from(asset));
    }
    if let Some(subset) = entry.subset {
        record.data.insert("subset".into(), Value::from(subset));
    }
    if let Some(contractor) = entry.contractor {
        record
            .data
            .insert("publishContractor".into(), Value::from(contractor));
    }
    if !entry.meshes.is_empty() {
        record.data.insert("meshes".into(), to_value(&entry.meshes)?);
    }
    if !entry.representations.is_empty() {
        record
            .data
            .insert("representations".into(), to_value(&entry.representations)?);
    }
    if !entry.upstream.is_empty() {
        record.data.insert("upstream".into(), to_value(&entry.upstream)?);
    }
    for (upstream_id, descriptor) in entry.dependencies {
        record.add_dependency(&upstream_id, descriptor);
    }
    Ok(record)
}

/// Stored fingerprint profile of an instance, if one was computed.
pub fn model_profile(record: &InstanceRecord) -> Option<FingerprintProfile> {
    record
        .data
        .get(MODEL_PROFILE_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Fingerprints `data.meshes` into `data.modelProfile`.
pub struct FingerprintCollector;

impl Collects for FingerprintCollector {
    fn name(&self) -> &str {
        "CollectFingerprint"
    }

    fn collect(&self, session: &mut PublishSession, _host: &dyn Host) -> PublishResult<()> {
        for record in session.instances.iter_mut() {
            let Some(meshes) = record.data.get("meshes") else {
                continue;
            };
            let meshes: Vec<MeshContent> = serde_json::from_value(meshes.clone()).map_err(|e| {
                PublishError::collection(format!("{}: bad mesh content: {}", record.name, e))
            })?;
            let fingerprint = profile(&meshes)
                .map_err(|e| PublishError::collection(format!("{}: {}", record.name, e)))?;
            record
                .data
                .insert(MODEL_PROFILE_KEY.into(), to_value(&fingerprint)?);
        }
        Ok(())
    }
}

/// Resolves `data.upstream` names into future dependencies carrying the
/// upstream instance's current profile.
pub struct DependencyCollector;

impl Collects for DependencyCollector {
    fn name(&self) -> &str {
        "CollectDependencies"
    }

    fn collect(&self, session: &mut PublishSession, _host: &dyn Host) -> PublishResult<()> {
        let mut resolved = Vec::new();
        for record in &session.instances {
            let Some(names) = record.data.get("upstream").and_then(Value::as_array) else {
                continue;
            };
            for name in names.iter().filter_map(Value::as_str) {
                let upstream = session.instance_by_name(name).ok_or_else(|| {
                    PublishError::collection(format!(
                        "{}: upstream instance '{}' is not in this session",
                        record.name, name
                    ))
                })?;
                if upstream.id == record.id {
                    return Err(PublishError::collection(format!(
                        "{}: an instance cannot depend on itself",
                        record.name
                    )));
                }
                let descriptor = DependencyDescriptor::new(upstream.family.clone())
                    .with_subset(upstream.subset())
                    .with_profile(model_profile(upstream).unwrap_or_default());
                resolved.push((record.id.clone(), upstream.id.clone(), descriptor));
            }
        }

        for (id, upstream_id, descriptor) in resolved {
            if let Some(record) = session.instance_mut(&id) {
                record.add_future_dependency(&upstream_id, descriptor);
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Validators
// ═══════════════════════════════════════════════════════════════════════

pub struct MembersValidator;

impl Validates for MembersValidator {
    fn name(&self) -> &str {
        "ValidateMembers"
    }

    fn validate(&self, instance: &InstanceRecord, _session: &PublishSession) -> PublishResult<()> {
        if instance.members.is_empty() {
            return Err(PublishError::validation(format!(
                "'{}' has no members",
                instance.name
            )));
        }
        Ok(())
    }
}

/// Integration needs a project and an asset for every instance.
pub struct ContextValidator;

impl Validates for ContextValidator {
    fn name(&self) -> &str {
        "ValidateContext"
    }

    fn validate(&self, instance: &InstanceRecord, session: &PublishSession) -> PublishResult<()> {
        if session.context.project.is_none() {
            return Err(PublishError::validation("no project set for this publish"));
        }
        if instance.asset().or(session.context.asset.as_deref()).is_none() {
            return Err(PublishError::validation(format!(
                "'{}' has no asset",
                instance.name
            )));
        }
        Ok(())
    }
}

/// A lookdev instance needs a model whose fingerprint is known, and a
/// published model dependency must still match the model in the scene.
pub struct LookDevDependencyValidator;

impl Validates for LookDevDependencyValidator {
    fn name(&self) -> &str {
        "ValidateLookDevDependency"
    }

    fn applies_to(&self, instance: &InstanceRecord) -> bool {
        instance.has_family(LOOKDEV_FAMILY)
    }

    fn validate(&self, instance: &InstanceRecord, session: &PublishSession) -> PublishResult<()> {
        if !instance.has_resolvable_model_dependency() {
            return Err(PublishError::validation(format!(
                "'{}' has no resolvable model dependency; publish or collect the model first",
                instance.name
            )));
        }

        for (upstream_id, dep) in &instance.dependencies {
            if dep.family != "model" || !dep.is_resolvable() {
                continue;
            }
            let Some(subset) = dep.subset.as_deref() else {
                continue;
            };
            let current = session
                .instances
                .iter()
                .filter(|i| i.has_family("model") && i.subset() == subset)
                .find_map(model_profile);
            let Some(current) = current else {
                continue;
            };

            match dep.classify(&current) {
                DependencyStatus::Unchanged => {}
                DependencyStatus::Modified => tracing::warn!(
                    instance = %instance.name,
                    upstream = %upstream_id,
                    "model '{}' changed since the dependency was recorded",
                    subset
                ),
                DependencyStatus::Missing => {
                    return Err(PublishError::validation(format!(
                        "'{}': model '{}' lost geometry the look depends on",
                        instance.name, subset
                    )))
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extract plugins
// ═══════════════════════════════════════════════════════════════════════

/// Schedules one pending extractor per `data.representations` entry.
pub struct RepresentationExtract;

impl Extracts for RepresentationExtract {
    fn name(&self) -> &str {
        "ExtractRepresentations"
    }

    fn applies_to(&self, instance: &InstanceRecord) -> bool {
        instance.data.contains_key("representations")
    }

    fn process(&self, instance: &mut InstanceRecord, _context: &SessionContext) -> PublishResult<()> {
        let specs: Vec<RepresentationSpec> = instance
            .data
            .get("representations")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                PublishError::extraction(format!("{}: bad representations: {}", instance.name, e))
            })?
            .unwrap_or_default();

        for spec in specs {
            if spec.name.is_empty() || spec.name.starts_with('.') || spec.name.contains('/') {
                return Err(PublishError::extraction(format!(
                    "{}: invalid representation name '{}'",
                    instance.name, spec.name
                )));
            }
            instance.mark_pending_extractor(&spec.name, self.name(), &spec.func, spec.args, spec.kwargs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StandaloneHost;
    use serde_json::json;
    use tempfile::TempDir;

    fn mesh(id: &str, x: f64) -> Value {
        json!({ "id": id, "points": [[x, 0.0, 0.0], [0.0, 1.0, 0.0]] })
    }

    fn collect(manifest: Value) -> PublishResult<PublishSession> {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");
        std::fs::write(&path, manifest.to_string()).unwrap();

        let host = StandaloneHost::new(None, None);
        let mut session = PublishSession::new(SessionContext::default());
        ManifestCollector::new(&path).collect(&mut session, &host)?;
        FingerprintCollector.collect(&mut session, &host)?;
        DependencyCollector.collect(&mut session, &host)?;
        Ok(session)
    }

    #[test]
    fn test_manifest_populates_context_and_instances() {
        let session = collect(json!({
            "project": "show",
            "asset": "chair",
            "comment": "blocking",
            "source": "/work/chair.ma",
            "instances": [
                { "name": "modelDefault", "family": "model", "members": ["|chair_GEO"], "contractor": "farm" }
            ]
        }))
        .unwrap();

        assert_eq!(session.context.project.as_deref(), Some("show"));
        assert_eq!(session.context.comment, "blocking");
        assert_eq!(session.context.source_file, Some(PathBuf::from("/work/chair.ma")));
        let inst = &session.instances[0];
        assert_eq!(inst.asset(), Some("chair"));
        assert_eq!(inst.subset(), "modelDefault");
        assert_eq!(inst.contractor(), Some("farm"));
    }

    #[test]
    fn test_upstream_becomes_future_dependency_with_profile() {
        let session = collect(json!({
            "asset": "chair",
            "instances": [
                { "name": "modelDefault", "family": "model", "members": ["|geo"], "meshes": [mesh("chairShape", 1.0)] },
                { "name": "lookDefault", "family": "lookdev", "members": ["|shd"], "upstream": ["modelDefault"] }
            ]
        }))
        .unwrap();

        let model = session.instance_by_name("modelDefault").unwrap();
        let look = session.instance_by_name("lookDefault").unwrap();
        let dep = look.future_dependencies.get(&model.id).unwrap();
        assert_eq!(dep.family, "model");
        assert!(dep.profile.contains_key("chairShape"));
        assert!(look.has_resolvable_model_dependency());

        assert!(LookDevDependencyValidator.validate(look, &session).is_ok());
    }

    #[test]
    fn test_unknown_upstream_is_collection_error() {
        let err = collect(json!({
            "instances": [{ "name": "lookDefault", "family": "lookdev", "upstream": ["ghost"] }]
        }))
        .err()
        .unwrap();
        assert_eq!(err.kind, crate::error::ErrorKind::Collection);
    }

    #[test]
    fn test_lookdev_without_model_fails_validation() {
        let session = collect(json!({
            "instances": [{ "name": "lookDefault", "family": "lookdev", "members": ["|shd"] }]
        }))
        .unwrap();
        let look = &session.instances[0];
        assert!(LookDevDependencyValidator.applies_to(look));
        let err = LookDevDependencyValidator.validate(look, &session).unwrap_err();
        assert!(err.message.contains("no resolvable model dependency"));
    }

    #[test]
    fn test_lookdev_detects_missing_geometry() {
        let recorded: FingerprintProfile = serde_json::from_value(json!({
            "chairShape": { "points": "aa" },
            "legShape": { "points": "bb" }
        }))
        .unwrap();
        let session = collect(json!({
            "instances": [
                { "name": "modelDefault", "family": "model", "members": ["|geo"], "meshes": [mesh("chairShape", 1.0)] },
                { "name": "lookDefault", "family": "lookdev", "members": ["|shd"],
                  "dependencies": { "published-model": { "family": "model", "subset": "modelDefault", "profile": recorded } } }
            ]
        }))
        .unwrap();
        let look = session.instance_by_name("lookDefault").unwrap();
        let err = LookDevDependencyValidator.validate(look, &session).unwrap_err();
        assert!(err.message.contains("lost geometry"));
    }

    #[test]
    fn test_context_validator_requires_project() {
        let session = collect(json!({
            "asset": "chair",
            "instances": [{ "name": "modelDefault", "family": "model", "members": ["|geo"] }]
        }))
        .unwrap();
        let err = ContextValidator
            .validate(&session.instances[0], &session)
            .unwrap_err();
        assert!(err.message.contains("no project"));
    }

    #[test]
    fn test_members_validator() {
        let session = PublishSession::new(SessionContext::default());
        let empty = InstanceRecord::new("modelDefault", "model");
        assert!(MembersValidator.validate(&empty, &session).is_err());
    }

    #[test]
    fn test_representation_extract_marks_pending() {
        let mut inst = InstanceRecord::new("pointcacheDefault", "pointcache");
        inst.data.insert(
            "representations".into(),
            json!([
                { "name": "Alembic", "func": "copy_files", "args": ["/tmp/a.abc"] },
                { "name": "FBXCache", "func": "copy_files", "kwargs": { "hardlink": true } }
            ]),
        );
        RepresentationExtract
            .process(&mut inst, &SessionContext::default())
            .unwrap();
        assert_eq!(inst.undone_extractors(), vec!["Alembic", "FBXCache"]);
        assert_eq!(inst.pending_extractors["Alembic"].class, "ExtractRepresentations");
    }
}
