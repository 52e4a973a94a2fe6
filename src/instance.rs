//! Publishable instances and their dependency descriptors.
//!
//! An [`InstanceRecord`] is created during collection, annotated during
//! validation, gains pending extractors during extraction and is committed
//! to the versioned store by integration. Its `data` bag is open: well-known
//! keys are exposed through accessors below.
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `asset` / `subset` | Where the version is integrated |
//! | `version` / `versionDir` | Reserved version number and its directory |
//! | `publishContractor` | Delegation target name; extractors run remotely |
//! | `files` | Output files (final paths) registered by extractors |
//! | `hardlinks` | `[{src, dst}]` hardlinks registered by extractors |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::fingerprint::FingerprintProfile;
use crate::ids::new_id;

/// A deferred extraction step for one representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorDescriptor {
    /// Plugin that scheduled the step.
    pub class: String,
    /// Registered extractor callable name.
    pub func: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub done: bool,
}

/// Relationship between a dependency's recorded profile and the upstream's
/// current content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStatus {
    Unchanged,
    /// Every recorded sub-entity still exists but some content changed.
    Modified,
    /// At least one recorded sub-entity vanished upstream.
    Missing,
}

/// What an instance knows about one upstream entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyDescriptor {
    pub family: String,
    #[serde(default)]
    pub subset: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
    /// Fingerprint per upstream sub-entity id.
    #[serde(default)]
    pub profile: FingerprintProfile,
}

impl DependencyDescriptor {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            ..Default::default()
        }
    }

    pub fn with_profile(mut self, profile: FingerprintProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_subset(mut self, subset: impl Into<String>) -> Self {
        self.subset = Some(subset.into());
        self
    }

    /// A dependency is resolvable once its fingerprint profile is known.
    pub fn is_resolvable(&self) -> bool {
        !self.profile.is_empty()
    }

    /// Compare the recorded profile with the upstream's current one.
    pub fn classify(&self, current: &FingerprintProfile) -> DependencyStatus {
        let mut modified = false;
        for (entity, recorded) in &self.profile {
            match current.get(entity) {
                None => return DependencyStatus::Missing,
                Some(now) if now != recorded => modified = true,
                Some(_) => {}
            }
        }
        if modified {
            DependencyStatus::Modified
        } else {
            DependencyStatus::Unchanged
        }
    }
}

/// One publishable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub family: String,
    #[serde(default)]
    pub families: Vec<String>,
    /// Opaque host-scene references.
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Upstream entities already published, keyed by upstream id.
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyDescriptor>,
    /// Upstream instances published in the same session, keyed by instance id.
    #[serde(default)]
    pub future_dependencies: BTreeMap<String, DependencyDescriptor>,
    /// Representation name → extractor descriptor, executed in name order.
    #[serde(default)]
    pub pending_extractors: BTreeMap<String, ExtractorDescriptor>,
}

impl InstanceRecord {
    pub fn new(name: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            family: family.into(),
            families: Vec::new(),
            members: Vec::new(),
            data: Map::new(),
            dependencies: BTreeMap::new(),
            future_dependencies: BTreeMap::new(),
            pending_extractors: BTreeMap::new(),
        }
    }

    /// True when `family` is the primary family or one of the secondary ones.
    pub fn has_family(&self, family: &str) -> bool {
        self.family == family || self.families.iter().any(|f| f == family)
    }

    pub fn mark_pending_extractor(
        &mut self,
        repr_name: &str,
        class: &str,
        callable_ref: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) {
        self.pending_extractors.insert(
            repr_name.to_string(),
            ExtractorDescriptor {
                class: class.to_string(),
                func: callable_ref.to_string(),
                args,
                kwargs,
                done: false,
            },
        );
    }

    /// Flip a representation's extractor to done. Returns `false` when no
    /// extractor is registered under that name.
    pub fn mark_extractor_done(&mut self, repr_name: &str) -> bool {
        match self.pending_extractors.get_mut(repr_name) {
            Some(desc) => {
                desc.done = true;
                true
            }
            None => false,
        }
    }

    /// Every registered extractor is done. Vacuously true with none.
    pub fn is_fully_extracted(&self) -> bool {
        self.pending_extractors.values().all(|d| d.done)
    }

    /// Names of the representations still waiting for extraction.
    pub fn undone_extractors(&self) -> Vec<String> {
        self.pending_extractors
            .iter()
            .filter(|(_, d)| !d.done)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn add_dependency(&mut self, upstream_id: &str, descriptor: DependencyDescriptor) {
        self.dependencies.insert(upstream_id.to_string(), descriptor);
    }

    pub fn add_future_dependency(&mut self, upstream_id: &str, descriptor: DependencyDescriptor) {
        self.future_dependencies
            .insert(upstream_id.to_string(), descriptor);
    }

    /// At least one model dependency (published or in-session) has a
    /// retrievable fingerprint profile.
    pub fn has_resolvable_model_dependency(&self) -> bool {
        self.dependencies
            .values()
            .chain(self.future_dependencies.values())
            .any(|d| d.family == "model" && d.is_resolvable())
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn asset(&self) -> Option<&str> {
        self.data_str("asset")
    }

    /// Subset name, defaulting to the instance name.
    pub fn subset(&self) -> &str {
        self.data_str("subset").unwrap_or(&self.name)
    }

    pub fn version(&self) -> Option<u32> {
        self.data
            .get("version")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
    }

    pub fn version_dir(&self) -> Option<PathBuf> {
        self.data_str("versionDir").map(PathBuf::from)
    }

    pub fn set_version(&mut self, version: u32, version_dir: &Path) {
        self.data.insert("version".to_string(), Value::from(version));
        self.data.insert(
            "versionDir".to_string(),
            Value::from(version_dir.to_string_lossy().to_string()),
        );
    }

    /// Delegation target, if this instance's extraction runs elsewhere.
    pub fn contractor(&self) -> Option<&str> {
        self.data_str("publishContractor").filter(|s| !s.is_empty())
    }

    /// Staging directory of one representation.
    pub fn stage_dir(&self, repr_name: &str) -> Option<PathBuf> {
        self.version_dir()
            .map(|dir| dir.join(".stage").join(repr_name))
    }

    pub fn files(&self) -> Vec<String> {
        string_list(self.data.get("files"))
    }

    /// Registered `(src, dst)` hardlink pairs.
    pub fn hardlinks(&self) -> Vec<(String, String)> {
        self.data
            .get("hardlinks")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let src = item.get("src")?.as_str()?;
                        let dst = item.get("dst")?.as_str()?;
                        Some((src.to_string(), dst.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn register_file(&mut self, path: &str) {
        push_unique(&mut self.data, "files", Value::from(path));
    }

    pub fn register_hardlink(&mut self, src: &str, dst: &str) {
        push_unique(
            &mut self.data,
            "hardlinks",
            serde_json::json!({ "src": src, "dst": dst }),
        );
    }

    /// Union of registered files and hardlink destinations, in registration
    /// order without duplicates.
    pub fn filepaths(&self) -> Vec<String> {
        let mut out = self.files();
        for (_, dst) in self.hardlinks() {
            if !out.contains(&dst) {
                out.push(dst);
            }
        }
        out
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn push_unique(data: &mut Map<String, Value>, key: &str, value: Value) {
    let entry = data
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    if let Value::Array(items) = entry {
        if !items.contains(&value) {
            items.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(entries: &[(&str, &str)]) -> FingerprintProfile {
        entries
            .iter()
            .map(|(id, hash)| {
                let mut aspects = BTreeMap::new();
                aspects.insert("points".to_string(), hash.to_string());
                (id.to_string(), aspects)
            })
            .collect()
    }

    #[test]
    fn test_new_instance_is_vacuously_extracted() {
        let inst = InstanceRecord::new("modelDefault", "model");
        assert!(inst.pending_extractors.is_empty());
        assert!(inst.is_fully_extracted());
    }

    #[test]
    fn test_fully_extracted_iff_all_done() {
        let mut inst = InstanceRecord::new("pointcacheDefault", "pointcache");
        inst.mark_pending_extractor("Alembic", "ExtractCache", "copy_files", vec![], Map::new());
        inst.mark_pending_extractor("FBXCache", "ExtractCache", "copy_files", vec![], Map::new());
        assert!(!inst.is_fully_extracted());
        assert_eq!(inst.undone_extractors(), vec!["Alembic", "FBXCache"]);

        assert!(inst.mark_extractor_done("Alembic"));
        assert!(!inst.is_fully_extracted());
        assert!(inst.mark_extractor_done("FBXCache"));
        assert!(inst.is_fully_extracted());
        assert!(!inst.mark_extractor_done("USD"));
    }

    #[test]
    fn test_classify_dependency() {
        let dep = DependencyDescriptor::new("model")
            .with_profile(profile(&[("body", "aa"), ("head", "bb")]));
        assert_eq!(
            dep.classify(&profile(&[("body", "aa"), ("head", "bb")])),
            DependencyStatus::Unchanged
        );
        assert_eq!(
            dep.classify(&profile(&[("body", "aa"), ("head", "cc"), ("tail", "dd")])),
            DependencyStatus::Modified
        );
        assert_eq!(
            dep.classify(&profile(&[("body", "aa")])),
            DependencyStatus::Missing
        );
    }

    #[test]
    fn test_resolvable_model_dependency() {
        let mut look = InstanceRecord::new("lookDefault", "lookdev");
        assert!(!look.has_resolvable_model_dependency());

        look.add_dependency("rig-1", DependencyDescriptor::new("rig").with_profile(profile(&[("a", "1")])));
        look.add_dependency("model-1", DependencyDescriptor::new("model"));
        assert!(!look.has_resolvable_model_dependency());

        look.add_future_dependency(
            "model-2",
            DependencyDescriptor::new("model").with_profile(profile(&[("body", "aa")])),
        );
        assert!(look.has_resolvable_model_dependency());
    }

    #[test]
    fn test_filepaths_union_of_files_and_hardlinks() {
        let mut inst = InstanceRecord::new("pointcacheDefault", "pointcache");
        inst.register_file("/pub/v001/Alembic/cache.abc");
        inst.register_file("/pub/v001/Alembic/cache.abc");
        inst.register_hardlink("/cache/tex.png", "/pub/v001/Textures/tex.png");
        inst.register_hardlink("/cache/cache.abc", "/pub/v001/Alembic/cache.abc");

        assert_eq!(inst.files().len(), 1);
        assert_eq!(
            inst.filepaths(),
            vec![
                "/pub/v001/Alembic/cache.abc".to_string(),
                "/pub/v001/Textures/tex.png".to_string(),
            ]
        );
    }

    #[test]
    fn test_data_accessors() {
        let mut inst = InstanceRecord::new("modelDefault", "model");
        inst.families.push("geometry".to_string());
        assert!(inst.has_family("geometry"));
        assert_eq!(inst.subset(), "modelDefault");
        assert!(inst.contractor().is_none());

        inst.data
            .insert("publishContractor".to_string(), Value::from(""));
        assert!(inst.contractor().is_none());
        inst.data
            .insert("publishContractor".to_string(), Value::from("farm"));
        assert_eq!(inst.contractor(), Some("farm"));

        inst.set_version(3, Path::new("/pub/hero/modelDefault/v003"));
        assert_eq!(inst.version(), Some(3));
        assert_eq!(
            inst.stage_dir("Alembic").unwrap(),
            PathBuf::from("/pub/hero/modelDefault/v003/.stage/Alembic")
        );
    }
}
