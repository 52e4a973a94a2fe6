//! JSON dumps crossing the local → farm process boundary.
//!
//! Three documents, all UTF-8 JSON with a `schemaVersion` field:
//!
//! | Document | Path | Written by |
//! |----------|------|------------|
//! | Instance dump | `<version-dir>/.instance.json` | local publish; rewritten by resume |
//! | Extractor dump | `<stage-dir>/.extractor.json` | local publish |
//! | Context dump | `<root>/dumps/.context.<user>.<session-id>.json` | local publish |
//!
//! The context dump path is a pure function of the session id, so it is
//! computed first and injected into every instance dump; each file is then
//! written exactly once, in any order.
//!
//! Loading is all-or-nothing: a missing, unreadable, malformed or
//! schema-mismatched file is a [`ErrorKind::Resume`](crate::error::ErrorKind)
//! failure.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, PublishError, PublishResult};
use crate::ids::id_date_string;
use crate::instance::{DependencyDescriptor, ExtractorDescriptor, InstanceRecord};
use crate::session::PublishSession;

/// Current shape of every dump document.
pub const SCHEMA_VERSION: u32 = 1;

pub const INSTANCE_DUMP_NAME: &str = ".instance.json";
pub const EXTRACTOR_DUMP_NAME: &str = ".extractor.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDump {
    pub schema_version: u32,
    pub context_dump: Option<String>,
    pub id: String,
    pub name: String,
    pub family: String,
    #[serde(default)]
    pub families: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyDescriptor>,
    #[serde(default)]
    pub extractors: BTreeMap<String, ExtractorDescriptor>,
    pub filepaths: Vec<String>,
}

impl InstanceDump {
    pub fn from_record(record: &InstanceRecord, context_dump: Option<&Path>) -> Self {
        let mut dependencies = record.dependencies.clone();
        dependencies.extend(
            record
                .future_dependencies
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Self {
            schema_version: SCHEMA_VERSION,
            context_dump: context_dump.map(|p| p.to_string_lossy().to_string()),
            id: record.id.clone(),
            name: record.name.clone(),
            family: record.family.clone(),
            families: record.families.clone(),
            members: record.members.clone(),
            data: record.data.clone(),
            dependencies,
            extractors: record.pending_extractors.clone(),
            filepaths: record.filepaths(),
        }
    }

    /// Rebuild a record on the resuming side. In-session dependencies have
    /// been integrated or are being integrated alongside, so everything is
    /// restored as a plain dependency.
    pub fn into_record(self) -> InstanceRecord {
        InstanceRecord {
            id: self.id,
            name: self.name,
            family: self.family,
            families: self.families,
            members: self.members,
            data: self.data,
            dependencies: self.dependencies,
            future_dependencies: BTreeMap::new(),
            pending_extractors: self.extractors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorDump {
    pub schema_version: u32,
    pub instance_id: String,
    pub representation: String,
    pub class: String,
    pub func: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub asset: Option<String>,
    pub family: String,
    pub families: Vec<String>,
    pub version: Option<u32>,
    pub dump: String,
    pub child_instances: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextDump {
    pub schema_version: u32,
    /// Session id.
    pub id: String,
    pub by: String,
    pub from: String,
    pub date: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub project: Option<String>,
    /// Session-level asset for instances that do not carry their own.
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
    pub instances: Vec<InstanceSummary>,
}

/// Reads and writes dump documents under a publish root.
#[derive(Debug, Clone)]
pub struct DumpSerializer {
    root: PathBuf,
}

impl DumpSerializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dumps_dir(&self) -> PathBuf {
        self.root.join("dumps")
    }

    /// Deterministic context dump path for a session.
    pub fn context_dump_path(&self, user: &str, session_id: &str) -> PathBuf {
        self.dumps_dir()
            .join(format!(".context.{}.{}.json", sanitize(user), session_id))
    }

    pub fn instance_dump_path(version_dir: &Path) -> PathBuf {
        version_dir.join(INSTANCE_DUMP_NAME)
    }

    pub fn extractor_dump_path(stage_dir: &Path) -> PathBuf {
        stage_dir.join(EXTRACTOR_DUMP_NAME)
    }

    /// Write one instance's dump next to its reserved version directory.
    pub fn dump_instance(
        &self,
        record: &InstanceRecord,
        context_dump: Option<&Path>,
    ) -> PublishResult<(PathBuf, InstanceDump)> {
        let version_dir = record.version_dir().ok_or_else(|| {
            PublishError::internal(format!(
                "instance '{}' has no reserved version directory",
                record.name
            ))
        })?;
        let path = Self::instance_dump_path(&version_dir);
        let doc = InstanceDump::from_record(record, context_dump);
        write_new(&path, &doc).map_err(internal)?;
        tracing::debug!(instance = %record.name, path = %path.display(), "instance dump written");
        Ok((path, doc))
    }

    /// Persist extraction progress into an existing instance dump.
    pub fn overwrite_instance(&self, path: &Path, doc: &InstanceDump) -> PublishResult<()> {
        write_replace(path, doc).map_err(internal)
    }

    pub fn dump_extractor(
        &self,
        record: &InstanceRecord,
        repr_name: &str,
    ) -> PublishResult<(PathBuf, ExtractorDump)> {
        let desc = record.pending_extractors.get(repr_name).ok_or_else(|| {
            PublishError::internal(format!(
                "instance '{}' has no extractor for '{}'",
                record.name, repr_name
            ))
        })?;
        let stage_dir = record.stage_dir(repr_name).ok_or_else(|| {
            PublishError::internal(format!(
                "instance '{}' has no reserved version directory",
                record.name
            ))
        })?;
        let path = Self::extractor_dump_path(&stage_dir);
        let doc = ExtractorDump {
            schema_version: SCHEMA_VERSION,
            instance_id: record.id.clone(),
            representation: repr_name.to_string(),
            class: desc.class.clone(),
            func: desc.func.clone(),
            args: desc.args.clone(),
            kwargs: desc.kwargs.clone(),
        };
        write_new(&path, &doc).map_err(internal)?;
        Ok((path, doc))
    }

    /// Write the session's context dump listing the given instances and
    /// their dump paths.
    pub fn dump_context(
        &self,
        session: &PublishSession,
        dumped: &[(String, PathBuf)],
    ) -> PublishResult<(PathBuf, ContextDump)> {
        let path = self.context_dump_path(&session.context.user, &session.id);
        let mut instances = Vec::new();
        for (instance_id, dump_path) in dumped {
            let record = session.instance(instance_id).ok_or_else(|| {
                PublishError::internal(format!("unknown instance id in dump list: {}", instance_id))
            })?;
            let child_instances = session
                .instances
                .iter()
                .filter(|other| other.future_dependencies.contains_key(&record.id))
                .map(|other| other.id.clone())
                .collect();
            instances.push(InstanceSummary {
                id: record.id.clone(),
                name: record.name.clone(),
                asset: record.asset().map(str::to_string),
                family: record.family.clone(),
                families: record.families.clone(),
                version: record.version(),
                dump: dump_path.to_string_lossy().to_string(),
                child_instances,
            });
        }

        let doc = ContextDump {
            schema_version: SCHEMA_VERSION,
            id: session.id.clone(),
            by: session.context.user.clone(),
            from: session
                .context
                .source_file
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
            date: id_date_string(&session.id),
            comment: session.context.comment.clone(),
            project: session.context.project.clone(),
            asset: session.context.asset.clone(),
            root: Some(self.root.to_string_lossy().to_string()),
            instances,
        };
        write_new(&path, &doc).map_err(internal)?;
        tracing::info!(path = %path.display(), instances = doc.instances.len(), "context dump written");
        Ok((path, doc))
    }

    pub fn load_instance(&self, path: &Path) -> PublishResult<InstanceDump> {
        let doc: InstanceDump = load(path)?;
        check_schema(path, doc.schema_version)?;
        Ok(doc)
    }

    pub fn load_context(&self, path: &Path) -> PublishResult<ContextDump> {
        let doc: ContextDump = load(path)?;
        check_schema(path, doc.schema_version)?;
        Ok(doc)
    }

    pub fn load_extractor(&self, path: &Path) -> PublishResult<ExtractorDump> {
        let doc: ExtractorDump = load(path)?;
        check_schema(path, doc.schema_version)?;
        Ok(doc)
    }
}

fn internal(err: anyhow::Error) -> PublishError {
    PublishError::from_anyhow(ErrorKind::Internal, &err)
}

fn sanitize(user: &str) -> String {
    user.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn load<T: DeserializeOwned>(path: &Path) -> PublishResult<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PublishError::resume(format!("cannot read dump {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        PublishError::resume(format!("malformed dump {}: {}", path.display(), e))
    })
}

fn check_schema(path: &Path, found: u32) -> PublishResult<()> {
    if found != SCHEMA_VERSION {
        return Err(PublishError::resume(format!(
            "dump {} has schemaVersion {}, expected {}",
            path.display(),
            found,
            SCHEMA_VERSION
        )));
    }
    Ok(())
}

/// Create a new file, failing if one already exists at `path`.
fn write_new<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(doc)?;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Failed to create dump: {}", path.display()))?;
    file.write_all(&body)
        .with_context(|| format!("Failed to write dump: {}", path.display()))?;
    Ok(())
}

/// Replace `path` through a sibling temp file and a rename, so a reader
/// sees either the old document or the new one.
fn write_replace<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(doc)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.{}.tmp", file_name, std::process::id()));
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create temp dump: {}", tmp.display()))?;
        file.write_all(&body)
            .with_context(|| format!("Failed to write temp dump: {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to flush temp dump: {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rewrite dump: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionContext;
    use serde_json::json;
    use tempfile::TempDir;

    fn pointcache(root: &Path) -> InstanceRecord {
        let mut inst = InstanceRecord::new("pointcacheDefault", "pointcache");
        inst.data.insert("asset".to_string(), json!("hero"));
        inst.set_version(1, &root.join("hero/publish/pointcacheDefault/v001"));
        inst.mark_pending_extractor(
            "Alembic",
            "ExtractPointCache",
            "copy_files",
            vec![json!("/cache/hero.abc")],
            Map::new(),
        );
        inst.mark_pending_extractor(
            "FBXCache",
            "ExtractPointCache",
            "copy_files",
            vec![json!("/cache/hero.fbx")],
            Map::new(),
        );
        inst.register_file("/pub/hero.abc");
        inst.register_hardlink("/cache/tex.png", "/pub/tex.png");
        inst
    }

    #[test]
    fn test_instance_dump_round_trip() {
        let tmp = TempDir::new().unwrap();
        let dumper = DumpSerializer::new(tmp.path());
        let record = pointcache(tmp.path());
        let ctx_path = dumper.context_dump_path("ana", "session-1");

        let (path, written) = dumper.dump_instance(&record, Some(&ctx_path)).unwrap();
        assert!(path.ends_with(".instance.json"));
        assert_eq!(
            written.filepaths,
            vec!["/pub/hero.abc".to_string(), "/pub/tex.png".to_string()]
        );
        assert_eq!(
            written.context_dump.as_deref(),
            Some(ctx_path.to_string_lossy().as_ref())
        );

        let loaded = dumper.load_instance(&path).unwrap();
        assert_eq!(loaded, written);
        let rebuilt = loaded.into_record();
        assert_eq!(rebuilt.id, record.id);
        assert_eq!(rebuilt.pending_extractors, record.pending_extractors);
        assert_eq!(rebuilt.data, record.data);
    }

    #[test]
    fn test_dump_does_not_overwrite() {
        let tmp = TempDir::new().unwrap();
        let dumper = DumpSerializer::new(tmp.path());
        let record = pointcache(tmp.path());
        dumper.dump_instance(&record, None).unwrap();
        let err = dumper.dump_instance(&record, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn test_overwrite_instance_persists_progress() {
        let tmp = TempDir::new().unwrap();
        let dumper = DumpSerializer::new(tmp.path());
        let mut record = pointcache(tmp.path());
        let (path, _) = dumper.dump_instance(&record, None).unwrap();

        record.mark_extractor_done("Alembic");
        dumper
            .overwrite_instance(&path, &InstanceDump::from_record(&record, None))
            .unwrap();
        let loaded = dumper.load_instance(&path).unwrap();
        assert!(loaded.extractors["Alembic"].done);
        assert!(!loaded.extractors["FBXCache"].done);

        // The rewrite leaves no temp file behind in the version dir.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_overwrite_instance_keeps_old_document_when_rewrite_fails() {
        let tmp = TempDir::new().unwrap();
        let dumper = DumpSerializer::new(tmp.path());
        let record = pointcache(tmp.path());
        let (path, written) = dumper.dump_instance(&record, None).unwrap();

        // A directory squatting on the temp name makes the rewrite fail
        // before the rename.
        let squat = path.with_file_name(format!(".instance.json.{}.tmp", std::process::id()));
        std::fs::create_dir(&squat).unwrap();
        let mut done = record.clone();
        done.mark_extractor_done("Alembic");
        assert!(dumper
            .overwrite_instance(&path, &InstanceDump::from_record(&done, None))
            .is_err());

        assert_eq!(dumper.load_instance(&path).unwrap(), written);
    }

    #[test]
    fn test_extractor_dump_lands_in_stage_dir() {
        let tmp = TempDir::new().unwrap();
        let dumper = DumpSerializer::new(tmp.path());
        let record = pointcache(tmp.path());
        let (path, doc) = dumper.dump_extractor(&record, "Alembic").unwrap();
        assert_eq!(
            path,
            record.stage_dir("Alembic").unwrap().join(".extractor.json")
        );
        assert_eq!(doc.func, "copy_files");
        assert_eq!(dumper.load_extractor(&path).unwrap(), doc);
        assert!(dumper.dump_extractor(&record, "USD").is_err());
    }

    #[test]
    fn test_context_dump_lists_instances_and_children() {
        let tmp = TempDir::new().unwrap();
        let dumper = DumpSerializer::new(tmp.path());
        let mut session = PublishSession::new(SessionContext {
            user: "ana".to_string(),
            source_file: Some(PathBuf::from("/scenes/hero.ma")),
            project: Some("show".to_string()),
            asset: Some("hero".to_string()),
            ..Default::default()
        });
        let model = pointcache(tmp.path());
        let mut look = InstanceRecord::new("lookDefault", "lookdev");
        look.add_future_dependency(&model.id, DependencyDescriptor::new("model"));
        let model_id = model.id.clone();
        let look_id = look.id.clone();
        session.add_instance(model);
        session.add_instance(look);

        let (path, doc) = dumper
            .dump_context(&session, &[(model_id.clone(), PathBuf::from("/d/.instance.json"))])
            .unwrap();
        assert_eq!(path, dumper.context_dump_path("ana", &session.id));
        assert_eq!(doc.by, "ana");
        assert_eq!(doc.from, "/scenes/hero.ma");
        assert!(!doc.date.is_empty());
        assert_eq!(doc.instances.len(), 1);
        assert_eq!(doc.instances[0].child_instances, vec![look_id]);
        assert_eq!(doc.instances[0].asset.as_deref(), Some("hero"));
        assert_eq!(doc.project.as_deref(), Some("show"));
        assert_eq!(doc.asset.as_deref(), Some("hero"));

        assert_eq!(dumper.load_context(&path).unwrap(), doc);
    }

    #[test]
    fn test_load_failures_are_resume_errors() {
        let tmp = TempDir::new().unwrap();
        let dumper = DumpSerializer::new(tmp.path());

        let missing = dumper.load_instance(&tmp.path().join("nope.json")).unwrap_err();
        assert_eq!(missing.kind, ErrorKind::Resume);

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert_eq!(dumper.load_context(&bad).unwrap_err().kind, ErrorKind::Resume);

        let future = tmp.path().join("future.json");
        let mut doc = serde_json::to_value(InstanceDump::from_record(&pointcache(tmp.path()), None)).unwrap();
        doc["schemaVersion"] = json!(99);
        std::fs::write(&future, doc.to_string()).unwrap();
        let err = dumper.load_instance(&future).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resume);
        assert!(err.message.contains("schemaVersion 99"));
    }

    #[test]
    fn test_context_path_sanitizes_user() {
        let dumper = DumpSerializer::new("/pub");
        let path = dumper.context_dump_path("DOMAIN\\ana", "abc");
        assert_eq!(path, PathBuf::from("/pub/dumps/.context.DOMAIN_ana.abc.json"));
    }
}
