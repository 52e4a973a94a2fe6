//! Resume a delegated publish from its dump files.
//!
//! A resume run shares nothing with the process that delegated: the dumps
//! are the whole state. It re-enters the session at `Extracting`, runs only
//! the extractors not yet marked done, persists the flags, and integrates
//! when nothing is left pending. Running it again after success is a no-op.
//!
//! | Dump | `ExtractOnly` | `Full` |
//! |------|---------------|--------|
//! | `.instance.json` | extract that instance | extract, then integrate the session once no sibling is pending |
//! | `.context.<user>.<id>.json` | extract every instance | extract all, integrate all |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dump::{ContextDump, DumpSerializer, InstanceDump, INSTANCE_DUMP_NAME};
use crate::error::{ErrorKind, PublishError, PublishResult};
use crate::extractors::{run_extractor, run_pending_extractors};
use crate::instance::InstanceRecord;
use crate::integrate::IntegratedVersion;
use crate::publish::gate;
use crate::session::{Phase, PhaseResult, PublishSession, SessionContext, SessionState};
use crate::traits::{ExtractionJob, ExtractionOutput, ExtractorRegistry, Integrates};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    ExtractOnly,
    Full,
}

#[derive(Debug, Clone)]
pub struct ResumeReport {
    pub session_id: String,
    /// `instance/representation` pairs extracted by this run.
    pub extracted: Vec<String>,
    pub integrated: Vec<IntegratedVersion>,
    /// Instances an earlier run already integrated.
    pub skipped: Vec<String>,
    pub state: SessionState,
}

fn session_context(doc: &ContextDump, fallback_root: &Path) -> SessionContext {
    SessionContext {
        user: doc.by.clone(),
        source_file: Some(PathBuf::from(&doc.from)).filter(|p| !p.as_os_str().is_empty()),
        comment: doc.comment.clone(),
        project: doc.project.clone(),
        asset: doc.asset.clone(),
        root: doc
            .root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| fallback_root.to_path_buf()),
        data: Default::default(),
    }
}

/// Load an instance dump the context lists and check it holds that instance.
fn load_listed(dumps: &DumpSerializer, dump: &str, id: &str) -> PublishResult<InstanceDump> {
    let dump_path = Path::new(dump);
    let doc = dumps.load_instance(dump_path)?;
    if doc.id != id {
        return Err(PublishError::resume(format!(
            "{} holds instance {}, context lists {}",
            dump_path.display(),
            doc.id,
            id
        )));
    }
    Ok(doc)
}

pub struct RemoteResumeRunner {
    extractors: ExtractorRegistry,
    integrator: Arc<dyn Integrates>,
}

impl RemoteResumeRunner {
    pub fn new(integrator: Arc<dyn Integrates>) -> Self {
        Self {
            extractors: ExtractorRegistry::with_builtins(),
            integrator,
        }
    }

    pub fn with_extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    /// Resume from an instance dump or a context dump.
    pub async fn resume(&self, path: &Path, mode: ResumeMode) -> PublishResult<ResumeReport> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tracing::info!(dump = %path.display(), ?mode, "resume started");

        if file_name == INSTANCE_DUMP_NAME {
            self.resume_instance(path, mode).await
        } else if file_name.starts_with(".context.") {
            self.resume_context(path, mode).await
        } else {
            Err(PublishError::resume(format!(
                "{} is neither an instance dump nor a context dump",
                path.display()
            )))
        }
    }

    async fn resume_instance(&self, path: &Path, mode: ResumeMode) -> PublishResult<ResumeReport> {
        let dumps = DumpSerializer::new(path.parent().unwrap_or(Path::new(".")));
        let doc = dumps.load_instance(path)?;
        let context_path = doc.context_dump.as_ref().map(PathBuf::from).ok_or_else(|| {
            PublishError::resume(format!("{} has no context dump", path.display()))
        })?;
        let context = dumps.load_context(&context_path)?;

        let mut session =
            PublishSession::with_id(context.id.clone(), session_context(&context, dumps.root()));
        session.advance(SessionState::Extracting);

        let mut extracted = Vec::new();
        let record = self.extract_instance(&mut session, &dumps, path, doc, &mut extracted)?;
        let own_id = record.id.clone();
        session.add_instance(record);
        gate(&mut session, ErrorKind::Extraction)?;

        let mut report = ResumeReport {
            session_id: session.id.clone(),
            extracted,
            integrated: Vec::new(),
            skipped: Vec::new(),
            state: session.state,
        };
        if mode == ResumeMode::Full {
            // Siblings are read as dumped; their extraction belongs to their own jobs.
            for summary in context.instances.iter().filter(|s| s.id != own_id) {
                let sibling = load_listed(&dumps, &summary.dump, &summary.id)?;
                session.add_instance(sibling.into_record());
            }
            self.integrate_all(&mut session, &mut report).await?;
        }
        report.state = session.state;
        Ok(report)
    }

    async fn resume_context(&self, path: &Path, mode: ResumeMode) -> PublishResult<ResumeReport> {
        let dumps = DumpSerializer::new(path.parent().unwrap_or(Path::new(".")));
        let context = dumps.load_context(path)?;

        let mut session =
            PublishSession::with_id(context.id.clone(), session_context(&context, dumps.root()));
        session.advance(SessionState::Extracting);

        // Every dump loads before anything runs: a dump set is all or nothing.
        let mut docs = Vec::new();
        for summary in &context.instances {
            let doc = load_listed(&dumps, &summary.dump, &summary.id)?;
            docs.push((PathBuf::from(&summary.dump), doc));
        }

        let mut extracted = Vec::new();
        for (dump_path, doc) in docs {
            let record = self.extract_instance(&mut session, &dumps, &dump_path, doc, &mut extracted)?;
            session.add_instance(record);
        }
        gate(&mut session, ErrorKind::Extraction)?;

        let mut report = ResumeReport {
            session_id: session.id.clone(),
            extracted,
            integrated: Vec::new(),
            skipped: Vec::new(),
            state: session.state,
        };
        if mode == ResumeMode::Full {
            self.integrate_all(&mut session, &mut report).await?;
        }
        report.state = session.state;
        Ok(report)
    }

    /// Run the not-done extractors of one dumped instance and persist the
    /// updated done flags back into its dump.
    fn extract_instance(
        &self,
        session: &mut PublishSession,
        dumps: &DumpSerializer,
        dump_path: &Path,
        doc: InstanceDump,
        extracted: &mut Vec<String>,
    ) -> PublishResult<InstanceRecord> {
        let context_dump = doc.context_dump.clone().map(PathBuf::from);
        let mut record = doc.into_record();
        if record.is_fully_extracted() {
            return Ok(record);
        }

        let pending = record.undone_extractors();
        for result in run_pending_extractors(&mut record, &self.extractors) {
            session.record(result);
        }
        for repr in pending {
            if record.pending_extractors.get(&repr).is_some_and(|d| d.done) {
                extracted.push(format!("{}/{}", record.name, repr));
            }
        }

        let updated = InstanceDump::from_record(&record, context_dump.as_deref());
        dumps.overwrite_instance(dump_path, &updated)?;
        Ok(record)
    }

    /// Integrate every instance of the session, skipping ones an earlier
    /// run already committed.
    async fn integrate_all(
        &self,
        session: &mut PublishSession,
        report: &mut ResumeReport,
    ) -> PublishResult<()> {
        if let Some(pending) = session.instances.iter().find(|i| !i.is_fully_extracted()) {
            tracing::info!(
                instance = %pending.name,
                "extraction still pending, leaving integration to a later run"
            );
            return Ok(());
        }

        session.advance(SessionState::Integrating);
        let context = session.context.clone();
        for i in 0..session.instances.len() {
            gate(session, ErrorKind::Integration)?;
            let id = session.instances[i].id.clone();
            let name = session.instances[i].name.clone();

            let result = match self.integrator.already_integrated(&id).await {
                Ok(Some(version)) => {
                    tracing::info!(instance = %name, version = %version.name, "already integrated");
                    report.skipped.push(name);
                    Ok(())
                }
                Ok(None) => self
                    .integrator
                    .integrate(&session.instances[i], &context)
                    .await
                    .map(|version| report.integrated.push(version)),
                Err(e) => Err(e),
            };
            session.record(PhaseResult::from_result(
                Phase::Integrate,
                self.integrator.name(),
                Some(&id),
                result,
            ));
        }
        gate(session, ErrorKind::Integration)?;
        session.advance(SessionState::Done);
        Ok(())
    }

    /// Rerun one representation from its extractor dump. Done flags in the
    /// instance dump are left alone.
    pub fn run_extractor_dump(&self, stage_dir: &Path) -> PublishResult<ExtractionOutput> {
        let dumps = DumpSerializer::new(stage_dir);
        let doc = dumps.load_extractor(&DumpSerializer::extractor_dump_path(stage_dir))?;
        let job = ExtractionJob {
            instance_id: &doc.instance_id,
            representation: &doc.representation,
            stage_dir,
            args: &doc.args,
            kwargs: &doc.kwargs,
        };
        run_extractor(&self.extractors, &doc.func, &job).map_err(|e| {
            PublishError::extraction(format!("{} ({}): {:#}", doc.representation, doc.func, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrate::VersionIntegrator;
    use crate::store::memory::InMemoryStore;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    /// Writes the dumps a delegating publisher would for one instance.
    fn delegated(root: &Path) -> (PathBuf, PathBuf) {
        let mut session = PublishSession::new(SessionContext {
            user: "ana".into(),
            project: Some("show".into()),
            root: root.to_path_buf(),
            ..Default::default()
        });
        let mut inst = InstanceRecord::new("modelDefault", "model");
        inst.data.insert("asset".into(), json!("chair"));
        inst.set_version(1, &root.join("show/chair/publish/modelDefault/v001"));
        let mut kwargs = Map::new();
        kwargs.insert("filename".into(), json!("meta.json"));
        kwargs.insert("content".into(), json!({ "ok": true }));
        inst.mark_pending_extractor("Metadata", "Test", "write_json", vec![], kwargs);
        session.add_instance(inst.clone());

        let dumps = DumpSerializer::new(root);
        let ctx_path = dumps.context_dump_path("ana", &session.id);
        let (dump, _) = dumps.dump_instance(&inst, Some(&ctx_path)).unwrap();
        dumps.dump_extractor(&inst, "Metadata").unwrap();
        dumps
            .dump_context(&session, &[(inst.id.clone(), dump.clone())])
            .unwrap();
        (dump, ctx_path)
    }

    fn runner() -> RemoteResumeRunner {
        RemoteResumeRunner::new(Arc::new(VersionIntegrator::new(Arc::new(InMemoryStore::new()))))
    }

    #[tokio::test]
    async fn test_extract_only_flips_done_and_persists() {
        let tmp = TempDir::new().unwrap();
        let (dump, _) = delegated(tmp.path());
        let runner = runner();

        let report = runner.resume(&dump, ResumeMode::ExtractOnly).await.unwrap();
        assert_eq!(report.extracted, vec!["modelDefault/Metadata"]);
        assert_eq!(report.state, SessionState::Extracting);

        let persisted = DumpSerializer::new(tmp.path()).load_instance(&dump).unwrap();
        assert!(persisted.extractors["Metadata"].done);

        // Nothing left: a second extract-only run does no work.
        let again = runner.resume(&dump, ResumeMode::ExtractOnly).await.unwrap();
        assert!(again.extracted.is_empty());
    }

    #[tokio::test]
    async fn test_full_resume_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (_, context) = delegated(tmp.path());
        let runner = runner();

        let first = runner.resume(&context, ResumeMode::Full).await.unwrap();
        assert_eq!(first.state, SessionState::Done);
        assert_eq!(first.integrated.len(), 1);
        assert!(tmp
            .path()
            .join("show/chair/publish/modelDefault/v001/Metadata/meta.json")
            .is_file());

        let second = runner.resume(&context, ResumeMode::Full).await.unwrap();
        assert_eq!(second.state, SessionState::Done);
        assert!(second.integrated.is_empty());
        assert_eq!(second.skipped, vec!["modelDefault"]);
    }

    #[tokio::test]
    async fn test_missing_dump_is_resume_error() {
        let tmp = TempDir::new().unwrap();
        let err = runner()
            .resume(&tmp.path().join(".instance.json"), ResumeMode::Full)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resume);

        let err = runner()
            .resume(&tmp.path().join("notes.json"), ResumeMode::Full)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resume);
    }

    #[tokio::test]
    async fn test_run_extractor_dump() {
        let tmp = TempDir::new().unwrap();
        delegated(tmp.path());
        let stage = tmp.path().join("show/chair/publish/modelDefault/v001/.stage/Metadata");

        let out = runner().run_extractor_dump(&stage).unwrap();
        assert_eq!(out.files, vec!["meta.json"]);
        assert!(stage.join("meta.json").is_file());
    }
}
