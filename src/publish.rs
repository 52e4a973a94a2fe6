//! Local publish orchestration.
//!
//! [`Publisher::run`] drives one [`PublishSession`] through
//! collect → validate → extract and then either integrates locally or, when
//! any instance names a contractor, dumps the whole session to shared
//! storage and hands it to the contractors (dump-and-suspend).
//!
//! Every phase records one result per plugin (and instance), keeps running
//! sibling plugins after a failure, and stops at the phase boundary if
//! anything failed. The same check runs again before each irreversible
//! step of delegation.

use std::path::PathBuf;
use std::sync::Arc;

use crate::dump::DumpSerializer;
use crate::error::{ErrorKind, PublishError, PublishResult};
use crate::extractors::run_pending_extractors;
use crate::integrate::IntegratedVersion;
use crate::session::{Phase, PhaseResult, PublishSession, SessionState};
use crate::traits::{
    ContractorRegistry, DelegatedInstance, DelegationRequest, ExtractorRegistry, Host, Integrates,
    PluginRegistry, SubmittedJob,
};

/// Dumps written and jobs submitted for a delegated session.
#[derive(Debug, Clone)]
pub struct Delegation {
    pub context_dump: PathBuf,
    pub instance_dumps: Vec<PathBuf>,
    pub jobs: Vec<SubmittedJob>,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub session_id: String,
    pub state: SessionState,
    pub integrated: Vec<IntegratedVersion>,
    pub delegation: Option<Delegation>,
}

/// Abort unless every recorded result succeeded.
pub(crate) fn gate(session: &mut PublishSession, kind: ErrorKind) -> PublishResult<()> {
    if session.atomicity_held() {
        return Ok(());
    }
    let err = session.failure_summary(kind);
    tracing::error!(session = %session.id, state = %session.state, "{}", err.message);
    session.abort();
    Err(err)
}

pub struct Publisher {
    plugins: PluginRegistry,
    extractors: ExtractorRegistry,
    contractors: ContractorRegistry,
    integrator: Arc<dyn Integrates>,
    host: Arc<dyn Host>,
}

impl Publisher {
    pub fn new(plugins: PluginRegistry, integrator: Arc<dyn Integrates>, host: Arc<dyn Host>) -> Self {
        Self {
            plugins,
            extractors: ExtractorRegistry::with_builtins(),
            contractors: ContractorRegistry::new(),
            integrator,
            host,
        }
    }

    pub fn with_extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_contractors(mut self, contractors: ContractorRegistry) -> Self {
        self.contractors = contractors;
        self
    }

    pub fn contractors(&self) -> &ContractorRegistry {
        &self.contractors
    }

    pub async fn run(&mut self, session: &mut PublishSession) -> PublishResult<PublishOutcome> {
        tracing::info!(session = %session.id, user = %session.context.user, "publish started");

        self.collect(session)?;
        self.validate(session)?;
        self.extract(session).await?;

        if session.instances.iter().any(|i| i.contractor().is_some()) {
            let delegation = self.delegate(session).await?;
            session.advance(SessionState::Delegated);
            tracing::info!(
                session = %session.id,
                jobs = delegation.jobs.len(),
                context = %delegation.context_dump.display(),
                "publish delegated"
            );
            return Ok(PublishOutcome {
                session_id: session.id.clone(),
                state: session.state,
                integrated: Vec::new(),
                delegation: Some(delegation),
            });
        }

        let integrated = self.integrate(session).await?;
        session.advance(SessionState::Done);
        tracing::info!(session = %session.id, versions = integrated.len(), "publish done");
        Ok(PublishOutcome {
            session_id: session.id.clone(),
            state: session.state,
            integrated,
            delegation: None,
        })
    }

    fn collect(&self, session: &mut PublishSession) -> PublishResult<()> {
        for plugin in self.plugins.collectors() {
            let result = plugin.collect(session, self.host.as_ref());
            session.record(PhaseResult::from_result(
                Phase::Collect,
                plugin.name(),
                None,
                result,
            ));
        }
        gate(session, ErrorKind::Collection)?;

        if session.instances.is_empty() {
            session.abort();
            return Err(PublishError::collection("no publishable instances were collected"));
        }
        tracing::info!(session = %session.id, instances = session.instances.len(), "collected");
        Ok(())
    }

    fn validate(&self, session: &mut PublishSession) -> PublishResult<()> {
        session.advance(SessionState::Validating);

        for plugin in self.plugins.validators() {
            for i in 0..session.instances.len() {
                let instance = &session.instances[i];
                if !plugin.applies_to(instance) {
                    continue;
                }
                let result = plugin.validate(instance, &*session);
                let id = instance.id.clone();
                session.record(PhaseResult::from_result(
                    Phase::Validate,
                    plugin.name(),
                    Some(&id),
                    result,
                ));
            }
        }

        let unknown: Vec<(String, String)> = session
            .instances
            .iter()
            .filter_map(|i| i.contractor().map(|c| (i.id.clone(), c.to_string())))
            .filter(|(_, c)| !self.contractors.contains(c))
            .collect();
        for (id, contractor) in unknown {
            session.record(PhaseResult::failed(
                Phase::Validate,
                "ValidateContractor",
                Some(&id),
                PublishError::validation(format!("unknown contractor '{}'", contractor)),
            ));
        }

        gate(session, ErrorKind::Validation)
    }

    async fn extract(&self, session: &mut PublishSession) -> PublishResult<()> {
        session.advance(SessionState::Extracting);
        let context = session.context.clone();

        for i in 0..session.instances.len() {
            let reserved = self
                .integrator
                .reserve_version(&session.instances[i], &context)
                .await;
            let id = session.instances[i].id.clone();
            match reserved {
                Ok((version, dir)) => {
                    tracing::debug!(instance = %session.instances[i].name, version, "version reserved");
                    session.instances[i].set_version(version, &dir);
                }
                Err(e) => session.record(PhaseResult::failed(
                    Phase::Extract,
                    self.integrator.name(),
                    Some(&id),
                    e,
                )),
            }
        }
        gate(session, ErrorKind::Extraction)?;

        for plugin in self.plugins.extracts() {
            for i in 0..session.instances.len() {
                if !plugin.applies_to(&session.instances[i]) {
                    continue;
                }
                let result = plugin.process(&mut session.instances[i], &context);
                let id = session.instances[i].id.clone();
                session.record(PhaseResult::from_result(
                    Phase::Extract,
                    plugin.name(),
                    Some(&id),
                    result,
                ));
            }
        }

        // Delegated instances keep their extractors pending for the farm.
        for i in 0..session.instances.len() {
            if session.instances[i].contractor().is_some() {
                continue;
            }
            let results = run_pending_extractors(&mut session.instances[i], &self.extractors);
            for result in results {
                session.record(result);
            }
        }

        gate(session, ErrorKind::Extraction)
    }

    /// Dump every instance plus the context, then submit per contractor.
    async fn delegate(&mut self, session: &mut PublishSession) -> PublishResult<Delegation> {
        gate(session, ErrorKind::Submission)?;

        let dumps = DumpSerializer::new(&session.context.root);
        let (context_dump, dumped) = match write_dumps(&dumps, session) {
            Ok(written) => written,
            Err(e) => {
                session.record(PhaseResult::failed(Phase::Delegate, "DumpSerializer", None, e.clone()));
                session.abort();
                return Err(e);
            }
        };

        let mut groups: Vec<(String, Vec<DelegatedInstance>)> = Vec::new();
        for (id, dump) in &dumped {
            let Some(instance) = session.instance(id) else {
                continue;
            };
            let Some(contractor) = instance.contractor() else {
                continue;
            };
            let delegated = DelegatedInstance {
                id: id.clone(),
                name: instance.name.clone(),
                dump: dump.clone(),
                pending: instance.undone_extractors(),
            };
            match groups.iter_mut().find(|(name, _)| name == contractor) {
                Some((_, list)) => list.push(delegated),
                None => groups.push((contractor.to_string(), vec![delegated])),
            }
        }

        let mut jobs = Vec::new();
        for (name, instances) in groups {
            gate(session, ErrorKind::Submission)?;

            let contractor = match self.contractors.resolve(&name) {
                Ok(c) => c,
                Err(e) => {
                    session.record(PhaseResult::failed(Phase::Delegate, &name, None, e.clone()));
                    session.abort();
                    return Err(e);
                }
            };
            let request = DelegationRequest {
                contractor: name.clone(),
                context_dump: context_dump.clone(),
                instances,
            };

            match contractor.fulfill(&*session, &request).await {
                Ok(mut submitted) => {
                    tracing::info!(contractor = %name, jobs = submitted.len(), "submitted");
                    session.record(PhaseResult::ok(Phase::Delegate, &name, None));
                    jobs.append(&mut submitted);
                }
                Err(e) => {
                    session.record(PhaseResult::failed(Phase::Delegate, &name, None, e.clone()));
                    session.abort();
                    return Err(e);
                }
            }
        }

        Ok(Delegation {
            context_dump,
            instance_dumps: dumped.into_iter().map(|(_, path)| path).collect(),
            jobs,
        })
    }

    async fn integrate(&self, session: &mut PublishSession) -> PublishResult<Vec<IntegratedVersion>> {
        session.advance(SessionState::Integrating);
        let context = session.context.clone();
        let mut integrated = Vec::new();

        for i in 0..session.instances.len() {
            gate(session, ErrorKind::Integration)?;
            let id = session.instances[i].id.clone();
            match self.integrator.integrate(&session.instances[i], &context).await {
                Ok(version) => {
                    session.record(PhaseResult::ok(Phase::Integrate, self.integrator.name(), Some(&id)));
                    integrated.push(version);
                }
                Err(e) => session.record(PhaseResult::failed(
                    Phase::Integrate,
                    self.integrator.name(),
                    Some(&id),
                    e,
                )),
            }
        }
        gate(session, ErrorKind::Integration)?;
        Ok(integrated)
    }
}

/// Instance dumps, extractor dumps for pending representations, then the
/// context dump whose path every instance dump already references.
fn write_dumps(
    dumps: &DumpSerializer,
    session: &PublishSession,
) -> PublishResult<(PathBuf, Vec<(String, PathBuf)>)> {
    let context_path = dumps.context_dump_path(&session.context.user, &session.id);
    let mut dumped = Vec::new();
    for instance in &session.instances {
        let (path, _) = dumps.dump_instance(instance, Some(&context_path))?;
        for repr in instance.undone_extractors() {
            dumps.dump_extractor(instance, &repr)?;
        }
        dumped.push((instance.id.clone(), path));
    }
    let (written, _) = dumps.dump_context(session, &dumped)?;
    Ok((written, dumped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StandaloneHost;
    use crate::instance::InstanceRecord;
    use crate::integrate::VersionIntegrator;
    use crate::session::SessionContext;
    use crate::store::memory::InMemoryStore;
    use crate::traits::Collects;
    use serde_json::json;
    use tempfile::TempDir;

    /// Adds fixed instances without a manifest file.
    struct FixedCollector(Vec<InstanceRecord>);

    impl Collects for FixedCollector {
        fn name(&self) -> &str {
            "CollectFixed"
        }

        fn collect(&self, session: &mut PublishSession, _host: &dyn Host) -> PublishResult<()> {
            for inst in &self.0 {
                session.add_instance(inst.clone());
            }
            Ok(())
        }
    }

    fn model(name: &str, members: &[&str]) -> InstanceRecord {
        let mut inst = InstanceRecord::new(name, "model");
        inst.members = members.iter().map(|m| m.to_string()).collect();
        inst.data.insert(
            "representations".into(),
            json!([{ "name": "Metadata", "func": "write_json",
                     "kwargs": { "filename": "meta.json", "content": { "name": name } } }]),
        );
        inst
    }

    fn session(root: &std::path::Path) -> PublishSession {
        PublishSession::new(SessionContext {
            user: "ana".into(),
            project: Some("show".into()),
            asset: Some("chair".into()),
            root: root.to_path_buf(),
            ..Default::default()
        })
    }

    fn publisher(instances: Vec<InstanceRecord>) -> Publisher {
        Publisher::new(
            PluginRegistry::with_builtins(Box::new(FixedCollector(instances))),
            Arc::new(VersionIntegrator::new(Arc::new(InMemoryStore::new()))),
            Arc::new(StandaloneHost::new(None, None)),
        )
    }

    #[tokio::test]
    async fn test_local_publish_runs_to_done() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(tmp.path());
        let outcome = publisher(vec![model("modelDefault", &["|geo"])])
            .run(&mut s)
            .await
            .unwrap();

        assert_eq!(outcome.state, SessionState::Done);
        assert!(outcome.delegation.is_none());
        assert_eq!(outcome.integrated.len(), 1);
        assert!(tmp
            .path()
            .join("show/chair/publish/modelDefault/v001/Metadata/meta.json")
            .is_file());
    }

    #[tokio::test]
    async fn test_validation_failure_aborts_before_extraction() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(tmp.path());
        let err = publisher(vec![model("good", &["|geo"]), model("empty", &[])])
            .run(&mut s)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("atomicity not held"));
        assert_eq!(s.state, SessionState::Aborted);
        assert!(s.instances.iter().all(|i| i.version().is_none()));
        assert!(!tmp.path().join("show").exists());
    }

    #[tokio::test]
    async fn test_empty_collection_is_error() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(tmp.path());
        let err = publisher(vec![]).run(&mut s).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Collection);
        assert_eq!(s.state, SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_unknown_contractor_fails_validation() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(tmp.path());
        let mut inst = model("modelDefault", &["|geo"]);
        inst.data.insert("publishContractor".into(), json!("nowhere"));
        let err = publisher(vec![inst]).run(&mut s).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("unknown contractor 'nowhere'"));
    }
}
