//! Capability traits and their registries.
//!
//! Phase plugins implement one small capability each instead of inheriting
//! from host-specific base classes; host behavior is reached through the
//! [`Host`] adapter passed in at run time.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    PluginRegistry                      │
//! │  Collects ──▶ Validates ──▶ Extracts                   │
//! └──────────────────────────┬─────────────────────────────┘
//!                            ▼
//!     ExtractorRegistry (callables)   ContractorRegistry (delegation targets)
//!                            ▼                     ▼
//!                      run locally          fulfill() on a farm / subprocess
//!                            └──────────┬──────────┘
//!                                       ▼
//!                               Integrates (store)
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{PublishError, PublishResult};
use crate::instance::InstanceRecord;
use crate::integrate::IntegratedVersion;
use crate::session::{PublishSession, SessionContext};

// ═══════════════════════════════════════════════════════════════════════
// Host adapter
// ═══════════════════════════════════════════════════════════════════════

/// The application a publish runs inside (a DCC, or none on a farm node).
pub trait Host: Send + Sync {
    fn name(&self) -> &str;

    /// Work file currently open, if any.
    fn current_file(&self) -> Option<PathBuf>;

    /// Report a terminal failure in a way the host's job watcher can see.
    fn signal_failure(&self, error: &PublishError);
}

// ═══════════════════════════════════════════════════════════════════════
// Phase plugins
// ═══════════════════════════════════════════════════════════════════════

/// Adds instances or context data to a session.
pub trait Collects: Send + Sync {
    fn name(&self) -> &str;

    fn collect(&self, session: &mut PublishSession, host: &dyn Host) -> PublishResult<()>;
}

/// Checks one instance. Never mutates content.
pub trait Validates: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, _instance: &InstanceRecord) -> bool {
        true
    }

    /// `session` gives read access to sibling instances.
    fn validate(&self, instance: &InstanceRecord, session: &PublishSession) -> PublishResult<()>;
}

/// Prepares extraction for one instance, usually by registering pending
/// extractors through [`InstanceRecord::mark_pending_extractor`].
pub trait Extracts: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, _instance: &InstanceRecord) -> bool {
        true
    }

    fn process(&self, instance: &mut InstanceRecord, context: &SessionContext) -> PublishResult<()>;
}

/// Commits extracted instances to the versioned store.
#[async_trait]
pub trait Integrates: Send + Sync {
    fn name(&self) -> &str;

    /// Reserve the next version number and directory for an instance.
    async fn reserve_version(
        &self,
        instance: &InstanceRecord,
        context: &SessionContext,
    ) -> PublishResult<(u32, PathBuf)>;

    /// The version an earlier run already integrated for this instance.
    async fn already_integrated(&self, instance_id: &str) -> PublishResult<Option<IntegratedVersion>>;

    async fn integrate(
        &self,
        instance: &InstanceRecord,
        context: &SessionContext,
    ) -> PublishResult<IntegratedVersion>;
}

// ═══════════════════════════════════════════════════════════════════════
// Extractor callables
// ═══════════════════════════════════════════════════════════════════════

/// Inputs of one representation's extraction.
#[derive(Debug)]
pub struct ExtractionJob<'a> {
    pub instance_id: &'a str,
    pub representation: &'a str,
    /// Empty directory the extractor writes into.
    pub stage_dir: &'a Path,
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
}

/// Files an extractor produced, relative to its stage dir.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtractionOutput {
    pub files: Vec<String>,
    /// `(source, name)`: link `source` into the representation as `name`
    /// at integration instead of copying it.
    pub hardlinks: Vec<(PathBuf, String)>,
}

/// A named extraction callable. The same name resolves to the same code
/// locally and on a farm worker.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, job: &ExtractionJob<'_>) -> Result<ExtractionOutput>;
}

// ═══════════════════════════════════════════════════════════════════════
// Contractor
// ═══════════════════════════════════════════════════════════════════════

/// One dumped instance handed to a contractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatedInstance {
    pub id: String,
    pub name: String,
    pub dump: PathBuf,
    /// Representations still waiting for extraction; empty when the
    /// instance only needs integrating.
    pub pending: Vec<String>,
}

/// Everything a contractor needs; nothing else may be assumed on the
/// remote side.
///
/// A contractor submits one extraction job per instance with pending
/// representations and one integration job for `context_dump` that
/// depends on all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub contractor: String,
    pub context_dump: PathBuf,
    pub instances: Vec<DelegatedInstance>,
}

impl DelegationRequest {
    /// Explicit environment for one remote step. `instance` is `None` for
    /// the integration step.
    pub fn environment(
        &self,
        session: &PublishSession,
        instance: Option<&DelegatedInstance>,
        config_path: Option<&Path>,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let ctx = &session.context;
        if let Some(config) = config_path {
            env.insert("FPUB_CONFIG".into(), config.to_string_lossy().to_string());
        }
        env.insert(
            "FPUB_CONTEXT_DUMP".into(),
            self.context_dump.to_string_lossy().to_string(),
        );
        env.insert("FPUB_SESSION".into(), session.id.clone());
        env.insert("FPUB_USER".into(), ctx.user.clone());
        env.insert("FPUB_ROOT".into(), ctx.root.to_string_lossy().to_string());
        if let Some(project) = &ctx.project {
            env.insert("FPUB_PROJECT".into(), project.clone());
        }

        let record = instance.and_then(|d| session.instance(&d.id));
        if let Some(asset) = record.and_then(|r| r.asset()).or(ctx.asset.as_deref()) {
            env.insert("FPUB_ASSET".into(), asset.to_string());
        }
        if let Some(delegated) = instance {
            env.insert(
                "FPUB_INSTANCE_DUMP".into(),
                delegated.dump.to_string_lossy().to_string(),
            );
        }
        if let Some(dir) = record.and_then(|r| r.version_dir()) {
            env.insert("FPUB_OUTPUT_DIR".into(), dir.to_string_lossy().to_string());
        }
        env
    }
}

/// Arguments of the resume command a remote step runs.
pub fn resume_arguments(config_path: Option<&Path>, extract_only: bool, dump: &Path) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(config) = config_path {
        args.push("--config".to_string());
        args.push(config.to_string_lossy().to_string());
    }
    args.push("resume".to_string());
    if extract_only {
        args.push("--extract-only".to_string());
    }
    args.push(dump.to_string_lossy().to_string());
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Extraction,
    Integration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub contractor: String,
    pub job_id: String,
    pub kind: JobKind,
    pub instance_id: Option<String>,
}

/// A place that can run the remaining publish work.
#[async_trait]
pub trait Contractor: Send + Sync {
    fn name(&self) -> &str;

    fn contractor_type(&self) -> &str;

    /// Submit the remaining work. Rejection is fatal; there is no retry.
    async fn fulfill(
        &self,
        session: &PublishSession,
        request: &DelegationRequest,
    ) -> PublishResult<Vec<SubmittedJob>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registries
// ═══════════════════════════════════════════════════════════════════════

/// Ordered phase plugins. Plugins run in registration order.
pub struct PluginRegistry {
    collectors: Vec<Box<dyn Collects>>,
    validators: Vec<Box<dyn Validates>>,
    extracts: Vec<Box<dyn Extracts>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            collectors: Vec::new(),
            validators: Vec::new(),
            extracts: Vec::new(),
        }
    }

    /// `primary` (usually the manifest collector) followed by the builtin
    /// fingerprint/dependency collectors, validators and extract plugins.
    pub fn with_builtins(primary: Box<dyn Collects>) -> Self {
        use crate::plugins::{
            ContextValidator, DependencyCollector, FingerprintCollector,
            LookDevDependencyValidator, MembersValidator, RepresentationExtract,
        };

        let mut registry = Self::new();
        registry.register_collector(primary);
        registry.register_collector(Box::new(FingerprintCollector));
        registry.register_collector(Box::new(DependencyCollector));
        registry.register_validator(Box::new(ContextValidator));
        registry.register_validator(Box::new(MembersValidator));
        registry.register_validator(Box::new(LookDevDependencyValidator));
        registry.register_extract(Box::new(RepresentationExtract));
        registry
    }

    pub fn register_collector(&mut self, plugin: Box<dyn Collects>) {
        self.collectors.push(plugin);
    }

    pub fn register_validator(&mut self, plugin: Box<dyn Validates>) {
        self.validators.push(plugin);
    }

    pub fn register_extract(&mut self, plugin: Box<dyn Extracts>) {
        self.extracts.push(plugin);
    }

    pub fn collectors(&self) -> &[Box<dyn Collects>] {
        &self.collectors
    }

    pub fn validators(&self) -> &[Box<dyn Validates>] {
        &self.validators
    }

    pub fn extracts(&self) -> &[Box<dyn Extracts>] {
        &self.extracts
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extractor callables by name.
pub struct ExtractorRegistry {
    extractors: HashMap<String, Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Registry with `copy_files` and `write_json`.
    pub fn with_builtins() -> Self {
        use crate::extractors::{CopyFilesExtractor, WriteJsonExtractor};

        let mut registry = Self::new();
        registry.register(Box::new(CopyFilesExtractor));
        registry.register(Box::new(WriteJsonExtractor));
        registry
    }

    /// Register a callable, replacing any previous one of the same name.
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors
            .insert(extractor.name().to_string(), extractor);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Extractor> {
        self.extractors.get(name).map(|e| e.as_ref())
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub type ContractorFactory = Box<dyn Fn() -> Result<Box<dyn Contractor>> + Send + Sync>;

/// Delegation targets by name.
///
/// Factories are registered at start-up; [`resolve`](Self::resolve)
/// constructs a contractor on first use and hands back the same instance
/// afterwards, so each target has exactly one active contractor per
/// registry.
pub struct ContractorRegistry {
    factories: HashMap<String, ContractorFactory>,
    active: HashMap<String, Box<dyn Contractor>>,
}

impl ContractorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            active: HashMap::new(),
        }
    }

    /// Register factories for every contractor in the config.
    pub fn from_config(config: &Config) -> Self {
        use crate::contractor_deadline::DeadlineContractor;
        use crate::contractor_local::LocalContractor;

        let mut registry = Self::new();

        for (name, cfg) in &config.contractors.deadline {
            let (name, cfg, config) = (name.clone(), cfg.clone(), config.clone());
            let key = name.clone();
            registry.register_factory(
                &key,
                Box::new(move || -> Result<Box<dyn Contractor>> {
                    Ok(Box::new(DeadlineContractor::new(
                        name.clone(),
                        cfg.clone(),
                        &config,
                    )?) as Box<dyn Contractor>)
                }),
            );
        }
        for (name, cfg) in &config.contractors.local {
            let (name, cfg, config) = (name.clone(), cfg.clone(), config.clone());
            let key = name.clone();
            registry.register_factory(
                &key,
                Box::new(move || -> Result<Box<dyn Contractor>> {
                    Ok(Box::new(LocalContractor::new(name.clone(), cfg.clone(), &config)?)
                        as Box<dyn Contractor>)
                }),
            );
        }

        registry
    }

    pub fn register_factory(&mut self, name: &str, factory: ContractorFactory) {
        self.active.remove(name);
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    /// The active contractor for `name`, constructing it on first use.
    pub fn resolve(&mut self, name: &str) -> PublishResult<&dyn Contractor> {
        if !self.active.contains_key(name) {
            let factory = self.factories.get(name).ok_or_else(|| {
                PublishError::submission(format!("Unknown contractor: '{}'", name))
            })?;
            let contractor = factory().map_err(|e| {
                PublishError::submission(format!(
                    "Failed to set up contractor '{}': {:#}",
                    name, e
                ))
            })?;
            tracing::debug!(contractor = name, kind = contractor.contractor_type(), "contractor constructed");
            self.active.insert(name.to_string(), contractor);
        }
        self.active
            .get(name)
            .map(|c| c.as_ref())
            .ok_or_else(|| PublishError::internal(format!("contractor '{}' vanished", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

impl Default for ContractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
