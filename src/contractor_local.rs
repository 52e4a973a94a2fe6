//! Contractor that resumes delegated work in subprocesses on this machine.
//!
//! Runs exactly the steps a farm would, in order: one extraction resume per
//! pending instance, then the integration resume of the context dump. The
//! child processes get the same explicit environment a farm job gets and
//! nothing from this process's session.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{Config, LocalContractorConfig};
use crate::error::{PublishError, PublishResult};
use crate::session::PublishSession;
use crate::traits::{resume_arguments, Contractor, DelegationRequest, JobKind, SubmittedJob};

pub struct LocalContractor {
    name: String,
    executable: PathBuf,
    config_path: Option<PathBuf>,
}

impl LocalContractor {
    pub fn new(name: String, cfg: LocalContractorConfig, config: &Config) -> Result<Self> {
        let executable = match cfg.executable {
            Some(path) => path,
            None => config.resume_executable()?,
        };
        Ok(Self {
            name,
            executable,
            config_path: config.source_path.clone(),
        })
    }

    async fn run_step(
        &self,
        args: Vec<String>,
        env: &BTreeMap<String, String>,
    ) -> Result<String> {
        let child = tokio::process::Command::new(&self.executable)
            .args(&args)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.executable.display()))?;
        let pid = child.id().unwrap_or_default();

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "`{} {}` exited with {}: {}",
                self.executable.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(format!("local-{}", pid))
    }

    fn args(&self, extract_only: bool, dump: &Path) -> Vec<String> {
        resume_arguments(self.config_path.as_deref(), extract_only, dump)
    }
}

#[async_trait]
impl Contractor for LocalContractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn contractor_type(&self) -> &str {
        "local"
    }

    async fn fulfill(
        &self,
        session: &PublishSession,
        request: &DelegationRequest,
    ) -> PublishResult<Vec<SubmittedJob>> {
        let failed = |e: anyhow::Error| {
            PublishError::submission(format!("contractor '{}': {:#}", self.name, e))
        };

        let mut jobs = Vec::new();
        for delegated in request.instances.iter().filter(|d| !d.pending.is_empty()) {
            let env = request.environment(session, Some(delegated), self.config_path.as_deref());
            let job_id = self
                .run_step(self.args(true, &delegated.dump), &env)
                .await
                .map_err(failed)?;
            tracing::info!(contractor = %self.name, instance = %delegated.name, "extraction step finished");
            jobs.push(SubmittedJob {
                contractor: self.name.clone(),
                job_id,
                kind: JobKind::Extraction,
                instance_id: Some(delegated.id.clone()),
            });
        }

        let env = request.environment(session, None, self.config_path.as_deref());
        let job_id = self
            .run_step(self.args(false, &request.context_dump), &env)
            .await
            .map_err(failed)?;
        tracing::info!(contractor = %self.name, "integration step finished");
        jobs.push(SubmittedJob {
            contractor: self.name.clone(),
            job_id,
            kind: JobKind::Integration,
            instance_id: None,
        });
        Ok(jobs)
    }
}
