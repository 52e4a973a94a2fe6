//! Deadline render farm contractor.
//!
//! Each delegated instance with pending representations becomes one
//! `CommandLine` job running `fpub resume --extract-only <instance-dump>`;
//! one more job running `fpub resume <context-dump>` depends on all of them
//! and integrates the session once the farm is done.
//!
//! Jobs are submitted either to the Deadline web service
//! (`POST <url>/api/jobs`) or through the `deadlinecommand` tool with job
//! and plugin info files. A rejected submission is fatal; nothing retries.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, DeadlineContractorConfig};
use crate::error::{ErrorKind, PublishError, PublishResult};
use crate::session::PublishSession;
use crate::traits::{
    resume_arguments, Contractor, DelegatedInstance, DelegationRequest, JobKind, SubmittedJob,
};

/// Key/value blocks of one Deadline job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadlineJob {
    pub job_info: BTreeMap<String, String>,
    pub plugin_info: BTreeMap<String, String>,
}

impl DeadlineJob {
    /// Body accepted by the web service's job endpoint.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "JobInfo": self.job_info,
            "PluginInfo": self.plugin_info,
            "AuxFiles": [],
            "IdOnly": true,
        })
    }

    fn set_environment(&mut self, env: &BTreeMap<String, String>) {
        for (i, (key, value)) in env.iter().enumerate() {
            self.job_info
                .insert(format!("EnvironmentKeyValue{}", i), format!("{}={}", key, value));
        }
    }
}

/// `key=value` lines, the format of `deadlinecommand` info files.
fn info_file(entries: &BTreeMap<String, String>) -> String {
    entries
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect()
}

fn quote(arg: &str) -> String {
    if arg.chars().any(char::is_whitespace) {
        format!("\"{}\"", arg)
    } else {
        arg.to_string()
    }
}

pub struct DeadlineContractor {
    name: String,
    cfg: DeadlineContractorConfig,
    executable: PathBuf,
    config_path: Option<PathBuf>,
    client: reqwest::Client,
}

impl DeadlineContractor {
    pub fn new(name: String, cfg: DeadlineContractorConfig, config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            name,
            executable: config.resume_executable()?,
            config_path: config.source_path.clone(),
            cfg,
            client,
        })
    }

    fn base_job(&self, session: &PublishSession, name: String) -> DeadlineJob {
        let ctx = &session.context;
        let batch = match (&ctx.project, &ctx.asset) {
            (Some(p), Some(a)) => format!("{}/{} publish {}", p, a, session.id),
            _ => format!("publish {}", session.id),
        };

        let mut job = DeadlineJob::default();
        let info = &mut job.job_info;
        info.insert("Plugin".into(), "CommandLine".into());
        info.insert("Name".into(), name);
        info.insert("BatchName".into(), batch);
        info.insert("UserName".into(), ctx.user.clone());
        info.insert("Pool".into(), self.cfg.pool.clone());
        info.insert("Group".into(), self.cfg.group.clone());
        info.insert("Priority".into(), self.cfg.priority.to_string());
        if let Some(secondary) = self.cfg.secondary_pool.as_ref().filter(|s| !s.is_empty()) {
            info.insert("SecondaryPool".into(), secondary.clone());
        }
        if !ctx.comment.is_empty() {
            info.insert("Comment".into(), ctx.comment.clone());
        }
        job
    }

    fn set_command(&self, job: &mut DeadlineJob, extract_only: bool, dump: &Path) {
        let args: Vec<String> = resume_arguments(self.config_path.as_deref(), extract_only, dump)
            .iter()
            .map(|a| quote(a))
            .collect();
        job.plugin_info.insert(
            "Executable".into(),
            self.executable.to_string_lossy().to_string(),
        );
        job.plugin_info.insert("Arguments".into(), args.join(" "));
        job.plugin_info.insert("Shell".into(), "default".into());
    }

    /// Extraction job for one instance. Instance data `deadlinePool`,
    /// `deadlineGroup` and `deadlinePriority` override the contractor config.
    pub fn extraction_job(
        &self,
        session: &PublishSession,
        request: &DelegationRequest,
        delegated: &DelegatedInstance,
    ) -> DeadlineJob {
        let label = session
            .instance(&delegated.id)
            .and_then(|r| r.asset().map(|a| format!("{} {}", a, r.name)))
            .unwrap_or_else(|| delegated.name.clone());
        let mut job = self.base_job(session, format!("{} - extract", label));

        if let Some(record) = session.instance(&delegated.id) {
            for (key, field) in [("deadlinePool", "Pool"), ("deadlineGroup", "Group")] {
                if let Some(value) = record.data.get(key).and_then(Value::as_str) {
                    job.job_info.insert(field.into(), value.to_string());
                }
            }
            if let Some(priority) = record.data.get("deadlinePriority").and_then(Value::as_u64) {
                job.job_info
                    .insert("Priority".into(), priority.min(100).to_string());
            }
            if let Some(dir) = record.version_dir() {
                job.job_info
                    .insert("OutputDirectory0".into(), dir.to_string_lossy().to_string());
            }
        }

        self.set_command(&mut job, true, &delegated.dump);
        job.set_environment(&request.environment(session, Some(delegated), self.config_path.as_deref()));
        job
    }

    /// Integration job running after every extraction job in `depends_on`.
    pub fn integration_job(
        &self,
        session: &PublishSession,
        request: &DelegationRequest,
        depends_on: &[String],
    ) -> DeadlineJob {
        let mut job = self.base_job(session, format!("publish {} - integrate", session.id));
        if !depends_on.is_empty() {
            job.job_info
                .insert("JobDependencies".into(), depends_on.join(","));
        }
        self.set_command(&mut job, false, &request.context_dump);
        job.set_environment(&request.environment(session, None, self.config_path.as_deref()));
        job
    }

    async fn submit(&self, job: &DeadlineJob, work_dir: &Path) -> Result<String> {
        match (&self.cfg.url, &self.cfg.command) {
            (Some(url), _) => self.submit_http(url, job).await,
            (None, Some(command)) => self.submit_command(command, job, work_dir).await,
            (None, None) => bail!("contractor '{}' has neither url nor command", self.name),
        }
    }

    async fn submit_http(&self, url: &str, job: &DeadlineJob) -> Result<String> {
        let endpoint = format!("{}/api/jobs", url.trim_end_matches('/'));
        let response = self
            .client
            .post(&endpoint)
            .json(&job.to_payload())
            .send()
            .await
            .with_context(|| format!("Failed to reach Deadline web service at {}", endpoint))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("Deadline rejected job ({}): {}", status, body.trim());
        }
        parse_http_job_id(&body)
    }

    async fn submit_command(&self, command: &Path, job: &DeadlineJob, work_dir: &Path) -> Result<String> {
        std::fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;
        let n = std::fs::read_dir(work_dir)?.count();
        let job_file = work_dir.join(format!("{:02}_job_info.job", n));
        let plugin_file = work_dir.join(format!("{:02}_plugin_info.job", n));
        std::fs::write(&job_file, info_file(&job.job_info))?;
        std::fs::write(&plugin_file, info_file(&job.plugin_info))?;

        let output = tokio::process::Command::new(command)
            .arg(&job_file)
            .arg(&plugin_file)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", command.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {} {}",
                command.display(),
                output.status,
                stdout.trim(),
                stderr.trim()
            );
        }
        parse_command_job_id(&stdout)
    }
}

fn parse_http_job_id(body: &str) -> Result<String> {
    let json: Value = serde_json::from_str(body)
        .with_context(|| format!("Unexpected Deadline response: {}", body.trim()))?;
    json.get("_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .with_context(|| format!("Deadline response has no job id: {}", body.trim()))
}

/// Parse `deadlinecommand` output (`Result=Success`, `JobID=...`).
fn parse_command_job_id(stdout: &str) -> Result<String> {
    let mut job_id = None;
    let mut result = None;
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(id) = line.strip_prefix("JobID=") {
            job_id = Some(id.trim().to_string());
        } else if let Some(r) = line.strip_prefix("Result=") {
            result = Some(r.trim().to_string());
        }
    }
    if result.as_deref() != Some("Success") {
        bail!("Deadline submission failed: {}", stdout.trim());
    }
    job_id
        .filter(|id| !id.is_empty())
        .with_context(|| format!("Deadline output has no JobID: {}", stdout.trim()))
}

#[async_trait]
impl Contractor for DeadlineContractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn contractor_type(&self) -> &str {
        "deadline"
    }

    async fn fulfill(
        &self,
        session: &PublishSession,
        request: &DelegationRequest,
    ) -> PublishResult<Vec<SubmittedJob>> {
        let work_dir = request
            .context_dump
            .parent()
            .map(|p| p.join(".deadline").join(&session.id))
            .unwrap_or_else(|| PathBuf::from(".deadline"));
        let submission_err =
            |e: anyhow::Error| PublishError::from_anyhow(ErrorKind::Submission, &e);

        let mut jobs = Vec::new();
        for delegated in request.instances.iter().filter(|d| !d.pending.is_empty()) {
            let job = self.extraction_job(session, request, delegated);
            let job_id = self.submit(&job, &work_dir).await.map_err(submission_err)?;
            tracing::info!(contractor = %self.name, instance = %delegated.name, job = %job_id, "extraction job submitted");
            jobs.push(SubmittedJob {
                contractor: self.name.clone(),
                job_id,
                kind: JobKind::Extraction,
                instance_id: Some(delegated.id.clone()),
            });
        }

        let depends_on: Vec<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
        let job = self.integration_job(session, request, &depends_on);
        let job_id = self.submit(&job, &work_dir).await.map_err(submission_err)?;
        tracing::info!(contractor = %self.name, job = %job_id, "integration job submitted");
        jobs.push(SubmittedJob {
            contractor: self.name.clone(),
            job_id,
            kind: JobKind::Integration,
            instance_id: None,
        });

        Ok(jobs)
    }
}
