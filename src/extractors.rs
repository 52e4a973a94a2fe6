//! Builtin extractor callables and the pending-extractor runner.
//!
//! An extractor writes one representation's files into its stage dir
//! (`<version-dir>/.stage/<repr>`). The runner is shared by the local
//! extract phase and the resume runner, so a representation is extracted
//! the same way wherever it runs.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::PublishError;
use crate::instance::InstanceRecord;
use crate::session::{Phase, PhaseResult};
use crate::traits::{ExtractionJob, ExtractionOutput, Extractor, ExtractorRegistry};

/// Copies the files named in `args` into the stage dir.
///
/// With `kwargs.hardlink = true` nothing is copied; each source is
/// registered as a hardlink into the representation instead.
pub struct CopyFilesExtractor;

impl Extractor for CopyFilesExtractor {
    fn name(&self) -> &str {
        "copy_files"
    }

    fn extract(&self, job: &ExtractionJob<'_>) -> Result<ExtractionOutput> {
        let hardlink = job
            .kwargs
            .get("hardlink")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut output = ExtractionOutput::default();
        for arg in job.args {
            let src = arg
                .as_str()
                .map(PathBuf::from)
                .with_context(|| format!("copy_files expects path strings, got {}", arg))?;
            let file_name = src
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .with_context(|| format!("Source has no file name: {}", src.display()))?;
            if !src.is_file() {
                bail!("Source file not found: {}", src.display());
            }

            if hardlink {
                output.hardlinks.push((src, file_name));
            } else {
                std::fs::copy(&src, job.stage_dir.join(&file_name)).with_context(|| {
                    format!("Failed to copy {} into {}", src.display(), job.stage_dir.display())
                })?;
                output.files.push(file_name);
            }
        }
        Ok(output)
    }
}

/// Writes `kwargs.content` as pretty JSON to `kwargs.filename`.
pub struct WriteJsonExtractor;

impl Extractor for WriteJsonExtractor {
    fn name(&self) -> &str {
        "write_json"
    }

    fn extract(&self, job: &ExtractionJob<'_>) -> Result<ExtractionOutput> {
        let filename = job
            .kwargs
            .get("filename")
            .and_then(Value::as_str)
            .context("write_json requires kwargs.filename")?;
        if filename.contains('/') || filename.contains('\\') || filename.starts_with('.') {
            bail!("write_json filename must be a plain file name: {}", filename);
        }
        let content = job.kwargs.get("content").cloned().unwrap_or(Value::Null);

        let path = job.stage_dir.join(filename);
        std::fs::write(&path, serde_json::to_string_pretty(&content)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(ExtractionOutput {
            files: vec![filename.to_string()],
            hardlinks: Vec::new(),
        })
    }
}

/// Run one representation's extractor into its stage dir.
pub fn run_extractor(
    registry: &ExtractorRegistry,
    func: &str,
    job: &ExtractionJob<'_>,
) -> Result<ExtractionOutput> {
    let extractor = registry
        .find(func)
        .with_context(|| format!("No extractor registered as '{}'", func))?;
    std::fs::create_dir_all(job.stage_dir)
        .with_context(|| format!("Failed to create stage dir: {}", job.stage_dir.display()))?;
    extractor.extract(job)
}

/// Run every not-done extractor of `record` in representation-name order.
///
/// Produced files are registered under their final location
/// `<version-dir>/<repr>/<file>` and the extractor is flipped to done.
/// A failing extractor is recorded and its siblings still run.
pub fn run_pending_extractors(
    record: &mut InstanceRecord,
    registry: &ExtractorRegistry,
) -> Vec<PhaseResult> {
    let mut results = Vec::new();
    let Some(version_dir) = record.version_dir() else {
        results.push(PhaseResult::failed(
            Phase::Extract,
            "extractors",
            Some(&record.id),
            PublishError::extraction(format!(
                "instance '{}' has no reserved version directory",
                record.name
            )),
        ));
        return results;
    };

    for repr in record.undone_extractors() {
        let Some(desc) = record.pending_extractors.get(&repr).cloned() else {
            continue;
        };
        let stage_dir = version_dir.join(".stage").join(&repr);
        let job = ExtractionJob {
            instance_id: &record.id,
            representation: &repr,
            stage_dir: &stage_dir,
            args: &desc.args,
            kwargs: &desc.kwargs,
        };

        match run_extractor(registry, &desc.func, &job) {
            Ok(output) => {
                register_output(record, &version_dir, &repr, &output);
                record.mark_extractor_done(&repr);
                tracing::info!(
                    instance = %record.name,
                    representation = %repr,
                    files = output.files.len() + output.hardlinks.len(),
                    "extracted"
                );
                results.push(PhaseResult::ok(Phase::Extract, &desc.func, Some(&record.id)));
            }
            Err(e) => {
                let err = PublishError::extraction(format!("{} ({}): {:#}", repr, desc.func, e));
                results.push(PhaseResult::failed(
                    Phase::Extract,
                    &desc.func,
                    Some(&record.id),
                    err,
                ));
            }
        }
    }
    results
}

fn register_output(
    record: &mut InstanceRecord,
    version_dir: &Path,
    repr: &str,
    output: &ExtractionOutput,
) {
    let repr_dir = version_dir.join(repr);
    for file in &output.files {
        record.register_file(&repr_dir.join(file).to_string_lossy());
    }
    for (src, name) in &output.hardlinks {
        record.register_hardlink(&src.to_string_lossy(), &repr_dir.join(name).to_string_lossy());
    }
}
