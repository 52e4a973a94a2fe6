//! # Farm Publish CLI (`fpub`)
//!
//! The `fpub` binary publishes from a host manifest, resumes delegated
//! publishes on farm workers, and inspects dumps and versions.
//!
//! ## Usage
//!
//! ```bash
//! fpub --config ./config/fpub.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fpub init` | Create the version store and run schema migrations |
//! | `fpub publish <manifest>` | Collect, validate, extract; integrate or delegate |
//! | `fpub resume <dump>` | Finish a delegated publish from an instance or context dump |
//! | `fpub extract <stage-dir>` | Rerun one extractor from its extractor dump |
//! | `fpub dumps` | List context dumps and what is still pending |
//! | `fpub versions <project> <asset> <subset>` | List integrated versions of a subset |
//!
//! ## Exit codes
//!
//! `0` on success, `1` for internal errors, then one code per failure kind:
//! collection `2`, validation `3`, extraction `4`, submission `5`,
//! resume `6`, integration `7`.
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the store
//! fpub init --config ./config/fpub.toml
//!
//! # Publish what a DCC session wrote out
//! fpub publish ./chair.publish.json --comment "fixed UVs"
//!
//! # On a farm worker: extract one instance, then integrate the session
//! fpub resume --extract-only /mnt/projects/show/chair/publish/modelDefault/v004/.instance.json
//! fpub resume /mnt/projects/dumps/.context.ana.<session>.json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use farm_publish::config::{self, Config};
use farm_publish::error::{ErrorKind, PublishError};
use farm_publish::host::StandaloneHost;
use farm_publish::inspect;
use farm_publish::integrate::{version_name, VersionIntegrator};
use farm_publish::plugins::ManifestCollector;
use farm_publish::publish::{PublishOutcome, Publisher};
use farm_publish::resume::{RemoteResumeRunner, ResumeMode, ResumeReport};
use farm_publish::session::{PublishSession, SessionContext};
use farm_publish::sqlite_store::SqliteStore;
use farm_publish::store::memory::InMemoryStore;
use farm_publish::store::VersionStore;
use farm_publish::traits::{ContractorRegistry, Host, PluginRegistry};
use farm_publish::{db, migrate};

/// Farm Publish CLI: delayed and remote publishing for VFX pipelines.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/fpub.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "fpub",
    about = "Farm Publish: publish locally or delegate extraction to a render farm",
    version,
    long_about = "Farm Publish collects, validates and extracts publish instances. Heavy \
    extraction can be delegated: the session is dumped next to the reserved versions, a \
    contractor (Deadline or a local subprocess) runs `fpub resume` on the dumps, and the \
    versions are integrated from the dumps alone."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/fpub.toml`. Store, publish root and
    /// contractor settings are read from this file.
    #[arg(long, global = true, default_value = "./config/fpub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the version store schema.
    ///
    /// Creates the SQLite database file and the documents table.
    /// Running it again is safe.
    Init,

    /// Publish the instances described by a host manifest.
    ///
    /// Instances naming a contractor make the whole session delegated:
    /// dumps are written and jobs submitted instead of integrating here.
    Publish {
        /// Manifest written by the host application (JSON).
        manifest: PathBuf,

        /// Publish comment; overrides the manifest's.
        #[arg(long)]
        comment: Option<String>,
    },

    /// Resume a delegated publish from its dumps.
    ///
    /// Accepts an instance dump (`.instance.json`) or a context dump
    /// (`.context.<user>.<session>.json`). Safe to run again.
    Resume {
        /// Dump file to resume from.
        dump: PathBuf,

        /// Run pending extractors only; leave integration to a later run.
        #[arg(long)]
        extract_only: bool,
    },

    /// Rerun a single extractor from the extractor dump in a stage dir.
    ///
    /// Does not touch done flags or the version store.
    Extract {
        /// Stage directory containing `.extractor.json`.
        stage_dir: PathBuf,
    },

    /// List context dumps under the publish root.
    Dumps,

    /// List integrated versions of a subset.
    Versions {
        project: String,
        asset: String,
        subset: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FPUB_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // Extract works from the stage dir alone
    if let Commands::Extract { stage_dir } = &cli.command {
        let host = StandaloneHost::new(None, None);
        let integrator = Arc::new(VersionIntegrator::new(Arc::new(InMemoryStore::new())));
        let runner = RemoteResumeRunner::new(integrator);
        match runner.run_extractor_dump(stage_dir) {
            Ok(output) => {
                println!("Extracted into {}", stage_dir.display());
                for file in &output.files {
                    println!("  {}", file);
                }
                for (src, dst) in &output.hardlinks {
                    println!("  {} -> {}", src.display(), dst);
                }
            }
            Err(e) => fail(&host, e),
        }
        return Ok(());
    }

    // A farm worker only sees exit codes and the trigger line, so setup
    // failures go through `fail` like any other.
    let setup_kind = match cli.command {
        Commands::Resume { .. } => ErrorKind::Resume,
        _ => ErrorKind::Internal,
    };
    let cfg = config::load_config(&cli.config)
        .unwrap_or_else(|e| fail_with(&StandaloneHost::new(None, None), setup_kind, e));
    let host = StandaloneHost::new(None, cfg.publish.host_error_trigger.clone());

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg)
                .await
                .unwrap_or_else(|e| fail_with(&host, setup_kind, e));
            println!("Store initialized successfully.");
        }
        Commands::Publish { manifest, comment } => {
            let store = open_store(&cfg)
                .await
                .unwrap_or_else(|e| fail_with(&host, setup_kind, e));
            let host = Arc::new(host);
            let plugins = PluginRegistry::with_builtins(Box::new(ManifestCollector::new(&manifest)));
            let integrator = Arc::new(VersionIntegrator::new(store));
            let mut publisher = Publisher::new(plugins, integrator, host.clone())
                .with_contractors(ContractorRegistry::from_config(&cfg));

            let mut session = PublishSession::new(SessionContext {
                user: cfg.user(),
                comment: comment.unwrap_or_default(),
                root: cfg.publish.root.clone(),
                ..Default::default()
            });
            match publisher.run(&mut session).await {
                Ok(outcome) => print_outcome(&session, &outcome),
                Err(e) => fail(host.as_ref(), e),
            }
        }
        Commands::Resume { dump, extract_only } => {
            let store = open_store(&cfg)
                .await
                .unwrap_or_else(|e| fail_with(&host, setup_kind, e));
            let runner = RemoteResumeRunner::new(Arc::new(VersionIntegrator::new(store)));
            let mode = if extract_only {
                ResumeMode::ExtractOnly
            } else {
                ResumeMode::Full
            };
            match runner.resume(&dump, mode).await {
                Ok(report) => print_report(&report),
                Err(e) => fail(&host, e),
            }
        }
        Commands::Extract { .. } => {}
        Commands::Dumps => {
            let dumps = inspect::list_dumps(&cfg.publish.root)
                .unwrap_or_else(|e| fail_with(&host, setup_kind, e));
            if dumps.is_empty() {
                println!("No dumps under {}", cfg.dumps_dir().display());
            }
            for status in &dumps {
                let label = if status.is_extracted() {
                    "extracted"
                } else {
                    "pending"
                };
                println!(
                    "{}  {}  by {}  [{}]",
                    status.session_id, status.date, status.by, label
                );
                for inst in &status.instances {
                    let version = inst.version.map(version_name).unwrap_or_else(|| "-".into());
                    match &inst.error {
                        Some(err) => println!("  {} {}  unreadable: {}", inst.name, version, err),
                        None if inst.pending.is_empty() => println!("  {} {}", inst.name, version),
                        None => println!(
                            "  {} {}  pending: {}",
                            inst.name,
                            version,
                            inst.pending.join(", ")
                        ),
                    }
                }
            }
        }
        Commands::Versions {
            project,
            asset,
            subset,
        } => {
            let store = open_store(&cfg)
                .await
                .unwrap_or_else(|e| fail_with(&host, setup_kind, e));
            let versions = inspect::list_versions(store.as_ref(), &project, &asset, &subset)
                .await
                .unwrap_or_else(|e| fail_with(&host, ErrorKind::Internal, e));
            if versions.is_empty() {
                println!("No versions of {}/{}/{}", project, asset, subset);
            }
            for doc in &versions {
                let pending = doc
                    .data
                    .get("pending")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let author = doc.data.get("author").and_then(|v| v.as_str()).unwrap_or("");
                println!(
                    "{}  {}{}",
                    doc.name,
                    author,
                    if pending { "  (pending)" } else { "" }
                );
            }
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn VersionStore>> {
    migrate::run_migrations(cfg).await?;
    let pool = db::connect(cfg).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

/// Report a terminal publish failure and exit with its kind's code.
fn fail(host: &dyn Host, err: PublishError) -> ! {
    host.signal_failure(&err);
    eprintln!("Error: {}", err);
    std::process::exit(err.exit_code());
}

fn fail_with(host: &dyn Host, kind: ErrorKind, err: anyhow::Error) -> ! {
    fail(host, PublishError::from_anyhow(kind, &err))
}

fn instance_label(session: &PublishSession, id: &str) -> String {
    session
        .instance(id)
        .map(|i| i.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn print_outcome(session: &PublishSession, outcome: &PublishOutcome) {
    println!("Session {} {}", outcome.session_id, outcome.state);
    for version in &outcome.integrated {
        println!(
            "  {} {}  [{}]",
            instance_label(session, &version.instance_id),
            version.name,
            version.representations.join(", ")
        );
    }
    if let Some(delegation) = &outcome.delegation {
        println!("  context dump: {}", delegation.context_dump.display());
        for job in &delegation.jobs {
            let target = job
                .instance_id
                .as_deref()
                .map(|id| instance_label(session, id))
                .unwrap_or_else(|| "session".to_string());
            println!(
                "  {} {:?} job {} ({})",
                job.contractor, job.kind, job.job_id, target
            );
        }
    }
}

fn print_report(report: &ResumeReport) {
    println!("Session {} {}", report.session_id, report.state);
    for item in &report.extracted {
        println!("  extracted {}", item);
    }
    for version in &report.integrated {
        println!(
            "  integrated {}  [{}]",
            version.name,
            version.representations.join(", ")
        );
    }
    for id in &report.skipped {
        println!("  already integrated {}", id);
    }
}
