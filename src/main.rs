//! ConfigFlow CLI
//!
//! ```bash
//! # Run the pipeline over a directory of YAML/JSON files
//! configflow run --source ./config --templates ./templates --environment prod
//!
//! # Plan only
//! configflow run --source ./config --templates ./templates --dry-run
//!
//! # Verify a stored evidence chain without re-running
//! configflow verify 3f0c...
//!
//! # Look up stored artifacts
//! configflow artifacts --type file --tag web
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use configflow::artifacts::{ArtifactManager, ArtifactType};
use configflow::document::Mapping;
use configflow::evidence::EvidenceStore;
use configflow::governance::RuleSet;
use configflow::renderer::Template;
use configflow::validator::Schema;
use configflow::{
    CancellationToken, Environment, MergeStrategy, Pipeline, Settings, SourceRef,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "configflow")]
#[command(version)]
#[command(about = "Load, govern, render and apply configuration with an evidence chain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to $CONFIGFLOW_CONFIG, then ./configflow.*)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long = "json", alias = "json-logs", global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run {
        /// Configuration directory; repeat to layer several in order
        #[arg(long, short)]
        source: Vec<PathBuf>,

        /// Git repository to read instead of a directory
        #[arg(long, conflicts_with = "source", requires = "reference")]
        git: Option<PathBuf>,

        /// Branch, tag or commit of `--git`
        #[arg(long = "ref")]
        reference: Option<String>,

        /// Subdirectory inside the git snapshot
        #[arg(long, requires = "git")]
        subdir: Option<String>,

        /// Environment name used by governance rules
        #[arg(long, short, default_value = "default")]
        environment: String,

        /// YAML/JSON environment description (hosts, working dir, variables)
        #[arg(long)]
        environment_file: Option<PathBuf>,

        /// Values deep-merged over the document for this environment
        #[arg(long)]
        overlay: Option<PathBuf>,

        #[arg(long)]
        schema: Option<PathBuf>,

        /// Governance rule set
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Directory of *.hbs templates
        #[arg(long, short)]
        templates: Option<PathBuf>,

        /// Conflict strategy: error, first, last, newest
        #[arg(long)]
        strategy: Option<MergeStrategy>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        continue_on_warning: bool,

        #[arg(long)]
        remote_concurrency: Option<usize>,
    },

    /// Verify a stored evidence chain
    Verify {
        chain_id: Uuid,
    },

    /// List stored evidence chains
    Chains,

    /// Look up stored artifacts
    Artifacts {
        #[arg(long)]
        id: Option<Uuid>,

        #[arg(long = "type")]
        artifact_type: Option<ArtifactType>,

        #[arg(long)]
        tag: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let settings = match &cli.config {
        Some(path) => Settings::load_with(Some(path.as_path()))?,
        None => Settings::load()?,
    };

    match cli.command {
        Commands::Run {
            source,
            git,
            reference,
            subdir,
            environment,
            environment_file,
            overlay,
            schema,
            rules,
            templates,
            strategy,
            dry_run,
            continue_on_warning,
            remote_concurrency,
        } => {
            let source = source_ref(source, git, reference, subdir)?;

            let env = match &environment_file {
                Some(path) => {
                    let mut env = Environment::load(path).await?;
                    if env.name.is_empty() {
                        env.name = environment;
                    }
                    env
                }
                None => Environment::new(environment),
            };

            let mut options = settings.pipeline.clone();
            if let Some(strategy) = strategy {
                options.merge_strategy = strategy;
            }
            if let Some(n) = remote_concurrency {
                options.remote_concurrency = n;
            }
            options.dry_run |= dry_run;
            options.continue_on_warning |= continue_on_warning;
            if let Some(path) = &overlay {
                options.environment_overlay = Some(read_mapping(path).await?);
            }

            let mut pipeline = Pipeline::from_settings(&settings).await?;
            if let Some(path) = &schema {
                pipeline = pipeline.with_schema(Schema::load(path).await?);
            }
            if let Some(path) = &rules {
                pipeline = pipeline.with_rules(RuleSet::load(path).await?.rules);
            }
            if let Some(dir) = &templates {
                pipeline = pipeline.with_templates(Template::load_dir(dir).await?);
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    on_signal.cancel();
                }
            });

            let run = pipeline.run(&source, &env, options, cancel).await;
            println!("{}", serde_json::to_string_pretty(&run.summary())?);
            Ok(if run.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Verify { chain_id } => {
            let store = evidence_store(&settings).await?;
            let verification = store.verify(chain_id).await?;
            println!("{}", serde_json::to_string_pretty(&verification)?);
            Ok(if verification.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Chains => {
            let store = evidence_store(&settings).await?;
            println!("{}", serde_json::to_string_pretty(&store.list().await)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Artifacts {
            id,
            artifact_type,
            tag,
        } => {
            let dir = settings
                .storage
                .artifact_dir
                .as_ref()
                .context("storage.artifact_dir is not configured")?;
            let manager = ArtifactManager::open(dir.clone()).await?;

            let mut found = match (id, artifact_type) {
                (Some(id), _) => manager.get(id).await.into_iter().collect(),
                (None, Some(t)) => manager.by_type(t).await,
                (None, None) => match &tag {
                    Some(tag) => manager.by_tag(tag).await,
                    None => manager.list().await,
                },
            };
            if let Some(tag) = &tag {
                found.retain(|a| a.tags.contains(tag));
            }
            if let Some(t) = artifact_type {
                found.retain(|a| a.artifact_type == t);
            }

            let listing: Vec<_> = found
                .iter()
                .map(|a| {
                    json!({
                        "id": a.id,
                        "name": a.name,
                        "type": a.artifact_type,
                        "tags": a.tags,
                        "contentHash": a.content_hash,
                        "hashValid": a.verify_hash(),
                        "runId": a.run_id,
                        "createdAt": a.created_at,
                    })
                })
                .collect();
            info!("Found {} artifacts", listing.len());
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Initialize tracing with structured logging
fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,configflow=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

fn source_ref(
    dirs: Vec<PathBuf>,
    git: Option<PathBuf>,
    reference: Option<String>,
    subdir: Option<String>,
) -> anyhow::Result<SourceRef> {
    if let Some(repository) = git {
        let reference = reference.context("--git requires --ref")?;
        return Ok(SourceRef::Git {
            repository,
            reference,
            subdir,
            ignore: Vec::new(),
        });
    }
    let mut sources: Vec<SourceRef> = dirs.into_iter().map(SourceRef::directory).collect();
    match sources.len() {
        0 => anyhow::bail!("provide --source or --git"),
        1 => Ok(sources.remove(0)),
        _ => Ok(SourceRef::Layered { sources }),
    }
}

async fn read_mapping(path: &Path) -> anyhow::Result<Mapping> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("invalid overlay {}", path.display()))
}

async fn evidence_store(settings: &Settings) -> anyhow::Result<EvidenceStore> {
    let dir = settings
        .storage
        .evidence_dir
        .as_ref()
        .context("storage.evidence_dir is not configured")?;
    Ok(EvidenceStore::open(dir.clone()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_json_flag_and_alias() {
        let cli = Cli::try_parse_from(["configflow", "--json", "chains"]).unwrap();
        assert!(cli.json_logs);
        let cli = Cli::try_parse_from(["configflow", "chains", "--json-logs"]).unwrap();
        assert!(cli.json_logs);
        let cli = Cli::try_parse_from(["configflow", "chains"]).unwrap();
        assert!(!cli.json_logs);
    }

    #[test]
    fn test_single_source_is_not_layered() {
        let source = source_ref(vec![PathBuf::from("/etc/app")], None, None, None).unwrap();
        assert_eq!(source, SourceRef::directory("/etc/app"));
        assert!(source_ref(Vec::new(), None, None, None).is_err());
    }
}
