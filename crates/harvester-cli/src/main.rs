use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use harvester_core::Summary;
use harvester_storage::PgStore;
use harvester_sync::{SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "harvester")]
#[command(about = "PLU metadata harvester")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Directory holding sources.yaml and the source inputs.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Default, Args)]
struct PassArgs {
    /// Limit the pass to one source id.
    #[arg(long)]
    source: Option<String>,

    /// Map and reconcile without writing to the store or the index.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Map source inputs into the relational store.
    Import(PassArgs),
    /// Reconcile stored buckets into the search index.
    Reconcile(PassArgs),
    /// Import, then reconcile.
    Run(PassArgs),
    /// Apply database migrations.
    Migrate,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("harvester=info,info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

fn report(summary: &Summary) {
    println!("{}", summary.log_line());
}

fn ensure_ok(summaries: &[&Summary]) -> Result<()> {
    let failed = summaries
        .iter()
        .filter(|s| s.is_failed())
        .map(|s| s.source_id.as_str())
        .collect::<Vec<_>>();
    if !failed.is_empty() {
        bail!("job failed for: {}", failed.join(", "));
    }
    Ok(())
}

async fn pipeline(workspace: Option<PathBuf>, args: &PassArgs) -> Result<SyncPipeline> {
    let mut config = SyncConfig::from_env();
    if let Some(workspace) = workspace {
        config.workspace_root = workspace;
    }
    config.dry_run |= args.dry_run;
    SyncPipeline::connect(config).await
}

async fn import(pipeline: &SyncPipeline, only: Option<&str>) -> Result<Vec<Summary>> {
    let registry = pipeline.load_source_registry().await?;
    let sources = match only {
        Some(id) => vec![registry.find(id).with_context(|| format!("unknown source `{id}`"))?],
        None => registry.enabled().collect(),
    };
    let harvest_time = Utc::now();
    let mut summaries = Vec::with_capacity(sources.len());
    for source in sources {
        summaries.push(pipeline.import_source(source, harvest_time).await?);
    }
    Ok(summaries)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command.unwrap_or(Commands::Run(PassArgs::default())) {
        Commands::Import(args) => {
            let pipeline = pipeline(cli.workspace, &args).await?;
            let summaries = import(&pipeline, args.source.as_deref()).await?;
            summaries.iter().for_each(report);
            ensure_ok(&summaries.iter().collect::<Vec<_>>())?;
        }
        Commands::Reconcile(args) => {
            let pipeline = pipeline(cli.workspace, &args).await?;
            let summary = pipeline.reconcile(args.source.as_deref()).await?;
            report(&summary);
            ensure_ok(&[&summary])?;
        }
        Commands::Run(args) => {
            let pipeline = pipeline(cli.workspace, &args).await?;
            let run = pipeline.run(args.source.as_deref()).await?;
            run.imports.iter().for_each(report);
            report(&run.reconcile);
            info!(run_id = %run.run_id, dry_run = run.dry_run, "run complete");
            if run.is_failed() {
                bail!("run {} failed", run.run_id);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config.database_url.context("DATABASE_URL is required for migrate")?;
            let store = PgStore::connect(&url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn pass_flags_parse() {
        let cli = Cli::try_parse_from(["harvester", "--log-json", "reconcile", "--source", "csw-hh", "--dry-run"]).unwrap();
        assert!(cli.log_json);
        match cli.command {
            Some(Commands::Reconcile(args)) => {
                assert_eq!(args.source.as_deref(), Some("csw-hh"));
                assert!(args.dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn failed_summaries_fail_the_job() {
        let ok = Summary::new("csw-hh");
        let mut broken = Summary::new("wfs-xplan-hh");
        broken.database_error("row count mismatch");
        let err = ensure_ok(&[&ok, &broken]).unwrap_err();
        assert!(err.to_string().contains("wfs-xplan-hh"));
        assert!(ensure_ok(&[&ok]).is_ok());
    }
}
