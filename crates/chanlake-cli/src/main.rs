use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chanlake_capture::ExportDirSource;
use chanlake_storage::Warehouse;
use chanlake_sync::{report, SyncConfig, SyncPipeline, ValidationReport};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chanlake")]
#[command(about = "Channel message archive and warehouse pipeline")]
struct Cli {
    #[command(flatten)]
    paths: PathOverrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Overrides for the environment-driven [`SyncConfig`].
#[derive(Debug, Args)]
struct PathOverrides {
    #[arg(long, global = true)]
    archive_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Archive messages from a directory of channel exports.
    Capture {
        #[arg(long)]
        export_dir: PathBuf,
        /// Channel to capture; repeat for several. Defaults to CHANLAKE_CHANNELS.
        #[arg(long = "channel")]
        channels: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Create the warehouse schema.
    Migrate,
    /// Load new archive units into the raw tables.
    Load,
    /// Rebuild staged, dimension and fact relations.
    Transform {
        /// Reference date for the date spine (YYYY-MM-DD); defaults to today in UTC.
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Run the data checks against the current relations.
    Validate {
        #[arg(long)]
        checks: Option<PathBuf>,
    },
    /// Load, transform, validate, export and write run reports.
    Run,
    /// Write parquet snapshots of the mart relations.
    Export,
    /// Run the pipeline on CHANLAKE_SYNC_CRON until interrupted.
    Schedule,
    /// Summarize recent runs from the reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

impl PathOverrides {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(dir) = &self.archive_dir {
            config.archive_dir = dir.clone();
        }
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(dir) = &self.reports_dir {
            config.reports_dir = dir.clone();
        }
        config
    }
}

fn print_validation(report: &ValidationReport) {
    for result in &report.results {
        let status = if result.passed { "pass" } else { "FAIL" };
        match &result.error {
            Some(err) => println!("{status} {} ({err})", result.name),
            None => println!("{status} {} failing_rows={}", result.name, result.failing_rows),
        }
    }
}

fn validation_exit(report: &ValidationReport) -> ExitCode {
    if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = cli.paths.apply(SyncConfig::from_env());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Capture {
            export_dir,
            channels,
            limit,
        } => {
            if !channels.is_empty() {
                config.channels = channels;
            }
            let mut source = ExportDirSource::new(export_dir);
            if let Some(limit) = limit {
                source = source.with_limit(limit);
            }
            let summary = chanlake_sync::run_capture(&config, &source).await?;
            for channel in &summary.channels {
                println!(
                    "{}: written={} already_present={} media={} failures={}",
                    channel.channel,
                    channel.messages_written,
                    channel.messages_already_present,
                    channel.media_written,
                    channel.failures.len()
                );
            }
            println!(
                "capture complete: run_id={} written={}",
                summary.run_id,
                summary.messages_written()
            );
        }
        Commands::Migrate => {
            let warehouse = Warehouse::connect(&config.database_url)
                .await
                .with_context(|| format!("opening warehouse {}", config.database_url))?;
            warehouse.migrate().await.context("applying schema")?;
            println!("schema applied: {}", config.database_url);
        }
        Commands::Load => {
            let outcome = chanlake_sync::run_load(config).await?;
            println!(
                "load complete: messages loaded={} skipped={} duplicates={} failed={}; detection sidecars loaded={} failed={}",
                outcome.messages.loaded,
                outcome.messages.skipped,
                outcome.messages.duplicates,
                outcome.messages.failures.len(),
                outcome.detections.loaded,
                outcome.detections.failures.len()
            );
            for failure in outcome.messages.failures.iter().chain(&outcome.detections.failures) {
                eprintln!("skipped {}: {}", failure.unit_key, failure.reason);
            }
        }
        Commands::Transform { today } => {
            let report = chanlake_sync::run_transform(config, today).await?;
            for step in &report.steps {
                println!("{}: {} rows", step.relation, step.rows);
            }
            println!("nulled casts: {}", report.coercion_failures());
        }
        Commands::Validate { checks } => {
            let report = chanlake_sync::run_validate(config, checks.as_deref()).await?;
            print_validation(&report);
            return Ok(validation_exit(&report));
        }
        Commands::Run => {
            let summary = chanlake_sync::run_pipeline(config).await?;
            println!(
                "run complete: run_id={} loaded={} failed_checks={} reports={}",
                summary.run_id,
                summary.messages.loaded,
                summary.validation.failed_names().len(),
                summary.reports_dir
            );
            print_validation(&summary.validation);
            return Ok(validation_exit(&summary.validation));
        }
        Commands::Export => {
            let manifest = chanlake_sync::run_export(config).await?;
            println!("parquet manifest: {}", manifest.display());
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::open(config).await?);
            chanlake_sync::run_scheduler(pipeline).await?;
        }
        Commands::Report { runs } => {
            print!("{}", report::recent_runs_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
