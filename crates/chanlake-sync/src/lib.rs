//! Pipeline orchestration: archive load, transform DAG, validation, snapshots,
//! run reports, and the cron scheduler.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chanlake_capture::{capture_into_archive, CaptureContext, CaptureSource, CaptureSummary};
use chanlake_storage::{ArchiveStore, LoadTarget, Warehouse};
use chrono::{NaiveDate, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub mod config;
pub mod dag;
pub mod export;
pub mod loader;
pub mod marts;
pub mod report;
pub mod staging;
pub mod validation;

pub use config::SyncConfig;
pub use dag::{Catalog, Relation, StepReport, TransformDag, TransformStep};
pub use export::{ParquetManifest, ParquetManifestFile};
pub use loader::{load_detections, load_messages, LoadFailure, LoadReport};
pub use marts::TransformContext;
pub use report::{RunSummary, TransformReport};
pub use validation::{CheckDef, CheckKind, CheckResult, ValidationReport};

pub const CRATE_NAME: &str = "chanlake-sync";

pub const LOADER_LOCK: &str = "loader";
pub const TRANSFORM_LOCK: &str = "transform";

#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub messages: LoadReport,
    pub detections: LoadReport,
}

pub struct SyncPipeline {
    config: SyncConfig,
    archive: ArchiveStore,
    warehouse: Warehouse,
    dag: TransformDag,
    checks: Vec<CheckDef>,
}

impl SyncPipeline {
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let warehouse = Warehouse::connect(&config.database_url)
            .await
            .with_context(|| format!("opening warehouse {}", config.database_url))?;
        Self::with_warehouse(config, warehouse)
    }

    pub fn with_warehouse(config: SyncConfig, warehouse: Warehouse) -> Result<Self> {
        Ok(Self {
            archive: ArchiveStore::new(config.archive_dir.clone()),
            warehouse,
            dag: TransformDag::standard(),
            checks: validation::embedded_checks()?,
            config,
        })
    }

    pub fn with_checks(mut self, checks: Vec<CheckDef>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_dag(mut self, dag: TransformDag) -> Self {
        self.dag = dag;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn transform_context(&self) -> TransformContext {
        TransformContext::today_utc(self.config.date_spine_years)
    }

    async fn locked<T>(&self, name: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        let lock = self
            .warehouse
            .acquire_lock(name, self.config.lock_stale_after)
            .await
            .with_context(|| format!("acquiring `{name}` run lock"))?;
        let result = work.await;
        let released = self.warehouse.release_lock(&lock).await;
        let value = result?;
        released.with_context(|| format!("releasing `{name}` run lock"))?;
        Ok(value)
    }

    /// Load new message units and detection sidecars under the loader lock.
    pub async fn load(&self) -> Result<LoadOutcome> {
        self.locked(LOADER_LOCK, async {
            let now = Utc::now();
            let messages = load_messages(&self.archive, &self.warehouse, now).await?;
            let detections = load_detections(&self.archive, &self.warehouse, now).await?;
            Ok::<_, anyhow::Error>(LoadOutcome {
                messages,
                detections,
            })
        })
        .await
    }

    /// Rebuild every staged, dimension, and fact relation under the transform lock.
    pub async fn transform(&self, ctx: &TransformContext) -> Result<TransformReport> {
        self.locked(TRANSFORM_LOCK, async {
            let raw_messages = self
                .warehouse
                .raw_messages()
                .await
                .context("reading raw messages")?;
            let raw_detections = self
                .warehouse
                .raw_detections()
                .await
                .context("reading raw detections")?;

            let mut catalog = Catalog::with_sources(raw_messages, raw_detections);
            let steps = self.dag.run(&mut catalog, ctx)?;
            for step in &steps {
                if let Some(table) = catalog.get(&step.relation).and_then(Relation::to_table) {
                    self.warehouse
                        .replace_relation(&table)
                        .await
                        .with_context(|| format!("writing relation {}", step.relation))?;
                }
            }
            Ok::<_, anyhow::Error>(TransformReport {
                today: ctx.today,
                steps,
            })
        })
        .await
    }

    pub async fn validate(&self) -> Result<ValidationReport> {
        validation::validate_warehouse(&self.warehouse, &self.checks).await
    }

    /// Snapshot the mart relations to `{reports_dir}/{run_id}/snapshots/`.
    pub async fn export(&self, run_id: Uuid) -> Result<PathBuf> {
        export::export_marts(&self.warehouse, &report::run_dir(&self.config.reports_dir, run_id))
            .await
    }

    /// Load, transform, validate, then write reports and snapshots. Failed checks
    /// are reported in the summary rather than returned as an error.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pipeline_run", %run_id);

        async {
            let loaded = self.load().await?;
            let transform = self.transform(&self.transform_context()).await?;
            let validation = self.validate().await?;
            let manifest = self.export(run_id).await?;

            let reports_dir = report::run_dir(&self.config.reports_dir, run_id);
            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                messages: loaded.messages,
                detections: loaded.detections,
                transform,
                validation,
                reports_dir: reports_dir.display().to_string(),
                parquet_manifest: Some(manifest.display().to_string()),
            };
            report::write_run_reports(&reports_dir, &summary).await?;
            info!(
                loaded = summary.messages.loaded,
                checks_failed = summary.validation.failed_names().len(),
                "pipeline run finished"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }
}

pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    passed = summary.succeeded(),
                    "scheduled pipeline run finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled pipeline run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Capture every configured channel into the archive. The warehouse is not opened.
pub async fn run_capture(config: &SyncConfig, source: &dyn CaptureSource) -> Result<CaptureSummary> {
    let archive = ArchiveStore::new(config.archive_dir.clone());
    capture_into_archive(source, &archive, &CaptureContext::now(), &config.channels)
        .await
        .with_context(|| format!("capturing from {}", source.source_id()))
}

pub async fn run_load(config: SyncConfig) -> Result<LoadOutcome> {
    SyncPipeline::open(config).await?.load().await
}

/// Rebuild relations with the date spine ending at `today`, or at today in UTC.
pub async fn run_transform(config: SyncConfig, today: Option<NaiveDate>) -> Result<TransformReport> {
    let pipeline = SyncPipeline::open(config).await?;
    let ctx = match today {
        Some(day) => TransformContext::new(day, pipeline.config().date_spine_years),
        None => pipeline.transform_context(),
    };
    pipeline.transform(&ctx).await
}

/// Run the embedded checks, or the checks declared in `checks_file`.
pub async fn run_validate(config: SyncConfig, checks_file: Option<&Path>) -> Result<ValidationReport> {
    let mut pipeline = SyncPipeline::open(config).await?;
    if let Some(path) = checks_file {
        pipeline = pipeline.with_checks(validation::load_checks(path)?);
    }
    pipeline.validate().await
}

pub async fn run_pipeline(config: SyncConfig) -> Result<RunSummary> {
    SyncPipeline::open(config).await?.run_once().await
}

pub async fn run_export(config: SyncConfig) -> Result<PathBuf> {
    SyncPipeline::open(config).await?.export(Uuid::new_v4()).await
}

/// Run the scheduler until Ctrl-C. Returns immediately when scheduling is disabled.
pub async fn run_scheduler(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let cron = pipeline.config().sync_cron.clone();
    let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
        info!("scheduler disabled; set CHANLAKE_SCHEDULER_ENABLED=true to enable");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
