//! Audit-gated ingestion: fetch, fingerprint, stage, audit, gate and build
//! marts, all inside one warehouse transaction per run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agip_core::{
    DatasetSpec, JoinSpec, MartSpec, MeasureKind, Run, SourceArtifact, StagingRow, TableRef,
    Verdict,
};
use agip_storage::{
    FetchError, HttpClientConfig, MemoryWarehouse, PgWarehouse, SchemeFetcher, SnapshotStore,
    SourceFetcher, Warehouse, WarehouseError, WarehouseTx,
};
use agip_transform::TransformError;
use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub mod audit;
pub mod export;
pub mod identity;
pub mod join;
pub mod ledger;
pub mod mart;
pub mod registry;
pub mod staging;

pub use audit::SingleAuditPolicy;
pub use join::JoinAuditPolicy;
pub use ledger::{list_recent_reports, MartSummary, RunReport};
pub use mart::{BuiltMart, GateDecision};
pub use registry::{AuditPolicy, ChangeDetection, ConfigError, PreparedDataset, Registry};

const DEFAULT_CRON: &str = "0 0 9 * * *";

/// Environment layer of the configuration. The registry file it points at
/// is the second layer.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub pipeline_file: PathBuf,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub export_parquet: bool,
    pub crons: Vec<String>,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            workspace_root: std::env::var("AGIP_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            pipeline_file: std::env::var("AGIP_PIPELINE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("pipeline.yaml")),
            data_dir: std::env::var("AGIP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/raw")),
            reports_dir: std::env::var("AGIP_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            http_timeout_secs: std::env::var("AGIP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            user_agent: std::env::var("AGIP_USER_AGENT")
                .unwrap_or_else(|_| concat!("agip/", env!("CARGO_PKG_VERSION")).to_string()),
            export_parquet: env_flag("AGIP_EXPORT_PARQUET"),
            crons: std::env::var("AGIP_CRON")
                .map(|v| {
                    v.split(';')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                })
                .ok()
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_CRON.to_string()]),
        }
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    fn under_root(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn pipeline_path(&self) -> PathBuf {
        self.under_root(&self.pipeline_file)
    }

    pub fn data_path(&self) -> PathBuf {
        self.under_root(&self.data_dir)
    }

    pub fn reports_path(&self) -> PathBuf {
        self.under_root(&self.reports_dir)
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Fatal faults. Data-quality anomalies are never errors; they are
/// recorded in the ledger and only close the mart gate.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fetching dataset `{dataset}`: {source}")]
    Transport {
        dataset: String,
        #[source]
        source: FetchError,
    },
    #[error("staging dataset `{dataset}`: {source}")]
    Transform {
        dataset: String,
        #[source]
        source: TransformError,
    },
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error(transparent)]
    Snapshot(#[from] anyhow::Error),
    #[error("mart `{mart}` needs staging table {table}, which does not exist")]
    MissingStaging { mart: String, table: TableRef },
}

/// What a committed run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub marts: Vec<BuiltMart>,
    pub report_dir: Option<PathBuf>,
    pub parquet_manifest: Option<PathBuf>,
}

/// Staging tables read during one run, keyed by dataset name.
type StagingCache = BTreeMap<String, Option<Vec<StagingRow>>>;

pub struct Pipeline<W, F> {
    registry: Registry,
    snapshots: SnapshotStore,
    warehouse: W,
    fetcher: F,
    reports_dir: Option<PathBuf>,
    export_parquet: bool,
}

impl<W: Warehouse, F: SourceFetcher> Pipeline<W, F> {
    pub fn new(registry: Registry, snapshots: SnapshotStore, warehouse: W, fetcher: F) -> Self {
        Self {
            registry,
            snapshots,
            warehouse,
            fetcher,
            reports_dir: None,
            export_parquet: false,
        }
    }

    /// Writes report files after each committed run, plus parquet mart
    /// snapshots when `export_parquet` is set.
    pub fn with_reports(mut self, reports_dir: PathBuf, export_parquet: bool) -> Self {
        self.reports_dir = Some(reports_dir);
        self.export_parquet = export_parquet;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub async fn run_once(&self) -> Result<RunOutcome, PipelineError> {
        self.run(Run::start()).await
    }

    /// One invocation. Everything is written in a single transaction that
    /// is rolled back on any fatal error.
    pub async fn run(&self, run: Run) -> Result<RunOutcome, PipelineError> {
        let span = info_span!("run", run_id = %run.run_id);
        async {
            info!(
                datasets = self.registry.datasets.len(),
                joins = self.registry.joins.len(),
                marts = self.registry.marts.len(),
                "run started"
            );
            let mut tx = self.warehouse.begin().await?;
            let (report, marts) = match self.run_in_tx(&mut tx, run).await {
                Ok(done) => done,
                Err(err) => {
                    error!(error = %err, "run aborted; rolling back");
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "rollback failed");
                    }
                    return Err(err);
                }
            };
            tx.commit().await?;
            info!(gate_open = report.gate_open, marts = marts.len(), "run committed");

            let mut outcome = RunOutcome {
                report,
                marts,
                report_dir: None,
                parquet_manifest: None,
            };
            self.publish(&mut outcome).await;
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Report files are derived from committed data; failing to write them
    /// does not undo the run.
    async fn publish(&self, outcome: &mut RunOutcome) {
        let Some(reports_dir) = &self.reports_dir else {
            return;
        };
        let run_dir = match ledger::write_report_files(reports_dir, &outcome.report).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!(error = %err, "writing run report failed");
                return;
            }
        };
        if self.export_parquet && outcome.report.gate_open && !outcome.marts.is_empty() {
            match export::export_marts(&run_dir, &outcome.marts) {
                Ok(manifest) => outcome.parquet_manifest = Some(manifest),
                Err(err) => warn!(error = %err, "parquet export failed"),
            }
        }
        outcome.report_dir = Some(run_dir);
    }

    async fn run_in_tx(
        &self,
        tx: &mut W::Tx,
        run: Run,
    ) -> Result<(RunReport, Vec<BuiltMart>), PipelineError> {
        tx.ensure_audit_tables().await?;

        for dataset in &self.registry.datasets {
            let span = info_span!("dataset", dataset = %dataset.spec.name);
            self.process_dataset(tx, run, dataset).instrument(span).await?;
        }

        let mut cache = StagingCache::new();
        for join in &self.registry.joins {
            let span = info_span!("join", join = %join.name);
            self.audit_join(tx, run, join, &mut cache).instrument(span).await?;
        }

        let gate = mart::evaluate_gate(tx, run.run_id).await?;
        let built = if gate.open {
            let mut built = Vec::new();
            for spec in &self.registry.marts {
                built.extend(self.build_mart(tx, spec, &mut cache).await?);
            }
            built
        } else {
            warn!(
                failing_single = gate.failing_single,
                failing_join = gate.failing_join,
                "mart gate closed; marts left untouched"
            );
            Vec::new()
        };

        let summaries = built
            .iter()
            .map(|m| MartSummary {
                mart: m.mart.clone(),
                table: m.table.to_string(),
                horizon_months: m.horizon_months,
                rows: m.rows.len() as u64,
            })
            .collect();
        let report = RunReport::collect(tx, run, gate, summaries).await?;
        Ok((report, built))
    }

    async fn fetch_snapshot(&self, spec: &DatasetSpec) -> Result<SourceArtifact, PipelineError> {
        let file_name = spec.source_file_name();
        let destination = self.snapshots.destination_for(&spec.name, &file_name);
        self.fetcher
            .fetch(&spec.source_url, &destination)
            .await
            .map_err(|source| PipelineError::Transport {
                dataset: spec.name.clone(),
                source,
            })?;
        let downloaded_at = Utc::now();
        let (fingerprint, byte_size) = SnapshotStore::fingerprint_file(&destination).await?;
        info!(bytes = byte_size, fingerprint = %fingerprint, "snapshot downloaded");
        Ok(SourceArtifact {
            source_url: spec.source_url.clone(),
            file_name,
            local_path: destination.display().to_string(),
            fingerprint,
            byte_size,
            downloaded_at,
        })
    }

    async fn process_dataset(
        &self,
        tx: &mut W::Tx,
        run: Run,
        dataset: &PreparedDataset,
    ) -> Result<(), PipelineError> {
        let spec = &dataset.spec;
        let batch = run.batch();
        let artifact = self.fetch_snapshot(spec).await?;
        let identity = identity::check(tx, &spec.name, &artifact.fingerprint).await?;

        let record = if identity.needs_restage(self.registry.change_detection) {
            let output = staging::stage_dataset(tx, dataset, batch, &artifact).await?;
            let metrics = audit::compute_metrics(&output);
            let (verdict, reason) = self.registry.policy.single.judge(&metrics);
            audit::audit_record(spec, batch, &artifact, &identity, Some(metrics), verdict, reason)
        } else {
            audit::audit_record(
                spec,
                batch,
                &artifact,
                &identity,
                None,
                Verdict::Skip,
                "source unchanged since last accepted snapshot; staging kept".to_string(),
            )
        };
        tx.append_single_audit(&record).await?;

        if record.verdict.is_failing() {
            warn!(verdict = %record.verdict, reason = %record.reason, "dataset audited");
        } else {
            info!(verdict = %record.verdict, hash = %identity.status, "dataset audited");
        }
        Ok(())
    }

    async fn staging_rows<'c>(
        &self,
        tx: &mut W::Tx,
        cache: &'c mut StagingCache,
        dataset: &str,
    ) -> Result<Option<&'c Vec<StagingRow>>, PipelineError> {
        if !cache.contains_key(dataset) {
            let rows = match self.registry.dataset(dataset) {
                Some(prepared) => {
                    tx.load_staging_table(
                        &prepared.spec.staging_table,
                        prepared.program.layout(),
                    )
                    .await?
                }
                None => None,
            };
            cache.insert(dataset.to_string(), rows);
        }
        Ok(cache.get(dataset).and_then(Option::as_ref))
    }

    async fn audit_join(
        &self,
        tx: &mut W::Tx,
        run: Run,
        join: &JoinSpec,
        cache: &mut StagingCache,
    ) -> Result<(), PipelineError> {
        let batch = run.batch();
        let left_missing = self.staging_rows(tx, cache, &join.left_dataset).await?.is_none();
        self.staging_rows(tx, cache, &join.right_dataset).await?;

        let record = match (
            cache.get(&join.left_dataset).and_then(Option::as_ref),
            cache.get(&join.right_dataset).and_then(Option::as_ref),
        ) {
            (Some(left), Some(right)) => {
                let metrics = join::compute(join.kind, left, right);
                let (verdict, reason) = self.registry.policy.join.judge(&metrics);
                join::audit_record(join, batch, Some(metrics), verdict, reason)
            }
            _ => {
                let missing = if left_missing {
                    &join.left_staging
                } else {
                    &join.right_staging
                };
                join::audit_record(
                    join,
                    batch,
                    None,
                    Verdict::Fail,
                    format!("FAIL: staging table {missing} does not exist"),
                )
            }
        };
        tx.append_join_audit(&record).await?;

        if record.verdict.is_failing() {
            warn!(verdict = %record.verdict, reason = %record.reason, "join audited");
        } else {
            info!(verdict = %record.verdict, "join audited");
        }
        Ok(())
    }

    async fn build_mart(
        &self,
        tx: &mut W::Tx,
        spec: &MartSpec,
        cache: &mut StagingCache,
    ) -> Result<Vec<BuiltMart>, PipelineError> {
        let mut needed = vec![spec.base_dataset.as_str()];
        for measure in &spec.measures {
            match &measure.kind {
                MeasureKind::Average { dataset } => needed.push(dataset),
                MeasureKind::YieldPct { income, price, .. } => {
                    needed.push(income);
                    needed.push(price);
                }
            }
        }

        let mut tables: BTreeMap<String, Vec<StagingRow>> = BTreeMap::new();
        for name in needed {
            if tables.contains_key(name) {
                continue;
            }
            let Some(rows) = self.staging_rows(tx, cache, name).await? else {
                let table = self
                    .registry
                    .dataset(name)
                    .map(|d| d.spec.staging_table.clone())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!("mart `{}` references `{name}`", spec.name))
                    })?;
                return Err(PipelineError::MissingStaging {
                    mart: spec.name.clone(),
                    table,
                });
            };
            tables.insert(name.to_string(), rows.clone());
        }

        let layout = spec.layout();
        let mut built = Vec::with_capacity(spec.horizons_months.len());
        for &horizon_months in &spec.horizons_months {
            let table = spec
                .table_for(horizon_months)
                .map_err(|source| ConfigError::Ident {
                    field: format!("marts.{}.table_template", spec.name),
                    source,
                })?;
            let rows = mart::build_rows(spec, &tables, horizon_months);
            let written = tx.replace_mart_table(&table, &layout, &rows).await?;
            info!(mart = %spec.name, table = %table, horizon_months, rows = written, "mart rebuilt");
            built.push(BuiltMart {
                mart: spec.name.clone(),
                table,
                horizon_months,
                layout: layout.clone(),
                rows,
            });
        }
        Ok(built)
    }
}

/// Registers one job per cron expression; every trigger is a full run.
/// A failed run is logged and left for the next trigger.
pub async fn build_scheduler<W, F>(
    pipeline: Arc<Pipeline<W, F>>,
    crons: &[String],
) -> anyhow::Result<JobScheduler>
where
    W: Warehouse + 'static,
    F: SourceFetcher + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in crons {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(outcome) => info!(
                        run_id = %outcome.report.run.run_id,
                        gate_open = outcome.report.gate_open,
                        "scheduled run finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "scheduled pipeline run");
    }
    Ok(sched)
}

/// Loads both configuration layers and builds the production fetcher.
pub fn load_from_env() -> anyhow::Result<(IngestConfig, Registry, SchemeFetcher)> {
    let config = IngestConfig::from_env();
    let registry = Registry::load(&config.pipeline_path())?;
    let fetcher = SchemeFetcher::new(config.http_client())?;
    Ok((config, registry, fetcher))
}

pub async fn postgres_pipeline_from_env() -> anyhow::Result<(IngestConfig, Pipeline<PgWarehouse, SchemeFetcher>)> {
    let (config, registry, fetcher) = load_from_env()?;
    let database_url = config.require_database_url()?;
    let warehouse = PgWarehouse::connect(database_url, registry.audit_tables.clone())
        .await
        .context("connecting to the warehouse")?;
    let pipeline = Pipeline::new(registry, SnapshotStore::new(config.data_path()), warehouse, fetcher)
        .with_reports(config.reports_path(), config.export_parquet);
    Ok((config, pipeline))
}

/// One run against Postgres, or against an in-process warehouse when
/// `dry_run` is set (nothing is persisted beyond snapshots and reports).
pub async fn run_once_from_env(dry_run: bool) -> anyhow::Result<RunOutcome> {
    if dry_run {
        let (config, registry, fetcher) = load_from_env()?;
        let pipeline = Pipeline::new(
            registry,
            SnapshotStore::new(config.data_path()),
            MemoryWarehouse::new(),
            fetcher,
        )
        .with_reports(config.reports_path(), config.export_parquet);
        return Ok(pipeline.run_once().await?);
    }
    let (_, pipeline) = postgres_pipeline_from_env().await?;
    Ok(pipeline.run_once().await?)
}
