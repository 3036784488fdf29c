use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use agip_core::{
    FingerprintStatus, Ident, SingleAuditMetrics, SingleAuditRecord, TableRef, Verdict,
};
use agip_ingest::{ConfigError, Pipeline, PipelineError, Registry};
use agip_storage::{
    write_atomically, FetchError, MemoryWarehouse, SnapshotStore, SourceFetcher, Warehouse,
    WarehouseTx,
};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

const ZHVI_URL: &str = "https://example.test/Metro_zhvi.csv";
const ZORI_URL: &str = "https://example.test/Metro_zori.csv";

const ZHVI: &str = "\
RegionID,SizeRank,RegionName,RegionType,StateName,2023-11-30,2023-12-31,2024-01-31
102001,0,United States,country,,340000,345000,350000
394913,1,\"New York, NY\",msa,NY,640000,645000,650000
753899,2,\"Los Angeles, CA\",msa,CA,900000,910000,920000
";

const ZORI: &str = "\
RegionID,SizeRank,RegionName,RegionType,StateName,2023-11-30,2023-12-31,2024-01-31
102001,0,United States,country,,1900,1950,2000
394913,1,\"New York, NY\",msa,NY,2500,2550,2600
753899,2,\"Los Angeles, CA\",msa,CA,3000,3050,3100
";

const ZORI_ALL_NULL: &str = "\
RegionID,SizeRank,RegionName,RegionType,StateName,2023-11-30,2023-12-31,2024-01-31
102001,0,United States,country,,,,
394913,1,\"New York, NY\",msa,NY,NaN,NaN,NaN
753899,2,\"Los Angeles, CA\",msa,CA,,,
";

const REGISTRY: &str = r#"
change_detection: skip_unchanged
renames:
  - { from: RegionID, to: region_id }
  - { from: SizeRank, to: size_rank }
  - { from: RegionName, to: region_name }
  - { from: StateName, to: state_name }
datasets:
  - name: zhvi
    source_url: "https://example.test/Metro_zhvi.csv"
    raw_table: raw_zillow_zhvi
    staging_table: stg_zillow_zhvi
    grain: [region_id, date]
    metric_column: home_prices
    coercion: { kind: decimal, scale: 2 }
  - name: zori
    source_url: "https://example.test/Metro_zori.csv"
    raw_table: raw_zillow_zori
    staging_table: stg_zillow_zori
    grain: [region_id, date]
    metric_column: rent_prices
    coercion: { kind: decimal, scale: 2 }
joins:
  - { name: zhvi_x_zori, left: zhvi, right: zori }
marts:
  - name: state_date_avgs
    table_template: "mart_us_previous_{horizon}M_state_date_avgs"
    horizons_months: [1, 12]
    base: zhvi
    group_by: state_name
    measures:
      - { output: avg_home_price, kind: average, dataset: zhvi }
      - { output: avg_rent, kind: average, dataset: zori }
      - { output: gross_yield_pct, kind: yield_pct, income: zori, price: zhvi, periods_per_year: 12 }
"#;

/// Serves fixed bodies per URL; unknown URLs answer 404.
#[derive(Default)]
struct StaticFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    fn with(bodies: &[(&str, &str)]) -> Self {
        let fetcher = Self::default();
        for (url, body) in bodies {
            fetcher.set(url, body);
        }
        fetcher
    }

    fn set(&self, url: &str, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.as_bytes().to_vec());
    }

    fn remove(&self, url: &str) {
        self.bodies.lock().unwrap().remove(url);
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self.bodies.lock().unwrap().get(url).cloned();
        let Some(body) = body else {
            return Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            });
        };
        write_atomically(destination, &body)
            .await
            .map_err(|source| FetchError::Io {
                action: "writing",
                path: destination.to_path_buf(),
                source,
            })
    }
}

struct Harness {
    _dir: TempDir,
    pipeline: Pipeline<MemoryWarehouse, StaticFetcher>,
    warehouse: MemoryWarehouse,
}

fn harness(yaml: &str, fetcher: StaticFetcher) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::from_yaml_str(yaml).unwrap();
    let warehouse = MemoryWarehouse::new();
    let pipeline = Pipeline::new(
        registry,
        SnapshotStore::new(dir.path().join("raw")),
        warehouse.clone(),
        fetcher,
    )
    .with_reports(dir.path().join("reports"), true);
    Harness {
        _dir: dir,
        pipeline,
        warehouse,
    }
}

fn clean_fetcher() -> StaticFetcher {
    StaticFetcher::with(&[(ZHVI_URL, ZHVI), (ZORI_URL, ZORI)])
}

fn mart_table(horizon: u32) -> TableRef {
    TableRef::new(
        Ident::new("real_estate").unwrap(),
        Ident::new(format!("mart_us_previous_{horizon}M_state_date_avgs")).unwrap(),
    )
}

#[tokio::test]
async fn clean_run_audits_every_dataset_and_builds_every_horizon() {
    let h = harness(REGISTRY, clean_fetcher());
    let outcome = h.pipeline.run_once().await.unwrap();

    let report = &outcome.report;
    assert_eq!(report.single.len(), 2);
    assert!(report.single.iter().all(|r| r.verdict == Verdict::Pass));
    assert!(report
        .single
        .iter()
        .all(|r| r.fingerprint_status == FingerprintStatus::New && r.fingerprint_detail == "no_prior_hash"));
    assert!(report.single.iter().all(|r| r.run_id == report.run.run_id));
    assert_ne!(report.single[0].batch_id, report.single[1].batch_id);
    assert_eq!(report.joins.len(), 1);
    assert_eq!(report.joins[0].verdict, Verdict::Pass);
    let join = report.joins[0].metrics.as_ref().unwrap();
    assert_eq!(join.base_rows, 9);
    assert_eq!(join.row_preservation_delta, 0);
    assert_eq!(join.fanout_dupes, 0);
    assert!(report.gate_open);

    let state = h.warehouse.snapshot().await;
    let one_month = &state.marts[&mart_table(1)];
    let twelve_months = &state.marts[&mart_table(12)];
    // The country row has no state and is left out of the state marts.
    assert_eq!(one_month.len(), 2);
    assert_eq!(twelve_months.len(), 6);

    let ny = one_month.iter().find(|r| r.group == "NY").unwrap();
    assert_eq!(ny.member_count, 1);
    assert_eq!(ny.measures[0], Some(650000.0));
    assert_eq!(ny.measures[1], Some(2600.0));
    assert!((ny.measures[2].unwrap() - 4.8).abs() < 1e-9);

    let raw = &state.raw[&TableRef::new(
        Ident::new("real_estate").unwrap(),
        Ident::new("raw_zillow_zhvi").unwrap(),
    )];
    assert_eq!(raw.run_id, report.run.run_id);
    assert_eq!(raw.snapshot.rows.len(), 3);

    let report_dir = outcome.report_dir.unwrap();
    assert!(report_dir.join("run_summary.md").exists());
    assert!(report_dir.join("audits.json").exists());
    assert!(outcome.parquet_manifest.unwrap().exists());
}

#[tokio::test]
async fn identical_rerun_skips_staging_and_reproduces_marts() {
    let h = harness(REGISTRY, clean_fetcher());
    let first = h.pipeline.run_once().await.unwrap();
    let after_first = h.warehouse.snapshot().await;

    let second = h.pipeline.run_once().await.unwrap();
    let after_second = h.warehouse.snapshot().await;

    assert_ne!(first.report.run.run_id, second.report.run.run_id);
    assert_eq!(after_second.single_audits.len(), 4);
    assert_eq!(after_second.join_audits.len(), 2);
    assert_eq!(&after_second.single_audits[..2], &after_first.single_audits[..]);

    for record in &second.report.single {
        assert_eq!(record.verdict, Verdict::Skip);
        assert_eq!(record.fingerprint_status, FingerprintStatus::Unchanged);
        assert_eq!(record.fingerprint_detail, "unchanged_hash");
        assert!(record.metrics.is_none());
    }
    assert_eq!(after_second.staging, after_first.staging);
    // Raw tables still carry the first run's lineage.
    assert!(after_second
        .raw
        .values()
        .all(|raw| raw.run_id == first.report.run.run_id));

    assert!(second.report.gate_open);
    assert_eq!(after_second.marts, after_first.marts);
}

#[tokio::test]
async fn changed_snapshot_is_restaged() {
    let fetcher = clean_fetcher();
    let h = harness(REGISTRY, fetcher);
    h.pipeline.run_once().await.unwrap();

    h.pipeline
        .fetcher()
        .set(ZORI_URL, &ZORI.replace("3100", "3200"));
    let second = h.pipeline.run_once().await.unwrap();

    let zhvi = second.report.single.iter().find(|r| r.dataset_name == "zhvi").unwrap();
    let zori = second.report.single.iter().find(|r| r.dataset_name == "zori").unwrap();
    assert_eq!(zhvi.verdict, Verdict::Skip);
    assert_eq!(zori.fingerprint_status, FingerprintStatus::Changed);
    assert_eq!(zori.fingerprint_detail, "new_hash");
    assert_eq!(zori.verdict, Verdict::Pass);

    let state = h.warehouse.snapshot().await;
    let ca = state.marts[&mart_table(1)]
        .iter()
        .find(|r| r.group == "CA")
        .unwrap();
    assert_eq!(ca.measures[1], Some(3200.0));
}

#[tokio::test]
async fn failing_dataset_closes_the_gate_and_leaves_marts_untouched() {
    let h = harness(REGISTRY, clean_fetcher());
    h.pipeline.run_once().await.unwrap();
    let before = h.warehouse.snapshot().await;

    h.pipeline.fetcher().set(ZORI_URL, ZORI_ALL_NULL);
    let outcome = h.pipeline.run_once().await.unwrap();
    let report = &outcome.report;

    let zori = report.single.iter().find(|r| r.dataset_name == "zori").unwrap();
    assert_eq!(zori.verdict, Verdict::Fail);
    assert_eq!(zori.metrics.as_ref().unwrap().metric_null_pct, 100.0);
    assert_eq!(report.joins.len(), 1);
    assert_eq!(report.joins[0].verdict, Verdict::Fail);
    assert!(!report.gate_open);
    assert_eq!(report.failing_single, 1);
    assert_eq!(report.failing_join, 1);
    assert!(outcome.marts.is_empty());
    assert!(outcome.parquet_manifest.is_none());
    assert!(report.render().contains("mart build skipped: failing single=1 failing join=1"));

    let after = h.warehouse.snapshot().await;
    assert_eq!(after.marts, before.marts);
    assert_eq!(after.single_audits.len(), 4);
}

#[tokio::test]
async fn failed_content_is_not_remembered_as_accepted() {
    let h = harness(REGISTRY, StaticFetcher::with(&[(ZHVI_URL, ZHVI), (ZORI_URL, ZORI_ALL_NULL)]));
    let first = h.pipeline.run_once().await.unwrap();
    assert!(!first.report.gate_open);

    let second = h.pipeline.run_once().await.unwrap();
    let zori = second.report.single.iter().find(|r| r.dataset_name == "zori").unwrap();
    // The failed snapshot never became the accepted fingerprint.
    assert_eq!(zori.fingerprint_status, FingerprintStatus::New);
    assert_eq!(zori.verdict, Verdict::Fail);
    let zhvi = second.report.single.iter().find(|r| r.dataset_name == "zhvi").unwrap();
    assert_eq!(zhvi.verdict, Verdict::Skip);
}

#[tokio::test]
async fn accepted_content_after_a_failed_rebuild_is_restaged() {
    let h = harness(REGISTRY, clean_fetcher());
    let first = h.pipeline.run_once().await.unwrap();
    let accepted = first
        .report
        .single
        .iter()
        .find(|r| r.dataset_name == "zori")
        .unwrap()
        .fingerprint
        .clone();

    let broken = format!("{},3,Nowhere,msa,ZZ,1,2,3\n", ZORI.replace("3100", "9999"));
    h.pipeline.fetcher().set(ZORI_URL, &broken);
    let second = h.pipeline.run_once().await.unwrap();
    let zori = second.report.single.iter().find(|r| r.dataset_name == "zori").unwrap();
    assert_eq!(zori.verdict, Verdict::Fail);
    assert!(!second.report.gate_open);

    // The source goes back to the bytes accepted in the first run.
    h.pipeline.fetcher().set(ZORI_URL, ZORI);
    let third = h.pipeline.run_once().await.unwrap();
    let zori = third.report.single.iter().find(|r| r.dataset_name == "zori").unwrap();
    assert_eq!(zori.fingerprint, accepted);
    assert_eq!(zori.fingerprint_status, FingerprintStatus::Unchanged);
    assert_eq!(zori.verdict, Verdict::Pass);
    assert!(zori.metrics.is_some());
    assert!(third.report.gate_open);

    let state = h.warehouse.snapshot().await;
    let ca = state.marts[&mart_table(1)]
        .iter()
        .find(|r| r.group == "CA")
        .unwrap();
    assert_eq!(ca.measures[1], Some(3100.0));

    // Once staging is current again, the same bytes skip.
    let fourth = h.pipeline.run_once().await.unwrap();
    assert!(fourth.report.single.iter().all(|r| r.verdict == Verdict::Skip));
}

#[tokio::test]
async fn join_against_a_missing_staging_table_fails_and_closes_the_gate() {
    let h = harness(REGISTRY, clean_fetcher());

    // A ledger that already accepted these exact ZORI bytes, but whose
    // staging table is gone.
    let now = Utc::now();
    let mut tx = h.warehouse.begin().await.unwrap();
    tx.append_single_audit(&SingleAuditRecord {
        dataset_name: "zori".into(),
        run_id: Uuid::new_v4(),
        batch_id: Uuid::new_v4(),
        source_file_name: "Metro_zori.csv".into(),
        source_url: ZORI_URL.into(),
        local_path: "raw/zori/Metro_zori.csv".into(),
        fingerprint: SnapshotStore::sha256_hex(ZORI.as_bytes()),
        fingerprint_status: FingerprintStatus::New,
        fingerprint_detail: "no_prior_hash".into(),
        entity_key: "region_id".into(),
        date_key: "date".into(),
        metrics: Some(SingleAuditMetrics {
            row_count: 9,
            duplicate_keys: 0,
            broken_keys: 0,
            metric_null_pct: 0.0,
            min_date: None,
            max_date: None,
        }),
        verdict: Verdict::Pass,
        reason: "all checks passed".into(),
        downloaded_at: now,
        audited_at: now,
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let outcome = h.pipeline.run_once().await.unwrap();
    let report = &outcome.report;
    let zori = report.single.iter().find(|r| r.dataset_name == "zori").unwrap();
    assert_eq!(zori.verdict, Verdict::Skip);

    assert_eq!(report.joins.len(), 1);
    let join = &report.joins[0];
    assert_eq!(join.verdict, Verdict::Fail);
    assert!(join.metrics.is_none());
    assert_eq!(
        join.reason,
        "FAIL: staging table real_estate.stg_zillow_zori does not exist"
    );
    assert!(!report.gate_open);
    assert_eq!(report.failing_single, 0);
    assert_eq!(report.failing_join, 1);
    assert!(outcome.marts.is_empty());
    assert!(h.warehouse.snapshot().await.marts.is_empty());
}

#[tokio::test]
async fn fetch_failure_commits_nothing() {
    let h = harness(REGISTRY, clean_fetcher());
    h.pipeline.fetcher().remove(ZORI_URL);

    let err = h.pipeline.run_once().await.unwrap_err();
    assert!(
        matches!(err, PipelineError::Transport { ref dataset, .. } if dataset == "zori"),
        "{err}"
    );

    let state = h.warehouse.snapshot().await;
    assert!(state.single_audits.is_empty());
    assert!(state.join_audits.is_empty());
    assert!(state.raw.is_empty());
    assert!(state.staging.is_empty());
    assert!(state.marts.is_empty());
}

#[tokio::test]
async fn missing_grain_column_aborts_the_run() {
    let h = harness(REGISTRY, clean_fetcher());
    h.pipeline
        .fetcher()
        .set(ZORI_URL, &ZORI.replace("RegionID", "Region"));

    let err = h.pipeline.run_once().await.unwrap_err();
    match err {
        PipelineError::Transform { dataset, source } => {
            assert_eq!(dataset, "zori");
            assert!(source.is_configuration());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.warehouse.snapshot().await.single_audits.is_empty());
}

#[tokio::test]
async fn always_rebuild_restages_unchanged_content() {
    let yaml = REGISTRY.replace("skip_unchanged", "always_rebuild");
    let h = harness(&yaml, clean_fetcher());
    h.pipeline.run_once().await.unwrap();
    let second = h.pipeline.run_once().await.unwrap();

    for record in &second.report.single {
        assert_eq!(record.fingerprint_status, FingerprintStatus::Unchanged);
        assert_eq!(record.verdict, Verdict::Pass);
        assert!(record.metrics.is_some());
    }
    let state = h.warehouse.snapshot().await;
    assert!(state
        .raw
        .values()
        .all(|raw| raw.run_id == second.report.run.run_id));
}

#[test]
fn malformed_program_is_rejected_before_any_fetch() {
    let yaml = REGISTRY.replace("metric_column: rent_prices", "metric_column: date");
    let fetcher = clean_fetcher();
    let err = Registry::from_yaml_str(&yaml).unwrap_err();
    assert!(matches!(err, ConfigError::Program { ref dataset, .. } if dataset == "zori"));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn shipped_pipeline_file_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../pipeline.yaml");
    let registry = Registry::load(&path).unwrap();
    assert_eq!(registry.datasets.len(), 3);
    assert_eq!(registry.joins.len(), 2);
    let mart = &registry.marts[0];
    assert_eq!(
        mart.table_for(36).unwrap().to_string(),
        "real_estate.mart_us_previous_36M_state_date_avgs"
    );
}
