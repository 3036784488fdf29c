//! Run summary: read back from the ledger and rendered, plus report files.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use agip_core::{JoinAuditRecord, Run, SingleAuditRecord};
use agip_storage::{WarehouseError, WarehouseTx};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::mart::GateDecision;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MartSummary {
    pub mart: String,
    pub table: String,
    pub horizon_months: u32,
    pub rows: u64,
}

/// Everything an invocation recorded, in chronological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run: Run,
    pub finished_at: DateTime<Utc>,
    pub single: Vec<SingleAuditRecord>,
    pub joins: Vec<JoinAuditRecord>,
    pub gate_open: bool,
    pub failing_single: u64,
    pub failing_join: u64,
    pub marts: Vec<MartSummary>,
}

impl RunReport {
    /// Reads the run's records back through the same transaction that wrote them.
    pub async fn collect<T: WarehouseTx>(
        tx: &mut T,
        run: Run,
        gate: GateDecision,
        marts: Vec<MartSummary>,
    ) -> Result<Self, WarehouseError> {
        Ok(Self {
            run,
            finished_at: Utc::now(),
            single: tx.single_audits_for_run(run.run_id).await?,
            joins: tx.join_audits_for_run(run.run_id).await?,
            gate_open: gate.open,
            failing_single: gate.failing_single,
            failing_join: gate.failing_join,
            marts,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run {} started {}", self.run.run_id, self.run.started_at);

        let _ = writeln!(out, "\nSINGLE-DATASET AUDITS (this run):");
        for r in &self.single {
            let _ = write!(
                out,
                " - {}: {} hash={}",
                r.dataset_name, r.verdict, r.fingerprint_status
            );
            if let Some(m) = &r.metrics {
                let _ = write!(
                    out,
                    " rows={} dupes={} broken={} nulls={:.2}% min={} max={}",
                    m.row_count,
                    m.duplicate_keys,
                    m.broken_keys,
                    m.metric_null_pct,
                    date_or_dash(m.min_date),
                    date_or_dash(m.max_date)
                );
            }
            let _ = writeln!(out, " reason={}", r.reason);
        }

        let _ = writeln!(out, "\nPOST-JOIN AUDITS (this run):");
        for r in &self.joins {
            let _ = write!(out, " - {}: {} {}", r.join_name, r.verdict, r.join_kind);
            if let Some(m) = &r.metrics {
                let _ = write!(
                    out,
                    " fanout={} delta_rows={} base_pct={:.2}% join_pct={:.2}%",
                    m.fanout_dupes, m.row_preservation_delta, m.base_metric_pct, m.metric_coverage_pct
                );
            }
            let _ = writeln!(out, " reason={}", r.reason);
        }

        let _ = writeln!(out);
        if self.gate_open {
            let tables = self
                .marts
                .iter()
                .map(|m| format!("{} ({} rows)", m.table, m.rows))
                .collect::<Vec<_>>();
            let _ = writeln!(out, "marts rebuilt: {}", tables.join(", "));
        } else {
            let _ = writeln!(
                out,
                "mart build skipped: failing single={} failing join={}",
                self.failing_single, self.failing_join
            );
        }
        out
    }
}

fn date_or_dash(date: Option<NaiveDate>) -> String {
    date.map_or_else(|| "-".to_string(), |d| d.to_string())
}

/// Writes `<reports_dir>/<run_id>/run_summary.md` and `audits.json`.
pub async fn write_report_files(reports_dir: &Path, report: &RunReport) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(report.run.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary = format!(
        "# AGIP Run Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Mart gate: {}\n\n```text\n{}```\n",
        report.run.run_id,
        report.run.started_at,
        report.finished_at,
        if report.gate_open { "open" } else { "closed" },
        report.render()
    );
    fs::write(run_dir.join("run_summary.md"), summary)
        .await
        .context("writing run_summary.md")?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(run_dir.join("audits.json"), json)
        .await
        .context("writing audits.json")?;
    Ok(run_dir)
}

/// Markdown index of the newest `runs` report directories.
pub fn list_recent_reports(reports_dir: &Path, runs: usize) -> anyhow::Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("audits.json").exists())
        .map(|entry| -> anyhow::Result<(PathBuf, RunReport)> {
            let path = entry.path().join("audits.json");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let report: RunReport = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok((entry.path(), report))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    dirs.sort_by_key(|(_, report)| std::cmp::Reverse(report.run.started_at));

    let mut lines = vec!["# AGIP Recent Runs".to_string(), String::new()];
    for (dir, report) in dirs.into_iter().take(runs.max(1)) {
        let count = |v: agip_core::Verdict| report.single.iter().filter(|r| r.verdict == v).count();
        lines.push(format!("## Run `{}`", report.run.run_id));
        lines.push(format!("- started: {}", report.run.started_at));
        lines.push(format!(
            "- datasets: pass={} warn={} skip={} fail={}",
            count(agip_core::Verdict::Pass),
            count(agip_core::Verdict::Warn),
            count(agip_core::Verdict::Skip),
            count(agip_core::Verdict::Fail)
        ));
        lines.push(format!(
            "- joins failing: {}",
            report.joins.iter().filter(|r| r.verdict.is_failing()).count()
        ));
        lines.push(format!(
            "- marts: {}",
            if report.gate_open {
                format!("{} rebuilt", report.marts.len())
            } else {
                "skipped".to_string()
            }
        ));
        let summary = dir.join("run_summary.md");
        if summary.exists() {
            lines.push(format!("- summary: `{}`", summary.display()));
        }
        let manifest = dir.join("marts").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
