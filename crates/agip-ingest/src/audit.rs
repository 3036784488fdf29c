//! Single-dataset data-quality audit.

use std::collections::HashSet;

use agip_core::{
    Batch, DatasetSpec, SingleAuditMetrics, SingleAuditRecord, SourceArtifact, StagingRow,
    Verdict,
};
use agip_transform::StagingOutput;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::identity::IdentityCheck;

/// Thresholds for the single-dataset verdict. Counts are inclusive limits,
/// percentages trigger at or above the value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleAuditPolicy {
    pub max_duplicate_keys: u64,
    pub max_broken_keys: u64,
    pub metric_null_warn_pct: f64,
    pub metric_null_fail_pct: f64,
}

impl Default for SingleAuditPolicy {
    fn default() -> Self {
        Self {
            max_duplicate_keys: 0,
            max_broken_keys: 0,
            metric_null_warn_pct: 20.0,
            metric_null_fail_pct: 95.0,
        }
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Unrounded; thresholds compare against this, records store [`round2`] of it.
pub(crate) fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}

/// Rows sharing a grain key beyond the first: two rows on one key count 1.
pub fn duplicate_keys(rows: &[StagingRow]) -> u64 {
    let distinct = rows.iter().map(StagingRow::grain_key).collect::<HashSet<_>>();
    (rows.len() - distinct.len()) as u64
}

pub fn compute_metrics(output: &StagingOutput) -> SingleAuditMetrics {
    let rows = &output.rows;
    let nulls = rows.iter().filter(|r| r.metric.is_none()).count() as u64;
    SingleAuditMetrics {
        row_count: rows.len() as u64,
        duplicate_keys: duplicate_keys(rows),
        broken_keys: output.broken_keys,
        // An empty table has no metric at all.
        metric_null_pct: if rows.is_empty() {
            100.0
        } else {
            pct(nulls, rows.len() as u64)
        },
        min_date: rows.iter().map(|r| r.date).min(),
        max_date: rows.iter().map(|r| r.date).max(),
    }
}

impl SingleAuditPolicy {
    pub fn judge(&self, metrics: &SingleAuditMetrics) -> (Verdict, String) {
        let mut verdict = Verdict::Pass;
        let mut reasons = Vec::new();

        if metrics.row_count == 0 {
            verdict = verdict.worst(Verdict::Fail);
            reasons.push("no rows staged".to_string());
        }
        if metrics.duplicate_keys > self.max_duplicate_keys {
            verdict = verdict.worst(Verdict::Fail);
            reasons.push(format!(
                "duplicate grain keys {} > {}",
                metrics.duplicate_keys, self.max_duplicate_keys
            ));
        }
        if metrics.broken_keys > self.max_broken_keys {
            verdict = verdict.worst(Verdict::Fail);
            reasons.push(format!(
                "broken keys {} > {}",
                metrics.broken_keys, self.max_broken_keys
            ));
        }
        if metrics.metric_null_pct >= self.metric_null_fail_pct {
            verdict = verdict.worst(Verdict::Fail);
            reasons.push(format!(
                "metric nulls {:.2}% >= {:.2}%",
                metrics.metric_null_pct, self.metric_null_fail_pct
            ));
        } else if metrics.metric_null_pct >= self.metric_null_warn_pct {
            verdict = verdict.worst(Verdict::Warn);
            reasons.push(format!(
                "metric nulls {:.2}% >= warn {:.2}%",
                metrics.metric_null_pct, self.metric_null_warn_pct
            ));
        }

        let reason = if reasons.is_empty() {
            "all checks passed".to_string()
        } else {
            format!("{}: {}", verdict.as_str().to_uppercase(), reasons.join("; "))
        };
        (verdict, reason)
    }
}

pub(crate) fn audit_record(
    spec: &DatasetSpec,
    batch: Batch,
    artifact: &SourceArtifact,
    identity: &IdentityCheck,
    metrics: Option<SingleAuditMetrics>,
    verdict: Verdict,
    reason: String,
) -> SingleAuditRecord {
    SingleAuditRecord {
        dataset_name: spec.name.clone(),
        run_id: batch.run_id,
        batch_id: batch.batch_id,
        source_file_name: artifact.file_name.clone(),
        source_url: artifact.source_url.clone(),
        local_path: artifact.local_path.clone(),
        fingerprint: artifact.fingerprint.clone(),
        fingerprint_status: identity.status,
        fingerprint_detail: identity.status.detail().to_string(),
        entity_key: spec.grain.entity_key.to_string(),
        date_key: spec.grain.date_key.to_string(),
        metrics: metrics.map(|m| SingleAuditMetrics {
            metric_null_pct: round2(m.metric_null_pct),
            ..m
        }),
        verdict,
        reason,
        downloaded_at: artifact.downloaded_at,
        audited_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn row(entity: &str, date: &str, metric: Option<f64>) -> StagingRow {
        StagingRow {
            entity: entity.into(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            metric,
            attributes: BTreeMap::new(),
        }
    }

    fn output(rows: Vec<StagingRow>, broken_keys: u64) -> StagingOutput {
        StagingOutput {
            source_rows: rows.len() as u64,
            rows,
            broken_keys,
        }
    }

    #[test]
    fn duplicate_grain_counts_extra_rows_not_both() {
        let rows = vec![
            row("102001", "2024-01-01", Some(1.0)),
            row("102001", "2024-01-01", Some(2.0)),
            row("102001", "2024-02-01", Some(3.0)),
        ];
        assert_eq!(duplicate_keys(&rows), 1);

        let metrics = compute_metrics(&output(rows, 0));
        let (verdict, reason) = SingleAuditPolicy::default().judge(&metrics);
        assert_eq!(verdict, Verdict::Fail);
        assert!(reason.contains("duplicate grain keys 1 > 0"), "{reason}");
    }

    #[test]
    fn metrics_cover_nulls_and_date_range() {
        let rows = vec![
            row("1", "2024-03-31", None),
            row("1", "2024-01-31", Some(1.0)),
            row("2", "2024-02-29", Some(1.0)),
            row("2", "2024-03-31", Some(1.0)),
        ];
        let metrics = compute_metrics(&output(rows, 0));
        assert_eq!(metrics.row_count, 4);
        assert_eq!(metrics.metric_null_pct, 25.0);
        assert_eq!(metrics.min_date, NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(metrics.max_date, NaiveDate::from_ymd_opt(2024, 3, 31));
    }

    #[test]
    fn verdict_escalates_with_null_ratio() {
        let policy = SingleAuditPolicy {
            metric_null_warn_pct: 10.0,
            metric_null_fail_pct: 50.0,
            ..SingleAuditPolicy::default()
        };
        let mut metrics = SingleAuditMetrics {
            row_count: 10,
            duplicate_keys: 0,
            broken_keys: 0,
            metric_null_pct: 0.0,
            min_date: None,
            max_date: None,
        };
        assert_eq!(policy.judge(&metrics).0, Verdict::Pass);
        metrics.metric_null_pct = 10.0;
        assert_eq!(policy.judge(&metrics).0, Verdict::Warn);
        metrics.metric_null_pct = 100.0;
        assert_eq!(policy.judge(&metrics).0, Verdict::Fail);
    }

    #[test]
    fn thresholds_compare_the_unrounded_ratio() {
        // 37999 of 40000 is 94.9975%, shown as 95.00%.
        let metrics = SingleAuditMetrics {
            row_count: 40_000,
            duplicate_keys: 0,
            broken_keys: 0,
            metric_null_pct: pct(37_999, 40_000),
            min_date: None,
            max_date: None,
        };
        assert_eq!(round2(metrics.metric_null_pct), 95.0);
        let (verdict, reason) = SingleAuditPolicy::default().judge(&metrics);
        assert_eq!(verdict, Verdict::Warn);
        assert!(reason.contains("warn 20.00%"), "{reason}");
    }

    #[test]
    fn broken_keys_and_empty_tables_fail() {
        let metrics = compute_metrics(&output(vec![row("1", "2024-01-31", Some(1.0))], 3));
        assert_eq!(SingleAuditPolicy::default().judge(&metrics).0, Verdict::Fail);

        let empty = compute_metrics(&output(vec![], 0));
        assert_eq!(empty.metric_null_pct, 100.0);
        let (verdict, reason) = SingleAuditPolicy::default().judge(&empty);
        assert_eq!(verdict, Verdict::Fail);
        assert!(reason.contains("no rows staged"));
    }
}
