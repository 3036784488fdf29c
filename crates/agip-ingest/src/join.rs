//! Post-join audit: fan-out, row preservation and metric coverage.

use std::collections::HashMap;

use agip_core::{
    Batch, JoinAuditMetrics, JoinAuditRecord, JoinKind, JoinSpec, StagingRow, Verdict,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{pct, round2};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinAuditPolicy {
    pub max_fanout_dupes: u64,
    /// Joined coverage below this warns.
    pub coverage_warn_pct: f64,
    /// Joined coverage below this fails.
    pub coverage_fail_pct: f64,
}

impl Default for JoinAuditPolicy {
    fn default() -> Self {
        Self {
            max_fanout_dupes: 0,
            coverage_warn_pct: 80.0,
            coverage_fail_pct: 10.0,
        }
    }
}

/// Joins `left` (the base) to `right` on the grain and measures the result.
pub fn compute(kind: JoinKind, left: &[StagingRow], right: &[StagingRow]) -> JoinAuditMetrics {
    let mut index: HashMap<(&str, NaiveDate), Vec<&StagingRow>> = HashMap::new();
    for row in right {
        index.entry(row.grain_key()).or_default().push(row);
    }

    let mut joined_rows = 0u64;
    let mut joined_with_metric = 0u64;
    let mut per_key: HashMap<(&str, NaiveDate), u64> = HashMap::new();
    for row in left {
        let matches = index.get(&row.grain_key()).map(Vec::as_slice).unwrap_or_default();
        let produced = match kind {
            JoinKind::Inner => matches.len() as u64,
            JoinKind::Left => matches.len().max(1) as u64,
        };
        joined_rows += produced;
        joined_with_metric += matches.iter().filter(|r| r.metric.is_some()).count() as u64;
        *per_key.entry(row.grain_key()).or_default() += produced;
    }

    let base_rows = left.len() as u64;
    let base_with_metric = left.iter().filter(|r| r.metric.is_some()).count() as u64;
    JoinAuditMetrics {
        base_rows,
        joined_rows,
        fanout_dupes: per_key.values().filter(|&&n| n > 1).count() as u64,
        row_preservation_delta: joined_rows as i64 - base_rows as i64,
        base_metric_pct: pct(base_with_metric, base_rows),
        metric_coverage_pct: pct(joined_with_metric, joined_rows),
    }
}

impl JoinAuditPolicy {
    pub fn judge(&self, metrics: &JoinAuditMetrics) -> (Verdict, String) {
        let mut verdict = Verdict::Pass;
        let mut reasons = Vec::new();

        if metrics.base_rows == 0 {
            verdict = verdict.worst(Verdict::Fail);
            reasons.push("base side has no rows".to_string());
        }
        if metrics.fanout_dupes > self.max_fanout_dupes {
            verdict = verdict.worst(Verdict::Fail);
            reasons.push(format!(
                "fan-out on {} base keys > {}",
                metrics.fanout_dupes, self.max_fanout_dupes
            ));
        }
        if metrics.metric_coverage_pct < self.coverage_fail_pct {
            verdict = verdict.worst(Verdict::Fail);
            reasons.push(format!(
                "joined coverage {:.2}% < {:.2}%",
                metrics.metric_coverage_pct, self.coverage_fail_pct
            ));
        } else if metrics.metric_coverage_pct < self.coverage_warn_pct {
            verdict = verdict.worst(Verdict::Warn);
            reasons.push(format!(
                "joined coverage {:.2}% < warn {:.2}%",
                metrics.metric_coverage_pct, self.coverage_warn_pct
            ));
        }
        if metrics.row_preservation_delta < 0 {
            verdict = verdict.worst(Verdict::Warn);
            reasons.push(format!(
                "join lost {} base rows",
                -metrics.row_preservation_delta
            ));
        }

        let reason = if reasons.is_empty() {
            "join preserved rows and coverage".to_string()
        } else {
            format!("{}: {}", verdict.as_str().to_uppercase(), reasons.join("; "))
        };
        (verdict, reason)
    }
}

pub(crate) fn audit_record(
    join: &JoinSpec,
    batch: Batch,
    metrics: Option<JoinAuditMetrics>,
    verdict: Verdict,
    reason: String,
) -> JoinAuditRecord {
    let grain = join.grain();
    JoinAuditRecord {
        join_name: join.name.clone(),
        run_id: batch.run_id,
        batch_id: batch.batch_id,
        left_dataset: join.left_dataset.clone(),
        right_dataset: join.right_dataset.clone(),
        join_kind: join.kind,
        entity_key: grain.entity_key.to_string(),
        date_key: grain.date_key.to_string(),
        metrics: metrics.map(|m| JoinAuditMetrics {
            base_metric_pct: round2(m.base_metric_pct),
            metric_coverage_pct: round2(m.metric_coverage_pct),
            ..m
        }),
        verdict,
        reason,
        audited_at: Utc::now(),
    }
}
