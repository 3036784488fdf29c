//! Mart gate and per-horizon mart builder.

use std::collections::{BTreeMap, HashMap};

use agip_core::{MartLayout, MartRow, MartSpec, MeasureKind, StagingRow, TableRef};
use agip_storage::{WarehouseError, WarehouseTx};
use chrono::{Months, NaiveDate};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::round2;

/// Whether marts may be rebuilt, decided from the run's ledger rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub open: bool,
    pub failing_single: u64,
    pub failing_join: u64,
}

pub async fn evaluate_gate<T: WarehouseTx>(
    tx: &mut T,
    run_id: Uuid,
) -> Result<GateDecision, WarehouseError> {
    let failing_single = tx.count_failing_single(run_id).await?;
    let failing_join = tx.count_failing_join(run_id).await?;
    Ok(GateDecision {
        open: failing_single == 0 && failing_join == 0,
        failing_single,
        failing_join,
    })
}

/// One rebuilt mart table.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltMart {
    pub mart: String,
    pub table: TableRef,
    pub horizon_months: u32,
    pub layout: MartLayout,
    pub rows: Vec<MartRow>,
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: u64,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| round2(self.sum / self.count as f64))
    }
}

type MetricIndex<'a> = HashMap<(&'a str, NaiveDate), Option<f64>>;

fn index(rows: &[StagingRow]) -> MetricIndex<'_> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        index.entry(row.grain_key()).or_insert(row.metric);
    }
    index
}

fn lookup_metric<'a>(
    lookups: &HashMap<&str, MetricIndex<'a>>,
    dataset: &str,
    key: (&'a str, NaiveDate),
) -> Option<f64> {
    lookups
        .get(dataset)
        .and_then(|index| index.get(&key).copied().flatten())
}

/// First day kept in a `horizon_months` window ending at `latest`.
/// Rows are kept when their date is strictly after `latest - horizon`.
pub fn window_start(latest: NaiveDate, horizon_months: u32) -> Option<NaiveDate> {
    latest.checked_sub_months(Months::new(horizon_months))
}

/// Aggregates the base dataset's window, left-joined on the grain to every
/// dataset a measure names. `staging` maps dataset name to staging rows.
/// Base rows with an empty group value are left out.
pub fn build_rows(
    mart: &MartSpec,
    staging: &BTreeMap<String, Vec<StagingRow>>,
    horizon_months: u32,
) -> Vec<MartRow> {
    let Some(base) = staging.get(&mart.base_dataset) else {
        return Vec::new();
    };
    let Some(latest) = base.iter().map(|r| r.date).max() else {
        return Vec::new();
    };
    let cutoff = window_start(latest, horizon_months);
    let lookups = staging
        .iter()
        .map(|(name, rows)| (name.as_str(), index(rows)))
        .collect::<HashMap<_, _>>();

    let mut groups: BTreeMap<(String, NaiveDate), (Vec<Mean>, i64)> = BTreeMap::new();
    for row in base {
        if cutoff.is_some_and(|c| row.date <= c) {
            continue;
        }
        let Some(group) = row
            .attributes
            .get(mart.group_by.as_str())
            .filter(|g| !g.trim().is_empty())
        else {
            continue;
        };

        let (means, members) = groups
            .entry((group.clone(), row.date))
            .or_insert_with(|| (mart.measures.iter().map(|_| Mean::default()).collect(), 0));
        *members += 1;
        let key = row.grain_key();
        for (mean, measure) in means.iter_mut().zip(&mart.measures) {
            let value = match &measure.kind {
                MeasureKind::Average { dataset } => lookup_metric(&lookups, dataset, key),
                MeasureKind::YieldPct {
                    income,
                    price,
                    periods_per_year,
                } => match (
                    lookup_metric(&lookups, income, key),
                    lookup_metric(&lookups, price, key),
                ) {
                    (Some(income), Some(price)) if price != 0.0 => {
                        Some(income * f64::from(*periods_per_year) / price * 100.0)
                    }
                    _ => None,
                },
            };
            mean.push(value);
        }
    }

    groups
        .into_iter()
        .map(|((group, date), (means, member_count))| MartRow {
            group,
            date,
            measures: means.iter().map(Mean::value).collect(),
            member_count,
        })
        .collect()
}
