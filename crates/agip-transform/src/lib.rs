//! Raw snapshot reader and the typed transform programs that derive staging
//! tables from it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use agip_core::{
    parse_iso_date, CoercionRule, DatasetSpec, KeyFormat, NumericKind, RawSnapshot,
    SourceLayout, StagingLayout, StagingRow,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Largest decimal scale a coercion may round to.
pub const MAX_DECIMAL_SCALE: u32 = 12;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed transform program: {0}")]
    Malformed(String),
    #[error("transform references missing column `{column}` (available: {available})")]
    MissingColumn { column: String, available: String },
    #[error("reading snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl TransformError {
    /// Program errors are configuration faults; read errors are snapshot faults.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TransformError::Malformed(_) | TransformError::MissingColumn { .. }
        )
    }
}

/// Reads a CSV snapshot verbatim. Short rows are padded and long rows are
/// truncated to the header width; cell text is never altered.
pub fn read_csv_snapshot(path: &Path) -> Result<RawSnapshot, TransformError> {
    let reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|source| TransformError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    collect_snapshot(reader).map_err(|source| TransformError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_csv_bytes(bytes: &[u8]) -> Result<RawSnapshot, TransformError> {
    let reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    collect_snapshot(reader).map_err(|source| TransformError::Read {
        path: PathBuf::from("<memory>"),
        source,
    })
}

fn collect_snapshot<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<RawSnapshot, csv::Error> {
    let columns = reader
        .headers()?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let width = columns.len();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = record
            .iter()
            .take(width)
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        row.resize(width, String::new());
        rows.push(row);
    }
    Ok(RawSnapshot { columns, rows })
}

/// Raw text to typed metric: empty tokens and unparseable text become null.
pub fn coerce_value(rule: &CoercionRule, raw: &str) -> Option<f64> {
    if rule.is_empty_token(raw) {
        return None;
    }
    let value = raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(match rule.kind {
        NumericKind::Decimal { scale } => {
            let factor = 10f64.powi(scale as i32);
            (value * factor).round() / factor
        }
        NumericKind::Integer => value.round(),
        NumericKind::Float => value,
    })
}

/// One step of a staging transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    /// Renames `from` when present; absent columns are ignored.
    Rename { from: String, to: String },
    /// Wide to long: every column whose header matches `header_format`
    /// becomes a row with `key` = header and `value` = cell.
    Unpivot {
        header_format: KeyFormat,
        key: String,
        value: String,
    },
    Coerce { column: String, rule: CoercionRule },
    /// Drops rows whose `column` fails `format`; each drop is a broken key.
    FilterKeys { column: String, format: KeyFormat },
}

/// Staging rows plus what the filters rejected on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingOutput {
    pub rows: Vec<StagingRow>,
    pub source_rows: u64,
    pub broken_keys: u64,
}

/// Validated list of [`TransformOp`]s ending in a projection onto a
/// [`StagingLayout`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransformProgram {
    ops: Vec<TransformOp>,
    layout: StagingLayout,
}

impl TransformProgram {
    pub fn new(ops: Vec<TransformOp>, layout: StagingLayout) -> Result<Self, TransformError> {
        let program = Self { ops, layout };
        program.validate()?;
        Ok(program)
    }

    /// Renames, optional unpivot, metric coercion, then grain-key filters.
    pub fn for_dataset(spec: &DatasetSpec) -> Result<Self, TransformError> {
        let layout = spec.staging_layout();
        let entity = layout.grain.entity_key.to_string();
        let date = layout.grain.date_key.to_string();
        let metric = layout.metric.to_string();

        let mut ops = spec
            .renames
            .iter()
            .map(|r| TransformOp::Rename {
                from: r.from.clone(),
                to: r.to.clone(),
            })
            .collect::<Vec<_>>();
        if let SourceLayout::Wide { header_format } = spec.layout {
            ops.push(TransformOp::Unpivot {
                header_format,
                key: date.clone(),
                value: metric.clone(),
            });
        }
        ops.push(TransformOp::Coerce {
            column: metric,
            rule: spec.coercion.clone(),
        });
        ops.push(TransformOp::FilterKeys {
            column: entity,
            format: KeyFormat::NonEmpty,
        });
        ops.push(TransformOp::FilterKeys {
            column: date,
            format: KeyFormat::IsoDate,
        });
        Self::new(ops, layout)
    }

    pub fn ops(&self) -> &[TransformOp] {
        &self.ops
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    fn validate(&self) -> Result<(), TransformError> {
        let entity = self.layout.grain.entity_key.as_str();
        let date = self.layout.grain.date_key.as_str();
        let metric = self.layout.metric.as_str();
        if entity == date || entity == metric || date == metric {
            return Err(TransformError::Malformed(format!(
                "grain ({entity}, {date}) and metric `{metric}` must be distinct columns"
            )));
        }

        let mut rename_targets = HashSet::new();
        let mut unpivot_outputs: Option<(String, String)> = None;
        let mut metric_coerced = false;

        for (i, op) in self.ops.iter().enumerate() {
            match op {
                TransformOp::Rename { from, to } => {
                    if from.trim().is_empty() || to.trim().is_empty() {
                        return Err(TransformError::Malformed(format!(
                            "step {i}: rename needs non-empty names"
                        )));
                    }
                    if !rename_targets.insert(to.as_str()) {
                        return Err(TransformError::Malformed(format!(
                            "step {i}: more than one column renamed to `{to}`"
                        )));
                    }
                }
                TransformOp::Unpivot { key, value, .. } => {
                    if unpivot_outputs.is_some() {
                        return Err(TransformError::Malformed(format!(
                            "step {i}: only one unpivot is allowed"
                        )));
                    }
                    if key.trim().is_empty() || value.trim().is_empty() || key == value {
                        return Err(TransformError::Malformed(format!(
                            "step {i}: unpivot key and value must be distinct, non-empty names"
                        )));
                    }
                    unpivot_outputs = Some((key.clone(), value.clone()));
                }
                TransformOp::Coerce { column, .. } | TransformOp::FilterKeys { column, .. } => {
                    if column.trim().is_empty() {
                        return Err(TransformError::Malformed(format!(
                            "step {i}: column name is empty"
                        )));
                    }
                    if let TransformOp::Coerce { rule, .. } = op {
                        if let NumericKind::Decimal { scale } = rule.kind {
                            if scale > MAX_DECIMAL_SCALE {
                                return Err(TransformError::Malformed(format!(
                                    "step {i}: decimal scale {scale} exceeds {MAX_DECIMAL_SCALE}"
                                )));
                            }
                        }
                        metric_coerced |= column == metric;
                    }
                    // Columns an unpivot creates cannot be touched before it runs.
                    let later_unpivot = self.ops[i + 1..].iter().any(|later| {
                        matches!(later, TransformOp::Unpivot { key, value, .. }
                            if key == column || value == column)
                    });
                    if later_unpivot {
                        return Err(TransformError::Malformed(format!(
                            "step {i}: `{column}` is used before the unpivot that produces it"
                        )));
                    }
                }
            }
        }

        if !metric_coerced {
            return Err(TransformError::Malformed(format!(
                "metric column `{metric}` is never coerced"
            )));
        }
        Ok(())
    }

    pub fn apply(&self, raw: &RawSnapshot) -> Result<StagingOutput, TransformError> {
        let mut frame = Frame::from_snapshot(raw);
        let mut broken_keys = 0u64;

        for op in &self.ops {
            match op {
                TransformOp::Rename { from, to } => frame.rename(from, to)?,
                TransformOp::Unpivot {
                    header_format,
                    key,
                    value,
                } => frame = frame.unpivot(*header_format, key, value)?,
                TransformOp::Coerce { column, rule } => frame.coerce(column, rule)?,
                TransformOp::FilterKeys { column, format } => {
                    broken_keys += frame.filter_keys(column, *format)?;
                }
            }
        }

        let (rows, unparseable) = frame.project(&self.layout)?;
        broken_keys += unparseable;
        debug!(
            source_rows = raw.rows.len(),
            staged_rows = rows.len(),
            broken_keys,
            "transform applied"
        );
        Ok(StagingOutput {
            rows,
            source_rows: raw.rows.len() as u64,
            broken_keys,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Text(String),
    Number(f64),
    Null,
}

impl Cell {
    fn as_text(&self) -> Option<String> {
        match self {
            Cell::Text(s) => Some(s.clone()),
            Cell::Number(n) => Some(n.to_string()),
            Cell::Null => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Frame {
    fn from_snapshot(raw: &RawSnapshot) -> Self {
        Self {
            columns: raw.columns.clone(),
            rows: raw
                .rows
                .iter()
                .map(|row| row.iter().map(|v| Cell::Text(v.clone())).collect())
                .collect(),
        }
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    fn require(&self, column: &str) -> Result<usize, TransformError> {
        self.position(column)
            .ok_or_else(|| TransformError::MissingColumn {
                column: column.to_string(),
                available: self.columns.join(", "),
            })
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), TransformError> {
        let Some(idx) = self.position(from) else {
            return Ok(());
        };
        if from != to && self.position(to).is_some() {
            return Err(TransformError::Malformed(format!(
                "renaming `{from}` to `{to}` collides with an existing column"
            )));
        }
        self.columns[idx] = to.to_string();
        Ok(())
    }

    fn unpivot(self, header_format: KeyFormat, key: &str, value: &str) -> Result<Self, TransformError> {
        let (value_idx, id_idx): (Vec<usize>, Vec<usize>) =
            (0..self.columns.len()).partition(|&i| header_format.matches(&self.columns[i]));

        let mut columns = id_idx
            .iter()
            .map(|&i| self.columns[i].clone())
            .collect::<Vec<_>>();
        if columns.iter().any(|c| c == key || c == value) {
            return Err(TransformError::Malformed(format!(
                "unpivot outputs `{key}`/`{value}` collide with identifier columns"
            )));
        }
        columns.push(key.to_string());
        columns.push(value.to_string());

        let mut rows = Vec::with_capacity(self.rows.len() * value_idx.len());
        for row in &self.rows {
            for &v in &value_idx {
                let mut out = id_idx.iter().map(|&i| row[i].clone()).collect::<Vec<_>>();
                out.push(Cell::Text(self.columns[v].clone()));
                out.push(row[v].clone());
                rows.push(out);
            }
        }
        Ok(Self { columns, rows })
    }

    fn coerce(&mut self, column: &str, rule: &CoercionRule) -> Result<(), TransformError> {
        let idx = self.require(column)?;
        for row in &mut self.rows {
            let coerced = match &row[idx] {
                Cell::Text(raw) => coerce_value(rule, raw).map_or(Cell::Null, Cell::Number),
                other => other.clone(),
            };
            row[idx] = coerced;
        }
        Ok(())
    }

    fn filter_keys(&mut self, column: &str, format: KeyFormat) -> Result<u64, TransformError> {
        let idx = self.require(column)?;
        let before = self.rows.len();
        self.rows.retain(|row| {
            row[idx]
                .as_text()
                .is_some_and(|text| format.matches(&text))
        });
        Ok((before - self.rows.len()) as u64)
    }

    /// Returns staged rows and the count of rows whose date could not be typed.
    fn project(self, layout: &StagingLayout) -> Result<(Vec<StagingRow>, u64), TransformError> {
        let entity_idx = self.require(layout.grain.entity_key.as_str())?;
        let date_idx = self.require(layout.grain.date_key.as_str())?;
        let metric_idx = self.require(layout.metric.as_str())?;
        let fallback = CoercionRule::default();

        let mut unparseable = 0u64;
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in self.rows {
            let entity = row[entity_idx].as_text().unwrap_or_default();
            let Some(date) = row[date_idx].as_text().and_then(|d| parse_iso_date(&d)) else {
                unparseable += 1;
                continue;
            };
            let metric = match &row[metric_idx] {
                Cell::Number(n) => Some(*n),
                Cell::Text(raw) => coerce_value(&fallback, raw),
                Cell::Null => None,
            };
            let attributes = row
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != entity_idx && *i != date_idx && *i != metric_idx)
                .filter_map(|(i, cell)| cell.as_text().map(|v| (self.columns[i].clone(), v)))
                .collect::<BTreeMap<_, _>>();
            rows.push(StagingRow {
                entity,
                date,
                metric,
                attributes,
            });
        }
        Ok((rows, unparseable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agip_core::{Grain, Ident, Rename, TableRef};
    use chrono::NaiveDate;

    const ZHVI_SAMPLE: &str = "\
RegionID,SizeRank,RegionName,RegionType,StateName,2024-01-31,2024-02-29
102001,0,United States,country,,350000.456,NaN
394913,1,\"New York, NY\",msa,NY,650000,
,2,Nowhere,msa,ZZ,1,2
";

    fn ident(s: &str) -> Ident {
        Ident::new(s).unwrap()
    }

    fn zhvi_spec() -> DatasetSpec {
        DatasetSpec {
            name: "zhvi".into(),
            source_url: "https://example.test/Metro_zhvi.csv".into(),
            raw_table: TableRef::new(ident("real_estate"), ident("raw_zhvi")),
            staging_table: TableRef::new(ident("real_estate"), ident("stg_zhvi")),
            grain: Grain {
                entity_key: ident("region_id"),
                date_key: ident("date"),
            },
            metric_column: ident("home_prices"),
            coercion: CoercionRule {
                kind: NumericKind::Decimal { scale: 2 },
                ..CoercionRule::default()
            },
            renames: vec![
                Rename { from: "RegionID".into(), to: "region_id".into() },
                Rename { from: "SizeRank".into(), to: "size_rank".into() },
                Rename { from: "RegionName".into(), to: "region_name".into() },
                Rename { from: "StateName".into(), to: "state_name".into() },
            ],
            layout: SourceLayout::Wide {
                header_format: KeyFormat::IsoDate,
            },
        }
    }

    #[test]
    fn csv_reader_keeps_cells_verbatim_and_pads_short_rows() {
        let snapshot = parse_csv_bytes(b"a,b,c\n1,,x\n2\n").unwrap();
        assert_eq!(snapshot.columns, vec!["a", "b", "c"]);
        assert_eq!(snapshot.rows[0], vec!["1", "", "x"]);
        assert_eq!(snapshot.rows[1], vec!["2", "", ""]);
    }

    #[test]
    fn coercion_recognizes_empty_tokens_case_insensitively() {
        let rule = CoercionRule::default();
        assert_eq!(coerce_value(&rule, ""), None);
        assert_eq!(coerce_value(&rule, "NaN"), None);
        assert_eq!(coerce_value(&rule, " NULL "), None);
        assert_eq!(coerce_value(&rule, "n/a"), None);
        assert_eq!(coerce_value(&rule, "12.5"), Some(12.5));

        let decimal = CoercionRule {
            kind: NumericKind::Decimal { scale: 2 },
            ..CoercionRule::default()
        };
        assert_eq!(coerce_value(&decimal, "350000.456"), Some(350000.46));
        let integer = CoercionRule {
            kind: NumericKind::Integer,
            ..CoercionRule::default()
        };
        assert_eq!(coerce_value(&integer, "57.6"), Some(58.0));
    }

    #[test]
    fn wide_snapshot_is_unpivoted_into_typed_staging_rows() {
        let program = TransformProgram::for_dataset(&zhvi_spec()).unwrap();
        let raw = parse_csv_bytes(ZHVI_SAMPLE.as_bytes()).unwrap();
        let out = program.apply(&raw).unwrap();

        assert_eq!(out.source_rows, 3);
        // The region without an id yields two broken keys, one per date column.
        assert_eq!(out.broken_keys, 2);
        assert_eq!(out.rows.len(), 4);

        let first = &out.rows[0];
        assert_eq!(first.entity, "102001");
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
        assert_eq!(first.metric, Some(350000.46));
        assert_eq!(first.attributes.get("region_name").map(String::as_str), Some("United States"));
        assert_eq!(first.attributes.get("state_name").map(String::as_str), Some(""));
        assert!(!first.attributes.contains_key("RegionID"));

        assert_eq!(out.rows[1].metric, None);
        assert_eq!(out.rows[3].metric, None);
        assert_eq!(
            out.rows[2].attributes.get("region_name").map(String::as_str),
            Some("New York, NY")
        );
    }

    #[test]
    fn long_snapshot_filters_malformed_dates() {
        let mut spec = zhvi_spec();
        spec.layout = SourceLayout::Long;
        spec.renames = vec![];
        let program = TransformProgram::for_dataset(&spec).unwrap();
        let raw = parse_csv_bytes(
            b"region_id,date,home_prices\n1,2024-01-31,10\n1,2024-13-01,11\n2,01/31/2024,12\n",
        )
        .unwrap();
        let out = program.apply(&raw).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.broken_keys, 2);
    }

    #[test]
    fn program_without_metric_coercion_is_rejected() {
        let spec = zhvi_spec();
        let err = TransformProgram::new(
            vec![TransformOp::Rename {
                from: "RegionID".into(),
                to: "region_id".into(),
            }],
            spec.staging_layout(),
        )
        .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("never coerced"));
    }

    #[test]
    fn coerce_before_unpivot_is_rejected() {
        let spec = zhvi_spec();
        let err = TransformProgram::new(
            vec![
                TransformOp::Coerce {
                    column: "home_prices".into(),
                    rule: CoercionRule::default(),
                },
                TransformOp::Unpivot {
                    header_format: KeyFormat::IsoDate,
                    key: "date".into(),
                    value: "home_prices".into(),
                },
            ],
            spec.staging_layout(),
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::Malformed(_)));
    }

    #[test]
    fn oversized_decimal_scale_is_rejected() {
        let mut spec = zhvi_spec();
        spec.coercion.kind = NumericKind::Decimal { scale: 13 };
        let err = TransformProgram::for_dataset(&spec).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("decimal scale 13 exceeds 12"), "{err}");

        spec.coercion.kind = NumericKind::Decimal { scale: MAX_DECIMAL_SCALE };
        assert!(TransformProgram::for_dataset(&spec).is_ok());
    }

    #[test]
    fn duplicate_rename_targets_are_rejected() {
        let mut spec = zhvi_spec();
        spec.renames.push(Rename {
            from: "RegionType".into(),
            to: "region_id".into(),
        });
        assert!(TransformProgram::for_dataset(&spec).is_err());
    }

    #[test]
    fn missing_grain_column_at_runtime_is_a_configuration_error() {
        let mut spec = zhvi_spec();
        spec.renames.clear();
        let program = TransformProgram::for_dataset(&spec).unwrap();
        let raw = parse_csv_bytes(ZHVI_SAMPLE.as_bytes()).unwrap();
        let err = program.apply(&raw).unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, TransformError::MissingColumn { ref column, .. } if column == "region_id"));
    }

    #[test]
    fn ops_round_trip_through_yaml() {
        let yaml = "- op: rename\n  from: RegionID\n  to: region_id\n- op: filter_keys\n  column: date\n  format: iso_date\n";
        let ops: Vec<TransformOp> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            ops[1],
            TransformOp::FilterKeys {
                column: "date".into(),
                format: KeyFormat::IsoDate
            }
        );
    }

    #[test]
    fn snapshot_read_from_disk_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zhvi.csv");
        std::fs::write(&path, ZHVI_SAMPLE).unwrap();
        let from_disk = read_csv_snapshot(&path).unwrap();
        assert_eq!(from_disk, parse_csv_bytes(ZHVI_SAMPLE.as_bytes()).unwrap());
    }
}
