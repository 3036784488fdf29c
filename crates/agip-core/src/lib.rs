//! Core domain model and audit-ledger types for AGIP.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Postgres truncates identifiers past this length.
const MAX_IDENT_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier `{0}` is longer than 63 characters")]
    TooLong(String),
    #[error("identifier `{0}` must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidCharacters(String),
}

/// Validated SQL identifier (schema, table or column name).
///
/// Only `[A-Za-z_][A-Za-z0-9_]*` is accepted, so a quoted rendering can be
/// spliced into DDL without escaping. Values never go through this type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn new(value: impl Into<String>) -> Result<Self, IdentError> {
        let value = value.into();
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(IdentError::Empty);
        };
        if value.len() > MAX_IDENT_LEN {
            return Err(IdentError::TooLong(value));
        }
        let first_ok = first.is_ascii_alphabetic() || first == '_';
        if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(IdentError::InvalidCharacters(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = IdentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Table addressed by (schema, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Ident,
    pub name: Ident,
}

impl TableRef {
    pub fn new(schema: Ident, name: Ident) -> Self {
        Self { schema, name }
    }

    pub fn quoted(&self) -> String {
        format!("{}.{}", self.schema.quoted(), self.name.quoted())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One pipeline invocation. Passed explicitly to every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl Run {
    pub fn start() -> Self {
        Self::new(Uuid::new_v4(), Utc::now())
    }

    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self { run_id, started_at }
    }

    /// Fresh batch scoped to this run.
    pub fn batch(&self) -> Batch {
        Batch {
            batch_id: Uuid::new_v4(),
            run_id: self.run_id,
        }
    }
}

/// Disambiguates datasets and joins processed under the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Warn,
    Skip,
    Fail,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Warn => "warn",
            Verdict::Skip => "skip",
            Verdict::Fail => "fail",
        }
    }

    /// Only explicit failures close the mart gate.
    pub fn is_failing(self) -> bool {
        self == Verdict::Fail
    }

    /// Verdicts whose fingerprint counts as the last accepted content.
    pub fn is_accepting(self) -> bool {
        matches!(self, Verdict::Pass | Verdict::Warn | Verdict::Skip)
    }

    fn severity(self) -> u8 {
        match self {
            Verdict::Skip => 0,
            Verdict::Pass => 1,
            Verdict::Warn => 2,
            Verdict::Fail => 3,
        }
    }

    pub fn worst(self, other: Verdict) -> Verdict {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Verdict {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Verdict::Pass),
            "warn" => Ok(Verdict::Warn),
            "skip" => Ok(Verdict::Skip),
            "fail" => Ok(Verdict::Fail),
            other => Err(ParseEnumError {
                kind: "verdict",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome of comparing a snapshot fingerprint with the last accepted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintStatus {
    New,
    Changed,
    Unchanged,
}

impl FingerprintStatus {
    pub fn classify(current: &str, last_accepted: Option<&str>) -> Self {
        match last_accepted {
            None => FingerprintStatus::New,
            Some(last) if last == current => FingerprintStatus::Unchanged,
            Some(_) => FingerprintStatus::Changed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FingerprintStatus::New => "new",
            FingerprintStatus::Changed => "changed",
            FingerprintStatus::Unchanged => "unchanged",
        }
    }

    pub fn detail(self) -> &'static str {
        match self {
            FingerprintStatus::New => "no_prior_hash",
            FingerprintStatus::Changed => "new_hash",
            FingerprintStatus::Unchanged => "unchanged_hash",
        }
    }
}

impl fmt::Display for FingerprintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FingerprintStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(FingerprintStatus::New),
            "changed" => Ok(FingerprintStatus::Changed),
            "unchanged" => Ok(FingerprintStatus::Unchanged),
            other => Err(ParseEnumError {
                kind: "fingerprint status",
                value: other.to_string(),
            }),
        }
    }
}

/// Downloaded snapshot. Referenced from audit rows by fingerprint only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceArtifact {
    pub source_url: String,
    pub file_name: String,
    pub local_path: String,
    pub fingerprint: String,
    pub byte_size: u64,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    IsoDate,
    NonEmpty,
    Integer,
}

impl KeyFormat {
    pub fn matches(self, value: &str) -> bool {
        match self {
            KeyFormat::IsoDate => parse_iso_date(value).is_some(),
            KeyFormat::NonEmpty => !value.trim().is_empty(),
            KeyFormat::Integer => {
                let digits = value.strip_prefix('-').unwrap_or(value);
                !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
            }
        }
    }
}

/// Strict `YYYY-MM-DD`; chrono alone would also accept unpadded fields.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    let bytes = value.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits_ok = bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !digits_ok {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NumericKind {
    Decimal { scale: u32 },
    Integer,
    Float,
}

/// How raw metric text becomes a typed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoercionRule {
    #[serde(flatten)]
    pub kind: NumericKind,
    #[serde(default = "default_empty_tokens")]
    pub empty_tokens: Vec<String>,
}

fn default_empty_tokens() -> Vec<String> {
    vec![String::new(), "nan".to_string(), "null".to_string()]
}

impl Default for CoercionRule {
    fn default() -> Self {
        Self {
            kind: NumericKind::Float,
            empty_tokens: default_empty_tokens(),
        }
    }
}

impl CoercionRule {
    pub fn is_empty_token(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        self.empty_tokens
            .iter()
            .any(|token| token.trim().eq_ignore_ascii_case(trimmed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

/// Shape of the published file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLayout {
    /// One column per date; headers matching `header_format` are unpivoted.
    Wide { header_format: KeyFormat },
    /// Already one row per grain key.
    Long,
}

/// Entity key plus date key. Expected to be unique in staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grain {
    pub entity_key: Ident,
    pub date_key: Ident,
}

/// Column names of a staging table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingLayout {
    pub grain: Grain,
    pub metric: Ident,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub source_url: String,
    pub raw_table: TableRef,
    pub staging_table: TableRef,
    pub grain: Grain,
    pub metric_column: Ident,
    pub coercion: CoercionRule,
    pub renames: Vec<Rename>,
    pub layout: SourceLayout,
}

impl DatasetSpec {
    pub fn staging_layout(&self) -> StagingLayout {
        StagingLayout {
            grain: self.grain.clone(),
            metric: self.metric_column.clone(),
        }
    }

    /// Last path segment of the locator, query string stripped.
    pub fn source_file_name(&self) -> String {
        let without_query = self.source_url.split(['?', '#']).next().unwrap_or_default();
        without_query
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("{}.csv", self.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[serde(alias = "INNER JOIN", alias = "INNER")]
    Inner,
    #[serde(alias = "LEFT JOIN", alias = "LEFT")]
    Left,
}

impl JoinKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinKind::Inner => "inner",
            JoinKind::Left => "left",
        }
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inner" => Ok(JoinKind::Inner),
            "left" => Ok(JoinKind::Left),
            other => Err(ParseEnumError {
                kind: "join kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Declared pair of datasets whose staging tables must join cleanly.
/// The left side is the base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub name: String,
    pub left_dataset: String,
    pub right_dataset: String,
    pub left_staging: TableRef,
    pub right_staging: TableRef,
    pub left_layout: StagingLayout,
    pub right_layout: StagingLayout,
    pub kind: JoinKind,
}

impl JoinSpec {
    pub fn grain(&self) -> &Grain {
        &self.left_layout.grain
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasureKind {
    /// Mean of a dataset's metric over the group, nulls ignored.
    Average { dataset: String },
    /// Mean of `income * periods_per_year / price * 100` per grain row.
    YieldPct {
        income: String,
        price: String,
        periods_per_year: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub output: Ident,
    #[serde(flatten)]
    pub kind: MeasureKind,
}

/// Aggregate table family, one physical table per horizon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MartSpec {
    pub name: String,
    pub schema: Ident,
    pub table_template: String,
    pub horizons_months: Vec<u32>,
    pub base_dataset: String,
    pub group_by: Ident,
    pub measures: Vec<MeasureSpec>,
}

impl MartSpec {
    pub fn table_for(&self, horizon_months: u32) -> Result<TableRef, IdentError> {
        let name = self
            .table_template
            .replace("{horizon}", &horizon_months.to_string());
        Ok(TableRef::new(self.schema.clone(), Ident::new(name)?))
    }

    pub fn layout(&self) -> MartLayout {
        MartLayout {
            group_column: self.group_by.clone(),
            measures: self.measures.iter().map(|m| m.output.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MartLayout {
    pub group_column: Ident,
    pub measures: Vec<Ident>,
}

/// Raw CSV snapshot, header plus rows, all text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Typed staging row. Non-grain, non-metric columns travel as attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRow {
    pub entity: String,
    pub date: NaiveDate,
    pub metric: Option<f64>,
    pub attributes: BTreeMap<String, String>,
}

impl StagingRow {
    pub fn grain_key(&self) -> (&str, NaiveDate) {
        (self.entity.as_str(), self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MartRow {
    pub group: String,
    pub date: NaiveDate,
    pub measures: Vec<Option<f64>>,
    pub member_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleAuditMetrics {
    pub row_count: u64,
    pub duplicate_keys: u64,
    pub broken_keys: u64,
    pub metric_null_pct: f64,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

/// Append-only ledger row for one dataset in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleAuditRecord {
    pub dataset_name: String,
    pub run_id: Uuid,
    pub batch_id: Uuid,
    pub source_file_name: String,
    pub source_url: String,
    pub local_path: String,
    pub fingerprint: String,
    pub fingerprint_status: FingerprintStatus,
    pub fingerprint_detail: String,
    pub entity_key: String,
    pub date_key: String,
    /// Absent on `skip` records: nothing was staged.
    pub metrics: Option<SingleAuditMetrics>,
    pub verdict: Verdict,
    pub reason: String,
    pub downloaded_at: DateTime<Utc>,
    pub audited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAuditMetrics {
    pub base_rows: u64,
    pub joined_rows: u64,
    pub fanout_dupes: u64,
    /// `joined_rows - base_rows`: positive is fan-out, negative is key loss.
    pub row_preservation_delta: i64,
    pub base_metric_pct: f64,
    pub metric_coverage_pct: f64,
}

/// Append-only ledger row for one declared join in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAuditRecord {
    pub join_name: String,
    pub run_id: Uuid,
    pub batch_id: Uuid,
    pub left_dataset: String,
    pub right_dataset: String,
    pub join_kind: JoinKind,
    pub entity_key: String,
    pub date_key: String,
    /// Absent when a side had no staging table to join.
    pub metrics: Option<JoinAuditMetrics>,
    pub verdict: Verdict,
    pub reason: String,
    pub audited_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_rejects_quotes_and_whitespace() {
        assert!(Ident::new("stg_zillow_zhvi").is_ok());
        assert!(Ident::new("mart_us_previous_12M_state_date_avgs").is_ok());
        assert_eq!(Ident::new(""), Err(IdentError::Empty));
        assert!(matches!(
            Ident::new("x\"; drop table ops"),
            Err(IdentError::InvalidCharacters(_))
        ));
        assert!(matches!(Ident::new("1abc"), Err(IdentError::InvalidCharacters(_))));
        assert!(matches!(Ident::new("a".repeat(64)), Err(IdentError::TooLong(_))));
    }

    #[test]
    fn ident_deserializes_through_validation() {
        let ok: Ident = serde_json::from_str("\"region_id\"").unwrap();
        assert_eq!(ok.quoted(), "\"region_id\"");
        assert!(serde_json::from_str::<Ident>("\"region id\"").is_err());
    }

    #[test]
    fn verdict_worst_wins_and_skip_never_dominates() {
        assert_eq!(Verdict::Pass.worst(Verdict::Warn), Verdict::Warn);
        assert_eq!(Verdict::Fail.worst(Verdict::Warn), Verdict::Fail);
        assert_eq!(Verdict::Skip.worst(Verdict::Pass), Verdict::Pass);
        assert!(Verdict::Skip.is_accepting());
        assert!(!Verdict::Fail.is_accepting());
        assert!(!Verdict::Warn.is_failing());
    }

    #[test]
    fn fingerprint_classification() {
        assert_eq!(FingerprintStatus::classify("ab", None), FingerprintStatus::New);
        assert_eq!(
            FingerprintStatus::classify("ab", Some("ab")),
            FingerprintStatus::Unchanged
        );
        assert_eq!(
            FingerprintStatus::classify("ab", Some("cd")),
            FingerprintStatus::Changed
        );
    }

    #[test]
    fn iso_date_is_strict() {
        assert!(KeyFormat::IsoDate.matches("2024-01-31"));
        assert!(!KeyFormat::IsoDate.matches("2024-1-31"));
        assert!(!KeyFormat::IsoDate.matches("2024-02-30"));
        assert!(!KeyFormat::IsoDate.matches("RegionName"));
        assert!(KeyFormat::Integer.matches("102001"));
        assert!(!KeyFormat::Integer.matches("10a"));
    }

    #[test]
    fn source_file_name_strips_query() {
        let spec = DatasetSpec {
            name: "zhvi".into(),
            source_url: "https://example.test/research/Metro_zhvi.csv?t=1".into(),
            raw_table: TableRef::new(Ident::new("re").unwrap(), Ident::new("raw").unwrap()),
            staging_table: TableRef::new(Ident::new("re").unwrap(), Ident::new("stg").unwrap()),
            grain: Grain {
                entity_key: Ident::new("region_id").unwrap(),
                date_key: Ident::new("date").unwrap(),
            },
            metric_column: Ident::new("home_prices").unwrap(),
            coercion: CoercionRule::default(),
            renames: vec![],
            layout: SourceLayout::Long,
        };
        assert_eq!(spec.source_file_name(), "Metro_zhvi.csv");
    }

    #[test]
    fn mart_table_name_from_template() {
        let mart = MartSpec {
            name: "state".into(),
            schema: Ident::new("real_estate").unwrap(),
            table_template: "mart_us_previous_{horizon}M_state_date_avgs".into(),
            horizons_months: vec![12, 36],
            base_dataset: "zhvi".into(),
            group_by: Ident::new("state_name").unwrap(),
            measures: vec![],
        };
        assert_eq!(
            mart.table_for(36).unwrap().to_string(),
            "real_estate.mart_us_previous_36M_state_date_avgs"
        );
    }
}
