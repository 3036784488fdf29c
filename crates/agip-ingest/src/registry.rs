//! `pipeline.yaml`: the dataset, join and mart registry.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use agip_core::{
    CoercionRule, DatasetSpec, Grain, Ident, IdentError, JoinKind, JoinSpec, KeyFormat,
    MartSpec, MeasureKind, MeasureSpec, Rename, SourceLayout, TableRef,
};
use agip_storage::AuditTables;
use agip_transform::{TransformError, TransformProgram};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::SingleAuditPolicy;
use crate::join::JoinAuditPolicy;

/// Columns every mart table carries besides the group column and measures.
const RESERVED_MART_COLUMNS: [&str; 2] = ["date", "member_count"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid identifier in {field}: {source}")]
    Ident {
        field: String,
        #[source]
        source: IdentError,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("transform program for dataset `{dataset}`: {source}")]
    Program {
        dataset: String,
        #[source]
        source: TransformError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDetection {
    /// Every run restages every dataset; the fingerprint is informational.
    AlwaysRebuild,
    /// Unchanged snapshots are not restaged and get a `skip` record.
    #[default]
    SkipUnchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditPolicy {
    pub single: SingleAuditPolicy,
    pub join: JoinAuditPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    #[serde(default = "default_domain_schema")]
    pub domain_schema: String,
    #[serde(default = "default_ops_schema")]
    pub ops_schema: String,
    #[serde(default = "default_single_audit_table")]
    pub single_audit_table: String,
    #[serde(default = "default_join_audit_table")]
    pub join_audit_table: String,
    #[serde(default)]
    pub change_detection: ChangeDetection,
    /// Applied to every dataset before its own renames.
    #[serde(default)]
    pub renames: Vec<Rename>,
    #[serde(default)]
    pub policy: AuditPolicy,
    pub datasets: Vec<DatasetEntry>,
    #[serde(default)]
    pub joins: Vec<JoinEntry>,
    #[serde(default)]
    pub marts: Vec<MartEntry>,
}

fn default_domain_schema() -> String {
    "real_estate".to_string()
}

fn default_ops_schema() -> String {
    "ops".to_string()
}

fn default_single_audit_table() -> String {
    "single_sheet_audit".to_string()
}

fn default_join_audit_table() -> String {
    "post_join_audit".to_string()
}

fn default_true() -> bool {
    true
}

fn default_layout() -> SourceLayout {
    SourceLayout::Wide {
        header_format: KeyFormat::IsoDate,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source_url: String,
    pub raw_table: String,
    pub staging_table: String,
    /// `[entity_key, date_key]`
    pub grain: (String, String),
    pub metric_column: String,
    #[serde(default)]
    pub coercion: CoercionRule,
    #[serde(default = "default_layout")]
    pub layout: SourceLayout,
    #[serde(default)]
    pub renames: Vec<Rename>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinEntry {
    pub name: String,
    pub left: String,
    pub right: String,
    #[serde(default = "default_join_kind")]
    pub kind: JoinKind,
}

fn default_join_kind() -> JoinKind {
    JoinKind::Inner
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MartEntry {
    pub name: String,
    /// Defaults to `domain_schema`.
    #[serde(default)]
    pub schema: Option<String>,
    pub table_template: String,
    pub horizons_months: Vec<u32>,
    pub base: String,
    pub group_by: String,
    pub measures: Vec<MeasureSpec>,
}

/// A dataset with its compiled staging program.
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub spec: DatasetSpec,
    pub program: TransformProgram,
}

/// Validated registry. Building one compiles every transform program, so
/// configuration faults surface before any dataset is touched.
#[derive(Debug, Clone)]
pub struct Registry {
    pub audit_tables: AuditTables,
    pub change_detection: ChangeDetection,
    pub policy: AuditPolicy,
    pub datasets: Vec<PreparedDataset>,
    pub joins: Vec<JoinSpec>,
    pub marts: Vec<MartSpec>,
}

fn ident(field: impl Into<String>, value: &str) -> Result<Ident, ConfigError> {
    Ident::new(value).map_err(|source| ConfigError::Ident {
        field: field.into(),
        source,
    })
}

fn check_pct(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{field} must be within 0..=100, got {value}"
        )));
    }
    Ok(())
}

impl AuditPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        let single = &self.single;
        check_pct("policy.single.metric_null_warn_pct", single.metric_null_warn_pct)?;
        check_pct("policy.single.metric_null_fail_pct", single.metric_null_fail_pct)?;
        if single.metric_null_warn_pct > single.metric_null_fail_pct {
            return Err(ConfigError::Invalid(
                "policy.single: metric_null_warn_pct exceeds metric_null_fail_pct".into(),
            ));
        }
        let join = &self.join;
        check_pct("policy.join.coverage_warn_pct", join.coverage_warn_pct)?;
        check_pct("policy.join.coverage_fail_pct", join.coverage_fail_pct)?;
        if join.coverage_fail_pct > join.coverage_warn_pct {
            return Err(ConfigError::Invalid(
                "policy.join: coverage_fail_pct exceeds coverage_warn_pct".into(),
            ));
        }
        Ok(())
    }
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PipelineFile =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_file(file)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let file: PipelineFile =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::from_file(file)
    }

    pub fn from_file(file: PipelineFile) -> Result<Self, ConfigError> {
        file.policy.validate()?;
        let domain_schema = ident("domain_schema", &file.domain_schema)?;
        let audit_tables = AuditTables {
            ops_schema: ident("ops_schema", &file.ops_schema)?,
            single_audit: ident("single_audit_table", &file.single_audit_table)?,
            join_audit: ident("join_audit_table", &file.join_audit_table)?,
        };

        let datasets = prepare_datasets(&file, &domain_schema)?;
        let by_name = datasets
            .iter()
            .map(|d| (d.spec.name.as_str(), &d.spec))
            .collect::<BTreeMap<_, _>>();
        let joins = file
            .joins
            .iter()
            .map(|entry| resolve_join(entry, &by_name))
            .collect::<Result<Vec<_>, _>>()?;
        let mut join_names = HashSet::new();
        for join in &joins {
            if !join_names.insert(join.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate join `{}`", join.name)));
            }
        }

        let mut mart_tables = HashSet::new();
        let mut marts = Vec::with_capacity(file.marts.len());
        for entry in &file.marts {
            let mart = resolve_mart(entry, &domain_schema, &by_name)?;
            for &horizon in &mart.horizons_months {
                let table = mart.table_for(horizon).map_err(|source| ConfigError::Ident {
                    field: format!("marts.{}.table_template", mart.name),
                    source,
                })?;
                if !mart_tables.insert(table.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "mart table {table} is produced more than once"
                    )));
                }
            }
            marts.push(mart);
        }

        Ok(Self {
            audit_tables,
            change_detection: file.change_detection,
            policy: file.policy,
            datasets,
            joins,
            marts,
        })
    }

    pub fn dataset(&self, name: &str) -> Option<&PreparedDataset> {
        self.datasets.iter().find(|d| d.spec.name == name)
    }
}

fn prepare_datasets(
    file: &PipelineFile,
    domain_schema: &Ident,
) -> Result<Vec<PreparedDataset>, ConfigError> {
    let mut names = HashSet::new();
    let mut tables = HashSet::new();
    let mut prepared = Vec::new();

    for entry in file.datasets.iter().filter(|d| d.enabled) {
        if !names.insert(entry.name.clone()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate dataset `{}`",
                entry.name
            )));
        }
        let field = |f: &str| format!("datasets.{}.{f}", entry.name);
        let raw_table = TableRef::new(
            domain_schema.clone(),
            ident(field("raw_table"), &entry.raw_table)?,
        );
        let staging_table = TableRef::new(
            domain_schema.clone(),
            ident(field("staging_table"), &entry.staging_table)?,
        );
        for table in [&raw_table, &staging_table] {
            if !tables.insert(table.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "table {table} is used by more than one dataset"
                )));
            }
        }

        // A dataset rename on the same source column replaces the shared one.
        let mut renames = file
            .renames
            .iter()
            .filter(|shared| !entry.renames.iter().any(|own| own.from == shared.from))
            .cloned()
            .collect::<Vec<_>>();
        renames.extend(entry.renames.iter().cloned());

        let spec = DatasetSpec {
            name: entry.name.clone(),
            source_url: entry.source_url.clone(),
            raw_table,
            staging_table,
            grain: Grain {
                entity_key: ident(field("grain[0]"), &entry.grain.0)?,
                date_key: ident(field("grain[1]"), &entry.grain.1)?,
            },
            metric_column: ident(field("metric_column"), &entry.metric_column)?,
            coercion: entry.coercion.clone(),
            renames,
            layout: entry.layout,
        };
        let program =
            TransformProgram::for_dataset(&spec).map_err(|source| ConfigError::Program {
                dataset: spec.name.clone(),
                source,
            })?;
        prepared.push(PreparedDataset { spec, program });
    }

    if prepared.is_empty() {
        return Err(ConfigError::Invalid("no enabled datasets".into()));
    }
    Ok(prepared)
}

fn lookup<'a>(
    by_name: &BTreeMap<&str, &'a DatasetSpec>,
    owner: &str,
    name: &str,
) -> Result<&'a DatasetSpec, ConfigError> {
    by_name.get(name).copied().ok_or_else(|| {
        ConfigError::Invalid(format!(
            "{owner} references unknown or disabled dataset `{name}`"
        ))
    })
}

fn resolve_join(
    entry: &JoinEntry,
    by_name: &BTreeMap<&str, &DatasetSpec>,
) -> Result<JoinSpec, ConfigError> {
    let owner = format!("join `{}`", entry.name);
    let left = lookup(by_name, &owner, &entry.left)?;
    let right = lookup(by_name, &owner, &entry.right)?;
    if left.name == right.name {
        return Err(ConfigError::Invalid(format!("{owner} joins `{}` to itself", left.name)));
    }
    if left.grain != right.grain {
        return Err(ConfigError::Invalid(format!(
            "{owner}: grain ({}, {}) differs from ({}, {})",
            left.grain.entity_key, left.grain.date_key, right.grain.entity_key, right.grain.date_key
        )));
    }
    Ok(JoinSpec {
        name: entry.name.clone(),
        left_dataset: left.name.clone(),
        right_dataset: right.name.clone(),
        left_staging: left.staging_table.clone(),
        right_staging: right.staging_table.clone(),
        left_layout: left.staging_layout(),
        right_layout: right.staging_layout(),
        kind: entry.kind,
    })
}

fn resolve_mart(
    entry: &MartEntry,
    domain_schema: &Ident,
    by_name: &BTreeMap<&str, &DatasetSpec>,
) -> Result<MartSpec, ConfigError> {
    let owner = format!("mart `{}`", entry.name);
    let base = lookup(by_name, &owner, &entry.base)?;

    if entry.horizons_months.is_empty() || entry.horizons_months.contains(&0) {
        return Err(ConfigError::Invalid(format!(
            "{owner}: horizons_months must be non-empty and positive"
        )));
    }
    if entry.horizons_months.len() > 1 && !entry.table_template.contains("{horizon}") {
        return Err(ConfigError::Invalid(format!(
            "{owner}: table_template needs a {{horizon}} placeholder for several horizons"
        )));
    }
    if entry.measures.is_empty() {
        return Err(ConfigError::Invalid(format!("{owner}: no measures")));
    }

    let group_by = ident(format!("marts.{}.group_by", entry.name), &entry.group_by)?;
    let mut outputs = HashSet::new();
    for measure in &entry.measures {
        let output = measure.output.as_str();
        if output == group_by.as_str() || RESERVED_MART_COLUMNS.contains(&output) {
            return Err(ConfigError::Invalid(format!(
                "{owner}: measure `{output}` collides with a reserved column"
            )));
        }
        if !outputs.insert(output) {
            return Err(ConfigError::Invalid(format!(
                "{owner}: duplicate measure `{output}`"
            )));
        }
        match &measure.kind {
            MeasureKind::Average { dataset } => {
                check_grain(lookup(by_name, &owner, dataset)?, base, &owner)?;
            }
            MeasureKind::YieldPct {
                income,
                price,
                periods_per_year,
            } => {
                check_grain(lookup(by_name, &owner, income)?, base, &owner)?;
                check_grain(lookup(by_name, &owner, price)?, base, &owner)?;
                if *periods_per_year == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "{owner}: measure `{output}` needs periods_per_year > 0"
                    )));
                }
            }
        }
    }

    let schema = match &entry.schema {
        Some(schema) => ident(format!("marts.{}.schema", entry.name), schema)?,
        None => domain_schema.clone(),
    };
    Ok(MartSpec {
        name: entry.name.clone(),
        schema,
        table_template: entry.table_template.clone(),
        horizons_months: entry.horizons_months.clone(),
        base_dataset: base.name.clone(),
        group_by,
        measures: entry.measures.clone(),
    })
}

fn check_grain(dataset: &DatasetSpec, base: &DatasetSpec, owner: &str) -> Result<(), ConfigError> {
    if dataset.grain != base.grain {
        return Err(ConfigError::Invalid(format!(
            "{owner}: dataset `{}` does not share the grain of base `{}`",
            dataset.name, base.name
        )));
    }
    Ok(())
}
