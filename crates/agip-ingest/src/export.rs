//! Parquet snapshots of rebuilt marts with a checksum manifest.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

use agip_storage::SnapshotStore;

use crate::mart::BuiltMart;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

fn mart_batch(mart: &BuiltMart) -> Result<RecordBatch> {
    let mut fields = vec![
        ArrowField::new(mart.layout.group_column.as_str(), DataType::Utf8, false),
        ArrowField::new("date", DataType::Date32, false),
    ];
    fields.extend(
        mart.layout
            .measures
            .iter()
            .map(|m| ArrowField::new(m.as_str(), DataType::Float64, true)),
    );
    fields.push(ArrowField::new("member_count", DataType::Int64, false));
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            mart.rows.iter().map(|r| Some(r.group.as_str())).collect::<Vec<_>>(),
        )),
        Arc::new(Date32Array::from(
            mart.rows.iter().map(|r| days_since_epoch(r.date)).collect::<Vec<_>>(),
        )),
    ];
    for i in 0..mart.layout.measures.len() {
        columns.push(Arc::new(Float64Array::from(
            mart.rows
                .iter()
                .map(|r| r.measures.get(i).copied().flatten())
                .collect::<Vec<_>>(),
        )));
    }
    columns.push(Arc::new(Int64Array::from(
        mart.rows.iter().map(|r| r.member_count).collect::<Vec<_>>(),
    )));

    RecordBatch::try_new(schema, columns)
        .with_context(|| format!("building record batch for {}", mart.table))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: SnapshotStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Writes `<run_dir>/marts/<table>.parquet` per mart and a `manifest.json`.
/// Returns the manifest path.
pub fn export_marts(run_dir: &Path, marts: &[BuiltMart]) -> Result<std::path::PathBuf> {
    let mart_dir = run_dir.join("marts");
    std::fs::create_dir_all(&mart_dir)
        .with_context(|| format!("creating {}", mart_dir.display()))?;

    let mut files = Vec::with_capacity(marts.len());
    for mart in marts {
        let name = mart.table.name.as_str();
        let path = mart_dir.join(format!("{name}.parquet"));
        write_parquet(&path, mart_batch(mart)?)?;
        files.push(manifest_entry(name, run_dir, &path)?);
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = mart_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agip_core::{Ident, MartLayout, MartRow, TableRef};
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn built() -> BuiltMart {
        let ident = |s: &str| Ident::new(s).unwrap();
        BuiltMart {
            mart: "state".into(),
            table: TableRef::new(ident("real_estate"), ident("mart_us_previous_12M_state_date_avgs")),
            horizon_months: 12,
            layout: MartLayout {
                group_column: ident("state_name"),
                measures: vec![ident("avg_home_price"), ident("gross_yield_pct")],
            },
            rows: vec![
                MartRow {
                    group: "CA".into(),
                    date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
                    measures: vec![Some(750_000.0), None],
                    member_count: 3,
                },
                MartRow {
                    group: "NY".into(),
                    date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
                    measures: vec![Some(450_000.0), Some(5.25)],
                    member_count: 2,
                },
            ],
        }
    }

    #[test]
    fn export_writes_parquet_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = export_marts(dir.path(), &[built()]).unwrap();

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 1);
        let entry = &manifest.files[0];
        assert_eq!(entry.path, "marts/mart_us_previous_12M_state_date_avgs.parquet");
        assert_eq!(entry.sha256.len(), 64);

        let file = File::open(dir.path().join(&entry.path)).unwrap();
        let reader = SerializedFileReader::new(file).unwrap();
        let meta = reader.metadata();
        assert_eq!(meta.file_metadata().num_rows(), 2);
        assert_eq!(meta.file_metadata().schema_descr().num_columns(), 5);
        assert_eq!(entry.bytes, std::fs::metadata(dir.path().join(&entry.path)).unwrap().len());
    }

    #[test]
    fn dates_are_days_since_epoch() {
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()), 1);
    }
}
