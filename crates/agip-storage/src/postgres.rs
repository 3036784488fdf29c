//! PostgreSQL warehouse. Identifiers come from validated [`Ident`]s and are
//! always quoted; every value is a bound parameter.

use std::collections::BTreeMap;
use std::time::Duration;

use agip_core::{
    FingerprintStatus, Ident, JoinAuditMetrics, JoinAuditRecord, JoinKind, MartLayout, MartRow,
    SingleAuditMetrics, SingleAuditRecord, StagingLayout, StagingRow, TableRef, Verdict,
};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::warehouse::{AuditTables, RawLoad, Warehouse, WarehouseError, WarehouseTx};

/// Keeps each multi-row INSERT well under the 65535 bind limit.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    audit: AuditTables,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str, audit: AuditTables) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, audit))
    }

    pub fn from_pool(pool: PgPool, audit: AuditTables) -> Self {
        Self { pool, audit }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, WarehouseError> {
        let tx = self.pool.begin().await?;
        Ok(PgTx {
            tx,
            audit: self.audit.clone(),
        })
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
    audit: AuditTables,
}

impl PgTx {
    async fn execute(&mut self, sql: &str) -> Result<(), WarehouseError> {
        sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn ensure_schema(&mut self, schema: &Ident) -> Result<(), WarehouseError> {
        self.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema.quoted()))
            .await
    }

    async fn recreate_table(&mut self, table: &TableRef, columns: &str) -> Result<(), WarehouseError> {
        self.ensure_schema(&table.schema).await?;
        self.execute(&format!("DROP TABLE IF EXISTS {}", table.quoted()))
            .await?;
        self.execute(&format!("CREATE TABLE {} ({columns})", table.quoted()))
            .await
    }

    async fn table_exists(&mut self, table: &TableRef) -> Result<bool, WarehouseError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table.quoted())
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists)
    }

    async fn count_failing(&mut self, table: TableRef, run_id: Uuid) -> Result<u64, WarehouseError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE run_id = $1 AND status = 'fail'",
            table.quoted()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(run_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count.max(0) as u64)
    }
}

fn corrupt(table: &TableRef, detail: impl ToString) -> WarehouseError {
    WarehouseError::Corrupt {
        table: table.to_string(),
        detail: detail.to_string(),
    }
}

fn staging_row(row: &PgRow) -> Result<StagingRow, WarehouseError> {
    let attributes: Json<BTreeMap<String, String>> = row.try_get("attributes")?;
    Ok(StagingRow {
        entity: row.try_get("entity")?,
        date: row.try_get("date")?,
        metric: row.try_get("metric")?,
        attributes: attributes.0,
    })
}

fn single_audit_row(table: &TableRef, row: &PgRow) -> Result<SingleAuditRecord, WarehouseError> {
    let row_count: Option<i64> = row.try_get("row_count")?;
    let metrics = match row_count {
        Some(row_count) => Some(SingleAuditMetrics {
            row_count: row_count.max(0) as u64,
            duplicate_keys: row.try_get::<Option<i64>, _>("dupes")?.unwrap_or(0).max(0) as u64,
            broken_keys: row
                .try_get::<Option<i64>, _>("broken_keys")?
                .unwrap_or(0)
                .max(0) as u64,
            metric_null_pct: row
                .try_get::<Option<f64>, _>("metric_null_pct")?
                .unwrap_or(0.0),
            min_date: row.try_get("min_date")?,
            max_date: row.try_get("max_date")?,
        }),
        None => None,
    };

    let status: String = row.try_get("status")?;
    let hash_status: String = row.try_get("hash_check_status")?;
    Ok(SingleAuditRecord {
        dataset_name: row.try_get("dataset_name")?,
        run_id: row.try_get("run_id")?,
        batch_id: row.try_get("batch_id")?,
        source_file_name: row.try_get("source_file_name")?,
        source_url: row.try_get("source_url")?,
        local_path: row.try_get("local_path")?,
        fingerprint: row.try_get("source_file_hash")?,
        fingerprint_status: hash_status
            .parse::<FingerprintStatus>()
            .map_err(|err| corrupt(table, err))?,
        fingerprint_detail: row.try_get("hash_check_details")?,
        entity_key: row.try_get("key1")?,
        date_key: row.try_get("key2")?,
        metrics,
        verdict: status.parse::<Verdict>().map_err(|err| corrupt(table, err))?,
        reason: row.try_get("reason")?,
        downloaded_at: row.try_get("downloaded_at")?,
        audited_at: row.try_get("audited_at")?,
    })
}

fn join_audit_row(table: &TableRef, row: &PgRow) -> Result<JoinAuditRecord, WarehouseError> {
    let base_rows: Option<i64> = row.try_get("base_rows")?;
    let metrics = match base_rows {
        Some(base_rows) => Some(JoinAuditMetrics {
            base_rows: base_rows.max(0) as u64,
            joined_rows: row
                .try_get::<Option<i64>, _>("joined_rows")?
                .unwrap_or(0)
                .max(0) as u64,
            fanout_dupes: row
                .try_get::<Option<i64>, _>("fanout_dupes")?
                .unwrap_or(0)
                .max(0) as u64,
            row_preservation_delta: row
                .try_get::<Option<i64>, _>("row_preservation_delta")?
                .unwrap_or(0),
            base_metric_pct: row
                .try_get::<Option<f64>, _>("base_metric_pct")?
                .unwrap_or(0.0),
            metric_coverage_pct: row
                .try_get::<Option<f64>, _>("metric_coverage_pct")?
                .unwrap_or(0.0),
        }),
        None => None,
    };

    let status: String = row.try_get("status")?;
    let join_type: String = row.try_get("join_type")?;
    Ok(JoinAuditRecord {
        join_name: row.try_get("join_name")?,
        run_id: row.try_get("run_id")?,
        batch_id: row.try_get("batch_id")?,
        left_dataset: row.try_get("left_dataset")?,
        right_dataset: row.try_get("right_dataset")?,
        join_kind: join_type
            .parse::<JoinKind>()
            .map_err(|err| corrupt(table, err))?,
        entity_key: row.try_get("key1")?,
        date_key: row.try_get("key2")?,
        metrics,
        verdict: status.parse::<Verdict>().map_err(|err| corrupt(table, err))?,
        reason: row.try_get("reason")?,
        audited_at: row.try_get("audited_at")?,
    })
}

#[async_trait]
impl WarehouseTx for PgTx {
    async fn ensure_audit_tables(&mut self) -> Result<(), WarehouseError> {
        let single = self.audit.single();
        let join = self.audit.join();
        self.ensure_schema(&single.schema).await?;

        self.execute(&format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                audit_id bigserial PRIMARY KEY,
                dataset_name text NOT NULL,
                source_file_name text NOT NULL,
                source_url text NOT NULL,
                local_path text NOT NULL,
                key1 text NOT NULL,
                key2 text NOT NULL,
                grain text NOT NULL,
                row_count bigint,
                dupes bigint,
                broken_keys bigint,
                metric_null_pct double precision,
                min_date date,
                max_date date,
                status text NOT NULL,
                reason text NOT NULL,
                downloaded_at timestamptz NOT NULL,
                audited_at timestamptz NOT NULL
            )"#,
            single.quoted()
        ))
        .await?;

        // Lineage columns arrived after the first deployments; keep the
        // evolution additive so older ledgers upgrade in place.
        for column in [
            "run_id uuid",
            "batch_id uuid",
            "source_file_hash text",
            "hash_check_status text",
            "hash_check_details text",
        ] {
            self.execute(&format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {column}",
                single.quoted()
            ))
            .await?;
        }

        self.execute(&format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                audit_id bigserial PRIMARY KEY,
                join_name text NOT NULL,
                run_id uuid NOT NULL,
                batch_id uuid NOT NULL,
                left_dataset text NOT NULL,
                right_dataset text NOT NULL,
                join_type text NOT NULL,
                key1 text NOT NULL,
                key2 text NOT NULL,
                base_rows bigint,
                joined_rows bigint,
                fanout_dupes bigint,
                row_preservation_delta bigint,
                base_metric_pct double precision,
                metric_coverage_pct double precision,
                status text NOT NULL,
                reason text NOT NULL,
                audited_at timestamptz NOT NULL
            )"#,
            join.quoted()
        ))
        .await
    }

    async fn replace_raw_table(
        &mut self,
        table: &TableRef,
        load: RawLoad<'_>,
    ) -> Result<u64, WarehouseError> {
        self.recreate_table(
            table,
            "run_id uuid NOT NULL, batch_id uuid NOT NULL, pulled_at timestamptz NOT NULL, \
             row_no bigint NOT NULL, record jsonb NOT NULL",
        )
        .await?;

        let columns = &load.snapshot.columns;
        for (chunk_no, chunk) in load.snapshot.rows.chunks(INSERT_CHUNK_ROWS).enumerate() {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} (run_id, batch_id, pulled_at, row_no, record) ",
                table.quoted()
            ));
            qb.push_values(chunk.iter().enumerate(), |mut b, (offset, values)| {
                let record = columns
                    .iter()
                    .zip(values.iter())
                    .map(|(column, value)| (column.clone(), JsonValue::String(value.clone())))
                    .collect::<Map<String, JsonValue>>();
                let row_no = (chunk_no * INSERT_CHUNK_ROWS + offset) as i64;
                b.push_bind(load.run_id)
                    .push_bind(load.batch_id)
                    .push_bind(load.pulled_at)
                    .push_bind(row_no)
                    .push_bind(Json(JsonValue::Object(record)));
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        debug!(%table, rows = load.snapshot.rows.len(), "raw table replaced");
        Ok(load.snapshot.rows.len() as u64)
    }

    async fn replace_staging_table(
        &mut self,
        table: &TableRef,
        layout: &StagingLayout,
        rows: &[StagingRow],
    ) -> Result<u64, WarehouseError> {
        let entity = layout.grain.entity_key.quoted();
        let date = layout.grain.date_key.quoted();
        let metric = layout.metric.quoted();
        self.recreate_table(
            table,
            &format!(
                "{entity} text NOT NULL, {date} date NOT NULL, {metric} double precision, \
                 attributes jsonb NOT NULL"
            ),
        )
        .await?;

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} ({entity}, {date}, {metric}, attributes) ",
                table.quoted()
            ));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.entity.clone())
                    .push_bind(row.date)
                    .push_bind(row.metric)
                    .push_bind(Json(row.attributes.clone()));
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        debug!(%table, rows = rows.len(), "staging table replaced");
        Ok(rows.len() as u64)
    }

    async fn load_staging_table(
        &mut self,
        table: &TableRef,
        layout: &StagingLayout,
    ) -> Result<Option<Vec<StagingRow>>, WarehouseError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {}::text AS entity, {} AS date, {}::double precision AS metric, attributes \
             FROM {} ORDER BY 1, 2",
            layout.grain.entity_key.quoted(),
            layout.grain.date_key.quoted(),
            layout.metric.quoted(),
            table.quoted()
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.iter().map(staging_row).collect::<Result<Vec<_>, _>>().map(Some)
    }

    async fn last_accepted_fingerprint(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<String>, WarehouseError> {
        let sql = format!(
            "SELECT source_file_hash FROM {} \
             WHERE dataset_name = $1 \
               AND source_file_hash IS NOT NULL \
               AND status IN ('pass', 'warn', 'skip') \
             ORDER BY downloaded_at DESC, audit_id DESC \
             LIMIT 1",
            self.audit.single().quoted()
        );
        let hash: Option<String> = sqlx::query_scalar(&sql)
            .bind(dataset_name)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(hash)
    }

    async fn last_restaged_fingerprint(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<(String, Verdict)>, WarehouseError> {
        let table = self.audit.single();
        let sql = format!(
            "SELECT source_file_hash, status FROM {} \
             WHERE dataset_name = $1 \
               AND source_file_hash IS NOT NULL \
               AND row_count IS NOT NULL \
             ORDER BY downloaded_at DESC, audit_id DESC \
             LIMIT 1",
            table.quoted()
        );
        let row: Option<(String, String)> = sqlx::query_as(&sql)
            .bind(dataset_name)
            .fetch_optional(&mut *self.tx)
            .await?;
        match row {
            Some((hash, status)) => {
                let verdict = status.parse::<Verdict>().map_err(|err| corrupt(&table, err))?;
                Ok(Some((hash, verdict)))
            }
            None => Ok(None),
        }
    }

    async fn append_single_audit(
        &mut self,
        record: &SingleAuditRecord,
    ) -> Result<(), WarehouseError> {
        let sql = format!(
            "INSERT INTO {} (\
                dataset_name, run_id, batch_id, source_file_name, source_url, local_path, \
                source_file_hash, hash_check_status, hash_check_details, key1, key2, grain, \
                row_count, dupes, broken_keys, metric_null_pct, min_date, max_date, \
                status, reason, downloaded_at, audited_at\
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                       $17, $18, $19, $20, $21, $22)",
            self.audit.single().quoted()
        );
        let metrics = record.metrics.as_ref();
        sqlx::query(&sql)
            .bind(&record.dataset_name)
            .bind(record.run_id)
            .bind(record.batch_id)
            .bind(&record.source_file_name)
            .bind(&record.source_url)
            .bind(&record.local_path)
            .bind(&record.fingerprint)
            .bind(record.fingerprint_status.as_str())
            .bind(&record.fingerprint_detail)
            .bind(&record.entity_key)
            .bind(&record.date_key)
            .bind(format!("({}, {})", record.entity_key, record.date_key))
            .bind(metrics.map(|m| m.row_count as i64))
            .bind(metrics.map(|m| m.duplicate_keys as i64))
            .bind(metrics.map(|m| m.broken_keys as i64))
            .bind(metrics.map(|m| m.metric_null_pct))
            .bind(metrics.and_then(|m| m.min_date))
            .bind(metrics.and_then(|m| m.max_date))
            .bind(record.verdict.as_str())
            .bind(&record.reason)
            .bind(record.downloaded_at)
            .bind(record.audited_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn append_join_audit(&mut self, record: &JoinAuditRecord) -> Result<(), WarehouseError> {
        let sql = format!(
            "INSERT INTO {} (\
                join_name, run_id, batch_id, left_dataset, right_dataset, join_type, key1, key2, \
                base_rows, joined_rows, fanout_dupes, row_preservation_delta, base_metric_pct, \
                metric_coverage_pct, status, reason, audited_at\
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            self.audit.join().quoted()
        );
        let metrics = record.metrics.as_ref();
        sqlx::query(&sql)
            .bind(&record.join_name)
            .bind(record.run_id)
            .bind(record.batch_id)
            .bind(&record.left_dataset)
            .bind(&record.right_dataset)
            .bind(record.join_kind.as_str())
            .bind(&record.entity_key)
            .bind(&record.date_key)
            .bind(metrics.map(|m| m.base_rows as i64))
            .bind(metrics.map(|m| m.joined_rows as i64))
            .bind(metrics.map(|m| m.fanout_dupes as i64))
            .bind(metrics.map(|m| m.row_preservation_delta))
            .bind(metrics.map(|m| m.base_metric_pct))
            .bind(metrics.map(|m| m.metric_coverage_pct))
            .bind(record.verdict.as_str())
            .bind(&record.reason)
            .bind(record.audited_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn single_audits_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Vec<SingleAuditRecord>, WarehouseError> {
        let table = self.audit.single();
        let sql = format!(
            "SELECT * FROM {} WHERE run_id = $1 ORDER BY downloaded_at, audit_id",
            table.quoted()
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(|row| single_audit_row(&table, row)).collect()
    }

    async fn join_audits_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Vec<JoinAuditRecord>, WarehouseError> {
        let table = self.audit.join();
        let sql = format!(
            "SELECT * FROM {} WHERE run_id = $1 ORDER BY audited_at, audit_id",
            table.quoted()
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(|row| join_audit_row(&table, row)).collect()
    }

    async fn count_failing_single(&mut self, run_id: Uuid) -> Result<u64, WarehouseError> {
        let table = self.audit.single();
        self.count_failing(table, run_id).await
    }

    async fn count_failing_join(&mut self, run_id: Uuid) -> Result<u64, WarehouseError> {
        let table = self.audit.join();
        self.count_failing(table, run_id).await
    }

    async fn replace_mart_table(
        &mut self,
        table: &TableRef,
        layout: &MartLayout,
        rows: &[MartRow],
    ) -> Result<u64, WarehouseError> {
        let group = layout.group_column.quoted();
        let measure_defs = layout
            .measures
            .iter()
            .map(|m| format!("{} double precision, ", m.quoted()))
            .collect::<String>();
        self.recreate_table(
            table,
            &format!("{group} text NOT NULL, \"date\" date NOT NULL, {measure_defs}member_count bigint NOT NULL"),
        )
        .await?;

        let measure_cols = layout
            .measures
            .iter()
            .map(|m| format!("{}, ", m.quoted()))
            .collect::<String>();
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} ({group}, \"date\", {measure_cols}member_count) ",
                table.quoted()
            ));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.group.clone()).push_bind(row.date);
                for value in &row.measures {
                    b.push_bind(*value);
                }
                b.push_bind(row.member_count);
            });
            qb.build().execute(&mut *self.tx).await?;
        }
        debug!(%table, rows = rows.len(), "mart table replaced");
        Ok(rows.len() as u64)
    }

    async fn load_mart_table(
        &mut self,
        table: &TableRef,
        layout: &MartLayout,
    ) -> Result<Option<Vec<MartRow>>, WarehouseError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let measure_cols = layout
            .measures
            .iter()
            .map(|m| format!("{}, ", m.quoted()))
            .collect::<String>();
        let sql = format!(
            "SELECT {}, \"date\", {measure_cols}member_count FROM {} ORDER BY 1, 2",
            layout.group_column.quoted(),
            table.quoted()
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        let width = layout.measures.len();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut measures = Vec::with_capacity(width);
            for i in 0..width {
                measures.push(row.try_get::<Option<f64>, _>(2 + i)?);
            }
            out.push(MartRow {
                group: row.try_get(0)?,
                date: row.try_get(1)?,
                measures,
                member_count: row.try_get(2 + width)?,
            });
        }
        Ok(Some(out))
    }

    async fn commit(self) -> Result<(), WarehouseError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), WarehouseError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
