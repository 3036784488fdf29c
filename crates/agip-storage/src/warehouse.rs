use agip_core::{
    Ident, JoinAuditRecord, MartLayout, MartRow, RawSnapshot, SingleAuditRecord, StagingLayout,
    StagingRow, TableRef, Verdict,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt ledger row in {table}: {detail}")]
    Corrupt { table: String, detail: String },
}

/// Where the two append-only audit tables live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTables {
    pub ops_schema: Ident,
    pub single_audit: Ident,
    pub join_audit: Ident,
}

impl AuditTables {
    pub fn single(&self) -> TableRef {
        TableRef::new(self.ops_schema.clone(), self.single_audit.clone())
    }

    pub fn join(&self) -> TableRef {
        TableRef::new(self.ops_schema.clone(), self.join_audit.clone())
    }
}

/// A raw snapshot plus the lineage tags stamped on every row.
#[derive(Debug, Clone, Copy)]
pub struct RawLoad<'a> {
    pub run_id: Uuid,
    pub batch_id: Uuid,
    pub pulled_at: DateTime<Utc>,
    pub snapshot: &'a RawSnapshot,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    type Tx: WarehouseTx;

    /// Opens the single transaction an invocation runs in.
    async fn begin(&self) -> Result<Self::Tx, WarehouseError>;
}

/// Every read and write of one invocation. Nothing is visible to other
/// invocations until `commit`.
#[async_trait]
pub trait WarehouseTx: Send {
    async fn ensure_audit_tables(&mut self) -> Result<(), WarehouseError>;

    /// Drops and recreates `table` with the snapshot rows. Returns rows written.
    async fn replace_raw_table(
        &mut self,
        table: &TableRef,
        load: RawLoad<'_>,
    ) -> Result<u64, WarehouseError>;

    async fn replace_staging_table(
        &mut self,
        table: &TableRef,
        layout: &StagingLayout,
        rows: &[StagingRow],
    ) -> Result<u64, WarehouseError>;

    /// `None` when the table does not exist.
    async fn load_staging_table(
        &mut self,
        table: &TableRef,
        layout: &StagingLayout,
    ) -> Result<Option<Vec<StagingRow>>, WarehouseError>;

    /// Fingerprint of the newest accepting (`pass`/`warn`/`skip`) record.
    async fn last_accepted_fingerprint(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<String>, WarehouseError>;

    /// Fingerprint and verdict of the newest record that rebuilt staging
    /// (metrics present), whatever its verdict. Staging holds that content.
    async fn last_restaged_fingerprint(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<(String, Verdict)>, WarehouseError>;

    async fn append_single_audit(&mut self, record: &SingleAuditRecord)
        -> Result<(), WarehouseError>;

    async fn append_join_audit(&mut self, record: &JoinAuditRecord) -> Result<(), WarehouseError>;

    /// Records of one run, oldest first.
    async fn single_audits_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Vec<SingleAuditRecord>, WarehouseError>;

    async fn join_audits_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Vec<JoinAuditRecord>, WarehouseError>;

    async fn count_failing_single(&mut self, run_id: Uuid) -> Result<u64, WarehouseError>;

    async fn count_failing_join(&mut self, run_id: Uuid) -> Result<u64, WarehouseError>;

    /// Drop-then-recreate; there is no rename swap.
    async fn replace_mart_table(
        &mut self,
        table: &TableRef,
        layout: &MartLayout,
        rows: &[MartRow],
    ) -> Result<u64, WarehouseError>;

    async fn load_mart_table(
        &mut self,
        table: &TableRef,
        layout: &MartLayout,
    ) -> Result<Option<Vec<MartRow>>, WarehouseError>;

    async fn commit(self) -> Result<(), WarehouseError>;

    async fn rollback(self) -> Result<(), WarehouseError>;
}
