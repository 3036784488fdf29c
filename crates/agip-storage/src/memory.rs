use std::collections::BTreeMap;
use std::sync::Arc;

use agip_core::{
    JoinAuditRecord, MartLayout, MartRow, RawSnapshot, SingleAuditRecord, StagingLayout,
    StagingRow, TableRef, Verdict,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::warehouse::{RawLoad, Warehouse, WarehouseError, WarehouseTx};

#[derive(Debug, Clone, PartialEq)]
pub struct RawTableContent {
    pub run_id: Uuid,
    pub batch_id: Uuid,
    pub pulled_at: DateTime<Utc>,
    pub snapshot: RawSnapshot,
}

/// Committed contents of a [`MemoryWarehouse`].
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub raw: BTreeMap<TableRef, RawTableContent>,
    pub staging: BTreeMap<TableRef, Vec<StagingRow>>,
    pub marts: BTreeMap<TableRef, Vec<MartRow>>,
    pub single_audits: Vec<SingleAuditRecord>,
    pub join_audits: Vec<JoinAuditRecord>,
}

/// In-process warehouse for dry runs and tests. A transaction works on a
/// private copy that replaces the shared state on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, WarehouseError> {
        let working = self.state.lock().await.clone();
        Ok(MemoryTx {
            committed: Arc::clone(&self.state),
            working,
        })
    }
}

#[derive(Debug)]
pub struct MemoryTx {
    committed: Arc<Mutex<MemoryState>>,
    working: MemoryState,
}

#[async_trait]
impl WarehouseTx for MemoryTx {
    async fn ensure_audit_tables(&mut self) -> Result<(), WarehouseError> {
        Ok(())
    }

    async fn replace_raw_table(
        &mut self,
        table: &TableRef,
        load: RawLoad<'_>,
    ) -> Result<u64, WarehouseError> {
        self.working.raw.insert(
            table.clone(),
            RawTableContent {
                run_id: load.run_id,
                batch_id: load.batch_id,
                pulled_at: load.pulled_at,
                snapshot: load.snapshot.clone(),
            },
        );
        Ok(load.snapshot.rows.len() as u64)
    }

    async fn replace_staging_table(
        &mut self,
        table: &TableRef,
        _layout: &StagingLayout,
        rows: &[StagingRow],
    ) -> Result<u64, WarehouseError> {
        self.working.staging.insert(table.clone(), rows.to_vec());
        Ok(rows.len() as u64)
    }

    async fn load_staging_table(
        &mut self,
        table: &TableRef,
        _layout: &StagingLayout,
    ) -> Result<Option<Vec<StagingRow>>, WarehouseError> {
        Ok(self.working.staging.get(table).cloned())
    }

    async fn last_accepted_fingerprint(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<String>, WarehouseError> {
        // max_by_key keeps the last maximum, so ties resolve to the newest insert.
        Ok(self
            .working
            .single_audits
            .iter()
            .filter(|r| r.dataset_name == dataset_name && r.verdict.is_accepting())
            .max_by_key(|r| r.downloaded_at)
            .map(|r| r.fingerprint.clone()))
    }

    async fn last_restaged_fingerprint(
        &mut self,
        dataset_name: &str,
    ) -> Result<Option<(String, Verdict)>, WarehouseError> {
        Ok(self
            .working
            .single_audits
            .iter()
            .filter(|r| r.dataset_name == dataset_name && r.metrics.is_some())
            .max_by_key(|r| r.downloaded_at)
            .map(|r| (r.fingerprint.clone(), r.verdict)))
    }

    async fn append_single_audit(
        &mut self,
        record: &SingleAuditRecord,
    ) -> Result<(), WarehouseError> {
        self.working.single_audits.push(record.clone());
        Ok(())
    }

    async fn append_join_audit(&mut self, record: &JoinAuditRecord) -> Result<(), WarehouseError> {
        self.working.join_audits.push(record.clone());
        Ok(())
    }

    async fn single_audits_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Vec<SingleAuditRecord>, WarehouseError> {
        let mut rows = self
            .working
            .single_audits
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| r.downloaded_at);
        Ok(rows)
    }

    async fn join_audits_for_run(
        &mut self,
        run_id: Uuid,
    ) -> Result<Vec<JoinAuditRecord>, WarehouseError> {
        let mut rows = self
            .working
            .join_audits
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| r.audited_at);
        Ok(rows)
    }

    async fn count_failing_single(&mut self, run_id: Uuid) -> Result<u64, WarehouseError> {
        Ok(self
            .working
            .single_audits
            .iter()
            .filter(|r| r.run_id == run_id && r.verdict == Verdict::Fail)
            .count() as u64)
    }

    async fn count_failing_join(&mut self, run_id: Uuid) -> Result<u64, WarehouseError> {
        Ok(self
            .working
            .join_audits
            .iter()
            .filter(|r| r.run_id == run_id && r.verdict == Verdict::Fail)
            .count() as u64)
    }

    async fn replace_mart_table(
        &mut self,
        table: &TableRef,
        _layout: &MartLayout,
        rows: &[MartRow],
    ) -> Result<u64, WarehouseError> {
        self.working.marts.insert(table.clone(), rows.to_vec());
        Ok(rows.len() as u64)
    }

    async fn load_mart_table(
        &mut self,
        table: &TableRef,
        _layout: &MartLayout,
    ) -> Result<Option<Vec<MartRow>>, WarehouseError> {
        Ok(self.working.marts.get(table).cloned())
    }

    async fn commit(self) -> Result<(), WarehouseError> {
        *self.committed.lock().await = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), WarehouseError> {
        Ok(())
    }
}
